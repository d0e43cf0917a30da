//! Error types for Talkback

use thiserror::Error;

/// Result type alias for Talkback operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Talkback
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Responder (LLM) error
    #[error("agent error: {0}")]
    Agent(String),

    /// Output device missing or misconfigured
    #[error("output device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Empty or otherwise unusable input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A segment is already playing
    #[error("playback busy: segment {0} is still playing")]
    PlaybackBusy(u32),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Collapse this error into the coarse taxonomy reported to callers
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnavailable(_) | Self::Audio(_) => ErrorKind::DeviceUnavailable,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Stt(_) => ErrorKind::RecognitionFailed,
            _ => ErrorKind::SynthesisFailed,
        }
    }
}

/// Failure categories surfaced by the speech pipeline
///
/// Backend and timeout errors are converted into one of these at component
/// boundaries; nothing finer-grained escapes `SpeechPipeline::speak`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Backend exhausted retries or timed out
    SynthesisFailed,
    /// Recognition attempt failed (logged, never fatal)
    RecognitionFailed,
    /// Output device missing or misconfigured
    DeviceUnavailable,
    /// Empty text
    InvalidInput,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SynthesisFailed => "synthesis failed",
            Self::RecognitionFailed => "recognition failed",
            Self::DeviceUnavailable => "device unavailable",
            Self::InvalidInput => "invalid input",
        };
        f.write_str(s)
    }
}
