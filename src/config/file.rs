//! TOML configuration file loading
//!
//! Supports `~/.config/talkback/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TalkbackConfigFile {
    /// Streaming playback tuning
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Synthesis backend and retry policy
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Voice command interruption
    #[serde(default)]
    pub commands: CommandsFileConfig,

    /// Recognition backend
    #[serde(default)]
    pub recognition: RecognitionFileConfig,

    /// LLM configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Streaming playback tuning
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// Responses shorter than this many characters skip chunking
    pub short_text_threshold: Option<usize>,

    /// Number of segments synthesized ahead of playback
    pub lookahead: Option<usize>,

    /// Margin before the end of a segment at which the next one starts
    pub pause_between_sentences_ms: Option<u64>,

    /// Fraction of the remaining wait slept per timing step
    pub near_completion_factor: Option<f64>,

    /// Initial playback rate multiplier
    pub initial_rate: Option<f32>,
}

/// Synthesis backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub cache_capacity: Option<usize>,
    pub max_cacheable_chars: Option<usize>,

    /// TTS model (e.g. "tts-1")
    pub model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub voice: Option<String>,

    /// OpenAI-compatible API base URL
    pub base_url: Option<String>,
}

/// Voice command configuration
#[derive(Debug, Default, Deserialize)]
pub struct CommandsFileConfig {
    /// Listen for commands while speaking
    pub enabled: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub min_listen_ms: Option<u64>,
    pub listen_window_ms: Option<u64>,

    /// Keywords per action; an empty list disables the action
    pub stop: Option<Vec<String>>,
    pub pause: Option<Vec<String>>,
    pub resume: Option<Vec<String>>,
    pub speed_up: Option<Vec<String>>,
    pub slow_down: Option<Vec<String>>,
}

/// Recognition backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognitionFileConfig {
    /// STT model (e.g. "whisper-1")
    pub model: Option<String>,

    /// OpenAI-compatible API base URL
    pub base_url: Option<String>,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "gpt-4o-mini")
    pub model: Option<String>,

    /// OpenAI-compatible API base URL
    pub base_url: Option<String>,

    /// System prompt prepended to every exchange
    pub system_prompt: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `TalkbackConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> TalkbackConfigFile {
    config_file_path().map_or_else(TalkbackConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> TalkbackConfigFile {
    if !path.exists() {
        return TalkbackConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                TalkbackConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            TalkbackConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/talkback/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("talkback").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let fc: TalkbackConfigFile = toml::from_str(
            r#"
            [speech]
            lookahead = 5

            [commands]
            pause = ["hold on"]
            "#,
        )
        .unwrap();

        assert_eq!(fc.speech.lookahead, Some(5));
        assert_eq!(fc.speech.short_text_threshold, None);
        assert_eq!(fc.commands.pause, Some(vec!["hold on".to_string()]));
        assert!(fc.synthesis.model.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let fc = load_from(Path::new("/nonexistent/talkback/config.toml"));
        assert!(fc.speech.lookahead.is_none());
        assert!(fc.api_keys.openai.is_none());
    }
}
