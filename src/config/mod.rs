//! Configuration management for Talkback
//!
//! Values resolve as env > toml > default.

pub mod file;

use std::path::Path;
use std::time::Duration;

use file::TalkbackConfigFile;

use crate::voice::{CommandAction, CommandTable, MAX_RATE, MIN_RATE};
use crate::{Error, Result};

/// Talkback configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Streaming playback tuning
    pub speech: SpeechConfig,

    /// Synthesis backend and retry policy
    pub synthesis: SynthesisConfig,

    /// Voice command interruption
    pub commands: CommandsConfig,

    /// Recognition backend
    pub recognition: RecognitionConfig,

    /// LLM responder
    pub llm: LlmConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Streaming playback tuning
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Responses shorter than this (in chars) are spoken as a single unit
    pub short_text_threshold: usize,

    /// Max segments synthesized speculatively while the head plays
    pub lookahead: usize,

    /// Margin before the end of a segment at which the next one starts
    pub pause_between_sentences: Duration,

    /// Fraction of the remaining wait slept per timing step
    pub near_completion_factor: f64,

    /// Initial playback rate multiplier (0.5 to 2.0)
    pub initial_rate: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            short_text_threshold: 100,
            lookahead: 3,
            pause_between_sentences: Duration::from_millis(50),
            near_completion_factor: 0.92,
            initial_rate: 1.0,
        }
    }
}

/// Synthesis backend configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Timeout for a single backend attempt
    pub timeout: Duration,

    /// Retries after the first failed attempt
    pub retries: u32,

    /// Fixed delay between attempts
    pub retry_delay: Duration,

    /// Synthesis cache capacity (entries)
    pub cache_capacity: usize,

    /// Longer texts are synthesized but never cached
    pub max_cacheable_chars: usize,

    /// TTS model
    pub model: String,

    /// TTS voice identifier
    pub voice: String,

    /// OpenAI-compatible API base URL
    pub base_url: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2500),
            retries: 2,
            retry_delay: Duration::from_millis(200),
            cache_capacity: 20,
            max_cacheable_chars: 1000,
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            base_url: DEFAULT_OPENAI_URL.to_string(),
        }
    }
}

/// Voice command configuration
#[derive(Debug, Clone)]
pub struct CommandsConfig {
    /// Listen for commands while speaking
    pub enabled: bool,

    /// Interval between recognition attempts
    pub poll_interval: Duration,

    /// Minimum duration of one recognition attempt
    pub min_listen: Duration,

    /// Microphone window captured per recognition attempt
    pub listen_window: Duration,

    /// Keywords in registration order
    pub keywords: Vec<(String, CommandAction)>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        let keywords = [
            (CommandAction::Stop, &["stop", "cancel", "be quiet"][..]),
            (CommandAction::Pause, &["pause", "wait", "hold on"][..]),
            (CommandAction::Resume, &["resume", "continue", "go on"][..]),
            (CommandAction::SpeedUp, &["faster", "speed up"][..]),
            (CommandAction::SlowDown, &["slower", "slow down"][..]),
        ]
        .into_iter()
        .flat_map(|(action, words)| words.iter().map(move |w| ((*w).to_string(), action)))
        .collect();

        Self {
            enabled: true,
            poll_interval: Duration::from_millis(700),
            min_listen: Duration::from_millis(500),
            listen_window: Duration::from_millis(1500),
            keywords,
        }
    }
}

impl CommandsConfig {
    /// Build the keyword table in configured order
    #[must_use]
    pub fn table(&self) -> CommandTable {
        let mut table = CommandTable::new();
        for (keyword, action) in &self.keywords {
            table.register(keyword, *action);
        }
        table
    }
}

/// Recognition backend configuration
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// STT model
    pub model: String,

    /// OpenAI-compatible API base URL
    pub base_url: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            model: "whisper-1".to_string(),
            base_url: DEFAULT_OPENAI_URL.to_string(),
        }
    }
}

/// LLM responder configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Chat model
    pub model: String,

    /// OpenAI-compatible API base URL
    pub base_url: String,

    /// System prompt
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: DEFAULT_OPENAI_URL.to_string(),
            system_prompt: "You are a helpful voice assistant. Keep responses concise and conversational."
                .to_string(),
        }
    }
}

/// API keys for external services
#[derive(Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (TTS, Whisper and chat)
    pub openai: Option<String>,
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeys")
            .field("openai", &self.openai.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

impl Config {
    /// Load configuration from the standard config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is out of range
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Load configuration from an explicit config file path and environment
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is out of range
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::resolve(file::load_from(path), |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup over defaults
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is out of range
    pub fn resolve<F>(fc: TalkbackConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |ms: Option<u64>, fallback: Duration| ms.map_or(fallback, Duration::from_millis);

        let speech = SpeechConfig {
            short_text_threshold: fc
                .speech
                .short_text_threshold
                .unwrap_or(defaults.speech.short_text_threshold),
            lookahead: fc.speech.lookahead.unwrap_or(defaults.speech.lookahead),
            pause_between_sentences: millis(
                fc.speech.pause_between_sentences_ms,
                defaults.speech.pause_between_sentences,
            ),
            near_completion_factor: fc
                .speech
                .near_completion_factor
                .unwrap_or(defaults.speech.near_completion_factor),
            initial_rate: env("TALKBACK_RATE")
                .and_then(|s| s.parse().ok())
                .or(fc.speech.initial_rate)
                .unwrap_or(defaults.speech.initial_rate),
        };

        let synthesis = SynthesisConfig {
            timeout: millis(fc.synthesis.timeout_ms, defaults.synthesis.timeout),
            retries: fc.synthesis.retries.unwrap_or(defaults.synthesis.retries),
            retry_delay: millis(fc.synthesis.retry_delay_ms, defaults.synthesis.retry_delay),
            cache_capacity: fc
                .synthesis
                .cache_capacity
                .unwrap_or(defaults.synthesis.cache_capacity),
            max_cacheable_chars: fc
                .synthesis
                .max_cacheable_chars
                .unwrap_or(defaults.synthesis.max_cacheable_chars),
            model: env("TALKBACK_TTS_MODEL")
                .or(fc.synthesis.model)
                .unwrap_or(defaults.synthesis.model),
            voice: env("TALKBACK_TTS_VOICE")
                .or(fc.synthesis.voice)
                .unwrap_or(defaults.synthesis.voice),
            base_url: env("TALKBACK_TTS_URL")
                .or(fc.synthesis.base_url)
                .unwrap_or(defaults.synthesis.base_url),
        };

        let mut keywords = Vec::new();
        for (action, configured) in [
            (CommandAction::Stop, fc.commands.stop),
            (CommandAction::Pause, fc.commands.pause),
            (CommandAction::Resume, fc.commands.resume),
            (CommandAction::SpeedUp, fc.commands.speed_up),
            (CommandAction::SlowDown, fc.commands.slow_down),
        ] {
            match configured {
                Some(words) => keywords.extend(words.into_iter().map(|w| (w, action))),
                None => keywords.extend(
                    defaults
                        .commands
                        .keywords
                        .iter()
                        .filter(|(_, a)| *a == action)
                        .cloned(),
                ),
            }
        }

        let commands = CommandsConfig {
            enabled: env("TALKBACK_COMMANDS")
                .map(|s| s != "0" && !s.eq_ignore_ascii_case("false"))
                .or(fc.commands.enabled)
                .unwrap_or(defaults.commands.enabled),
            poll_interval: millis(fc.commands.poll_interval_ms, defaults.commands.poll_interval),
            min_listen: millis(fc.commands.min_listen_ms, defaults.commands.min_listen),
            listen_window: millis(fc.commands.listen_window_ms, defaults.commands.listen_window),
            keywords,
        };

        let recognition = RecognitionConfig {
            model: env("TALKBACK_STT_MODEL")
                .or(fc.recognition.model)
                .unwrap_or(defaults.recognition.model),
            base_url: env("TALKBACK_STT_URL")
                .or(fc.recognition.base_url)
                .unwrap_or(defaults.recognition.base_url),
        };

        let llm = LlmConfig {
            model: env("TALKBACK_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or(defaults.llm.model),
            base_url: env("TALKBACK_LLM_URL")
                .or(fc.llm.base_url)
                .unwrap_or(defaults.llm.base_url),
            system_prompt: fc.llm.system_prompt.unwrap_or(defaults.llm.system_prompt),
        };

        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
        };

        let config = Self {
            speech,
            synthesis,
            commands,
            recognition,
            llm,
            api_keys,
        };
        config.validate()?;

        tracing::debug!(
            lookahead = config.speech.lookahead,
            commands = config.commands.keywords.len(),
            "configuration resolved"
        );

        Ok(config)
    }

    /// Check resolved values are within supported ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending value
    pub fn validate(&self) -> Result<()> {
        if !(MIN_RATE..=MAX_RATE).contains(&self.speech.initial_rate) {
            return Err(Error::Config(format!(
                "speech.initial_rate must be between {MIN_RATE} and {MAX_RATE}, got {}",
                self.speech.initial_rate
            )));
        }

        if !(self.speech.near_completion_factor > 0.0 && self.speech.near_completion_factor <= 1.0) {
            return Err(Error::Config(format!(
                "speech.near_completion_factor must be in (0, 1], got {}",
                self.speech.near_completion_factor
            )));
        }

        if self.synthesis.cache_capacity == 0 {
            return Err(Error::Config(
                "synthesis.cache_capacity must be at least 1".to_string(),
            ));
        }

        if self.synthesis.timeout.is_zero() {
            return Err(Error::Config(
                "synthesis.timeout_ms must be positive".to_string(),
            ));
        }

        if self.commands.poll_interval.is_zero() {
            return Err(Error::Config(
                "commands.poll_interval_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
