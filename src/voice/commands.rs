//! Voice command vocabulary
//!
//! Commands are matched against recognized utterances while speech is
//! playing. Keys are stored lowercase and kept in registration order, which
//! decides ties when several keywords occur in the same utterance.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// What a recognized command does to playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    /// Cancel the current speech
    Stop,
    /// Pause playback
    Pause,
    /// Resume paused playback
    Resume,
    /// Raise the speech rate by one step
    SpeedUp,
    /// Lower the speech rate by one step
    SlowDown,
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::SpeedUp => "speed_up",
            Self::SlowDown => "slow_down",
        })
    }
}

impl FromStr for CommandAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "stop" => Ok(Self::Stop),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "speed_up" | "faster" => Ok(Self::SpeedUp),
            "slow_down" | "slower" => Ok(Self::SlowDown),
            other => Err(Error::InvalidInput(format!("unknown command action: {other}"))),
        }
    }
}

/// Ordered keyword to action table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTable {
    entries: Vec<(String, CommandAction)>,
}

impl CommandTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `keyword` for `action`
    ///
    /// Keywords are trimmed and lowercased. Re-registering an existing
    /// keyword replaces its action but keeps its position. Blank keywords
    /// are ignored.
    pub fn register(&mut self, keyword: &str, action: CommandAction) {
        let key = normalize_key(keyword);
        if key.is_empty() {
            tracing::warn!("ignoring blank command keyword");
            return;
        }

        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = action;
        } else {
            self.entries.push((key, action));
        }
    }

    /// Remove `keyword`, returning its action if it was registered
    pub fn unregister(&mut self, keyword: &str) -> Option<CommandAction> {
        let key = normalize_key(keyword);
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Match an utterance against the table
    ///
    /// An exact (trimmed, case-insensitive) match wins. Otherwise the first
    /// keyword in registration order contained in the utterance wins.
    #[must_use]
    pub fn match_command(&self, utterance: &str) -> Option<(&str, CommandAction)> {
        let text = normalize_key(utterance);
        if text.is_empty() {
            return None;
        }

        self.entries
            .iter()
            .find(|(k, _)| *k == text)
            .or_else(|| self.entries.iter().find(|(k, _)| text.contains(k.as_str())))
            .map(|(k, action)| (k.as_str(), *action))
    }

    /// Number of registered keywords
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no keywords
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keywords and actions in registration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, CommandAction)> {
        self.entries.iter().map(|(k, a)| (k.as_str(), *a))
    }
}

fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}
