//! Talkback - streaming speech front-end for voice assistants
//!
//! Couples a speech recognizer, a language-model responder and a speech
//! synthesizer into a conversational loop. Replies are spoken segment by
//! segment so audio starts before the whole reply is synthesized, and voice
//! commands can stop, pause, resume, or re-pace playback while it runs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    VoiceAgent                        │
//! │   Recognizer  →  Responder  →  SpeechPipeline       │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 SpeechPipeline                       │
//! │   Chunker │ Synthesizer + Cache │ CommandListener   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               PlaybackSequencer                      │
//! │   AudioOutput (cpal or simulated)                   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod voice;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use voice::{SpeechPipeline, SpeechReport, SpeechStatus};
