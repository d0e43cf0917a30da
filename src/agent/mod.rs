//! Conversational loop: listen, respond, speak

mod responder;
mod voice_agent;

pub use responder::{ChatMessage, OpenAiResponder, Responder};
pub use voice_agent::VoiceAgent;
