//! Language-model responders

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{ApiKeys, LlmConfig};
use crate::{Error, Result};

/// Turns kept in the rolling conversation history
const MAX_HISTORY: usize = 20;

/// Produces a reply for a user utterance
#[async_trait]
pub trait Responder: Send + Sync {
    /// Reply to `text`
    ///
    /// # Errors
    ///
    /// Returns error if the model cannot be reached or returns nothing
    async fn chat(&self, text: &str) -> Result<String>;
}

/// One message in a chat-completions conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`
    pub role: String,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// `OpenAI`-compatible chat-completions responder with rolling history
pub struct OpenAiResponder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    system_prompt: String,
    history: Mutex<Vec<ChatMessage>>,
}

impl OpenAiResponder {
    /// Create a responder from resolved configuration
    ///
    /// # Errors
    ///
    /// Returns error if no `OpenAI` API key is configured
    pub fn from_config(config: &LlmConfig, keys: &ApiKeys) -> Result<Self> {
        let api_key = keys
            .openai
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("OPENAI_API_KEY not set".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            system_prompt: config.system_prompt.clone(),
            history: Mutex::new(Vec::new()),
        })
    }

    /// Forget the conversation so far
    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
    }

    fn request_messages(&self, history: &[ChatMessage], text: &str) -> Vec<ChatMessage> {
        std::iter::once(ChatMessage::new("system", &self.system_prompt))
            .chain(history.iter().cloned())
            .chain(std::iter::once(ChatMessage::new("user", text)))
            .collect()
    }
}

#[async_trait]
impl Responder for OpenAiResponder {
    async fn chat(&self, text: &str) -> Result<String> {
        let messages = {
            let history = self.history.lock().await;
            self.request_messages(&history, text)
        };

        let request = ChatRequest {
            model: &self.model,
            messages,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!("chat completion error {status}: {body}")));
        }

        let response: ChatResponse = response.json().await?;
        let reply = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Agent("empty completion".to_string()))?;

        let mut history = self.history.lock().await;
        history.push(ChatMessage::new("user", text));
        history.push(ChatMessage::new("assistant", &reply));
        let excess = history.len().saturating_sub(MAX_HISTORY);
        history.drain(..excess);

        tracing::debug!(reply_len = reply.len(), "responder replied");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder() -> OpenAiResponder {
        let keys = ApiKeys {
            openai: Some("sk-test".to_string()),
        };
        OpenAiResponder::from_config(&LlmConfig::default(), &keys).unwrap()
    }

    #[test]
    fn requires_api_key() {
        assert!(OpenAiResponder::from_config(&LlmConfig::default(), &ApiKeys::default()).is_err());
    }

    #[test]
    fn request_wraps_history_with_system_and_user() {
        let responder = responder();
        let history = vec![
            ChatMessage::new("user", "hi"),
            ChatMessage::new("assistant", "hello"),
        ];

        let messages = responder.request_messages(&history, "how are you");
        let roles: Vec<_> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(messages[3].content, "how are you");
    }

    #[test]
    fn parses_completion_response() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":" Sure. "}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content, " Sure. ");
    }
}
