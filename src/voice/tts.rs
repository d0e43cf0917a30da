//! Text-to-speech (TTS) backends

use async_trait::async_trait;

use super::{AudioBuffer, SpeechBackend};
use crate::config::{ApiKeys, SynthesisConfig};
use crate::{Error, Result};

/// `OpenAI`-compatible speech endpoint returning MP3
///
/// Always requests 1.0x speech: the rate multiplier is applied at playback
/// so cached audio stays valid across rate changes.
pub struct OpenAiSpeech {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    model: String,
    base_url: String,
}

impl OpenAiSpeech {
    /// Create a backend for the given voice and model
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, voice: String, model: String, base_url: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create a backend from resolved configuration
    ///
    /// # Errors
    ///
    /// Returns error if no `OpenAI` API key is configured
    pub fn from_config(config: &SynthesisConfig, keys: &ApiKeys) -> Result<Self> {
        let api_key = keys
            .openai
            .clone()
            .ok_or_else(|| Error::Config("OPENAI_API_KEY not set".to_string()))?;

        Self::new(
            api_key,
            config.voice.clone(),
            config.model.clone(),
            config.base_url.clone(),
        )
    }

    /// Request MP3 bytes for `text`
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the API rejects it
    pub async fn synthesize_mp3(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: "mp3",
        };

        tracing::debug!(chars = text.len(), voice = %self.voice, "requesting speech");

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl SpeechBackend for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> Result<AudioBuffer> {
        let mp3 = self.synthesize_mp3(text).await?;
        // Decoding and resampling are CPU-bound
        tokio::task::spawn_blocking(move || AudioBuffer::from_mp3(&mp3))
            .await
            .map_err(|e| Error::Tts(format!("decode task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_key() {
        let result = OpenAiSpeech::new(
            String::new(),
            "alloy".to_string(),
            "tts-1".to_string(),
            "https://api.openai.com/v1".to_string(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn from_config_requires_key() {
        let config = SynthesisConfig::default();
        assert!(OpenAiSpeech::from_config(&config, &ApiKeys::default()).is_err());

        let keys = ApiKeys {
            openai: Some("sk-test".to_string()),
        };
        let backend = OpenAiSpeech::from_config(&config, &keys).unwrap();
        assert_eq!(backend.base_url, "https://api.openai.com/v1");
    }
}
