//! Speech-to-text (STT) recognition
//!
//! A [`Recognizer`] performs one timeboxed recognition attempt per call.
//! Callers go through [`RecognizerGuard`], which serializes attempts and
//! enforces a minimum listen duration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{AudioCapture, rms};
use crate::config::{ApiKeys, RecognitionConfig};
use crate::{Error, Result};

/// Captured windows quieter than this are treated as silence
const SILENCE_RMS: f32 = 0.01;

/// External speech recognition backend
///
/// The backend must never run two attempts at once; wrap it in a
/// [`RecognizerGuard`] rather than calling it directly.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Prepare the backend (open devices, warm connections)
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be prepared
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Drop any state carried between attempts
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be reset
    async fn reset(&self) -> Result<()> {
        Ok(())
    }

    /// Single recognition attempt
    ///
    /// Returns `None` on silence or when nothing intelligible was heard.
    ///
    /// # Errors
    ///
    /// Returns error if capture or transcription fails
    async fn recognize_once(&self) -> Result<Option<String>>;
}

/// Single-permit guard around a shared [`Recognizer`]
///
/// The permit is released on every exit path, including when the awaiting
/// future is dropped by cancellation or a timeout.
#[derive(Clone)]
pub struct RecognizerGuard {
    recognizer: Arc<dyn Recognizer>,
    permit: Arc<Semaphore>,
    min_listen: Duration,
}

impl RecognizerGuard {
    /// Wrap `recognizer`; every attempt lasts at least `min_listen`
    #[must_use]
    pub fn new(recognizer: Arc<dyn Recognizer>, min_listen: Duration) -> Self {
        Self {
            recognizer,
            permit: Arc::new(Semaphore::new(1)),
            min_listen,
        }
    }

    /// Whether an attempt is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }

    /// Recognize once, waiting for any in-flight attempt to finish first
    ///
    /// # Errors
    ///
    /// Returns error if the backend attempt fails
    pub async fn recognize(&self) -> Result<Option<String>> {
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| Error::Stt("recognizer closed".to_string()))?;
        self.attempt().await
    }

    /// Recognize once unless an attempt is already in flight
    ///
    /// Returns `None` when busy.
    pub async fn try_recognize(&self) -> Option<Result<Option<String>>> {
        let Ok(_permit) = self.permit.try_acquire() else {
            tracing::trace!("recognizer busy, skipping attempt");
            return None;
        };
        Some(self.attempt().await)
    }

    /// Run the backend's `init` under the permit
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails to initialize
    pub async fn init(&self) -> Result<()> {
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| Error::Stt("recognizer closed".to_string()))?;
        self.recognizer.init().await
    }

    /// Run the backend's `reset` under the permit
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails to reset
    pub async fn reset(&self) -> Result<()> {
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| Error::Stt("recognizer closed".to_string()))?;
        self.recognizer.reset().await
    }

    async fn attempt(&self) -> Result<Option<String>> {
        let (result, ()) = tokio::join!(
            self.recognizer.recognize_once(),
            tokio::time::sleep(self.min_listen)
        );
        result.map(|text| {
            text.map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        })
    }
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Records a microphone window and transcribes it with Whisper
pub struct WhisperRecognizer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    window: Duration,
}

impl WhisperRecognizer {
    /// Create a recognizer capturing `window` of audio per attempt
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, model: String, base_url: String, window: Duration) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            window,
        })
    }

    /// Create a recognizer from resolved configuration
    ///
    /// # Errors
    ///
    /// Returns error if no `OpenAI` API key is configured
    pub fn from_config(config: &RecognitionConfig, keys: &ApiKeys, window: Duration) -> Result<Self> {
        let api_key = keys
            .openai
            .clone()
            .ok_or_else(|| Error::Config("OPENAI_API_KEY not set".to_string()))?;
        Self::new(api_key, config.model.clone(), config.base_url.clone(), window)
    }

    /// Transcribe WAV bytes
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    pub async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            e
        })?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

#[async_trait]
impl Recognizer for WhisperRecognizer {
    async fn init(&self) -> Result<()> {
        // Opening the device once surfaces permission problems early
        tokio::task::spawn_blocking(|| AudioCapture::new().map(drop))
            .await
            .map_err(|e| Error::Audio(format!("capture task failed: {e}")))?
    }

    async fn recognize_once(&self) -> Result<Option<String>> {
        let window = self.window;
        let audio = tokio::task::spawn_blocking(move || AudioCapture::record(window))
            .await
            .map_err(|e| Error::Audio(format!("capture task failed: {e}")))??;

        let level = rms(audio.samples());
        if level < SILENCE_RMS {
            tracing::trace!(level, "silence, skipping transcription");
            return Ok(None);
        }

        let wav = audio.to_wav()?;
        let text = self.transcribe(&wav).await?;
        Ok(Some(text))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct SlowRecognizer {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Recognizer for SlowRecognizer {
        async fn recognize_once(&self) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Some("  Stop  ".to_string()))
        }
    }

    fn guard(delay: Duration, min_listen: Duration) -> (RecognizerGuard, Arc<SlowRecognizer>) {
        let recognizer = Arc::new(SlowRecognizer {
            delay,
            calls: AtomicUsize::new(0),
        });
        (
            RecognizerGuard::new(Arc::clone(&recognizer) as Arc<dyn Recognizer>, min_listen),
            recognizer,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_respects_min_listen_floor() {
        let (guard, _) = guard(Duration::from_millis(10), Duration::from_millis(500));
        let started = tokio::time::Instant::now();

        let text = guard.recognize().await.unwrap();
        assert_eq!(text.as_deref(), Some("Stop"));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn try_recognize_skips_while_busy() {
        let (guard, recognizer) = guard(Duration::from_secs(1), Duration::ZERO);

        let first = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.recognize().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(guard.is_busy());
        assert!(guard.try_recognize().await.is_none());

        first.await.unwrap().unwrap();
        assert!(!guard.is_busy());
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permit_released_on_cancellation() {
        let (guard, _) = guard(Duration::from_secs(10), Duration::ZERO);

        let attempt = tokio::time::timeout(Duration::from_millis(100), guard.recognize()).await;
        assert!(attempt.is_err());
        assert!(!guard.is_busy());
    }

    #[test]
    fn whisper_requires_key() {
        let result = WhisperRecognizer::new(
            String::new(),
            "whisper-1".to_string(),
            "https://api.openai.com/v1".to_string(),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
