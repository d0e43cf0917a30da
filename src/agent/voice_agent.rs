//! Listen → respond → speak loop

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::Responder;
use crate::voice::{RecognizerGuard, SpeechObserver, SpeechPipeline, SpeechReport};
use crate::{Error, Result};

/// Spoken when the responder fails
const FALLBACK_REPLY: &str = "Sorry, something went wrong.";

/// Runs conversational turns over a recognizer, responder and pipeline
pub struct VoiceAgent {
    recognizer: RecognizerGuard,
    responder: Arc<dyn Responder>,
    pipeline: SpeechPipeline,
    observer: Arc<dyn SpeechObserver>,
}

impl VoiceAgent {
    /// Create an agent
    #[must_use]
    pub fn new(
        recognizer: RecognizerGuard,
        responder: Arc<dyn Responder>,
        pipeline: SpeechPipeline,
        observer: Arc<dyn SpeechObserver>,
    ) -> Self {
        Self {
            recognizer,
            responder,
            pipeline,
            observer,
        }
    }

    /// The speech pipeline
    #[must_use]
    pub fn pipeline(&self) -> &SpeechPipeline {
        &self.pipeline
    }

    /// Prepare the recognizer so the first turn starts without delay
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer cannot be initialized
    pub async fn prewarm(&self) -> Result<()> {
        self.recognizer.init().await?;
        self.recognizer.reset().await?;
        tracing::debug!("recognizer warmed up");
        Ok(())
    }

    /// Run one turn
    ///
    /// Returns `None` when nothing was heard.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if speech cannot be played; recognition
    /// and responder failures are logged and end the turn
    pub async fn turn(&self) -> Result<Option<SpeechReport>> {
        self.observer.on_listening_started();
        let heard = self.recognizer.recognize().await;
        self.observer.on_listening_ended();

        let text = match heard {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, "recognition failed");
                return Ok(None);
            }
        };
        tracing::info!(utterance = %text, "heard");

        let reply = match self.responder.chat(&text).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "responder failed");
                FALLBACK_REPLY.to_string()
            }
        };
        self.observer.on_thinking_ended();

        let report = self.pipeline.speak(&reply).await?;

        if let Err(e) = self.recognizer.reset().await {
            tracing::warn!(error = %e, "recognizer reset failed");
        }
        Ok(Some(report))
    }

    /// Run turns until `token` is cancelled
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer cannot be prepared or the output
    /// device disappears
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        self.prewarm().await?;
        tracing::info!("voice agent ready");

        loop {
            let turn = tokio::select! {
                () = token.cancelled() => break,
                turn = self.turn() => turn,
            };

            match turn {
                Ok(Some(report)) => {
                    tracing::debug!(status = ?report.status, "turn complete");
                }
                Ok(None) => {}
                Err(e @ Error::DeviceUnavailable(_)) => return Err(e),
                Err(e) => tracing::error!(error = %e, "turn failed"),
            }
        }

        self.pipeline.stop();
        tracing::info!("voice agent stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::SpeechConfig;
    use crate::voice::{
        AudioBuffer, AudioOutput, NoopObserver, PlaybackSequencer, Recognizer,
        SegmentSynthesizer, SimulatedOutput, SpeechBackend, SpeechStatus, SynthesisCache,
        SynthesisPolicy,
    };

    struct QuarterSecond;

    #[async_trait]
    impl SpeechBackend for QuarterSecond {
        async fn synthesize(&self, _text: &str) -> Result<AudioBuffer> {
            Ok(AudioBuffer::silence(Duration::from_millis(250)))
        }
    }

    struct Echo {
        fail: bool,
        heard: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Responder for Echo {
        async fn chat(&self, text: &str) -> Result<String> {
            self.heard.lock().unwrap().push(text.to_string());
            if self.fail {
                return Err(Error::Agent("offline".to_string()));
            }
            Ok(format!("You said {text}."))
        }
    }

    struct Lifecycle {
        inits: AtomicUsize,
        resets: AtomicUsize,
        utterance: Option<&'static str>,
    }

    #[async_trait]
    impl Recognizer for Lifecycle {
        async fn init(&self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reset(&self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn recognize_once(&self) -> Result<Option<String>> {
            Ok(self.utterance.map(String::from))
        }
    }

    fn agent(utterance: Option<&'static str>, fail: bool) -> (VoiceAgent, Arc<Lifecycle>, Arc<Echo>) {
        let observer: Arc<dyn SpeechObserver> = Arc::new(NoopObserver);
        let synthesizer = SegmentSynthesizer::new(
            Arc::new(QuarterSecond),
            Arc::new(SynthesisCache::default()),
            SynthesisPolicy::default(),
            Arc::clone(&observer),
        );
        let output: Arc<dyn AudioOutput> = Arc::new(SimulatedOutput::new());
        let pipeline = SpeechPipeline::new(
            synthesizer,
            PlaybackSequencer::new(output, 1.0),
            SpeechConfig::default(),
            Arc::clone(&observer),
        );

        let recognizer = Arc::new(Lifecycle {
            inits: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            utterance,
        });
        let responder = Arc::new(Echo {
            fail,
            heard: Mutex::new(Vec::new()),
        });
        let agent = VoiceAgent::new(
            RecognizerGuard::new(Arc::clone(&recognizer) as Arc<dyn Recognizer>, Duration::ZERO),
            Arc::clone(&responder) as Arc<dyn Responder>,
            pipeline,
            observer,
        );
        (agent, recognizer, responder)
    }

    #[tokio::test(start_paused = true)]
    async fn prewarm_calls_init_then_reset() {
        let (agent, recognizer, _) = agent(None, false);
        agent.prewarm().await.unwrap();
        assert_eq!(recognizer.inits.load(Ordering::SeqCst), 1);
        assert_eq!(recognizer.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_speaks_reply() {
        let (agent, recognizer, responder) = agent(Some("hello"), false);

        let report = agent.turn().await.unwrap().unwrap();
        assert_eq!(report.status, SpeechStatus::Completed);
        assert_eq!(*responder.heard.lock().unwrap(), ["hello"]);
        assert_eq!(recognizer.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_skips_turn() {
        let (agent, _, responder) = agent(None, false);
        assert!(agent.turn().await.unwrap().is_none());
        assert!(responder.heard.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn responder_failure_speaks_fallback() {
        let (agent, _, _) = agent(Some("hello"), true);
        let report = agent.turn().await.unwrap().unwrap();
        assert_eq!(report.played, vec![0]);
    }
}
