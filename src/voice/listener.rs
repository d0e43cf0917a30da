//! Voice command listening during playback
//!
//! Polls the recognizer on a fixed interval while a session is speaking.
//! At most one recognition attempt is in flight: a tick that lands while the
//! previous attempt is still running is skipped, never queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{RecognizerGuard, SpeechObserver, SpeechPipeline};
use crate::Result;

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerState {
    /// Not polling
    #[default]
    Stopped,
    /// Polling, no attempt in flight
    Listening,
    /// A recognition attempt is in flight
    Recognizing,
}

/// `None` when the recognizer was already busy
type Attempt = JoinHandle<Option<Result<Option<String>>>>;

/// Polls for voice commands and dispatches them into a pipeline
pub struct CommandListener {
    recognizer: RecognizerGuard,
    pipeline: SpeechPipeline,
    poll_interval: Duration,
    observer: Arc<dyn SpeechObserver>,
    state: watch::Sender<ListenerState>,
}

impl CommandListener {
    /// Create a listener in the `Stopped` state
    #[must_use]
    pub fn new(
        recognizer: RecognizerGuard,
        pipeline: SpeechPipeline,
        poll_interval: Duration,
        observer: Arc<dyn SpeechObserver>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Stopped);
        Self {
            recognizer,
            pipeline,
            poll_interval,
            observer,
            state,
        }
    }

    /// Watch lifecycle transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Run on a background task until `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    /// Poll until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        self.state.send_replace(ListenerState::Listening);
        self.observer.on_command_listening_started();
        tracing::debug!(poll_ms = self.poll_interval.as_millis(), "command listener started");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut attempt: Option<Attempt> = None;

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {
                    if attempt.is_some() || self.recognizer.is_busy() {
                        tracing::trace!("recognition in flight, skipping tick");
                        continue;
                    }
                    let recognizer = self.recognizer.clone();
                    attempt = Some(tokio::spawn(async move { recognizer.try_recognize().await }));
                    self.state.send_replace(ListenerState::Recognizing);
                }
                joined = join_attempt(&mut attempt) => {
                    attempt = None;
                    self.state.send_replace(ListenerState::Listening);
                    match joined {
                        Ok(Some(Ok(Some(text)))) => self.dispatch(&text),
                        Ok(Some(Ok(None))) => {}
                        Ok(None) => tracing::trace!("recognizer taken elsewhere, skipped attempt"),
                        Ok(Some(Err(e))) => tracing::warn!(error = %e, "recognition failed"),
                        Err(e) => tracing::warn!(error = %e, "recognition task failed"),
                    }
                }
            }
        }

        if let Some(task) = attempt.take() {
            task.abort();
            let _ = task.await;
        }

        self.state.send_replace(ListenerState::Stopped);
        self.observer.on_command_listening_ended();
        tracing::debug!("command listener stopped");
    }

    fn dispatch(&self, text: &str) {
        match self.pipeline.match_command(text) {
            Some((keyword, action)) => {
                tracing::info!(%keyword, %action, "voice command");
                self.pipeline.apply(action);
            }
            None => tracing::debug!(utterance = %text, "no command matched"),
        }
    }
}

/// Await the in-flight attempt, or never resolve if there is none
async fn join_attempt(
    attempt: &mut Option<Attempt>,
) -> std::result::Result<Option<Result<Option<String>>>, tokio::task::JoinError> {
    match attempt {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::SpeechConfig;
    use crate::voice::{
        AudioBuffer, AudioOutput, NoopObserver, PlaybackSequencer, PlaybackState, Recognizer,
        SegmentSynthesizer, SimulatedOutput, SpeechBackend, SynthesisCache, SynthesisPolicy,
    };

    struct SilenceBackend;

    #[async_trait]
    impl SpeechBackend for SilenceBackend {
        async fn synthesize(&self, _text: &str) -> Result<AudioBuffer> {
            Ok(AudioBuffer::silence(Duration::from_secs(1)))
        }
    }

    /// Returns scripted utterances, one per attempt
    struct ScriptedRecognizer {
        script: Mutex<Vec<Option<String>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Recognizer for ScriptedRecognizer {
        async fn recognize_once(&self) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut script = self.script.lock().unwrap();
            Ok(if script.is_empty() { None } else { script.remove(0) })
        }
    }

    fn fixture(
        script: Vec<Option<&str>>,
        delay: Duration,
    ) -> (
        CommandListener,
        SpeechPipeline,
        Arc<ScriptedRecognizer>,
        RecognizerGuard,
    ) {
        let observer: Arc<dyn SpeechObserver> = Arc::new(NoopObserver);
        let synthesizer = SegmentSynthesizer::new(
            Arc::new(SilenceBackend),
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
        pipeline.register_command("pause", crate::voice::CommandAction::Pause);
        pipeline.register_command("faster", crate::voice::CommandAction::SpeedUp);

        let recognizer = Arc::new(ScriptedRecognizer {
            script: Mutex::new(script.into_iter().map(|s| s.map(String::from)).collect()),
            delay,
            calls: AtomicUsize::new(0),
        });
        let guard = RecognizerGuard::new(
            Arc::clone(&recognizer) as Arc<dyn Recognizer>,
            Duration::ZERO,
        );
        let listener = CommandListener::new(
            guard.clone(),
            pipeline.clone(),
            Duration::from_millis(700),
            observer,
        );
        (listener, pipeline, recognizer, guard)
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_matched_commands() {
        let (listener, pipeline, _, _) = fixture(
            vec![Some("a bit faster please"), Some("PAUSE")],
            Duration::from_millis(100),
        );
        let _handle = pipeline
            .sequencer()
            .play(0, AudioBuffer::silence(Duration::from_secs(10)))
            .unwrap();

        let token = CancellationToken::new();
        let task = listener.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!((pipeline.sequencer().rate() - 1.25).abs() < f32::EPSILON);
        assert_eq!(pipeline.sequencer().state(), PlaybackState::Playing(0));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pipeline.sequencer().state(), PlaybackState::Paused(0));

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn skips_ticks_while_recognizing() {
        let (listener, _, recognizer, _) = fixture(Vec::new(), Duration::from_millis(2000));
        let mut state = listener.subscribe();

        let token = CancellationToken::new();
        let task = listener.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(2500)).await;

        // Ticks at 0.7s and 1.4s landed on the in-flight attempt
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);

        token.cancel();
        task.await.unwrap();
        assert_eq!(*state.borrow_and_update(), ListenerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_queue_behind_another_recognition() {
        let (listener, _, recognizer, guard) = fixture(Vec::new(), Duration::from_millis(2000));
        let mut state = listener.subscribe();

        // Conversational turn holding the recognizer
        let turn = tokio::spawn(async move { guard.recognize().await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let token = CancellationToken::new();
        let task = listener.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow_and_update(), ListenerState::Listening);

        token.cancel();
        task.await.unwrap();
        assert!(turn.await.unwrap().unwrap().is_none());
    }
}
