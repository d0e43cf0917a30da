//! Streaming speech pipeline
//!
//! Turns a response into sentence segments and plays them in order while
//! later segments are still being synthesized. The head segment is
//! synthesized first so audio starts as early as possible; a bounded window
//! of following segments is synthesized speculatively while it plays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    AudioBuffer, CommandAction, CommandListener, CommandTable, NearCompletion, PlaybackEnd,
    PlaybackHandle, PlaybackSequencer, RATE_STEP, RecognizerGuard, Segment, SegmentSynthesizer,
    SpeechObserver, SynthesisResult, chunker,
};
use crate::config::{CommandsConfig, SpeechConfig};
use crate::error::ErrorKind;
use crate::{Error, Result};

/// Final status of one `speak` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechStatus {
    /// Every segment played
    Completed,
    /// Some segments were dropped after synthesis failures
    PartialFailure,
    /// Nothing could be played
    Failed,
    /// Stopped by a command, `stop()`, or a newer `speak`
    Cancelled,
}

/// Outcome of one `speak` call, reported to the caller and the observer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpeechReport {
    /// Final status
    pub status: SpeechStatus,
    /// Number of segments the text was split into
    pub segments: usize,
    /// Indices that started playing, in order
    pub played: Vec<u32>,
    /// Indices skipped because synthesis failed
    pub dropped: Vec<u32>,
}

impl SpeechReport {
    fn empty(status: SpeechStatus) -> Self {
        Self {
            status,
            segments: 0,
            played: Vec::new(),
            dropped: Vec::new(),
        }
    }
}

/// Recognition settings for interruption during playback
#[derive(Clone)]
struct ListenerSettings {
    recognizer: RecognizerGuard,
    poll_interval: Duration,
}

struct PipelineInner {
    synthesizer: SegmentSynthesizer,
    sequencer: PlaybackSequencer,
    config: SpeechConfig,
    observer: Arc<dyn SpeechObserver>,
    commands: Mutex<CommandTable>,
    listener: Option<ListenerSettings>,
    /// Held for the lifetime of a session
    session: tokio::sync::Mutex<()>,
    /// Token of the most recent session
    cancel: Mutex<CancellationToken>,
    speaking: AtomicBool,
}

/// Streams synthesized speech to the playback sequencer
///
/// Cloning is cheap and shares the same session.
#[derive(Clone)]
pub struct SpeechPipeline {
    inner: Arc<PipelineInner>,
}

impl SpeechPipeline {
    /// Create a pipeline without voice command interruption
    #[must_use]
    pub fn new(
        synthesizer: SegmentSynthesizer,
        sequencer: PlaybackSequencer,
        config: SpeechConfig,
        observer: Arc<dyn SpeechObserver>,
    ) -> Self {
        Self::build(
            synthesizer,
            sequencer,
            config,
            observer,
            CommandTable::new(),
            None,
        )
    }

    /// Create a pipeline that listens for voice commands while speaking
    ///
    /// Listening is skipped when `commands.enabled` is false, but the
    /// keyword table is still built so commands can be matched manually.
    #[must_use]
    pub fn with_commands(
        synthesizer: SegmentSynthesizer,
        sequencer: PlaybackSequencer,
        config: SpeechConfig,
        observer: Arc<dyn SpeechObserver>,
        recognizer: RecognizerGuard,
        commands: &CommandsConfig,
    ) -> Self {
        let listener = commands.enabled.then(|| ListenerSettings {
            recognizer,
            poll_interval: commands.poll_interval,
        });
        Self::build(
            synthesizer,
            sequencer,
            config,
            observer,
            commands.table(),
            listener,
        )
    }

    fn build(
        synthesizer: SegmentSynthesizer,
        sequencer: PlaybackSequencer,
        config: SpeechConfig,
        observer: Arc<dyn SpeechObserver>,
        commands: CommandTable,
        listener: Option<ListenerSettings>,
    ) -> Self {
        let keywords: Vec<_> = commands.iter().map(|(keyword, _)| keyword).collect();
        tracing::debug!(
            ?keywords,
            listening = listener.is_some(),
            "voice commands registered"
        );
        Self {
            inner: Arc::new(PipelineInner {
                synthesizer,
                sequencer,
                config,
                observer,
                commands: Mutex::new(commands),
                listener,
                session: tokio::sync::Mutex::new(()),
                cancel: Mutex::new(CancellationToken::new()),
                speaking: AtomicBool::new(false),
            }),
        }
    }

    /// The playback sequencer
    #[must_use]
    pub fn sequencer(&self) -> &PlaybackSequencer {
        &self.inner.sequencer
    }

    /// The segment synthesizer
    #[must_use]
    pub fn synthesizer(&self) -> &SegmentSynthesizer {
        &self.inner.synthesizer
    }

    /// Whether a session is currently producing audio
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.inner.speaking.load(Ordering::SeqCst)
    }

    /// Speak `text`, returning once playback has finished or been cancelled
    ///
    /// Cancels any session already in flight and waits for its teardown
    /// before producing audio. The observer's `on_speech_finished` fires
    /// exactly once per call.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the output device is missing. Every
    /// other failure is reported through [`SpeechReport`].
    pub async fn speak(&self, text: &str) -> Result<SpeechReport> {
        let inner = &self.inner;

        if text.trim().is_empty() {
            tracing::debug!("nothing to speak");
            return Ok(self.finish(SpeechReport::empty(SpeechStatus::Completed)));
        }

        let token = CancellationToken::new();
        match inner.cancel.lock() {
            Ok(mut current) => {
                current.cancel();
                *current = token.clone();
            }
            Err(_) => tracing::error!("session token poisoned"),
        }

        // Reports as cancelled if this future is dropped before `close`
        let mut session = Session::new(self.clone(), token);

        let _lock = inner.session.lock().await;
        if session.token.is_cancelled() {
            tracing::debug!("superseded before starting");
            return Ok(session.close(SpeechReport::empty(SpeechStatus::Cancelled)));
        }

        if !inner.sequencer.is_available() {
            tracing::error!("output device unavailable");
            session.close(SpeechReport::empty(SpeechStatus::Failed));
            return Err(Error::DeviceUnavailable(
                "no usable output device".to_string(),
            ));
        }

        session.start();
        let outcome = session.run(text.trim()).await;
        let report = session.teardown().await;

        match outcome {
            Ok(()) => Ok(session.close(report)),
            Err(e) => {
                session.close(SpeechReport {
                    status: SpeechStatus::Failed,
                    ..report
                });
                Err(e)
            }
        }
    }

    fn finish(&self, report: SpeechReport) -> SpeechReport {
        tracing::info!(
            status = ?report.status,
            segments = report.segments,
            played = report.played.len(),
            dropped = report.dropped.len(),
            "speech finished"
        );
        self.inner.observer.on_speech_finished(&report);
        report
    }

    /// Cancel the current session and silence the device
    pub fn stop(&self) {
        match self.inner.cancel.lock() {
            Ok(token) => token.cancel(),
            Err(_) => tracing::error!("session token poisoned"),
        }
        self.inner.sequencer.stop();
    }

    /// Pause playback
    pub fn pause(&self) {
        self.inner.sequencer.pause();
    }

    /// Resume paused playback
    pub fn resume(&self) {
        self.inner.sequencer.resume();
    }

    /// Raise the rate one step; returns the new rate
    pub fn speed_up(&self) -> f32 {
        self.inner.sequencer.adjust_rate(RATE_STEP)
    }

    /// Lower the rate one step; returns the new rate
    pub fn slow_down(&self) -> f32 {
        self.inner.sequencer.adjust_rate(-RATE_STEP)
    }

    /// Apply a command action
    pub fn apply(&self, action: CommandAction) {
        match action {
            CommandAction::Stop => self.stop(),
            CommandAction::Pause => self.pause(),
            CommandAction::Resume => self.resume(),
            CommandAction::SpeedUp => {
                self.speed_up();
            }
            CommandAction::SlowDown => {
                self.slow_down();
            }
        }
    }

    /// Register a voice command keyword
    pub fn register_command(&self, keyword: &str, action: CommandAction) {
        if let Ok(mut table) = self.inner.commands.lock() {
            table.register(keyword, action);
        }
    }

    /// Remove a voice command keyword
    pub fn unregister_command(&self, keyword: &str) -> Option<CommandAction> {
        self.inner
            .commands
            .lock()
            .ok()
            .and_then(|mut table| table.unregister(keyword))
    }

    /// Match an utterance against the registered commands
    #[must_use]
    pub fn match_command(&self, utterance: &str) -> Option<(String, CommandAction)> {
        let table = self.inner.commands.lock().ok()?;
        table
            .match_command(utterance)
            .map(|(keyword, action)| (keyword.to_string(), action))
    }
}

/// State of one `speak` call, torn down on every exit path
///
/// Dropping a session that was never closed cancels it, silences the
/// device if it had started, and reports it as cancelled.
struct Session {
    pipeline: SpeechPipeline,
    token: CancellationToken,
    started: bool,
    closed: bool,
    speculative: HashMap<u32, JoinHandle<SynthesisResult>>,
    listener: Option<(CancellationToken, JoinHandle<()>)>,
    current: Option<PlaybackHandle>,
    segments: usize,
    played: Vec<u32>,
    dropped: Vec<u32>,
}

impl Session {
    fn new(pipeline: SpeechPipeline, token: CancellationToken) -> Self {
        Self {
            pipeline,
            token,
            started: false,
            closed: false,
            speculative: HashMap::new(),
            listener: None,
            current: None,
            segments: 0,
            played: Vec::new(),
            dropped: Vec::new(),
        }
    }

    fn inner(&self) -> &PipelineInner {
        &self.pipeline.inner
    }

    /// Take ownership of the device
    fn start(&mut self) {
        self.started = true;
        self.inner().speaking.store(true, Ordering::SeqCst);
    }

    /// Hand `report` to the observer; the session is finished afterwards
    fn close(&mut self, report: SpeechReport) -> SpeechReport {
        self.closed = true;
        if self.started {
            self.inner().speaking.store(false, Ordering::SeqCst);
        }
        self.pipeline.finish(report)
    }

    async fn run(&mut self, text: &str) -> Result<()> {
        let config = &self.inner().config;
        if text.chars().count() < config.short_text_threshold {
            return self.run_single(text).await;
        }

        let segments = chunker::segments(text);
        if segments.len() <= 1 {
            return self.run_single(text).await;
        }
        self.run_streaming(segments).await
    }

    /// Speak short text as one unit
    async fn run_single(&mut self, text: &str) -> Result<()> {
        self.segments = 1;
        tracing::debug!(chars = text.len(), "speaking as a single unit");

        let synthesizer = self.inner().synthesizer.clone();
        let audio = tokio::select! {
            () = self.token.cancelled() => return Ok(()),
            result = synthesizer.synthesize(text) => result,
        };

        match audio {
            Ok(audio) => {
                self.play(0, audio).await?;
                self.await_current().await;
            }
            Err(kind) => self.drop_segment(0, kind),
        }
        Ok(())
    }

    /// Speak segment by segment with speculative look-ahead
    async fn run_streaming(&mut self, segments: Vec<Segment>) -> Result<()> {
        self.segments = segments.len();
        tracing::debug!(segments = segments.len(), "streaming speech");

        for segment in &segments {
            if self.token.is_cancelled() {
                break;
            }

            let Some(audio) = self.audio_for(segment).await else {
                continue;
            };

            if self.current.is_some() && !self.await_handoff().await {
                break;
            }

            if !self.play(segment.index, audio).await? {
                break;
            }

            if self.played.len() == 1 {
                self.spawn_speculative(&segments);
            }
        }

        self.await_current().await;
        Ok(())
    }

    /// Audio for `segment`, preferring its speculative result
    async fn audio_for(&mut self, segment: &Segment) -> Option<AudioBuffer> {
        if let Some(mut task) = self.speculative.remove(&segment.index) {
            let joined = tokio::select! {
                () = self.token.cancelled() => {
                    task.abort();
                    let _ = task.await;
                    return None;
                }
                joined = &mut task => joined,
            };

            match joined.map(SynthesisResult::into_result) {
                Ok(Ok(audio)) => return Some(audio),
                Ok(Err(kind)) => {
                    tracing::debug!(segment = segment.index, %kind, "speculative synthesis failed, retrying");
                }
                Err(e) => {
                    tracing::debug!(segment = segment.index, error = %e, "speculative task lost, retrying");
                }
            }
        }

        let synthesizer = self.inner().synthesizer.clone();
        let result = tokio::select! {
            () = self.token.cancelled() => return None,
            result = synthesizer.synthesize_segment(segment) => result,
        };

        match result.into_result() {
            Ok(audio) => Some(audio),
            Err(kind) => {
                self.drop_segment(segment.index, kind);
                None
            }
        }
    }

    fn drop_segment(&mut self, index: u32, kind: ErrorKind) {
        tracing::warn!(segment = index, %kind, "dropping segment");
        self.dropped.push(index);
    }

    /// Spawn synthesis for the look-ahead window after the head
    fn spawn_speculative(&mut self, segments: &[Segment]) {
        let inner = &self.pipeline.inner;
        let lookahead = u32::try_from(inner.config.lookahead).unwrap_or(u32::MAX);
        let head = self.played.first().copied().unwrap_or(0);

        for segment in segments
            .iter()
            .filter(|s| s.index > head && s.index <= head.saturating_add(lookahead))
        {
            let synthesizer = inner.synthesizer.clone();
            let segment = segment.clone();
            let index = segment.index;
            let task = tokio::spawn(async move { synthesizer.synthesize_segment(&segment).await });
            self.speculative.insert(index, task);
        }

        if !self.speculative.is_empty() {
            tracing::debug!(count = self.speculative.len(), "speculative synthesis started");
        }
    }

    /// Wait until the current segment can hand off; false if cancelled
    async fn await_handoff(&self) -> bool {
        let inner = self.inner();
        let sequencer = &inner.sequencer;
        let margin = inner.config.pause_between_sentences;

        loop {
            let reached = tokio::select! {
                () = self.token.cancelled() => return false,
                reached = sequencer.wait_for_near_completion(margin) => reached,
            };

            match reached {
                NearCompletion::Reached => return true,
                NearCompletion::Paused => {
                    tokio::select! {
                        () = self.token.cancelled() => return false,
                        () = sequencer.wait_while_paused() => {}
                    }
                }
                NearCompletion::Stopped => {
                    tracing::debug!("playback stopped externally");
                    return false;
                }
            }
        }
    }

    /// Start `audio` on the sequencer; false if the session was cancelled
    async fn play(&mut self, index: u32, audio: AudioBuffer) -> Result<bool> {
        loop {
            if self.token.is_cancelled() {
                return Ok(false);
            }

            match self.inner().sequencer.play(index, audio.clone()) {
                Ok(handle) => {
                    self.current = Some(handle);
                    self.played.push(index);
                    if self.played.len() == 1 {
                        self.start_listener();
                    }
                    return Ok(true);
                }
                // Paused between the handoff point and this play
                Err(Error::PlaybackBusy(_)) => {
                    if !self.await_handoff().await {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the last started segment to end
    async fn await_current(&mut self) {
        let Some(handle) = self.current.take() else {
            return;
        };

        tokio::select! {
            () = self.token.cancelled() => {}
            end = handle.finished() => {
                if end == PlaybackEnd::Stopped && !self.token.is_cancelled() {
                    tracing::debug!("final segment stopped externally");
                    self.token.cancel();
                }
            }
        }
    }

    fn start_listener(&mut self) {
        let inner = &self.pipeline.inner;
        let Some(settings) = inner.listener.clone() else {
            return;
        };

        let token = self.token.child_token();
        let listener = CommandListener::new(
            settings.recognizer,
            self.pipeline.clone(),
            settings.poll_interval,
            Arc::clone(&inner.observer),
        );
        let task = listener.spawn(token.clone());
        self.listener = Some((token, task));
    }

    /// Release everything the session holds and build its report
    async fn teardown(&mut self) -> SpeechReport {
        let outstanding: Vec<_> = self.speculative.drain().map(|(_, task)| task).collect();
        for task in &outstanding {
            task.abort();
        }
        let joined = futures::future::join_all(outstanding).await;
        for e in joined.into_iter().filter_map(std::result::Result::err) {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "speculative task failed");
            }
        }

        let cancelled = self.token.is_cancelled();
        if cancelled {
            self.inner().sequencer.stop();
        }

        if let Some((token, task)) = self.listener.take() {
            token.cancel();
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "command listener failed");
            }
        }

        let status = if cancelled {
            SpeechStatus::Cancelled
        } else if self.played.is_empty() {
            SpeechStatus::Failed
        } else if !self.dropped.is_empty() {
            SpeechStatus::PartialFailure
        } else {
            SpeechStatus::Completed
        };

        SpeechReport {
            status,
            segments: self.segments,
            played: std::mem::take(&mut self.played),
            dropped: std::mem::take(&mut self.dropped),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        tracing::debug!("speech abandoned before teardown");

        self.token.cancel();
        for (_, task) in self.speculative.drain() {
            task.abort();
        }
        // The listener exits on its own once its token is cancelled
        if let Some((token, _)) = self.listener.take() {
            token.cancel();
        }
        if self.started {
            self.inner().sequencer.stop();
        }

        let report = SpeechReport {
            status: SpeechStatus::Cancelled,
            segments: self.segments,
            played: std::mem::take(&mut self.played),
            dropped: std::mem::take(&mut self.dropped),
        };
        self.close(report);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::voice::{
        AudioOutput, NoopObserver, PlaybackState, SimulatedOutput, SpeechBackend,
        SynthesisCache, SynthesisPolicy,
    };

    /// One second of audio per call, 100ms latency
    struct SecondBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpeechBackend for SecondBackend {
        async fn synthesize(&self, _text: &str) -> Result<AudioBuffer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(AudioBuffer::silence(Duration::from_secs(1)))
        }
    }

    fn pipeline() -> (SpeechPipeline, Arc<SecondBackend>) {
        let backend = Arc::new(SecondBackend {
            calls: AtomicUsize::new(0),
        });
        let observer: Arc<dyn SpeechObserver> = Arc::new(NoopObserver);
        let synthesizer = SegmentSynthesizer::new(
            Arc::clone(&backend) as Arc<dyn SpeechBackend>,
            Arc::new(SynthesisCache::default()),
            SynthesisPolicy::default(),
            Arc::clone(&observer),
        );
        let output: Arc<dyn AudioOutput> = Arc::new(SimulatedOutput::new());
        let sequencer = PlaybackSequencer::new(output, 1.0);
        (
            SpeechPipeline::new(synthesizer, sequencer, SpeechConfig::default(), observer),
            backend,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_is_a_noop() {
        let (pipeline, backend) = pipeline();
        let report = pipeline.speak("   ").await.unwrap();
        assert_eq!(report.status, SpeechStatus::Completed);
        assert_eq!(report.segments, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn short_text_plays_once() {
        let (pipeline, backend) = pipeline();
        let report = pipeline.speak("Hello. How are you? Fine.").await.unwrap();

        assert_eq!(report.status, SpeechStatus::Completed);
        assert_eq!(report.segments, 1);
        assert_eq!(report.played, vec![0]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(!pipeline.is_speaking());
        assert_eq!(pipeline.sequencer().state(), PlaybackState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_session() {
        let (pipeline, _) = pipeline();
        let text = "This is the first sentence of a long reply. ".repeat(5);

        let speaking = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.speak(&text).await })
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(pipeline.is_speaking());
        pipeline.stop();

        let report = speaking.await.unwrap().unwrap();
        assert_eq!(report.status, SpeechStatus::Cancelled);
        assert!(report.played.len() < 5);
        assert_eq!(pipeline.sequencer().state(), PlaybackState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_adjusts_rate_within_bounds() {
        let (pipeline, _) = pipeline();
        for _ in 0..10 {
            pipeline.apply(CommandAction::SpeedUp);
        }
        assert!((pipeline.sequencer().rate() - 2.0).abs() < f32::EPSILON);
        pipeline.apply(CommandAction::SlowDown);
        assert!((pipeline.sequencer().rate() - 1.75).abs() < f32::EPSILON);
    }

    #[test]
    fn commands_register_and_match() {
        let (pipeline, _) = pipeline();
        pipeline.register_command("Shh", CommandAction::Stop);
        assert_eq!(
            pipeline.match_command("shh please"),
            Some(("shh".to_string(), CommandAction::Stop))
        );
        assert_eq!(pipeline.unregister_command("shh"), Some(CommandAction::Stop));
        assert_eq!(pipeline.match_command("shh"), None);
    }
}
