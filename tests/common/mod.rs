//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use talkback::config::{CommandsConfig, SpeechConfig};
use talkback::voice::{
    AudioBuffer, AudioOutput, PlaybackSequencer, Recognizer, RecognizerGuard, SegmentSynthesizer,
    SimulatedOutput, SpeechBackend, SpeechObserver, SpeechPipeline, SpeechReport, SynthesisCache,
    SynthesisPolicy,
};
use talkback::{Error, Result};

/// How the mock backend answers one text
#[derive(Debug, Clone, Copy)]
pub struct Plan {
    /// Latency before answering
    pub delay: Duration,
    /// Length of the returned audio
    pub audio: Duration,
    /// Fail every attempt
    pub fail: bool,
}

impl Plan {
    pub fn ok(delay_ms: u64, audio_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            audio: Duration::from_millis(audio_ms),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            delay: Duration::from_millis(10),
            audio: Duration::ZERO,
            fail: true,
        }
    }
}

/// Synthesis backend with per-text latency, audio length and failures
pub struct MockBackend {
    plans: HashMap<String, Plan>,
    default: Plan,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(default: Plan) -> Self {
        Self {
            plans: HashMap::new(),
            default,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_plan(mut self, text: &str, plan: Plan) -> Self {
        self.plans.insert(text.to_string(), plan);
        self
    }

    /// Texts the backend was asked for, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SpeechBackend for MockBackend {
    async fn synthesize(&self, text: &str) -> Result<AudioBuffer> {
        self.calls.lock().unwrap().push(text.to_string());
        let plan = self.plans.get(text).copied().unwrap_or(self.default);

        tokio::time::sleep(plan.delay).await;
        if plan.fail {
            return Err(Error::Tts(format!("scripted failure for {text:?}")));
        }
        Ok(AudioBuffer::silence(plan.audio))
    }
}

/// Observer that records every notification
#[derive(Default)]
pub struct RecordingObserver {
    pub speech_started: AtomicUsize,
    pub speech_ended: AtomicUsize,
    pub command_listening_started: AtomicUsize,
    pub command_listening_ended: AtomicUsize,
    pub reports: Mutex<Vec<SpeechReport>>,
}

impl RecordingObserver {
    pub fn reports(&self) -> Vec<SpeechReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn started(&self) -> usize {
        self.speech_started.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> usize {
        self.speech_ended.load(Ordering::SeqCst)
    }
}

impl SpeechObserver for RecordingObserver {
    fn on_command_listening_started(&self) {
        self.command_listening_started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_command_listening_ended(&self) {
        self.command_listening_ended.fetch_add(1, Ordering::SeqCst);
    }

    fn on_speech_started(&self) {
        self.speech_started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_speech_ended(&self) {
        self.speech_ended.fetch_add(1, Ordering::SeqCst);
    }

    fn on_speech_finished(&self, report: &SpeechReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

/// Recognizer answering from a script, one entry per attempt
pub struct ScriptedRecognizer {
    script: Mutex<Vec<Option<String>>>,
    delay: Duration,
    pub attempts: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new(script: &[Option<&str>], delay: Duration) -> Self {
        Self {
            script: Mutex::new(script.iter().map(|s| s.map(String::from)).collect()),
            delay,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn recognize_once(&self) -> Result<Option<String>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let mut script = self.script.lock().unwrap();
        Ok(if script.is_empty() {
            None
        } else {
            script.remove(0)
        })
    }
}

/// Everything a pipeline test needs to inspect
pub struct Harness {
    pub pipeline: SpeechPipeline,
    pub backend: Arc<MockBackend>,
    pub output: Arc<SimulatedOutput>,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    /// Sample counts of started buffers, in order
    pub fn started(&self) -> Vec<usize> {
        self.output.started()
    }
}

fn parts(
    backend: MockBackend,
    output: SimulatedOutput,
) -> (
    SegmentSynthesizer,
    PlaybackSequencer,
    Arc<MockBackend>,
    Arc<SimulatedOutput>,
    Arc<RecordingObserver>,
) {
    let backend = Arc::new(backend);
    let output = Arc::new(output);
    let observer = Arc::new(RecordingObserver::default());

    let synthesizer = SegmentSynthesizer::new(
        Arc::clone(&backend) as Arc<dyn SpeechBackend>,
        Arc::new(SynthesisCache::default()),
        SynthesisPolicy::default(),
        Arc::clone(&observer) as Arc<dyn SpeechObserver>,
    );
    let sequencer = PlaybackSequencer::new(Arc::clone(&output) as Arc<dyn AudioOutput>, 1.0);
    (synthesizer, sequencer, backend, output, observer)
}

/// Pipeline over a mock backend and a simulated device
pub fn harness(backend: MockBackend) -> Harness {
    harness_with_output(backend, SimulatedOutput::new())
}

pub fn harness_with_output(backend: MockBackend, output: SimulatedOutput) -> Harness {
    let (synthesizer, sequencer, backend, output, observer) = parts(backend, output);
    let pipeline = SpeechPipeline::new(
        synthesizer,
        sequencer,
        SpeechConfig::default(),
        Arc::clone(&observer) as Arc<dyn SpeechObserver>,
    );
    Harness {
        pipeline,
        backend,
        output,
        observer,
    }
}

/// Pipeline that listens for voice commands through `recognizer`
pub fn harness_with_commands(backend: MockBackend, recognizer: Arc<ScriptedRecognizer>) -> Harness {
    let (synthesizer, sequencer, backend, output, observer) =
        parts(backend, SimulatedOutput::new());
    let guard = RecognizerGuard::new(recognizer as Arc<dyn Recognizer>, Duration::ZERO);
    let pipeline = SpeechPipeline::with_commands(
        synthesizer,
        sequencer,
        SpeechConfig::default(),
        Arc::clone(&observer) as Arc<dyn SpeechObserver>,
        guard,
        &CommandsConfig::default(),
    );
    Harness {
        pipeline,
        backend,
        output,
        observer,
    }
}

/// A distinct sentence long enough that a few of them exceed the short-text threshold
pub fn sentence(i: u32) -> String {
    format!("Sentence number {i} is here to exercise the stream.")
}

/// `n` distinct sentences joined into one response
pub fn response(n: u32) -> String {
    (0..n).map(sentence).collect::<Vec<_>>().join(" ")
}

/// Samples in a buffer of `ms` milliseconds
pub fn samples(ms: u64) -> usize {
    AudioBuffer::silence(Duration::from_millis(ms)).len()
}
