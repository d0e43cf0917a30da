//! Streaming speech front-end
//!
//! Text is split into sentence segments, synthesized through a cached and
//! retrying backend, and played one segment at a time by the
//! [`PlaybackSequencer`]. While a [`SpeechPipeline`] session speaks, a
//! [`CommandListener`] polls the recognizer for voice commands that stop,
//! pause, resume, or re-pace playback.

mod audio;
mod cache;
mod capture;
mod chunker;
mod commands;
mod listener;
mod observer;
mod output;
mod pipeline;
mod playback;
mod sequencer;
mod stt;
mod synthesizer;
mod tts;

pub use audio::{AudioBuffer, SAMPLE_RATE, samples_to_wav};
pub use cache::{DEFAULT_CACHE_CAPACITY, SynthesisCache};
pub use capture::{AudioCapture, rms};
pub use chunker::{DELIMITERS, Segment, segments, split};
pub use commands::{CommandAction, CommandTable};
pub use listener::{CommandListener, ListenerState};
pub use observer::{LoggingObserver, NoopObserver, SpeechObserver};
pub use output::{AudioOutput, SimulatedOutput};
pub use pipeline::{SpeechPipeline, SpeechReport, SpeechStatus};
pub use playback::CpalOutput;
pub use sequencer::{
    MAX_RATE, MIN_RATE, NearCompletion, PlaybackEnd, PlaybackHandle, PlaybackSequencer,
    PlaybackState, RATE_STEP, SpeechRate,
};
pub use stt::{Recognizer, RecognizerGuard, WhisperRecognizer};
pub use synthesizer::{
    SegmentSynthesizer, SpeechBackend, SynthesisPolicy, SynthesisResult, normalize,
};
pub use tts::OpenAiSpeech;
