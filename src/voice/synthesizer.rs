//! Segment synthesis with caching, timeout and retry
//!
//! Wraps a [`SpeechBackend`] so the pipeline only ever sees an
//! [`ErrorKind`], never a raw backend error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{AudioBuffer, Segment, SpeechObserver, SynthesisCache};
use crate::config::SynthesisConfig;
use crate::error::ErrorKind;
use crate::Result;

/// External text-to-speech backend: one attempt per call
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Synthesize `text` into a decoded buffer
    async fn synthesize(&self, text: &str) -> Result<AudioBuffer>;
}

/// Timeout and retry policy for backend calls
///
/// Unlike exponential backoff, attempts are spaced by a fixed delay: the
/// pipeline needs a bounded worst case while audio is already playing.
#[derive(Debug, Clone)]
pub struct SynthesisPolicy {
    /// Timeout for a single attempt
    pub timeout: Duration,
    /// Retries after the first attempt
    pub retries: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
    /// Source texts longer than this (in chars) are not cached
    pub max_cacheable_chars: usize,
}

impl Default for SynthesisPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2500),
            retries: 2,
            retry_delay: Duration::from_millis(200),
            max_cacheable_chars: 1000,
        }
    }
}

impl From<&SynthesisConfig> for SynthesisPolicy {
    fn from(config: &SynthesisConfig) -> Self {
        Self {
            timeout: config.timeout,
            retries: config.retries,
            retry_delay: config.retry_delay,
            max_cacheable_chars: config.max_cacheable_chars,
        }
    }
}

/// Outcome of synthesizing one segment
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    /// Index of the segment this result belongs to
    pub segment_index: u32,
    /// Decoded audio on success
    pub audio: Option<AudioBuffer>,
    /// Failure category otherwise
    pub error: Option<ErrorKind>,
}

impl SynthesisResult {
    /// Turn back into a `Result` for the caller's control flow
    ///
    /// # Errors
    ///
    /// Returns the recorded error kind, or `SynthesisFailed` if neither field is set
    pub fn into_result(self) -> std::result::Result<AudioBuffer, ErrorKind> {
        match (self.audio, self.error) {
            (Some(audio), None) => Ok(audio),
            (_, Some(kind)) => Err(kind),
            (None, None) => Err(ErrorKind::SynthesisFailed),
        }
    }
}

/// Normalize text before cache lookup and synthesis
///
/// Replaces `&` with `and`, strips angle brackets, collapses runs of spaces
/// and trims.
#[must_use]
pub fn normalize(text: &str) -> String {
    let replaced: String = text
        .replace('&', "and")
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .collect();

    let mut out = String::with_capacity(replaced.len());
    let mut previous_space = false;
    for c in replaced.chars() {
        if c == ' ' {
            if !previous_space {
                out.push(c);
            }
            previous_space = true;
        } else {
            out.push(c);
            previous_space = false;
        }
    }

    out.trim().to_string()
}

/// Fires `on_speech_ended` when dropped, so aborted calls stay paired
struct SpeechSignal<'a>(&'a dyn SpeechObserver);

impl<'a> SpeechSignal<'a> {
    fn start(observer: &'a dyn SpeechObserver) -> Self {
        observer.on_speech_started();
        Self(observer)
    }
}

impl Drop for SpeechSignal<'_> {
    fn drop(&mut self) {
        self.0.on_speech_ended();
    }
}

/// Synthesizes segments through the cache and a retrying backend
#[derive(Clone)]
pub struct SegmentSynthesizer {
    backend: Arc<dyn SpeechBackend>,
    cache: Arc<SynthesisCache>,
    policy: SynthesisPolicy,
    observer: Arc<dyn SpeechObserver>,
}

impl SegmentSynthesizer {
    /// Create a synthesizer over a backend and a shared cache
    #[must_use]
    pub fn new(
        backend: Arc<dyn SpeechBackend>,
        cache: Arc<SynthesisCache>,
        policy: SynthesisPolicy,
        observer: Arc<dyn SpeechObserver>,
    ) -> Self {
        Self {
            backend,
            cache,
            policy,
            observer,
        }
    }

    /// The shared cache
    #[must_use]
    pub fn cache(&self) -> &Arc<SynthesisCache> {
        &self.cache
    }

    /// Synthesize text, serving from cache when possible
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for text that normalizes to nothing and
    /// `SynthesisFailed` once every attempt has failed or timed out
    pub async fn synthesize(&self, text: &str) -> std::result::Result<AudioBuffer, ErrorKind> {
        let _signal = SpeechSignal::start(self.observer.as_ref());

        let key = normalize(text);
        if key.is_empty() {
            return Err(ErrorKind::InvalidInput);
        }

        if let Some(audio) = self.cache.get(&key) {
            tracing::debug!(chars = key.len(), "synthesis cache hit");
            return Ok(audio);
        }

        let attempts = self.policy.retries + 1;
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.policy.timeout, self.backend.synthesize(&key)).await {
                Ok(Ok(audio)) => {
                    if text.chars().count() <= self.policy.max_cacheable_chars {
                        self.cache.put(&key, audio.clone());
                    }
                    tracing::debug!(
                        attempt,
                        duration_ms = audio.duration().as_millis(),
                        "segment synthesized"
                    );
                    return Ok(audio);
                }
                Ok(Err(e)) => {
                    tracing::warn!(attempt, attempts, error = %e, "synthesis attempt failed");
                }
                Err(_) => {
                    tracing::warn!(
                        attempt,
                        attempts,
                        timeout_ms = self.policy.timeout.as_millis(),
                        "synthesis attempt timed out"
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        tracing::error!(attempts, "synthesis failed after retries");
        Err(ErrorKind::SynthesisFailed)
    }

    /// Synthesize one segment into a [`SynthesisResult`]
    pub async fn synthesize_segment(&self, segment: &Segment) -> SynthesisResult {
        match self.synthesize(&segment.text).await {
            Ok(audio) => SynthesisResult {
                segment_index: segment.index,
                audio: Some(audio),
                error: None,
            },
            Err(kind) => SynthesisResult {
                segment_index: segment.index,
                audio: None,
                error: Some(kind),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::voice::NoopObserver;
    use crate::Error;

    /// Fails the first `failures` calls, then succeeds
    struct FlakyBackend {
        calls: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    impl FlakyBackend {
        fn new(failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl SpeechBackend for FlakyBackend {
        async fn synthesize(&self, _text: &str) -> Result<AudioBuffer> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures {
                Err(Error::Tts("backend unavailable".to_string()))
            } else {
                Ok(AudioBuffer::new(vec![0.1; 1600]))
            }
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        started: AtomicUsize,
        ended: AtomicUsize,
    }

    impl SpeechObserver for CountingObserver {
        fn on_speech_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_speech_ended(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn synthesizer(backend: Arc<FlakyBackend>, observer: Arc<dyn SpeechObserver>) -> SegmentSynthesizer {
        SegmentSynthesizer::new(
            backend,
            Arc::new(SynthesisCache::default()),
            SynthesisPolicy::default(),
            observer,
        )
    }

    #[test]
    fn normalize_rewrites_text() {
        assert_eq!(normalize("  Salt & <b>pepper</b>   please "), "Salt and bpepper/b please");
        assert_eq!(normalize("a    b"), "a b");
        assert_eq!(normalize("<>"), "");
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_skips_backend() {
        let backend = Arc::new(FlakyBackend::new(0));
        let synth = synthesizer(Arc::clone(&backend), Arc::new(NoopObserver));

        synth.synthesize("Hello & welcome.").await.unwrap();
        synth.synthesize("Hello   and welcome.").await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(synth.cache().get("Hello and welcome.").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let backend = Arc::new(FlakyBackend::new(2));
        let synth = synthesizer(Arc::clone(&backend), Arc::new(NoopObserver));

        assert!(synth.synthesize("third time lucky").await.is_ok());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_synthesis_failed() {
        let backend = Arc::new(FlakyBackend::new(usize::MAX));
        let synth = synthesizer(Arc::clone(&backend), Arc::new(NoopObserver));

        assert_eq!(
            synth.synthesize("never works").await,
            Err(ErrorKind::SynthesisFailed)
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert!(synth.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_attempt() {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicUsize::new(0),
            failures: 0,
            delay: Duration::from_secs(10),
        });
        let synth = synthesizer(Arc::clone(&backend), Arc::new(NoopObserver));

        let started = tokio::time::Instant::now();
        assert_eq!(synth.synthesize("slow").await, Err(ErrorKind::SynthesisFailed));

        // 3 attempts x 2.5s plus 2 retry delays of 200ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(7900), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(8000), "elapsed {elapsed:?}");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn long_text_is_not_cached() {
        let backend = Arc::new(FlakyBackend::new(0));
        let synth = synthesizer(Arc::clone(&backend), Arc::new(NoopObserver));

        let long = "word ".repeat(250);
        synth.synthesize(&long).await.unwrap();
        assert!(synth.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_is_invalid_input() {
        let backend = Arc::new(FlakyBackend::new(0));
        let synth = synthesizer(Arc::clone(&backend), Arc::new(NoopObserver));

        assert_eq!(synth.synthesize(" <> ").await, Err(ErrorKind::InvalidInput));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn speech_signals_are_paired_on_hits_and_misses() {
        let backend = Arc::new(FlakyBackend::new(0));
        let observer = Arc::new(CountingObserver::default());
        let synth = synthesizer(backend, Arc::clone(&observer) as Arc<dyn SpeechObserver>);

        synth.synthesize("once").await.unwrap();
        synth.synthesize("once").await.unwrap();

        assert_eq!(observer.started.load(Ordering::SeqCst), 2);
        assert_eq!(observer.ended.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn segment_result_carries_index() {
        let backend = Arc::new(FlakyBackend::new(usize::MAX));
        let synth = synthesizer(backend, Arc::new(NoopObserver));

        let result = synth
            .synthesize_segment(&Segment {
                index: 4,
                text: "fails".to_string(),
            })
            .await;

        assert_eq!(result.segment_index, 4);
        assert!(result.audio.is_none());
        assert_eq!(result.into_result(), Err(ErrorKind::SynthesisFailed));
    }
}
