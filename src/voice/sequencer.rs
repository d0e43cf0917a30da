//! Playback sequencing over a single output device
//!
//! [`PlaybackSequencer`] is the only writer of the output device and of the
//! [`PlaybackState`]. Everything else goes through its operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use super::{AudioBuffer, AudioOutput};
use crate::{Error, Result};

/// Slowest playback rate
pub const MIN_RATE: f32 = 0.5;

/// Fastest playback rate
pub const MAX_RATE: f32 = 2.0;

/// Increment used by rate commands
pub const RATE_STEP: f32 = 0.25;

/// Floor for timing-gate sleeps so convergence always terminates
const MIN_GATE_STEP: Duration = Duration::from_millis(5);

/// Sleep used while nothing but a state change can make progress
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Playback state of the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Nothing playing
    #[default]
    Idle,
    /// Segment with this index is audible
    Playing(u32),
    /// Segment with this index is paused
    Paused(u32),
}

/// How a single playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// Reached the end of the buffer (or was handed off to the next segment)
    Completed,
    /// Stopped before the end
    Stopped,
}

/// Why `wait_for_near_completion` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NearCompletion {
    /// Within the margin of the end, or already finished
    Reached,
    /// Playback is paused
    Paused,
    /// Playback was stopped, or nothing is playing
    Stopped,
}

/// Playback rate multiplier bounded to [`MIN_RATE`, `MAX_RATE`]
#[derive(Debug)]
pub struct SpeechRate(AtomicU32);

impl SpeechRate {
    /// Create a rate, clamping into range
    #[must_use]
    pub fn new(rate: f32) -> Self {
        Self(AtomicU32::new(clamp_rate(rate).to_bits()))
    }

    /// Current multiplier
    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::SeqCst))
    }

    /// Store a clamped multiplier and return it
    pub fn set(&self, rate: f32) -> f32 {
        let rate = clamp_rate(rate);
        self.0.store(rate.to_bits(), Ordering::SeqCst);
        rate
    }
}

impl Default for SpeechRate {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn clamp_rate(rate: f32) -> f32 {
    if rate.is_finite() {
        rate.clamp(MIN_RATE, MAX_RATE)
    } else {
        1.0
    }
}

#[derive(Debug)]
struct Current {
    index: u32,
    duration: Duration,
    near_complete: bool,
    done: watch::Sender<Option<PlaybackEnd>>,
}

#[derive(Debug, Default)]
struct Inner {
    current: Option<Current>,
    last_end: Option<PlaybackEnd>,
}

struct Shared {
    output: Arc<dyn AudioOutput>,
    inner: Mutex<Inner>,
    state: watch::Sender<PlaybackState>,
    rate: SpeechRate,
    gate_factor: f64,
}

/// Plays one segment at a time on the owned output device
#[derive(Clone)]
pub struct PlaybackSequencer {
    shared: Arc<Shared>,
}

impl PlaybackSequencer {
    /// Create a sequencer owning `output`
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>, initial_rate: f32) -> Self {
        Self::with_gate_factor(output, initial_rate, 0.92)
    }

    /// Create a sequencer with a custom near-completion sleep factor
    ///
    /// Each timing step sleeps `factor` of the remaining wall time before
    /// re-checking, so timer slop never overshoots the target.
    #[must_use]
    pub fn with_gate_factor(output: Arc<dyn AudioOutput>, initial_rate: f32, factor: f64) -> Self {
        let (state, _) = watch::channel(PlaybackState::Idle);
        Self {
            shared: Arc::new(Shared {
                output,
                inner: Mutex::new(Inner::default()),
                state,
                rate: SpeechRate::new(initial_rate),
                gate_factor: factor.clamp(0.01, 1.0),
            }),
        }
    }

    /// Whether the output device is usable
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.shared.output.is_available()
    }

    /// Current state, accounting for natural completion
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        if let Some(mut inner) = self.shared.lock() {
            self.shared.refresh(&mut inner);
        }
        *self.shared.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.shared.state.subscribe()
    }

    /// Start playing `audio` as segment `index`
    ///
    /// Requires `Idle`, or a current segment that has already reached its
    /// near-completion point (it is then handed off without cutting the
    /// device).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty buffer, `PlaybackBusy` while a
    /// segment is still playing or paused, and `DeviceUnavailable` if the
    /// device rejects the audio
    pub fn play(&self, index: u32, audio: AudioBuffer) -> Result<PlaybackHandle> {
        if audio.is_empty() {
            return Err(Error::InvalidInput(format!("segment {index} has no audio")));
        }

        let shared = &self.shared;
        let mut inner = shared
            .lock()
            .ok_or_else(|| Error::Audio("sequencer state poisoned".to_string()))?;
        shared.refresh(&mut inner);

        if let Some(current) = &inner.current {
            let handoff = current.near_complete
                && matches!(*shared.state.borrow(), PlaybackState::Playing(_));
            if !handoff {
                return Err(Error::PlaybackBusy(current.index));
            }
            tracing::trace!(from = current.index, to = index, "handing off playback");
            shared.end_current(&mut inner, PlaybackEnd::Completed);
        }

        let rate = shared.rate.get();
        shared
            .output
            .start(audio.clone(), rate)
            .map_err(|e| match e {
                Error::DeviceUnavailable(_) => e,
                other => Error::DeviceUnavailable(other.to_string()),
            })?;

        let (done, done_rx) = watch::channel(None);
        inner.current = Some(Current {
            index,
            duration: audio.duration(),
            near_complete: false,
            done,
        });
        shared.state.send_replace(PlaybackState::Playing(index));

        tracing::debug!(
            segment = index,
            duration_ms = audio.duration().as_millis(),
            rate,
            "playing segment"
        );

        Ok(PlaybackHandle {
            shared: Arc::clone(shared),
            done: done_rx,
        })
    }

    /// Suspend until the current segment is within `margin` of its end
    ///
    /// Returns early when playback is paused or stopped.
    pub async fn wait_for_near_completion(&self, margin: Duration) -> NearCompletion {
        let shared = &self.shared;
        let mut state_rx = shared.state.subscribe();

        loop {
            let step = {
                let Some(mut inner) = shared.lock() else {
                    return NearCompletion::Stopped;
                };
                shared.refresh(&mut inner);
                let state = *shared.state.borrow();
                let last_end = inner.last_end;

                let Some(current) = inner.current.as_mut() else {
                    return match last_end {
                        Some(PlaybackEnd::Completed) => NearCompletion::Reached,
                        _ => NearCompletion::Stopped,
                    };
                };

                if matches!(state, PlaybackState::Paused(_)) {
                    return NearCompletion::Paused;
                }

                let target = current.duration.saturating_sub(margin);
                let position = shared.output.position();
                if position >= target {
                    current.near_complete = true;
                    return NearCompletion::Reached;
                }

                let wall = (target - position).div_f32(shared.rate.get());
                wall.mul_f64(shared.gate_factor).max(MIN_GATE_STEP)
            };

            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return NearCompletion::Stopped;
                    }
                }
                () = tokio::time::sleep(step) => {}
            }
        }
    }

    /// Suspend while playback is paused
    pub async fn wait_while_paused(&self) {
        let mut state_rx = self.shared.state.subscribe();
        while matches!(*state_rx.borrow_and_update(), PlaybackState::Paused(_)) {
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Halt output immediately and return to `Idle`; idempotent
    pub fn stop(&self) {
        let shared = &self.shared;
        let Some(mut inner) = shared.lock() else {
            shared.output.stop();
            return;
        };
        shared.output.stop();
        if let Some(current) = &inner.current {
            tracing::debug!(segment = current.index, "playback stopped");
        }
        shared.end_current(&mut inner, PlaybackEnd::Stopped);
    }

    /// Pause the playing segment; no-op unless `Playing`
    pub fn pause(&self) {
        let shared = &self.shared;
        let Some(mut inner) = shared.lock() else {
            return;
        };
        shared.refresh(&mut inner);

        let state = *shared.state.borrow();
        match state {
            PlaybackState::Playing(index) => {
                shared.output.pause();
                shared.state.send_replace(PlaybackState::Paused(index));
                tracing::info!(segment = index, "playback paused");
            }
            state => tracing::debug!(?state, "pause ignored, nothing playing"),
        }
    }

    /// Resume a paused segment; no-op unless `Paused`
    pub fn resume(&self) {
        let shared = &self.shared;
        let Some(_inner) = shared.lock() else {
            return;
        };

        let state = *shared.state.borrow();
        match state {
            PlaybackState::Paused(index) => {
                shared.output.resume();
                shared.state.send_replace(PlaybackState::Playing(index));
                tracing::info!(segment = index, "playback resumed");
            }
            state => tracing::debug!(?state, "resume ignored, not paused"),
        }
    }

    /// Set the rate multiplier, clamped to [`MIN_RATE`, `MAX_RATE`]
    ///
    /// Applies to the active segment immediately. Returns the stored rate.
    pub fn set_rate(&self, multiplier: f32) -> f32 {
        let shared = &self.shared;
        let Some(inner) = shared.lock() else {
            return shared.rate.get();
        };

        let rate = shared.rate.set(multiplier);
        if inner.current.is_some() {
            shared.output.set_rate(rate);
        }
        // Timing gates recompute their sleeps on any state notification
        shared.state.send_modify(|_| {});
        drop(inner);

        tracing::info!(rate, "speech rate set");
        rate
    }

    /// Shift the rate by `delta`, clamped; returns the new rate
    pub fn adjust_rate(&self, delta: f32) -> f32 {
        self.set_rate(self.shared.rate.get() + delta)
    }

    /// Current rate multiplier
    #[must_use]
    pub fn rate(&self) -> f32 {
        self.shared.rate.get()
    }
}

impl Shared {
    fn lock(&self) -> Option<MutexGuard<'_, Inner>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::error!("sequencer state poisoned");
                None
            }
        }
    }

    /// Transition to `Idle` if the playing segment ran to its end
    fn refresh(&self, inner: &mut Inner) {
        let finished = match (&inner.current, *self.state.borrow()) {
            (Some(current), PlaybackState::Playing(_)) => {
                self.output.position() >= current.duration
            }
            _ => false,
        };

        if finished {
            self.end_current(inner, PlaybackEnd::Completed);
        }
    }

    fn end_current(&self, inner: &mut Inner, end: PlaybackEnd) {
        if let Some(current) = inner.current.take() {
            current.done.send_replace(Some(end));
            inner.last_end = Some(end);
            tracing::trace!(segment = current.index, ?end, "segment ended");
        }
        self.state.send_replace(PlaybackState::Idle);
    }

    /// Wall time until the current segment ends, or `None` if it cannot progress
    fn remaining(&self) -> Option<Duration> {
        let mut inner = self.lock()?;
        self.refresh(&mut inner);

        let current = inner.current.as_ref()?;
        if !matches!(*self.state.borrow(), PlaybackState::Playing(_)) {
            return None;
        }
        let left = current.duration.saturating_sub(self.output.position());
        Some(left.div_f32(self.rate.get()).mul_f64(self.gate_factor).max(MIN_GATE_STEP))
    }
}

/// Awaitable handle for one started segment
pub struct PlaybackHandle {
    shared: Arc<Shared>,
    done: watch::Receiver<Option<PlaybackEnd>>,
}

impl PlaybackHandle {
    /// How the segment ended, if it has
    #[must_use]
    pub fn outcome(&self) -> Option<PlaybackEnd> {
        *self.done.borrow()
    }

    /// Suspend until the segment completes naturally or is stopped
    pub async fn finished(mut self) -> PlaybackEnd {
        let mut state_rx = self.shared.state.subscribe();

        loop {
            if let Some(end) = *self.done.borrow_and_update() {
                return end;
            }

            let step = self.shared.remaining().unwrap_or(IDLE_WAIT);
            if let Some(end) = *self.done.borrow_and_update() {
                return end;
            }

            tokio::select! {
                changed = self.done.changed() => {
                    if changed.is_err() {
                        return self.outcome().unwrap_or(PlaybackEnd::Stopped);
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return PlaybackEnd::Stopped;
                    }
                }
                () = tokio::time::sleep(step) => {}
            }
        }
    }
}
