//! Audio output device abstraction
//!
//! The sequencer drives exactly one [`AudioOutput`]. Operations other than
//! `start` are infallible: device errors are logged by the implementation.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::AudioBuffer;
use crate::{Error, Result};

/// A single-buffer audio output device
pub trait AudioOutput: Send + Sync {
    /// Whether the device is present and usable
    fn is_available(&self) -> bool {
        true
    }

    /// Replace whatever is playing with `audio`, starting at `rate`
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot accept audio
    fn start(&self, audio: AudioBuffer, rate: f32) -> Result<()>;

    /// Freeze output at the current position
    fn pause(&self);

    /// Continue from the paused position
    fn resume(&self);

    /// Silence output and drop the current buffer
    fn stop(&self);

    /// Change the playback rate of the current buffer
    fn set_rate(&self, rate: f32);

    /// Position within the current buffer, in source (1.0x) time
    fn position(&self) -> Duration;
}

#[derive(Debug)]
struct SimulatedState {
    duration: Duration,
    base: Duration,
    anchor: Instant,
    rate: f32,
    paused: bool,
    active: bool,
    started: Vec<usize>,
}

/// Output device that advances with the clock but produces no sound
///
/// Used for headless runs (`--no-audio`) and tests. Runs on `tokio` time, so
/// paused-clock tests see deterministic positions.
#[derive(Debug)]
pub struct SimulatedOutput {
    available: bool,
    state: Mutex<SimulatedState>,
}

impl Default for SimulatedOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedOutput {
    /// Create an available simulated device
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: true,
            state: Mutex::new(SimulatedState {
                duration: Duration::ZERO,
                base: Duration::ZERO,
                anchor: Instant::now(),
                rate: 1.0,
                paused: false,
                active: false,
                started: Vec::new(),
            }),
        }
    }

    /// Create a device that reports itself missing
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Sample counts of every buffer started, in order
    #[must_use]
    pub fn started(&self) -> Vec<usize> {
        self.state
            .lock()
            .map(|s| s.started.clone())
            .unwrap_or_default()
    }

    /// Whether a buffer is loaded and not stopped
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().is_ok_and(|s| s.active)
    }

    fn current(state: &SimulatedState) -> Duration {
        if !state.active {
            return Duration::ZERO;
        }
        if state.paused {
            return state.base;
        }
        let advanced = state.anchor.elapsed().mul_f32(state.rate);
        (state.base + advanced).min(state.duration)
    }

    fn rebase(state: &mut SimulatedState) {
        state.base = Self::current(state);
        state.anchor = Instant::now();
    }
}

impl AudioOutput for SimulatedOutput {
    fn is_available(&self) -> bool {
        self.available
    }

    fn start(&self, audio: AudioBuffer, rate: f32) -> Result<()> {
        if !self.available {
            return Err(Error::DeviceUnavailable("simulated device disabled".to_string()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Audio("simulated device state poisoned".to_string()))?;

        state.duration = audio.duration();
        state.base = Duration::ZERO;
        state.anchor = Instant::now();
        state.rate = rate;
        state.paused = false;
        state.active = true;
        state.started.push(audio.len());
        Ok(())
    }

    fn pause(&self) {
        if let Ok(mut state) = self.state.lock() {
            Self::rebase(&mut state);
            state.paused = true;
        }
    }

    fn resume(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.anchor = Instant::now();
            state.paused = false;
        }
    }

    fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.active = false;
            state.paused = false;
            state.base = Duration::ZERO;
        }
    }

    fn set_rate(&self, rate: f32) {
        if let Ok(mut state) = self.state.lock() {
            Self::rebase(&mut state);
            state.rate = rate;
        }
    }

    fn position(&self) -> Duration {
        self.state
            .lock()
            .map(|s| Self::current(&s))
            .unwrap_or_default()
    }
}
