//! Audio playback to speakers
//!
//! `cpal` streams are not `Send`, so the stream lives on a dedicated thread
//! for the lifetime of [`CpalOutput`]. The audio callback reads the shared
//! [`DeviceState`]; control calls only mutate that state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::{AudioBuffer, AudioOutput, SAMPLE_RATE};
use crate::{Error, Result};

/// What the audio callback plays
#[derive(Debug, Default)]
struct DeviceState {
    audio: Option<AudioBuffer>,
    /// Fractional read position in source samples
    cursor: f64,
    rate: f32,
    paused: bool,
}

impl DeviceState {
    /// Produce the next output sample and advance by `step` source samples
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn next_sample(&mut self, step: f64) -> f32 {
        if self.paused {
            return 0.0;
        }
        let Some(audio) = &self.audio else {
            return 0.0;
        };

        let samples = audio.samples();
        let index = self.cursor as usize;
        if index >= samples.len() {
            return 0.0;
        }

        // Linear interpolation between neighbouring source samples
        let frac = (self.cursor - self.cursor.floor()) as f32;
        let current = samples[index];
        let next = samples.get(index + 1).copied().unwrap_or(current);
        self.cursor += step * f64::from(self.rate);
        current + (next - current) * frac
    }
}

/// Plays audio to the default output device
pub struct CpalOutput {
    state: Arc<Mutex<DeviceState>>,
    available: Arc<AtomicBool>,
    shutdown: Option<mpsc::Sender<()>>,
}

impl CpalOutput {
    /// Open the default output device on a dedicated audio thread
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no usable output device exists
    pub fn new() -> Result<Self> {
        let state = Arc::new(Mutex::new(DeviceState {
            rate: 1.0,
            ..DeviceState::default()
        }));
        let available = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_state = Arc::clone(&state);
        let thread_available = Arc::clone(&available);
        std::thread::Builder::new()
            .name("talkback-audio-out".to_string())
            .spawn(move || {
                let stream = match open_stream(thread_state, Arc::clone(&thread_available)) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until the owner drops; a closed channel also ends the thread
                let _ = shutdown_rx.recv();
                drop(stream);
                thread_available.store(false, Ordering::SeqCst);
                tracing::debug!("audio output thread stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::DeviceUnavailable("audio thread exited".to_string()))??;

        Ok(Self {
            state,
            available,
            shutdown: Some(shutdown_tx),
        })
    }

    fn with_state(&self, f: impl FnOnce(&mut DeviceState)) {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(_) => tracing::error!("audio device state poisoned"),
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl AudioOutput for CpalOutput {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn start(&self, audio: AudioBuffer, rate: f32) -> Result<()> {
        if !self.is_available() {
            return Err(Error::DeviceUnavailable("output stream closed".to_string()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Audio("audio device state poisoned".to_string()))?;
        state.audio = Some(audio);
        state.cursor = 0.0;
        state.rate = rate;
        state.paused = false;
        Ok(())
    }

    fn pause(&self) {
        self.with_state(|s| s.paused = true);
    }

    fn resume(&self) {
        self.with_state(|s| s.paused = false);
    }

    fn stop(&self) {
        self.with_state(|s| {
            s.audio = None;
            s.cursor = 0.0;
            s.paused = false;
        });
    }

    fn set_rate(&self, rate: f32) {
        self.with_state(|s| s.rate = rate);
    }

    fn position(&self) -> Duration {
        self.state.lock().map_or(Duration::ZERO, |s| match &s.audio {
            Some(audio) => {
                #[allow(clippy::cast_precision_loss)]
                let len = audio.len() as f64;
                Duration::from_secs_f64(s.cursor.min(len) / f64::from(SAMPLE_RATE))
            }
            None => Duration::ZERO,
        })
    }
}

/// Build and start the output stream, preferring a native 16kHz config
fn open_stream(
    state: Arc<Mutex<DeviceState>>,
    available: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let native = device
        .supported_output_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .filter(|c| c.channels() <= 2)
        .find(|c| {
            c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .map(|c| c.with_sample_rate(SampleRate(SAMPLE_RATE)).config());

    // Fallback: device default rate, resampled on the fly by the cursor step
    let config: StreamConfig = match native {
        Some(config) => config,
        None => device
            .default_output_config()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .config(),
    };

    let channels = usize::from(config.channels);
    let step = f64::from(SAMPLE_RATE) / f64::from(config.sample_rate.0);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut state) = state.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = state.next_sample(step);
                    frame.fill(sample);
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                available.store(false, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}
