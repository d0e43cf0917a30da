//! Decoded audio buffers and codecs
//!
//! Every buffer in the pipeline is mono f32 at [`SAMPLE_RATE`]. Backends that
//! return other formats are decoded and resampled here.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Sample rate of all pipeline audio (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Decoded mono audio at [`SAMPLE_RATE`]
///
/// Cloning shares the underlying samples.
#[derive(Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
}

impl AudioBuffer {
    /// Wrap normalized samples (-1.0..=1.0) already at [`SAMPLE_RATE`]
    #[must_use]
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    /// Silent buffer of the given duration
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn silence(duration: Duration) -> Self {
        let len = (duration.as_secs_f64() * f64::from(SAMPLE_RATE)).round() as usize;
        Self::new(vec![0.0; len])
    }

    /// Decode MP3 bytes, downmixing to mono and resampling to [`SAMPLE_RATE`]
    ///
    /// # Errors
    ///
    /// Returns error if the data is not decodable MP3
    pub fn from_mp3(mp3_data: &[u8]) -> Result<Self> {
        let (samples, sample_rate) = decode_mp3(mp3_data)?;
        Self::from_samples(&samples, sample_rate)
    }

    /// Decode WAV bytes (any bit depth), downmixing and resampling as needed
    ///
    /// # Errors
    ///
    /// Returns error if the data is not a readable WAV file
    pub fn from_wav(wav_data: &[u8]) -> Result<Self> {
        let mut reader = hound::WavReader::new(Cursor::new(wav_data))
            .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?,
            hound::SampleFormat::Int => {
                #[allow(clippy::cast_precision_loss)]
                let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let mono: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        Self::from_samples(&mono, spec.sample_rate)
    }

    /// Build a buffer from mono samples at an arbitrary rate
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Result<Self> {
        if sample_rate == SAMPLE_RATE {
            return Ok(Self::new(samples.to_vec()));
        }
        Ok(Self::new(resample_audio(samples, sample_rate, SAMPLE_RATE)?))
    }

    /// Samples at [`SAMPLE_RATE`]
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer holds no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration at 1.0x
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(SAMPLE_RATE))
    }

    /// Encode as 16-bit PCM WAV
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples, SAMPLE_RATE)
    }
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("samples", &self.samples.len())
            .field("duration", &self.duration())
            .finish()
    }
}

/// Convert f32 samples to 16-bit mono WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
#[allow(clippy::cast_possible_truncation)]
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::Audio(format!("WAV encode error: {e}")))?;

        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer
                .write_sample(value)
                .map_err(|e| Error::Audio(format!("WAV encode error: {e}")))?;
        }

        writer
            .finalize()
            .map_err(|e| Error::Audio(format!("WAV encode error: {e}")))?;
    }

    Ok(cursor.into_inner())
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
#[allow(clippy::cast_sign_loss)]
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = frame.sample_rate as u32;
                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate))
}

/// Resample audio using rubato
#[allow(clippy::cast_possible_truncation)]
fn resample_audio(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let mut output = Vec::new();

    for chunk in samples.chunks(chunk_size) {
        // Zero-pad the tail so the last partial chunk is not dropped
        let mut block: Vec<f64> = chunk.iter().map(|&s| f64::from(s)).collect();
        block.resize(chunk_size, 0.0);

        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend(result[0].iter().map(|&s| s as f32));
    }

    // Trim the padding back off
    let expected = samples.len() * to_rate as usize / from_rate as usize;
    output.truncate(expected);

    Ok(output)
}
