//! # PCM Frame Encoding
//!
//! Converts a captured buffer of `f32` samples into the binary frame the lab
//! server expects (16-bit signed PCM, little-endian, mono) plus a loudness
//! level for the microphone meter.
//!
//! ## Scaling:
//! Samples are clamped to [-1.0, 1.0] first. Negative values scale by 32768 and
//! non-negative values by 32767, which is exactly the asymmetric range of an
//! `i16`. A symmetric ×32768 scale would overflow by one count at +1.0.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::config::AudioConfig;

/// One encoded capture buffer.
///
/// Produced per capture buffer and consumed immediately by the send path.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// PCM samples, same length and order as the captured buffer
    pub samples: Vec<i16>,
    /// Display level in [0, ceiling]
    pub level: f32,
}

impl AudioFrame {
    /// Serialize the samples as raw little-endian 16-bit PCM.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            // Writing into a Vec cannot fail
            let _ = bytes.write_i16::<LittleEndian>(sample);
        }
        bytes
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Stateless float → PCM encoder.
///
/// Holds only the level-meter settings; every call to [`AudioEncoder::encode`]
/// is independent of the previous one.
#[derive(Debug, Clone, Copy)]
pub struct AudioEncoder {
    level_gain: f32,
    level_ceiling: f32,
}

impl Default for AudioEncoder {
    fn default() -> Self {
        Self {
            level_gain: 1.0,
            level_ceiling: 1.0,
        }
    }
}

impl AudioEncoder {
    pub fn new(level_gain: f32, level_ceiling: f32) -> Self {
        Self {
            level_gain,
            level_ceiling,
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(config.level_gain, config.level_ceiling)
    }

    /// Encode one captured buffer.
    ///
    /// ## Returns:
    /// - **samples**: clamped and scaled PCM, one per input sample
    /// - **level**: `min(rms * gain, ceiling)`, 0 for an empty buffer
    pub fn encode(&self, input: &[f32]) -> AudioFrame {
        let samples = input.iter().map(|&v| encode_sample(v)).collect();
        AudioFrame {
            samples,
            level: self.level(input),
        }
    }

    /// RMS loudness of the clamped buffer, scaled for display.
    pub fn level(&self, input: &[f32]) -> f32 {
        if input.is_empty() {
            return 0.0;
        }

        let sum_squares: f64 = input
            .iter()
            .map(|&v| {
                let s = clamp_unit(v) as f64;
                s * s
            })
            .sum();
        let rms = (sum_squares / input.len() as f64).sqrt() as f32;

        (rms * self.level_gain).min(self.level_ceiling)
    }
}

/// Convert a single float sample to 16-bit PCM.
///
/// NaN has no meaningful loudness and encodes as silence.
pub fn encode_sample(value: f32) -> i16 {
    let s = clamp_unit(value);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}
