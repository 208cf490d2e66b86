//! # PCM Codec
//!
//! Stateless conversions between the three audio representations the client
//! handles:
//!
//! - **f32 samples** in `[-1.0, 1.0]`, as delivered by the audio devices
//! - **PCM16**: 16-bit signed little-endian integers, the wire format
//! - **Base64 text**, the encoding used inside JSON frames
//!
//! ## Overflow Policy:
//! `float_to_pcm16` clamps out-of-range samples to the i16 range.
//! `float_to_pcm16_wrapping` reproduces the legacy behaviour of storing a
//! scaled float into an `Int16Array` (truncate, then wrap modulo 2^16) for
//! peers that need bit-exact output. Which one the capture pipeline uses is
//! selected by `audio.pcm_overflow` in the configuration.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{AppError, AppResult};

/// Scale factor between f32 samples and PCM16 (0x7fff).
pub const PCM16_SCALE: f32 = 32767.0;

const PCM16_SCALE_F64: f64 = 32767.0;

/// How out-of-range float samples are mapped to PCM16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PcmOverflow {
    /// Saturate to [-32768, 32767]
    #[default]
    Clamp,
    /// Truncate and wrap modulo 2^16 (legacy wire behaviour)
    Wrap,
}

impl PcmOverflow {
    /// Encode with the selected policy.
    pub fn encode(self, samples: &[f32]) -> Vec<u8> {
        match self {
            PcmOverflow::Clamp => float_to_pcm16(samples),
            PcmOverflow::Wrap => float_to_pcm16_wrapping(samples),
        }
    }
}

/// Convert f32 samples to little-endian PCM16 bytes.
///
/// Each sample is scaled by 32767 and truncated toward zero. Values outside
/// `[-1.0, 1.0]` saturate instead of overflowing; NaN encodes as 0.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Scale in f64: an f32 product can round up to the next integer
        // before truncation. `as` to i16 truncates toward zero and saturates.
        let value = (sample as f64 * PCM16_SCALE_F64) as i16;
        // Writing into a Vec cannot fail
        let _ = out.write_i16::<LittleEndian>(value);
    }
    out
}

/// Legacy conversion: truncate toward zero, then wrap modulo 2^16.
///
/// A sample of `1.5` becomes `49150 - 65536 = -16386`, exactly as a typed
/// array store would produce it.
pub fn float_to_pcm16_wrapping(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = sample as f64 * PCM16_SCALE_F64;
        let truncated = if scaled.is_finite() { scaled.trunc() as i64 } else { 0 };
        let _ = out.write_i16::<LittleEndian>(truncated as i16);
    }
    out
}

/// Read little-endian PCM16 bytes back into samples.
///
/// A trailing odd byte is ignored.
pub fn pcm16_to_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Read little-endian PCM16 bytes as f32 samples in `[-1.0, 1.0]`.
///
/// Divides by 32767 (not 32768) so that `pcm16_to_float(float_to_pcm16(x))`
/// is within one quantization step of `x`.
pub fn pcm16_to_float(data: &[u8]) -> Vec<f32> {
    pcm16_to_samples(data)
        .into_iter()
        .map(|s| (s as f32 / PCM16_SCALE).max(-1.0))
        .collect()
}

/// Base64-encode bytes with the standard alphabet and padding.
pub fn base64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode standard Base64, padding required.
///
/// ## Errors:
/// Returns `AppError::Decode` for malformed input, including surrounding
/// whitespace.
pub fn base64_decode(text: &str) -> AppResult<Vec<u8>> {
    BASE64.decode(text).map_err(AppError::from)
}
