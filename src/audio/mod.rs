//! # Audio Module
//!
//! Everything between the sound devices and the wire.
//!
//! ## Capture Path (microphone → server):
//! device callback → `resample` (downmix + 16 kHz) → `codec` (PCM16) →
//! `capture::AudioChunk` → `transmit::TransmitBuffer` → one JSON frame every
//! flush interval
//!
//! ## Playback Path (server → speakers):
//! Base64 frame → `codec` → `playback::PlaybackQueue` → device callback,
//! resampled from 24 kHz to whatever the device runs at
//!
//! ## Audio Formats:
//! - **Outbound**: 16-bit PCM, little-endian, mono, 16 kHz
//! - **Inbound**: 16-bit PCM, little-endian, mono, 24 kHz
//!
//! `analyser` is a read-only tap on the capture path for level meters.

pub mod analyser; // FFT magnitudes for visualization
pub mod capture; // Microphone input pipeline
pub mod codec; // PCM16 and Base64 conversions
pub mod playback; // Speaker output pipeline
pub mod resample; // Channel mixing and rate conversion
pub mod transmit; // Outbound chunk batching
