//! # Spectrum Analyser
//!
//! Read-only visualization tap on the capture signal. Every `fft_size` mono
//! samples the analyser computes a Hann-windowed real FFT and publishes the
//! magnitude of the first `fft_size / 2` bins together with the block's RMS
//! level on a `tokio::sync::watch` channel.
//!
//! The analyser never touches the transmitted audio; a slow or absent
//! subscriber only ever sees the latest frame.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use tokio::sync::watch;
use tracing::warn;

/// One published analysis frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectrumFrame {
    /// Magnitude per frequency bin, `fft_size / 2` entries, roughly in [0, 1]
    pub magnitudes: Vec<f32>,
    /// Root mean square of the analysed block
    pub rms: f32,
}

impl SpectrumFrame {
    /// Index of the strongest bin, if any.
    pub fn peak_bin(&self) -> Option<usize> {
        self.magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }
}

pub struct SpectrumAnalyser {
    fft_size: usize,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    pending: Vec<f32>,
    scratch: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    publisher: Arc<watch::Sender<SpectrumFrame>>,
}

impl SpectrumAnalyser {
    /// Create an analyser with its own publishing channel.
    pub fn new(fft_size: usize) -> Self {
        let (tx, _rx) = watch::channel(SpectrumFrame::default());
        Self::with_publisher(fft_size, Arc::new(tx))
    }

    /// Create an analyser publishing on an existing channel, so subscribers
    /// survive the analyser being rebuilt when capture restarts.
    pub fn with_publisher(fft_size: usize, publisher: Arc<watch::Sender<SpectrumFrame>>) -> Self {
        let fft_size = fft_size.max(2);
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch = fft.make_input_vec();
        let spectrum = fft.make_output_vec();

        let window = (0..fft_size)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32;
                0.5 - 0.5 * phase.cos()
            })
            .collect();

        Self {
            fft_size,
            fft,
            window,
            pending: Vec::with_capacity(fft_size),
            scratch,
            spectrum,
            publisher,
        }
    }

    /// Receiver for published frames.
    pub fn subscribe(&self) -> watch::Receiver<SpectrumFrame> {
        self.publisher.subscribe()
    }

    /// Feed mono samples. Publishes one frame per complete block.
    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.fft_size {
            let block: Vec<f32> = self.pending.drain(..self.fft_size).collect();
            if let Some(frame) = self.analyse(&block) {
                // send_replace never fails, even with no subscribers
                self.publisher.send_replace(frame);
            }
        }
    }

    fn analyse(&mut self, block: &[f32]) -> Option<SpectrumFrame> {
        let energy: f32 = block.iter().map(|s| s * s).sum();
        let rms = (energy / block.len() as f32).sqrt();

        for ((dst, &src), &w) in self.scratch.iter_mut().zip(block).zip(&self.window) {
            *dst = src * w;
        }

        if let Err(e) = self.fft.process(&mut self.scratch, &mut self.spectrum) {
            warn!(error = %e, "Spectrum analysis failed");
            return None;
        }

        // Hann window has a coherent gain of 0.5
        let norm = 4.0 / self.fft_size as f32;
        let magnitudes = self
            .spectrum
            .iter()
            .take(self.fft_size / 2)
            .map(|c| c.norm() * norm)
            .collect();

        Some(SpectrumFrame { magnitudes, rms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_block_publishes_nothing() {
        let mut analyser = SpectrumAnalyser::new(256);
        let rx = analyser.subscribe();
        analyser.push(&[0.5; 100]);
        assert!(rx.borrow().magnitudes.is_empty());
    }

    #[test]
    fn test_sine_peaks_at_its_bin() {
        let mut analyser = SpectrumAnalyser::new(256);
        let rx = analyser.subscribe();
        // Exactly 16 cycles per block lands on bin 16
        let sine: Vec<f32> = (0..256)
            .map(|i| (2.0 * std::f32::consts::PI * 16.0 * i as f32 / 256.0).sin())
            .collect();
        analyser.push(&sine);

        let frame = rx.borrow().clone();
        assert_eq!(frame.magnitudes.len(), 128);
        assert_eq!(frame.peak_bin(), Some(16));
        assert!((frame.rms - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.01);
    }

    #[test]
    fn test_silence_has_zero_level() {
        let mut analyser = SpectrumAnalyser::new(64);
        let rx = analyser.subscribe();
        analyser.push(&[0.0; 64]);
        let frame = rx.borrow().clone();
        assert_eq!(frame.rms, 0.0);
        assert!(frame.magnitudes.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_carries_remainder_between_pushes() {
        let mut analyser = SpectrumAnalyser::new(64);
        let rx = analyser.subscribe();
        analyser.push(&[0.5; 40]);
        assert!(rx.borrow().magnitudes.is_empty());
        analyser.push(&[0.5; 40]);
        assert!((rx.borrow().rms - 0.5).abs() < 1e-6);
    }
}
