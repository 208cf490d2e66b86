//! # Downmix and Streaming Resampler
//!
//! Audio devices rarely run at the rates the protocol needs (16 kHz in,
//! 24 kHz out). This module converts between a device's native layout and
//! the fixed protocol rates.
//!
//! ## Streaming:
//! Audio arrives in small device blocks (often 10ms or less). A resampler
//! that restarted on every block would drop or duplicate a sample at each
//! block boundary, which is audible as clicks. `LinearResampler` therefore
//! carries the fractional read position and the last input sample across
//! calls, so the output of N consecutive blocks is identical to resampling
//! their concatenation.

/// Average interleaved frames down to a single channel.
///
/// ## Parameters:
/// - **data**: interleaved samples (`[L, R, L, R, ...]` for stereo)
/// - **channels**: number of interleaved channels (0 or 1 returns a copy)
pub fn downmix_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler that keeps its phase across blocks.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    /// Input samples advanced per output sample
    step: f64,
    /// Read position relative to the start of the next block. Negative values
    /// point into the previous block (only -1.0 < pos < 0.0 is possible, which
    /// interpolates between `last` and the first new sample).
    pos: f64,
    /// Last input sample of the previous block
    last: Option<f32>,
}

impl LinearResampler {
    /// Create a resampler converting `from_rate` Hz to `to_rate` Hz.
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let from = from_rate.max(1);
        let to = to_rate.max(1);
        Self {
            from_rate: from,
            to_rate: to,
            step: from as f64 / to as f64,
            pos: 0.0,
            last: None,
        }
    }

    /// Whether this resampler is a no-op.
    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Forget the carried phase, e.g. after playback was flushed.
    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.last = None;
    }

    /// Resample one block of mono samples.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let len = input.len() as f64;
        let expected = ((len - self.pos) / self.step).ceil().max(0.0) as usize;
        let mut output = Vec::with_capacity(expected + 1);

        // Interpolating at `pos` needs the samples at floor(pos) and floor(pos)+1,
        // so stop once the right-hand neighbour is not in this block yet.
        while self.pos <= len - 1.0 {
            let sample = if self.pos < 0.0 {
                // Between the previous block's last sample and input[0]
                let frac = (self.pos + 1.0) as f32;
                let prev = self.last.unwrap_or(input[0]);
                prev * (1.0 - frac) + input[0] * frac
            } else {
                let idx = self.pos.floor() as usize;
                let frac = (self.pos - idx as f64) as f32;
                let next = input.get(idx + 1).copied().unwrap_or(input[idx]);
                input[idx] * (1.0 - frac) + next * frac
            };
            output.push(sample);
            self.pos += self.step;
        }

        // Re-base the read position onto the next block
        self.pos -= len;
        self.last = input.last().copied();
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix_to_mono(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn test_passthrough_when_rates_match() {
        let mut resampler = LinearResampler::new(16000, 16000);
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&[0.1, 0.2, 0.3]), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_downsample_length_tracks_ratio_across_blocks() {
        // 48kHz -> 16kHz, 100 blocks of 480 samples (10ms each) = 1s
        let mut resampler = LinearResampler::new(48000, 16000);
        let block = vec![0.25f32; 480];
        let total: usize = (0..100).map(|_| resampler.process(&block).len()).sum();
        assert!((15_990..=16_010).contains(&total), "got {}", total);
    }

    #[test]
    fn test_upsample_length_tracks_ratio_across_blocks() {
        // 24kHz -> 48kHz, uneven block sizes
        let mut resampler = LinearResampler::new(24000, 48000);
        let sizes = [100usize, 333, 17, 550, 1000];
        let input_total: usize = sizes.iter().sum();
        let total: usize = sizes
            .iter()
            .map(|&n| resampler.process(&vec![0.0; n]).len())
            .sum();
        let expected = input_total * 2;
        assert!(total + 2 >= expected && total <= expected + 2, "got {}", total);
    }

    #[test]
    fn test_block_boundaries_are_continuous() {
        // A ramp resampled in pieces must equal the ramp resampled at once
        let ramp: Vec<f32> = (0..960).map(|i| i as f32 / 960.0).collect();

        let mut whole = LinearResampler::new(48000, 16000);
        let expected = whole.process(&ramp);

        let mut pieces = LinearResampler::new(48000, 16000);
        let mut actual = Vec::new();
        for chunk in ramp.chunks(97) {
            actual.extend(pieces.process(chunk));
        }

        assert_eq!(actual.len(), expected.len());
        for (a, b) in actual.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_reset_drops_carried_phase() {
        let mut resampler = LinearResampler::new(24000, 44100);
        resampler.process(&[0.5; 101]);
        resampler.reset();
        let mut fresh = LinearResampler::new(24000, 44100);
        assert_eq!(resampler.process(&[0.1; 64]), fresh.process(&[0.1; 64]));
    }
}
