//! Typed audio frame passed from the capture ring to the VAD and the wire.
//!
//! The remote session speaks PCM16 LE mono at 24 kHz; everything local works
//! in f32 `[-1, 1]`. Conversion clamps to `[-1, 1]`, scales by 32767 and
//! rounds toward zero.

/// A contiguous block of mono samples at a known sample rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square loudness, normalized to [0, 1] for full-scale input.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// Encode to little-endian PCM16 bytes for the wire.
    pub fn to_pcm16_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            out.extend_from_slice(&f32_to_pcm16(sample).to_le_bytes());
        }
        out
    }
}

/// Root-mean-square of a sample slice. Empty input is silent.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Clamp to [-1, 1], scale by 32767, round toward zero.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).trunc() as i16
}

/// Decode little-endian PCM16 bytes back to i16 samples.
/// A trailing odd byte is ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rms_of_square_wave() {
        let samples: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        assert_abs_diff_eq!(rms(&samples), 0.5, epsilon = 1e-5);
    }

    #[test]
    fn rms_of_empty_is_zero() {
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn pcm16_clamps_out_of_range() {
        assert_eq!(f32_to_pcm16(2.0), 32767);
        assert_eq!(f32_to_pcm16(-2.0), -32767);
    }

    #[test]
    fn pcm16_rounds_toward_zero() {
        // 0.5 * 32767 = 16383.5 → truncates to 16383
        assert_eq!(f32_to_pcm16(0.5), 16383);
        assert_eq!(f32_to_pcm16(-0.5), -16383);
        assert_eq!(f32_to_pcm16(0.0), 0);
    }

    #[test]
    fn frame_bytes_round_trip() {
        let frame = AudioFrame::new(vec![0.0, 0.25, -0.25, 1.0], 24_000);
        let bytes = frame.to_pcm16_bytes();
        assert_eq!(bytes.len(), 8);
        let decoded = pcm16_from_le_bytes(&bytes);
        assert_eq!(decoded, vec![0, 8191, -8191, 32767]);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let decoded = pcm16_from_le_bytes(&[0x01, 0x00, 0xff]);
        assert_eq!(decoded, vec![1]);
    }

    #[test]
    fn duration_at_24khz() {
        let frame = AudioFrame::new(vec![0.0; 4800], 24_000);
        assert_abs_diff_eq!(frame.duration_secs(), 0.2, epsilon = 1e-9);
    }
}
