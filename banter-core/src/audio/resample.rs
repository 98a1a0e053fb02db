//! Sample-rate conversion from the device rate to the session rate.
//!
//! cpal captures at whatever the hardware reports (commonly 44.1 or 48 kHz);
//! the remote session wants 24 kHz mono. `RateAdapter` bridges the two on
//! the capture loop thread, where allocation is allowed. When the rates
//! already match it is a passthrough and no rubato session exists.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{BanterError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateAdapter {
    /// `None` when source rate == target rate.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls — rubato consumes fixed blocks.
    pending: Vec<f32>,
    /// Input samples rubato consumes per process call.
    block: usize,
    /// Pre-allocated `[1][output_frames_max]` output buffer.
    out_buf: Vec<Vec<f32>>,
}

impl RateAdapter {
    /// # Errors
    /// `BanterError::AudioDevice` if rubato refuses the ratio.
    pub fn new(source_rate: u32, target_rate: u32, block: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block,
                out_buf: Vec::new(),
            });
        }

        let ratio = f64::from(target_rate) / f64::from(source_rate);
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, block, 1)
            .map_err(|e| BanterError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::info!(source_rate, target_rate, block, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            block,
            out_buf: vec![vec![0f32; max_out]],
        })
    }

    /// Feed samples; returns whatever full blocks produced (possibly empty).
    /// Remainder smaller than one block is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut result = Vec::new();

        while self.pending.len() >= self.block {
            let input = &self.pending[..self.block];
            match resampler.process_into_buffer(&[input], &mut self.out_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.out_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..self.block);
        }

        result
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
