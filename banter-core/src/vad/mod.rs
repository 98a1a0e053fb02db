//! Voice Activity Detection (VAD) abstraction.
//!
//! The `VoiceActivityDetector` trait is the extensibility seam: the default
//! [`energy::EnergyVad`] is a plain loudness threshold, and anything smarter
//! can be swapped in without touching the capture loop. Silence counting,
//! minimum-utterance and cooldown policy all live in the capture loop's
//! utterance tracker — a detector only judges single frames.

pub mod energy;

use crate::buffering::frame::AudioFrame;

/// Whether a single frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful; the capture loop calls `reset` whenever an
/// utterance is abandoned (gate closed, too short, cooldown).
pub trait VoiceActivityDetector: Send + 'static {
    /// Judge one frame. The frame's `sample_rate` must match whatever rate
    /// the detector was configured for.
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision;

    /// Drop any internal state.
    fn reset(&mut self);
}
