//! Microphone gate — keeps the robot from hearing itself.
//!
//! Any noisy activity (TTS playback, wheel motors, servo gestures) holds the
//! gate while it runs. The capture loop treats a held gate as "the microphone
//! does not exist": frames are discarded before any buffering or VAD work.
//!
//! The gate is reference-counted, not exclusive: several activities may hold
//! it at once and the microphone reopens only when the last one releases.
//! Holders never queue — consumers only ever ask [`MicGate::available`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Shared reference-counted gate between noisy activities and the microphone.
///
/// Cloning shares state; the process owns exactly one gate and hands clones
/// to every component at construction.
#[derive(Debug, Clone, Default)]
pub struct MicGate {
    holders: Arc<Mutex<Vec<String>>>,
}

impl MicGate {
    /// Create a new gate with no holders (microphone available).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a noisy activity. The label is kept for diagnostics and must
    /// be passed back verbatim to [`MicGate::release`].
    pub fn acquire(&self, label: &str) {
        let mut holders = self.holders.lock();
        holders.push(label.to_string());
        debug!(label, holders = holders.len(), "mic gate acquired");
    }

    /// Release a previously registered activity.
    ///
    /// Releasing a label that is not held is a warned no-op — the count
    /// never goes negative.
    pub fn release(&self, label: &str) {
        let mut holders = self.holders.lock();
        match holders.iter().position(|h| h == label) {
            Some(idx) => {
                holders.remove(idx);
                debug!(label, holders = holders.len(), "mic gate released");
            }
            None => {
                warn!(label, "mic gate release without matching acquire");
            }
        }
    }

    /// True when no activity is holding the gate.
    #[must_use]
    pub fn available(&self) -> bool {
        self.holders.lock().is_empty()
    }

    /// Number of active holds.
    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.holders.lock().len()
    }

    /// Snapshot of the active holder labels, for diagnostics.
    #[must_use]
    pub fn holders(&self) -> Vec<String> {
        self.holders.lock().clone()
    }
}
