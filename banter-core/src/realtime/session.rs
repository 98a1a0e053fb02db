//! Shared session state for the realtime link.
//!
//! `SessionFlags` is the one place the connection state and the response
//! lifecycle flag live. The flag discipline enforced here is what prevents
//! duplicate response requests: `response_in_progress` is set when a
//! response starts (or is requested), and cleared only on done, on a remote
//! error, or when the link drops.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

/// Connection lifecycle of the realtime link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Shared flags, readable from every worker. Mutation goes through the
/// setters below so every transition is traced.
#[derive(Clone)]
pub struct SessionFlags {
    inner: Arc<FlagsInner>,
}

struct FlagsInner {
    state: Mutex<LinkState>,
    connected: AtomicBool,
    response_in_progress: AtomicBool,
    reconnect_attempt: AtomicU32,
    last_activity: Mutex<Instant>,
    responses_requested: AtomicU64,
    responses_finished: AtomicU64,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFlags {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FlagsInner {
                state: Mutex::new(LinkState::Disconnected),
                connected: AtomicBool::new(false),
                response_in_progress: AtomicBool::new(false),
                reconnect_attempt: AtomicU32::new(0),
                last_activity: Mutex::new(Instant::now()),
                responses_requested: AtomicU64::new(0),
                responses_finished: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.lock()
    }

    pub fn set_state(&self, state: LinkState) {
        let mut guard = self.inner.state.lock();
        if *guard != state {
            debug!(?state, "link state change");
            *guard = state;
        }
        self.inner
            .connected
            .store(state == LinkState::Connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    // ── Response lifecycle ───────────────────────────────────────────────

    pub fn response_in_progress(&self) -> bool {
        self.inner.response_in_progress.load(Ordering::Acquire)
    }

    /// Claim the right to request a response. Returns `false` if one is
    /// already in flight — the caller must not emit `response.create`.
    pub fn try_begin_response(&self) -> bool {
        let claimed = self
            .inner
            .response_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.inner.responses_requested.fetch_add(1, Ordering::Relaxed);
            debug!("response lifecycle: requested");
        }
        claimed
    }

    /// Mark a response as started remotely (idempotent with a prior claim).
    pub fn mark_response_started(&self) {
        if !self.inner.response_in_progress.swap(true, Ordering::AcqRel) {
            debug!("response lifecycle: started remotely");
        }
    }

    /// Clear the in-flight flag; `reason` names the terminal transition.
    pub fn clear_response(&self, reason: &str) {
        if self.inner.response_in_progress.swap(false, Ordering::AcqRel) {
            self.inner.responses_finished.fetch_add(1, Ordering::Relaxed);
            debug!(reason, "response lifecycle: cleared");
        }
    }

    // ── Reconnection bookkeeping ─────────────────────────────────────────

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.reconnect_attempt.load(Ordering::Relaxed)
    }

    pub fn bump_reconnect_attempt(&self) -> u32 {
        self.inner.reconnect_attempt.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_reconnect_attempt(&self) {
        let previous = self.inner.reconnect_attempt.swap(0, Ordering::Relaxed);
        if previous > 0 {
            info!(attempts = previous, "link recovered");
        }
    }

    // ── Idle tracking ────────────────────────────────────────────────────

    pub fn touch_activity(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().elapsed()
    }

    /// (requested, finished) counters, for diagnostics.
    pub fn response_counters(&self) -> (u64, u64) {
        (
            self.inner.responses_requested.load(Ordering::Relaxed),
            self.inner.responses_finished.load(Ordering::Relaxed),
        )
    }
}

/// Exponential backoff schedule: `initial`, doubled per attempt, capped.
/// Attempt numbering starts at 1 (the first retry waits `initial`).
pub fn reconnect_delay(attempt: u32, initial: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = initial.saturating_mul(1u32 << exp);
    delay.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIAL: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(30);

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(reconnect_delay(1, INITIAL, CAP), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2, INITIAL, CAP), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3, INITIAL, CAP), Duration::from_secs(4));
        assert_eq!(reconnect_delay(4, INITIAL, CAP), Duration::from_secs(8));
        assert_eq!(reconnect_delay(6, INITIAL, CAP), Duration::from_secs(30));
        assert_eq!(reconnect_delay(40, INITIAL, CAP), Duration::from_secs(30));
    }

    #[test]
    fn try_begin_response_claims_once() {
        let flags = SessionFlags::new();
        assert!(flags.try_begin_response());
        assert!(!flags.try_begin_response(), "second claim must fail");
        assert!(flags.response_in_progress());

        flags.clear_response("done");
        assert!(!flags.response_in_progress());
        assert!(flags.try_begin_response());
        assert_eq!(flags.response_counters(), (2, 1));
    }

    #[test]
    fn clear_is_idempotent() {
        let flags = SessionFlags::new();
        flags.mark_response_started();
        flags.clear_response("done");
        flags.clear_response("error");
        assert_eq!(flags.response_counters(), (0, 1));
    }

    #[test]
    fn state_tracks_connected() {
        let flags = SessionFlags::new();
        assert_eq!(flags.state(), LinkState::Disconnected);
        assert!(!flags.is_connected());

        flags.set_state(LinkState::Connecting);
        assert!(!flags.is_connected());

        flags.set_state(LinkState::Connected);
        assert!(flags.is_connected());

        flags.set_state(LinkState::Closing);
        assert!(!flags.is_connected());
    }

    #[test]
    fn reconnect_attempts_reset_on_recovery() {
        let flags = SessionFlags::new();
        assert_eq!(flags.bump_reconnect_attempt(), 1);
        assert_eq!(flags.bump_reconnect_attempt(), 2);
        flags.reset_reconnect_attempt();
        assert_eq!(flags.reconnect_attempt(), 0);
    }

    #[test]
    fn flags_clone_shares_state() {
        let flags = SessionFlags::new();
        let other = flags.clone();
        flags.mark_response_started();
        assert!(other.response_in_progress());
    }
}
