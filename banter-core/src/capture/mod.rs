//! `CaptureManager` — lifecycle controller for the microphone side.
//!
//! ## Lifecycle
//!
//! ```text
//! CaptureManager::new()
//!     └─► start()   → device open confirmed, loop spawned, status = Listening
//!         └─► stop() → running = false, stream dropped, status = Stopped
//! ```
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send`, so the device is opened *inside* the
//! `spawn_blocking` closure that also runs the capture loop; a sync oneshot
//! channel reports the open result (and the device's real sample rate) back
//! to `start()`.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    audio::{DeviceSelector, MicCapture},
    buffering::create_capture_ring,
    error::{BanterError, Result},
    gate::MicGate,
    realtime::RealtimeHandle,
    vad::energy::EnergyVad,
};
use self::pipeline::{CaptureActivityEvent, CaptureDiagnostics, CaptureSnapshot};

/// Activity broadcast capacity.
const ACTIVITY_CAP: usize = 256;

/// Tunables for the capture subsystem. Every knob is enumerated — there are
/// no dynamic keys.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Session sample rate (Hz). The remote speaks 24 kHz PCM16.
    pub sample_rate: u32,
    /// Samples per processed frame: 4800 ≈ 200 ms at 24 kHz.
    pub chunk_samples: usize,
    /// Samples popped from the ring per poll, at the device rate.
    pub drain_samples: usize,
    /// VAD loudness threshold on the normalized 0–1 RMS scale.
    pub vad_threshold: f32,
    /// Consecutive silent frames that end an utterance.
    pub vad_silence_frames: u32,
    /// Utterances shorter than this are discarded silently.
    pub min_speech_duration: Duration,
    /// Absolute spacing between commits, measured from the last commit.
    pub commit_cooldown: Duration,
    /// Flush a partial frame after this long while speech is active.
    pub idle_flush: Duration,
    /// Read pause right before a commit goes out.
    pub commit_pause: Duration,
    /// Software gain applied before VAD, clamped to ≤ 2× (hardware gain
    /// preferred).
    pub software_gain: f32,
    /// Which input device to open.
    pub device: DeviceSelector,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            chunk_samples: 4_800,
            drain_samples: 4_096,
            vad_threshold: 0.08,
            vad_silence_frames: 10,
            min_speech_duration: Duration::from_millis(300),
            commit_cooldown: Duration::from_millis(500),
            idle_flush: Duration::from_millis(200),
            commit_pause: Duration::from_millis(50),
            software_gain: 1.0,
            device: DeviceSelector::Default,
        }
    }
}

/// Coarse state of the capture subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Idle,
    Listening,
    Stopped,
    Error,
}

/// Owns the microphone worker. `Send + Sync` — all fields use interior
/// mutability, so wrap in `Arc` and share freely.
pub struct CaptureManager {
    config: CaptureConfig,
    gate: MicGate,
    realtime: RealtimeHandle,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<CaptureStatus>>,
    activity_tx: broadcast::Sender<CaptureActivityEvent>,
    diagnostics: Arc<CaptureDiagnostics>,
}

impl CaptureManager {
    pub fn new(config: CaptureConfig, gate: MicGate, realtime: RealtimeHandle) -> Self {
        let (activity_tx, _) = broadcast::channel(ACTIVITY_CAP);
        Self {
            config,
            gate,
            realtime,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(CaptureStatus::Idle)),
            activity_tx,
            diagnostics: Arc::new(CaptureDiagnostics::default()),
        }
    }

    /// Open the device and start the capture loop.
    ///
    /// Blocks until the device is confirmed open (or failed). A device open
    /// failure is fatal for the capture node: status becomes `Error` and the
    /// node reports unhealthy.
    ///
    /// # Errors
    /// `AlreadyRunning` when started twice; device errors from cpal.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(BanterError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);
        *self.status.lock() = CaptureStatus::Listening;

        let (producer, consumer) = create_capture_ring();

        let config = self.config.clone();
        let gate = self.gate.clone();
        let realtime = self.realtime.clone();
        let running = Arc::clone(&self.running);
        let status = Arc::clone(&self.status);
        let activity_tx = self.activity_tx.clone();
        let diagnostics = Arc::clone(&self.diagnostics);

        // Sync oneshot: the blocking task reports device open success (with
        // the actual capture rate) or failure.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        tokio::task::spawn_blocking(move || {
            let capture =
                match MicCapture::open(producer, Arc::clone(&running), &config.device) {
                    Ok(c) => {
                        let _ = open_tx.send(Ok(c.sample_rate));
                        c
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };

            let capture_sample_rate = capture.sample_rate;
            let vad = Box::new(EnergyVad::new(config.vad_threshold));

            pipeline::run(pipeline::PipelineContext {
                config,
                vad,
                consumer,
                running: Arc::clone(&running),
                gate,
                realtime,
                activity_tx,
                diagnostics,
                capture_sample_rate,
            });

            *status.lock() = CaptureStatus::Stopped;
            // The stream drops here, releasing the device on this thread.
            drop(capture);
        });

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(capture_rate = rate, "capture started — listening");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                *self.status.lock() = CaptureStatus::Error;
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                *self.status.lock() = CaptureStatus::Error;
                Err(BanterError::Other(anyhow::anyhow!(
                    "capture task died before confirming device open"
                )))
            }
        }
    }

    /// Signal the loop to stop. The device is released by the worker.
    ///
    /// # Errors
    /// `NotRunning` if capture is not active.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BanterError::NotRunning);
        }
        self.running.store(false, Ordering::SeqCst);
        info!("capture stop requested");
        Ok(())
    }

    pub fn status(&self) -> CaptureStatus {
        *self.status.lock()
    }

    /// Capture is healthy while it is listening or cleanly idle/stopped.
    pub fn healthy(&self) -> bool {
        !matches!(self.status(), CaptureStatus::Error)
    }

    /// Subscribe to live RMS/VAD/gate activity.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<CaptureActivityEvent> {
        self.activity_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> CaptureSnapshot {
        self.diagnostics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_session_contract() {
        let config = CaptureConfig::default();
        assert_eq!(config.sample_rate, 24_000);
        assert_eq!(config.chunk_samples, 4_800);
        assert_eq!(config.vad_silence_frames, 10);
        assert_eq!(config.min_speech_duration, Duration::from_millis(300));
        assert_eq!(config.commit_cooldown, Duration::from_millis(500));
        assert!((config.vad_threshold - 0.08).abs() < 1e-6);
    }

    #[tokio::test]
    async fn stop_before_start_is_an_error() {
        let manager = CaptureManager::new(
            CaptureConfig::default(),
            MicGate::new(),
            RealtimeHandle::detached(),
        );
        assert!(matches!(manager.stop(), Err(BanterError::NotRunning)));
        assert_eq!(manager.status(), CaptureStatus::Idle);
        assert!(manager.healthy());
    }
}
