//! # banter-core
//!
//! Realtime interaction substrate for an embodied conversational robot.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → MicCapture → SPSC ring → capture loop (VAD + commit protocol)
//!                                            │ gate check first, always
//!                                            ▼
//!                     RealtimeLink ⇄ remote voice API (duplex WebSocket)
//!                          │ events, in registration order
//!            ┌─────────────┼──────────────┐
//!          STT node   Cognition node   TTS node
//!            │             │              │ assemble WAV → PlaybackSink
//!            └──────── MessageBus ────────┘
//!                 (declared topics, bounded mailboxes)
//! ```
//!
//! The robot never hears itself: every noisy activity holds the [`gate::MicGate`]
//! and the capture loop discards audio at its earliest read point while the
//! gate is held. Duplicate response requests are prevented by the single
//! `response_in_progress` flag on the realtime session.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod bus;
pub mod capture;
pub mod error;
pub mod gate;
pub mod node;
pub mod nodes;
pub mod playback;
pub mod realtime;
pub mod vad;

// Convenience re-exports for downstream crates
pub use bus::MessageBus;
pub use capture::{CaptureConfig, CaptureManager};
pub use error::BanterError;
pub use gate::MicGate;
pub use node::NodeConfig;
pub use playback::PlaybackSink;
pub use realtime::{RealtimeConfig, RealtimeHandle, RealtimeLink};
