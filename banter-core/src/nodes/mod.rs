//! The three conversation nodes and their supporting pieces.
//!
//! Each node follows the same load shape: validate the declarative config,
//! register on the bus, resolve bus handlers by name, register realtime
//! handlers, spawn the mailbox worker. Anything that fails mid-load undoes
//! the registrations it already made.

pub mod cognition;
pub mod direct;
pub mod stt;
pub mod tools;
pub mod tts;

pub use cognition::{CognitionNode, CognitionOptions};
pub use stt::{SttNode, SttOptions};
pub use tts::{TtsNode, TtsOptions};
