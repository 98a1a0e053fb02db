//! Lock-free SPSC ring buffer for microphone samples.
//!
//! `ringbuf::HeapRb<f32>` gives a wait-free `push_slice` that is safe to call
//! from the real-time audio callback.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half — held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half — held by the capture loop.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Ring capacity: 2^20 = 1 048 576 f32 samples ≈ 43.7 s at 24 kHz.
/// Covers the commit pause and a stalled outbound stream without the
/// callback ever dropping frames.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_capture_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
