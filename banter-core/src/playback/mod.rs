//! Audio playback assembly — streamed response chunks → one WAV artifact.
//!
//! The remote streams base64 PCM16 deltas per response item. The assembler
//! buffers them under a lock, keyed by item id, and only ever hands off
//! audio for items whose `audio.done` has been observed — a partial buffer
//! is never played. The actual hardware handoff goes through the
//! [`PlaybackSink`] trait; the sink must block (or call back) on completion
//! so the mic gate can be released at the right moment.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{BanterError, Result};
use crate::realtime::protocol::decode_audio_payload;

/// Hardware handoff seam. Implementations are device-specific (rodio, a DAC
/// daemon, a test recorder) and must not return until playback finished.
pub trait PlaybackSink: Send + Sync {
    /// Play one complete WAV artifact. Blocks until done.
    fn play(&self, wav: &[u8], sample_rate: u32, channels: u16) -> Result<()>;
}

struct ItemBuffer {
    samples: Vec<i16>,
    closed: bool,
}

#[derive(Default)]
struct AssemblerInner {
    /// Item buffers in arrival order (`Vec` keeps harvest deterministic).
    order: Vec<String>,
    items: HashMap<String, ItemBuffer>,
}

/// Accumulates one response's audio item streams.
#[derive(Default)]
pub struct ResponseAssembler {
    inner: Mutex<AssemblerInner>,
}

impl ResponseAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and append one audio delta for `item_id`.
    ///
    /// # Errors
    /// `BanterError::Protocol` when the payload is not valid base64 PCM16.
    pub fn append_delta(&self, item_id: &str, payload_b64: &str) -> Result<usize> {
        let samples = decode_audio_payload(payload_b64)?;
        let appended = samples.len();

        let mut inner = self.inner.lock();
        let AssemblerInner { order, items } = &mut *inner;
        let item = items.entry(item_id.to_string()).or_insert_with(|| {
            order.push(item_id.to_string());
            ItemBuffer {
                samples: Vec::new(),
                closed: false,
            }
        });
        if item.closed {
            warn!(item_id, "audio delta after audio done — ignored");
            return Ok(0);
        }
        item.samples.extend_from_slice(&samples);
        Ok(appended)
    }

    /// Mark an item's audio stream complete.
    pub fn finish_item(&self, item_id: &str) {
        let mut inner = self.inner.lock();
        match inner.items.get_mut(item_id) {
            Some(item) => {
                item.closed = true;
                debug!(item_id, samples = item.samples.len(), "audio item closed");
            }
            None => warn!(item_id, "audio done for unknown item"),
        }
    }

    /// Harvest at response end: concatenated samples of the **closed** items
    /// in arrival order. Items still open are discarded with a warning —
    /// their `audio.done` never arrived, so they must not be played.
    /// Returns `None` when the response produced no playable audio.
    pub fn harvest(&self) -> Option<Vec<i16>> {
        let mut inner = self.inner.lock();
        let order = std::mem::take(&mut inner.order);
        let mut items = std::mem::take(&mut inner.items);

        let mut samples = Vec::new();
        for item_id in order {
            let Some(item) = items.remove(&item_id) else {
                continue;
            };
            if !item.closed {
                warn!(
                    item_id = item_id.as_str(),
                    dropped_samples = item.samples.len(),
                    "response finished with an open audio item — discarded"
                );
                continue;
            }
            samples.extend_from_slice(&item.samples);
        }

        if samples.is_empty() {
            None
        } else {
            Some(samples)
        }
    }

    /// Drop every buffer (remote error, disconnect).
    pub fn discard_all(&self) {
        let mut inner = self.inner.lock();
        let dropped: usize = inner.items.values().map(|i| i.samples.len()).sum();
        if dropped > 0 {
            debug!(dropped_samples = dropped, "discarding buffered response audio");
        }
        inner.order.clear();
        inner.items.clear();
    }

    pub fn buffered_items(&self) -> usize {
        self.inner.lock().items.len()
    }
}

/// Assemble PCM16 samples into an in-memory WAV (mono, 16-bit).
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| BanterError::Playback(format!("wav writer: {e}")))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| BanterError::Playback(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| BanterError::Playback(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn b64_samples(samples: &[i16]) -> String {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        BASE64.encode(bytes)
    }

    #[test]
    fn deltas_accumulate_per_item_in_order() {
        let assembler = ResponseAssembler::new();
        assembler.append_delta("item-a", &b64_samples(&[1, 2])).unwrap();
        assembler.append_delta("item-a", &b64_samples(&[3])).unwrap();
        assembler.finish_item("item-a");

        let samples = assembler.harvest().expect("audio present");
        assert_eq!(samples, vec![1, 2, 3]);
    }

    #[test]
    fn open_items_are_never_harvested() {
        let assembler = ResponseAssembler::new();
        assembler.append_delta("closed", &b64_samples(&[7])).unwrap();
        assembler.finish_item("closed");
        assembler.append_delta("open", &b64_samples(&[9, 9])).unwrap();
        // No finish_item for "open": its audio.done never arrived.

        let samples = assembler.harvest().expect("closed item plays");
        assert_eq!(samples, vec![7]);
    }

    #[test]
    fn fully_open_response_yields_nothing() {
        let assembler = ResponseAssembler::new();
        assembler.append_delta("open", &b64_samples(&[1])).unwrap();
        assert!(assembler.harvest().is_none());
        // Harvest consumed the state either way.
        assert_eq!(assembler.buffered_items(), 0);
    }

    #[test]
    fn late_delta_after_done_is_ignored() {
        let assembler = ResponseAssembler::new();
        assembler.append_delta("item", &b64_samples(&[5])).unwrap();
        assembler.finish_item("item");
        let appended = assembler.append_delta("item", &b64_samples(&[6])).unwrap();
        assert_eq!(appended, 0);
        assert_eq!(assembler.harvest().unwrap(), vec![5]);
    }

    #[test]
    fn discard_all_clears_buffers() {
        let assembler = ResponseAssembler::new();
        assembler.append_delta("item", &b64_samples(&[1, 2, 3])).unwrap();
        assembler.discard_all();
        assert_eq!(assembler.buffered_items(), 0);
        assert!(assembler.harvest().is_none());
    }

    #[test]
    fn bad_base64_is_a_protocol_error() {
        let assembler = ResponseAssembler::new();
        let err = assembler.append_delta("item", "!!!").unwrap_err();
        assert!(matches!(err, BanterError::Protocol(_)));
    }

    #[test]
    fn encoded_wav_parses_back_with_expected_spec() {
        let samples: Vec<i16> = (0..4800).map(|i| (i % 128) as i16).collect();
        let wav = encode_wav(&samples, 24_000).unwrap();

        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 24_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 4800);
    }

    #[test]
    fn empty_wav_is_still_valid() {
        let wav = encode_wav(&[], 24_000).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.len(), 0);
    }
}
