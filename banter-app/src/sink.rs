//! Hardware playback sink backed by rodio.

use banter_core::error::{BanterError, Result};
use banter_core::playback::PlaybackSink;

/// Plays assembled WAV artifacts on the default output device.
///
/// `rodio::OutputStream` is bound to the thread that creates it, so the
/// stream is opened per utterance inside `play` (which already runs on a
/// blocking thread). Robot speech is sparse; the open cost does not matter.
#[derive(Debug, Default)]
pub struct RodioSink;

impl RodioSink {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl PlaybackSink for RodioSink {
    fn play(&self, wav: &[u8], _sample_rate: u32, _channels: u16) -> Result<()> {
        let (_stream, handle) = rodio::OutputStream::try_default()
            .map_err(|e| BanterError::Playback(format!("output device: {e}")))?;
        let sink = rodio::Sink::try_new(&handle)
            .map_err(|e| BanterError::Playback(format!("sink: {e}")))?;

        let decoder = rodio::Decoder::new(std::io::Cursor::new(wav.to_vec()))
            .map_err(|e| BanterError::Playback(format!("decode wav: {e}")))?;
        sink.append(decoder);

        // Block until the speaker is done — the caller releases the mic
        // gate right after this returns.
        sink.sleep_until_end();
        Ok(())
    }
}
