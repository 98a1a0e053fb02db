//! TTS node — assembles streamed response audio and hands it to the sink.
//!
//! Gate choreography is the delicate part: the `"speaking"` hold is taken
//! exactly once per response, at the first audio delta — before any of our
//! own audio can reach the speaker, so the microphone is already gated when
//! sound comes out — and released exactly once, after the sink reports
//! completion (or on the error paths). The `mutex_acquired` flag guarding
//! the pair is explicitly initialized to `false` at node construction.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::bus::{topics, BusBinding, MessageBus};
use crate::error::Result;
use crate::gate::MicGate;
use crate::node::{DispatchTable, NodeConfig, NodeHandle, NodeHealth};
use crate::playback::{encode_wav, PlaybackSink, ResponseAssembler};
use crate::realtime::{
    protocol::{EventKind, ServerEvent},
    RealtimeHandle,
};

const SPEAKING_LABEL: &str = "speaking";

/// Typed options for the TTS node. Unknown keys fail the load.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TtsOptions {
    /// Sample rate of the assembled WAV (the remote streams 24 kHz).
    pub sample_rate: u32,
    /// Attach the spoken text to the end-of-speech status event.
    pub announce_text: bool,
}

impl Default for TtsOptions {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            announce_text: true,
        }
    }
}

struct TtsState {
    /// Guards the acquire/release pair. One hold per response, never more.
    mutex_acquired: bool,
    /// Text of the response being spoken, for the status event.
    last_text: Option<String>,
}

struct TtsShared {
    assembler: ResponseAssembler,
    state: Mutex<TtsState>,
    gate: MicGate,
    binding: BusBinding,
    options: TtsOptions,
}

impl TtsShared {
    fn publish_speaking(&self, speaking: bool, text: Option<String>) {
        let status = topics::SpeakingStatus { speaking, text };
        if let Err(e) = self.binding.publish(topics::SPEAKING_STATUS, &status) {
            warn!("speaking status publish failed: {e}");
        }
    }

    /// Release the hold if this response took it; safe on every error path.
    fn release_if_held(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.mutex_acquired {
            state.mutex_acquired = false;
            let text = state.last_text.take();
            drop(state);
            self.gate.release(SPEAKING_LABEL);
            debug!(reason, "speaking hold released");
            self.publish_speaking(false, if self.options.announce_text { text } else { None });
        }
    }
}

pub struct TtsNode;

impl TtsNode {
    pub fn default_config() -> NodeConfig {
        NodeConfig::new("tts").publish(topics::SPEAKING_STATUS)
    }

    pub fn load(
        config: &NodeConfig,
        bus: &MessageBus,
        realtime: &RealtimeHandle,
        gate: &MicGate,
        sink: Arc<dyn PlaybackSink>,
    ) -> Result<NodeHandle> {
        config.validate()?;
        let options: TtsOptions = config.options_as()?;
        config.require_publish(topics::SPEAKING_STATUS)?;

        let binding = bus.register_node(&config.bus_spec())?;
        let health = Arc::new(NodeHealth::default());

        let shared = Arc::new(TtsShared {
            assembler: ResponseAssembler::new(),
            state: Mutex::new(TtsState {
                mutex_acquired: false,
                last_text: None,
            }),
            gate: gate.clone(),
            binding: binding.clone(),
            options,
        });

        let mut tokens = Vec::new();

        // ── Audio stream ─────────────────────────────────────────────────
        let delta_shared = Arc::clone(&shared);
        tokens.push(realtime.register_handler(EventKind::ResponseAudioDelta, move |event| {
            let ServerEvent::ResponseAudioDelta { item_id, delta } = event else {
                return;
            };
            {
                let mut state = delta_shared.state.lock();
                if !state.mutex_acquired {
                    // First audio of this response: gate the mic before any
                    // of it can be played back.
                    delta_shared.gate.acquire(SPEAKING_LABEL);
                    state.mutex_acquired = true;
                    drop(state);
                    delta_shared.publish_speaking(true, None);
                }
            }
            if let Err(e) = delta_shared.assembler.append_delta(item_id, delta) {
                warn!(item_id = item_id.as_str(), "bad audio delta: {e}");
            }
        }));

        let done_shared = Arc::clone(&shared);
        tokens.push(realtime.register_handler(EventKind::ResponseAudioDone, move |event| {
            if let ServerEvent::ResponseAudioDone { item_id } = event {
                done_shared.assembler.finish_item(item_id);
            }
        }));

        let text_shared = Arc::clone(&shared);
        tokens.push(realtime.register_handler(EventKind::ResponseTextDone, move |event| {
            if let ServerEvent::ResponseTextDone { text, .. } = event {
                text_shared.state.lock().last_text = Some(text.clone());
            }
        }));

        // ── Response end → assemble + play ───────────────────────────────
        let finish_shared = Arc::clone(&shared);
        let finish_sink = Arc::clone(&sink);
        tokens.push(realtime.register_handler(EventKind::ResponseDone, move |_| {
            let Some(samples) = finish_shared.assembler.harvest() else {
                // Nothing playable (text-only response, or every item stayed
                // open). Balance the hold if the first delta took it.
                finish_shared.release_if_held("no playable audio");
                return;
            };

            let sample_rate = finish_shared.options.sample_rate;
            let wav = match encode_wav(&samples, sample_rate) {
                Ok(wav) => wav,
                Err(e) => {
                    warn!("wav assembly failed: {e}");
                    finish_shared.release_if_held("wav assembly failed");
                    return;
                }
            };

            info!(
                samples = samples.len(),
                bytes = wav.len(),
                "handing response audio to playback sink"
            );

            // The sink blocks until the speaker is done; keep that off the
            // dispatch path and release the hold when it returns.
            let task_shared = Arc::clone(&finish_shared);
            let task_sink = Arc::clone(&finish_sink);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = task_sink.play(&wav, sample_rate, 1) {
                    warn!("playback sink failed: {e}");
                }
                task_shared.release_if_held("playback complete");
            });
        }));

        // ── Error paths: discard buffers, balance the hold ───────────────
        let error_shared = Arc::clone(&shared);
        tokens.push(realtime.register_handler(EventKind::Error, move |_| {
            error_shared.assembler.discard_all();
            error_shared.release_if_held("remote error");
        }));

        let closed_shared = Arc::clone(&shared);
        tokens.push(realtime.register_handler(EventKind::ConnectionClosed, move |_| {
            closed_shared.assembler.discard_all();
            closed_shared.release_if_held("connection closed");
        }));

        // ── Bus subscriptions (this node resolves none) ──────────────────
        let dispatch = DispatchTable::new();
        dispatch.verify_covers(config)?;

        Ok(NodeHandle::spawn(
            &config.name,
            bus.clone(),
            Arc::clone(binding.mailbox()),
            dispatch,
            health,
            Some(realtime.clone()),
            tokens,
        ))
    }
}
