//! STT node — turns remote transcription events into `voice_command`s and
//! translates robot activity into microphone holds.
//!
//! Transcript deltas accumulate per conversation (item) id; the completed
//! transcript wins over the accumulation. `navigation_status` drives a
//! symmetric `"moving"` gate hold. `speaking_status` is turned into the
//! `listening_status` indicator (the `"speaking"` hold itself belongs to
//! the TTS node, which owns that activity in-process).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::bus::{topics, MessageBus};
use crate::error::Result;
use crate::gate::MicGate;
use crate::node::{DispatchTable, NodeConfig, NodeHandle, NodeHealth};
use crate::nodes::direct::DirectCommandFilter;
use crate::realtime::{
    protocol::{EventKind, ServerEvent},
    RealtimeHandle,
};

/// Typed options for the STT node. Unknown keys fail the load.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SttOptions {
    /// Route trivial literal commands straight to `robot_action`,
    /// bypassing the model. Off by default.
    pub direct_commands: bool,
    /// Confidence reported when the remote transcription carries none.
    pub default_confidence: f32,
}

impl Default for SttOptions {
    fn default() -> Self {
        Self {
            direct_commands: false,
            default_confidence: 1.0,
        }
    }
}

pub struct SttNode;

impl SttNode {
    /// Default declarative config for this node.
    pub fn default_config() -> NodeConfig {
        NodeConfig::new("stt")
            .publish(topics::VOICE_COMMAND)
            .publish(topics::LISTENING_STATUS)
            .subscribe(topics::SPEAKING_STATUS, "on_speaking_status")
            .subscribe(topics::NAVIGATION_STATUS, "on_navigation_status")
    }

    /// Validate, register, resolve handlers, and start the worker.
    pub fn load(
        config: &NodeConfig,
        bus: &MessageBus,
        realtime: &RealtimeHandle,
        gate: &MicGate,
    ) -> Result<NodeHandle> {
        config.validate()?;
        let options: SttOptions = config.options_as()?;
        config.require_publish(topics::VOICE_COMMAND)?;
        config.require_publish(topics::LISTENING_STATUS)?;
        if options.direct_commands {
            config.require_publish(topics::ROBOT_ACTION)?;
        }

        let binding = bus.register_node(&config.bus_spec())?;
        let health = Arc::new(NodeHealth::default());

        // ── Remote transcription events ──────────────────────────────────
        let accumulator: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut tokens = Vec::new();

        let accum_delta = Arc::clone(&accumulator);
        tokens.push(realtime.register_handler(EventKind::TranscriptionDelta, move |event| {
            if let ServerEvent::TranscriptionDelta { item_id, delta } = event {
                accum_delta
                    .lock()
                    .entry(item_id.clone())
                    .or_default()
                    .push_str(delta);
            }
        }));

        let accum_done = Arc::clone(&accumulator);
        let publish_binding = binding.clone();
        let filter = DirectCommandFilter::new();
        let done_options = options.clone();
        tokens.push(realtime.register_handler(
            EventKind::TranscriptionCompleted,
            move |event| {
                let ServerEvent::TranscriptionCompleted { item_id, transcript } = event else {
                    return;
                };
                let accumulated = accum_done.lock().remove(item_id).unwrap_or_default();
                let text = if transcript.trim().is_empty() {
                    accumulated
                } else {
                    transcript.clone()
                };
                let text = text.trim().to_string();
                if text.is_empty() {
                    debug!(item_id = item_id.as_str(), "empty transcript — nothing to publish");
                    return;
                }

                if done_options.direct_commands {
                    if let Some(action) = filter.match_command(&text) {
                        info!(text = text.as_str(), "direct command bypass");
                        if let Err(e) = publish_binding.publish_correlated(
                            topics::ROBOT_ACTION,
                            &action,
                            item_id,
                        ) {
                            warn!("direct command publish failed: {e}");
                        }
                        return;
                    }
                }

                let command = topics::VoiceCommand {
                    text,
                    confidence: done_options.default_confidence,
                    timestamp: Utc::now(),
                    conversation_id: item_id.clone(),
                };
                info!(
                    conversation_id = item_id.as_str(),
                    chars = command.text.len(),
                    "voice command"
                );
                if let Err(e) =
                    publish_binding.publish_correlated(topics::VOICE_COMMAND, &command, item_id)
                {
                    warn!("voice command publish failed: {e}");
                }
            },
        ));

        // ── Bus subscriptions, resolved by handler name ──────────────────
        let moving_held = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut dispatch = DispatchTable::new();

        for decl in &config.subscribes {
            match decl.handler.as_str() {
                "on_speaking_status" => {
                    let status_binding = binding.clone();
                    dispatch.insert(&decl.topic, move |envelope| {
                        let status: topics::SpeakingStatus = envelope.decode()?;
                        let indicator = topics::ListeningStatus {
                            listening: !status.speaking,
                            reason: if status.speaking {
                                "robot_speaking".into()
                            } else {
                                "ready".into()
                            },
                        };
                        status_binding.publish(topics::LISTENING_STATUS, &indicator)?;
                        Ok(())
                    });
                }
                "on_navigation_status" => {
                    let nav_gate = gate.clone();
                    let nav_binding = binding.clone();
                    let held = Arc::clone(&moving_held);
                    dispatch.insert(&decl.topic, move |envelope| {
                        use std::sync::atomic::Ordering;
                        let status: topics::NavigationStatus = envelope.decode()?;
                        match status.status {
                            topics::NavState::Executing => {
                                if !held.swap(true, Ordering::AcqRel) {
                                    nav_gate.acquire("moving");
                                }
                            }
                            topics::NavState::Idle
                            | topics::NavState::Completed
                            | topics::NavState::Error => {
                                if held.swap(false, Ordering::AcqRel) {
                                    nav_gate.release("moving");
                                }
                            }
                        }
                        let indicator = topics::ListeningStatus {
                            listening: nav_gate.available(),
                            reason: if status.status == topics::NavState::Executing {
                                "robot_moving".into()
                            } else {
                                "ready".into()
                            },
                        };
                        nav_binding.publish(topics::LISTENING_STATUS, &indicator)?;
                        Ok(())
                    });
                }
                unknown => {
                    // Unresolved handler names fail the load, after undoing
                    // the registrations made so far.
                    for token in tokens {
                        realtime.deregister_handler(token);
                    }
                    bus.deregister_node(&config.name);
                    return Err(crate::error::BanterError::NodeConfig(format!(
                        "node `{}`: unknown handler `{unknown}`",
                        config.name
                    )));
                }
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Envelope, NodeSpec};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn transcription_done(item_id: &str, transcript: &str) -> ServerEvent {
        serde_json::from_value(json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": item_id,
            "transcript": transcript
        }))
        .unwrap()
    }

    fn transcription_delta(item_id: &str, delta: &str) -> ServerEvent {
        serde_json::from_value(json!({
            "type": "conversation.item.input_audio_transcription.delta",
            "item_id": item_id,
            "delta": delta
        }))
        .unwrap()
    }

    async fn recv_with_timeout(
        mailbox: &Arc<crate::bus::Mailbox>,
        timeout: Duration,
    ) -> Envelope {
        let start = Instant::now();
        loop {
            if let Some(envelope) = mailbox.try_recv() {
                return envelope;
            }
            if start.elapsed() > timeout {
                panic!("timed out waiting for envelope");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn probe(bus: &MessageBus, subscribes: &[&str]) -> crate::bus::BusBinding {
        bus.register_node(&NodeSpec {
            name: "probe".into(),
            publishes: vec![],
            subscribes: subscribes.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn completed_transcript_publishes_voice_command() {
        let bus = MessageBus::new();
        let realtime = RealtimeHandle::detached();
        let gate = MicGate::new();
        let probe = probe(&bus, &[topics::VOICE_COMMAND]);

        let node = SttNode::load(&SttNode::default_config(), &bus, &realtime, &gate).unwrap();

        realtime.dispatch(&transcription_delta("item-1", "hello "));
        realtime.dispatch(&transcription_delta("item-1", "robot"));
        realtime.dispatch(&transcription_done("item-1", "hello robot"));

        let envelope = recv_with_timeout(probe.mailbox(), Duration::from_secs(1)).await;
        let command: topics::VoiceCommand = envelope.decode().unwrap();
        assert_eq!(command.text, "hello robot");
        assert_eq!(command.conversation_id, "item-1");
        assert_eq!(envelope.conversation_id.as_deref(), Some("item-1"));

        node.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn empty_final_transcript_falls_back_to_deltas() {
        let bus = MessageBus::new();
        let realtime = RealtimeHandle::detached();
        let gate = MicGate::new();
        let probe = probe(&bus, &[topics::VOICE_COMMAND]);

        let node = SttNode::load(&SttNode::default_config(), &bus, &realtime, &gate).unwrap();

        realtime.dispatch(&transcription_delta("item-2", "turn around"));
        realtime.dispatch(&transcription_done("item-2", "  "));

        let envelope = recv_with_timeout(probe.mailbox(), Duration::from_secs(1)).await;
        let command: topics::VoiceCommand = envelope.decode().unwrap();
        assert_eq!(command.text, "turn around");

        node.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn speaking_status_drives_listening_indicator() {
        let bus = MessageBus::new();
        let realtime = RealtimeHandle::detached();
        let gate = MicGate::new();
        let probe = probe(&bus, &[topics::LISTENING_STATUS]);
        let speaker = bus
            .register_node(&NodeSpec {
                name: "tts".into(),
                publishes: vec![topics::SPEAKING_STATUS.into()],
                subscribes: vec![],
            })
            .unwrap();

        let node = SttNode::load(&SttNode::default_config(), &bus, &realtime, &gate).unwrap();

        speaker
            .publish(
                topics::SPEAKING_STATUS,
                &topics::SpeakingStatus {
                    speaking: true,
                    text: None,
                },
            )
            .unwrap();

        let envelope = recv_with_timeout(probe.mailbox(), Duration::from_secs(1)).await;
        let status: topics::ListeningStatus = envelope.decode().unwrap();
        assert!(!status.listening);
        assert_eq!(status.reason, "robot_speaking");

        node.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn navigation_hold_is_symmetric() {
        let bus = MessageBus::new();
        let realtime = RealtimeHandle::detached();
        let gate = MicGate::new();
        let navigator = bus
            .register_node(&NodeSpec {
                name: "navigator".into(),
                publishes: vec![topics::NAVIGATION_STATUS.into()],
                subscribes: vec![],
            })
            .unwrap();

        let node = SttNode::load(&SttNode::default_config(), &bus, &realtime, &gate).unwrap();

        let publish_nav = |state: topics::NavState| {
            navigator
                .publish(
                    topics::NAVIGATION_STATUS,
                    &topics::NavigationStatus {
                        status: state,
                        current_action: None,
                        timestamp: Utc::now(),
                    },
                )
                .unwrap();
        };

        publish_nav(topics::NavState::Executing);
        // Repeated executing must not double-hold.
        publish_nav(topics::NavState::Executing);

        let start = Instant::now();
        while gate.available() {
            assert!(start.elapsed() < Duration::from_secs(1), "gate never acquired");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(gate.holder_count(), 1);
        assert_eq!(gate.holders(), vec!["moving".to_string()]);

        publish_nav(topics::NavState::Completed);
        let start = Instant::now();
        while !gate.available() {
            assert!(start.elapsed() < Duration::from_secs(1), "gate never released");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        node.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn direct_command_bypasses_the_model() {
        let bus = MessageBus::new();
        let realtime = RealtimeHandle::detached();
        let gate = MicGate::new();
        let probe = probe(&bus, &[topics::ROBOT_ACTION, topics::VOICE_COMMAND]);

        let mut config = SttNode::default_config().publish(topics::ROBOT_ACTION);
        config
            .options
            .insert("direct_commands".into(), json!(true));

        let node = SttNode::load(&config, &bus, &realtime, &gate).unwrap();

        realtime.dispatch(&transcription_done("item-3", "sit down"));

        let envelope = recv_with_timeout(probe.mailbox(), Duration::from_secs(1)).await;
        assert_eq!(envelope.topic, topics::ROBOT_ACTION);
        let action: topics::RobotAction = envelope.decode().unwrap();
        assert_eq!(action.actions[0].name, "sit");
        assert!(probe.mailbox().is_empty(), "no voice_command for a bypassed phrase");

        node.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unknown_handler_name_fails_load() {
        let bus = MessageBus::new();
        let realtime = RealtimeHandle::detached();
        let gate = MicGate::new();

        let config = NodeConfig::new("stt")
            .publish(topics::VOICE_COMMAND)
            .publish(topics::LISTENING_STATUS)
            .subscribe(topics::SPEAKING_STATUS, "on_speeking_status");

        let err = SttNode::load(&config, &bus, &realtime, &gate).unwrap_err();
        assert!(matches!(err, crate::error::BanterError::NodeConfig(_)));
        // The failed load left no registration behind.
        assert!(bus.wiring_of("stt").is_none());
    }
}
