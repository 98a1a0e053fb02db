//! Cognition node — session configuration, conversational output, and
//! tool-call side effects.
//!
//! On load it pushes the persona and the parameterized tool catalog to the
//! remote session. Afterwards it accumulates text deltas into
//! `text_response` publications and routes completed function calls to bus
//! topics through a static handler table. Tool failures never produce side
//! effects; the error (with nearest-name suggestions) goes back to the
//! session as a `function_call_output` so the model can recover.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bus::{topics, BusBinding, MessageBus};
use crate::error::{BanterError, Result};
use crate::node::{DispatchTable, NodeConfig, NodeHandle, NodeHealth};
use crate::nodes::tools;
use crate::realtime::{
    protocol::{ClientEvent, ContentPart, ConversationItem, EventKind, ServerEvent, SessionConfig},
    RealtimeHandle,
};

const DEFAULT_INSTRUCTIONS: &str = "You are a small, cheerful robot companion. \
Keep spoken replies short and warm. Use your tools to move, look, and react \
physically when it fits the conversation.";

/// Typed options for the Cognition node. Unknown keys fail the load.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CognitionOptions {
    /// Persona string sent as session instructions.
    pub instructions: String,
    /// Remote voice preset.
    pub voice: String,
    /// Publish `system_mode` transitions.
    pub publish_system_mode: bool,
}

impl Default for CognitionOptions {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_INSTRUCTIONS.into(),
            voice: "alloy".into(),
            publish_system_mode: true,
        }
    }
}

pub struct CognitionNode;

impl CognitionNode {
    pub fn default_config() -> NodeConfig {
        NodeConfig::new("cognition")
            .publish(topics::TEXT_RESPONSE)
            .publish(topics::ROBOT_ACTION)
            .publish(topics::SNAP_PIC)
            .publish(topics::SOUND_EFFECT)
            .publish(topics::SYSTEM_MODE)
            .subscribe(topics::VISUAL_DATA, "on_visual_data")
            .subscribe(topics::SPEAKING_STATUS, "on_speaking_status")
    }

    pub fn load(
        config: &NodeConfig,
        bus: &MessageBus,
        realtime: &RealtimeHandle,
    ) -> Result<NodeHandle> {
        config.validate()?;
        let options: CognitionOptions = config.options_as()?;
        config.require_publish(topics::TEXT_RESPONSE)?;
        config.require_publish(topics::ROBOT_ACTION)?;

        let binding = bus.register_node(&config.bus_spec())?;
        let health = Arc::new(NodeHealth::default());

        // Configure the session: persona + tool catalog. Re-sent by the link
        // itself after every reconnect.
        realtime.send(ClientEvent::SessionUpdate {
            session: SessionConfig::new(&options.instructions, &options.voice, tools::catalog()),
        });
        info!(voice = options.voice.as_str(), "session configured");

        let mut tokens = Vec::new();

        // ── Text stream → text_response ──────────────────────────────────
        let text_buf: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));

        let buf_delta = Arc::clone(&text_buf);
        tokens.push(realtime.register_handler(EventKind::ResponseTextDelta, move |event| {
            if let ServerEvent::ResponseTextDelta { item_id, delta } = event {
                buf_delta
                    .lock()
                    .entry(item_id.clone())
                    .or_default()
                    .push_str(delta);
            }
        }));

        let buf_done = Arc::clone(&text_buf);
        let text_binding = binding.clone();
        tokens.push(realtime.register_handler(EventKind::ResponseTextDone, move |event| {
            let ServerEvent::ResponseTextDone { item_id, text } = event else {
                return;
            };
            let accumulated = buf_done.lock().remove(item_id).unwrap_or_default();
            let text = if text.trim().is_empty() { accumulated } else { text.clone() };
            if text.trim().is_empty() {
                return;
            }
            let response = topics::TextResponse {
                text,
                conversation_id: item_id.clone(),
                timestamp: Utc::now(),
            };
            if let Err(e) =
                text_binding.publish_correlated(topics::TEXT_RESPONSE, &response, item_id)
            {
                warn!("text response publish failed: {e}");
            }
        }));

        // ── Response flag on function-call items ─────────────────────────
        let flag_handle = realtime.clone();
        tokens.push(realtime.register_handler(EventKind::ResponseOutputItemAdded, move |event| {
            if let ServerEvent::ResponseOutputItemAdded { item } = event {
                if item.kind == "function_call" {
                    flag_handle.flags().mark_response_started();
                }
            }
        }));

        // ── Tool calls → bus side effects ────────────────────────────────
        let pic_seq = Arc::new(AtomicU64::new(0));
        let call_binding = binding.clone();
        let call_handle = realtime.clone();
        tokens.push(realtime.register_handler(
            EventKind::FunctionCallArgumentsDone,
            move |event| {
                let ServerEvent::FunctionCallArgumentsDone {
                    call_id,
                    name,
                    arguments,
                    ..
                } = event
                else {
                    return;
                };
                let output =
                    match dispatch_tool_call(&call_binding, &pic_seq, name, arguments) {
                        Ok(output) => output,
                        Err(e) => {
                            warn!(tool = name.as_str(), "tool call failed: {e}");
                            tool_error_output(name, &e)
                        }
                    };
                call_handle.send(ClientEvent::ConversationItemCreate {
                    item: ConversationItem::FunctionCallOutput {
                        call_id: call_id.clone(),
                        output: output.to_string(),
                    },
                });
            },
        ));

        // ── System mode transitions ──────────────────────────────────────
        if options.publish_system_mode {
            let mode_binding = binding.clone();
            tokens.push(realtime.register_handler(EventKind::ResponseCreated, move |_| {
                publish_mode(&mode_binding, topics::Mode::Thinking);
            }));
            let mode_binding = binding.clone();
            tokens.push(realtime.register_handler(EventKind::ResponseDone, move |_| {
                publish_mode(&mode_binding, topics::Mode::Idle);
            }));
            let mode_binding = binding.clone();
            tokens.push(realtime.register_handler(EventKind::Error, move |_| {
                publish_mode(&mode_binding, topics::Mode::Error);
            }));
        }

        // ── Bus subscriptions ────────────────────────────────────────────
        let mut dispatch = DispatchTable::new();
        for decl in &config.subscribes {
            match decl.handler.as_str() {
                "on_visual_data" => {
                    let visual_handle = realtime.clone();
                    dispatch.insert(&decl.topic, move |envelope| {
                        let data: topics::VisualData = envelope.decode()?;
                        debug!(capture_id = data.capture_id.as_str(), "forwarding camera capture");
                        visual_handle.send(ClientEvent::ConversationItemCreate {
                            item: ConversationItem::Message {
                                role: "user".into(),
                                content: vec![ContentPart::InputText {
                                    text: format!(
                                        "[camera] capture {} is ready ({} bytes of image data)",
                                        data.capture_id,
                                        data.image_bytes.len() * 3 / 4
                                    ),
                                }],
                            },
                        });
                        Ok(())
                    });
                }
                "on_speaking_status" => {
                    let mode_binding = binding.clone();
                    let publish_modes = options.publish_system_mode;
                    dispatch.insert(&decl.topic, move |envelope| {
                        let status: topics::SpeakingStatus = envelope.decode()?;
                        if publish_modes {
                            publish_mode(
                                &mode_binding,
                                if status.speaking {
                                    topics::Mode::Speaking
                                } else {
                                    topics::Mode::Idle
                                },
                            );
                        }
                        Ok(())
                    });
                }
                unknown => {
                    for token in tokens {
                        realtime.deregister_handler(token);
                    }
                    bus.deregister_node(&config.name);
                    return Err(BanterError::NodeConfig(format!(
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

fn publish_mode(binding: &BusBinding, mode: topics::Mode) {
    let event = topics::SystemMode {
        mode,
        timestamp: Utc::now(),
    };
    if let Err(e) = binding.publish(topics::SYSTEM_MODE, &event) {
        warn!("system mode publish failed: {e}");
    }
}

/// Static tool → side-effect table. Success returns the JSON output for the
/// session; failure returns an error that produces no side effect.
fn dispatch_tool_call(
    binding: &BusBinding,
    pic_seq: &AtomicU64,
    name: &str,
    arguments: &str,
) -> Result<Value> {
    let args: Value = serde_json::from_str(arguments)
        .map_err(|e| BanterError::ToolArguments(format!("not valid JSON: {e}")))?;

    match name {
        tools::TOOL_PERFORM_ACTION => {
            let raw_name = args
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| BanterError::ToolArguments("missing `name`".into()))?;
            let action = tools::resolve_action(raw_name)?;
            let speed = args
                .get("speed")
                .and_then(Value::as_f64)
                .map(|s| s.clamp(0.5, 2.0) as f32)
                .unwrap_or(1.0);
            let mood = args
                .get("mood")
                .and_then(Value::as_str)
                .unwrap_or("neutral")
                .to_string();

            let payload = topics::RobotAction {
                actions: vec![topics::ActionStep {
                    name: action.to_string(),
                    speed,
                }],
                mood,
                priority: 1,
                timestamp: Utc::now(),
            };
            binding.publish(topics::ROBOT_ACTION, &payload)?;
            info!(action, speed, "robot action dispatched");
            Ok(json!({"ok": true, "action": action}))
        }

        tools::TOOL_SNAP_PIC => {
            let request_id = format!("pic-{}", pic_seq.fetch_add(1, Ordering::Relaxed));
            let payload = topics::SnapPic {
                request_id: request_id.clone(),
                timestamp: Utc::now(),
            };
            binding.publish(topics::SNAP_PIC, &payload)?;
            info!(request_id = request_id.as_str(), "camera capture requested");
            Ok(json!({"ok": true, "request_id": request_id}))
        }

        tools::TOOL_SOUND_EFFECT => {
            let raw_name = args
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| BanterError::ToolArguments("missing `name`".into()))?;
            let effect = tools::resolve_sound(raw_name)?;
            let payload = topics::SoundEffect {
                name: effect.to_string(),
                timestamp: Utc::now(),
            };
            binding.publish(topics::SOUND_EFFECT, &payload)?;
            Ok(json!({"ok": true, "effect": effect}))
        }

        unknown => Err(BanterError::UnknownAction {
            name: unknown.to_string(),
            suggestions: tools::nearest_tools(unknown),
        }),
    }
}

fn tool_error_output(tool: &str, error: &BanterError) -> Value {
    match error {
        BanterError::UnknownAction { name, suggestions } => json!({
            "error": format!("unknown name `{name}` for `{tool}`"),
            "suggestions": suggestions,
        }),
        other => json!({"error": other.to_string()}),
    }
}
