//! Optional append-only audit log, attached to the bus as its own node.
//!
//! The core requires no persisted state; this writer is a plain app-side
//! collaborator that records conversation traffic as JSONL for later
//! inspection.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use banter_core::bus::{topics, MessageBus, NodeSpec};
use banter_core::node::{DispatchTable, NodeHandle, NodeHealth};

const AUDITED_TOPICS: &[&str] = &[
    topics::VOICE_COMMAND,
    topics::TEXT_RESPONSE,
    topics::ROBOT_ACTION,
    topics::SNAP_PIC,
    topics::SOUND_EFFECT,
    topics::SYSTEM_MODE,
];

#[derive(Serialize)]
struct AuditRecord<'a> {
    at: DateTime<Utc>,
    topic: &'a str,
    conversation_id: Option<&'a str>,
    payload: &'a serde_json::Value,
}

/// Register the audit node and start appending records to `path`.
pub fn spawn_audit_node(bus: &MessageBus, path: &Path) -> anyhow::Result<NodeHandle> {
    let file: File = OpenOptions::new().create(true).append(true).open(path)?;
    let writer = Arc::new(Mutex::new(BufWriter::new(file)));

    let binding = bus.register_node(&NodeSpec {
        name: "audit".into(),
        publishes: vec![],
        subscribes: AUDITED_TOPICS.iter().map(|t| t.to_string()).collect(),
    })?;

    let mut dispatch = DispatchTable::new();
    for topic in AUDITED_TOPICS {
        let writer = Arc::clone(&writer);
        dispatch.insert(topic, move |envelope| {
            let record = AuditRecord {
                at: envelope.timestamp,
                topic: &envelope.topic,
                conversation_id: envelope.conversation_id.as_deref(),
                payload: &envelope.payload,
            };
            let mut writer = writer.lock();
            serde_json::to_writer(&mut *writer, &record)
                .map_err(banter_core::error::BanterError::from)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            Ok(())
        });
    }

    Ok(NodeHandle::spawn(
        "audit",
        bus.clone(),
        Arc::clone(binding.mailbox()),
        dispatch,
        Arc::new(NodeHealth::default()),
        None,
        Vec::new(),
    ))
}
