//! In-process pub/sub with declared permissions.
//!
//! ## Delivery model
//!
//! ```text
//! publish(node, topic, payload)
//!     │  permission check against the publisher's declared topics
//!     ▼
//! one bounded Mailbox per subscriber ──► node worker drains serially
//! ```
//!
//! Mailboxes are drop-oldest rings: a slow subscriber loses its oldest
//! envelopes (counted, warned) and publishers never block. Envelopes from
//! one publisher reach each subscriber in publish order; there is no
//! cross-publisher ordering.

pub mod topics;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::error::{BanterError, Result};

/// Default per-subscriber mailbox depth.
pub const DEFAULT_MAILBOX_DEPTH: usize = 64;

/// One message in flight on the bus.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Correlation id threading one conversation through the system.
    pub conversation_id: Option<String>,
}

impl Envelope {
    pub fn new(topic: &str, payload: Value) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
            conversation_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    /// Deserialize the payload into the topic's declared shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            BanterError::Handler(format!("payload for `{}` has wrong shape: {e}", self.topic))
        })
    }
}

/// Bounded drop-oldest mailbox with a single async consumer.
pub struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue, evicting the oldest envelope when full. Never blocks.
    pub fn push(&self, envelope: Envelope) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "mailbox full: dropped oldest envelope");
            }
            queue.push_back(envelope);
        }
        self.notify.notify_one();
    }

    /// Receive the next envelope; `None` once closed and drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            {
                let mut queue = self.queue.lock();
                if let Some(envelope) = queue.pop_front() {
                    return Some(envelope);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.queue.lock().pop_front()
    }

    /// Wake the consumer and make `recv` return `None` once drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Envelopes evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Declarative registration for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub publishes: Vec<String>,
    pub subscribes: Vec<String>,
}

struct NodeEntry {
    publishes: HashSet<String>,
    subscribes: HashSet<String>,
    mailbox: Arc<Mailbox>,
    denied: Arc<AtomicU64>,
}

#[derive(Default)]
struct BusInner {
    nodes: HashMap<String, NodeEntry>,
}

/// The process-wide message bus. Cloning shares state; nodes receive a
/// [`BusBinding`] at registration instead of touching the bus directly.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MessageBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node with its declared topic permissions.
    ///
    /// # Errors
    /// `NodeAlreadyRegistered` for a duplicate name, `UnknownTopic` for a
    /// declaration outside the topic catalog.
    pub fn register_node(&self, spec: &NodeSpec) -> Result<BusBinding> {
        self.register_node_with_depth(spec, DEFAULT_MAILBOX_DEPTH)
    }

    pub fn register_node_with_depth(&self, spec: &NodeSpec, depth: usize) -> Result<BusBinding> {
        for topic in spec.publishes.iter().chain(spec.subscribes.iter()) {
            if !topics::is_known_topic(topic) {
                return Err(BanterError::UnknownTopic(topic.clone()));
            }
        }

        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(&spec.name) {
            return Err(BanterError::NodeAlreadyRegistered(spec.name.clone()));
        }

        let mailbox = Arc::new(Mailbox::new(depth));
        inner.nodes.insert(
            spec.name.clone(),
            NodeEntry {
                publishes: spec.publishes.iter().cloned().collect(),
                subscribes: spec.subscribes.iter().cloned().collect(),
                mailbox: Arc::clone(&mailbox),
                denied: Arc::new(AtomicU64::new(0)),
            },
        );
        debug!(
            node = spec.name.as_str(),
            publishes = spec.publishes.len(),
            subscribes = spec.subscribes.len(),
            "node registered on bus"
        );

        Ok(BusBinding {
            node: spec.name.clone(),
            mailbox,
            bus: self.clone(),
        })
    }

    /// Remove a node. Its mailbox is closed; idempotent.
    pub fn deregister_node(&self, name: &str) {
        let entry = self.inner.lock().nodes.remove(name);
        if let Some(entry) = entry {
            entry.mailbox.close();
            debug!(node = name, "node deregistered from bus");
        }
    }

    /// Publish an envelope on behalf of `node`.
    ///
    /// # Errors
    /// `PermissionDenied` when the topic was not declared — the envelope is
    /// dropped and the denial counted; callers log and carry on.
    pub fn publish_envelope(&self, node: &str, envelope: Envelope) -> Result<()> {
        let inner = self.inner.lock();

        let Some(publisher) = inner.nodes.get(node) else {
            return Err(BanterError::NodeConfig(format!(
                "publish from unregistered node `{node}`"
            )));
        };
        if !publisher.publishes.contains(&envelope.topic) {
            publisher.denied.fetch_add(1, Ordering::Relaxed);
            error!(
                node,
                topic = envelope.topic.as_str(),
                "publish denied: topic not declared by node"
            );
            return Err(BanterError::PermissionDenied {
                node: node.to_string(),
                topic: envelope.topic.clone(),
            });
        }

        for entry in inner.nodes.values() {
            if entry.subscribes.contains(&envelope.topic) {
                entry.mailbox.push(envelope.clone());
            }
        }
        Ok(())
    }

    /// Times `node` tried to publish a topic it never declared.
    pub fn denied_publishes(&self, node: &str) -> u64 {
        self.inner
            .lock()
            .nodes
            .get(node)
            .map(|e| e.denied.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Declared permissions for a node, for wiring assertions.
    pub fn wiring_of(&self, node: &str) -> Option<(Vec<String>, Vec<String>)> {
        let inner = self.inner.lock();
        inner.nodes.get(node).map(|e| {
            let mut publishes: Vec<String> = e.publishes.iter().cloned().collect();
            let mut subscribes: Vec<String> = e.subscribes.iter().cloned().collect();
            publishes.sort();
            subscribes.sort();
            (publishes, subscribes)
        })
    }
}

/// A registered node's handle onto the bus.
#[derive(Clone)]
pub struct BusBinding {
    node: String,
    mailbox: Arc<Mailbox>,
    bus: MessageBus,
}

impl std::fmt::Debug for BusBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusBinding").field("node", &self.node).finish_non_exhaustive()
    }
}

impl BusBinding {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Serialize and publish a payload on `topic`.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.bus.publish_envelope(&self.node, Envelope::new(topic, value))
    }

    /// Like [`BusBinding::publish`], tagged with a conversation id.
    pub fn publish_correlated<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        conversation_id: &str,
    ) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.bus.publish_envelope(
            &self.node,
            Envelope::new(topic, value).with_conversation(conversation_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str, publishes: &[&str], subscribes: &[&str]) -> NodeSpec {
        NodeSpec {
            name: name.into(),
            publishes: publishes.iter().map(|s| s.to_string()).collect(),
            subscribes: subscribes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn undeclared_topic_is_denied_and_counted() {
        let bus = MessageBus::new();
        let binding = bus
            .register_node(&spec("stt", &[topics::VOICE_COMMAND], &[]))
            .unwrap();

        let err = binding
            .publish(topics::ROBOT_ACTION, &json!({"x": 1}))
            .unwrap_err();
        assert!(matches!(err, BanterError::PermissionDenied { .. }));
        assert_eq!(bus.denied_publishes("stt"), 1);

        // The node keeps working on its declared topics.
        binding.publish(topics::VOICE_COMMAND, &json!({"ok": true})).unwrap();
    }

    #[test]
    fn unknown_topic_fails_registration() {
        let bus = MessageBus::new();
        let err = bus
            .register_node(&spec("bad", &["made_up_topic"], &[]))
            .unwrap_err();
        assert!(matches!(err, BanterError::UnknownTopic(_)));
    }

    #[test]
    fn duplicate_registration_fails() {
        let bus = MessageBus::new();
        bus.register_node(&spec("stt", &[], &[])).unwrap();
        let err = bus.register_node(&spec("stt", &[], &[])).unwrap_err();
        assert!(matches!(err, BanterError::NodeAlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_publisher() {
        let bus = MessageBus::new();
        let publisher = bus
            .register_node(&spec("stt", &[topics::VOICE_COMMAND], &[]))
            .unwrap();
        let subscriber = bus
            .register_node(&spec("cognition", &[], &[topics::VOICE_COMMAND]))
            .unwrap();

        for i in 0..5 {
            publisher
                .publish(topics::VOICE_COMMAND, &json!({ "seq": i }))
                .unwrap();
        }

        for i in 0..5 {
            let envelope = subscriber.mailbox().recv().await.expect("envelope");
            assert_eq!(envelope.payload["seq"], i);
        }
    }

    #[test]
    fn mailbox_overflow_drops_oldest() {
        let mailbox = Mailbox::new(3);
        for i in 0..5 {
            mailbox.push(Envelope::new(topics::SYSTEM_MODE, json!({ "seq": i })));
        }
        assert_eq!(mailbox.dropped(), 2);
        assert_eq!(mailbox.len(), 3);
        // Seq 0 and 1 were evicted; the newest survived.
        assert_eq!(mailbox.try_recv().unwrap().payload["seq"], 2);
        assert_eq!(mailbox.try_recv().unwrap().payload["seq"], 3);
        assert_eq!(mailbox.try_recv().unwrap().payload["seq"], 4);
    }

    #[tokio::test]
    async fn closed_mailbox_drains_then_ends() {
        let mailbox = Mailbox::new(4);
        mailbox.push(Envelope::new(topics::SYSTEM_MODE, json!({})));
        mailbox.close();
        assert!(mailbox.recv().await.is_some());
        assert!(mailbox.recv().await.is_none());
    }

    #[test]
    fn reregistration_restores_identical_wiring() {
        let bus = MessageBus::new();
        let node_spec = spec(
            "stt",
            &[topics::VOICE_COMMAND, topics::LISTENING_STATUS],
            &[topics::SPEAKING_STATUS, topics::NAVIGATION_STATUS],
        );

        bus.register_node(&node_spec).unwrap();
        let before = bus.wiring_of("stt").unwrap();

        bus.deregister_node("stt");
        assert!(bus.wiring_of("stt").is_none());

        bus.register_node(&node_spec).unwrap();
        let after = bus.wiring_of("stt").unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn deregister_is_idempotent() {
        let bus = MessageBus::new();
        bus.register_node(&spec("stt", &[], &[])).unwrap();
        bus.deregister_node("stt");
        bus.deregister_node("stt");
    }

    #[test]
    fn envelope_decode_rejects_wrong_shape() {
        let envelope = Envelope::new(topics::SPEAKING_STATUS, json!({ "speaking": "yes" }));
        let err = envelope.decode::<topics::SpeakingStatus>().unwrap_err();
        assert!(matches!(err, BanterError::Handler(_)));
    }

    #[tokio::test]
    async fn subscribers_are_isolated() {
        let bus = MessageBus::new();
        let publisher = bus
            .register_node(&spec("tts", &[topics::SPEAKING_STATUS], &[]))
            .unwrap();
        let stt = bus
            .register_node(&spec("stt", &[], &[topics::SPEAKING_STATUS]))
            .unwrap();
        let other = bus
            .register_node(&spec("cognition", &[], &[topics::VOICE_COMMAND]))
            .unwrap();

        publisher
            .publish(
                topics::SPEAKING_STATUS,
                &topics::SpeakingStatus {
                    speaking: true,
                    text: None,
                },
            )
            .unwrap();

        assert_eq!(stt.mailbox().len(), 1);
        assert!(other.mailbox().is_empty());
    }
}
