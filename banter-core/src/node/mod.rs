//! Node runtime — declarative configuration, mailbox worker, lifecycle.
//!
//! A node is born from a [`NodeConfig`] (name + declared topics + typed
//! options). Handler names in the config are resolved to real functions at
//! construction time; an unresolved name fails the load, so there is never a
//! string lookup on the hot path.
//!
//! ## Lifecycle
//!
//! ```text
//! load (validate config, register bus + realtime handlers)
//!   └─► worker runs: mailbox → resolved handler, one envelope at a time
//!         └─► stop(drain): close mailbox, wait out in-flight handlers
//!               └─► dispose(): deregister everything — idempotent
//! ```
//!
//! A handler failure (error or panic) is caught, counted against the node's
//! health, and never disturbs sibling nodes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::{topics, Envelope, Mailbox, MessageBus, NodeSpec};
use crate::error::{BanterError, Result};
use crate::realtime::{HandlerId, RealtimeHandle};

/// One declared publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicDecl {
    pub topic: String,
}

/// One declared subscription, bound to a handler by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscribeDecl {
    pub topic: String,
    pub handler: String,
}

/// Declarative per-node configuration, loaded at init. Unknown keys fail
/// the load — both here and inside each node's typed options struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub publishes: Vec<TopicDecl>,
    #[serde(default)]
    pub subscribes: Vec<SubscribeDecl>,
    #[serde(default)]
    pub options: serde_json::Map<String, Value>,
}

impl NodeConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            publishes: Vec::new(),
            subscribes: Vec::new(),
            options: serde_json::Map::new(),
        }
    }

    /// Parse from a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| BanterError::NodeConfig(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Topic-name sanity: every declaration must be in the catalog.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BanterError::NodeConfig("node name is empty".into()));
        }
        for decl in &self.publishes {
            if !topics::is_known_topic(&decl.topic) {
                return Err(BanterError::UnknownTopic(decl.topic.clone()));
            }
        }
        for decl in &self.subscribes {
            if !topics::is_known_topic(&decl.topic) {
                return Err(BanterError::UnknownTopic(decl.topic.clone()));
            }
        }
        Ok(())
    }

    /// Bus registration derived from the declarations.
    pub fn bus_spec(&self) -> NodeSpec {
        NodeSpec {
            name: self.name.clone(),
            publishes: self.publishes.iter().map(|d| d.topic.clone()).collect(),
            subscribes: self.subscribes.iter().map(|d| d.topic.clone()).collect(),
        }
    }

    /// Deserialize the options map into the node's typed options struct.
    /// The struct carries `deny_unknown_fields`, so a typo'd key fails here.
    pub fn options_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.options.clone())).map_err(|e| {
            BanterError::NodeConfig(format!("options for `{}`: {e}", self.name))
        })
    }

    /// Assert that a topic this node needs to publish was declared.
    pub fn require_publish(&self, topic: &str) -> Result<()> {
        if self.publishes.iter().any(|d| d.topic == topic) {
            Ok(())
        } else {
            Err(BanterError::NodeConfig(format!(
                "node `{}` must declare publishes: {topic}",
                self.name
            )))
        }
    }

    /// Convenience for building configs in code: declare a publication.
    pub fn publish(mut self, topic: &str) -> Self {
        self.publishes.push(TopicDecl {
            topic: topic.to_string(),
        });
        self
    }

    /// Convenience for building configs in code: declare a subscription.
    pub fn subscribe(mut self, topic: &str, handler: &str) -> Self {
        self.subscribes.push(SubscribeDecl {
            topic: topic.to_string(),
            handler: handler.to_string(),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Liveness counters every node exposes.
#[derive(Default)]
pub struct NodeHealth {
    invocations: AtomicU64,
    errors: AtomicU64,
    unhealthy: AtomicBool,
    last_activity: Mutex<Option<Instant>>,
}

impl NodeHealth {
    pub fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Some(Instant::now());
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            healthy: !self.unhealthy.load(Ordering::Acquire),
            idle_for: self.last_activity.lock().map(|at| at.elapsed()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub invocations: u64,
    pub errors: u64,
    pub healthy: bool,
    /// Time since the last handler ran; `None` if none ever did.
    pub idle_for: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A resolved topic handler. Returns `Err` for counted, non-fatal failures.
pub type TopicHandler = Box<dyn FnMut(&Envelope) -> Result<()> + Send>;

/// Topic → resolved handler, built once at node construction.
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<String, TopicHandler>,
}

impl DispatchTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        topic: &str,
        handler: impl FnMut(&Envelope) -> Result<()> + Send + 'static,
    ) {
        self.handlers.insert(topic.to_string(), Box::new(handler));
    }

    /// Every subscription in the config must have landed in this table.
    pub fn verify_covers(&self, config: &NodeConfig) -> Result<()> {
        for decl in &config.subscribes {
            if !self.handlers.contains_key(&decl.topic) {
                return Err(BanterError::NodeConfig(format!(
                    "node `{}`: no handler resolved for topic `{}`",
                    config.name, decl.topic
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Running node
// ---------------------------------------------------------------------------

/// A loaded, running node: its worker, health, and registrations.
pub struct NodeHandle {
    name: String,
    bus: MessageBus,
    mailbox: Arc<Mailbox>,
    health: Arc<NodeHealth>,
    worker: Mutex<Option<JoinHandle<()>>>,
    realtime: Option<RealtimeHandle>,
    realtime_tokens: Mutex<Vec<HandlerId>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("name", &self.name).finish_non_exhaustive()
    }
}

impl NodeHandle {
    /// Wire a resolved node: spawns its mailbox worker.
    pub fn spawn(
        name: &str,
        bus: MessageBus,
        mailbox: Arc<Mailbox>,
        dispatch: DispatchTable,
        health: Arc<NodeHealth>,
        realtime: Option<RealtimeHandle>,
        realtime_tokens: Vec<HandlerId>,
    ) -> Self {
        let worker = spawn_worker(name.to_string(), Arc::clone(&mailbox), dispatch, Arc::clone(&health));
        Self {
            name: name.to_string(),
            bus,
            mailbox,
            health,
            worker: Mutex::new(Some(worker)),
            realtime,
            realtime_tokens: Mutex::new(realtime_tokens),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Stop the worker: close the mailbox, drain in-flight handlers up to
    /// `drain`, detach if the deadline is missed.
    pub async fn stop(&self, drain: Duration) {
        self.mailbox.close();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if tokio::time::timeout(drain, worker).await.is_err() {
                warn!(node = self.name.as_str(), "worker missed drain deadline — detaching");
            }
        }
    }

    /// Release bus registration and realtime handlers. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(realtime) = &self.realtime {
            for token in self.realtime_tokens.lock().drain(..) {
                realtime.deregister_handler(token);
            }
        }
        self.bus.deregister_node(&self.name);
        debug!(node = self.name.as_str(), "node disposed");
    }

    /// Stop then dispose, the normal shutdown path.
    pub async fn shutdown(&self, drain: Duration) {
        self.stop(drain).await;
        self.dispose();
    }
}

fn spawn_worker(
    name: String,
    mailbox: Arc<Mailbox>,
    mut dispatch: DispatchTable,
    health: Arc<NodeHealth>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = mailbox.recv().await {
            let Some(handler) = dispatch.handlers.get_mut(&envelope.topic) else {
                debug!(
                    node = name.as_str(),
                    topic = envelope.topic.as_str(),
                    "envelope without handler — ignored"
                );
                continue;
            };

            health.record_invocation();
            match catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    health.record_error();
                    warn!(
                        node = name.as_str(),
                        topic = envelope.topic.as_str(),
                        "handler failed: {e}"
                    );
                }
                Err(_) => {
                    health.record_error();
                    error!(
                        node = name.as_str(),
                        topic = envelope.topic.as_str(),
                        "handler panicked — contained"
                    );
                }
            }
        }
        debug!(node = name.as_str(), "worker drained");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    struct ProbeOptions {
        enabled: bool,
        threshold: f32,
    }

    #[test]
    fn config_parses_and_validates() {
        let config = NodeConfig::from_json(
            r#"{
                "name": "stt",
                "publishes": [{"topic": "voice_command"}],
                "subscribes": [{"topic": "speaking_status", "handler": "on_speaking_status"}],
                "options": {"enabled": true, "threshold": 0.5}
            }"#,
        )
        .unwrap();

        assert_eq!(config.name, "stt");
        let spec = config.bus_spec();
        assert_eq!(spec.publishes, vec!["voice_command".to_string()]);
        assert_eq!(spec.subscribes, vec!["speaking_status".to_string()]);

        let options: ProbeOptions = config.options_as().unwrap();
        assert_eq!(
            options,
            ProbeOptions {
                enabled: true,
                threshold: 0.5
            }
        );
    }

    #[test]
    fn unknown_top_level_key_fails_load() {
        let err = NodeConfig::from_json(r#"{"name": "stt", "subscriptions": []}"#).unwrap_err();
        assert!(matches!(err, BanterError::NodeConfig(_)));
    }

    #[test]
    fn unknown_option_key_fails_load() {
        let mut config = NodeConfig::new("stt");
        config.options.insert("enabeld".into(), json!(true));
        let err = config.options_as::<ProbeOptions>().unwrap_err();
        assert!(matches!(err, BanterError::NodeConfig(_)));
    }

    #[test]
    fn undeclared_topic_fails_validation() {
        let err = NodeConfig::from_json(
            r#"{"name": "stt", "publishes": [{"topic": "mystery_topic"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, BanterError::UnknownTopic(_)));
    }

    #[test]
    fn missing_required_publish_is_reported() {
        let config = NodeConfig::new("stt").publish(topics::VOICE_COMMAND);
        assert!(config.require_publish(topics::VOICE_COMMAND).is_ok());
        assert!(config.require_publish(topics::LISTENING_STATUS).is_err());
    }

    #[test]
    fn dispatch_table_detects_unresolved_subscription() {
        let config = NodeConfig::new("stt").subscribe(topics::SPEAKING_STATUS, "on_speaking");
        let table = DispatchTable::new();
        assert!(table.verify_covers(&config).is_err());
    }

    #[tokio::test]
    async fn worker_counts_errors_and_contains_panics() {
        let bus = MessageBus::new();
        let mailbox = Arc::new(Mailbox::new(16));
        let health = Arc::new(NodeHealth::default());

        let mut dispatch = DispatchTable::new();
        dispatch.insert(topics::SPEAKING_STATUS, |envelope| {
            if envelope.payload["speaking"] == json!(true) {
                panic!("intentional test panic");
            }
            Err(BanterError::Handler("intentional failure".into()))
        });

        let node = NodeHandle::spawn(
            "probe",
            bus,
            Arc::clone(&mailbox),
            dispatch,
            Arc::clone(&health),
            None,
            Vec::new(),
        );

        mailbox.push(Envelope::new(
            topics::SPEAKING_STATUS,
            json!({"speaking": true}),
        ));
        mailbox.push(Envelope::new(
            topics::SPEAKING_STATUS,
            json!({"speaking": false}),
        ));

        node.stop(Duration::from_secs(1)).await;

        let snapshot = node.health();
        assert_eq!(snapshot.invocations, 2);
        assert_eq!(snapshot.errors, 2);
        assert!(snapshot.healthy, "handler failures alone do not mark a node unhealthy");
        node.dispose();
    }

    #[tokio::test]
    async fn stop_drains_pending_envelopes() {
        let bus = MessageBus::new();
        let mailbox = Arc::new(Mailbox::new(16));
        let health = Arc::new(NodeHealth::default());
        let seen = Arc::new(AtomicU64::new(0));

        let mut dispatch = DispatchTable::new();
        let seen_in = Arc::clone(&seen);
        dispatch.insert(topics::SYSTEM_MODE, move |_| {
            seen_in.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        let node = NodeHandle::spawn(
            "probe",
            bus,
            Arc::clone(&mailbox),
            dispatch,
            health,
            None,
            Vec::new(),
        );

        for _ in 0..5 {
            mailbox.push(Envelope::new(topics::SYSTEM_MODE, json!({})));
        }
        node.stop(Duration::from_secs(1)).await;
        assert_eq!(seen.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let bus = MessageBus::new();
        let binding = bus
            .register_node(&NodeSpec {
                name: "probe".into(),
                publishes: vec![],
                subscribes: vec![],
            })
            .unwrap();

        let node = NodeHandle::spawn(
            "probe",
            bus.clone(),
            Arc::clone(binding.mailbox()),
            DispatchTable::new(),
            Arc::new(NodeHealth::default()),
            None,
            Vec::new(),
        );

        node.stop(Duration::from_secs(1)).await;
        node.dispose();
        node.dispose();
        assert!(bus.wiring_of("probe").is_none());
    }
}
