//! Banter robot controller entry point.
//!
//! Wires the substrate together in dependency order — gate, bus, realtime
//! link, nodes, capture — runs until ctrl-c, then shuts down in reverse
//! order with bounded drain deadlines.

mod audit;
mod settings;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use banter_core::nodes::{CognitionNode, SttNode, TtsNode};
use banter_core::playback::PlaybackSink;
use banter_core::{CaptureManager, MessageBus, MicGate, RealtimeLink};

use settings::{default_settings_path, load_settings};
use sink::RodioSink;

/// Per-component shutdown drain deadline.
const DRAIN_DEADLINE: Duration = Duration::from_secs(3);

fn api_key_from_env() -> anyhow::Result<String> {
    for var in ["BANTER_API_KEY", "OPENAI_API_KEY"] {
        if let Ok(key) = std::env::var(var) {
            if !key.trim().is_empty() {
                return Ok(key);
            }
        }
    }
    anyhow::bail!("no realtime API credential: set BANTER_API_KEY or OPENAI_API_KEY")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "banter=info".parse().expect("valid default filter")),
        )
        .init();

    info!("banter starting");

    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    info!(
        settings_path = %settings_path.display(),
        model = settings.model.as_str(),
        vad_threshold = settings.vad_threshold,
        idle_timeout_secs = settings.idle_timeout_secs,
        "settings loaded"
    );

    let api_key = api_key_from_env()?;

    // ── Substrate ─────────────────────────────────────────────────────────
    let gate = MicGate::new();
    let bus = MessageBus::new();

    let link = RealtimeLink::spawn(settings.realtime_config(api_key))?;
    let realtime = link.handle();

    // ── Nodes ─────────────────────────────────────────────────────────────
    let stt_config = settings.node_config("stt", SttNode::default_config())?;
    let stt = SttNode::load(&stt_config, &bus, &realtime, &gate)?;

    let cognition_config = settings.node_config("cognition", CognitionNode::default_config())?;
    let cognition = CognitionNode::load(&cognition_config, &bus, &realtime)?;

    let tts_config = settings.node_config("tts", TtsNode::default_config())?;
    let playback_sink: Arc<dyn PlaybackSink> = Arc::new(RodioSink::new());
    let tts = TtsNode::load(&tts_config, &bus, &realtime, &gate, playback_sink)?;

    let audit_node = match &settings.audit_log {
        Some(path) => match audit::spawn_audit_node(&bus, path) {
            Ok(node) => {
                info!(path = %path.display(), "audit log enabled");
                Some(node)
            }
            Err(e) => {
                warn!("audit log disabled: {e}");
                None
            }
        },
        None => None,
    };

    // ── Capture ───────────────────────────────────────────────────────────
    let capture = CaptureManager::new(settings.capture_config(), gate.clone(), realtime.clone());
    if let Err(e) = capture.start() {
        // A dead microphone leaves the robot mute but alive; the error
        // indicator collaborator signals the rest.
        error!("capture unavailable: {e}");
    }

    info!("banter controller running — ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    // ── Shutdown, reverse dependency order: nodes → capture → link ───────
    stt.shutdown(DRAIN_DEADLINE).await;
    cognition.shutdown(DRAIN_DEADLINE).await;
    tts.shutdown(DRAIN_DEADLINE).await;
    if let Some(audit_node) = audit_node {
        audit_node.shutdown(DRAIN_DEADLINE).await;
    }

    if let Err(e) = capture.stop() {
        warn!("capture stop: {e}");
    }

    link.stop(DRAIN_DEADLINE).await;
    info!("banter stopped");
    Ok(())
}
