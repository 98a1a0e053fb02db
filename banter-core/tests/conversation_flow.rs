//! End-to-end interaction scenarios: the capture loop, the three nodes and
//! the gate wired together, with the remote side scripted through the
//! realtime handle.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;

use banter_core::buffering::{create_capture_ring, Producer};
use banter_core::bus::{topics, MessageBus, NodeSpec};
use banter_core::capture::pipeline::{self, CaptureDiagnostics, PipelineContext};
use banter_core::capture::CaptureConfig;
use banter_core::error::Result;
use banter_core::gate::MicGate;
use banter_core::nodes::{CognitionNode, SttNode, TtsNode};
use banter_core::playback::PlaybackSink;
use banter_core::realtime::protocol::{ClientEvent, ServerEvent};
use banter_core::realtime::session::LinkState;
use banter_core::realtime::RealtimeHandle;
use banter_core::vad::energy::EnergyVad;

struct RecordingSink {
    gate: MicGate,
    plays: Mutex<Vec<(usize, bool)>>,
}

impl RecordingSink {
    fn new(gate: MicGate) -> Self {
        Self {
            gate,
            plays: Mutex::new(Vec::new()),
        }
    }

    fn play_count(&self) -> usize {
        self.plays.lock().len()
    }
}

impl PlaybackSink for RecordingSink {
    fn play(&self, wav: &[u8], _sample_rate: u32, _channels: u16) -> Result<()> {
        self.plays.lock().push((wav.len(), self.gate.available()));
        Ok(())
    }
}

fn event(value: serde_json::Value) -> ServerEvent {
    serde_json::from_value(value).unwrap()
}

fn audio_delta_b64(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    BASE64.encode(bytes)
}

fn test_capture_config() -> CaptureConfig {
    CaptureConfig {
        chunk_samples: 160,
        drain_samples: 160,
        min_speech_duration: Duration::ZERO,
        commit_cooldown: Duration::ZERO,
        commit_pause: Duration::ZERO,
        vad_silence_frames: 2,
        ..CaptureConfig::default()
    }
}

async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let start = Instant::now();
    while !predicate() {
        if start.elapsed() > timeout {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn drain_names(handle: &RealtimeHandle) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Some(event) = handle.outbound().try_recv() {
        names.push(event.name());
    }
    names
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_single_utterance_flows_through_all_nodes() {
    let bus = MessageBus::new();
    let gate = MicGate::new();
    let realtime = RealtimeHandle::detached();
    realtime.flags().set_state(LinkState::Connected);

    let sink = Arc::new(RecordingSink::new(gate.clone()));

    let stt = SttNode::load(&SttNode::default_config(), &bus, &realtime, &gate).unwrap();
    let cognition = CognitionNode::load(&CognitionNode::default_config(), &bus, &realtime).unwrap();
    let tts = TtsNode::load(
        &TtsNode::default_config(),
        &bus,
        &realtime,
        &gate,
        Arc::clone(&sink) as Arc<dyn PlaybackSink>,
    )
    .unwrap();

    let probe = bus
        .register_node(&NodeSpec {
            name: "probe".into(),
            publishes: vec![],
            subscribes: vec![topics::VOICE_COMMAND.into(), topics::TEXT_RESPONSE.into()],
        })
        .unwrap();

    // The cognition node configured the session at load.
    let session = realtime.last_session().expect("session configured");
    assert!(!session.tools.is_empty());
    assert!(matches!(
        realtime.outbound().try_recv(),
        Some(ClientEvent::SessionUpdate { .. })
    ));

    // ── User speaks: 1.2 s of loud audio, then silence ───────────────────
    let (mut producer, consumer) = create_capture_ring();
    producer.push_slice(&vec![0.2f32; 160 * 6]);
    producer.push_slice(&vec![0.0f32; 160 * 3]);

    let running = Arc::new(AtomicBool::new(true));
    let (activity_tx, _) = broadcast::channel(64);
    let ctx = PipelineContext {
        config: test_capture_config(),
        vad: Box::new(EnergyVad::new(0.08)),
        consumer,
        running: Arc::clone(&running),
        gate: gate.clone(),
        realtime: realtime.clone(),
        activity_tx,
        diagnostics: Arc::new(CaptureDiagnostics::default()),
        capture_sample_rate: 24_000,
    };
    let capture_worker = thread::spawn(move || pipeline::run(ctx));

    wait_until(Duration::from_secs(2), || {
        realtime.flags().response_in_progress()
    })
    .await;
    running.store(false, Ordering::SeqCst);
    capture_worker.join().expect("capture thread panicked");

    let names = drain_names(&realtime);
    assert_eq!(
        names
            .iter()
            .filter(|n| **n == "input_audio_buffer.clear")
            .count(),
        1
    );
    assert!(names.iter().filter(|n| **n == "input_audio_buffer.append").count() >= 6);
    assert_eq!(
        names
            .iter()
            .filter(|n| **n == "input_audio_buffer.commit")
            .count(),
        1
    );
    assert_eq!(names.iter().filter(|n| **n == "response.create").count(), 1);

    // ── Remote answers: transcript, text, audio, done ────────────────────
    realtime.dispatch(&event(json!({
        "type": "response.created", "response": {"id": "resp-1"}
    })));
    realtime.dispatch(&event(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": "item-user",
        "transcript": "hello robot"
    })));
    realtime.dispatch(&event(json!({
        "type": "response.output_text.done",
        "item_id": "item-reply",
        "text": "Hi! Nice to hear you."
    })));
    realtime.dispatch(&event(json!({
        "type": "response.output_audio.delta",
        "item_id": "item-reply",
        "delta": audio_delta_b64(&[1, 2, 3, 4, 5, 6])
    })));
    assert!(!gate.available(), "speaking hold taken at first audio delta");
    realtime.dispatch(&event(json!({
        "type": "response.output_audio.done",
        "item_id": "item-reply"
    })));
    realtime.dispatch(&event(json!({
        "type": "response.done", "response": {"id": "resp-1"}
    })));

    assert!(
        !realtime.flags().response_in_progress(),
        "response.done clears the in-flight flag"
    );

    wait_until(Duration::from_secs(2), || sink.play_count() == 1).await;
    wait_until(Duration::from_secs(2), || gate.available()).await;
    {
        let plays = sink.plays.lock();
        assert_eq!(plays.len(), 1, "exactly one WAV handed to the sink");
        assert!(!plays[0].1, "mic gated while the sink ran");
    }

    // Exactly one voice_command and one text_response came over the bus.
    let mut voice_commands = 0;
    let mut text_responses = 0;
    wait_until(Duration::from_secs(2), || {
        while let Some(envelope) = probe.mailbox().try_recv() {
            match envelope.topic.as_str() {
                topics::VOICE_COMMAND => voice_commands += 1,
                topics::TEXT_RESPONSE => text_responses += 1,
                _ => {}
            }
        }
        voice_commands >= 1 && text_responses >= 1
    })
    .await;
    assert_eq!(voice_commands, 1);
    assert_eq!(text_responses, 1);

    stt.shutdown(Duration::from_secs(1)).await;
    cognition.shutdown(Duration::from_secs(1)).await;
    tts.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_exclusions_release_in_any_order() {
    let bus = MessageBus::new();
    let gate = MicGate::new();
    let realtime = RealtimeHandle::detached();

    let stt = SttNode::load(&SttNode::default_config(), &bus, &realtime, &gate).unwrap();
    let navigator = bus
        .register_node(&NodeSpec {
            name: "navigator".into(),
            publishes: vec![topics::NAVIGATION_STATUS.into()],
            subscribes: vec![],
        })
        .unwrap();

    // Speaking starts (held by the TTS activity)…
    gate.acquire("speaking");
    assert_eq!(gate.holder_count(), 1);

    // …then navigation starts on top of it.
    navigator
        .publish(
            topics::NAVIGATION_STATUS,
            &topics::NavigationStatus {
                status: topics::NavState::Executing,
                current_action: Some("forward".into()),
                timestamp: chrono::Utc::now(),
            },
        )
        .unwrap();
    wait_until(Duration::from_secs(1), || gate.holder_count() == 2).await;

    // Navigation ends first: the mic must stay blocked by "speaking".
    navigator
        .publish(
            topics::NAVIGATION_STATUS,
            &topics::NavigationStatus {
                status: topics::NavState::Completed,
                current_action: None,
                timestamp: chrono::Utc::now(),
            },
        )
        .unwrap();
    wait_until(Duration::from_secs(1), || gate.holder_count() == 1).await;
    assert!(!gate.available());

    // Speaking ends: single transition to available, holder list empty.
    gate.release("speaking");
    assert!(gate.available());
    assert!(gate.holders().is_empty());

    stt.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_loss_mid_response_recovers_cleanly() {
    let bus = MessageBus::new();
    let gate = MicGate::new();
    let realtime = RealtimeHandle::detached();
    realtime.flags().set_state(LinkState::Connected);

    let sink = Arc::new(RecordingSink::new(gate.clone()));
    let cognition = CognitionNode::load(&CognitionNode::default_config(), &bus, &realtime).unwrap();
    let tts = TtsNode::load(
        &TtsNode::default_config(),
        &bus,
        &realtime,
        &gate,
        Arc::clone(&sink) as Arc<dyn PlaybackSink>,
    )
    .unwrap();

    // A response is mid-stream when the network drops.
    realtime.dispatch(&event(json!({
        "type": "response.created", "response": {"id": "resp-1"}
    })));
    realtime.dispatch(&event(json!({
        "type": "response.output_audio.delta",
        "item_id": "item-1",
        "delta": audio_delta_b64(&[5, 5, 5])
    })));
    assert!(realtime.flags().response_in_progress());
    assert!(!gate.available());

    realtime.flags().set_state(LinkState::Disconnected);
    realtime.dispatch_connection_closed();

    // Flag cleared, buffers discarded, hold balanced — and the session
    // config survives for the reconnect replay.
    assert!(!realtime.flags().response_in_progress());
    assert!(gate.available());
    assert!(realtime.last_session().is_some());

    // After reconnecting, the next response proceeds normally.
    realtime.flags().set_state(LinkState::Connected);
    realtime.dispatch(&event(json!({
        "type": "response.created", "response": {"id": "resp-2"}
    })));
    realtime.dispatch(&event(json!({
        "type": "response.output_audio.delta",
        "item_id": "item-2",
        "delta": audio_delta_b64(&[1, 2])
    })));
    realtime.dispatch(&event(json!({
        "type": "response.output_audio.done",
        "item_id": "item-2"
    })));
    realtime.dispatch(&event(json!({
        "type": "response.done", "response": {"id": "resp-2"}
    })));

    wait_until(Duration::from_secs(2), || sink.play_count() == 1).await;
    wait_until(Duration::from_secs(2), || gate.available()).await;

    cognition.shutdown(Duration::from_secs(1)).await;
    tts.shutdown(Duration::from_secs(1)).await;
}
