//! Blocking capture loop — gate check, VAD, and the commit protocol.
//!
//! ## Per-frame order of operations
//!
//! ```text
//! 1. Mic gate check — held gate means the frame never existed
//! 2. Drain ring → resample to 24 kHz → accumulate one 200 ms frame
//! 3. Software gain, RMS, VAD classify
//! 4. Utterance tracker:
//!      idle ──loud──► active   (emit input_audio_buffer.clear)
//!      active: stream + buffer every frame
//!      active ──silence run──► end-of-speech
//!          too short            → discard silently
//!          gate closed          → discard, no commit
//!          within cooldown      → back to idle, no commit
//!          otherwise            → commit, and response.create iff no
//!                                 response is already in flight
//! ```
//!
//! The whole loop runs under `spawn_blocking`; the tokio executor never
//! waits on the audio device.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    buffering::{frame::AudioFrame, AudioConsumer, Consumer},
    capture::CaptureConfig,
    gate::MicGate,
    realtime::{protocol::ClientEvent, RealtimeHandle},
    vad::{VadDecision, VoiceActivityDetector},
};

/// Live per-frame observability event (RMS + VAD + gate view).
#[derive(Debug, Clone, Copy)]
pub struct CaptureActivityEvent {
    pub seq: u64,
    pub rms: f32,
    pub speech_active: bool,
    pub gated: bool,
}

#[derive(Default)]
pub struct CaptureDiagnostics {
    pub samples_in: AtomicU64,
    pub frames_processed: AtomicU64,
    pub frames_gated: AtomicU64,
    pub frames_streamed: AtomicU64,
    pub utterances_started: AtomicU64,
    pub utterances_too_short: AtomicU64,
    pub utterances_gate_discarded: AtomicU64,
    pub cooldown_suppressed: AtomicU64,
    pub commits: AtomicU64,
    pub commits_skipped_offline: AtomicU64,
    pub responses_requested: AtomicU64,
}

impl CaptureDiagnostics {
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_gated: self.frames_gated.load(Ordering::Relaxed),
            frames_streamed: self.frames_streamed.load(Ordering::Relaxed),
            utterances_started: self.utterances_started.load(Ordering::Relaxed),
            utterances_too_short: self.utterances_too_short.load(Ordering::Relaxed),
            utterances_gate_discarded: self.utterances_gate_discarded.load(Ordering::Relaxed),
            cooldown_suppressed: self.cooldown_suppressed.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commits_skipped_offline: self.commits_skipped_offline.load(Ordering::Relaxed),
            responses_requested: self.responses_requested.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureSnapshot {
    pub samples_in: u64,
    pub frames_processed: u64,
    pub frames_gated: u64,
    pub frames_streamed: u64,
    pub utterances_started: u64,
    pub utterances_too_short: u64,
    pub utterances_gate_discarded: u64,
    pub cooldown_suppressed: u64,
    pub commits: u64,
    pub commits_skipped_offline: u64,
    pub responses_requested: u64,
}

// ---------------------------------------------------------------------------
// Utterance tracker
// ---------------------------------------------------------------------------

/// What the tracker decided about one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    /// Silence while idle — nothing to do.
    Quiet,
    /// First loud frame: the utterance begins (caller emits `clear`).
    SpeechStarted,
    /// Utterance in progress: caller streams and buffers the frame.
    SpeechContinuing,
    /// Utterance ended below the minimum duration — discard silently.
    TooShort,
    /// Utterance ended while the gate closed mid-stream — discard.
    GateClosed,
    /// Utterance ended inside the commit cooldown — no commit.
    CooldownSuppressed,
    /// Utterance ended cleanly — caller runs the commit protocol.
    EndOfSpeech,
}

/// Client-side turn detection state machine. Pure decisions on injected
/// monotonic timestamps; the pipeline performs the side effects.
pub struct UtteranceTracker {
    silence_limit: u32,
    min_speech: std::time::Duration,
    cooldown: std::time::Duration,
    speech_start: Option<Instant>,
    silence_frames: u32,
    last_commit: Option<Instant>,
}

impl UtteranceTracker {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            silence_limit: config.vad_silence_frames,
            min_speech: config.min_speech_duration,
            cooldown: config.commit_cooldown,
            speech_start: None,
            silence_frames: 0,
            last_commit: None,
        }
    }

    pub fn speech_active(&self) -> bool {
        self.speech_start.is_some()
    }

    /// Drop the in-flight utterance (gate closed, shutdown). The commit
    /// cooldown clock is left alone.
    pub fn reset(&mut self) {
        self.speech_start = None;
        self.silence_frames = 0;
    }

    /// Record that a commit actually went out; starts the cooldown window.
    pub fn note_committed(&mut self, now: Instant) {
        self.last_commit = Some(now);
    }

    pub fn observe(&mut self, decision: VadDecision, now: Instant, gate_open: bool) -> FrameVerdict {
        match (self.speech_start, decision) {
            (None, VadDecision::Silence) => FrameVerdict::Quiet,
            (None, VadDecision::Speech) => {
                self.speech_start = Some(now);
                self.silence_frames = 0;
                FrameVerdict::SpeechStarted
            }
            (Some(_), VadDecision::Speech) => {
                self.silence_frames = 0;
                FrameVerdict::SpeechContinuing
            }
            (Some(started), VadDecision::Silence) => {
                self.silence_frames += 1;
                if self.silence_frames < self.silence_limit {
                    return FrameVerdict::SpeechContinuing;
                }

                // End of speech: decide the utterance's fate.
                self.speech_start = None;
                self.silence_frames = 0;

                if now.duration_since(started) < self.min_speech {
                    return FrameVerdict::TooShort;
                }
                if !gate_open {
                    return FrameVerdict::GateClosed;
                }
                if let Some(last) = self.last_commit {
                    if now.duration_since(last) < self.cooldown {
                        return FrameVerdict::CooldownSuppressed;
                    }
                }
                FrameVerdict::EndOfSpeech
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Everything the capture loop needs, passed as one struct.
pub struct PipelineContext {
    pub config: CaptureConfig,
    pub vad: Box<dyn VoiceActivityDetector>,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub gate: MicGate,
    pub realtime: RealtimeHandle,
    pub activity_tx: broadcast::Sender<CaptureActivityEvent>,
    pub diagnostics: Arc<CaptureDiagnostics>,
    /// Rate of samples arriving on the ring (device rate).
    pub capture_sample_rate: u32,
}

/// Sleep when the ring is empty, to avoid burning a core.
const EMPTY_SLEEP_MS: u64 = 5;

/// Run the blocking capture loop until `ctx.running` goes false.
pub fn run(mut ctx: PipelineContext) {
    info!("capture loop started");

    let mut adapter = match crate::audio::resample::RateAdapter::new(
        ctx.capture_sample_rate,
        ctx.config.sample_rate,
        ctx.config.drain_samples,
    ) {
        Ok(a) => a,
        Err(e) => {
            warn!("failed to create rate adapter: {e}");
            return;
        }
    };

    let mut tracker = UtteranceTracker::new(&ctx.config);
    // Raw reads from the ring, at the device rate.
    let mut raw = vec![0f32; ctx.config.drain_samples];
    // Samples at 24 kHz waiting to fill one 200 ms frame.
    let mut pending: Vec<f32> = Vec::with_capacity(ctx.config.chunk_samples * 2);
    // Frames of the current utterance since the last commit.
    let mut utterance_buf: Vec<f32> = Vec::new();
    let mut activity_seq = 0u64;
    let mut last_frame_at = Instant::now();

    while ctx.running.load(Ordering::Relaxed) {
        // ── 1. Gate check precedes every read ────────────────────────────
        if !ctx.gate.available() {
            // Drain and discard whatever the callback wrote; drop all local
            // utterance state so nothing of our own noise survives.
            let mut discarded = 0usize;
            loop {
                let n = ctx.consumer.pop_slice(&mut raw);
                if n == 0 {
                    break;
                }
                discarded += n;
            }
            if tracker.speech_active() || !pending.is_empty() || !utterance_buf.is_empty() {
                debug!(discarded, "gate held: clearing in-flight capture state");
            }
            tracker.reset();
            ctx.vad.reset();
            pending.clear();
            utterance_buf.clear();
            ctx.diagnostics.frames_gated.fetch_add(1, Ordering::Relaxed);

            let _ = ctx.activity_tx.send(CaptureActivityEvent {
                seq: activity_seq,
                rms: 0.0,
                speech_active: false,
                gated: true,
            });
            activity_seq += 1;

            std::thread::sleep(std::time::Duration::from_millis(EMPTY_SLEEP_MS));
            continue;
        }

        // ── 2. Drain ring, resample, accumulate ──────────────────────────
        let n = ctx.consumer.pop_slice(&mut raw);
        if n > 0 {
            ctx.diagnostics
                .samples_in
                .fetch_add(n as u64, Ordering::Relaxed);
            pending.extend_from_slice(&adapter.process(&raw[..n]));
        }

        let frame_ready = pending.len() >= ctx.config.chunk_samples;
        let idle_flush_due = !pending.is_empty()
            && tracker.speech_active()
            && last_frame_at.elapsed() >= ctx.config.idle_flush;

        if !frame_ready && !idle_flush_due {
            if n == 0 {
                std::thread::sleep(std::time::Duration::from_millis(EMPTY_SLEEP_MS));
            }
            continue;
        }

        let take = pending.len().min(ctx.config.chunk_samples);
        let mut samples: Vec<f32> = pending.drain(..take).collect();
        last_frame_at = Instant::now();

        // ── 3. Gain + loudness + VAD ─────────────────────────────────────
        apply_software_gain(&mut samples, ctx.config.software_gain);
        let frame = AudioFrame::new(samples, ctx.config.sample_rate);
        let rms = frame.rms();
        let decision = ctx.vad.classify(&frame);
        ctx.diagnostics
            .frames_processed
            .fetch_add(1, Ordering::Relaxed);

        // ── 4. Utterance tracking + commit protocol ──────────────────────
        let now = Instant::now();
        let verdict = tracker.observe(decision, now, ctx.gate.available());

        let _ = ctx.activity_tx.send(CaptureActivityEvent {
            seq: activity_seq,
            rms,
            speech_active: tracker.speech_active(),
            gated: false,
        });
        activity_seq += 1;

        match verdict {
            FrameVerdict::Quiet => {}

            FrameVerdict::SpeechStarted => {
                debug!(rms = format_args!("{rms:.4}"), "speech started");
                ctx.diagnostics
                    .utterances_started
                    .fetch_add(1, Ordering::Relaxed);
                // Isolate this utterance from whatever chatter the remote
                // buffer accumulated, then stream the triggering frame.
                ctx.realtime.send(ClientEvent::InputAudioBufferClear {});
                stream_frame(&mut ctx, &frame, &mut utterance_buf);
            }

            FrameVerdict::SpeechContinuing => {
                stream_frame(&mut ctx, &frame, &mut utterance_buf);
            }

            FrameVerdict::TooShort => {
                debug!("utterance below minimum duration — discarded");
                ctx.diagnostics
                    .utterances_too_short
                    .fetch_add(1, Ordering::Relaxed);
                ctx.vad.reset();
                utterance_buf.clear();
            }

            FrameVerdict::GateClosed => {
                debug!("gate closed mid-utterance — discarded without commit");
                ctx.diagnostics
                    .utterances_gate_discarded
                    .fetch_add(1, Ordering::Relaxed);
                ctx.vad.reset();
                utterance_buf.clear();
            }

            FrameVerdict::CooldownSuppressed => {
                debug!("end of speech within commit cooldown — suppressed");
                ctx.diagnostics
                    .cooldown_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                ctx.vad.reset();
                utterance_buf.clear();
            }

            FrameVerdict::EndOfSpeech => {
                finish_utterance(&mut ctx, &mut tracker, &mut utterance_buf);
            }
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        frames = snap.frames_processed,
        utterances = snap.utterances_started,
        commits = snap.commits,
        responses_requested = snap.responses_requested,
        "capture loop stopped"
    );
}

fn stream_frame(ctx: &mut PipelineContext, frame: &AudioFrame, utterance_buf: &mut Vec<f32>) {
    utterance_buf.extend_from_slice(&frame.samples);
    ctx.realtime.stream_audio(&frame.samples);
    ctx.diagnostics
        .frames_streamed
        .fetch_add(1, Ordering::Relaxed);
}

/// The commit protocol: pause reads, commit, then request a response iff
/// none is in flight.
fn finish_utterance(
    ctx: &mut PipelineContext,
    tracker: &mut UtteranceTracker,
    utterance_buf: &mut Vec<f32>,
) {
    if !ctx.realtime.flags().is_connected() {
        warn!("link down at end of speech — commit paused");
        ctx.diagnostics
            .commits_skipped_offline
            .fetch_add(1, Ordering::Relaxed);
        ctx.vad.reset();
        utterance_buf.clear();
        return;
    }

    // Brief read pause so the remote sees the buffer settle before the
    // commit lands.
    std::thread::sleep(ctx.config.commit_pause);

    ctx.realtime.send(ClientEvent::InputAudioBufferCommit {});
    tracker.note_committed(Instant::now());
    ctx.diagnostics.commits.fetch_add(1, Ordering::Relaxed);

    let duration_secs =
        utterance_buf.len() as f64 / f64::from(ctx.config.sample_rate.max(1));
    utterance_buf.clear();
    ctx.vad.reset();

    if ctx.realtime.flags().try_begin_response() {
        ctx.realtime.send(ClientEvent::ResponseCreate {
            response: crate::realtime::protocol::ResponseParams::default(),
        });
        ctx.diagnostics
            .responses_requested
            .fetch_add(1, Ordering::Relaxed);
        info!(
            duration_secs = format_args!("{duration_secs:.2}"),
            "utterance committed, response requested"
        );
    } else {
        info!(
            duration_secs = format_args!("{duration_secs:.2}"),
            "utterance committed while a response is in flight — no new request"
        );
    }
}

fn apply_software_gain(samples: &mut [f32], gain: f32) {
    let gain = gain.clamp(0.0, 2.0);
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}
