//! Wire protocol for the remote realtime voice API.
//!
//! JSON events over a duplex WebSocket, tagged by a `type` field. Only the
//! vocabulary this controller actually speaks is modeled; unknown inbound
//! event types collapse into [`ServerEvent::Other`] so protocol additions on
//! the remote side never break dispatch.
//!
//! Audio payloads are base64-encoded PCM16 LE mono at 24 kHz.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffering::frame;
use crate::error::{BanterError, Result};

// ---------------------------------------------------------------------------
// Session configuration
// ---------------------------------------------------------------------------

/// Session parameters sent in `session.update`.
///
/// `turn_detection` is always serialized, even as `null` — explicit null is
/// what disables the remote's server-side VAD in favor of ours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    pub turn_detection: Option<Value>,
    pub tools: Vec<ToolDefinition>,
}

impl SessionConfig {
    /// Client-side-VAD session: text+audio, PCM16, transcription on,
    /// remote turn detection off.
    pub fn new(instructions: &str, voice: &str, tools: Vec<ToolDefinition>) -> Self {
        Self {
            modalities: vec!["text".into(), "audio".into()],
            instructions: instructions.to_string(),
            voice: voice.to_string(),
            input_audio_format: "pcm16".into(),
            output_audio_format: "pcm16".into(),
            input_audio_transcription: Some(TranscriptionConfig {
                model: "whisper-1".into(),
            }),
            turn_detection: None,
            tools,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// A callable tool exposed to the model through the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Client → server events
// ---------------------------------------------------------------------------

/// A single item appended to the remote conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    /// Result (or error text) of a tool call the model requested.
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
    /// An out-of-band message injected by the controller.
    #[serde(rename = "message")]
    Message {
        role: String,
        content: Vec<ContentPart>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}

/// Directives this controller emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Stream one audio frame into the remote input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    /// Finalize the current utterance; creates a user message remotely.
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit {},

    /// Discard whatever the remote buffer accumulated.
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear {},

    /// Ask the remote to produce a response (text + audio).
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseParams },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseParams {
    pub modalities: Vec<String>,
}

impl Default for ResponseParams {
    fn default() -> Self {
        Self {
            modalities: vec!["text".into(), "audio".into()],
        }
    }
}

impl ClientEvent {
    /// Build an `input_audio_buffer.append` from f32 samples.
    pub fn append_from_samples(samples: &[f32]) -> Self {
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            pcm.extend_from_slice(&frame::f32_to_pcm16(s).to_le_bytes());
        }
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64.encode(pcm),
        }
    }

    /// Audio frames are the only events the outbound queue may shed.
    pub fn is_audio_append(&self) -> bool {
        matches!(self, ClientEvent::InputAudioBufferAppend { .. })
    }

    /// Wire name of this directive, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit {} => "input_audio_buffer.commit",
            ClientEvent::InputAudioBufferClear {} => "input_audio_buffer.clear",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
        }
    }
}

/// Decode a base64 PCM16 audio payload into i16 samples.
pub fn decode_audio_payload(b64: &str) -> Result<Vec<i16>> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| BanterError::Protocol(format!("bad audio payload: {e}")))?;
    Ok(frame::pcm16_from_le_bytes(&bytes))
}

// ---------------------------------------------------------------------------
// Server → client events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// An output item announced inside a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
}

/// Events this controller consumes. Extra fields the remote sends are
/// ignored; unknown event types become `Other`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(rename = "session.created")]
    SessionCreated {},

    #[serde(rename = "session.updated")]
    SessionUpdated {},

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioBufferCleared {},

    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        item_id: String,
        delta: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        item_id: String,
        transcript: String,
    },

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseMeta },

    #[serde(rename = "response.output_item.added")]
    ResponseOutputItemAdded { item: OutputItem },

    #[serde(rename = "response.output_text.delta")]
    ResponseTextDelta { item_id: String, delta: String },

    #[serde(rename = "response.output_text.done")]
    ResponseTextDone { item_id: String, text: String },

    #[serde(rename = "response.output_audio.delta")]
    ResponseAudioDelta { item_id: String, delta: String },

    #[serde(rename = "response.output_audio.done")]
    ResponseAudioDone { item_id: String },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        item_id: String,
        call_id: String,
        name: String,
        arguments: String,
    },

    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseMeta },

    /// Any event type this controller does not model.
    #[serde(other)]
    Other,
}

/// Registry key for event handlers. `ConnectionClosed` is never on the wire —
/// the link synthesizes it locally when the socket drops so subscribers can
/// reset per-item state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    SessionCreated,
    SessionUpdated,
    InputAudioBufferCommitted,
    InputAudioBufferCleared,
    TranscriptionDelta,
    TranscriptionCompleted,
    ResponseCreated,
    ResponseOutputItemAdded,
    ResponseTextDelta,
    ResponseTextDone,
    ResponseAudioDelta,
    ResponseAudioDone,
    FunctionCallArgumentsDone,
    ResponseDone,
    Other,
    ConnectionClosed,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Error { .. } => EventKind::Error,
            ServerEvent::SessionCreated {} => EventKind::SessionCreated,
            ServerEvent::SessionUpdated {} => EventKind::SessionUpdated,
            ServerEvent::InputAudioBufferCommitted { .. } => EventKind::InputAudioBufferCommitted,
            ServerEvent::InputAudioBufferCleared {} => EventKind::InputAudioBufferCleared,
            ServerEvent::TranscriptionDelta { .. } => EventKind::TranscriptionDelta,
            ServerEvent::TranscriptionCompleted { .. } => EventKind::TranscriptionCompleted,
            ServerEvent::ResponseCreated { .. } => EventKind::ResponseCreated,
            ServerEvent::ResponseOutputItemAdded { .. } => EventKind::ResponseOutputItemAdded,
            ServerEvent::ResponseTextDelta { .. } => EventKind::ResponseTextDelta,
            ServerEvent::ResponseTextDone { .. } => EventKind::ResponseTextDone,
            ServerEvent::ResponseAudioDelta { .. } => EventKind::ResponseAudioDelta,
            ServerEvent::ResponseAudioDone { .. } => EventKind::ResponseAudioDone,
            ServerEvent::FunctionCallArgumentsDone { .. } => EventKind::FunctionCallArgumentsDone,
            ServerEvent::ResponseDone { .. } => EventKind::ResponseDone,
            ServerEvent::Other => EventKind::Other,
        }
    }
}
