//! Stable bus topic names and payload shapes.
//!
//! Topic payloads cross node boundaries as JSON, so every shape here derives
//! `Serialize` + `Deserialize` and is the single source of truth for what a
//! subscriber may assume about an envelope (handlers deserialize into these
//! and treat a mismatch as a handler error).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const VOICE_COMMAND: &str = "voice_command";
pub const TEXT_RESPONSE: &str = "text_response";
pub const ROBOT_ACTION: &str = "robot_action";
pub const SNAP_PIC: &str = "snap_pic";
pub const VISUAL_DATA: &str = "visual_data";
pub const SPEAKING_STATUS: &str = "speaking_status";
pub const LISTENING_STATUS: &str = "listening_status";
pub const NAVIGATION_STATUS: &str = "navigation_status";
pub const SYSTEM_MODE: &str = "system_mode";
pub const SOUND_EFFECT: &str = "sound_effect";

/// Every topic the bus knows about. Node configs are validated against this
/// list at load time so a typo fails fast instead of publishing into a void.
pub const ALL_TOPICS: &[&str] = &[
    VOICE_COMMAND,
    TEXT_RESPONSE,
    ROBOT_ACTION,
    SNAP_PIC,
    VISUAL_DATA,
    SPEAKING_STATUS,
    LISTENING_STATUS,
    NAVIGATION_STATUS,
    SYSTEM_MODE,
    SOUND_EFFECT,
];

pub fn is_known_topic(name: &str) -> bool {
    ALL_TOPICS.contains(&name)
}

/// A finalized user utterance, published by the STT node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceCommand {
    pub text: String,
    /// Transcription confidence in [0, 1]; 1.0 when the remote omits it.
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub conversation_id: String,
}

/// The model's spoken/written reply, published by the Cognition node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResponse {
    pub text: String,
    pub conversation_id: String,
    pub timestamp: DateTime<Utc>,
}

/// One step of a physical behavior sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub name: String,
    /// Playback speed multiplier; 1.0 is the library default.
    pub speed: f32,
}

/// Side effect routed to the actuator driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotAction {
    pub actions: Vec<ActionStep>,
    pub mood: String,
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
}

/// Request for the camera collaborator to take a picture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapPic {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Camera output, inbound to the Cognition node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualData {
    /// Base64-encoded image bytes.
    pub image_bytes: String,
    pub capture_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakingStatus {
    pub speaking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListeningStatus {
    pub listening: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavState {
    Idle,
    Executing,
    Completed,
    Error,
}

/// Progress of the navigation collaborator; drives the "moving" mic hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationStatus {
    pub status: NavState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Idle,
    Listening,
    Speaking,
    Thinking,
    Error,
}

/// Coarse whole-robot mode, for indicator collaborators (LED ring etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMode {
    pub mode: Mode,
    pub timestamp: DateTime<Utc>,
}

/// Request for the sound-effect collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundEffect {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_command_serializes_with_spec_field_names() {
        let cmd = VoiceCommand {
            text: "hello robot".into(),
            confidence: 0.93,
            timestamp: Utc::now(),
            conversation_id: "conv-1".into(),
        };
        let json = serde_json::to_value(&cmd).expect("serialize voice command");
        assert_eq!(json["text"], "hello robot");
        assert_eq!(json["conversation_id"], "conv-1");
        let conf = json["confidence"].as_f64().expect("confidence is a number");
        assert!((conf - 0.93).abs() < 1e-5);
    }

    #[test]
    fn nav_state_round_trips_lowercase() {
        let json = serde_json::to_value(NavState::Executing).unwrap();
        assert_eq!(json, "executing");
        let back: NavState = serde_json::from_value(json).unwrap();
        assert_eq!(back, NavState::Executing);
    }

    #[test]
    fn nav_state_rejects_other_casing() {
        assert!(serde_json::from_str::<NavState>(r#""Executing""#).is_err());
    }

    #[test]
    fn speaking_status_omits_missing_text() {
        let status = SpeakingStatus {
            speaking: false,
            text: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("text").is_none());
    }

    #[test]
    fn robot_action_round_trip() {
        let action = RobotAction {
            actions: vec![ActionStep {
                name: "wave_hands".into(),
                speed: 1.2,
            }],
            mood: "happy".into(),
            priority: 1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&action).unwrap();
        let back: RobotAction = serde_json::from_value(json).unwrap();
        assert_eq!(back.actions[0].name, "wave_hands");
        assert_eq!(back.priority, 1);
    }

    #[test]
    fn topic_catalog_is_consistent() {
        assert!(is_known_topic(VOICE_COMMAND));
        assert!(is_known_topic(SYSTEM_MODE));
        assert!(!is_known_topic("no_such_topic"));
    }
}
