//! Direct-command bypass — short-circuits the model for trivial commands.
//!
//! A pre-handler stage in the STT pipeline: when a final transcript is
//! exactly one of a small set of literal phrases, the STT node publishes the
//! mapped `robot_action` itself instead of a `voice_command`. Off by
//! default; matching is deliberately strict (whole phrase only) so a
//! sentence that merely contains "stop" still reaches the model.

use chrono::Utc;

use crate::bus::topics::{ActionStep, RobotAction};

/// Phrase → behavior table for the bypass.
const DIRECT_COMMANDS: &[(&str, &str)] = &[
    ("stop", "stop"),
    ("sit", "sit"),
    ("sit down", "sit"),
    ("stand", "stand"),
    ("stand up", "stand"),
    ("come here", "forward"),
    ("go back", "backward"),
    ("turn left", "turn_left"),
    ("turn right", "turn_right"),
    ("wave", "wave_hands"),
    ("good boy", "wag_tail"),
];

/// Matches finalized transcripts against the literal phrase table.
#[derive(Debug, Default, Clone)]
pub struct DirectCommandFilter;

impl DirectCommandFilter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Return the bypass action for `transcript`, if the whole phrase maps.
    pub fn match_command(&self, transcript: &str) -> Option<RobotAction> {
        let normalized = normalize(transcript);
        let action = DIRECT_COMMANDS
            .iter()
            .find(|(phrase, _)| *phrase == normalized)
            .map(|(_, action)| *action)?;

        Some(RobotAction {
            actions: vec![ActionStep {
                name: action.to_string(),
                speed: 1.0,
            }],
            mood: "neutral".into(),
            priority: 2,
            timestamp: Utc::now(),
        })
    }
}

/// Lowercase, strip punctuation, collapse whitespace.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if c.is_whitespace() && !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}
