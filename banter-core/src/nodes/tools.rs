//! Parameterized tool catalog exposed to the model.
//!
//! The session carries a *small* set of category tools instead of one tool
//! per physical primitive, so the session payload stays bounded no matter
//! how large the behavior library grows. Valid action names live in the
//! tool's prose description; validating them is our job, not the model's —
//! a near-miss is fuzzily matched, anything else goes back to the session
//! as an error with the closest valid names.

use serde_json::json;

use crate::error::{BanterError, Result};
use crate::realtime::protocol::ToolDefinition;

/// Physical behaviors the actuator driver understands.
pub const ACTION_LIBRARY: &[&str] = &[
    "forward",
    "backward",
    "turn_left",
    "turn_right",
    "spin",
    "stop",
    "sit",
    "stand",
    "stretch",
    "push_up",
    "wave_hands",
    "shake_head",
    "nod",
    "wag_tail",
    "twist_body",
    "look_around",
    "celebrate",
    "depressed",
    "think",
];

/// Clips the sound-effect collaborator can play.
pub const SOUND_LIBRARY: &[&str] = &["honk", "chirp", "siren", "powerup", "sad_trombone"];

pub const TOOL_PERFORM_ACTION: &str = "perform_action";
pub const TOOL_SNAP_PIC: &str = "snap_pic";
pub const TOOL_SOUND_EFFECT: &str = "sound_effect";

pub const TOOL_NAMES: &[&str] = &[TOOL_PERFORM_ACTION, TOOL_SNAP_PIC, TOOL_SOUND_EFFECT];

/// The tool definitions sent in `session.update`.
pub fn catalog() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            kind: "function".into(),
            name: TOOL_PERFORM_ACTION.into(),
            description: format!(
                "Perform a physical behavior with the robot body. \
                 Valid action names: {}.",
                ACTION_LIBRARY.join(", ")
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Behavior name from the valid list."
                    },
                    "speed": {
                        "type": "number",
                        "description": "Playback speed multiplier, 0.5–2.0. Default 1.0."
                    },
                    "mood": {
                        "type": "string",
                        "description": "Expressive mood coloring the motion, e.g. happy, curious, sleepy."
                    }
                },
                "required": ["name"]
            }),
        },
        ToolDefinition {
            kind: "function".into(),
            name: TOOL_SNAP_PIC.into(),
            description: "Take a photo with the onboard camera and look at it.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            kind: "function".into(),
            name: TOOL_SOUND_EFFECT.into(),
            description: format!(
                "Play a short sound effect. Valid names: {}.",
                SOUND_LIBRARY.join(", ")
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Effect name from the valid list."}
                },
                "required": ["name"]
            }),
        },
    ]
}

/// Resolve a model-supplied action name against the library.
///
/// Matching is forgiving about case, whitespace and separators, and accepts
/// small typos (edit distance ≤ 2). Anything further is an
/// [`BanterError::UnknownAction`] carrying the nearest valid names.
pub fn resolve_action(raw: &str) -> Result<&'static str> {
    resolve_in(raw, ACTION_LIBRARY)
}

/// Same resolution, against the sound-effect library.
pub fn resolve_sound(raw: &str) -> Result<&'static str> {
    resolve_in(raw, SOUND_LIBRARY)
}

/// Nearest tool names for an unknown function-call name.
pub fn nearest_tools(raw: &str) -> Vec<String> {
    nearest_in(raw, TOOL_NAMES, 3)
}

fn resolve_in(raw: &str, library: &'static [&'static str]) -> Result<&'static str> {
    let wanted = normalize(raw);
    if wanted.is_empty() {
        return Err(BanterError::UnknownAction {
            name: raw.to_string(),
            suggestions: Vec::new(),
        });
    }

    if let Some(exact) = library.iter().find(|name| **name == wanted) {
        return Ok(exact);
    }

    let (best, distance) = library
        .iter()
        .map(|name| (*name, edit_distance(&wanted, name)))
        .min_by_key(|(_, d)| *d)
        .expect("library is never empty");

    if distance <= 2 {
        Ok(best)
    } else {
        Err(BanterError::UnknownAction {
            name: raw.to_string(),
            suggestions: nearest_in(&wanted, library, 3),
        })
    }
}

fn nearest_in(raw: &str, library: &[&str], count: usize) -> Vec<String> {
    let wanted = normalize(raw);
    let mut scored: Vec<(usize, &str)> = library
        .iter()
        .map(|name| (edit_distance(&wanted, name), *name))
        .collect();
    scored.sort();
    scored
        .into_iter()
        .take(count)
        .map(|(_, name)| name.to_string())
        .collect()
}

/// Lowercase, trimmed, separators collapsed to underscores.
fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_sep = true;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}
