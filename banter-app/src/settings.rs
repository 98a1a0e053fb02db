//! Persistent controller settings (JSON file next to the binary, or wherever
//! `BANTER_CONFIG` points).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use banter_core::audio::DeviceSelector;
use banter_core::node::NodeConfig;
use banter_core::{CaptureConfig, RealtimeConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ControllerSettings {
    /// Remote model identifier.
    pub model: String,
    /// Preferred microphone, by exact device name.
    pub preferred_input_device: Option<String>,
    /// Alternative device selection by enumeration index.
    pub input_device_index: Option<usize>,
    pub vad_threshold: f32,
    pub vad_silence_frames: u32,
    pub min_speech_ms: u64,
    pub commit_cooldown_ms: u64,
    pub software_gain: f32,
    /// Realtime link idle teardown; 0 disables.
    pub idle_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_cap_secs: u64,
    /// Directory holding per-node JSON configs (stt.json, cognition.json,
    /// tts.json). Missing files fall back to the built-in defaults.
    pub nodes_dir: Option<PathBuf>,
    /// Append-only audit log path; `None` disables the audit node.
    pub audit_log: Option<PathBuf>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-realtime-preview".into(),
            preferred_input_device: None,
            input_device_index: None,
            vad_threshold: 0.08,
            vad_silence_frames: 10,
            min_speech_ms: 300,
            commit_cooldown_ms: 500,
            software_gain: 1.0,
            idle_timeout_secs: 90,
            reconnect_initial_ms: 1_000,
            reconnect_cap_secs: 30,
            nodes_dir: Some(PathBuf::from("config")),
            audit_log: None,
        }
    }
}

impl ControllerSettings {
    pub fn normalize(&mut self) {
        self.vad_threshold = self.vad_threshold.clamp(0.0, 1.0);
        self.software_gain = self.software_gain.clamp(0.0, 2.0);
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = Self::default().model;
        }
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }

    pub fn capture_config(&self) -> CaptureConfig {
        let device = match (&self.preferred_input_device, self.input_device_index) {
            (Some(name), _) => DeviceSelector::Name(name.clone()),
            (None, Some(index)) => DeviceSelector::Index(index),
            (None, None) => DeviceSelector::Default,
        };
        CaptureConfig {
            vad_threshold: self.vad_threshold,
            vad_silence_frames: self.vad_silence_frames,
            min_speech_duration: Duration::from_millis(self.min_speech_ms),
            commit_cooldown: Duration::from_millis(self.commit_cooldown_ms),
            software_gain: self.software_gain,
            device,
            ..CaptureConfig::default()
        }
    }

    pub fn realtime_config(&self, api_key: String) -> RealtimeConfig {
        RealtimeConfig {
            api_key,
            model: self.model.clone(),
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms.max(100)),
            reconnect_cap: Duration::from_secs(self.reconnect_cap_secs.max(1)),
            idle_timeout: match self.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            ..RealtimeConfig::default()
        }
    }

    /// Load a node's declarative config, falling back to the built-in
    /// default when no file exists. A present-but-broken file is an error —
    /// a silently ignored typo in `publishes` would be worse than a refusal
    /// to start.
    pub fn node_config(&self, name: &str, default: NodeConfig) -> anyhow::Result<NodeConfig> {
        let Some(dir) = &self.nodes_dir else {
            return Ok(default);
        };
        let path = dir.join(format!("{name}.json"));
        if !path.exists() {
            return Ok(default);
        }
        let text = fs::read_to_string(&path)?;
        let config = NodeConfig::from_json(&text)
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
        Ok(config)
    }
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("BANTER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("banter.json"))
}

/// Read settings from `path`; a missing file means defaults, a malformed
/// file is reported and replaced by defaults.
pub fn load_settings(path: &Path) -> ControllerSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<ControllerSettings>(&text) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("settings file {} is malformed ({e}) — using defaults", path.display());
                ControllerSettings::default()
            }
        },
        Err(_) => ControllerSettings::default(),
    };
    settings.normalize();
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_capture_contract() {
        let settings = ControllerSettings::default();
        let capture = settings.capture_config();
        assert_eq!(capture.sample_rate, 24_000);
        assert_eq!(capture.chunk_samples, 4_800);
        assert!((capture.vad_threshold - 0.08).abs() < 1e-6);
        assert_eq!(capture.commit_cooldown, Duration::from_millis(500));
    }

    #[test]
    fn normalize_clamps_gain_and_threshold() {
        let mut settings = ControllerSettings {
            software_gain: 9.0,
            vad_threshold: 3.0,
            model: "  ".into(),
            ..ControllerSettings::default()
        };
        settings.normalize();
        assert!((settings.software_gain - 2.0).abs() < 1e-6);
        assert!((settings.vad_threshold - 1.0).abs() < 1e-6);
        assert_eq!(settings.model, "gpt-4o-realtime-preview");
    }

    #[test]
    fn idle_timeout_zero_disables_teardown() {
        let settings = ControllerSettings {
            idle_timeout_secs: 0,
            ..ControllerSettings::default()
        };
        let config = settings.realtime_config("key".into());
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn device_name_wins_over_index() {
        let settings = ControllerSettings {
            preferred_input_device: Some("Robot Mic".into()),
            input_device_index: Some(3),
            ..ControllerSettings::default()
        };
        assert_eq!(
            settings.capture_config().device,
            DeviceSelector::Name("Robot Mic".into())
        );
    }
}
