use thiserror::Error;

/// All errors produced by banter-core.
#[derive(Debug, Error)]
pub enum BanterError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("node `{node}` may not publish topic `{topic}`")]
    PermissionDenied { node: String, topic: String },

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("node `{0}` is already registered")]
    NodeAlreadyRegistered(String),

    #[error("node config error: {0}")]
    NodeConfig(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("realtime session error: {0}")]
    Realtime(String),

    #[error("protocol error from remote: {0}")]
    Protocol(String),

    #[error("realtime session is not connected")]
    NotConnected,

    #[error("unknown action `{name}`{}", suggestion_suffix(.suggestions))]
    UnknownAction {
        name: String,
        suggestions: Vec<String>,
    },

    #[error("malformed tool arguments: {0}")]
    ToolArguments(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn suggestion_suffix(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" — did you mean one of: {}?", suggestions.join(", "))
    }
}

pub type Result<T> = std::result::Result<T, BanterError>;
