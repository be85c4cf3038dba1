pub mod factory;
pub mod keys;
pub mod native;
pub mod worker;

use crate::adapter::AgentType;
use crate::rules::AutoResponseRule;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::broadcast;

pub use factory::BackendFactory;
pub use native::NativeBackend;
pub use worker::WorkerBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn session: {0}")]
    Spawn(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("communication error: {0}")]
    Communication(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Lifecycle signals emitted by a backend for one session. The orchestrator
/// reacts to these; it never decides them itself (stall resolution excepted).
///
/// The serde shape doubles as the worker backend's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BackendEvent {
    /// The agent is idle at its prompt and accepts input.
    Ready,
    /// A chunk of raw terminal output.
    Output { data: String },
    /// The agent is blocked on a mid-task question.
    #[serde(rename_all = "camelCase")]
    BlockingPrompt { prompt: String },
    /// The agent requires a login before it can continue.
    LoginRequired,
    /// Fast-path completion detected by the adapter's own heuristics.
    #[serde(rename_all = "camelCase")]
    TaskComplete {
        #[serde(default)]
        summary: Option<String>,
    },
    /// Busy with no output past the configured timeout.
    #[serde(rename_all = "camelCase")]
    Stalled {
        #[serde(default)]
        recent_output: String,
    },
    /// The underlying process exited.
    #[serde(rename_all = "camelCase")]
    Exit { code: Option<i32> },
    /// Backend-level failure affecting only this session.
    #[serde(rename_all = "camelCase")]
    Error { message: String },
    /// Backend-specific informational event, forwarded verbatim.
    #[serde(rename_all = "camelCase")]
    Message {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl BackendEvent {
    /// Event name as forwarded to orchestrator listeners.
    pub fn name(&self) -> &str {
        match self {
            BackendEvent::Ready => "ready",
            BackendEvent::Output { .. } => "output",
            BackendEvent::BlockingPrompt { .. } => "blocking_prompt",
            BackendEvent::LoginRequired => "login_required",
            BackendEvent::TaskComplete { .. } => "task_complete",
            BackendEvent::Stalled { .. } => "stalled",
            BackendEvent::Exit { .. } => "exit",
            BackendEvent::Error { .. } => "error",
            BackendEvent::Message { name, .. } => name,
        }
    }
}

/// Everything a backend needs to create a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnConfig {
    pub session_id: String,
    pub agent_type: AgentType,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Backend-side session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSession {
    pub id: String,
    pub agent_type: AgentType,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process PTY management.
    Native,
    /// Sessions emulated by an external terminal-worker process.
    Worker,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" => Ok(BackendKind::Native),
            "worker" => Ok(BackendKind::Worker),
            _ => Err(BackendError::Unavailable(format!(
                "Unknown backend kind: {}",
                s
            ))),
        }
    }
}

/// The session-control contract both backends implement. The orchestrator
/// holds exactly one `dyn SessionBackend`, selected once at construction;
/// call sites never downcast to a concrete variant.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn spawn(&self, config: SpawnConfig) -> BackendResult<BackendSession>;

    /// Send task text, submitted with Enter. Marks the session busy.
    async fn send(&self, id: &str, text: &str) -> BackendResult<()>;

    /// Send raw key names without touching the busy state.
    async fn send_keys(&self, id: &str, keys: &[String]) -> BackendResult<()>;

    async fn stop(&self, id: &str) -> BackendResult<()>;

    async fn get(&self, id: &str) -> Option<BackendSession>;

    async fn list(&self) -> Vec<BackendSession>;

    async fn add_auto_response_rule(&self, id: &str, rule: AutoResponseRule) -> BackendResult<()>;

    /// Lifecycle event stream, shared across all sessions.
    fn subscribe_events(&self) -> broadcast::Receiver<(String, BackendEvent)>;

    /// Per-session raw output stream.
    async fn subscribe_output(&self, id: &str) -> BackendResult<broadcast::Receiver<String>>;

    fn kind(&self) -> BackendKind;

    /// Release backend-wide resources on orchestrator shutdown.
    async fn cleanup(&self) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format_round_trips() {
        let event = BackendEvent::Stalled {
            recent_output: "tail".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"stalled","recentOutput":"tail"}"#);

        let parsed: BackendEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, BackendEvent::Stalled { recent_output } if recent_output == "tail"));
    }

    #[test]
    fn event_names() {
        assert_eq!(BackendEvent::Ready.name(), "ready");
        assert_eq!(
            BackendEvent::TaskComplete { summary: None }.name(),
            "task_complete"
        );
        assert_eq!(
            BackendEvent::Message {
                name: "spawned".to_string(),
                data: serde_json::Value::Null,
            }
            .name(),
            "spawned"
        );
    }

    #[test]
    fn backend_kind_parses() {
        assert_eq!("native".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert_eq!("Worker".parse::<BackendKind>().unwrap(), BackendKind::Worker);
        assert!("direct".parse::<BackendKind>().is_err());
    }
}
