use crate::backend::BackendError;
use thiserror::Error;

/// Caller-facing error taxonomy.
///
/// Background work (classification, diagnostics, default-rule pushing) never
/// surfaces through this type; those failures are logged and swallowed.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is not running")]
    NotRunning,
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
