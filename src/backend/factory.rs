use super::{BackendKind, NativeBackend, SessionBackend, WorkerBackend};
use crate::config::OrchestratorConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the external terminal-worker binary probed on PATH.
pub const WORKER_BINARY_NAME: &str = "agent-pty-worker";

/// Builds the session backend. The choice between the two variants is made
/// exactly once, here; call sites only ever see `dyn SessionBackend`.
pub struct BackendFactory;

impl BackendFactory {
    /// Select a backend from config, probing host capability when no
    /// explicit choice is configured: a reachable worker binary wins,
    /// otherwise sessions are managed in-process.
    pub async fn create(config: &OrchestratorConfig) -> Result<Arc<dyn SessionBackend>> {
        match config.backend {
            Some(BackendKind::Native) => Self::create_native(config),
            Some(BackendKind::Worker) => {
                let path = Self::probe_worker_binary(config).context(
                    "worker backend requested but no worker binary found; \
                     set worker_binary or install agent-pty-worker",
                )?;
                Self::create_worker(config, path).await
            }
            None => match Self::probe_worker_binary(config) {
                Some(path) => match Self::create_worker(config, path).await {
                    Ok(backend) => Ok(backend),
                    Err(e) => {
                        warn!("worker backend failed to start, falling back to native: {e:#}");
                        Self::create_native(config)
                    }
                },
                None => {
                    debug!("no worker binary found, using native backend");
                    Self::create_native(config)
                }
            },
        }
    }

    fn create_native(config: &OrchestratorConfig) -> Result<Arc<dyn SessionBackend>> {
        info!("creating native terminal backend");
        let backend = NativeBackend::new(config.stall_timeout())?;
        Ok(Arc::new(backend))
    }

    async fn create_worker(
        config: &OrchestratorConfig,
        path: PathBuf,
    ) -> Result<Arc<dyn SessionBackend>> {
        info!(path = %path.display(), "creating worker terminal backend");
        let backend = WorkerBackend::start(&path, config.stall_timeout()).await?;
        Ok(Arc::new(backend))
    }

    /// Host capability probe: an explicitly configured binary that exists,
    /// or the well-known name on PATH.
    fn probe_worker_binary(config: &OrchestratorConfig) -> Option<PathBuf> {
        if let Some(path) = &config.worker_binary {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(
                path = %path.display(),
                "configured worker binary does not exist, probing PATH instead"
            );
        }
        which::which(WORKER_BINARY_NAME).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn native_is_selected_when_forced() {
        let config = OrchestratorConfig {
            backend: Some(BackendKind::Native),
            ..OrchestratorConfig::default()
        };
        let backend = BackendFactory::create(&config).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Native);
    }

    #[tokio::test]
    async fn forced_worker_without_binary_fails() {
        let config = OrchestratorConfig {
            backend: Some(BackendKind::Worker),
            worker_binary: Some(PathBuf::from("/nonexistent/agent-pty-worker")),
            ..OrchestratorConfig::default()
        };
        // nothing named agent-pty-worker on PATH in test environments
        if which::which(WORKER_BINARY_NAME).is_err() {
            assert!(BackendFactory::create(&config).await.is_err());
        }
    }
}
