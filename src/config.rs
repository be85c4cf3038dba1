use crate::backend::BackendKind;
use crate::buffer::DEFAULT_BUFFER_CAP;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Orchestrator configuration, loadable from a YAML file. Every field has a
/// default so an empty file (or none at all) works.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-session output buffer cap, in lines.
    pub buffer_cap: usize,
    /// Busy-with-no-output window before the backend reports a stall.
    pub stall_timeout_ms: u64,
    /// Delay between an in-session auth command and its confirming keystroke.
    pub auth_keystroke_delay_ms: u64,
    /// Force a backend instead of probing host capability.
    pub backend: Option<BackendKind>,
    /// Explicit path to the terminal-worker binary.
    pub worker_binary: Option<PathBuf>,
    /// API key used to assemble gemini default rules. Falls back to the
    /// GEMINI_API_KEY environment variable.
    pub gemini_api_key: Option<String>,
    /// Directory for stall-classification diagnostic snapshots. Defaults to
    /// the user cache dir; set to keep snapshots elsewhere.
    pub diagnostics_dir: Option<PathBuf>,
    /// One-shot CLI invoked for stall classification.
    pub model_command: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            buffer_cap: DEFAULT_BUFFER_CAP,
            stall_timeout_ms: 4000,
            auth_keystroke_delay_ms: 250,
            backend: None,
            worker_binary: None,
            gemini_api_key: None,
            diagnostics_dir: None,
            model_command: vec!["claude".to_string(), "-p".to_string()],
            cols: 120,
            rows: 40,
        }
    }
}

impl OrchestratorConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn auth_keystroke_delay(&self) -> Duration {
        Duration::from_millis(self.auth_keystroke_delay_ms)
    }

    pub fn gemini_api_key(&self) -> Option<String> {
        self.gemini_api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
    }

    pub fn diagnostics_dir(&self) -> Option<PathBuf> {
        self.diagnostics_dir.clone().or_else(|| {
            dirs::cache_dir().map(|dir| dir.join("agent-sessions").join("diagnostics"))
        })
    }
}

/// Load configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| "Failed to parse YAML config file")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.buffer_cap, 1000);
        assert_eq!(config.stall_timeout(), Duration::from_millis(4000));
        assert!(config.backend.is_none());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "stall_timeout_ms: 2500\nbackend: native\n").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.stall_timeout_ms, 2500);
        assert_eq!(config.backend, Some(BackendKind::Native));
        assert_eq!(config.buffer_cap, 1000);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "buffer_cap: [not a number").unwrap();

        let result = load_config(file.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("parse"));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config(Path::new("/nonexistent/config.yaml")).is_err());
    }
}
