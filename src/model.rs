use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Requested capability tier for a model call. Stall classification only
/// needs the fast tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Fast,
    Standard,
}

/// The model-serving collaborator. Takes a free-text prompt, returns free
/// text with no guaranteed structure beyond "may contain one JSON object".
/// Timeouts and fallback behavior are owned by the implementation, not by
/// this crate.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &str, tier: ModelTier) -> Result<String>;
}

/// Model client that shells out to a one-shot CLI (e.g. `claude -p`),
/// writing the prompt to stdin and reading the reply from stdout.
pub struct CommandModelClient {
    program: String,
    args: Vec<String>,
}

impl CommandModelClient {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("Model command must not be empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ModelClient for CommandModelClient {
    async fn complete(&self, prompt: &str, tier: ModelTier) -> Result<String> {
        debug!(program = %self.program, ?tier, "invoking model command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn model command: {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to model command")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to read model command output")?;

        if !output.status.success() {
            anyhow::bail!(
                "Model command exited with status {}",
                output.status.code().unwrap_or(-1)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandModelClient::new(&[]).is_err());
    }

    #[tokio::test]
    async fn cat_echoes_the_prompt() {
        let client = CommandModelClient::new(&["cat".to_string()]).unwrap();
        let reply = client.complete("hello", ModelTier::Fast).await.unwrap();
        assert_eq!(reply, "hello");
    }
}
