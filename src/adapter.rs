use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Supported agent flavors. `Shell` is a plain interactive shell; the rest
/// are named coding-agent CLIs with their own readiness and completion
/// signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Shell,
    Claude,
    Aider,
    Gemini,
    Codex,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Shell => "shell",
            AgentType::Claude => "claude",
            AgentType::Aider => "aider",
            AgentType::Gemini => "gemini",
            AgentType::Codex => "codex",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "shell" => Ok(AgentType::Shell),
            "claude" => Ok(AgentType::Claude),
            "aider" => Ok(AgentType::Aider),
            "gemini" => Ok(AgentType::Gemini),
            "codex" => Ok(AgentType::Codex),
            _ => Err(anyhow::anyhow!("Unknown agent type: {}", s)),
        }
    }
}

/// Permission posture passed through to the agent command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPreset {
    Default,
    AcceptEdits,
    Full,
}

/// Per-agent-type heuristics. Adapters own readiness and fast-path
/// completion detection; the orchestrator only reacts to the signals the
/// backend derives from them.
pub trait AgentAdapter: Send + Sync {
    /// Tag used for metrics keys and default-rule selection.
    fn adapter_type(&self) -> &'static str;

    /// Command line used to launch this agent inside the terminal.
    fn launch_command(&self, approval: Option<ApprovalPreset>) -> Vec<String>;

    /// Whether the sanitized screen tail shows the agent idle at its prompt.
    fn is_ready(&self, screen: &str) -> bool;

    /// Fast-path completion: the agent printed its completion signature and
    /// is back at an idle prompt.
    fn is_complete(&self, screen: &str) -> bool;

    /// In-session command that starts the agent's login flow, if it has one.
    fn auth_command(&self) -> Option<&'static str> {
        None
    }

    /// Whether recent output indicates the agent is waiting for a login.
    fn needs_login(&self, _recent: &str) -> bool {
        false
    }
}

pub fn adapter_for(agent_type: AgentType) -> Result<Arc<dyn AgentAdapter>> {
    Ok(match agent_type {
        AgentType::Shell => Arc::new(ShellAdapter::new()?),
        AgentType::Claude => Arc::new(ClaudeAdapter::new()?),
        AgentType::Aider => Arc::new(AiderAdapter::new()?),
        AgentType::Gemini => Arc::new(GeminiAdapter::new()?),
        AgentType::Codex => Arc::new(CodexAdapter::new()?),
    })
}

fn last_line(screen: &str) -> &str {
    screen
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("Failed to compile adapter pattern: {pattern}"))
}

pub struct ShellAdapter {
    prompt: Regex,
}

impl ShellAdapter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            prompt: compile(r"[$>#%❯➜]\s*$")?,
        })
    }
}

impl AgentAdapter for ShellAdapter {
    fn adapter_type(&self) -> &'static str {
        "shell"
    }

    fn launch_command(&self, _approval: Option<ApprovalPreset>) -> Vec<String> {
        vec![std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())]
    }

    fn is_ready(&self, screen: &str) -> bool {
        self.prompt.is_match(last_line(screen))
    }

    fn is_complete(&self, screen: &str) -> bool {
        // a shell is done when its prompt is back
        self.is_ready(screen)
    }
}

pub struct ClaudeAdapter {
    prompt: Regex,
    summary: Regex,
    login: Regex,
}

impl ClaudeAdapter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            prompt: compile(r"(?m)^\s*>\s*$|\? for shortcuts")?,
            summary: compile(r"(?i)total (cost|duration):")?,
            login: compile(r"(?i)please run /login|select login method")?,
        })
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn adapter_type(&self) -> &'static str {
        "claude"
    }

    fn launch_command(&self, approval: Option<ApprovalPreset>) -> Vec<String> {
        let mut cmd = vec!["claude".to_string()];
        match approval {
            Some(ApprovalPreset::AcceptEdits) => {
                cmd.extend(["--permission-mode".to_string(), "acceptEdits".to_string()]);
            }
            Some(ApprovalPreset::Full) => {
                cmd.push("--dangerously-skip-permissions".to_string());
            }
            Some(ApprovalPreset::Default) | None => {}
        }
        cmd
    }

    fn is_ready(&self, screen: &str) -> bool {
        self.prompt.is_match(screen)
    }

    fn is_complete(&self, screen: &str) -> bool {
        self.summary.is_match(screen) && self.is_ready(screen)
    }

    fn needs_login(&self, recent: &str) -> bool {
        self.login.is_match(recent)
    }
}

pub struct AiderAdapter {
    prompt: Regex,
}

impl AiderAdapter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            // aider's input line ends with "> " once a task has settled
            prompt: compile(r"(?m)^[a-zA-Z0-9 /.\-]*>\s*$")?,
        })
    }
}

impl AgentAdapter for AiderAdapter {
    fn adapter_type(&self) -> &'static str {
        "aider"
    }

    fn launch_command(&self, approval: Option<ApprovalPreset>) -> Vec<String> {
        let mut cmd = vec!["aider".to_string()];
        if matches!(approval, Some(ApprovalPreset::Full)) {
            cmd.push("--yes-always".to_string());
        }
        cmd
    }

    fn is_ready(&self, screen: &str) -> bool {
        self.prompt.is_match(last_line(screen))
    }

    fn is_complete(&self, screen: &str) -> bool {
        self.is_ready(screen)
    }
}

pub struct GeminiAdapter {
    prompt: Regex,
    login: Regex,
}

impl GeminiAdapter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            prompt: compile(r"(?m)^\s*>\s*$|Type your message")?,
            login: compile(r"(?i)how would you like to authenticate|waiting for auth")?,
        })
    }
}

impl AgentAdapter for GeminiAdapter {
    fn adapter_type(&self) -> &'static str {
        "gemini"
    }

    fn launch_command(&self, approval: Option<ApprovalPreset>) -> Vec<String> {
        let mut cmd = vec!["gemini".to_string()];
        if matches!(approval, Some(ApprovalPreset::Full)) {
            cmd.push("--yolo".to_string());
        }
        cmd
    }

    fn is_ready(&self, screen: &str) -> bool {
        self.prompt.is_match(screen)
    }

    fn is_complete(&self, screen: &str) -> bool {
        self.is_ready(screen)
    }

    fn auth_command(&self) -> Option<&'static str> {
        Some("/auth")
    }

    fn needs_login(&self, recent: &str) -> bool {
        self.login.is_match(recent)
    }
}

pub struct CodexAdapter {
    prompt: Regex,
}

impl CodexAdapter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            prompt: compile(r"(?m)^\s*▌|send a message")?,
        })
    }
}

impl AgentAdapter for CodexAdapter {
    fn adapter_type(&self) -> &'static str {
        "codex"
    }

    fn launch_command(&self, approval: Option<ApprovalPreset>) -> Vec<String> {
        let mut cmd = vec!["codex".to_string()];
        if matches!(approval, Some(ApprovalPreset::Full)) {
            cmd.extend(["--ask-for-approval".to_string(), "never".to_string()]);
        }
        cmd
    }

    fn is_ready(&self, screen: &str) -> bool {
        self.prompt.is_match(screen)
    }

    fn is_complete(&self, screen: &str) -> bool {
        self.is_ready(screen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_type_round_trip() {
        for (text, expected) in [
            ("shell", AgentType::Shell),
            ("Claude", AgentType::Claude),
            ("GEMINI", AgentType::Gemini),
        ] {
            assert_eq!(text.parse::<AgentType>().unwrap(), expected);
        }
        assert!("vim".parse::<AgentType>().is_err());
    }

    #[test]
    fn shell_prompt_detection() {
        let adapter = ShellAdapter::new().unwrap();
        assert!(adapter.is_ready("user@host:/path$ "));
        assert!(adapter.is_ready("output line\n% "));
        assert!(!adapter.is_ready("compiling..."));
    }

    #[test]
    fn gemini_has_auth_command() {
        let adapter = GeminiAdapter::new().unwrap();
        assert_eq!(adapter.auth_command(), Some("/auth"));
        assert!(adapter.needs_login("How would you like to authenticate?"));
    }

    #[test]
    fn approval_preset_shapes_claude_command() {
        let adapter = ClaudeAdapter::new().unwrap();
        assert_eq!(adapter.launch_command(None), vec!["claude"]);
        assert!(adapter
            .launch_command(Some(ApprovalPreset::Full))
            .contains(&"--dangerously-skip-permissions".to_string()));
    }
}
