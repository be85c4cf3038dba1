use super::{
    BackendError, BackendEvent, BackendKind, BackendResult, BackendSession, SessionBackend,
    SpawnConfig,
};
use crate::rules::{AutoResponseRule, CompiledRule};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

const SPAWN_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands written to the worker, one JSON object per line.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum WorkerCommand {
    #[serde(rename_all = "camelCase")]
    Spawn {
        config: SpawnConfig,
        stall_timeout_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Send { session_id: String, text: String },
    #[serde(rename_all = "camelCase")]
    SendKeys { session_id: String, keys: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Stop { session_id: String },
    #[serde(rename_all = "camelCase")]
    AddRule {
        session_id: String,
        rule: AutoResponseRule,
    },
}

/// Events read from the worker: a session id plus the common event shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerEnvelope {
    session_id: String,
    #[serde(flatten)]
    event: BackendEvent,
}

type SpawnAck = oneshot::Sender<Result<Option<u32>, String>>;

/// Worker-emulated backend: a single external terminal-worker process hosts
/// every session. The worker owns the PTYs, readiness detection, rule
/// evaluation, and stall timing; this side only speaks the line protocol.
pub struct WorkerBackend {
    worker_path: PathBuf,
    stall_timeout_ms: u64,
    child: Mutex<Option<Child>>,
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    event_tx: broadcast::Sender<(String, BackendEvent)>,
    sessions: Arc<RwLock<HashMap<String, BackendSession>>>,
    output_channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    pending_spawns: Arc<Mutex<HashMap<String, SpawnAck>>>,
}

impl WorkerBackend {
    /// Launch the worker process and wire up the protocol pumps.
    pub async fn start(worker_path: &Path, stall_timeout: Duration) -> Result<Self> {
        info!(path = %worker_path.display(), "starting terminal worker");

        let mut child = Command::new(worker_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn terminal worker: {e}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stderr unavailable"))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(1024);
        let sessions: Arc<RwLock<HashMap<String, BackendSession>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let output_channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let pending_spawns: Arc<Mutex<HashMap<String, SpawnAck>>> =
            Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_commands(stdin, cmd_rx));
        tokio::spawn(read_events(
            stdout,
            event_tx.clone(),
            sessions.clone(),
            output_channels.clone(),
            pending_spawns.clone(),
        ));
        tokio::spawn(drain_stderr(stderr));

        Ok(Self {
            worker_path: worker_path.to_path_buf(),
            stall_timeout_ms: stall_timeout.as_millis() as u64,
            child: Mutex::new(Some(child)),
            cmd_tx,
            event_tx,
            sessions,
            output_channels,
            pending_spawns,
        })
    }

    pub fn worker_path(&self) -> &Path {
        &self.worker_path
    }

    fn send_command(&self, command: WorkerCommand) -> BackendResult<()> {
        self.cmd_tx
            .send(command)
            .map_err(|e| BackendError::Communication(format!("worker channel closed: {e}")))
    }

    async fn ensure_session(&self, id: &str) -> BackendResult<()> {
        if self.sessions.read().await.contains_key(id) {
            Ok(())
        } else {
            Err(BackendError::SessionNotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl SessionBackend for WorkerBackend {
    async fn spawn(&self, config: SpawnConfig) -> BackendResult<BackendSession> {
        let session_id = config.session_id.clone();
        let agent_type = config.agent_type;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_spawns
            .lock()
            .await
            .insert(session_id.clone(), ack_tx);

        self.send_command(WorkerCommand::Spawn {
            config,
            stall_timeout_ms: self.stall_timeout_ms,
        })?;

        let ack = tokio::time::timeout(SPAWN_ACK_TIMEOUT, ack_rx).await;
        // whatever happened, the pending entry must not linger
        self.pending_spawns.lock().await.remove(&session_id);

        let pid = match ack {
            Ok(Ok(Ok(pid))) => pid,
            Ok(Ok(Err(message))) => return Err(BackendError::Spawn(message)),
            Ok(Err(_)) => {
                return Err(BackendError::Spawn("worker dropped the spawn ack".to_string()))
            }
            Err(_) => {
                return Err(BackendError::Spawn(format!(
                    "worker did not acknowledge spawn within {}s",
                    SPAWN_ACK_TIMEOUT.as_secs()
                )))
            }
        };

        let session = BackendSession {
            id: session_id.clone(),
            agent_type,
            pid,
        };
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        let (output_tx, _) = broadcast::channel(1024);
        self.output_channels
            .write()
            .await
            .insert(session_id, output_tx);

        Ok(session)
    }

    async fn send(&self, id: &str, text: &str) -> BackendResult<()> {
        self.ensure_session(id).await?;
        self.send_command(WorkerCommand::Send {
            session_id: id.to_string(),
            text: text.to_string(),
        })
    }

    async fn send_keys(&self, id: &str, keys: &[String]) -> BackendResult<()> {
        self.ensure_session(id).await?;
        self.send_command(WorkerCommand::SendKeys {
            session_id: id.to_string(),
            keys: keys.to_vec(),
        })
    }

    async fn stop(&self, id: &str) -> BackendResult<()> {
        self.ensure_session(id).await?;
        self.send_command(WorkerCommand::Stop {
            session_id: id.to_string(),
        })?;
        self.sessions.write().await.remove(id);
        self.output_channels.write().await.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Option<BackendSession> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn list(&self) -> Vec<BackendSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    async fn add_auto_response_rule(&self, id: &str, rule: AutoResponseRule) -> BackendResult<()> {
        self.ensure_session(id).await?;
        // validate the pattern locally so a bad rule fails loudly here
        // instead of silently inside the worker
        CompiledRule::compile(rule.clone())
            .map_err(|e| BackendError::InvalidRule(format!("{e:#}")))?;
        self.send_command(WorkerCommand::AddRule {
            session_id: id.to_string(),
            rule,
        })
    }

    fn subscribe_events(&self) -> broadcast::Receiver<(String, BackendEvent)> {
        self.event_tx.subscribe()
    }

    async fn subscribe_output(&self, id: &str) -> BackendResult<broadcast::Receiver<String>> {
        self.output_channels
            .read()
            .await
            .get(id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| BackendError::SessionNotFound(id.to_string()))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Worker
    }

    async fn cleanup(&self) -> BackendResult<()> {
        info!("shutting down terminal worker");
        self.sessions.write().await.clear();
        self.output_channels.write().await.clear();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("failed to kill terminal worker: {e}");
            }
        }
        Ok(())
    }
}

/// Serialize commands onto the worker's stdin, one JSON object per line.
async fn write_commands(
    mut stdin: tokio::process::ChildStdin,
    mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>,
) {
    while let Some(command) = cmd_rx.recv().await {
        let line = match serde_json::to_string(&command) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to serialize worker command: {e}");
                continue;
            }
        };
        debug!("worker <- {line}");
        if stdin.write_all(line.as_bytes()).await.is_err()
            || stdin.write_all(b"\n").await.is_err()
            || stdin.flush().await.is_err()
        {
            warn!("worker stdin closed, dropping command writer");
            break;
        }
    }
}

/// Parse worker events off stdout and route them: spawn acks resolve the
/// pending oneshot, output chunks feed the per-session stream, everything is
/// forwarded on the shared event channel. Malformed lines are logged and
/// skipped.
async fn read_events(
    stdout: tokio::process::ChildStdout,
    event_tx: broadcast::Sender<(String, BackendEvent)>,
    sessions: Arc<RwLock<HashMap<String, BackendSession>>>,
    output_channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    pending_spawns: Arc<Mutex<HashMap<String, SpawnAck>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("error reading from terminal worker: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope: WorkerEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to parse worker event: {e}, raw: {line}");
                continue;
            }
        };
        let WorkerEnvelope { session_id, event } = envelope;

        match &event {
            BackendEvent::Message { name, data } if name == "spawned" => {
                if let Some(ack) = pending_spawns.lock().await.remove(&session_id) {
                    let pid = data.get("pid").and_then(|v| v.as_u64()).map(|v| v as u32);
                    let _ = ack.send(Ok(pid));
                }
                continue;
            }
            BackendEvent::Error { message } => {
                // a spawn that fails before acking resolves the ack as an error
                if let Some(ack) = pending_spawns.lock().await.remove(&session_id) {
                    let _ = ack.send(Err(message.clone()));
                    continue;
                }
            }
            BackendEvent::Output { data } => {
                if let Some(tx) = output_channels.read().await.get(&session_id) {
                    let _ = tx.send(data.clone());
                }
            }
            BackendEvent::Exit { .. } => {
                sessions.write().await.remove(&session_id);
                output_channels.write().await.remove(&session_id);
            }
            _ => {}
        }

        let _ = event_tx.send((session_id, event));
    }

    // the worker died: every session it hosted is gone
    let ids: Vec<String> = sessions.write().await.drain().map(|(id, _)| id).collect();
    output_channels.write().await.clear();
    for id in ids {
        warn!(session_id = %id, "terminal worker exited, session lost");
        let _ = event_tx.send((id, BackendEvent::Exit { code: None }));
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("worker stderr: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AgentType;

    #[test]
    fn spawn_command_wire_format() {
        let command = WorkerCommand::Spawn {
            config: SpawnConfig {
                session_id: "s1".to_string(),
                agent_type: AgentType::Shell,
                command: vec!["bash".to_string()],
                working_dir: PathBuf::from("/tmp"),
                env: HashMap::new(),
                cols: 80,
                rows: 24,
            },
            stall_timeout_ms: 4000,
        };
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains(r#""type":"spawn""#));
        assert!(json.contains(r#""config":{"#));
        assert!(json.contains(r#""sessionId":"s1""#));
        assert!(json.contains(r#""stallTimeoutMs":4000"#));
    }

    #[test]
    fn envelope_parses_worker_events() {
        let envelope: WorkerEnvelope =
            serde_json::from_str(r#"{"sessionId":"s1","type":"ready"}"#).unwrap();
        assert_eq!(envelope.session_id, "s1");
        assert!(matches!(envelope.event, BackendEvent::Ready));

        let envelope: WorkerEnvelope = serde_json::from_str(
            r#"{"sessionId":"s2","type":"stalled","recentOutput":"tail text"}"#,
        )
        .unwrap();
        assert!(
            matches!(envelope.event, BackendEvent::Stalled { recent_output } if recent_output == "tail text")
        );
    }

    #[test]
    fn malformed_ack_payload_defaults_to_no_pid() {
        let data = serde_json::json!({"pid": "not-a-number"});
        assert_eq!(data.get("pid").and_then(|v| v.as_u64()), None);
    }
}
