use super::keys::keys_to_bytes;
use super::{
    BackendError, BackendEvent, BackendKind, BackendResult, BackendSession, SessionBackend,
    SpawnConfig,
};
use crate::adapter::{adapter_for, AgentAdapter, AgentType};
use crate::rules::{AutoResponseRule, CompiledRule, RuleResponse};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{Child, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use regex::Regex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const READ_BUF_SIZE: usize = 4096;
const MONITOR_TICK: Duration = Duration::from_millis(500);
const SCREEN_TAIL_CHARS: usize = 2000;
const STOP_GRACE: Duration = Duration::from_millis(200);

/// In-process backend: allocates PTYs with `portable-pty`, renders output
/// through a `vt100` parser, and derives lifecycle signals from the
/// session's agent adapter.
pub struct NativeBackend {
    stall_timeout: Duration,
    event_tx: broadcast::Sender<(String, BackendEvent)>,
    sessions: Arc<RwLock<HashMap<String, Arc<NativeSession>>>>,
    blocking_prompt: Regex,
}

struct NativeSession {
    id: String,
    agent_type: AgentType,
    adapter: Arc<dyn AgentAdapter>,
    pid: Option<u32>,
    child: std::sync::Mutex<Option<Box<dyn Child + Send + Sync>>>,
    // kept for the lifetime of the session; dropping the master closes the PTY
    _master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::UnboundedSender<Bytes>,
    output_tx: broadcast::Sender<String>,
    parser: Arc<std::sync::Mutex<vt100::Parser>>,
    rules: RwLock<Vec<CompiledRule>>,
    // md5 of the text each rule last fired on, so a prompt that stays on
    // screen is answered once
    rule_fires: Mutex<HashMap<usize, String>>,
    busy: AtomicBool,
    ready_latch: AtomicBool,
    login_latch: AtomicBool,
    blocking_latch: AtomicBool,
    last_output: std::sync::Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NativeSession {
    fn screen_tail(&self) -> String {
        let contents = match self.parser.lock() {
            Ok(parser) => parser.screen().contents(),
            Err(_) => return String::new(),
        };
        let trimmed: String = contents
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = trimmed.trim_end();
        if trimmed.chars().count() <= SCREEN_TAIL_CHARS {
            return trimmed.to_string();
        }
        trimmed
            .chars()
            .rev()
            .take(SCREEN_TAIL_CHARS)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    fn write_input(&self, data: Vec<u8>) -> BackendResult<()> {
        self.input_tx
            .send(Bytes::from(data))
            .map_err(|e| BackendError::Communication(format!("input channel closed: {e}")))
    }

    fn touch_output(&self) {
        if let Ok(mut last) = self.last_output.lock() {
            *last = Instant::now();
        }
    }

    fn since_last_output(&self) -> Duration {
        self.last_output
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

impl NativeBackend {
    pub fn new(stall_timeout: Duration) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(1024);
        Ok(Self {
            stall_timeout,
            event_tx,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            blocking_prompt: Regex::new(
                r"(?i)\(y/n\)|\[y/n\]|\(y\)es/\(n\)o|password:|continue\?|proceed\?|\?\s*❯",
            )?,
        })
    }

    async fn session(&self, id: &str) -> BackendResult<Arc<NativeSession>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::SessionNotFound(id.to_string()))
    }

    fn emit(&self, id: &str, event: BackendEvent) {
        let _ = self.event_tx.send((id.to_string(), event));
    }

    /// Evaluate signals and auto-response rules against the current screen.
    /// Runs on every output chunk of a session.
    async fn inspect_session(
        session: &Arc<NativeSession>,
        event_tx: &broadcast::Sender<(String, BackendEvent)>,
        blocking_prompt: &Regex,
    ) {
        let tail = session.screen_tail();
        if tail.is_empty() {
            return;
        }

        // auto-response rules run first so a known prompt never surfaces as
        // a blocking event
        if Self::apply_rules(session, &tail).await {
            return;
        }

        let busy = session.busy.load(Ordering::SeqCst);

        if !session.login_latch.load(Ordering::SeqCst) && session.adapter.needs_login(&tail) {
            session.login_latch.store(true, Ordering::SeqCst);
            info!(session_id = %session.id, "login required");
            let _ = event_tx.send((session.id.clone(), BackendEvent::LoginRequired));
            return;
        }

        if busy {
            if session.adapter.is_complete(&tail) {
                session.busy.store(false, Ordering::SeqCst);
                session.ready_latch.store(true, Ordering::SeqCst);
                debug!(session_id = %session.id, "fast-path completion detected");
                let _ = event_tx.send((
                    session.id.clone(),
                    BackendEvent::TaskComplete { summary: None },
                ));
                return;
            }

            if !session.blocking_latch.load(Ordering::SeqCst) {
                let last_line = tail.lines().rev().find(|l| !l.trim().is_empty());
                if let Some(line) = last_line {
                    if blocking_prompt.is_match(line) {
                        session.blocking_latch.store(true, Ordering::SeqCst);
                        let _ = event_tx.send((
                            session.id.clone(),
                            BackendEvent::BlockingPrompt {
                                prompt: line.trim().to_string(),
                            },
                        ));
                        return;
                    }
                }
            }
            return;
        }

        if !session.ready_latch.load(Ordering::SeqCst) && session.adapter.is_ready(&tail) {
            session.ready_latch.store(true, Ordering::SeqCst);
            info!(session_id = %session.id, "session ready");
            let _ = event_tx.send((session.id.clone(), BackendEvent::Ready));
        }
    }

    /// Returns true when a rule fired.
    async fn apply_rules(session: &Arc<NativeSession>, tail: &str) -> bool {
        let rules = session.rules.read().await;
        let Some((index, matched)) = rules.iter().enumerate().find_map(|(i, rule)| {
            rule.regex
                .find(tail)
                .map(|m| (i, m.as_str().to_string()))
        }) else {
            return false;
        };
        let rule = &rules[index];

        let digest = format!("{:x}", md5::compute(&matched));
        {
            let mut fires = session.rule_fires.lock().await;
            if fires.get(&index) == Some(&digest) {
                return false;
            }
            fires.insert(index, digest);
        }

        info!(
            session_id = %session.id,
            category = %rule.rule.category,
            safe = rule.rule.safe,
            "auto-response rule fired: {}",
            rule.rule.description
        );

        let payload = match &rule.rule.response {
            RuleResponse::Text(text) => {
                let mut bytes = text.clone().into_bytes();
                bytes.push(b'\r');
                bytes
            }
            RuleResponse::Keys(keys) => keys_to_bytes(keys),
        };
        if let Err(e) = session.write_input(payload) {
            warn!(session_id = %session.id, "failed to send auto-response: {e}");
        }
        true
    }
}

#[async_trait]
impl SessionBackend for NativeBackend {
    async fn spawn(&self, config: SpawnConfig) -> BackendResult<BackendSession> {
        let Some((program, args)) = config.command.split_first() else {
            return Err(BackendError::Spawn("empty command".to_string()));
        };
        info!(session_id = %config.session_id, %program, "spawning native session");

        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BackendError::Spawn(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.cwd(&config.working_dir);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BackendError::Spawn(format!("failed to spawn command: {e}")))?;
        drop(pair.slave);

        let pid = child.process_id();
        let adapter = adapter_for(config.agent_type)
            .map_err(|e| BackendError::Spawn(format!("no adapter: {e}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BackendError::Spawn(format!("failed to clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BackendError::Spawn(format!("failed to take writer: {e}")))?;

        let (input_tx, input_rx) = mpsc::unbounded_channel::<Bytes>();
        let (output_tx, _) = broadcast::channel(1024);
        let parser = Arc::new(std::sync::Mutex::new(vt100::Parser::new(
            config.rows,
            config.cols,
            0,
        )));

        let session = Arc::new(NativeSession {
            id: config.session_id.clone(),
            agent_type: config.agent_type,
            adapter,
            pid,
            child: std::sync::Mutex::new(Some(child)),
            _master: std::sync::Mutex::new(pair.master),
            input_tx,
            output_tx: output_tx.clone(),
            parser,
            rules: RwLock::new(Vec::new()),
            rule_fires: Mutex::new(HashMap::new()),
            busy: AtomicBool::new(false),
            ready_latch: AtomicBool::new(false),
            login_latch: AtomicBool::new(false),
            blocking_latch: AtomicBool::new(false),
            last_output: std::sync::Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
        });

        let reader_task = spawn_reader(session.clone(), reader, self.event_tx.clone());
        let writer_task = spawn_writer(writer, input_rx);
        let monitor_task = spawn_monitor(
            session.clone(),
            self.event_tx.clone(),
            self.blocking_prompt.clone(),
            self.stall_timeout,
        );
        session
            .tasks
            .lock()
            .await
            .extend([reader_task, writer_task, monitor_task]);

        self.sessions
            .write()
            .await
            .insert(config.session_id.clone(), session);

        Ok(BackendSession {
            id: config.session_id,
            agent_type: config.agent_type,
            pid,
        })
    }

    async fn send(&self, id: &str, text: &str) -> BackendResult<()> {
        let session = self.session(id).await?;
        session.busy.store(true, Ordering::SeqCst);
        session.ready_latch.store(false, Ordering::SeqCst);
        session.blocking_latch.store(false, Ordering::SeqCst);
        session.touch_output();
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\r');
        session.write_input(bytes)
    }

    async fn send_keys(&self, id: &str, keys: &[String]) -> BackendResult<()> {
        let session = self.session(id).await?;
        session.write_input(keys_to_bytes(keys))
    }

    async fn stop(&self, id: &str) -> BackendResult<()> {
        let Some(session) = self.sessions.write().await.remove(id) else {
            return Err(BackendError::SessionNotFound(id.to_string()));
        };
        info!(session_id = %id, "stopping native session");

        #[cfg(unix)]
        if let Some(pid) = session.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(session_id = %id, "SIGTERM failed (process may have exited): {e}");
            }
            tokio::time::sleep(STOP_GRACE).await;
        }

        let child = session.child.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut child) = child {
            if let Err(e) = child.kill() {
                debug!(session_id = %id, "kill failed (process may have exited): {e}");
            }
            if let Err(e) = child.wait() {
                warn!(session_id = %id, "failed to wait for child: {e}");
            }
        }

        for task in session.tasks.lock().await.drain(..) {
            task.abort();
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Option<BackendSession> {
        self.sessions.read().await.get(id).map(|s| BackendSession {
            id: s.id.clone(),
            agent_type: s.agent_type,
            pid: s.pid,
        })
    }

    async fn list(&self) -> Vec<BackendSession> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| BackendSession {
                id: s.id.clone(),
                agent_type: s.agent_type,
                pid: s.pid,
            })
            .collect()
    }

    async fn add_auto_response_rule(&self, id: &str, rule: AutoResponseRule) -> BackendResult<()> {
        let session = self.session(id).await?;
        let compiled =
            CompiledRule::compile(rule).map_err(|e| BackendError::InvalidRule(format!("{e:#}")))?;
        session.rules.write().await.push(compiled);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<(String, BackendEvent)> {
        self.event_tx.subscribe()
    }

    async fn subscribe_output(&self, id: &str) -> BackendResult<broadcast::Receiver<String>> {
        let session = self.session(id).await?;
        Ok(session.output_tx.subscribe())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn cleanup(&self) -> BackendResult<()> {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(session_id = %id, "cleanup failed to stop session: {e}");
            }
        }
        Ok(())
    }
}

/// Blocking PTY read loop. Feeds the vt100 parser, fans raw chunks out to
/// subscribers, and emits `exit` when the stream closes.
fn spawn_reader(
    session: Arc<NativeSession>,
    mut reader: Box<dyn std::io::Read + Send>,
    event_tx: broadcast::Sender<(String, BackendEvent)>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let data = &buf[..n];
                    if let Ok(mut parser) = session.parser.lock() {
                        parser.process(data);
                    }
                    session.touch_output();
                    let chunk = String::from_utf8_lossy(data).to_string();
                    let _ = session.output_tx.send(chunk.clone());
                    let _ = event_tx.send((
                        session.id.clone(),
                        BackendEvent::Output { data: chunk },
                    ));
                }
                Err(e) => {
                    debug!(session_id = %session.id, "pty read ended: {e}");
                    break;
                }
            }
        }

        let code = session
            .child
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .and_then(|mut child| child.wait().ok())
            .map(|status| status.exit_code() as i32);
        info!(session_id = %session.id, ?code, "native session exited");
        let _ = event_tx.send((session.id.clone(), BackendEvent::Exit { code }));
    })
}

/// Serializes writes to the PTY.
fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = input_rx.recv().await {
            if let Err(e) = writer.write_all(data.as_ref()).and_then(|()| writer.flush()) {
                error!("pty write failed: {e}");
                break;
            }
        }
    })
}

/// Per-session monitor: inspects the screen on every output chunk and
/// checks the busy-with-no-output stall timer on a fixed tick.
fn spawn_monitor(
    session: Arc<NativeSession>,
    event_tx: broadcast::Sender<(String, BackendEvent)>,
    blocking_prompt: Regex,
    stall_timeout: Duration,
) -> JoinHandle<()> {
    let mut output_rx = session.output_tx.subscribe();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(MONITOR_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                chunk = output_rx.recv() => {
                    match chunk {
                        Ok(_) => {
                            NativeBackend::inspect_session(&session, &event_tx, &blocking_prompt)
                                .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(session_id = %session.id, skipped, "monitor lagged behind output");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = tick.tick() => {
                    // the reader consumes the child handle once the process
                    // has exited; nothing left to monitor after that
                    let child_gone = session
                        .child
                        .lock()
                        .map(|guard| guard.is_none())
                        .unwrap_or(true);
                    if child_gone {
                        break;
                    }
                    if session.busy.load(Ordering::SeqCst)
                        && session.since_last_output() >= stall_timeout
                    {
                        // restart the window so the next stall needs another
                        // full quiet period
                        session.touch_output();
                        let _ = event_tx.send((
                            session.id.clone(),
                            BackendEvent::Stalled {
                                recent_output: session.screen_tail(),
                            },
                        ));
                    }
                }
            }
        }
    })
}
