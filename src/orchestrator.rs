use crate::adapter::{adapter_for, AgentType, ApprovalPreset};
use crate::backend::{BackendEvent, BackendKind, SessionBackend, SpawnConfig};
use crate::buffer::OutputBuffer;
use crate::classifier::{StallClassification, StallClassifier, StallContext};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::metrics::{AgentMetrics, CompletionPath, MetricsRecorder};
use crate::model::ModelClient;
use crate::rules::default_rules;
use crate::sanitize::OutputSanitizer;
use crate::session::{Session, SessionFilter, SessionInfo, SessionRegistry, SessionStatus};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Options for [`Orchestrator::spawn_session`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub name: Option<String>,
    pub agent_type: AgentType,
    pub working_dir: Option<PathBuf>,
    pub initial_task: Option<String>,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    /// Credential used when assembling default rules (gemini). Falls back to
    /// the configured/environment key.
    pub api_key: Option<String>,
    pub approval_preset: Option<ApprovalPreset>,
}

impl SpawnOptions {
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            name: None,
            agent_type,
            working_dir: None,
            initial_task: None,
            env: HashMap::new(),
            metadata: HashMap::new(),
            api_key: None,
            approval_preset: None,
        }
    }
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self::new(AgentType::Shell)
    }
}

/// An event forwarded to registered listeners.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub name: String,
    pub data: serde_json::Value,
}

/// Listener callbacks return a `Result` so one failing listener can be
/// logged without blocking delivery to the others.
pub type EventCallback = Arc<dyn Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync>;

pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by [`Orchestrator::subscribe_to_output`]. Dropping it (or
/// calling [`unsubscribe`](Self::unsubscribe)) detaches the callback.
pub struct OutputSubscription {
    task: Option<JoinHandle<()>>,
}

impl OutputSubscription {
    pub fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for OutputSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Composes the backend, registry, rule engine, classifier, and metrics into
/// one control/event surface. Create with [`new`](Self::new), then call
/// [`start`](Self::start) before any session operation.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn SessionBackend>,
    config: OrchestratorConfig,
    registry: SessionRegistry,
    buffers: RwLock<HashMap<String, OutputBuffer>>,
    markers: RwLock<HashMap<String, usize>>,
    metrics: MetricsRecorder,
    classifier: StallClassifier,
    sanitizer: OutputSanitizer,
    listeners: RwLock<Vec<(u64, EventCallback)>>,
    listener_seq: AtomicU64,
    session_seq: AtomicU64,
    running: AtomicBool,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        model: Arc<dyn ModelClient>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let classifier = StallClassifier::new(model, config.diagnostics_dir())
            .map_err(OrchestratorError::Internal)?;
        let sanitizer = OutputSanitizer::new().map_err(OrchestratorError::Internal)?;
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                config,
                registry: SessionRegistry::new(),
                buffers: RwLock::new(HashMap::new()),
                markers: RwLock::new(HashMap::new()),
                metrics: MetricsRecorder::new(),
                classifier,
                sanitizer,
                listeners: RwLock::new(Vec::new()),
                listener_seq: AtomicU64::new(0),
                session_seq: AtomicU64::new(0),
                running: AtomicBool::new(false),
                event_task: Mutex::new(None),
            }),
        })
    }

    /// Start consuming backend events. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut events = self.inner.backend.subscribe_events();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok((session_id, event)) => inner.handle_event(&session_id, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "orchestrator lagged behind backend events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.inner.event_task.lock().await = Some(task);
        info!(backend = %self.inner.backend.kind(), "orchestrator started");
        Ok(())
    }

    /// Stop every session, release the backend, and reject further calls.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<String> = self
            .inner
            .registry
            .list(None)
            .await
            .into_iter()
            .map(|info| info.id)
            .collect();
        for id in ids {
            self.inner.registry.clear_pending_task(&id).await;
            if let Err(e) = self.inner.backend.stop(&id).await {
                warn!(session_id = %id, "failed to stop session during shutdown: {e}");
            }
            self.inner.registry.remove(&id).await;
        }
        if let Err(e) = self.inner.backend.cleanup().await {
            warn!("backend cleanup failed: {e}");
        }
        if let Some(task) = self.inner.event_task.lock().await.take() {
            task.abort();
        }
        info!("orchestrator shut down");
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrchestratorError::NotRunning)
        }
    }

    /// Spawn a session and push its default auto-response rules.
    ///
    /// The event loop (our "ready listener") is already consuming backend
    /// events before the rules are assembled, so a readiness signal arriving
    /// while the push is still in flight is not lost.
    pub async fn spawn_session(&self, options: SpawnOptions) -> Result<SessionInfo> {
        self.ensure_running()?;
        let inner = &self.inner;

        let agent_type = options.agent_type;
        let seq = inner.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}", agent_type.as_str(), seq);
        let name = options.name.unwrap_or_else(|| id.clone());
        let working_dir = match options.working_dir {
            Some(dir) => dir,
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        };
        let adapter = adapter_for(agent_type).map_err(OrchestratorError::Internal)?;
        let command = adapter.launch_command(options.approval_preset);
        let api_key = options.api_key.or_else(|| inner.config.gemini_api_key());

        let info = SessionInfo {
            id: id.clone(),
            name,
            agent_type,
            working_dir: working_dir.clone(),
            status: SessionStatus::Spawning,
            created_at: SystemTime::now(),
            metadata: options.metadata,
        };
        inner
            .registry
            .insert(Session::new(info.clone(), adapter, options.initial_task))
            .await;
        inner
            .buffers
            .write()
            .await
            .insert(id.clone(), OutputBuffer::new(inner.config.buffer_cap));

        let spawn_config = SpawnConfig {
            session_id: id.clone(),
            agent_type,
            command,
            working_dir,
            env: options.env,
            cols: inner.config.cols,
            rows: inner.config.rows,
        };
        if let Err(e) = inner.backend.spawn(spawn_config).await {
            inner.registry.remove(&id).await;
            inner.buffers.write().await.remove(&id);
            return Err(e.into());
        }
        inner.metrics.record_spawn(agent_type.as_str()).await;
        info!(session_id = %id, agent = %agent_type, "session spawned");

        inner.push_default_rules(&id, agent_type, api_key.as_deref()).await;

        // the readiness event may already have fired during the rule push;
        // the one-shot pending-task claim makes this converge with the
        // "listener fires late" path
        inner.try_send_initial_task(&id).await;

        Ok(inner.registry.info(&id).await.unwrap_or(info))
    }

    /// Send task text to a session. Records the task-response marker and
    /// marks the session busy.
    pub async fn send_to_session(&self, id: &str, text: &str) -> Result<()> {
        self.ensure_running()?;
        self.inner.send_internal(id, text).await
    }

    /// Send raw keys to a session. Deliberately does not mark the session
    /// busy — readiness detection keeps running (used for auth flows).
    pub async fn send_keys_to_session(&self, id: &str, keys: &[String]) -> Result<()> {
        self.ensure_running()?;
        if !self.inner.registry.contains(id).await {
            return Err(OrchestratorError::SessionNotFound(id.to_string()));
        }
        self.inner.backend.send_keys(id, keys).await?;
        self.inner.registry.touch(id).await;
        Ok(())
    }

    pub async fn stop_session(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        let inner = &self.inner;
        if !inner.registry.contains(id).await {
            return Err(OrchestratorError::SessionNotFound(id.to_string()));
        }
        // cancel any pending deferred initial-task send before the backend
        // round-trip
        inner.registry.clear_pending_task(id).await;
        inner.backend.stop(id).await?;
        inner.registry.set_status(id, SessionStatus::Stopped).await;
        inner.emit(id, "stopped", json!({})).await;
        inner.registry.remove(id).await;
        inner.buffers.write().await.remove(id);
        inner.markers.write().await.remove(id);
        info!(session_id = %id, "session stopped");
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionInfo> {
        self.ensure_running()?;
        self.inner
            .registry
            .info(id)
            .await
            .ok_or_else(|| OrchestratorError::SessionNotFound(id.to_string()))
    }

    pub async fn list_sessions(&self, filter: Option<SessionFilter>) -> Result<Vec<SessionInfo>> {
        self.ensure_running()?;
        Ok(self.inner.registry.list(filter.as_ref()).await)
    }

    /// Attach a callback to a session's raw output stream.
    pub async fn subscribe_to_output(
        &self,
        id: &str,
        callback: OutputCallback,
    ) -> Result<OutputSubscription> {
        self.ensure_running()?;
        let mut rx = self.inner.backend.subscribe_output(id).await?;
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(chunk) => callback(&chunk),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(OutputSubscription { task: Some(task) })
    }

    /// Register a listener for every forwarded session event, including the
    /// synthesized classifier-derived ones. Returns a listener id for
    /// [`remove_event_listener`](Self::remove_event_listener). May be called
    /// before [`start`](Self::start).
    pub async fn on_session_event(&self, callback: EventCallback) -> u64 {
        let id = self.inner.listener_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.listeners.write().await.push((id, callback));
        id
    }

    pub async fn remove_event_listener(&self, listener_id: u64) {
        self.inner
            .listeners
            .write()
            .await
            .retain(|(id, _)| *id != listener_id);
    }

    /// Snapshot of the per-agent-type metrics.
    pub async fn agent_metrics(&self) -> HashMap<String, AgentMetrics> {
        self.inner.metrics.snapshot().await
    }
}

impl Inner {
    /// React to one backend event. The backend decides lifecycle signals;
    /// this only updates the registry, buffers, metrics, and listeners — the
    /// single exception is stall resolution, which is ours.
    async fn handle_event(self: &Arc<Self>, session_id: &str, event: BackendEvent) {
        if !self.registry.contains(session_id).await {
            debug!(session_id, event = event.name(), "event for unknown session dropped");
            return;
        }

        match event {
            BackendEvent::Output { data } => {
                if let Some(buffer) = self.buffers.write().await.get_mut(session_id) {
                    buffer.push_chunk(&data);
                }
                self.registry.touch(session_id).await;
                self.emit(session_id, "output", json!({ "data": data })).await;
            }
            BackendEvent::Ready => {
                self.registry.set_status(session_id, SessionStatus::Ready).await;
                self.emit(session_id, "ready", json!({})).await;
                self.try_send_initial_task(session_id).await;
            }
            BackendEvent::BlockingPrompt { prompt } => {
                self.registry.set_status(session_id, SessionStatus::Blocked).await;
                self.emit(session_id, "blocking_prompt", json!({ "prompt": prompt }))
                    .await;
            }
            BackendEvent::LoginRequired => {
                self.registry
                    .set_status(session_id, SessionStatus::Authenticating)
                    .await;
                self.emit(session_id, "login_required", json!({})).await;
                let inner = self.clone();
                let id = session_id.to_string();
                tokio::spawn(async move { inner.auto_handle_login(&id).await });
            }
            BackendEvent::TaskComplete { summary } => {
                self.finish_task(session_id, CompletionPath::FastPath, summary)
                    .await;
            }
            BackendEvent::Stalled { recent_output } => {
                let inner = self.clone();
                let id = session_id.to_string();
                tokio::spawn(async move { inner.resolve_stall(&id, recent_output).await });
            }
            BackendEvent::Exit { code } => {
                self.registry.set_status(session_id, SessionStatus::Stopped).await;
                self.emit(session_id, "exit", json!({ "code": code })).await;
                self.registry.remove(session_id).await;
                self.buffers.write().await.remove(session_id);
                self.markers.write().await.remove(session_id);
            }
            BackendEvent::Error { message } => {
                // only the offending session transitions; the rest are untouched
                self.registry.set_status(session_id, SessionStatus::Errored).await;
                self.emit(session_id, "error", json!({ "message": message })).await;
            }
            BackendEvent::Message { name, data } => {
                self.registry.touch(session_id).await;
                self.emit(session_id, &name, data).await;
            }
        }
    }

    async fn send_internal(&self, id: &str, text: &str) -> Result<()> {
        if !self.registry.contains(id).await {
            return Err(OrchestratorError::SessionNotFound(id.to_string()));
        }
        // marker first, so output racing the send lands after it
        let marker = self
            .buffers
            .read()
            .await
            .get(id)
            .map(|buffer| buffer.mark())
            .unwrap_or(0);
        self.markers.write().await.insert(id.to_string(), marker);

        if let Err(e) = self.backend.send(id, text).await {
            self.markers.write().await.remove(id);
            return Err(e.into());
        }
        self.registry.set_status(id, SessionStatus::Busy).await;
        self.registry.touch(id).await;
        Ok(())
    }

    /// One-shot deferred initial-task send; no-op unless the session is
    /// ready and a task is still pending.
    async fn try_send_initial_task(&self, id: &str) {
        if self.registry.status(id).await != Some(SessionStatus::Ready) {
            return;
        }
        let Some(task) = self.registry.take_pending_task(id).await else {
            return;
        };
        info!(session_id = %id, "sending deferred initial task");
        if let Err(e) = self.send_internal(id, &task).await {
            warn!(session_id = %id, "failed to send initial task: {e}");
        }
    }

    /// Assemble and push default rules. Runs once per spawn, after the spawn
    /// call returns; failures are logged, never fatal.
    async fn push_default_rules(&self, id: &str, agent_type: AgentType, api_key: Option<&str>) {
        let rules = default_rules(agent_type, api_key);
        if rules.is_empty() {
            return;
        }
        debug!(session_id = %id, count = rules.len(), "pushing default rules");
        for rule in rules {
            if let Err(e) = self.backend.add_auto_response_rule(id, rule).await {
                warn!(session_id = %id, "failed to push default rule: {e}");
            }
        }
    }

    /// Drive a known in-session auth flow with the key-send primitive. The
    /// text-send primitive would flip the session to busy and pause
    /// readiness detection through the login, so it is never used here. The
    /// delay respects the target's own input debouncing.
    async fn auto_handle_login(&self, id: &str) {
        let Some(adapter) = self.registry.adapter(id).await else {
            return;
        };
        let Some(command) = adapter.auth_command() else {
            debug!(session_id = %id, "no in-session auth command for this agent");
            return;
        };
        info!(session_id = %id, command, "auto-starting login flow");
        if let Err(e) = self.backend.send_keys(id, &[command.to_string()]).await {
            warn!(session_id = %id, "failed to send auth command: {e}");
            return;
        }
        tokio::time::sleep(self.config.auth_keystroke_delay()).await;
        if let Err(e) = self.backend.send_keys(id, &["Enter".to_string()]).await {
            warn!(session_id = %id, "failed to confirm auth command: {e}");
        }
    }

    /// Completion handling shared by the fast path and the classifier path.
    async fn finish_task(&self, id: &str, path: CompletionPath, summary: Option<String>) {
        let response = self.capture_response(id).await;
        let agent_type = match self.registry.info(id).await {
            Some(info) => info.agent_type,
            None => return,
        };
        let elapsed = self.registry.age(id).await.unwrap_or_default();
        self.metrics
            .record_completion(agent_type.as_str(), elapsed, path)
            .await;
        self.registry.set_status(id, SessionStatus::Ready).await;

        let detected_by = match path {
            CompletionPath::FastPath => "fast_path",
            CompletionPath::Classifier => "classifier",
        };
        self.emit(
            id,
            "task_complete",
            json!({
                "response": response,
                "summary": summary,
                "detected_by": detected_by,
            }),
        )
        .await;
    }

    /// Slice the output buffer from the task-response marker, sanitize, and
    /// consume the marker. The marker is deleted no matter what, so a second
    /// completion yields an empty response rather than a stale one.
    async fn capture_response(&self, id: &str) -> String {
        let marker = self.markers.write().await.remove(id);
        let Some(marker) = marker else {
            return String::new();
        };
        let buffers = self.buffers.read().await;
        buffers
            .get(id)
            .map(|buffer| self.sanitizer.sanitize(&buffer.slice_from(marker)))
            .unwrap_or_default()
    }

    /// The stall pipeline: counter, text selection, model classification,
    /// and resolution. A classification that fails — or lands after the
    /// session finished — changes nothing.
    async fn resolve_stall(&self, id: &str, recent_output: String) {
        let Some(info) = self.registry.info(id).await else {
            return;
        };
        self.metrics.record_stall(info.agent_type.as_str()).await;

        let prior_status = info.status;
        self.registry
            .set_status(id, SessionStatus::StalledPendingClassification)
            .await;
        self.emit(id, "stalled", json!({ "recent_output": recent_output }))
            .await;

        let buffer_tail = self
            .buffers
            .read()
            .await
            .get(id)
            .map(|buffer| buffer.tail(100))
            .unwrap_or_default();
        let ctx = StallContext {
            session_id: id.to_string(),
            agent_type: info.agent_type.as_str().to_string(),
            backend_sample: recent_output,
            buffer_tail,
            session_age: self.registry.age(id).await.unwrap_or_default(),
        };
        let result = self.classifier.classify(&ctx).await;

        // the session may have finished while the model call was in flight
        let Some(status) = self.registry.status(id).await else {
            debug!(session_id = %id, "discarding classification for removed session");
            return;
        };
        if status.is_terminal() {
            debug!(session_id = %id, "discarding classification for finished session");
            return;
        }

        match result {
            None => {
                // silent no-op: back to the prior state, no event — a later
                // output chunk may resolve the ambiguity on its own
                self.registry.set_status(id, prior_status).await;
            }
            Some(StallClassification::TaskComplete) => {
                self.finish_task(id, CompletionPath::Classifier, None).await;
            }
            Some(StallClassification::WaitingForInput {
                prompt,
                suggested_response,
            }) => {
                self.registry.set_status(id, SessionStatus::Blocked).await;
                self.emit(
                    id,
                    "blocking_prompt",
                    json!({
                        "prompt": prompt,
                        "suggested_response": suggested_response,
                        "detected_by": "classifier",
                    }),
                )
                .await;
            }
            Some(StallClassification::StillWorking) => {
                self.registry.set_status(id, SessionStatus::Busy).await;
            }
            Some(StallClassification::Error) => {
                self.registry.set_status(id, SessionStatus::Errored).await;
                self.emit(
                    id,
                    "error",
                    json!({
                        "message": "crash or stack trace detected in session output",
                        "detected_by": "classifier",
                    }),
                )
                .await;
            }
        }
    }

    /// Fan an event out to every listener, isolating per-callback failures.
    async fn emit(&self, session_id: &str, name: &str, data: serde_json::Value) {
        let event = SessionEvent {
            session_id: session_id.to_string(),
            name: name.to_string(),
            data,
        };
        let listeners: Vec<(u64, EventCallback)> = self.listeners.read().await.clone();
        for (listener_id, callback) in listeners {
            if let Err(e) = callback(&event) {
                warn!(listener_id, event = %event.name, "session event listener failed: {e:#}");
            }
        }
    }
}
