use crate::adapter::{AgentAdapter, AgentType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Session lifecycle states.
///
/// Spawning -> Ready -> Busy -> {Blocked, Authenticating,
/// StalledPendingClassification} -> Ready (loop); any -> Stopped on explicit
/// stop or process exit; any -> Errored on an unrecoverable fault. Stopped
/// and Errored are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Spawning,
    Ready,
    Busy,
    Blocked,
    Authenticating,
    StalledPendingClassification,
    Stopped,
    Errored,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Errored)
    }

    /// Whether the state machine allows moving to `next` from here.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Stopped | Errored) {
            return true;
        }
        match self {
            Spawning => matches!(next, Ready | Blocked | Authenticating),
            Ready => matches!(next, Ready | Busy),
            Busy => matches!(
                next,
                Ready | Busy | Blocked | Authenticating | StalledPendingClassification
            ),
            Blocked => matches!(next, Ready | Busy),
            Authenticating => matches!(next, Ready | Blocked | Authenticating),
            StalledPendingClassification => matches!(next, Ready | Busy | Blocked),
            Stopped | Errored => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Spawning => "spawning",
            SessionStatus::Ready => "ready",
            SessionStatus::Busy => "busy",
            SessionStatus::Blocked => "blocked",
            SessionStatus::Authenticating => "authenticating",
            SessionStatus::StalledPendingClassification => "stalled_pending_classification",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Caller-visible view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub working_dir: PathBuf,
    pub status: SessionStatus,
    pub created_at: SystemTime,
    pub metadata: HashMap<String, String>,
}

/// Registry entry. Owned by the orchestrator: created on spawn, mutated by
/// backend events, removed on stop.
pub struct Session {
    pub info: SessionInfo,
    pub adapter: Arc<dyn AgentAdapter>,
    pub created: Instant,
    pub last_activity: Instant,
    pending_initial_task: Option<String>,
    initial_task_sent: bool,
}

impl Session {
    pub fn new(
        info: SessionInfo,
        adapter: Arc<dyn AgentAdapter>,
        initial_task: Option<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            info,
            adapter,
            created: now,
            last_activity: now,
            pending_initial_task: initial_task,
            initial_task_sent: false,
        }
    }
}

/// Filter for [`SessionRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub agent_type: Option<AgentType>,
    pub status: Option<SessionStatus>,
}

/// Session id -> lifecycle metadata, shared between the public API and the
/// backend event loop.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.info.id.clone(), session);
    }

    pub async fn remove(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.write().await.remove(id).map(|s| s.info)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn info(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).map(|s| s.info.clone())
    }

    pub async fn status(&self, id: &str) -> Option<SessionStatus> {
        self.sessions.read().await.get(id).map(|s| s.info.status)
    }

    pub async fn adapter(&self, id: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.sessions.read().await.get(id).map(|s| s.adapter.clone())
    }

    pub async fn age(&self, id: &str) -> Option<std::time::Duration> {
        self.sessions.read().await.get(id).map(|s| s.created.elapsed())
    }

    pub async fn list(&self, filter: Option<&SessionFilter>) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| match filter {
                Some(f) => {
                    f.agent_type.map_or(true, |t| s.info.agent_type == t)
                        && f.status.map_or(true, |st| s.info.status == st)
                }
                None => true,
            })
            .map(|s| s.info.clone())
            .collect()
    }

    /// Apply a status transition, enforcing the state machine. Invalid
    /// transitions are logged and dropped rather than applied.
    pub async fn set_status(&self, id: &str, next: SessionStatus) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        let current = session.info.status;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(session_id = %id, %current, %next, "ignoring invalid status transition");
            return false;
        }
        debug!(session_id = %id, %current, %next, "session status transition");
        session.info.status = next;
        session.last_activity = Instant::now();
        true
    }

    pub async fn touch(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.last_activity = Instant::now();
        }
    }

    /// One-shot claim of the deferred initial task. The first caller gets
    /// the task; every later call sees `None`, so the "listener fires late"
    /// and "already ready" paths converge on a single send.
    pub async fn take_pending_task(&self, id: &str) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        if session.initial_task_sent {
            return None;
        }
        session.initial_task_sent = true;
        session.pending_initial_task.take()
    }

    /// Cancel a pending deferred initial-task send (on stop).
    pub async fn clear_pending_task(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.pending_initial_task = None;
            session.initial_task_sent = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::adapter_for;

    fn test_session(id: &str, agent_type: AgentType) -> Session {
        Session::new(
            SessionInfo {
                id: id.to_string(),
                name: id.to_string(),
                agent_type,
                working_dir: PathBuf::from("/tmp"),
                status: SessionStatus::Spawning,
                created_at: SystemTime::now(),
                metadata: HashMap::new(),
            },
            adapter_for(agent_type).unwrap(),
            Some("initial task".to_string()),
        )
    }

    #[test]
    fn lifecycle_transitions() {
        use SessionStatus::*;
        assert!(Spawning.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Busy));
        assert!(Busy.can_transition_to(StalledPendingClassification));
        assert!(StalledPendingClassification.can_transition_to(Ready));
        assert!(Busy.can_transition_to(Stopped));
        assert!(Authenticating.can_transition_to(Ready));

        assert!(!Ready.can_transition_to(StalledPendingClassification));
        assert!(!Spawning.can_transition_to(Busy));
        assert!(!Stopped.can_transition_to(Ready));
        assert!(!Errored.can_transition_to(Busy));
    }

    #[tokio::test]
    async fn invalid_transition_is_dropped() {
        let registry = SessionRegistry::new();
        registry.insert(test_session("s1", AgentType::Shell)).await;

        assert!(!registry.set_status("s1", SessionStatus::Busy).await);
        assert_eq!(registry.status("s1").await, Some(SessionStatus::Spawning));

        assert!(registry.set_status("s1", SessionStatus::Ready).await);
        assert!(registry.set_status("s1", SessionStatus::Busy).await);
        assert_eq!(registry.status("s1").await, Some(SessionStatus::Busy));
    }

    #[tokio::test]
    async fn pending_task_is_claimed_once() {
        let registry = SessionRegistry::new();
        registry.insert(test_session("s1", AgentType::Claude)).await;

        assert_eq!(
            registry.take_pending_task("s1").await,
            Some("initial task".to_string())
        );
        assert_eq!(registry.take_pending_task("s1").await, None);
    }

    #[tokio::test]
    async fn clearing_cancels_the_pending_task() {
        let registry = SessionRegistry::new();
        registry.insert(test_session("s1", AgentType::Claude)).await;
        registry.clear_pending_task("s1").await;
        assert_eq!(registry.take_pending_task("s1").await, None);
    }

    #[tokio::test]
    async fn list_filters_by_type_and_status() {
        let registry = SessionRegistry::new();
        registry.insert(test_session("s1", AgentType::Shell)).await;
        registry.insert(test_session("s2", AgentType::Claude)).await;
        registry.set_status("s2", SessionStatus::Ready).await;

        assert_eq!(registry.list(None).await.len(), 2);

        let shells = registry
            .list(Some(&SessionFilter {
                agent_type: Some(AgentType::Shell),
                status: None,
            }))
            .await;
        assert_eq!(shells.len(), 1);
        assert_eq!(shells[0].id, "s1");

        let ready = registry
            .list(Some(&SessionFilter {
                agent_type: None,
                status: Some(SessionStatus::Ready),
            }))
            .await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "s2");
    }
}
