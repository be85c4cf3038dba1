use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// How a task completion was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPath {
    /// Detected by the backend's own heuristics, no model call.
    FastPath,
    /// Resolved by the stall classifier.
    Classifier,
}

/// Per-agent-type counters. Counters are monotonic; the average is
/// recomputed from the accumulated total on every completion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentMetrics {
    pub spawned: u64,
    pub completed: u64,
    pub completed_fast_path: u64,
    pub completed_via_classifier: u64,
    pub stalls: u64,
    pub avg_completion_ms: u64,
    #[serde(skip)]
    total_completion_ms: u128,
}

/// Keyed aggregate behind a lock; reads return a snapshot copy so the live
/// aggregate cannot be mutated from outside.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    inner: RwLock<HashMap<String, AgentMetrics>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_spawn(&self, agent_type: &str) {
        let mut inner = self.inner.write().await;
        inner.entry(agent_type.to_string()).or_default().spawned += 1;
    }

    pub async fn record_stall(&self, agent_type: &str) {
        let mut inner = self.inner.write().await;
        inner.entry(agent_type.to_string()).or_default().stalls += 1;
    }

    pub async fn record_completion(&self, agent_type: &str, elapsed: Duration, path: CompletionPath) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(agent_type.to_string()).or_default();
        entry.completed += 1;
        match path {
            CompletionPath::FastPath => entry.completed_fast_path += 1,
            CompletionPath::Classifier => entry.completed_via_classifier += 1,
        }
        entry.total_completion_ms += elapsed.as_millis();
        entry.avg_completion_ms =
            (entry.total_completion_ms as f64 / entry.completed as f64).round() as u64;
    }

    pub async fn snapshot(&self) -> HashMap<String, AgentMetrics> {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_is_rounded_total_over_count() {
        tokio_test::block_on(async {
            let recorder = MetricsRecorder::new();
            let durations = [1200_u64, 800, 500];
            for ms in durations {
                recorder
                    .record_completion("claude", Duration::from_millis(ms), CompletionPath::FastPath)
                    .await;
            }
            let snapshot = recorder.snapshot().await;
            let metrics = &snapshot["claude"];
            assert_eq!(metrics.completed, 3);
            assert_eq!(metrics.completed_fast_path, 3);
            // round(2500 / 3) = 833
            assert_eq!(metrics.avg_completion_ms, 833);
        });
    }

    #[tokio::test]
    async fn completion_paths_are_split() {
        let recorder = MetricsRecorder::new();
        recorder
            .record_completion("aider", Duration::from_millis(100), CompletionPath::FastPath)
            .await;
        recorder
            .record_completion("aider", Duration::from_millis(300), CompletionPath::Classifier)
            .await;
        let snapshot = recorder.snapshot().await;
        let metrics = &snapshot["aider"];
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.completed_fast_path, 1);
        assert_eq!(metrics.completed_via_classifier, 1);
        assert_eq!(metrics.avg_completion_ms, 200);
    }

    #[tokio::test]
    async fn snapshot_is_a_copy() {
        let recorder = MetricsRecorder::new();
        recorder.record_spawn("shell").await;
        let mut snapshot = recorder.snapshot().await;
        if let Some(m) = snapshot.get_mut("shell") {
            m.spawned = 999;
        }
        assert_eq!(recorder.snapshot().await["shell"].spawned, 1);
    }
}
