pub mod adapter;
pub mod backend;
pub mod buffer;
pub mod classifier;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod rules;
pub mod sanitize;
pub mod session;

// Public API
pub use adapter::{AgentAdapter, AgentType, ApprovalPreset};
pub use backend::{
    BackendEvent, BackendFactory, BackendKind, NativeBackend, SessionBackend, SpawnConfig,
    WorkerBackend,
};
pub use buffer::OutputBuffer;
pub use classifier::{StallClassification, StallClassifier, StallContext};
pub use config::{load_config, OrchestratorConfig};
pub use error::OrchestratorError;
pub use metrics::{AgentMetrics, CompletionPath, MetricsRecorder};
pub use model::{CommandModelClient, ModelClient, ModelTier};
pub use orchestrator::{Orchestrator, OutputSubscription, SessionEvent, SpawnOptions};
pub use rules::{default_rules, AutoResponseRule, CompiledRule, RuleResponse};
pub use sanitize::OutputSanitizer;
pub use session::{SessionFilter, SessionInfo, SessionStatus};
