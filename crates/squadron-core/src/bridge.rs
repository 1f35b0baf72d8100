//! The boundary between the orchestrator and an LLM-session subprocess.
//! `SessionWorker` is the trait the pipeline engine drives; what sits
//! behind it (a real CLI subprocess, a test fake) is opaque and owns no
//! orchestration logic of its own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a worker reports back as it executes a stage action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    ToolCallStarted { tool: String, call_id: String },
    ToolCallFinished { call_id: String, success: bool },
    Reasoning { text: String },
    AgentCompleted { outputs: Value, session_id: String },
    AgentBlocked { reason: String },
    AgentEscalated { reason: String },
}

/// Everything a worker needs to start a turn: the role's instruction, the
/// worktree it runs in, and — when `continue_session` is set — the prior
/// session id to resume.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub agent_id: String,
    pub role: String,
    pub action: String,
    pub instruction: String,
    pub worktree_path: String,
    pub resume_session_id: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub events: Vec<WorkerEvent>,
    pub session_id: Option<String>,
    pub outputs: Value,
    pub success: bool,
}

/// Drives a single agent turn to completion (or failure/timeout).
///
/// Implementations own process lifecycle — spawn, IPC, timeout — but never
/// interpret pipeline semantics; that stays in `pipeline.rs`.
#[async_trait]
pub trait SessionWorker: Send + Sync {
    async fn run_turn(&self, request: WorkerRequest) -> anyhow::Result<WorkerOutcome>;

    /// Best-effort: inject a message into a still-running turn (used for
    /// reactive wake-ups). Implementations may no-op if unsupported.
    async fn inject_message(&self, agent_id: &str, message: &str) -> anyhow::Result<()>;

    /// Best-effort cancellation of an in-flight turn.
    async fn interrupt(&self, agent_id: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_event_serializes_with_kind_tag() {
        let event = WorkerEvent::AgentCompleted {
            outputs: serde_json::json!({"artifact": "out.tar"}),
            session_id: "sess-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "agent_completed");
        assert_eq!(json["session_id"], "sess-1");
    }
}
