//! In-memory `SessionWorker` for pipeline/lifecycle tests that don't want
//! a real subprocess in the loop.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use squadron_core::bridge::{SessionWorker, WorkerEvent, WorkerOutcome, WorkerRequest};

/// Scripted outcome for a single `run_turn` call.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub success: bool,
    pub outputs: Value,
    pub session_id: String,
}

pub struct FakeSessionWorker {
    script: Mutex<Vec<ScriptedTurn>>,
    pub calls: Mutex<Vec<WorkerRequest>>,
}

impl FakeSessionWorker {
    pub fn new(script: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_succeeds(outputs: Value) -> Self {
        Self::new(vec![ScriptedTurn {
            success: true,
            outputs,
            session_id: "fake-session".to_string(),
        }])
    }
}

#[async_trait]
impl SessionWorker for FakeSessionWorker {
    async fn run_turn(&self, request: WorkerRequest) -> anyhow::Result<WorkerOutcome> {
        self.calls.lock().unwrap().push(request.clone());
        let mut script = self.script.lock().unwrap();
        let turn = if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().cloned().ok_or_else(|| anyhow::anyhow!("fake worker script exhausted"))?
        };

        let events = vec![if turn.success {
            WorkerEvent::AgentCompleted {
                outputs: turn.outputs.clone(),
                session_id: turn.session_id.clone(),
            }
        } else {
            WorkerEvent::AgentBlocked {
                reason: "scripted failure".to_string(),
            }
        }];

        Ok(WorkerOutcome {
            events,
            session_id: Some(turn.session_id),
            outputs: turn.outputs,
            success: turn.success,
        })
    }

    async fn inject_message(&self, _agent_id: &str, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn interrupt(&self, _agent_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_worker_replays_scripted_outcome() {
        let worker = FakeSessionWorker::always_succeeds(serde_json::json!({"artifact": "out.txt"}));
        let request = WorkerRequest {
            agent_id: "a1".to_string(),
            role: "dev".to_string(),
            action: "build".to_string(),
            instruction: "build".to_string(),
            worktree_path: "/tmp".to_string(),
            resume_session_id: None,
            timeout_secs: 0,
        };
        let outcome = worker.run_turn(request).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.outputs["artifact"], "out.txt");
        assert_eq!(worker.calls.lock().unwrap().len(), 1);
    }
}
