//! Reconciliation & Recovery: at startup, abandon any agent left in a
//! running state by an unclean shutdown and re-evaluate the stage runs
//! that depended on them; periodically thereafter, the watchdog sweep
//! does the same for agents that silently stopped heartbeating.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::db::Db;
use crate::lifecycle::LifecycleManager;
use crate::pipeline::{PipelineEngine, StageOutcome};
use crate::types::StageRunStatus;

pub struct Reconciler {
    db: Arc<Db>,
    lifecycle: Arc<LifecycleManager>,
    engine: Arc<PipelineEngine>,
}

impl Reconciler {
    pub fn new(db: Arc<Db>, lifecycle: Arc<LifecycleManager>, engine: Arc<PipelineEngine>) -> Self {
        Self { db, lifecycle, engine }
    }

    /// Runs once at process startup, before any new event is accepted.
    pub async fn startup_recovery(&self) -> Result<()> {
        let abandoned = self.db.abandon_running_agents()?;
        if abandoned > 0 {
            warn!(count = abandoned, "abandoned agents left running across restart");
        }

        let mut retried = 0u32;
        for run in self.db.list_active_runs()? {
            for stage_run in self.db.list_stage_runs_for_run(&run.run_id)? {
                if stage_run.status == StageRunStatus::Running {
                    info!(run_id = %run.run_id, stage_id = %stage_run.stage_id, "re-driving stage interrupted by restart");
                    self.db.update_stage_run_status(stage_run.id, StageRunStatus::Failed, None, Some("interrupted by restart"))?;
                    retried += 1;
                }
            }
            // a run whose current stage just got marked failed is re-ticked;
            // execute_stage will retry it from scratch (agent stages spawn a
            // fresh attempt rather than resuming the dead process directly)
            let _ = self.engine.tick(&run.run_id).await;
        }
        if retried > 0 {
            info!(count = retried, "re-drove stage runs interrupted by restart");
        }
        Ok(())
    }

    /// Periodic sweep: watchdog timeout + orphaned-run detection.
    pub async fn periodic_sweep(&self, watchdog_timeout_secs: i64) -> Result<()> {
        let escaped = self.lifecycle.sweep_watchdog(watchdog_timeout_secs)?;
        for agent_id in &escaped {
            warn!(%agent_id, "watchdog declared agent escaped (no heartbeat)");
        }

        for run in self.db.list_active_runs()? {
            if let Some(stage_id) = &run.current_stage_id {
                let stage_runs = self.db.list_stage_runs_for_run(&run.run_id)?;
                let stalled = stage_runs
                    .iter()
                    .filter(|s| &s.stage_id == stage_id)
                    .any(|s| s.agent_id.as_deref().map(|a| escaped.iter().any(|e| e == a)).unwrap_or(false));
                if stalled {
                    match self.engine.tick(&run.run_id).await {
                        Ok(StageOutcome::Terminal(status)) => {
                            info!(run_id = %run.run_id, ?status, "reconciliation drove stalled run to terminal state");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(run_id = %run.run_id, error = %e, "reconciliation re-tick failed"),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::DefinitionSet;
    use crate::forge::FakeForgeClient;
    use crate::gates::GateRegistry;
    use crate::types::AgentLimits;

    #[tokio::test]
    async fn startup_recovery_abandons_running_agents() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let agent = crate::types::AgentRecord {
            agent_id: "agent-1".to_string(),
            role: "dev".to_string(),
            issue_number: 1,
            session_id: String::new(),
            status: crate::types::AgentStatus::Active,
            branch: None,
            worktree_path: None,
            pr_number: None,
            pipeline_run_id: None,
            pipeline_stage_id: None,
            active_since: Some(chrono::Utc::now()),
            sleeping_since: None,
            iteration_count: 0,
            tool_call_count: 0,
            turn_count: 0,
            lifecycle: crate::types::AgentLifecycleTag::Ephemeral,
            last_heartbeat: Some(chrono::Utc::now()),
            watchdog_escaped: false,
            created_at: chrono::Utc::now(),
        };
        db.upsert_agent(&agent).unwrap();

        let lifecycle = Arc::new(LifecycleManager::new(db.clone(), "/tmp/repo".to_string(), AgentLimits::default(), 4));
        let engine = Arc::new(PipelineEngine::new(
            db.clone(),
            Arc::new(DefinitionSet::default()),
            lifecycle.clone(),
            Arc::new(GateRegistry::with_builtins(())),
            Arc::new(FakeForgeClient::default()),
            "/tmp/repo".to_string(),
            "acme/widgets".to_string(),
        ));
        let reconciler = Reconciler::new(db.clone(), lifecycle, engine);
        reconciler.startup_recovery().await.unwrap();

        let fetched = db.get_agent("agent-1").unwrap().unwrap();
        assert_eq!(fetched.status, crate::types::AgentStatus::Failed);
    }
}
