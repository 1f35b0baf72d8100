//! Agent Lifecycle Manager: owns agent creation/teardown, worktree
//! ownership, per-role concurrency limiting, singleton dedup (at most one
//! active agent per role+issue), and the three-layer circuit breaker
//! (iteration count, tool-call count, turn count, wall-clock duration).

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Semaphore;

use crate::db::Db;
use crate::errors::SquadronError;
use crate::git::Git;
use crate::types::{AgentLifecycleTag, AgentLimits, AgentRecord, AgentStatus};

pub struct LifecycleManager {
    db: Arc<Db>,
    repo_path: String,
    limits: AgentLimits,
    concurrency: Arc<Semaphore>,
}

impl LifecycleManager {
    pub fn new(db: Arc<Db>, repo_path: String, limits: AgentLimits, concurrency_limit: u32) -> Self {
        Self {
            db,
            repo_path,
            limits,
            concurrency: Arc::new(Semaphore::new(concurrency_limit.max(1) as usize)),
        }
    }

    /// Spawns (or returns the existing) agent for `role`/`issue_number`.
    /// Enforces the singleton invariant: a second request for the same
    /// role+issue while one is already active returns the existing record
    /// rather than creating a duplicate. A freshly created agent gets its
    /// own watchdog task and backup timer (layers 1 and 2 of the circuit
    /// breaker; layer 3 is the periodic reconciliation sweep).
    pub async fn spawn_agent(
        self: &Arc<Self>,
        repo_path: &str,
        role: &str,
        issue_number: i64,
        base_branch: &str,
        lifecycle: AgentLifecycleTag,
    ) -> Result<(AgentRecord, Option<tokio::sync::OwnedSemaphorePermit>)> {
        if let Some(existing) = self.db.find_active_agent_for_role_issue(role, issue_number)? {
            return Ok((existing, None));
        }

        let permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .context("acquiring agent concurrency permit")?;

        let agent_id = uuid::Uuid::new_v4().to_string();
        let (branch, worktree_path) = match lifecycle {
            AgentLifecycleTag::Persistent => {
                let branch = format!("squadron/{role}/{issue_number}-{}", &agent_id[..8]);
                let git = Git::new(repo_path.to_string());
                let worktree_path = git
                    .create_worktree(&branch, base_branch)
                    .with_context(|| format!("creating worktree for agent {agent_id}"))?;
                (Some(branch), Some(worktree_path))
            }
            // One-shot; operates out of the shared checkout rather than an
            // isolated worktree, so there's nothing to create or release.
            AgentLifecycleTag::Ephemeral => (None, None),
        };

        let record = AgentRecord {
            agent_id: agent_id.clone(),
            role: role.to_string(),
            issue_number,
            session_id: String::new(),
            status: AgentStatus::Created,
            branch,
            worktree_path,
            pr_number: None,
            pipeline_run_id: None,
            pipeline_stage_id: None,
            active_since: Some(Utc::now()),
            sleeping_since: None,
            iteration_count: 0,
            tool_call_count: 0,
            turn_count: 0,
            lifecycle,
            last_heartbeat: Some(Utc::now()),
            watchdog_escaped: false,
            created_at: Utc::now(),
        };
        self.db.upsert_agent(&record)?;
        self.spawn_watchdog(record.agent_id.clone());
        Ok((record, Some(permit)))
    }

    /// Layer 1 (per-agent watchdog, heartbeats every `min(30s, duration *
    /// 0.1)`, fires at `max_active_duration`) and layer 2 (a backup timer
    /// firing at `max_active_duration + 60s` that force-fails the agent if
    /// the watchdog's heartbeat has gone stale, meaning the watchdog task
    /// itself died without cleaning up). Both run detached from the
    /// caller; they supervise the agent's initial active window — sleep
    /// cycles beyond it fall to the periodic reconciliation sweep.
    fn spawn_watchdog(self: &Arc<Self>, agent_id: String) {
        let max_active = self.limits.max_active_duration_secs.max(1) as u64;
        let heartbeat_interval = std::cmp::min(30, (max_active as f64 * 0.1).round() as u64).max(1);

        let watchdog = Arc::clone(self);
        let watchdog_agent_id = agent_id.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(max_active);
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_secs(heartbeat_interval).min(remaining)).await;
                match watchdog.db.get_agent(&watchdog_agent_id) {
                    Ok(Some(agent)) if !agent.status.is_terminal() => {
                        let _ = watchdog.heartbeat(&watchdog_agent_id);
                    }
                    _ => return,
                }
            }
            if let Err(e) = watchdog.force_fail_if_active(&watchdog_agent_id, false) {
                tracing::warn!(agent_id = %watchdog_agent_id, error = %e, "watchdog force-fail failed");
            }
        });

        let backup = Arc::clone(self);
        let backup_agent_id = agent_id;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(max_active + 60)).await;
            let Ok(Some(agent)) = backup.db.get_agent(&backup_agent_id) else { return };
            if agent.status.is_terminal() {
                return;
            }
            let stale = agent
                .last_heartbeat
                .map(|hb| (Utc::now() - hb).num_seconds() > heartbeat_interval as i64 * 2)
                .unwrap_or(true);
            if stale {
                if let Err(e) = backup.force_fail_if_active(&backup_agent_id, true) {
                    tracing::warn!(agent_id = %backup_agent_id, error = %e, "backup timer force-fail failed");
                }
            }
        });
    }

    fn heartbeat(&self, agent_id: &str) -> Result<()> {
        if let Some(mut agent) = self.db.get_agent(agent_id)? {
            agent.last_heartbeat = Some(Utc::now());
            self.db.upsert_agent(&agent)?;
        }
        Ok(())
    }

    /// Force-fails an agent still in a non-terminal state, as a watchdog
    /// or backup-timer firing. `watchdog_escaped` marks the backup-timer
    /// case, where the primary watchdog itself went missing.
    fn force_fail_if_active(&self, agent_id: &str, watchdog_escaped: bool) -> Result<()> {
        let Some(agent) = self.db.get_agent(agent_id)? else { return Ok(()) };
        if agent.status.is_terminal() {
            return Ok(());
        }
        if watchdog_escaped {
            let mut agent = agent;
            agent.watchdog_escaped = true;
            self.db.upsert_agent(&agent)?;
        }
        self.finish_agent(agent_id, AgentStatus::Failed)?;
        tracing::warn!(%agent_id, watchdog_escaped, "circuit breaker force-failed agent");
        Ok(())
    }

    /// Records activity and enforces the circuit breaker. `session_id` is
    /// whatever the worker reported this turn, successful or not — it's
    /// what a later `continue_session: true` stage resumes by. Returns an
    /// error when any configured limit is exceeded; the caller is expected
    /// to escalate the owning stage run on this error.
    pub fn record_turn(&self, agent_id: &str, tool_calls_this_turn: u32, session_id: Option<&str>) -> Result<()> {
        let mut agent = self
            .db
            .get_agent(agent_id)?
            .ok_or_else(|| SquadronError::NotFound {
                kind: "agent",
                id: agent_id.to_string(),
            })?;

        agent.iteration_count += 1;
        agent.tool_call_count += tool_calls_this_turn;
        agent.turn_count += 1;
        agent.last_heartbeat = Some(Utc::now());
        if let Some(session_id) = session_id {
            if !session_id.is_empty() {
                agent.session_id = session_id.to_string();
            }
        }
        self.db.upsert_agent(&agent)?;

        if agent.iteration_count > self.limits.max_iterations {
            return Err(SquadronError::CircuitBreakerTripped {
                agent_id: agent_id.to_string(),
                limit: format!("max_iterations ({})", self.limits.max_iterations),
            }
            .into());
        }
        if agent.tool_call_count > self.limits.max_tool_calls {
            return Err(SquadronError::CircuitBreakerTripped {
                agent_id: agent_id.to_string(),
                limit: format!("max_tool_calls ({})", self.limits.max_tool_calls),
            }
            .into());
        }
        if agent.turn_count > self.limits.max_turns {
            return Err(SquadronError::CircuitBreakerTripped {
                agent_id: agent_id.to_string(),
                limit: format!("max_turns ({})", self.limits.max_turns),
            }
            .into());
        }
        if let Some(active_since) = agent.active_since {
            let elapsed = (Utc::now() - active_since).num_seconds();
            if elapsed > self.limits.max_active_duration_secs {
                return Err(SquadronError::CircuitBreakerTripped {
                    agent_id: agent_id.to_string(),
                    limit: format!("max_active_duration_secs ({})", self.limits.max_active_duration_secs),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn sleep_agent(&self, agent_id: &str) -> Result<()> {
        let mut agent = self
            .db
            .get_agent(agent_id)?
            .ok_or_else(|| SquadronError::NotFound {
                kind: "agent",
                id: agent_id.to_string(),
            })?;
        agent.status = AgentStatus::Sleeping;
        agent.sleeping_since = Some(Utc::now());
        self.db.upsert_agent(&agent)?;
        Ok(())
    }

    pub fn wake_agent(&self, agent_id: &str) -> Result<()> {
        let mut agent = self
            .db
            .get_agent(agent_id)?
            .ok_or_else(|| SquadronError::NotFound {
                kind: "agent",
                id: agent_id.to_string(),
            })?;
        agent.status = AgentStatus::Active;
        agent.sleeping_since = None;
        agent.active_since = Some(Utc::now());
        self.db.upsert_agent(&agent)?;
        Ok(())
    }

    /// Releases a persistent agent's worktree once it reaches a terminal
    /// status. Ephemeral agents never had one (they share the main
    /// checkout), so there's nothing to release for those.
    pub fn finish_agent(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let mut agent = self
            .db
            .get_agent(agent_id)?
            .ok_or_else(|| SquadronError::NotFound {
                kind: "agent",
                id: agent_id.to_string(),
            })?;
        agent.status = status;
        self.db.upsert_agent(&agent)?;

        if agent.lifecycle == AgentLifecycleTag::Persistent {
            if let Some(worktree_path) = &agent.worktree_path {
                let git = Git::new(self.repo_path.clone());
                if let Err(e) = git.remove_worktree(worktree_path) {
                    tracing::warn!(%agent_id, error = %e, "failed to remove agent worktree");
                }
            }
        }
        Ok(())
    }

    /// Periodic watchdog sweep: any active agent whose last heartbeat is
    /// older than the configured timeout is marked escaped and failed so
    /// the reconciliation pass can pick up its owning stage run.
    pub fn sweep_watchdog(&self, timeout_secs: i64) -> Result<Vec<String>> {
        let mut escaped = Vec::new();
        for mut agent in self.db.list_active_agents()? {
            let Some(heartbeat) = agent.last_heartbeat else {
                continue;
            };
            let idle = (Utc::now() - heartbeat).num_seconds();
            if idle > timeout_secs {
                agent.watchdog_escaped = true;
                agent.status = AgentStatus::Failed;
                self.db.upsert_agent(&agent)?;
                escaped.push(agent.agent_id);
            }
        }
        Ok(escaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::fs::write(dir.path().join("README.md"), "hi").unwrap();
        std::process::Command::new("git")
            .args(["add", "."])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["-c", "user.email=test@test.com", "-c", "user.name=test", "commit", "-q", "-m", "init"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["branch", "-M", "main"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn spawning_twice_for_same_role_issue_returns_same_agent() {
        let repo = init_repo();
        let db = Arc::new(Db::open_in_memory().unwrap());
        let manager = Arc::new(LifecycleManager::new(db, repo.path().to_str().unwrap().to_string(), AgentLimits::default(), 4));
        let (first, _permit1) = manager
            .spawn_agent(repo.path().to_str().unwrap(), "dev", 1, "main", AgentLifecycleTag::Ephemeral)
            .await
            .unwrap();
        let (second, permit2) = manager
            .spawn_agent(repo.path().to_str().unwrap(), "dev", 1, "main", AgentLifecycleTag::Ephemeral)
            .await
            .unwrap();
        assert_eq!(first.agent_id, second.agent_id);
        assert!(permit2.is_none());
    }

    #[tokio::test]
    async fn ephemeral_agents_get_no_dedicated_worktree() {
        let repo = init_repo();
        let db = Arc::new(Db::open_in_memory().unwrap());
        let manager = Arc::new(LifecycleManager::new(db, repo.path().to_str().unwrap().to_string(), AgentLimits::default(), 4));
        let (agent, _permit) = manager
            .spawn_agent(repo.path().to_str().unwrap(), "reviewer", 9, "main", AgentLifecycleTag::Ephemeral)
            .await
            .unwrap();
        assert!(agent.worktree_path.is_none());
        assert!(agent.branch.is_none());
    }

    #[tokio::test]
    async fn finishing_a_persistent_agent_releases_its_worktree() {
        let repo = init_repo();
        let db = Arc::new(Db::open_in_memory().unwrap());
        let manager = Arc::new(LifecycleManager::new(db, repo.path().to_str().unwrap().to_string(), AgentLimits::default(), 4));
        let (agent, _permit) = manager
            .spawn_agent(repo.path().to_str().unwrap(), "dev", 7, "main", AgentLifecycleTag::Persistent)
            .await
            .unwrap();
        let worktree_path = agent.worktree_path.clone().unwrap();
        assert!(std::path::Path::new(&worktree_path).exists());

        manager.finish_agent(&agent.agent_id, AgentStatus::Completed).unwrap();
        assert!(!std::path::Path::new(&worktree_path).exists());
    }

    #[test]
    fn record_turn_trips_breaker_past_max_iterations() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let limits = AgentLimits {
            max_iterations: 2,
            ..AgentLimits::default()
        };
        let manager = LifecycleManager::new(db.clone(), "/tmp".to_string(), limits, 4);
        let agent = AgentRecord {
            agent_id: "agent-x".to_string(),
            role: "dev".to_string(),
            issue_number: 1,
            session_id: String::new(),
            status: AgentStatus::Active,
            branch: None,
            worktree_path: None,
            pr_number: None,
            pipeline_run_id: None,
            pipeline_stage_id: None,
            active_since: Some(Utc::now()),
            sleeping_since: None,
            iteration_count: 0,
            tool_call_count: 0,
            turn_count: 0,
            lifecycle: AgentLifecycleTag::Ephemeral,
            last_heartbeat: Some(Utc::now()),
            watchdog_escaped: false,
            created_at: Utc::now(),
        };
        db.upsert_agent(&agent).unwrap();
        manager.record_turn("agent-x", 1, None).unwrap();
        manager.record_turn("agent-x", 1, None).unwrap();
        assert!(manager.record_turn("agent-x", 1, None).is_err());
    }
}
