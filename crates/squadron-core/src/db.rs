//! The Unified Registry: a single sqlite database holding pipeline runs,
//! stage runs, gate check history, agent records, PR approval state, mail,
//! and the activity log. One `Mutex<Connection>` guards all access —
//! sqlite serializes writers anyway, and the orchestrator's write volume
//! never approaches contention.

use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::types::*;

const SCHEMA: &str = include_str!("schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating data dir {parent:?}"))?;
        }
        let conn = Connection::open(path).with_context(|| format!("opening database at {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enabling foreign keys")?;
        conn.execute_batch(SCHEMA).context("applying schema")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        conn.execute_batch(SCHEMA).context("applying schema")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Idempotent, additive schema evolution: each column add is guarded by
    /// checking `pragma_table_info` first so re-running never errors.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        add_column_if_missing(&conn, "agents", "watchdog_escaped", "INTEGER NOT NULL DEFAULT 0")?;
        Ok(())
    }

    // ── pipeline runs ────────────────────────────────────────────────

    pub fn create_pipeline_run(&self, run: &PipelineRun) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipeline_runs
                (run_id, pipeline_name, definition_snapshot, trigger_event_delivery_id,
                 issue_number, primary_pr_number, scope, status, current_stage_id,
                 context, parent_run_id, parent_stage_id, nesting_depth,
                 created_at, updated_at, error_message, error_stage_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                run.run_id,
                run.pipeline_name,
                serde_json::to_string(&run.definition_snapshot)?,
                run.trigger_event_delivery_id,
                run.issue_number,
                run.primary_pr_number,
                scope_str(run.scope),
                run.status.as_str(),
                run.current_stage_id,
                serde_json::to_string(&run.context)?,
                run.parent_run_id,
                run.parent_stage_id,
                run.nesting_depth,
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
                run.error_message,
                run.error_stage_id,
            ],
        )
        .context("create_pipeline_run")?;
        Ok(())
    }

    pub fn get_pipeline_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT run_id, pipeline_name, definition_snapshot, trigger_event_delivery_id,
                    issue_number, primary_pr_number, scope, status, current_stage_id,
                    context, parent_run_id, parent_stage_id, nesting_depth,
                    created_at, updated_at, error_message, error_stage_id
             FROM pipeline_runs WHERE run_id = ?1",
            params![run_id],
            row_to_pipeline_run,
        )
        .optional()
        .context("get_pipeline_run")
    }

    pub fn update_run_status(&self, run_id: &str, status: RunStatus, error_message: Option<&str>, error_stage_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, error_message = ?2, error_stage_id = ?3, updated_at = ?4 WHERE run_id = ?5",
            params![status.as_str(), error_message, error_stage_id, Utc::now().to_rfc3339(), run_id],
        )
        .context("update_run_status")?;
        Ok(())
    }

    pub fn set_current_stage(&self, run_id: &str, stage_id: Option<&str>, context: &std::collections::HashMap<String, Value>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pipeline_runs SET current_stage_id = ?1, context = ?2, updated_at = ?3 WHERE run_id = ?4",
            params![stage_id, serde_json::to_string(context)?, Utc::now().to_rfc3339(), run_id],
        )
        .context("set_current_stage")?;
        Ok(())
    }

    pub fn list_active_runs(&self) -> Result<Vec<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, pipeline_name, definition_snapshot, trigger_event_delivery_id,
                    issue_number, primary_pr_number, scope, status, current_stage_id,
                    context, parent_run_id, parent_stage_id, nesting_depth,
                    created_at, updated_at, error_message, error_stage_id
             FROM pipeline_runs WHERE status IN ('pending', 'running') ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![], row_to_pipeline_run)
            .context("list_active_runs")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_runs_for_pipeline(&self, pipeline_name: &str, limit: u32) -> Result<Vec<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, pipeline_name, definition_snapshot, trigger_event_delivery_id,
                    issue_number, primary_pr_number, scope, status, current_stage_id,
                    context, parent_run_id, parent_stage_id, nesting_depth,
                    created_at, updated_at, error_message, error_stage_id
             FROM pipeline_runs WHERE pipeline_name = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![pipeline_name, limit], row_to_pipeline_run)
            .context("list_runs_for_pipeline")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Dashboard-facing paginated listing with optional filters, newest
    /// run first. `status` is matched against `RunStatus::as_str`.
    pub fn list_runs_filtered(
        &self,
        status: Option<&str>,
        pipeline_name: Option<&str>,
        pr_number: Option<i64>,
        issue_number: Option<i64>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        let mut clauses = Vec::new();
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(s) = &status {
            clauses.push("status = ?");
            values.push(s);
        }
        if let Some(p) = &pipeline_name {
            clauses.push("pipeline_name = ?");
            values.push(p);
        }
        if let Some(pr) = &pr_number {
            clauses.push("primary_pr_number = ?");
            values.push(pr);
        }
        if let Some(issue) = &issue_number {
            clauses.push("issue_number = ?");
            values.push(issue);
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT run_id, pipeline_name, definition_snapshot, trigger_event_delivery_id,
                    issue_number, primary_pr_number, scope, status, current_stage_id,
                    context, parent_run_id, parent_stage_id, nesting_depth,
                    created_at, updated_at, error_message, error_stage_id
             FROM pipeline_runs {where_clause} ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );
        values.push(&limit);
        values.push(&offset);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(values.as_slice(), row_to_pipeline_run)
            .context("list_runs_filtered")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── stage runs ───────────────────────────────────────────────────

    pub fn create_stage_run(&self, stage_run: &StageRun) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO stage_runs
                (run_id, stage_id, attempt_number, status, agent_id, branch_id,
                 parent_stage_id, child_pipeline_run_id, outputs, error_message,
                 started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                stage_run.run_id,
                stage_run.stage_id,
                stage_run.attempt_number,
                stage_run.status.as_str(),
                stage_run.agent_id,
                stage_run.branch_id,
                stage_run.parent_stage_id,
                stage_run.child_pipeline_run_id,
                serde_json::to_string(&stage_run.outputs)?,
                stage_run.error_message,
                stage_run.started_at.to_rfc3339(),
                stage_run.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("create_stage_run")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_stage_run_status(
        &self,
        id: i64,
        status: StageRunStatus,
        outputs: Option<&std::collections::HashMap<String, Value>>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let completed_at = if status.is_terminal() {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        conn.execute(
            "UPDATE stage_runs SET status = ?1, outputs = COALESCE(?2, outputs), error_message = ?3, completed_at = COALESCE(?4, completed_at) WHERE id = ?5",
            params![
                status.as_str(),
                outputs.map(serde_json::to_string).transpose()?,
                error_message,
                completed_at,
                id,
            ],
        )
        .context("update_stage_run_status")?;
        Ok(())
    }

    /// Records which agent is occupying a stage run, once the Lifecycle
    /// Manager has spawned or resolved it. Needed by reconciliation to
    /// correlate a watchdog-escaped agent back to the run it's stalling.
    pub fn set_stage_run_agent(&self, id: i64, agent_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE stage_runs SET agent_id = ?1 WHERE id = ?2",
            params![agent_id, id],
        )
        .context("set_stage_run_agent")?;
        Ok(())
    }

    pub fn get_stage_run(&self, id: i64) -> Result<Option<StageRun>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, run_id, stage_id, attempt_number, status, agent_id, branch_id,
                    parent_stage_id, child_pipeline_run_id, outputs, error_message,
                    started_at, completed_at
             FROM stage_runs WHERE id = ?1",
            params![id],
            row_to_stage_run,
        )
        .optional()
        .context("get_stage_run")
    }

    pub fn list_stage_runs_for_run(&self, run_id: &str) -> Result<Vec<StageRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, stage_id, attempt_number, status, agent_id, branch_id,
                    parent_stage_id, child_pipeline_run_id, outputs, error_message,
                    started_at, completed_at
             FROM stage_runs WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![run_id], row_to_stage_run)
            .context("list_stage_runs_for_run")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── gate checks ──────────────────────────────────────────────────

    pub fn record_gate_check(&self, record: &GateCheckRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO gate_check_records
                (stage_run_id, check_type, check_config_snapshot, passed, message, result_data, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.stage_run_id,
                record.check_type,
                serde_json::to_string(&record.check_config_snapshot)?,
                record.passed,
                record.message,
                record.result_data.as_ref().map(serde_json::to_string).transpose()?,
                record.checked_at.to_rfc3339(),
            ],
        )
        .context("record_gate_check")?;
        Ok(conn.last_insert_rowid())
    }

    // ── agents ───────────────────────────────────────────────────────

    pub fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agents
                (agent_id, role, issue_number, session_id, status, branch, worktree_path,
                 pr_number, pipeline_run_id, pipeline_stage_id, active_since, sleeping_since,
                 iteration_count, tool_call_count, turn_count, lifecycle, last_heartbeat,
                 watchdog_escaped, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(agent_id) DO UPDATE SET
                session_id = excluded.session_id,
                status = excluded.status,
                branch = excluded.branch,
                worktree_path = excluded.worktree_path,
                pr_number = excluded.pr_number,
                pipeline_run_id = excluded.pipeline_run_id,
                pipeline_stage_id = excluded.pipeline_stage_id,
                active_since = excluded.active_since,
                sleeping_since = excluded.sleeping_since,
                iteration_count = excluded.iteration_count,
                tool_call_count = excluded.tool_call_count,
                turn_count = excluded.turn_count,
                last_heartbeat = excluded.last_heartbeat,
                watchdog_escaped = excluded.watchdog_escaped",
            params![
                agent.agent_id,
                agent.role,
                agent.issue_number,
                agent.session_id,
                agent.status.as_str(),
                agent.branch,
                agent.worktree_path,
                agent.pr_number,
                agent.pipeline_run_id,
                agent.pipeline_stage_id,
                agent.active_since.map(|t| t.to_rfc3339()),
                agent.sleeping_since.map(|t| t.to_rfc3339()),
                agent.iteration_count,
                agent.tool_call_count,
                agent.turn_count,
                agent.lifecycle.as_str(),
                agent.last_heartbeat.map(|t| t.to_rfc3339()),
                agent.watchdog_escaped,
                agent.created_at.to_rfc3339(),
            ],
        )
        .context("upsert_agent")?;
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT agent_id, role, issue_number, session_id, status, branch, worktree_path,
                    pr_number, pipeline_run_id, pipeline_stage_id, active_since, sleeping_since,
                    iteration_count, tool_call_count, turn_count, lifecycle, last_heartbeat,
                    watchdog_escaped, created_at
             FROM agents WHERE agent_id = ?1",
            params![agent_id],
            row_to_agent,
        )
        .optional()
        .context("get_agent")
    }

    pub fn find_active_agent_for_role_issue(&self, role: &str, issue_number: i64) -> Result<Option<AgentRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT agent_id, role, issue_number, session_id, status, branch, worktree_path,
                    pr_number, pipeline_run_id, pipeline_stage_id, active_since, sleeping_since,
                    iteration_count, tool_call_count, turn_count, lifecycle, last_heartbeat,
                    watchdog_escaped, created_at
             FROM agents
             WHERE role = ?1 AND issue_number = ?2 AND status IN ('created', 'active', 'sleeping')",
            params![role, issue_number],
            row_to_agent,
        )
        .optional()
        .context("find_active_agent_for_role_issue")
    }

    /// Most recent agent record for this role+issue other than `exclude_agent_id`,
    /// regardless of status. A retried stage spawns a fresh agent_id (and
    /// worktree) each attempt, so `continue_session` resume has to look here
    /// rather than at the newly spawned agent's own (empty) session id.
    pub fn find_last_agent_for_role_issue(&self, role: &str, issue_number: i64, exclude_agent_id: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT agent_id, role, issue_number, session_id, status, branch, worktree_path,
                    pr_number, pipeline_run_id, pipeline_stage_id, active_since, sleeping_since,
                    iteration_count, tool_call_count, turn_count, lifecycle, last_heartbeat,
                    watchdog_escaped, created_at
             FROM agents
             WHERE role = ?1 AND issue_number = ?2 AND agent_id != ?3
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![role, issue_number, exclude_agent_id],
            row_to_agent,
        )
        .optional()
        .context("find_last_agent_for_role_issue")
    }

    pub fn list_active_agents(&self) -> Result<Vec<AgentRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT agent_id, role, issue_number, session_id, status, branch, worktree_path,
                    pr_number, pipeline_run_id, pipeline_stage_id, active_since, sleeping_since,
                    iteration_count, tool_call_count, turn_count, lifecycle, last_heartbeat,
                    watchdog_escaped, created_at
             FROM agents WHERE status IN ('created', 'active', 'sleeping')",
        )?;
        let rows = stmt
            .query_map(params![], row_to_agent)
            .context("list_active_agents")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Crash recovery: any agent left `active` across a restart did not
    /// exit cleanly and is marked `failed` so the reconciliation sweep can
    /// re-evaluate its owning stage run.
    pub fn abandon_running_agents(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE agents SET status = 'failed' WHERE status = 'active'",
            params![],
        )
        .context("abandon_running_agents")?;
        Ok(n as u64)
    }

    // ── PR approval state ────────────────────────────────────────────

    pub fn add_pr_review_requirement(&self, req: &PrReviewRequirement) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO pr_review_requirements (pr_number, role, required_count, owning_run_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![req.pr_number, req.role, req.required_count, req.owning_run_id],
        )
        .context("add_pr_review_requirement")?;
        Ok(())
    }

    pub fn record_pr_approval(&self, approval: &PrApproval) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pr_approvals (pr_number, role, approved, reviewer, review_id, stale, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                approval.pr_number,
                approval.role,
                approval.approved,
                approval.reviewer,
                approval.review_id,
                approval.stale,
                approval.created_at.to_rfc3339(),
            ],
        )
        .context("record_pr_approval")?;
        Ok(())
    }

    /// Marks all non-stale approvals for `pr_number`/`role` as stale
    /// (invoked when new commits land on the PR, per the staleness rule).
    pub fn invalidate_approvals(&self, pr_number: i64, role: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pr_approvals SET stale = 1 WHERE pr_number = ?1 AND role = ?2 AND stale = 0",
            params![pr_number, role],
        )
        .context("invalidate_approvals")?;
        Ok(())
    }

    pub fn count_fresh_approvals(&self, pr_number: i64, role: &str) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pr_approvals WHERE pr_number = ?1 AND role = ?2 AND approved = 1 AND stale = 0",
            params![pr_number, role],
            |row| row.get(0),
        )
        .context("count_fresh_approvals")?;
        Ok(n as u32)
    }

    pub fn get_pr_sequence_cursor(&self, pr_number: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT cursor FROM pr_sequence_state WHERE pr_number = ?1",
            params![pr_number],
            |row| row.get(0),
        )
        .optional()
        .context("get_pr_sequence_cursor")
        .map(|v| v.unwrap_or(0))
    }

    pub fn advance_pr_sequence_cursor(&self, pr_number: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pr_sequence_state (pr_number, cursor) VALUES (?1, 1)
             ON CONFLICT(pr_number) DO UPDATE SET cursor = cursor + 1",
            params![pr_number],
        )
        .context("advance_pr_sequence_cursor")?;
        conn.query_row(
            "SELECT cursor FROM pr_sequence_state WHERE pr_number = ?1",
            params![pr_number],
            |row| row.get(0),
        )
        .context("advance_pr_sequence_cursor (read back)")
    }

    // ── activity + mail ──────────────────────────────────────────────

    pub fn record_activity_event(&self, event: &ActivityEvent) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO activity_events (agent_id, pipeline_run_id, event_type, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.agent_id,
                event.pipeline_run_id,
                serde_json::to_string(&event.event_type)?.trim_matches('"'),
                event.timestamp.to_rfc3339(),
                event.metadata.as_ref().map(serde_json::to_string).transpose()?,
            ],
        )
        .context("record_activity_event")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_recent_activity(&self, agent_id: Option<&str>, limit: u32) -> Result<Vec<ActivityEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match agent_id {
            Some(_) => conn.prepare(
                "SELECT id, agent_id, pipeline_run_id, event_type, timestamp, metadata
                 FROM activity_events WHERE agent_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?,
            None => conn.prepare(
                "SELECT id, agent_id, pipeline_run_id, event_type, timestamp, metadata
                 FROM activity_events ORDER BY id DESC LIMIT ?1",
            )?,
        };
        let rows = match agent_id {
            Some(a) => stmt
                .query_map(params![a, limit], row_to_activity_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![limit], row_to_activity_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    pub fn append_mail(&self, message: &MailMessage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO mail_messages (message_id, agent_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![message.message_id, message.agent_id, message.role, message.content, message.created_at.to_rfc3339()],
        )
        .context("append_mail")?;
        Ok(())
    }

    pub fn drain_mail(&self, agent_id: &str) -> Result<Vec<MailMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT message_id, agent_id, role, content, created_at FROM mail_messages WHERE agent_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![agent_id], row_to_mail_message)
            .context("drain_mail")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        conn.execute("DELETE FROM mail_messages WHERE agent_id = ?1", params![agent_id])
            .context("drain_mail (delete)")?;
        Ok(rows)
    }

    // ── event dedup ──────────────────────────────────────────────────

    pub fn mark_delivery_processed(&self, delivery_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_deliveries (delivery_id, received_at) VALUES (?1, ?2)",
            params![delivery_id, Utc::now().to_rfc3339()],
        )
        .context("mark_delivery_processed")?;
        Ok(inserted > 0)
    }

    /// Associates a PR with a run, optionally tagging which stage and role
    /// brought it into scope. Called once for the run's primary PR and
    /// again for every secondary PR a `multi_pr`-scoped run touches, so a
    /// single run can carry several rows here.
    pub fn associate_pr(&self, run_id: &str, repo: &str, pr_number: i64, stage_id: Option<&str>, role: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO pipeline_pr_associations (run_id, repo, pr_number, stage_id, role) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, repo, pr_number, stage_id, role],
        )
        .context("associate_pr")?;
        Ok(())
    }

    /// Every PR a run has touched, primary or secondary, in the order they
    /// were associated.
    pub fn pr_associations_for_run(&self, run_id: &str) -> Result<Vec<(String, i64, Option<String>, Option<String>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT repo, pr_number, stage_id, role FROM pipeline_pr_associations WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .context("pr_associations_for_run")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Active runs with `pr_number` in scope, whether as the primary PR or
    /// a secondary one recorded via `associate_pr`.
    pub fn running_pipelines_for_pr(&self, pr_number: i64) -> Result<Vec<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, pipeline_name, definition_snapshot, trigger_event_delivery_id,
                    issue_number, primary_pr_number, scope, status, current_stage_id,
                    context, parent_run_id, parent_stage_id, nesting_depth,
                    created_at, updated_at, error_message, error_stage_id
             FROM pipeline_runs
             WHERE status IN ('pending', 'running')
               AND (primary_pr_number = ?1
                    OR run_id IN (SELECT run_id FROM pipeline_pr_associations WHERE pr_number = ?1))
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![pr_number], row_to_pipeline_run)
            .context("running_pipelines_for_pr")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Active runs with `issue_number` in scope.
    pub fn running_pipelines_for_issue(&self, issue_number: i64) -> Result<Vec<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, pipeline_name, definition_snapshot, trigger_event_delivery_id,
                    issue_number, primary_pr_number, scope, status, current_stage_id,
                    context, parent_run_id, parent_stage_id, nesting_depth,
                    created_at, updated_at, error_message, error_stage_id
             FROM pipeline_runs WHERE status IN ('pending', 'running') AND issue_number = ?1
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![issue_number], row_to_pipeline_run)
            .context("running_pipelines_for_issue")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Direct sub-pipeline runs spawned by `run_id`'s `pipeline`-kind stages.
    pub fn children_of(&self, run_id: &str) -> Result<Vec<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, pipeline_name, definition_snapshot, trigger_event_delivery_id,
                    issue_number, primary_pr_number, scope, status, current_stage_id,
                    context, parent_run_id, parent_stage_id, nesting_depth,
                    created_at, updated_at, error_message, error_stage_id
             FROM pipeline_runs WHERE parent_run_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![run_id], row_to_pipeline_run)
            .context("children_of")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent recorded result for `check_type` against the current (or
    /// most recent) stage run of `stage_id` within `run_id`. Used to reuse a
    /// prior gate evaluation instead of re-running a check that doesn't
    /// react to the event that woke the run.
    pub fn latest_gate_check(&self, run_id: &str, stage_id: &str, check_type: &str) -> Result<Option<GateCheckRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT g.id, g.stage_run_id, g.check_type, g.check_config_snapshot, g.passed, g.message, g.result_data, g.checked_at
             FROM gate_check_records g
             JOIN stage_runs s ON s.id = g.stage_run_id
             WHERE s.run_id = ?1 AND s.stage_id = ?2 AND g.check_type = ?3
             ORDER BY g.checked_at DESC, g.id DESC LIMIT 1",
            params![run_id, stage_id, check_type],
            row_to_gate_check_record,
        )
        .optional()
        .context("latest_gate_check")
    }

    pub fn list_pr_review_requirements(&self, pr_number: i64) -> Result<Vec<PrReviewRequirement>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, pr_number, role, required_count, owning_run_id
             FROM pr_review_requirements WHERE pr_number = ?1",
        )?;
        let rows = stmt
            .query_map(params![pr_number], |row| {
                Ok(PrReviewRequirement {
                    id: row.get(0)?,
                    pr_number: row.get(1)?,
                    role: row.get(2)?,
                    required_count: row.get(3)?,
                    owning_run_id: row.get(4)?,
                })
            })
            .context("list_pr_review_requirements")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fresh (non-stale) changes-requested reviews outstanding on the PR,
    /// across every role — a single unresolved rejection blocks merge
    /// regardless of which role filed it.
    pub fn count_fresh_changes_requested(&self, pr_number: i64) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pr_approvals WHERE pr_number = ?1 AND approved = 0 AND stale = 0",
            params![pr_number],
            |row| row.get(0),
        )
        .context("count_fresh_changes_requested")?;
        Ok(n as u32)
    }

    /// Whether `pr_number`'s recorded review requirements are all met for
    /// the given `scope` (`agents`, `humans`, or `all`), and which roles are
    /// still short if not.
    pub fn check_pr_merge_ready(&self, pr_number: i64, scope: &str) -> Result<(bool, Vec<String>)> {
        let requirements = self.list_pr_review_requirements(pr_number)?;
        let mut missing = Vec::new();
        for req in requirements {
            let is_human = req.role.starts_with("human:");
            let in_scope = match scope {
                "agents" => !is_human,
                "humans" => is_human,
                _ => true,
            };
            if !in_scope {
                continue;
            }
            let fresh = self.count_fresh_approvals(pr_number, &req.role)?;
            if fresh < req.required_count {
                missing.push(req.role);
            }
        }
        Ok((missing.is_empty(), missing))
    }
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map(params![], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .any(|name| name == column);
    if !exists {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"), params![])
            .with_context(|| format!("adding column {table}.{column}"))?;
    }
    Ok(())
}

fn scope_str(scope: PipelineScope) -> &'static str {
    match scope {
        PipelineScope::SinglePr => "single_pr",
        PipelineScope::MultiPr => "multi_pr",
        PipelineScope::Issue => "issue",
    }
}

fn parse_scope(s: &str) -> PipelineScope {
    match s {
        "multi_pr" => PipelineScope::MultiPr,
        "issue" => PipelineScope::Issue,
        _ => PipelineScope::SinglePr,
    }
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_dt_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_dt(&s))
}

fn row_to_pipeline_run(row: &rusqlite::Row) -> rusqlite::Result<PipelineRun> {
    let definition_snapshot: String = row.get(2)?;
    let context: String = row.get(9)?;
    Ok(PipelineRun {
        run_id: row.get(0)?,
        pipeline_name: row.get(1)?,
        definition_snapshot: serde_json::from_str(&definition_snapshot).unwrap_or_else(|_| {
            panic!("corrupt definition_snapshot for run {}", row.get::<_, String>(0).unwrap())
        }),
        trigger_event_delivery_id: row.get(3)?,
        issue_number: row.get(4)?,
        primary_pr_number: row.get(5)?,
        scope: parse_scope(&row.get::<_, String>(6)?),
        status: RunStatus::parse(&row.get::<_, String>(7)?).unwrap_or(RunStatus::Failed),
        current_stage_id: row.get(8)?,
        context: serde_json::from_str(&context).unwrap_or_default(),
        parent_run_id: row.get(10)?,
        parent_stage_id: row.get(11)?,
        nesting_depth: row.get(12)?,
        created_at: parse_dt(&row.get::<_, String>(13)?),
        updated_at: parse_dt(&row.get::<_, String>(14)?),
        error_message: row.get(15)?,
        error_stage_id: row.get(16)?,
    })
}

fn row_to_stage_run(row: &rusqlite::Row) -> rusqlite::Result<StageRun> {
    let outputs: String = row.get(9)?;
    Ok(StageRun {
        id: row.get(0)?,
        run_id: row.get(1)?,
        stage_id: row.get(2)?,
        attempt_number: row.get(3)?,
        status: StageRunStatus::parse(&row.get::<_, String>(4)?).unwrap_or(StageRunStatus::Failed),
        agent_id: row.get(5)?,
        branch_id: row.get(6)?,
        parent_stage_id: row.get(7)?,
        child_pipeline_run_id: row.get(8)?,
        outputs: serde_json::from_str(&outputs).unwrap_or_default(),
        error_message: row.get(10)?,
        started_at: parse_dt(&row.get::<_, String>(11)?),
        completed_at: parse_dt_opt(row.get(12)?),
    })
}

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        agent_id: row.get(0)?,
        role: row.get(1)?,
        issue_number: row.get(2)?,
        session_id: row.get(3)?,
        status: AgentStatus::parse(&row.get::<_, String>(4)?).unwrap_or(AgentStatus::Failed),
        branch: row.get(5)?,
        worktree_path: row.get(6)?,
        pr_number: row.get(7)?,
        pipeline_run_id: row.get(8)?,
        pipeline_stage_id: row.get(9)?,
        active_since: parse_dt_opt(row.get(10)?),
        sleeping_since: parse_dt_opt(row.get(11)?),
        iteration_count: row.get(12)?,
        tool_call_count: row.get(13)?,
        turn_count: row.get(14)?,
        lifecycle: if row.get::<_, String>(15)? == "persistent" {
            AgentLifecycleTag::Persistent
        } else {
            AgentLifecycleTag::Ephemeral
        },
        last_heartbeat: parse_dt_opt(row.get(16)?),
        watchdog_escaped: row.get(17)?,
        created_at: parse_dt(&row.get::<_, String>(18)?),
    })
}

fn row_to_activity_event(row: &rusqlite::Row) -> rusqlite::Result<ActivityEvent> {
    let event_type: String = row.get(3)?;
    let metadata: Option<String> = row.get(5)?;
    Ok(ActivityEvent {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        pipeline_run_id: row.get(2)?,
        event_type: serde_json::from_str(&format!("\"{event_type}\"")).unwrap_or(ActivityEventType::Error),
        timestamp: parse_dt(&row.get::<_, String>(4)?),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

fn row_to_gate_check_record(row: &rusqlite::Row) -> rusqlite::Result<GateCheckRecord> {
    let check_config_snapshot: String = row.get(3)?;
    let result_data: Option<String> = row.get(6)?;
    Ok(GateCheckRecord {
        id: row.get(0)?,
        stage_run_id: row.get(1)?,
        check_type: row.get(2)?,
        check_config_snapshot: serde_json::from_str(&check_config_snapshot).unwrap_or(Value::Null),
        passed: row.get(4)?,
        message: row.get(5)?,
        result_data: result_data.and_then(|d| serde_json::from_str(&d).ok()),
        checked_at: parse_dt(&row.get::<_, String>(7)?),
    })
}

fn row_to_mail_message(row: &rusqlite::Row) -> rusqlite::Result<MailMessage> {
    Ok(MailMessage {
        message_id: row.get(0)?,
        agent_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_dt(&row.get::<_, String>(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "review".to_string(),
            description: String::new(),
            scope: PipelineScope::SinglePr,
            trigger: None,
            on_events: HashMap::new(),
            stages: vec![],
            on_complete: Default::default(),
            on_error: Default::default(),
        }
    }

    fn sample_run(run_id: &str) -> PipelineRun {
        PipelineRun {
            run_id: run_id.to_string(),
            pipeline_name: "review".to_string(),
            definition_snapshot: sample_definition(),
            trigger_event_delivery_id: "delivery-1".to_string(),
            issue_number: None,
            primary_pr_number: Some(42),
            scope: PipelineScope::SinglePr,
            status: RunStatus::Pending,
            current_stage_id: None,
            context: HashMap::new(),
            parent_run_id: None,
            parent_stage_id: None,
            nesting_depth: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            error_message: None,
            error_stage_id: None,
        }
    }

    #[test]
    fn create_and_get_pipeline_run_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let run = sample_run("run-1");
        db.create_pipeline_run(&run).unwrap();
        let fetched = db.get_pipeline_run("run-1").unwrap().unwrap();
        assert_eq!(fetched.pipeline_name, "review");
        assert_eq!(fetched.primary_pr_number, Some(42));
    }

    #[test]
    fn duplicate_active_run_for_same_pr_is_rejected() {
        let db = Db::open_in_memory().unwrap();
        db.create_pipeline_run(&sample_run("run-1")).unwrap();
        let mut second = sample_run("run-2");
        second.status = RunStatus::Running;
        let err = db.create_pipeline_run(&second);
        assert!(err.is_err());
    }

    #[test]
    fn abandon_running_agents_marks_them_failed() {
        let db = Db::open_in_memory().unwrap();
        let agent = AgentRecord {
            agent_id: "agent-1".to_string(),
            role: "dev".to_string(),
            issue_number: 7,
            session_id: "sess-1".to_string(),
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
        let n = db.abandon_running_agents().unwrap();
        assert_eq!(n, 1);
        let fetched = db.get_agent("agent-1").unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Failed);
    }

    #[test]
    fn pr_sequence_cursor_advances_monotonically() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.get_pr_sequence_cursor(1).unwrap(), 0);
        assert_eq!(db.advance_pr_sequence_cursor(1).unwrap(), 1);
        assert_eq!(db.advance_pr_sequence_cursor(1).unwrap(), 2);
    }

    #[test]
    fn mail_drains_in_fifo_order() {
        let db = Db::open_in_memory().unwrap();
        for i in 0..3 {
            db.append_mail(&MailMessage {
                message_id: format!("m{i}"),
                agent_id: "agent-1".to_string(),
                role: "user".to_string(),
                content: format!("msg {i}"),
                created_at: Utc::now(),
            })
            .unwrap();
        }
        let drained = db.drain_mail("agent-1").unwrap();
        assert_eq!(drained.len(), 3);
        assert!(db.drain_mail("agent-1").unwrap().is_empty());
    }

    #[test]
    fn delivery_dedup_rejects_second_mark() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.mark_delivery_processed("d1").unwrap());
        assert!(!db.mark_delivery_processed("d1").unwrap());
    }

    #[test]
    fn children_of_returns_only_direct_descendants() {
        let db = Db::open_in_memory().unwrap();
        db.create_pipeline_run(&sample_run("parent")).unwrap();
        let mut child = sample_run("child");
        child.parent_run_id = Some("parent".to_string());
        db.create_pipeline_run(&child).unwrap();
        let mut grandchild = sample_run("grandchild");
        grandchild.parent_run_id = Some("child".to_string());
        grandchild.primary_pr_number = Some(43);
        db.create_pipeline_run(&grandchild).unwrap();

        let children = db.children_of("parent").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].run_id, "child");
    }

    #[test]
    fn running_pipelines_for_pr_includes_secondary_associations() {
        let db = Db::open_in_memory().unwrap();
        let mut run = sample_run("run-1");
        run.status = RunStatus::Running;
        run.primary_pr_number = Some(1);
        db.create_pipeline_run(&run).unwrap();
        db.associate_pr("run-1", "acme/widgets", 2, Some("open-followup"), Some("dev")).unwrap();

        assert_eq!(db.running_pipelines_for_pr(1).unwrap().len(), 1);
        assert_eq!(db.running_pipelines_for_pr(2).unwrap().len(), 1);
        assert!(db.running_pipelines_for_pr(3).unwrap().is_empty());
    }

    #[test]
    fn latest_gate_check_reuses_most_recent_result() {
        let db = Db::open_in_memory().unwrap();
        db.create_pipeline_run(&sample_run("run-1")).unwrap();
        let stage_run_id = db
            .create_stage_run(&StageRun {
                id: 0,
                run_id: "run-1".to_string(),
                stage_id: "wait-for-ci".to_string(),
                attempt_number: 1,
                status: StageRunStatus::Waiting,
                agent_id: None,
                branch_id: None,
                parent_stage_id: None,
                child_pipeline_run_id: None,
                outputs: HashMap::new(),
                error_message: None,
                started_at: Utc::now(),
                completed_at: None,
            })
            .unwrap();
        db.record_gate_check(&GateCheckRecord {
            id: 0,
            stage_run_id,
            check_type: "ci_status".to_string(),
            check_config_snapshot: Value::Null,
            passed: false,
            message: "pending".to_string(),
            result_data: None,
            checked_at: Utc::now(),
        })
        .unwrap();

        let found = db.latest_gate_check("run-1", "wait-for-ci", "ci_status").unwrap().unwrap();
        assert!(!found.passed);
        assert!(db.latest_gate_check("run-1", "wait-for-ci", "no_such_check").unwrap().is_none());
    }

    #[test]
    fn check_pr_merge_ready_reports_missing_roles() {
        let db = Db::open_in_memory().unwrap();
        db.add_pr_review_requirement(&PrReviewRequirement {
            id: 0,
            pr_number: 9,
            role: "reviewer".to_string(),
            required_count: 1,
            owning_run_id: "run-1".to_string(),
        })
        .unwrap();
        db.add_pr_review_requirement(&PrReviewRequirement {
            id: 0,
            pr_number: 9,
            role: "human:alice".to_string(),
            required_count: 1,
            owning_run_id: "run-1".to_string(),
        })
        .unwrap();

        let (ready, missing) = db.check_pr_merge_ready(9, "all").unwrap();
        assert!(!ready);
        assert_eq!(missing.len(), 2);

        db.record_pr_approval(&PrApproval {
            id: 0,
            pr_number: 9,
            role: "reviewer".to_string(),
            approved: true,
            reviewer: "bot".to_string(),
            review_id: None,
            stale: false,
            created_at: Utc::now(),
        })
        .unwrap();

        let (agents_ready, _) = db.check_pr_merge_ready(9, "agents").unwrap();
        assert!(agents_ready);
        let (all_ready, missing) = db.check_pr_merge_ready(9, "all").unwrap();
        assert!(!all_ready);
        assert_eq!(missing, vec!["human:alice".to_string()]);
    }
}
