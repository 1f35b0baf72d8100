//! The Pipeline Engine: drives a `PipelineRun` through its stages one at a
//! time. Every stage type funnels through the single `execute_stage` entry
//! point below — there is no per-kind trait hierarchy, just a match over
//! the tagged `StageKind` enum, which keeps the transition/outputs/error
//! bookkeeping in one place instead of scattered across implementations.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::bridge::{SessionWorker, WorkerRequest};
use crate::db::Db;
use crate::definitions::DefinitionSet;
use crate::forge::ForgeClient;
use crate::gates::{gate_passed, GateCheckContext, GateRegistry};
use crate::lifecycle::LifecycleManager;
use crate::template::{render, TemplateContext};
use crate::types::*;

/// Outcome of executing one stage: either it advances the run (possibly to
/// a terminal), or it parks waiting for an external event (human review,
/// a poll interval, a reactive wake-up).
pub enum StageOutcome {
    Advance { target: String, outputs: HashMap<String, Value> },
    Waiting,
    Terminal(RunStatus),
}

pub struct PipelineEngine {
    pub db: Arc<Db>,
    pub definitions: Arc<DefinitionSet>,
    pub lifecycle: Arc<LifecycleManager>,
    pub gates: Arc<GateRegistry>,
    pub forge: Arc<dyn ForgeClient>,
    pub workers: RwLock<HashMap<String, Arc<dyn SessionWorker>>>,
    pub repo_path: String,
    pub repo_name: String,
}

impl PipelineEngine {
    pub fn new(
        db: Arc<Db>,
        definitions: Arc<DefinitionSet>,
        lifecycle: Arc<LifecycleManager>,
        gates: Arc<GateRegistry>,
        forge: Arc<dyn ForgeClient>,
        repo_path: String,
        repo_name: String,
    ) -> Self {
        Self {
            db,
            definitions,
            lifecycle,
            gates,
            forge,
            workers: RwLock::new(HashMap::new()),
            repo_path,
            repo_name,
        }
    }

    pub async fn register_worker(&self, role: &str, worker: Arc<dyn SessionWorker>) {
        self.workers.write().await.insert(role.to_string(), worker);
    }

    /// Begins a new run from `definition` in response to `event`. Enforces
    /// the single-active-run-per-PR invariant through the registry's
    /// unique index; a conflicting start surfaces as an error the caller
    /// should treat as "already running, ignore".
    pub async fn start_pipeline(
        &self,
        definition: &PipelineDefinition,
        event: &NormalizedEvent,
        parent: Option<(&str, &str, u32)>,
    ) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut context = HashMap::new();
        context.insert("trigger".to_string(), event.payload.clone());

        let first_stage_id = definition.first_stage().map(|s| s.id.clone());
        if let Some(stage_id) = &first_stage_id {
            context.insert(format!("stages.{stage_id}.entered_at"), Value::String(Utc::now().to_rfc3339()));
        }

        let run = PipelineRun {
            run_id: run_id.clone(),
            pipeline_name: definition.name.clone(),
            definition_snapshot: definition.clone(),
            trigger_event_delivery_id: event.delivery_id.clone(),
            issue_number: event.issue_number(),
            primary_pr_number: event.pr_number(),
            scope: definition.scope,
            status: RunStatus::Running,
            current_stage_id: first_stage_id,
            context,
            parent_run_id: parent.map(|(id, _, _)| id.to_string()),
            parent_stage_id: parent.map(|(_, stage, _)| stage.to_string()),
            nesting_depth: parent.map(|(_, _, depth)| depth + 1).unwrap_or(0),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            error_message: None,
            error_stage_id: None,
        };
        self.db.create_pipeline_run(&run).context("start_pipeline")?;
        if let Some(pr) = run.primary_pr_number {
            self.db.associate_pr(&run_id, &self.repo_name, pr, None, Some("primary"))?;
        }
        Ok(run_id)
    }

    /// Advances `run_id` by one stage. Callers (the tick loop, or a
    /// reactive event handler) are expected to call this repeatedly until
    /// it reports `Waiting` or a terminal outcome.
    pub async fn tick(&self, run_id: &str) -> Result<StageOutcome> {
        self.tick_for_event(run_id, None).await
    }

    /// Same as `tick`, but carries the triggering event (if any) down into
    /// stage execution so gate checks and human stages can tell a reactive
    /// re-evaluation apart from a cold poll and skip checks the event
    /// can't possibly have changed.
    pub async fn tick_for_event(&self, run_id: &str, event: Option<&NormalizedEvent>) -> Result<StageOutcome> {
        let mut run = self
            .db
            .get_pipeline_run(run_id)?
            .ok_or_else(|| crate::errors::SquadronError::NotFound {
                kind: "pipeline_run",
                id: run_id.to_string(),
            })?;

        if run.status.is_terminal() {
            return Ok(StageOutcome::Terminal(run.status));
        }

        let Some(stage_id) = run.current_stage_id.clone() else {
            self.finish_run(&mut run, RunStatus::Completed, None, None).await?;
            return Ok(StageOutcome::Terminal(RunStatus::Completed));
        };

        let stage = run
            .definition_snapshot
            .get_stage(&stage_id)
            .ok_or_else(|| anyhow::anyhow!("run {run_id}: current stage {stage_id:?} not in definition"))?
            .clone();

        let stage_run_id = self.db.create_stage_run(&StageRun {
            id: 0,
            run_id: run_id.to_string(),
            stage_id: stage_id.clone(),
            attempt_number: 1,
            status: StageRunStatus::Running,
            agent_id: None,
            branch_id: None,
            parent_stage_id: None,
            child_pipeline_run_id: None,
            outputs: HashMap::new(),
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        })?;

        let outcome = self.execute_stage(&run, &stage, stage_run_id, event).await;

        match outcome {
            Ok(StageOutcome::Advance { target, outputs }) => {
                let error_text = outputs.get("error").and_then(Value::as_str);
                self.db.update_stage_run_status(stage_run_id, StageRunStatus::Completed, Some(&outputs), error_text)?;
                self.record_stage_outputs(&mut run, &stage_id, outputs)?;
                self.apply_transition(&mut run, &target).await?;
                Ok(StageOutcome::Advance { target: run.current_stage_id.clone().unwrap_or_default(), outputs: HashMap::new() })
            }
            Ok(StageOutcome::Waiting) => {
                self.db.update_stage_run_status(stage_run_id, StageRunStatus::Waiting, None, None)?;
                Ok(StageOutcome::Waiting)
            }
            Ok(StageOutcome::Terminal(status)) => {
                self.db.update_stage_run_status(stage_run_id, StageRunStatus::Completed, None, None)?;
                self.finish_run(&mut run, status, None, None).await?;
                Ok(StageOutcome::Terminal(status))
            }
            Err(e) => {
                self.db.update_stage_run_status(stage_run_id, StageRunStatus::Failed, None, Some(&e.to_string()))?;
                self.finish_run(&mut run, RunStatus::Failed, Some(e.to_string()), Some(stage_id)).await?;
                Err(e)
            }
        }
    }

    /// Most recent error recorded against a stage run this agent occupied,
    /// so a resumed session can be told what went wrong last time rather
    /// than starting blind.
    fn last_error_for_agent(&self, run_id: &str, agent_id: &str) -> Result<Option<String>> {
        let runs = self.db.list_stage_runs_for_run(run_id)?;
        Ok(runs
            .into_iter()
            .rev()
            .find(|r| r.agent_id.as_deref() == Some(agent_id) && r.error_message.is_some())
            .and_then(|r| r.error_message))
    }

    /// Persists a stage's outputs into the run's context. A stage whose
    /// outputs carry `pr_number` (optionally with `pr_role`) registers a
    /// secondary PR association for this run under that stage id — how a
    /// multi-pr-scoped run picks up PRs beyond its primary one.
    fn record_stage_outputs(&self, run: &mut PipelineRun, stage_id: &str, outputs: HashMap<String, Value>) -> Result<()> {
        if let Some(pr) = outputs.get("pr_number").and_then(Value::as_i64) {
            let role = outputs.get("pr_role").and_then(Value::as_str);
            self.db.associate_pr(&run.run_id, &self.repo_name, pr, Some(stage_id), role)?;
        }
        let key = format!("stages.{stage_id}.outputs");
        run.context.insert(key, Value::Object(outputs.into_iter().collect()));
        Ok(())
    }

    async fn apply_transition(&self, run: &mut PipelineRun, target: &str) -> Result<()> {
        match target {
            "complete" => self.finish_run(run, RunStatus::Completed, None, None).await,
            "fail" => self.finish_run(run, RunStatus::Failed, None, None).await,
            "cancel" => self.finish_run(run, RunStatus::Cancelled, None, None).await,
            "escalate" => self.finish_run(run, RunStatus::Escalated, None, None).await,
            stage_id => {
                run.current_stage_id = Some(stage_id.to_string());
                run.updated_at = Utc::now();
                run.context.insert(format!("stages.{stage_id}.entered_at"), Value::String(Utc::now().to_rfc3339()));
                self.db.set_current_stage(&run.run_id, Some(stage_id), &run.context)?;
                Ok(())
            }
        }
    }

    async fn finish_run(&self, run: &mut PipelineRun, status: RunStatus, error_message: Option<String>, error_stage_id: Option<String>) -> Result<()> {
        run.status = status;
        run.current_stage_id = None;
        run.updated_at = Utc::now();
        self.db.update_run_status(&run.run_id, status, error_message.as_deref(), error_stage_id.as_deref())?;
        self.db.set_current_stage(&run.run_id, None, &run.context)?;

        let hooks = if status == RunStatus::Completed {
            &run.definition_snapshot.on_complete
        } else {
            &run.definition_snapshot.on_error
        };
        if let (Some(body), Some(pr)) = (&hooks.notify, run.primary_pr_number) {
            let _ = self.forge.comment(&self.repo_name, pr, body).await;
        }
        if let (Some(label), Some(pr)) = (&hooks.add_label, run.primary_pr_number) {
            let _ = self.forge.add_label(&self.repo_name, pr, label).await;
        }
        Ok(())
    }

    /// Applies a reactive directive dispatched by the event router against
    /// an already-running run — e.g. a review submission re-evaluating a
    /// gate stage, or a push invalidating stale approvals and looping the
    /// run back to an earlier stage.
    pub async fn apply_reactive(&self, run_id: &str, directive: &ReactiveDirective, event: &NormalizedEvent) -> Result<()> {
        match directive {
            ReactiveDirective::Cancel => self.cancel_run(run_id).await,
            ReactiveDirective::ReevaluateGates | ReactiveDirective::WakeAgent => {
                self.tick_for_event(run_id, Some(event)).await.map(|_| ())
            }
            ReactiveDirective::InvalidateAndRestart { invalidate, restart_from } => {
                let mut run = self
                    .db
                    .get_pipeline_run(run_id)?
                    .ok_or_else(|| crate::errors::SquadronError::NotFound {
                        kind: "pipeline_run",
                        id: run_id.to_string(),
                    })?;
                if let Some(pr) = run.primary_pr_number {
                    for role in invalidate {
                        self.db.invalidate_approvals(pr, role)?;
                    }
                }
                run.current_stage_id = Some(restart_from.clone());
                run.status = RunStatus::Running;
                run.updated_at = Utc::now();
                self.db.update_run_status(run_id, RunStatus::Running, None, None)?;
                self.db.set_current_stage(run_id, Some(restart_from), &run.context)?;
                Ok(())
            }
            ReactiveDirective::Notify { message } => {
                let run = self
                    .db
                    .get_pipeline_run(run_id)?
                    .ok_or_else(|| crate::errors::SquadronError::NotFound {
                        kind: "pipeline_run",
                        id: run_id.to_string(),
                    })?;
                if let (Some(pr), Some(body)) = (run.primary_pr_number, message) {
                    self.forge.comment(&self.repo_name, pr, body).await?;
                }
                Ok(())
            }
        }
    }

    /// Cancels a run and every stage run still in a non-terminal state,
    /// cascading into nested sub-pipeline runs.
    pub async fn cancel_run(&self, run_id: &str) -> Result<()> {
        let mut run = self
            .db
            .get_pipeline_run(run_id)?
            .ok_or_else(|| crate::errors::SquadronError::NotFound {
                kind: "pipeline_run",
                id: run_id.to_string(),
            })?;
        if run.status.is_terminal() {
            return Ok(());
        }
        for stage_run in self.db.list_stage_runs_for_run(run_id)? {
            if !stage_run.status.is_terminal() {
                self.db.update_stage_run_status(stage_run.id, StageRunStatus::Cancelled, None, None)?;
                if let Some(child) = stage_run.child_pipeline_run_id {
                    Box::pin(self.cancel_run(&child)).await?;
                }
            }
        }
        self.finish_run(&mut run, RunStatus::Cancelled, None, None).await
    }

    async fn execute_stage(&self, run: &PipelineRun, stage: &Stage, stage_run_id: i64, event: Option<&NormalizedEvent>) -> Result<StageOutcome> {
        match &stage.kind {
            StageKind::Agent(cfg) => self.execute_agent_stage(run, stage, cfg, stage_run_id).await,
            StageKind::Gate(cfg) => self.execute_gate_stage(run, stage, cfg, stage_run_id, event).await,
            StageKind::Human(cfg) => self.execute_human_stage(run, stage, cfg, event).await,
            StageKind::Parallel(cfg) => self.execute_parallel_stage(run, cfg, stage_run_id, event).await,
            StageKind::Delay(cfg) => self.execute_delay_stage(run, cfg).await,
            StageKind::Action(cfg) => self.execute_action_stage(run, cfg).await,
            StageKind::Webhook(cfg) => self.execute_webhook_stage(cfg).await,
            StageKind::Pipeline(cfg) => self.execute_pipeline_stage(run, cfg, stage, stage_run_id, event).await,
        }
    }

    async fn execute_agent_stage(&self, run: &PipelineRun, stage: &Stage, cfg: &AgentStageConfig, stage_run_id: i64) -> Result<StageOutcome> {
        let issue_number = run.issue_number.or(run.primary_pr_number).unwrap_or(0);
        let (agent, _permit) = self
            .lifecycle
            .spawn_agent(&self.repo_path, &cfg.role, issue_number, "main", AgentLifecycleTag::Persistent)
            .await?;

        self.lifecycle.wake_agent(&agent.agent_id).ok();
        self.db.set_stage_run_agent(stage_run_id, &agent.agent_id)?;

        let worker = {
            let workers = self.workers.read().await;
            workers
                .get(&cfg.role)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no worker registered for role {:?}", cfg.role))?
        };

        // A retried stage gets a fresh agent_id (and worktree) every attempt,
        // so an empty session id on the agent we just spawned doesn't mean
        // there's nothing to resume — check the role+issue's last agent too.
        let mut resume_session_id = Some(agent.session_id.clone()).filter(|s| !s.is_empty());
        let mut resume_source_agent_id = agent.agent_id.clone();
        if cfg.continue_session && resume_session_id.is_none() {
            if let Some(prior) = self.db.find_last_agent_for_role_issue(&cfg.role, issue_number, &agent.agent_id)? {
                if !prior.session_id.is_empty() {
                    resume_session_id = Some(prior.session_id.clone());
                    resume_source_agent_id = prior.agent_id.clone();
                }
            }
        }
        let resuming = cfg.continue_session && resume_session_id.is_some();
        if !resuming {
            resume_session_id = None;
        }

        let mut instruction = format!("{}: {}", cfg.role, cfg.action);
        if resuming {
            if let Some(prior_error) = self.last_error_for_agent(&run.run_id, &resume_source_agent_id)? {
                instruction = format!("Your previous attempt failed with: {prior_error}\n\n{instruction}");
            }
        }

        let request = WorkerRequest {
            agent_id: agent.agent_id.clone(),
            role: cfg.role.clone(),
            action: cfg.action.clone(),
            instruction,
            worktree_path: agent.worktree_path.clone().unwrap_or_else(|| self.repo_path.clone()),
            resume_session_id,
            timeout_secs: 3600,
        };

        let outcome = worker.run_turn(request).await;
        let tool_calls = outcome
            .as_ref()
            .map(|o| o.events.iter().filter(|e| matches!(e, crate::bridge::WorkerEvent::ToolCallFinished { .. })).count() as u32)
            .unwrap_or(0);
        let reported_session_id = outcome.as_ref().ok().and_then(|o| o.session_id.clone());
        self.lifecycle.record_turn(&agent.agent_id, tool_calls, reported_session_id.as_deref())?;

        let _ = stage_run_id;
        let _ = stage;
        match outcome {
            Ok(outcome) => {
                if let Some(reason) = outcome.events.iter().find_map(|e| match e {
                    crate::bridge::WorkerEvent::AgentEscalated { reason } => Some(reason.clone()),
                    _ => None,
                }) {
                    self.lifecycle.finish_agent(&agent.agent_id, AgentStatus::Escalated)?;
                    return match &cfg.on_error {
                        Some(target) => Ok(StageOutcome::Advance {
                            target: target.primary_target().to_string(),
                            outputs: HashMap::new(),
                        }),
                        None => anyhow::bail!("agent {} escalated: {reason}", cfg.role),
                    };
                }

                if outcome.events.iter().any(|e| matches!(e, crate::bridge::WorkerEvent::AgentBlocked { .. })) {
                    // Not a failure: the session is durably suspended and will
                    // resume by its stable session id on the next wake-up.
                    self.lifecycle.sleep_agent(&agent.agent_id)?;
                    return Ok(StageOutcome::Waiting);
                }

                if outcome.success {
                    self.lifecycle.finish_agent(&agent.agent_id, AgentStatus::Completed)?;
                    for expected in &cfg.expected_outputs {
                        if let Some(path) = &agent.worktree_path {
                            if !crate::ipc::check_artifact(path, expected) {
                                anyhow::bail!("expected output {expected:?} missing from agent worktree");
                            }
                        }
                    }
                    let outputs: HashMap<String, Value> = outcome
                        .outputs
                        .as_object()
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .collect();
                    let target = cfg
                        .on_complete
                        .as_ref()
                        .map(|t| t.primary_target().to_string())
                        .unwrap_or_else(|| "complete".to_string());
                    Ok(StageOutcome::Advance { target, outputs })
                } else {
                    self.lifecycle.finish_agent(&agent.agent_id, AgentStatus::Failed)?;
                    let target = cfg
                        .on_error
                        .as_ref()
                        .map(|t| t.primary_target().to_string())
                        .unwrap_or_else(|| "fail".to_string());
                    let error = outcome
                        .outputs
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{} agent turn did not succeed", cfg.role));
                    Ok(StageOutcome::Advance {
                        target,
                        outputs: HashMap::from([("error".to_string(), Value::String(error))]),
                    })
                }
            }
            Err(e) => {
                self.lifecycle.finish_agent(&agent.agent_id, AgentStatus::Failed)?;
                match &cfg.on_error {
                    Some(target) => Ok(StageOutcome::Advance {
                        target: target.primary_target().to_string(),
                        outputs: HashMap::from([("error".to_string(), Value::String(e.to_string()))]),
                    }),
                    None => Err(e),
                }
            }
        }
    }

    /// Parks on a human-completion condition (review approval, a matching
    /// comment, a label, or a closed-without-merge dismissal), handling
    /// auto-assignment, reminders, and timeout escalation along the way.
    /// Entry time is tracked via the `stages.{id}.entered_at` context
    /// marker set by `start_pipeline`/`apply_transition`, so a reminder or
    /// timeout fires relative to when the run actually landed on this
    /// stage, not to how many times it's been reactively re-ticked since.
    async fn execute_human_stage(
        &self,
        run: &PipelineRun,
        stage: &Stage,
        cfg: &HumanStageConfig,
        event: Option<&NormalizedEvent>,
    ) -> Result<StageOutcome> {
        let entered_key = format!("stages.{}.entered_at", stage.id);
        let entered_at = run
            .context
            .get(&entered_key)
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let assigned_key = format!("stages.{}.assigned", stage.id);
        if cfg.auto_assign && !run.context.contains_key(&assigned_key) {
            if let Some(pr) = run.primary_pr_number {
                let _ = self.forge.comment(&self.repo_name, pr, &format!("@{} please review.", cfg.from)).await;
            }
            let mut context = run.context.clone();
            context.insert(assigned_key, Value::Bool(true));
            self.db.set_current_stage(&run.run_id, Some(&stage.id), &context)?;
        }

        let completed = match cfg.wait_for {
            HumanCompletionType::Approval => match run.primary_pr_number {
                Some(pr) => self.db.count_fresh_approvals(pr, &cfg.from)? >= cfg.count,
                None => false,
            },
            HumanCompletionType::Comment => match (run.primary_pr_number, &cfg.pattern) {
                (Some(pr), Some(pattern)) => {
                    let comments = self.forge.list_comments(&self.repo_name, pr).await?;
                    comments.iter().filter(|c| c.body.contains(pattern.as_str())).count() as u32 >= cfg.count
                }
                _ => false,
            },
            HumanCompletionType::Label => match (run.primary_pr_number, &cfg.pattern) {
                (Some(pr), Some(label)) => {
                    let pr_status = self.forge.get_pr(&self.repo_name, pr).await?;
                    pr_status.labels.iter().any(|l| l == label)
                }
                _ => false,
            },
            HumanCompletionType::Dismiss => {
                if let Some(e) = event.filter(|e| e.event_type == "pull_request.closed") {
                    e.payload.get("merged").and_then(Value::as_bool) != Some(true)
                } else if let Some(pr) = run.primary_pr_number {
                    self.forge.get_pr(&self.repo_name, pr).await?.state == "closed"
                } else {
                    false
                }
            }
        };

        if completed {
            return Ok(StageOutcome::Advance { target: cfg.on_complete.primary_target().to_string(), outputs: HashMap::new() });
        }

        if let Some(timeout) = cfg.timeout_seconds {
            let elapsed = (Utc::now() - entered_at).num_seconds().max(0) as u64;
            if elapsed >= timeout {
                if let Some(target) = &cfg.on_timeout {
                    return Ok(StageOutcome::Advance { target: target.primary_target().to_string(), outputs: HashMap::new() });
                }
                return Ok(StageOutcome::Waiting);
            }
        }

        if let Some(reminder) = cfg.notify.reminder_seconds {
            let elapsed = (Utc::now() - entered_at).num_seconds().max(0) as u64;
            let reminded_key = format!("stages.{}.reminded", stage.id);
            if elapsed >= reminder && !run.context.contains_key(&reminded_key) {
                if let Some(pr) = run.primary_pr_number {
                    let _ = self
                        .forge
                        .comment(&self.repo_name, pr, &format!("Still waiting on {} from {}.", stage.id, cfg.from))
                        .await;
                }
                let mut context = run.context.clone();
                context.insert(reminded_key, Value::Bool(true));
                self.db.set_current_stage(&run.run_id, Some(&stage.id), &context)?;
            }
        }

        Ok(StageOutcome::Waiting)
    }

    /// Evaluates one condition, reusing the most recent recorded result
    /// when the check declares reactive events and the triggering event
    /// isn't among them — there's nothing new for it to have learned.
    async fn evaluate_one_gate_check(
        &self,
        run: &PipelineRun,
        stage_id: &str,
        condition: &GateCheckConfig,
        ctx: &GateCheckContext<'_>,
        stage_run_id: i64,
        event: Option<&NormalizedEvent>,
    ) -> Result<crate::gates::GateResult> {
        let check = self
            .gates
            .get(&condition.check)
            .ok_or_else(|| anyhow::anyhow!("unknown gate check: {}", condition.check))?;

        if let Some(event) = event {
            let reactive = check.reactive_events();
            if !reactive.is_empty() && !reactive.contains(&event.event_type.as_str()) {
                if let Some(cached) = self.db.latest_gate_check(&run.run_id, stage_id, &condition.check)? {
                    return Ok(crate::gates::GateResult {
                        passed: cached.passed,
                        message: cached.message,
                        data: cached.result_data,
                    });
                }
            }
        }

        let result = check.evaluate(condition, ctx).await?;
        self.db.record_gate_check(&GateCheckRecord {
            id: 0,
            stage_run_id,
            check_type: condition.check.clone(),
            check_config_snapshot: serde_json::to_value(condition)?,
            passed: result.passed,
            message: result.message.clone(),
            result_data: result.data.clone(),
            checked_at: Utc::now(),
        })?;
        Ok(result)
    }

    async fn execute_gate_stage(
        &self,
        run: &PipelineRun,
        stage: &Stage,
        cfg: &GateStageConfig,
        stage_run_id: i64,
        event: Option<&NormalizedEvent>,
    ) -> Result<StageOutcome> {
        let ctx = GateCheckContext {
            repo: &self.repo_name,
            repo_path: &self.repo_path,
            pr_number: run.primary_pr_number,
            db: &self.db,
            forge: self.forge.as_ref(),
        };

        let mut results = Vec::new();
        for condition in cfg.conditions.conditions.iter().chain(cfg.conditions.any_of.iter()) {
            let result = self.evaluate_one_gate_check(run, &stage.id, condition, &ctx, stage_run_id, event).await?;
            results.push((condition.clone(), result));
        }
        let passed = gate_passed(&results, &cfg.conditions);

        if passed {
            Ok(StageOutcome::Advance { target: cfg.on_pass.primary_target().to_string(), outputs: HashMap::new() })
        } else if let Some(target) = &cfg.on_fail {
            Ok(StageOutcome::Advance { target: target.primary_target().to_string(), outputs: HashMap::new() })
        } else {
            Ok(StageOutcome::Waiting)
        }
    }

    async fn execute_parallel_stage(&self, run: &PipelineRun, cfg: &ParallelStageConfig, stage_run_id: i64, event: Option<&NormalizedEvent>) -> Result<StageOutcome> {
        let mut completed = 0u32;
        let mut any_rejected = false;
        let mut outputs = HashMap::new();

        for branch in &cfg.branches {
            let branch_stage = Stage {
                id: branch.id.clone(),
                kind: (*branch.stage).clone(),
            };
            match Box::pin(self.execute_stage(run, &branch_stage, stage_run_id, event)).await {
                Ok(StageOutcome::Advance { outputs: branch_outputs, .. }) => {
                    completed += 1;
                    outputs.insert(branch.id.clone(), Value::Object(branch_outputs.into_iter().collect()));
                }
                Ok(StageOutcome::Waiting) => {}
                Ok(StageOutcome::Terminal(_)) | Err(_) => any_rejected = true,
            }
        }

        let join_met = match cfg.join {
            JoinPolicy::All => completed as usize == cfg.branches.len(),
            JoinPolicy::Any => completed >= cfg.join_count.unwrap_or(1),
        };

        if any_rejected {
            if let Some(target) = &cfg.on_any_reject {
                return Ok(StageOutcome::Advance { target: target.primary_target().to_string(), outputs });
            }
        }
        if join_met {
            Ok(StageOutcome::Advance { target: cfg.on_complete.primary_target().to_string(), outputs })
        } else {
            Ok(StageOutcome::Waiting)
        }
    }

    async fn execute_delay_stage(&self, run: &PipelineRun, cfg: &DelayStageConfig) -> Result<StageOutcome> {
        if let Some(poll) = &cfg.poll {
            let ctx = GateCheckContext {
                repo: &self.repo_name,
                repo_path: &self.repo_path,
                pr_number: run.primary_pr_number,
                db: &self.db,
                forge: self.forge.as_ref(),
            };
            let check = self
                .gates
                .get(&poll.check.check)
                .ok_or_else(|| anyhow::anyhow!("unknown gate check: {}", poll.check.check))?;
            let result = check.evaluate(&poll.check, &ctx).await?;
            if !result.passed {
                tokio::time::sleep(std::time::Duration::from_secs(poll.interval_seconds)).await;
                return Ok(StageOutcome::Waiting);
            }
        } else {
            tokio::time::sleep(std::time::Duration::from_secs(cfg.duration_seconds)).await;
        }
        Ok(StageOutcome::Advance { target: cfg.on_complete.primary_target().to_string(), outputs: HashMap::new() })
    }

    async fn execute_action_stage(&self, run: &PipelineRun, cfg: &ActionStageConfig) -> Result<StageOutcome> {
        let pr_number = run
            .primary_pr_number
            .ok_or_else(|| anyhow::anyhow!("action stage requires a pull request in scope"))?;

        let result: anyhow::Result<()> = match cfg.action {
            ActionKind::MergePr => self
                .forge
                .merge_pr(&self.repo_name, pr_number, cfg.method.unwrap_or(MergeMethod::Squash))
                .await,
            ActionKind::ClosePr => self.forge.close_pr(&self.repo_name, pr_number).await,
            ActionKind::AddLabel => {
                let label = cfg.label.as_deref().unwrap_or_default();
                self.forge.add_label(&self.repo_name, pr_number, label).await
            }
            ActionKind::RemoveLabel => {
                let label = cfg.label.as_deref().unwrap_or_default();
                self.forge.remove_label(&self.repo_name, pr_number, label).await
            }
            ActionKind::Comment => {
                let body = cfg.body.as_deref().unwrap_or_default();
                self.forge.comment(&self.repo_name, pr_number, body).await
            }
        };

        match result {
            Ok(()) => {
                if cfg.delete_branch {
                    if let Ok(pr) = self.forge.get_pr(&self.repo_name, pr_number).await {
                        let _ = self.forge.delete_branch(&self.repo_name, &pr.head_ref).await;
                    }
                }
                Ok(StageOutcome::Advance { target: cfg.on_complete.primary_target().to_string(), outputs: HashMap::new() })
            }
            Err(e) if cfg.on_conflict.is_some() => Ok(StageOutcome::Advance {
                target: cfg.on_conflict.as_ref().unwrap().primary_target().to_string(),
                outputs: HashMap::from([("error".to_string(), Value::String(e.to_string()))]),
            }),
            Err(e) => Err(e),
        }
    }

    async fn execute_webhook_stage(&self, cfg: &WebhookStageConfig) -> Result<StageOutcome> {
        let client = reqwest::Client::new();
        let mut builder = match cfg.method.to_uppercase().as_str() {
            "GET" => client.get(&cfg.url),
            "PUT" => client.put(&cfg.url),
            "PATCH" => client.patch(&cfg.url),
            "DELETE" => client.delete(&cfg.url),
            _ => client.post(&cfg.url),
        };
        for (key, value) in &cfg.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &cfg.body {
            builder = builder.json(body);
        }

        let result = builder.send().await;
        match result {
            Ok(resp) => {
                let status_ok = cfg.expect.status.map(|s| resp.status().as_u16() == s).unwrap_or(resp.status().is_success());
                if status_ok {
                    Ok(StageOutcome::Advance { target: cfg.on_complete.primary_target().to_string(), outputs: HashMap::new() })
                } else if let Some(target) = &cfg.on_error {
                    Ok(StageOutcome::Advance { target: target.primary_target().to_string(), outputs: HashMap::new() })
                } else {
                    anyhow::bail!("webhook returned unexpected status {}", resp.status())
                }
            }
            Err(e) if cfg.on_error.is_some() => Ok(StageOutcome::Advance {
                target: cfg.on_error.as_ref().unwrap().primary_target().to_string(),
                outputs: HashMap::from([("error".to_string(), Value::String(e.to_string()))]),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn execute_pipeline_stage(
        &self,
        run: &PipelineRun,
        cfg: &PipelineStageConfig,
        stage: &Stage,
        stage_run_id: i64,
        event: Option<&NormalizedEvent>,
    ) -> Result<StageOutcome> {
        let sub_def = self
            .definitions
            .get(&cfg.pipeline)
            .ok_or_else(|| anyhow::anyhow!("unknown sub-pipeline {:?}", cfg.pipeline))?;
        if run.nesting_depth + 1 > MAX_NESTING_DEPTH {
            anyhow::bail!("sub-pipeline nesting depth exceeded at stage {:?}", stage.id);
        }

        let template_ctx = TemplateContext {
            context: &run.context,
            trigger: run.context.get("trigger").unwrap_or(&Value::Null),
            stage_outputs: &HashMap::new(),
            branch_outputs: &HashMap::new(),
        };
        let mut context = HashMap::new();
        for (key, value) in &cfg.context {
            let rendered = match value {
                Value::String(s) => render(s, &template_ctx)?,
                other => other.clone(),
            };
            context.insert(key.clone(), rendered);
        }

        let synthetic_event = NormalizedEvent {
            event_type: "pipeline.sub_invoke".to_string(),
            delivery_id: uuid::Uuid::new_v4().to_string(),
            sender: "squadron".to_string(),
            repository: self.repo_name.clone(),
            payload: Value::Object(context.into_iter().collect()),
        };

        let child_run_id = self
            .start_pipeline(sub_def, &synthetic_event, Some((&run.run_id, &stage.id, run.nesting_depth)))
            .await?;

        loop {
            match Box::pin(self.tick_for_event(&child_run_id, event)).await? {
                StageOutcome::Waiting => return Ok(StageOutcome::Waiting),
                StageOutcome::Terminal(RunStatus::Completed) => {
                    let _ = stage_run_id;
                    return Ok(StageOutcome::Advance {
                        target: cfg.on_complete.primary_target().to_string(),
                        outputs: HashMap::new(),
                    });
                }
                StageOutcome::Terminal(_) => {
                    return match &cfg.on_error {
                        Some(target) => Ok(StageOutcome::Advance { target: target.primary_target().to_string(), outputs: HashMap::new() }),
                        None => anyhow::bail!("sub-pipeline {:?} failed", cfg.pipeline),
                    };
                }
                StageOutcome::Advance { .. } => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::FakeForgeClient;
    use crate::gates::GateRegistry;

    fn make_engine(db: Arc<Db>) -> PipelineEngine {
        let definitions = Arc::new(DefinitionSet::default());
        let lifecycle = Arc::new(LifecycleManager::new(db.clone(), "/tmp/repo".to_string(), AgentLimits::default(), 4));
        let gates = Arc::new(GateRegistry::with_builtins(()));
        let forge = Arc::new(FakeForgeClient::default());
        PipelineEngine::new(db, definitions, lifecycle, gates, forge, "/tmp/repo".to_string(), "acme/widgets".to_string())
    }

    fn simple_definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "delay_only".to_string(),
            description: String::new(),
            scope: PipelineScope::SinglePr,
            trigger: Some(Trigger {
                event: "pull_request.opened".to_string(),
                condition: TriggerCondition::default(),
            }),
            on_events: HashMap::new(),
            stages: vec![Stage {
                id: "wait".to_string(),
                kind: StageKind::Delay(DelayStageConfig {
                    duration_seconds: 0,
                    poll: None,
                    on_complete: TransitionTarget::Simple("complete".to_string()),
                }),
            }],
            on_complete: Default::default(),
            on_error: Default::default(),
        }
    }

    #[tokio::test]
    async fn delay_stage_completes_run() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let engine = make_engine(db.clone());
        let def = simple_definition();
        let event = NormalizedEvent {
            event_type: "pull_request.opened".to_string(),
            delivery_id: "d1".to_string(),
            sender: "someone".to_string(),
            repository: "acme/widgets".to_string(),
            payload: serde_json::json!({"pr_number": 1}),
        };
        let run_id = engine.start_pipeline(&def, &event, None).await.unwrap();
        let outcome = engine.tick(&run_id).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Terminal(RunStatus::Completed)));

        let run = db.get_pipeline_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn second_start_for_same_pr_is_rejected_by_registry() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let engine = make_engine(db);
        let def = simple_definition();
        let event = NormalizedEvent {
            event_type: "pull_request.opened".to_string(),
            delivery_id: "d1".to_string(),
            sender: "someone".to_string(),
            repository: "acme/widgets".to_string(),
            payload: serde_json::json!({"pr_number": 5}),
        };
        engine.start_pipeline(&def, &event, None).await.unwrap();
        let second_event = NormalizedEvent {
            delivery_id: "d2".to_string(),
            ..event
        };
        let result = engine.start_pipeline(&def, &second_event, None).await;
        assert!(result.is_err());
    }

    /// Scripted worker for exercising `continue_session` resume semantics:
    /// returns queued outcomes in order and records every request it sees.
    struct ScriptedWorker {
        outcomes: std::sync::Mutex<std::collections::VecDeque<Result<crate::bridge::WorkerOutcome>>>,
        requests: std::sync::Mutex<Vec<WorkerRequest>>,
    }

    #[async_trait::async_trait]
    impl SessionWorker for ScriptedWorker {
        async fn run_turn(&self, request: WorkerRequest) -> Result<crate::bridge::WorkerOutcome> {
            self.requests.lock().unwrap().push(request);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| anyhow::bail!("ScriptedWorker ran out of queued outcomes"))
        }

        async fn inject_message(&self, _agent_id: &str, _message: &str) -> Result<()> {
            Ok(())
        }

        async fn interrupt(&self, _agent_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn two_stage_agent_definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "retry_with_resume".to_string(),
            description: String::new(),
            scope: PipelineScope::SinglePr,
            trigger: Some(Trigger {
                event: "pull_request.opened".to_string(),
                condition: TriggerCondition::default(),
            }),
            on_events: HashMap::new(),
            stages: vec![
                Stage {
                    id: "attempt".to_string(),
                    kind: StageKind::Agent(AgentStageConfig {
                        role: "dev".to_string(),
                        action: "fix".to_string(),
                        continue_session: false,
                        expected_outputs: vec![],
                        on_complete: Some(TransitionTarget::Simple("complete".to_string())),
                        on_error: Some(TransitionTarget::Simple("retry".to_string())),
                    }),
                },
                Stage {
                    id: "retry".to_string(),
                    kind: StageKind::Agent(AgentStageConfig {
                        role: "dev".to_string(),
                        action: "retry-fix".to_string(),
                        continue_session: true,
                        expected_outputs: vec![],
                        on_complete: Some(TransitionTarget::Simple("complete".to_string())),
                        on_error: Some(TransitionTarget::Simple("fail".to_string())),
                    }),
                },
            ],
            on_complete: Default::default(),
            on_error: Default::default(),
        }
    }

    #[tokio::test]
    async fn continue_session_resumes_after_failure() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let engine = make_engine(db.clone());
        let def = two_stage_agent_definition();

        let worker = Arc::new(ScriptedWorker {
            outcomes: std::sync::Mutex::new(std::collections::VecDeque::from(vec![
                Ok(crate::bridge::WorkerOutcome {
                    events: vec![],
                    session_id: Some("sess-1".to_string()),
                    outputs: serde_json::json!({"error": "compile failed"}),
                    success: false,
                }),
                Ok(crate::bridge::WorkerOutcome {
                    events: vec![],
                    session_id: Some("sess-1".to_string()),
                    outputs: serde_json::json!({}),
                    success: true,
                }),
            ])),
            requests: std::sync::Mutex::new(Vec::new()),
        });
        engine.register_worker("dev", worker.clone()).await;

        let event = NormalizedEvent {
            event_type: "pull_request.opened".to_string(),
            delivery_id: "d1".to_string(),
            sender: "someone".to_string(),
            repository: "acme/widgets".to_string(),
            payload: serde_json::json!({"pr_number": 42}),
        };
        let run_id = engine.start_pipeline(&def, &event, None).await.unwrap();

        engine.tick(&run_id).await.unwrap();
        engine.tick(&run_id).await.unwrap();

        let requests = worker.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].resume_session_id.is_none());
        assert_eq!(requests[1].resume_session_id.as_deref(), Some("sess-1"));
        assert!(requests[1].instruction.contains("compile failed"));

        let run = db.get_pipeline_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_run_marks_it_cancelled() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let engine = make_engine(db.clone());
        let mut def = simple_definition();
        def.stages[0] = Stage {
            id: "wait".to_string(),
            kind: StageKind::Human(HumanStageConfig {
                wait_for: HumanCompletionType::Approval,
                from: "reviewer".to_string(),
                count: 1,
                pattern: None,
                auto_assign: false,
                notify: Default::default(),
                timeout_seconds: None,
                on_complete: TransitionTarget::Simple("complete".to_string()),
                on_timeout: None,
            }),
        };
        let event = NormalizedEvent {
            event_type: "pull_request.opened".to_string(),
            delivery_id: "d3".to_string(),
            sender: "someone".to_string(),
            repository: "acme/widgets".to_string(),
            payload: serde_json::json!({"pr_number": 9}),
        };
        let run_id = engine.start_pipeline(&def, &event, None).await.unwrap();
        let outcome = engine.tick(&run_id).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Waiting));

        engine.cancel_run(&run_id).await.unwrap();
        let run = db.get_pipeline_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }
}
