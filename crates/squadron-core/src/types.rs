//! The durable data model (pipeline definitions, runs, stage runs, gate
//! checks, agents, PR approval state, activity events, mail) described in
//! §3 of the orchestration design.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Pipeline scope / status enums ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineScope {
    SinglePr,
    MultiPr,
    Issue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Escalated,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Escalated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            "escalated" => RunStatus::Escalated,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StageRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageRunStatus::Pending => "pending",
            StageRunStatus::Running => "running",
            StageRunStatus::Waiting => "waiting",
            StageRunStatus::Completed => "completed",
            StageRunStatus::Failed => "failed",
            StageRunStatus::Skipped => "skipped",
            StageRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageRunStatus::Completed
                | StageRunStatus::Failed
                | StageRunStatus::Skipped
                | StageRunStatus::Cancelled
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => StageRunStatus::Pending,
            "running" => StageRunStatus::Running,
            "waiting" => StageRunStatus::Waiting,
            "completed" => StageRunStatus::Completed,
            "failed" => StageRunStatus::Failed,
            "skipped" => StageRunStatus::Skipped,
            "cancelled" => StageRunStatus::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Created,
    Active,
    Sleeping,
    Completed,
    Failed,
    Escalated,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Created => "created",
            AgentStatus::Active => "active",
            AgentStatus::Sleeping => "sleeping",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Escalated => "escalated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Escalated
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => AgentStatus::Created,
            "active" => AgentStatus::Active,
            "sleeping" => AgentStatus::Sleeping,
            "completed" => AgentStatus::Completed,
            "failed" => AgentStatus::Failed,
            "escalated" => AgentStatus::Escalated,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycleTag {
    Ephemeral,
    Persistent,
}

impl AgentLifecycleTag {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentLifecycleTag::Ephemeral => "ephemeral",
            AgentLifecycleTag::Persistent => "persistent",
        }
    }
}

// ── Pipeline Definition (§3.1) ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub event: String,
    #[serde(default)]
    pub condition: TriggerCondition,
}

impl Default for TriggerCondition {
    fn default() -> Self {
        Self {
            label: None,
            base_branch: None,
        }
    }
}

/// A reactive directive attached to `on_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReactiveDirective {
    ReevaluateGates,
    InvalidateAndRestart {
        invalidate: Vec<String>,
        restart_from: String,
    },
    Cancel,
    WakeAgent,
    Notify {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Resolution target for an `on_*` transition field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransitionTarget {
    /// A bare stage id, or one of the reserved terminals
    /// (`complete`, `escalate`, `fail`, `cancel`).
    Simple(String),
    /// `{ goto, max_iterations, then }` loop-back form.
    Loop {
        goto: String,
        #[serde(default)]
        max_iterations: Option<u32>,
        #[serde(rename = "then", default)]
        exhausted_then: Option<String>,
    },
}

pub const RESERVED_TERMINALS: &[&str] = &["complete", "escalate", "fail", "cancel"];

impl TransitionTarget {
    /// The stage id (or terminal keyword) this transition resolves to
    /// before any loop-exhaustion handling.
    pub fn primary_target(&self) -> &str {
        match self {
            TransitionTarget::Simple(s) => s,
            TransitionTarget::Loop { goto, .. } => goto,
        }
    }
}

// ── Stage configuration (tagged variant, §4.2.1 / §9 polymorphism note) ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    Agent(AgentStageConfig),
    Gate(GateStageConfig),
    Human(HumanStageConfig),
    Parallel(ParallelStageConfig),
    Delay(DelayStageConfig),
    Action(ActionStageConfig),
    Webhook(WebhookStageConfig),
    Pipeline(PipelineStageConfig),
}

impl StageKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StageKind::Agent(_) => "agent",
            StageKind::Gate(_) => "gate",
            StageKind::Human(_) => "human",
            StageKind::Parallel(_) => "parallel",
            StageKind::Delay(_) => "delay",
            StageKind::Action(_) => "action",
            StageKind::Webhook(_) => "webhook",
            StageKind::Pipeline(_) => "pipeline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStageConfig {
    pub role: String,
    pub action: String,
    #[serde(default)]
    pub continue_session: bool,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub on_complete: Option<TransitionTarget>,
    #[serde(default)]
    pub on_error: Option<TransitionTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConditionSet {
    #[serde(default)]
    pub conditions: Vec<GateCheckConfig>,
    #[serde(default)]
    pub any_of: Vec<GateCheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCheckConfig {
    pub check: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default)]
    pub pr: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateStageConfig {
    #[serde(flatten)]
    pub conditions: GateConditionSet,
    pub on_pass: TransitionTarget,
    #[serde(default)]
    pub on_fail: Option<TransitionTarget>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub on_timeout: Option<TransitionTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanCompletionType {
    Approval,
    Comment,
    Label,
    Dismiss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanNotifyConfig {
    #[serde(default)]
    pub reminder_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanStageConfig {
    pub wait_for: HumanCompletionType,
    pub from: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub auto_assign: bool,
    #[serde(default)]
    pub notify: HumanNotifyConfig,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    pub on_complete: TransitionTarget,
    #[serde(default)]
    pub on_timeout: Option<TransitionTarget>,
}

fn default_count() -> u32 {
    1
}

impl Default for HumanNotifyConfig {
    fn default() -> Self {
        Self {
            reminder_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    All,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub id: String,
    #[serde(flatten)]
    pub stage: Box<StageKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStageConfig {
    pub branches: Vec<ParallelBranch>,
    #[serde(default = "default_join")]
    pub join: JoinPolicy,
    /// Required when `join` is an N-of-M policy; `None` means "all"/"any" as given.
    #[serde(default)]
    pub join_count: Option<u32>,
    #[serde(default)]
    pub on_any_reject: Option<TransitionTarget>,
    pub on_complete: TransitionTarget,
}

fn default_join() -> JoinPolicy {
    JoinPolicy::All
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayPollConfig {
    pub check: GateCheckConfig,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayStageConfig {
    pub duration_seconds: u64,
    #[serde(default)]
    pub poll: Option<DelayPollConfig>,
    pub on_complete: TransitionTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    MergePr,
    ClosePr,
    AddLabel,
    RemoveLabel,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

fn default_retry_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStageConfig {
    pub action: ActionKind,
    #[serde(default)]
    pub method: Option<MergeMethod>,
    #[serde(default)]
    pub delete_branch: bool,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    pub on_complete: TransitionTarget,
    #[serde(default)]
    pub on_conflict: Option<TransitionTarget>,
    #[serde(default)]
    pub on_ci_failure: Option<TransitionTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookExpect {
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookStageConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub expect: WebhookExpect,
    pub on_complete: TransitionTarget,
    #[serde(default)]
    pub on_error: Option<TransitionTarget>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStageConfig {
    pub pipeline: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    pub on_complete: TransitionTarget,
    #[serde(default)]
    pub on_error: Option<TransitionTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    #[serde(flatten)]
    pub kind: StageKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalHooks {
    #[serde(default)]
    pub notify: Option<String>,
    #[serde(default)]
    pub add_label: Option<String>,
}

impl Default for TerminalHooks {
    fn default() -> Self {
        Self {
            notify: None,
            add_label: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub scope: PipelineScope,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub on_events: HashMap<String, ReactiveDirective>,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub on_complete: TerminalHooks,
    #[serde(default)]
    pub on_error: TerminalHooks,
}

impl PipelineDefinition {
    pub fn is_sub_pipeline(&self) -> bool {
        self.trigger.is_none()
    }

    pub fn get_stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn first_stage(&self) -> Option<&Stage> {
        self.stages.first()
    }
}

// ── Normalized event (§6) ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_type: String,
    pub delivery_id: String,
    pub sender: String,
    pub repository: String,
    #[serde(default)]
    pub payload: Value,
}

impl NormalizedEvent {
    pub fn pr_number(&self) -> Option<i64> {
        self.payload.get("pr_number").and_then(Value::as_i64)
    }

    pub fn issue_number(&self) -> Option<i64> {
        self.payload.get("issue_number").and_then(Value::as_i64)
    }
}

// ── Pipeline Run (§3.2) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub pipeline_name: String,
    pub definition_snapshot: PipelineDefinition,
    pub trigger_event_delivery_id: String,
    pub issue_number: Option<i64>,
    pub primary_pr_number: Option<i64>,
    pub scope: PipelineScope,
    pub status: RunStatus,
    pub current_stage_id: Option<String>,
    pub context: HashMap<String, Value>,
    pub parent_run_id: Option<String>,
    pub parent_stage_id: Option<String>,
    pub nesting_depth: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub error_stage_id: Option<String>,
}

pub const MAX_NESTING_DEPTH: u32 = 5;

// ── Stage Run (§3.3) ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub id: i64,
    pub run_id: String,
    pub stage_id: String,
    pub attempt_number: u32,
    pub status: StageRunStatus,
    pub agent_id: Option<String>,
    pub branch_id: Option<String>,
    pub parent_stage_id: Option<String>,
    pub child_pipeline_run_id: Option<String>,
    pub outputs: HashMap<String, Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Gate Check Record (§3.4) ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCheckRecord {
    pub id: i64,
    pub stage_run_id: i64,
    pub check_type: String,
    pub check_config_snapshot: Value,
    pub passed: bool,
    pub message: String,
    pub result_data: Option<Value>,
    pub checked_at: DateTime<Utc>,
}

// ── Agent Record (§3.5) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub role: String,
    pub issue_number: i64,
    pub session_id: String,
    pub status: AgentStatus,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub pr_number: Option<i64>,
    pub pipeline_run_id: Option<String>,
    pub pipeline_stage_id: Option<String>,
    pub active_since: Option<DateTime<Utc>>,
    pub sleeping_since: Option<DateTime<Utc>>,
    pub iteration_count: u32,
    pub tool_call_count: u32,
    pub turn_count: u32,
    pub lifecycle: AgentLifecycleTag,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub watchdog_escaped: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-role circuit-breaker configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentLimits {
    pub max_active_duration_secs: i64,
    pub max_iterations: u32,
    pub max_tool_calls: u32,
    pub max_turns: u32,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_active_duration_secs: 3600,
            max_iterations: 20,
            max_tool_calls: 500,
            max_turns: 200,
        }
    }
}

// ── PR Approval State (§3.6) ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrReviewRequirement {
    pub id: i64,
    pub pr_number: i64,
    pub role: String,
    pub required_count: u32,
    pub owning_run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrApproval {
    pub id: i64,
    pub pr_number: i64,
    pub role: String,
    pub approved: bool,
    pub reviewer: String,
    pub review_id: Option<String>,
    pub stale: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrSequenceState {
    pub pr_number: i64,
    pub cursor: i64,
}

// ── Activity Event (§3.7) ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEventType {
    ToolCallStarted,
    ToolCallFinished,
    LifecycleTransition,
    Reasoning,
    GateResult,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub agent_id: Option<String>,
    pub pipeline_run_id: Option<String>,
    pub event_type: ActivityEventType,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<Value>,
}

// ── Mail Message (§3.8) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub message_id: String,
    pub agent_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_str() {
        for s in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Escalated,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn terminal_statuses_are_marked_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Escalated.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn sub_pipeline_has_no_trigger() {
        let def = PipelineDefinition {
            name: "helper".into(),
            description: String::new(),
            scope: PipelineScope::SinglePr,
            trigger: None,
            on_events: HashMap::new(),
            stages: vec![],
            on_complete: TerminalHooks::default(),
            on_error: TerminalHooks::default(),
        };
        assert!(def.is_sub_pipeline());
    }

    #[test]
    fn transition_target_deserializes_both_forms() {
        let simple: TransitionTarget = serde_json::from_str("\"complete\"").unwrap();
        assert_eq!(simple.primary_target(), "complete");

        let looped: TransitionTarget =
            serde_json::from_str(r#"{"goto":"qa","max_iterations":3,"then":"escalate"}"#)
                .unwrap();
        assert_eq!(looped.primary_target(), "qa");
    }
}
