//! Gate checks: the predicates a `gate` stage evaluates before advancing.
//! Each check is a small trait implementation registered once at startup;
//! registering two checks under the same name is a fatal configuration
//! error, the same way a duplicate stage id is.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::forge::ForgeClient;
use crate::types::GateCheckConfig;

#[derive(Debug, Clone)]
pub struct GateResult {
    pub passed: bool,
    pub message: String,
    pub data: Option<Value>,
}

impl GateResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Everything a check needs to evaluate, resolved from the owning run.
pub struct GateCheckContext<'a> {
    pub repo: &'a str,
    pub repo_path: &'a str,
    pub pr_number: Option<i64>,
    pub db: &'a crate::db::Db,
    pub forge: &'a dyn ForgeClient,
}

#[async_trait]
pub trait GateCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn evaluate(&self, config: &GateCheckConfig, ctx: &GateCheckContext<'_>) -> anyhow::Result<GateResult>;

    /// Event types that should trigger an immediate re-evaluation of this
    /// check rather than reusing its last recorded result. A check whose
    /// truth only changes with wall-clock time or an external poll (e.g.
    /// `command`, `file_exists`) declares none — it's re-run on every tick
    /// regardless, since there's no cheaper cached path for it.
    fn reactive_events(&self) -> &'static [&'static str] {
        &[]
    }
}

pub struct GateRegistry {
    checks: HashMap<&'static str, Arc<dyn GateCheck>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self {
            checks: HashMap::new(),
        }
    }

    pub fn register(&mut self, check: Arc<dyn GateCheck>) {
        let name = check.name();
        if self.checks.insert(name, check).is_some() {
            panic!("duplicate gate check registration: {name}");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn GateCheck>> {
        self.checks.get(name)
    }

    pub fn with_builtins(forge_unused_marker: ()) -> Self {
        let _ = forge_unused_marker;
        let mut registry = Self::new();
        registry.register(Arc::new(CommandCheck));
        registry.register(Arc::new(FileExistsCheck));
        registry.register(Arc::new(PrApprovalsMetCheck));
        registry.register(Arc::new(CiStatusCheck));
        registry.register(Arc::new(LabelPresentCheck));
        registry.register(Arc::new(NoChangesRequestedCheck));
        registry.register(Arc::new(HumanApprovedCheck));
        registry.register(Arc::new(BranchUpToDateCheck));
        registry
    }
}

impl Default for GateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn require_pr(ctx: &GateCheckContext<'_>) -> anyhow::Result<i64> {
    ctx.pr_number
        .ok_or_else(|| anyhow::anyhow!("gate check requires a pull request in scope"))
}

fn param_str<'a>(config: &'a GateCheckConfig, key: &str) -> Option<&'a str> {
    config.params.get(key).and_then(Value::as_str)
}

fn param_u32(config: &GateCheckConfig, key: &str, default: u32) -> u32 {
    config
        .params
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(default)
}

fn param_str_list(config: &GateCheckConfig, key: &str) -> Vec<String> {
    config
        .params
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Runs an arbitrary shell command against the run's checkout and passes on
/// a zero exit code. The escape hatch for anything the built-in checks
/// don't cover.
pub struct CommandCheck;

#[async_trait]
impl GateCheck for CommandCheck {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn evaluate(&self, config: &GateCheckConfig, ctx: &GateCheckContext<'_>) -> anyhow::Result<GateResult> {
        let command = param_str(config, "command").ok_or_else(|| anyhow::anyhow!("command check requires a `command` param"))?;
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(ctx.repo_path)
            .output()?;
        if output.status.success() {
            Ok(GateResult::pass(format!("command {command:?} exited 0")))
        } else {
            let code = output.status.code().unwrap_or(-1);
            Ok(GateResult::fail(format!("command {command:?} exited {code}")))
        }
    }
}

/// Checks that a file (relative to the run's checkout) exists, isn't a
/// symlink, and stays under the artifact size cap.
pub struct FileExistsCheck;

#[async_trait]
impl GateCheck for FileExistsCheck {
    fn name(&self) -> &'static str {
        "file_exists"
    }

    async fn evaluate(&self, config: &GateCheckConfig, ctx: &GateCheckContext<'_>) -> anyhow::Result<GateResult> {
        let path = param_str(config, "path").ok_or_else(|| anyhow::anyhow!("file_exists requires a `path` param"))?;
        if crate::ipc::check_artifact(ctx.repo_path, path) {
            Ok(GateResult::pass(format!("{path:?} present")))
        } else {
            Ok(GateResult::fail(format!("{path:?} missing or quarantined")))
        }
    }
}

/// `scope`: `agents`, `humans`, or `all` (default). Delegates to the
/// review-requirement ledger rather than counting a single role, so a
/// pipeline that registered several required reviewer roles gets one
/// check covering all of them.
pub struct PrApprovalsMetCheck;

#[async_trait]
impl GateCheck for PrApprovalsMetCheck {
    fn name(&self) -> &'static str {
        "pr_approvals_met"
    }

    fn reactive_events(&self) -> &'static [&'static str] {
        &["pull_request_review.submitted", "pull_request_review.dismissed", "pull_request.synchronize"]
    }

    async fn evaluate(&self, config: &GateCheckConfig, ctx: &GateCheckContext<'_>) -> anyhow::Result<GateResult> {
        let pr_number = config.pr.unwrap_or(require_pr(ctx)?);
        let scope = param_str(config, "scope").unwrap_or("all");
        let (ready, missing) = ctx.db.check_pr_merge_ready(pr_number, scope)?;
        if ready {
            Ok(GateResult::pass(format!("all required approvals met ({scope})")))
        } else {
            Ok(GateResult::fail(format!("missing approvals from: {}", missing.join(", "))))
        }
    }
}

/// `workflows`: named check runs that must all report `success`. An empty
/// list falls back to the PR's single aggregate CI status.
pub struct CiStatusCheck;

#[async_trait]
impl GateCheck for CiStatusCheck {
    fn name(&self) -> &'static str {
        "ci_status"
    }

    fn reactive_events(&self) -> &'static [&'static str] {
        &["check_suite.completed", "status"]
    }

    async fn evaluate(&self, config: &GateCheckConfig, ctx: &GateCheckContext<'_>) -> anyhow::Result<GateResult> {
        let pr_number = config.pr.unwrap_or(require_pr(ctx)?);
        let workflows = param_str_list(config, "workflows");
        if workflows.is_empty() {
            let pr = ctx.forge.get_pr(ctx.repo, pr_number).await?;
            return match pr.ci_status.as_deref() {
                Some("success") => Ok(GateResult::pass("ci green")),
                Some(other) => Ok(GateResult::fail(format!("ci status: {other}"))),
                None => Ok(GateResult::fail("no ci status reported")),
            };
        }

        let runs = ctx.forge.list_check_runs(ctx.repo, pr_number).await?;
        let mut missing = Vec::new();
        for workflow in &workflows {
            match runs.iter().find(|r| &r.name == workflow) {
                Some(run) if run.status == "success" => {}
                Some(run) => missing.push(format!("{workflow} ({})", run.status)),
                None => missing.push(format!("{workflow} (not reported)")),
            }
        }
        if missing.is_empty() {
            Ok(GateResult::pass(format!("{} workflow(s) green", workflows.len())))
        } else {
            Ok(GateResult::fail(format!("not green: {}", missing.join(", "))))
        }
    }
}

pub struct LabelPresentCheck;

#[async_trait]
impl GateCheck for LabelPresentCheck {
    fn name(&self) -> &'static str {
        "label_present"
    }

    fn reactive_events(&self) -> &'static [&'static str] {
        &["pull_request.labeled", "pull_request.unlabeled"]
    }

    async fn evaluate(&self, config: &GateCheckConfig, ctx: &GateCheckContext<'_>) -> anyhow::Result<GateResult> {
        let pr_number = config.pr.unwrap_or(require_pr(ctx)?);
        let label = param_str(config, "label").ok_or_else(|| anyhow::anyhow!("label_present requires a `label` param"))?;
        let pr = ctx.forge.get_pr(ctx.repo, pr_number).await?;
        if pr.labels.iter().any(|l| l == label) {
            Ok(GateResult::pass(format!("label {label:?} present")))
        } else {
            Ok(GateResult::fail(format!("label {label:?} absent")))
        }
    }
}

/// Passes when the PR carries no fresh (non-stale) changes-requested
/// review, regardless of which role filed it.
pub struct NoChangesRequestedCheck;

#[async_trait]
impl GateCheck for NoChangesRequestedCheck {
    fn name(&self) -> &'static str {
        "no_changes_requested"
    }

    fn reactive_events(&self) -> &'static [&'static str] {
        &["pull_request_review.submitted", "pull_request_review.dismissed"]
    }

    async fn evaluate(&self, config: &GateCheckConfig, ctx: &GateCheckContext<'_>) -> anyhow::Result<GateResult> {
        let pr_number = config.pr.unwrap_or(require_pr(ctx)?);
        let outstanding = ctx.db.count_fresh_changes_requested(pr_number)?;
        if outstanding == 0 {
            Ok(GateResult::pass("no outstanding change requests"))
        } else {
            Ok(GateResult::fail(format!("{outstanding} unresolved change request(s)")))
        }
    }
}

/// `group`/`count`: a named human reviewer group's fresh approval count
/// must meet `count` (default 1). Distinct from `pr_approvals_met` in that
/// it checks one specific role rather than every registered requirement.
pub struct HumanApprovedCheck;

#[async_trait]
impl GateCheck for HumanApprovedCheck {
    fn name(&self) -> &'static str {
        "human_approved"
    }

    fn reactive_events(&self) -> &'static [&'static str] {
        &["pull_request_review.submitted", "pull_request_review.dismissed"]
    }

    async fn evaluate(&self, config: &GateCheckConfig, ctx: &GateCheckContext<'_>) -> anyhow::Result<GateResult> {
        let pr_number = config.pr.unwrap_or(require_pr(ctx)?);
        let group = param_str(config, "group").unwrap_or("human");
        let required = param_u32(config, "count", 1);
        let role = format!("human:{group}");
        let fresh = ctx.db.count_fresh_approvals(pr_number, &role)?;
        if fresh >= required {
            Ok(GateResult::pass(format!("{fresh}/{required} approvals from {group}")))
        } else {
            Ok(GateResult::fail(format!("{fresh}/{required} approvals from {group}")))
        }
    }
}

pub struct BranchUpToDateCheck;

#[async_trait]
impl GateCheck for BranchUpToDateCheck {
    fn name(&self) -> &'static str {
        "branch_up_to_date"
    }

    fn reactive_events(&self) -> &'static [&'static str] {
        &["pull_request.synchronize", "push"]
    }

    async fn evaluate(&self, config: &GateCheckConfig, ctx: &GateCheckContext<'_>) -> anyhow::Result<GateResult> {
        let pr_number = config.pr.unwrap_or(require_pr(ctx)?);
        if ctx.forge.branch_up_to_date(ctx.repo, pr_number).await? {
            Ok(GateResult::pass("head is not behind base"))
        } else {
            Ok(GateResult::fail("head is behind base"))
        }
    }
}

pub fn gate_passed(results: &[(GateCheckConfig, GateResult)], condition_set: &crate::types::GateConditionSet) -> bool {
    let conditions_ok = results
        .iter()
        .take(condition_set.conditions.len())
        .all(|(_, r)| r.passed);
    let any_of_ok = condition_set.any_of.is_empty()
        || results
            .iter()
            .skip(condition_set.conditions.len())
            .any(|(_, r)| r.passed);
    conditions_ok && any_of_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::{CheckRun, FakeForgeClient, PrStatus};
    use crate::types::{GateConditionSet, PrReviewRequirement};

    fn sample_pr(number: i64) -> PrStatus {
        PrStatus {
            number,
            state: "open".into(),
            mergeable: Some(true),
            labels: vec![],
            ci_status: Some("success".into()),
            head_ref: "feature/z".into(),
            base_ref: "main".into(),
        }
    }

    #[tokio::test]
    async fn ci_status_check_reads_forge_aggregate_status() {
        let forge = FakeForgeClient::default().with_pr("acme/widgets", sample_pr(1));
        let db = crate::db::Db::open_in_memory().unwrap();
        let ctx = GateCheckContext {
            repo: "acme/widgets",
            repo_path: "/tmp",
            pr_number: Some(1),
            db: &db,
            forge: &forge,
        };
        let result = CiStatusCheck
            .evaluate(&GateCheckConfig { check: "ci_status".into(), params: HashMap::new(), pr: None }, &ctx)
            .await
            .unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn ci_status_check_requires_every_named_workflow_green() {
        let forge = FakeForgeClient::default().with_pr("acme/widgets", sample_pr(1)).with_check_runs(
            "acme/widgets",
            1,
            vec![
                CheckRun { name: "test".into(), status: "success".into() },
                CheckRun { name: "lint".into(), status: "failure".into() },
            ],
        );
        let db = crate::db::Db::open_in_memory().unwrap();
        let ctx = GateCheckContext {
            repo: "acme/widgets",
            repo_path: "/tmp",
            pr_number: Some(1),
            db: &db,
            forge: &forge,
        };
        let mut params = HashMap::new();
        params.insert("workflows".to_string(), serde_json::json!(["test", "lint"]));
        let result = CiStatusCheck
            .evaluate(&GateCheckConfig { check: "ci_status".into(), params, pr: None }, &ctx)
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.message.contains("lint"));
    }

    #[tokio::test]
    async fn pr_approvals_met_checks_every_registered_requirement() {
        let db = crate::db::Db::open_in_memory().unwrap();
        db.add_pr_review_requirement(&PrReviewRequirement {
            id: 0,
            pr_number: 1,
            role: "reviewer".to_string(),
            required_count: 1,
            owning_run_id: "run-1".to_string(),
        })
        .unwrap();
        let forge = FakeForgeClient::default().with_pr("acme/widgets", sample_pr(1));
        let ctx = GateCheckContext {
            repo: "acme/widgets",
            repo_path: "/tmp",
            pr_number: Some(1),
            db: &db,
            forge: &forge,
        };
        let config = GateCheckConfig { check: "pr_approvals_met".into(), params: HashMap::new(), pr: None };
        assert!(!PrApprovalsMetCheck.evaluate(&config, &ctx).await.unwrap().passed);

        db.record_pr_approval(&crate::types::PrApproval {
            id: 0,
            pr_number: 1,
            role: "reviewer".to_string(),
            approved: true,
            reviewer: "bot".to_string(),
            review_id: None,
            stale: false,
            created_at: chrono::Utc::now(),
        })
        .unwrap();
        assert!(PrApprovalsMetCheck.evaluate(&config, &ctx).await.unwrap().passed);
    }

    #[test]
    #[should_panic(expected = "duplicate gate check registration")]
    fn duplicate_registration_panics() {
        let mut registry = GateRegistry::new();
        registry.register(Arc::new(CommandCheck));
        registry.register(Arc::new(CommandCheck));
    }

    #[test]
    fn gate_passed_requires_all_conditions_and_any_any_of() {
        let condition_set = GateConditionSet {
            conditions: vec![GateCheckConfig { check: "a".into(), params: HashMap::new(), pr: None }],
            any_of: vec![
                GateCheckConfig { check: "b".into(), params: HashMap::new(), pr: None },
                GateCheckConfig { check: "c".into(), params: HashMap::new(), pr: None },
            ],
        };
        let results = vec![
            (condition_set.conditions[0].clone(), GateResult::pass("ok")),
            (condition_set.any_of[0].clone(), GateResult::fail("no")),
            (condition_set.any_of[1].clone(), GateResult::pass("yes")),
        ];
        assert!(gate_passed(&results, &condition_set));
    }

    #[test]
    fn with_builtins_registers_the_full_minimum_viable_set() {
        let registry = GateRegistry::with_builtins(());
        for name in [
            "command",
            "file_exists",
            "pr_approvals_met",
            "ci_status",
            "label_present",
            "no_changes_requested",
            "human_approved",
            "branch_up_to_date",
        ] {
            assert!(registry.get(name).is_some(), "missing built-in check {name:?}");
        }
    }
}
