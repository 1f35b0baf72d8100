//! Abstraction over the source-control forge's write/read surface (pull
//! requests, issues, labels, comments, reviews). A thin HTTP implementation
//! backs production; an in-memory fake backs tests so the pipeline engine
//! never needs a live forge to exercise its logic.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::retry::{retry_with_backoff, BackoffPolicy};
use crate::types::MergeMethod;

#[derive(Debug, Clone)]
pub struct PrStatus {
    pub number: i64,
    pub state: String,
    pub mergeable: Option<bool>,
    pub labels: Vec<String>,
    pub ci_status: Option<String>,
    pub head_ref: String,
    pub base_ref: String,
}

#[derive(Debug, Clone)]
pub struct IssueComment {
    pub author: String,
    pub body: String,
    pub comment_id: String,
}

/// One named check run (a single GitHub Actions workflow run, for example)
/// as reported against a PR's head commit.
#[derive(Debug, Clone)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
}

/// Write/read surface the pipeline engine and gate checks call against.
/// Every method that hits the network is expected to retry transient
/// failures internally per the configured backoff policy.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn get_pr(&self, repo: &str, number: i64) -> anyhow::Result<PrStatus>;
    async fn merge_pr(&self, repo: &str, number: i64, method: MergeMethod) -> anyhow::Result<()>;
    async fn close_pr(&self, repo: &str, number: i64) -> anyhow::Result<()>;
    async fn add_label(&self, repo: &str, number: i64, label: &str) -> anyhow::Result<()>;
    async fn remove_label(&self, repo: &str, number: i64, label: &str) -> anyhow::Result<()>;
    async fn comment(&self, repo: &str, number: i64, body: &str) -> anyhow::Result<()>;
    async fn list_comments(&self, repo: &str, number: i64) -> anyhow::Result<Vec<IssueComment>>;
    async fn delete_branch(&self, repo: &str, branch: &str) -> anyhow::Result<()>;
    /// Named check runs against the PR's head commit, one per workflow.
    async fn list_check_runs(&self, repo: &str, number: i64) -> anyhow::Result<Vec<CheckRun>>;
    /// Whether the PR's base has moved no further than its head, i.e. the
    /// head branch is not behind base.
    async fn branch_up_to_date(&self, repo: &str, number: i64) -> anyhow::Result<bool>;
}

/// reqwest-backed implementation. Talks a GitHub-shaped REST surface but
/// keeps the wire details contained here so `ForgeClient` stays portable.
pub struct HttpForgeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpForgeClient {
    pub fn new(base_url: String, token: Option<String>, backoff: BackoffPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            token,
            backoff,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn request_with_retry<F, Fut>(&self, op_name: &str, make_request: F) -> anyhow::Result<reqwest::Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        retry_with_backoff(
            &self.backoff,
            |_attempt| async { make_request().await },
            |e: &reqwest::Error| e.is_timeout() || e.is_connect() || e.status().map(|s| s.is_server_error()).unwrap_or(false),
        )
        .await
        .map_err(|e| anyhow::anyhow!("forge call {op_name} failed: {e}"))
    }
}

#[async_trait]
impl ForgeClient for HttpForgeClient {
    async fn get_pr(&self, repo: &str, number: i64) -> anyhow::Result<PrStatus> {
        let url = format!("{}/repos/{repo}/pulls/{number}", self.base_url);
        let resp = self
            .request_with_retry("get_pr", || self.authed(self.client.get(&url)).send())
            .await?;
        let body: Value = resp.json().await?;
        Ok(PrStatus {
            number,
            state: body["state"].as_str().unwrap_or("unknown").to_string(),
            mergeable: body["mergeable"].as_bool(),
            labels: body["labels"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|l| l["name"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            ci_status: body["ci_status"].as_str().map(str::to_string),
            head_ref: body["head"]["ref"].as_str().unwrap_or_default().to_string(),
            base_ref: body["base"]["ref"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn merge_pr(&self, repo: &str, number: i64, method: MergeMethod) -> anyhow::Result<()> {
        let url = format!("{}/repos/{repo}/pulls/{number}/merge", self.base_url);
        let method_str = match method {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        };
        self.request_with_retry("merge_pr", || {
            self.authed(self.client.put(&url))
                .json(&serde_json::json!({ "merge_method": method_str }))
                .send()
        })
        .await?;
        Ok(())
    }

    async fn close_pr(&self, repo: &str, number: i64) -> anyhow::Result<()> {
        let url = format!("{}/repos/{repo}/pulls/{number}", self.base_url);
        self.request_with_retry("close_pr", || {
            self.authed(self.client.patch(&url))
                .json(&serde_json::json!({ "state": "closed" }))
                .send()
        })
        .await?;
        Ok(())
    }

    async fn add_label(&self, repo: &str, number: i64, label: &str) -> anyhow::Result<()> {
        let url = format!("{}/repos/{repo}/issues/{number}/labels", self.base_url);
        self.request_with_retry("add_label", || {
            self.authed(self.client.post(&url))
                .json(&serde_json::json!({ "labels": [label] }))
                .send()
        })
        .await?;
        Ok(())
    }

    async fn remove_label(&self, repo: &str, number: i64, label: &str) -> anyhow::Result<()> {
        let url = format!("{}/repos/{repo}/issues/{number}/labels/{label}", self.base_url);
        self.request_with_retry("remove_label", || self.authed(self.client.delete(&url)).send())
            .await?;
        Ok(())
    }

    async fn comment(&self, repo: &str, number: i64, body: &str) -> anyhow::Result<()> {
        let url = format!("{}/repos/{repo}/issues/{number}/comments", self.base_url);
        self.request_with_retry("comment", || {
            self.authed(self.client.post(&url))
                .json(&serde_json::json!({ "body": body }))
                .send()
        })
        .await?;
        Ok(())
    }

    async fn list_comments(&self, repo: &str, number: i64) -> anyhow::Result<Vec<IssueComment>> {
        let url = format!("{}/repos/{repo}/issues/{number}/comments", self.base_url);
        let resp = self
            .request_with_retry("list_comments", || self.authed(self.client.get(&url)).send())
            .await?;
        let body: Vec<Value> = resp.json().await?;
        Ok(body
            .into_iter()
            .map(|c| IssueComment {
                author: c["user"]["login"].as_str().unwrap_or("unknown").to_string(),
                body: c["body"].as_str().unwrap_or_default().to_string(),
                comment_id: c["id"].to_string(),
            })
            .collect())
    }

    async fn delete_branch(&self, repo: &str, branch: &str) -> anyhow::Result<()> {
        let url = format!("{}/repos/{repo}/git/refs/heads/{branch}", self.base_url);
        self.request_with_retry("delete_branch", || self.authed(self.client.delete(&url)).send())
            .await?;
        Ok(())
    }

    async fn list_check_runs(&self, repo: &str, number: i64) -> anyhow::Result<Vec<CheckRun>> {
        let pr = self.get_pr(repo, number).await?;
        let url = format!("{}/repos/{repo}/commits/{}/check-runs", self.base_url, pr.head_ref);
        let resp = self
            .request_with_retry("list_check_runs", || self.authed(self.client.get(&url)).send())
            .await?;
        let body: Value = resp.json().await?;
        Ok(body["check_runs"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|c| CheckRun {
                        name: c["name"].as_str().unwrap_or("unknown").to_string(),
                        status: c["conclusion"]
                            .as_str()
                            .or_else(|| c["status"].as_str())
                            .unwrap_or("pending")
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn branch_up_to_date(&self, repo: &str, number: i64) -> anyhow::Result<bool> {
        let pr = self.get_pr(repo, number).await?;
        let url = format!(
            "{}/repos/{repo}/compare/{}...{}",
            self.base_url, pr.head_ref, pr.base_ref
        );
        let resp = self
            .request_with_retry("branch_up_to_date", || self.authed(self.client.get(&url)).send())
            .await?;
        let body: Value = resp.json().await?;
        Ok(body["ahead_by"].as_u64().unwrap_or(0) == 0)
    }
}

/// In-memory fake used by pipeline/gate/lifecycle tests.
#[derive(Default)]
pub struct FakeForgeClient {
    pub prs: Mutex<HashMap<(String, i64), PrStatus>>,
    pub comments: Mutex<HashMap<(String, i64), Vec<IssueComment>>>,
    pub merged: Mutex<Vec<(String, i64)>>,
    pub closed: Mutex<Vec<(String, i64)>>,
    pub deleted_branches: Mutex<Vec<(String, String)>>,
    pub check_runs: Mutex<HashMap<(String, i64), Vec<CheckRun>>>,
    pub branch_up_to_date: Mutex<HashMap<(String, i64), bool>>,
}

impl FakeForgeClient {
    pub fn with_pr(self, repo: &str, pr: PrStatus) -> Self {
        self.prs.lock().unwrap().insert((repo.to_string(), pr.number), pr);
        self
    }

    pub fn with_check_runs(self, repo: &str, number: i64, runs: Vec<CheckRun>) -> Self {
        self.check_runs.lock().unwrap().insert((repo.to_string(), number), runs);
        self
    }

    pub fn with_branch_up_to_date(self, repo: &str, number: i64, up_to_date: bool) -> Self {
        self.branch_up_to_date.lock().unwrap().insert((repo.to_string(), number), up_to_date);
        self
    }
}

#[async_trait]
impl ForgeClient for FakeForgeClient {
    async fn get_pr(&self, repo: &str, number: i64) -> anyhow::Result<PrStatus> {
        self.prs
            .lock()
            .unwrap()
            .get(&(repo.to_string(), number))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such pr {repo}#{number}"))
    }

    async fn merge_pr(&self, repo: &str, number: i64, _method: MergeMethod) -> anyhow::Result<()> {
        self.merged.lock().unwrap().push((repo.to_string(), number));
        Ok(())
    }

    async fn close_pr(&self, repo: &str, number: i64) -> anyhow::Result<()> {
        self.closed.lock().unwrap().push((repo.to_string(), number));
        Ok(())
    }

    async fn add_label(&self, repo: &str, number: i64, label: &str) -> anyhow::Result<()> {
        if let Some(pr) = self.prs.lock().unwrap().get_mut(&(repo.to_string(), number)) {
            pr.labels.push(label.to_string());
        }
        Ok(())
    }

    async fn remove_label(&self, repo: &str, number: i64, label: &str) -> anyhow::Result<()> {
        if let Some(pr) = self.prs.lock().unwrap().get_mut(&(repo.to_string(), number)) {
            pr.labels.retain(|l| l != label);
        }
        Ok(())
    }

    async fn comment(&self, repo: &str, number: i64, body: &str) -> anyhow::Result<()> {
        self.comments
            .lock()
            .unwrap()
            .entry((repo.to_string(), number))
            .or_default()
            .push(IssueComment {
                author: "squadron-bot".to_string(),
                body: body.to_string(),
                comment_id: uuid::Uuid::new_v4().to_string(),
            });
        Ok(())
    }

    async fn list_comments(&self, repo: &str, number: i64) -> anyhow::Result<Vec<IssueComment>> {
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_branch(&self, repo: &str, branch: &str) -> anyhow::Result<()> {
        self.deleted_branches
            .lock()
            .unwrap()
            .push((repo.to_string(), branch.to_string()));
        Ok(())
    }

    async fn list_check_runs(&self, repo: &str, number: i64) -> anyhow::Result<Vec<CheckRun>> {
        Ok(self
            .check_runs
            .lock()
            .unwrap()
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn branch_up_to_date(&self, repo: &str, number: i64) -> anyhow::Result<bool> {
        Ok(self
            .branch_up_to_date
            .lock()
            .unwrap()
            .get(&(repo.to_string(), number))
            .copied()
            .unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_forge_round_trips_pr_state() {
        let fake = FakeForgeClient::default().with_pr(
            "acme/widgets",
            PrStatus {
                number: 42,
                state: "open".to_string(),
                mergeable: Some(true),
                labels: vec![],
                ci_status: Some("success".to_string()),
                head_ref: "feature/x".to_string(),
                base_ref: "main".to_string(),
            },
        );
        fake.add_label("acme/widgets", 42, "ready").await.unwrap();
        let pr = fake.get_pr("acme/widgets", 42).await.unwrap();
        assert_eq!(pr.labels, vec!["ready".to_string()]);
    }

    #[tokio::test]
    async fn merge_and_close_are_recorded() {
        let fake = FakeForgeClient::default().with_pr(
            "acme/widgets",
            PrStatus {
                number: 1,
                state: "open".to_string(),
                mergeable: Some(true),
                labels: vec![],
                ci_status: None,
                head_ref: "feature/y".to_string(),
                base_ref: "main".to_string(),
            },
        );
        fake.merge_pr("acme/widgets", 1, MergeMethod::Squash).await.unwrap();
        assert_eq!(fake.merged.lock().unwrap().len(), 1);
    }
}
