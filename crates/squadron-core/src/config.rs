//! Process-level configuration: environment variables layered over an
//! optional `.env` file, read through small typed helpers. This is
//! deliberately separate from the declarative, serde_yaml-based pipeline
//! definitions in `definitions.rs` — this module covers ambient,
//! deployment-level settings, not the orchestration data model itself.

use std::collections::HashMap;
use std::path::PathBuf;

/// Parse a `.env`-style file: `KEY=value` lines, `#`-prefixed comments,
/// blank lines ignored. Does not support quoting or multi-line values.
fn parse_dotenv(path: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();
            if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
                || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
            {
                value = &value[1..value.len() - 1];
            }
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

fn get_str(dotenv: &HashMap<String, String>, key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .or_else(|| dotenv.get(key).cloned())
        .unwrap_or_else(|| default.to_string())
}

fn get_opt_str(dotenv: &HashMap<String, String>, key: &str) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_bool(dotenv: &HashMap<String, String>, key: &str, default: bool) -> bool {
    get_opt_str(dotenv, key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn get_u32(dotenv: &HashMap<String, String>, key: &str, default: u32) -> u32 {
    get_opt_str(dotenv, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(dotenv: &HashMap<String, String>, key: &str, default: u64) -> u64 {
    get_opt_str(dotenv, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_i64(dotenv: &HashMap<String, String>, key: &str, default: i64) -> i64 {
    get_opt_str(dotenv, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base URL of the forge API (e.g. `https://api.github.com`).
    pub forge_base_url: String,
    /// Credential used to authenticate forge API calls.
    pub forge_token: Option<String>,
    /// Login/handle the bot posts as; used for self-event filtering.
    pub bot_identity: String,
    /// Local checkout this orchestrator drives (worktrees are created
    /// as siblings of it).
    pub repo_path: String,
    /// `owner/name` the forge client operates against.
    pub repo_name: String,

    /// Root directory for the sqlite file, worktrees, and quarantine dirs.
    pub data_dir: String,
    /// Directory of `*.yml` pipeline definitions, loaded at startup.
    pub pipelines_dir: String,
    /// Path to the sqlite registry file (under `data_dir` unless absolute).
    pub sqlite_path: String,

    pub dashboard_bind: String,
    pub dashboard_port: u16,
    /// Bearer token required on dashboard REST calls and SSE `?token=`.
    pub dashboard_token: Option<String>,

    /// In-memory ring buffer size for the Activity Log fan-out channel.
    pub activity_log_ring_size: usize,
    /// Maximum concurrently-active ephemeral + persistent agents.
    pub agent_concurrency_limit: u32,

    pub agent_limits: crate::types::AgentLimits,

    pub forge_retry_base_ms: u64,
    pub forge_retry_max_ms: u64,
    pub forge_retry_max_attempts: u32,

    /// Interval between reconciliation sweeps looking for orphaned runs.
    pub reconciliation_interval_secs: u64,
    /// How long an agent may go without a heartbeat before the watchdog
    /// considers it escaped.
    pub watchdog_heartbeat_timeout_secs: i64,

    pub sandbox_backend: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let dotenv_path = std::env::var("SQUADRON_ENV_FILE").unwrap_or_else(|_| ".env".to_string());
        let dotenv = parse_dotenv(&dotenv_path);

        let data_dir = resolve_tilde(&get_str(&dotenv, "SQUADRON_DATA_DIR", "./data"));
        let sqlite_path = {
            let configured = get_str(&dotenv, "SQUADRON_SQLITE_PATH", "squadron.db");
            if PathBuf::from(&configured).is_absolute() {
                configured
            } else {
                format!("{data_dir}/{configured}")
            }
        };

        Self {
            forge_base_url: get_str(&dotenv, "FORGE_BASE_URL", "https://api.github.com"),
            forge_token: get_opt_str(&dotenv, "FORGE_TOKEN"),
            bot_identity: get_str(&dotenv, "SQUADRON_BOT_IDENTITY", "squadron-bot"),
            repo_path: resolve_tilde(&get_str(&dotenv, "SQUADRON_REPO_PATH", "./repo")),
            repo_name: get_str(&dotenv, "SQUADRON_REPO_NAME", "owner/repo"),

            data_dir,
            pipelines_dir: resolve_tilde(&get_str(&dotenv, "SQUADRON_PIPELINES_DIR", "./pipelines")),
            sqlite_path,

            dashboard_bind: get_str(&dotenv, "SQUADRON_DASHBOARD_BIND", "0.0.0.0"),
            dashboard_port: get_u32(&dotenv, "SQUADRON_DASHBOARD_PORT", 8787) as u16,
            dashboard_token: get_opt_str(&dotenv, "SQUADRON_DASHBOARD_TOKEN"),

            activity_log_ring_size: get_u32(&dotenv, "SQUADRON_ACTIVITY_RING_SIZE", 5000) as usize,
            agent_concurrency_limit: get_u32(&dotenv, "SQUADRON_AGENT_CONCURRENCY_LIMIT", 8),

            agent_limits: crate::types::AgentLimits {
                max_active_duration_secs: get_i64(&dotenv, "SQUADRON_AGENT_MAX_ACTIVE_SECS", 3600),
                max_iterations: get_u32(&dotenv, "SQUADRON_AGENT_MAX_ITERATIONS", 20),
                max_tool_calls: get_u32(&dotenv, "SQUADRON_AGENT_MAX_TOOL_CALLS", 500),
                max_turns: get_u32(&dotenv, "SQUADRON_AGENT_MAX_TURNS", 200),
            },

            forge_retry_base_ms: get_u64(&dotenv, "FORGE_RETRY_BASE_MS", 500),
            forge_retry_max_ms: get_u64(&dotenv, "FORGE_RETRY_MAX_MS", 30_000),
            forge_retry_max_attempts: get_u32(&dotenv, "FORGE_RETRY_MAX_ATTEMPTS", 5),

            reconciliation_interval_secs: get_u64(&dotenv, "SQUADRON_RECONCILE_INTERVAL_SECS", 60),
            watchdog_heartbeat_timeout_secs: get_i64(&dotenv, "SQUADRON_WATCHDOG_TIMEOUT_SECS", 120),

            sandbox_backend: get_str(&dotenv, "SANDBOX_BACKEND", "auto"),
        }
    }

    pub fn backoff_policy(&self) -> crate::retry::BackoffPolicy {
        crate::retry::BackoffPolicy {
            base_delay_ms: self.forge_retry_base_ms,
            max_delay_ms: self.forge_retry_max_ms,
            max_attempts: self.forge_retry_max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dotenv_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# comment\n\nFOO=bar\nBAZ=\"quoted value\"\n").unwrap();
        let map = parse_dotenv(path.to_str().unwrap());
        assert_eq!(map.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(map.get("BAZ"), Some(&"quoted value".to_string()));
    }

    #[test]
    fn get_bool_recognizes_common_truthy_values() {
        let mut dotenv = HashMap::new();
        dotenv.insert("FLAG".to_string(), "Yes".to_string());
        assert!(get_bool(&dotenv, "FLAG", false));
    }

    #[test]
    fn resolve_tilde_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(resolve_tilde("~/data"), "/home/tester/data");
        assert_eq!(resolve_tilde("/abs/data"), "/abs/data");
    }
}
