//! Generic NDJSON-subprocess `SessionWorker`: spawns a configured CLI
//! command, feeds it the turn instruction, and parses one worker event per
//! line of stdout. This is deliberately backend-agnostic — it knows
//! nothing about any particular LLM CLI's flags, only that the process
//! speaks line-delimited JSON on stdout matching `WorkerEvent`'s shape.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use squadron_core::bridge::{SessionWorker, WorkerEvent, WorkerOutcome, WorkerRequest};
use squadron_core::sandbox::{Sandbox, SandboxMode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ProcessWorkerConfig {
    /// Binary to invoke, e.g. `"squadron-session-runner"`.
    pub command: String,
    /// Extra fixed arguments prepended before the per-turn ones.
    pub base_args: Vec<String>,
    pub sandbox_mode: SandboxMode,
    pub docker_image: Option<String>,
}

pub struct ProcessWorker {
    config: ProcessWorkerConfig,
}

impl ProcessWorker {
    pub fn new(config: ProcessWorkerConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &WorkerRequest) -> Vec<String> {
        let mut args = self.config.base_args.clone();
        args.push("--action".to_string());
        args.push(request.action.clone());
        args.push("--instruction".to_string());
        args.push(request.instruction.clone());
        if let Some(session_id) = &request.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        args
    }

    fn full_command(&self, args: &[String]) -> Vec<String> {
        let mut command = vec![self.config.command.clone()];
        command.extend(args.iter().cloned());
        command
    }
}

#[async_trait]
impl SessionWorker for ProcessWorker {
    async fn run_turn(&self, request: WorkerRequest) -> anyhow::Result<WorkerOutcome> {
        let args = self.build_args(&request);
        let full_command = self.full_command(&args);

        let mut cmd = match self.config.sandbox_mode {
            SandboxMode::Bwrap => Sandbox::bwrap_command(&[&request.worktree_path], &request.worktree_path, &full_command),
            SandboxMode::Docker => {
                let image = self.config.docker_image.as_deref().unwrap_or("squadron-session-runner:latest");
                Sandbox::docker_command(image, &[(&request.worktree_path, &request.worktree_path)], &request.worktree_path, &full_command)
            }
            SandboxMode::Direct => {
                let mut cmd = Command::new(&self.config.command);
                cmd.args(&args).current_dir(&request.worktree_path);
                cmd
            }
        };
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        drop(child.stdin.take());

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut events = Vec::new();
        let read_loop = async {
            loop {
                tokio::select! {
                    line = stdout_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if let Some(event) = parse_worker_event_line(&line) {
                                    events.push(event);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("process worker: stdout read error: {e}");
                                break;
                            }
                        }
                    }
                    line = stderr_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => warn!("process worker stderr: {line}"),
                            Ok(None) => {}
                            Err(e) => {
                                warn!("process worker: stderr read error: {e}");
                            }
                        }
                    }
                }
            }
        };

        if request.timeout_secs > 0 {
            if tokio::time::timeout(std::time::Duration::from_secs(request.timeout_secs), read_loop)
                .await
                .is_err()
            {
                let _ = child.kill().await;
                return Ok(WorkerOutcome {
                    events,
                    session_id: None,
                    outputs: Value::Null,
                    success: false,
                });
            }
        } else {
            read_loop.await;
        }

        let status = child.wait().await?;

        let mut session_id = None;
        let mut outputs = Value::Null;
        let mut completed = false;
        let mut blocked_or_escalated = false;
        for event in &events {
            match event {
                WorkerEvent::AgentCompleted { outputs: o, session_id: s } => {
                    session_id = Some(s.clone());
                    outputs = o.clone();
                    completed = true;
                }
                WorkerEvent::AgentBlocked { .. } | WorkerEvent::AgentEscalated { .. } => {
                    blocked_or_escalated = true;
                }
                _ => {}
            }
        }

        Ok(WorkerOutcome {
            events,
            session_id,
            outputs,
            success: status.success() && completed && !blocked_or_escalated,
        })
    }

    async fn inject_message(&self, agent_id: &str, _message: &str) -> anyhow::Result<()> {
        warn!(%agent_id, "inject_message not yet implemented for subprocess workers");
        Ok(())
    }

    async fn interrupt(&self, agent_id: &str) -> anyhow::Result<()> {
        warn!(%agent_id, "interrupt not yet implemented for subprocess workers");
        Ok(())
    }
}

fn parse_worker_event_line(line: &str) -> Option<WorkerEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<WorkerEvent>(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("process worker: unparseable event line, skipping: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_event_lines() {
        let line = r#"{"kind":"tool_call_started","tool":"shell","call_id":"c1"}"#;
        let event = parse_worker_event_line(line).unwrap();
        assert!(matches!(event, WorkerEvent::ToolCallStarted { .. }));
    }

    #[test]
    fn skips_malformed_lines_without_panicking() {
        assert!(parse_worker_event_line("not json").is_none());
        assert!(parse_worker_event_line("").is_none());
    }

    #[test]
    fn build_args_includes_resume_flag_when_continuing() {
        let worker = ProcessWorker::new(ProcessWorkerConfig {
            command: "session-runner".to_string(),
            base_args: vec![],
            sandbox_mode: SandboxMode::Direct,
            docker_image: None,
        });
        let request = WorkerRequest {
            agent_id: "a1".to_string(),
            role: "dev".to_string(),
            action: "build".to_string(),
            instruction: "build the thing".to_string(),
            worktree_path: "/tmp/wt".to_string(),
            resume_session_id: Some("sess-1".to_string()),
            timeout_secs: 0,
        };
        let args = worker.build_args(&request);
        assert!(args.contains(&"--resume".to_string()));
        assert!(args.contains(&"sess-1".to_string()));
    }
}
