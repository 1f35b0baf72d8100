use std::{path::Path, process::Command};

use anyhow::{anyhow, Context, Result};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn worktree_path(&self, branch: &str) -> String {
        let parent = Path::new(&self.repo_path)
            .parent()
            .unwrap_or(Path::new("/tmp"));
        parent
            .join("worktrees")
            .join(branch)
            .to_string_lossy()
            .into_owned()
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.args(args);

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    pub fn create_worktree(&self, branch: &str, base: &str) -> Result<String> {
        let wt_path = self.worktree_path(branch);
        let result = self.exec(
            &self.repo_path,
            &["worktree", "add", &wt_path, "-b", branch, base],
        )?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree add failed for branch={branch} base={base}: {}",
                result.combined_output()
            ));
        }
        Ok(wt_path)
    }

    pub fn remove_worktree(&self, worktree_path: &str) -> Result<()> {
        let result = self.exec(
            &self.repo_path,
            &["worktree", "remove", "--force", worktree_path],
        )?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree remove failed for {worktree_path}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }
}
