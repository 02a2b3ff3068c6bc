//! Version-control hook run after each completed milestone.
//!
//! Commits are best effort: the engine logs a failed hook and carries on.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::{Milestone, Task};
use crate::io::config::VcsConfig;

/// Seam for recording milestone progress in version control.
pub trait VersionControl: Send + Sync {
    fn milestone_completed(&self, task: &Task, milestone: &Milestone) -> Result<()>;
}

/// Does nothing; used when `[vcs] enabled = false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVcs;

impl VersionControl for NoopVcs {
    fn milestone_completed(&self, _task: &Task, _milestone: &Milestone) -> Result<()> {
        Ok(())
    }
}

pub fn from_config(cfg: &VcsConfig, workspace: &Path) -> Box<dyn VersionControl> {
    if cfg.enabled {
        Box::new(GitVcs::new(workspace, &cfg.branch_prefix))
    } else {
        Box::new(NoopVcs)
    }
}

/// Commits workspace changes on a per-task branch.
#[derive(Debug, Clone)]
pub struct GitVcs {
    git: Git,
    branch_prefix: String,
}

impl GitVcs {
    pub fn new(workdir: &Path, branch_prefix: &str) -> Self {
        Self {
            git: Git::new(workdir),
            branch_prefix: branch_prefix.to_string(),
        }
    }

    pub fn branch_for(&self, task_id: u64) -> String {
        format!("{}{}", self.branch_prefix, task_id)
    }
}

impl VersionControl for GitVcs {
    #[instrument(skip_all, fields(task_id = task.id, milestone_id = milestone.id))]
    fn milestone_completed(&self, task: &Task, milestone: &Milestone) -> Result<()> {
        let branch = self.branch_for(task.id);
        if self.git.current_branch()? != branch {
            if self.git.branch_exists(&branch)? {
                self.git.checkout_branch(&branch)?;
            } else {
                self.git.checkout_new_branch(&branch)?;
            }
        }
        self.git.add_all()?;
        let message = format!(
            "task {} milestone {}: {} [{}]",
            task.id, milestone.sequence, milestone.title, milestone.agent_role
        );
        let committed = self.git.commit_staged(&message)?;
        debug!(branch, committed, "milestone recorded");
        Ok(())
    }
}

/// Thin wrapper over the `git` binary in one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Current branch name; errors on detached HEAD.
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        Ok(name)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes; `Ok(false)` when nothing is staged.
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
