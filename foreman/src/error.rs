//! Error taxonomy for the orchestration core.
//!
//! Sandbox, parser and collaborator failures are typed so the engine can match
//! on them at the milestone-handler boundary. Storage failures are the only
//! unrecoverable channel and travel as [`anyhow::Error`].

use std::path::PathBuf;

use thiserror::Error;

use crate::core::status::TransitionError;

/// Failures raised by the file patcher and command runner.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path escapes workspace root: {path}")]
    PathTraversal { path: String },

    #[error("command not allowed: {command}")]
    CommandNotAllowed { command: String },

    #[error("command rejected (shell metacharacters): {command}")]
    CommandSyntaxRejected { command: String },

    #[error("working directory outside allowed roots: {}", path.display())]
    WorkdirNotAllowed { path: PathBuf },

    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("file already exists: {path}")]
    AlreadyExists { path: String },

    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub(crate) fn io(action: &'static str, path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// No structured plan could be recovered from model output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanParseError {
    #[error("no milestones recovered from {len} bytes of model output")]
    NoMilestones { len: usize },

    #[error("no actions recovered from {len} bytes of model output")]
    NoActions { len: usize },
}

/// Failures surfaced by the LLM collaborator.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("collaborator transport error: {0}")]
    Transport(String),

    #[error("collaborator returned status {code}: {body}")]
    Status { code: i32, body: String },

    #[error("collaborator returned empty content")]
    EmptyResponse,

    #[error("collaborator timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Errors returned by the milestone execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan parse failed: {0}")]
    PlanParseFailed(#[from] PlanParseError),

    #[error("milestone {sequence} (id {milestone_id}) failed: {reason}")]
    MilestoneExecutionFailed {
        milestone_id: u64,
        sequence: u32,
        reason: String,
    },

    #[error("lock held by another worker: {key}")]
    LockContention { key: String },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("final validation failed: {0}")]
    ValidationFailed(String),

    #[error("workspace backup failed: {0}")]
    BackupFailed(String),

    #[error("task {task_id} exceeded its {budget_secs}s execution budget")]
    DeadlineExceeded { task_id: u64, budget_secs: u64 },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the failure came from the storage layer rather than task content.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
