//! Task and milestone lifecycle state machines.
//!
//! Transitions are checked against a fixed table; a rejected transition
//! returns [`TransitionError`] and leaves the caller's state untouched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Legal transitions:
    ///
    /// ```text
    /// pending     -> in_progress | cancelled
    /// in_progress -> completed | failed | cancelled
    /// failed      -> pending | cancelled
    /// cancelled   -> pending
    /// completed   -> (terminal)
    /// ```
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::{Cancelled, Completed, Failed, InProgress, Pending};
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Failed, Pending)
                | (Failed, Cancelled)
                | (Cancelled, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Return `next` if the transition is legal.
    pub fn transition(self, next: TaskStatus) -> Result<TaskStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::new("task", self.as_str(), next.as_str()))
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{s}'"))
    }
}

/// Lifecycle state of a milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl MilestoneStatus {
    pub const ALL: [MilestoneStatus; 5] = [
        MilestoneStatus::Pending,
        MilestoneStatus::InProgress,
        MilestoneStatus::Completed,
        MilestoneStatus::Failed,
        MilestoneStatus::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::Completed => "completed",
            MilestoneStatus::Failed => "failed",
            MilestoneStatus::Skipped => "skipped",
        }
    }

    /// A milestone runs `pending -> in_progress -> completed | failed`.
    /// Pending milestones left behind by an aborted sequence become `skipped`.
    pub fn can_transition_to(self, next: MilestoneStatus) -> bool {
        use MilestoneStatus::{Completed, Failed, InProgress, Pending, Skipped};
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MilestoneStatus::Completed | MilestoneStatus::Failed | MilestoneStatus::Skipped
        )
    }

    pub fn transition(self, next: MilestoneStatus) -> Result<MilestoneStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::new("milestone", self.as_str(), next.as_str()))
        }
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition that is not in the lifecycle table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal {entity} transition {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

impl TransitionError {
    fn new(entity: &'static str, from: &'static str, to: &'static str) -> Self {
        Self { entity, from, to }
    }
}
