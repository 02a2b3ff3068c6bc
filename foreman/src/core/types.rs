//! Persisted record types: tasks, milestones and collaborator interactions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::role::AgentRole;
use crate::core::status::{MilestoneStatus, TaskStatus, TransitionError};

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Bug,
    Feature,
    Upgrade,
    Maintenance,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Bug => "bug",
            TaskType::Feature => "feature",
            TaskType::Upgrade => "upgrade",
            TaskType::Maintenance => "maintenance",
        }
    }

    /// Total processing attempts before a failed task stays failed.
    pub fn max_attempts(self) -> u32 {
        match self {
            TaskType::Feature | TaskType::Bug | TaskType::Maintenance => 2,
            TaskType::Upgrade => 1,
        }
    }

    /// Wall-clock budget for one processing attempt.
    pub fn execution_budget(self) -> Duration {
        match self {
            TaskType::Upgrade => Duration::from_secs(3 * 60 * 60),
            TaskType::Feature | TaskType::Maintenance => Duration::from_secs(2 * 60 * 60),
            TaskType::Bug => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bug" => Ok(TaskType::Bug),
            "feature" => Ok(TaskType::Feature),
            "upgrade" => Ok(TaskType::Upgrade),
            "maintenance" => Ok(TaskType::Maintenance),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

/// Top-level unit of orchestrated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Free-form payload supplied by whoever seeded the task.
    #[serde(default)]
    pub content: Value,
    pub status: TaskStatus,
    /// Lower is more urgent.
    pub priority: i64,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    /// True while an unexpired lock is held by anyone.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.locked_until.is_some_and(|until| until > now)
    }

    pub fn is_locked_by(&self, worker: &str, now: DateTime<Utc>) -> bool {
        self.is_locked(now) && self.locked_by.as_deref() == Some(worker)
    }

    /// Compare-and-set lock acquisition. Returns `false` without mutating when
    /// another unexpired lock is present.
    pub fn try_lock(&mut self, worker: &str, now: DateTime<Utc>, ttl: Duration) -> bool {
        if self.is_locked(now) {
            return false;
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.locked_by = Some(worker.to_string());
        self.locked_until = Some(now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC));
        self.updated_at = now;
        true
    }

    pub fn unlock(&mut self, now: DateTime<Utc>) {
        self.locked_by = None;
        self.locked_until = None;
        self.updated_at = now;
    }

    /// Apply a status transition, stamping `completed_at` on completion.
    pub fn transition_to(
        &mut self,
        next: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.status = self.status.transition(next)?;
        self.updated_at = now;
        if next == TaskStatus::Completed {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}

/// Fields supplied when seeding a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub priority: i64,
}

/// One ordered, role-scoped step of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: u64,
    pub task_id: u64,
    pub sequence: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub agent_role: AgentRole,
    pub status: MilestoneStatus,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Milestone {
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.transition(MilestoneStatus::InProgress)?;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, output: Value, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.transition(MilestoneStatus::Completed)?;
        self.output_data = Some(output);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.transition(MilestoneStatus::Failed)?;
        self.failure_reason = Some(reason.to_string());
        self.updated_at = now;
        Ok(())
    }

    pub fn skip(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.transition(MilestoneStatus::Skipped)?;
        self.updated_at = now;
        Ok(())
    }
}

/// Fields supplied when materializing a milestone from a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMilestone {
    pub task_id: u64,
    pub sequence: u32,
    pub title: String,
    pub description: String,
    pub agent_role: AgentRole,
    pub input_data: Value,
    pub metadata: Value,
}

/// Outcome of one collaborator exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Success,
    Error,
    Timeout,
    CacheHit,
}

impl InteractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionStatus::Success => "success",
            InteractionStatus::Error => "error",
            InteractionStatus::Timeout => "timeout",
            InteractionStatus::CacheHit => "cache_hit",
        }
    }
}

/// Append-only record of one request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: u64,
    pub run_id: String,
    #[serde(default)]
    pub task_id: Option<u64>,
    #[serde(default)]
    pub milestone_id: Option<u64>,
    pub role: AgentRole,
    pub system_prompt: String,
    pub user_prompt: String,
    #[serde(default)]
    pub response: Option<String>,
    pub model: String,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    pub execution_time_ms: u64,
    pub status: InteractionStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task() -> Task {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("time");
        Task {
            id: 1,
            task_type: TaskType::Feature,
            title: "t".to_string(),
            description: String::new(),
            content: Value::Null,
            status: TaskStatus::Pending,
            priority: 0,
            locked_by: None,
            locked_until: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            attempts: 0,
            last_error: None,
        }
    }

    #[test]
    fn second_lock_attempt_fails_without_mutation() {
        let mut task = task();
        let now = task.created_at;
        assert!(task.try_lock("a", now, Duration::from_secs(60)));
        let snapshot = task.clone();
        assert!(!task.try_lock("b", now, Duration::from_secs(60)));
        assert_eq!(task, snapshot);
    }

    #[test]
    fn expired_lock_can_be_reclaimed() {
        let mut task = task();
        let now = task.created_at;
        assert!(task.try_lock("a", now, Duration::from_secs(60)));
        let later = now + chrono::Duration::seconds(61);
        assert!(!task.is_locked(later));
        assert!(task.try_lock("b", later, Duration::from_secs(60)));
        assert!(task.is_locked_by("b", later));
    }

    #[test]
    fn completion_stamps_completed_at() {
        let mut task = task();
        let now = task.created_at;
        task.transition_to(TaskStatus::InProgress, now).expect("start");
        assert!(task.completed_at.is_none());
        task.transition_to(TaskStatus::Completed, now).expect("complete");
        assert_eq!(task.completed_at, Some(now));
    }

    #[test]
    fn illegal_transition_leaves_task_untouched() {
        let mut task = task();
        let snapshot = task.clone();
        let later = task.created_at + chrono::Duration::seconds(5);
        assert!(task.transition_to(TaskStatus::Completed, later).is_err());
        assert_eq!(task, snapshot);
    }

    #[test]
    fn upgrades_get_a_single_attempt() {
        assert_eq!(TaskType::Upgrade.max_attempts(), 1);
        assert_eq!(TaskType::Feature.max_attempts(), 2);
    }

    #[test]
    fn execution_budget_per_task_type() {
        let hours = |t: TaskType| t.execution_budget().as_secs() / 3600;
        assert_eq!(hours(TaskType::Upgrade), 3);
        assert_eq!(hours(TaskType::Feature), 2);
        assert_eq!(hours(TaskType::Maintenance), 2);
        assert_eq!(hours(TaskType::Bug), 1);
    }
}
