//! Task status reports for `foreman status`.
//!
//! A failed task stays queryable: the report names the milestone it failed
//! at and carries the captured error text.

use anyhow::Result;
use serde::Serialize;

use crate::core::status::{MilestoneStatus, TaskStatus};
use crate::core::types::{Milestone, Task};
use crate::io::store::Store;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MilestoneLine {
    pub id: u64,
    pub sequence: u32,
    pub title: String,
    pub agent_role: String,
    pub status: MilestoneStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl From<&Milestone> for MilestoneLine {
    fn from(m: &Milestone) -> Self {
        Self {
            id: m.id,
            sequence: m.sequence,
            title: m.title.clone(),
            agent_role: m.agent_role.to_string(),
            status: m.status,
            failure_reason: m.failure_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task: Task,
    pub milestones: Vec<MilestoneLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_milestone: Option<MilestoneLine>,
}

pub fn task_report(store: &dyn Store, task_id: u64) -> Result<TaskReport> {
    let task = store.get_task(task_id)?;
    build(store, task)
}

/// Reports for all tasks (optionally one status), in dispatch order.
pub fn task_reports(store: &dyn Store, status: Option<TaskStatus>) -> Result<Vec<TaskReport>> {
    store
        .list_tasks(status)?
        .into_iter()
        .map(|task| build(store, task))
        .collect()
}

fn build(store: &dyn Store, task: Task) -> Result<TaskReport> {
    let milestones: Vec<MilestoneLine> = store
        .milestones_for_task(task.id)?
        .iter()
        .map(MilestoneLine::from)
        .collect();
    let failed_milestone = milestones
        .iter()
        .rev()
        .find(|m| m.status == MilestoneStatus::Failed)
        .cloned();
    Ok(TaskReport {
        task,
        milestones,
        failed_milestone,
    })
}

/// One summary line per task, plus failure details when present.
pub fn render_text(reports: &[TaskReport]) -> String {
    let mut out = String::new();
    for report in reports {
        let task = &report.task;
        let done = report
            .milestones
            .iter()
            .filter(|m| m.status == MilestoneStatus::Completed)
            .count();
        out.push_str(&format!(
            "#{} [{}] {} ({}, priority {}, attempts {}, milestones {}/{})\n",
            task.id,
            task.status,
            task.title,
            task.task_type,
            task.priority,
            task.attempts,
            done,
            report.milestones.len()
        ));
        if let Some(owner) = &task.locked_by {
            out.push_str(&format!("  locked by {owner}\n"));
        }
        if let Some(failed) = &report.failed_milestone {
            out.push_str(&format!(
                "  failed at milestone {} \"{}\" [{}]: {}\n",
                failed.sequence,
                failed.title,
                failed.agent_role,
                failed.failure_reason.as_deref().unwrap_or("no reason recorded")
            ));
        }
        if let Some(err) = &task.last_error {
            out.push_str(&format!("  error: {err}\n"));
        }
    }
    out
}
