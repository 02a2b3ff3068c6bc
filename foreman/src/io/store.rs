//! Persisted state for tasks, milestones and interaction records.
//!
//! The [`Store`] trait is the only storage contract the orchestrator needs:
//! create, read, update-by-id and ordered queries, plus a compare-and-set
//! task lock. [`MemoryStore`] backs tests and single-process runs;
//! [`crate::io::json_store::JsonFileStore`] persists to disk.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::invariants::can_append_sequence;
use crate::core::status::{MilestoneStatus, TaskStatus};
use crate::core::types::{InteractionRecord, Milestone, NewMilestone, NewTask, Task};

/// Storage contract. Implementations must make [`Store::try_lock_task`] atomic
/// with respect to every other caller sharing the same state.
pub trait Store: Send + Sync {
    fn create_task(&self, new: NewTask) -> Result<Task>;
    fn get_task(&self, id: u64) -> Result<Task>;
    fn update_task(&self, task: &Task) -> Result<()>;
    /// Tasks ordered by `(priority, created_at, id)`, optionally by status.
    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>>;
    /// Pending tasks whose lock is absent or expired, in dispatch order.
    /// `include_locked` also returns pending tasks with a live lock.
    fn claimable_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        include_locked: bool,
    ) -> Result<Vec<Task>>;
    /// Compare-and-set: `Ok(false)` without mutation if a live lock exists.
    fn try_lock_task(&self, id: u64, worker: &str, now: DateTime<Utc>, ttl: Duration)
    -> Result<bool>;
    /// Clear the lock if `worker` holds it (or it has expired).
    fn release_task_lock(&self, id: u64, worker: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Fails on a duplicate or non-increasing sequence number.
    fn create_milestone(&self, new: NewMilestone) -> Result<Milestone>;
    fn get_milestone(&self, id: u64) -> Result<Milestone>;
    /// Milestones of a task in ascending sequence order.
    fn milestones_for_task(&self, task_id: u64) -> Result<Vec<Milestone>>;
    /// Completed milestones are immutable.
    fn update_milestone(&self, milestone: &Milestone) -> Result<()>;

    /// Append a record, assigning its id.
    fn append_interaction(&self, record: InteractionRecord) -> Result<u64>;
    fn interactions(&self, task_id: Option<u64>) -> Result<Vec<InteractionRecord>>;
    /// Remove records created before `cutoff`; returns how many matched.
    fn prune_interactions(&self, cutoff: DateTime<Utc>, dry_run: bool) -> Result<usize>;
}

/// Task and milestone tables shared by both store implementations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub version: u32,
    pub next_task_id: u64,
    pub next_milestone_id: u64,
    pub next_interaction_id: u64,
    pub tasks: BTreeMap<u64, Task>,
    pub milestones: BTreeMap<u64, Milestone>,
}

pub(crate) const STATE_VERSION: u32 = 1;

impl StoreState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            next_task_id: 1,
            next_milestone_id: 1,
            next_interaction_id: 1,
            ..Self::default()
        }
    }

    pub(crate) fn create_task(&mut self, new: NewTask, now: DateTime<Utc>) -> Task {
        let id = self.next_task_id;
        self.next_task_id += 1;
        let task = Task {
            id,
            task_type: new.task_type,
            title: new.title,
            description: new.description,
            content: new.content,
            status: TaskStatus::Pending,
            priority: new.priority,
            locked_by: None,
            locked_until: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            attempts: 0,
            last_error: None,
        };
        self.tasks.insert(id, task.clone());
        task
    }

    pub(crate) fn task(&self, id: u64) -> Result<&Task> {
        self.tasks.get(&id).ok_or_else(|| anyhow!("task {id} not found"))
    }

    pub(crate) fn task_mut(&mut self, id: u64) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} not found"))
    }

    pub(crate) fn update_task(&mut self, task: &Task) -> Result<()> {
        *self.task_mut(task.id)? = task.clone();
        Ok(())
    }

    pub(crate) fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|task| status.is_none_or(|s| task.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            (a.priority, a.created_at, a.id).cmp(&(b.priority, b.created_at, b.id))
        });
        tasks
    }

    pub(crate) fn claimable_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        include_locked: bool,
    ) -> Vec<Task> {
        self.list_tasks(Some(TaskStatus::Pending))
            .into_iter()
            .filter(|task| include_locked || !task.is_locked(now))
            .take(limit)
            .collect()
    }

    pub(crate) fn try_lock_task(
        &mut self,
        id: u64,
        worker: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        Ok(self.task_mut(id)?.try_lock(worker, now, ttl))
    }

    pub(crate) fn release_task_lock(
        &mut self,
        id: u64,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let task = self.task_mut(id)?;
        if task.locked_by.is_none() {
            return Ok(false);
        }
        if task.is_locked(now) && task.locked_by.as_deref() != Some(worker) {
            return Ok(false);
        }
        task.unlock(now);
        Ok(true)
    }

    pub(crate) fn create_milestone(
        &mut self,
        new: NewMilestone,
        now: DateTime<Utc>,
    ) -> Result<Milestone> {
        self.task(new.task_id)?;
        let existing: Vec<Milestone> = self
            .milestones
            .values()
            .filter(|m| m.task_id == new.task_id)
            .cloned()
            .collect();
        if !can_append_sequence(&existing, new.task_id, new.sequence) {
            bail!(
                "task {}: milestone sequence {} is duplicate or out of order",
                new.task_id,
                new.sequence
            );
        }
        let id = self.next_milestone_id;
        self.next_milestone_id += 1;
        let milestone = Milestone {
            id,
            task_id: new.task_id,
            sequence: new.sequence,
            title: new.title,
            description: new.description,
            agent_role: new.agent_role,
            status: MilestoneStatus::Pending,
            input_data: new.input_data,
            output_data: None,
            metadata: new.metadata,
            failure_reason: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.milestones.insert(id, milestone.clone());
        Ok(milestone)
    }

    pub(crate) fn milestone(&self, id: u64) -> Result<&Milestone> {
        self.milestones
            .get(&id)
            .ok_or_else(|| anyhow!("milestone {id} not found"))
    }

    pub(crate) fn milestones_for_task(&self, task_id: u64) -> Vec<Milestone> {
        let mut list: Vec<Milestone> = self
            .milestones
            .values()
            .filter(|m| m.task_id == task_id)
            .cloned()
            .collect();
        list.sort_by_key(|m| m.sequence);
        list
    }

    pub(crate) fn update_milestone(&mut self, milestone: &Milestone) -> Result<()> {
        let stored = self
            .milestones
            .get_mut(&milestone.id)
            .ok_or_else(|| anyhow!("milestone {} not found", milestone.id))?;
        if stored.status.is_terminal() && stored != milestone {
            bail!("milestone {} is {} and immutable", milestone.id, stored.status);
        }
        if stored.status != milestone.status && !stored.status.can_transition_to(milestone.status) {
            bail!(
                "milestone {} cannot move {} -> {}",
                milestone.id,
                stored.status,
                milestone.status
            );
        }
        if stored.task_id != milestone.task_id || stored.sequence != milestone.sequence {
            bail!("milestone {} cannot change task or sequence", milestone.id);
        }
        *stored = milestone.clone();
        Ok(())
    }

    pub(crate) fn next_interaction_id(&mut self) -> u64 {
        let id = self.next_interaction_id;
        self.next_interaction_id += 1;
        id
    }
}

/// In-process store guarded by a mutex.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    interactions: Mutex<Vec<InteractionRecord>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
            interactions: Mutex::new(Vec::new()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("store mutex poisoned"))?;
        f(&mut state)
    }

    fn with_interactions<T>(
        &self,
        f: impl FnOnce(&mut Vec<InteractionRecord>) -> Result<T>,
    ) -> Result<T> {
        let mut records = self
            .interactions
            .lock()
            .map_err(|_| anyhow!("interaction log mutex poisoned"))?;
        f(&mut records)
    }
}

impl Store for MemoryStore {
    fn create_task(&self, new: NewTask) -> Result<Task> {
        self.with_state(|state| Ok(state.create_task(new, Utc::now())))
    }

    fn get_task(&self, id: u64) -> Result<Task> {
        self.with_state(|state| state.task(id).cloned())
    }

    fn update_task(&self, task: &Task) -> Result<()> {
        self.with_state(|state| state.update_task(task))
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.with_state(|state| Ok(state.list_tasks(status)))
    }

    fn claimable_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        include_locked: bool,
    ) -> Result<Vec<Task>> {
        self.with_state(|state| Ok(state.claimable_tasks(now, limit, include_locked)))
    }

    fn try_lock_task(
        &self,
        id: u64,
        worker: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        self.with_state(|state| state.try_lock_task(id, worker, now, ttl))
    }

    fn release_task_lock(&self, id: u64, worker: &str, now: DateTime<Utc>) -> Result<bool> {
        self.with_state(|state| state.release_task_lock(id, worker, now))
    }

    fn create_milestone(&self, new: NewMilestone) -> Result<Milestone> {
        self.with_state(|state| state.create_milestone(new, Utc::now()))
    }

    fn get_milestone(&self, id: u64) -> Result<Milestone> {
        self.with_state(|state| state.milestone(id).cloned())
    }

    fn milestones_for_task(&self, task_id: u64) -> Result<Vec<Milestone>> {
        self.with_state(|state| Ok(state.milestones_for_task(task_id)))
    }

    fn update_milestone(&self, milestone: &Milestone) -> Result<()> {
        self.with_state(|state| state.update_milestone(milestone))
    }

    fn append_interaction(&self, mut record: InteractionRecord) -> Result<u64> {
        let id = self.with_state(|state| Ok(state.next_interaction_id()))?;
        record.id = id;
        self.with_interactions(|records| {
            records.push(record);
            Ok(id)
        })
    }

    fn interactions(&self, task_id: Option<u64>) -> Result<Vec<InteractionRecord>> {
        self.with_interactions(|records| {
            Ok(records
                .iter()
                .filter(|r| task_id.is_none() || r.task_id == task_id)
                .cloned()
                .collect())
        })
    }

    fn prune_interactions(&self, cutoff: DateTime<Utc>, dry_run: bool) -> Result<usize> {
        self.with_interactions(|records| {
            let stale = records.iter().filter(|r| r.created_at < cutoff).count();
            if !dry_run {
                records.retain(|r| r.created_at >= cutoff);
            }
            Ok(stale)
        })
    }
}
