//! Task Dispatcher: claim pending tasks and run each on its own worker thread.
//!
//! Claiming is compare-and-set on the task lock; a task locked by someone
//! else is skipped, never waited on. `force` takes over live locks and is
//! only used when explicitly requested.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::core::status::TaskStatus;
use crate::engine::{Engine, TaskOutcome};
use crate::io::store::Store;

/// Default worker identity: host plus process id.
pub fn worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "local".to_string());
    format!("worker-{host}-{}", std::process::id())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    pub limit: usize,
    /// Take over tasks whose lock is still live.
    pub force: bool,
}

/// How one job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobResult {
    Completed,
    Deferred { milestone_id: u64 },
    Failed { error: String, requeued: bool },
    /// The worker thread panicked.
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub task_id: u64,
    #[serde(flatten)]
    pub result: JobResult,
}

/// Jobs started by one dispatch pass.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub claimed: Vec<u64>,
    /// Selected but lost the claim to another worker.
    pub skipped: Vec<u64>,
    jobs: Vec<(u64, JoinHandle<JobResult>)>,
}

impl Dispatch {
    /// Block until every job of this pass has finished.
    pub fn wait(self) -> Vec<JobReport> {
        self.jobs
            .into_iter()
            .map(|(task_id, handle)| {
                let result = handle.join().unwrap_or_else(|_| {
                    error!(task_id, "worker thread panicked");
                    JobResult::Crashed
                });
                JobReport { task_id, result }
            })
            .collect()
    }
}

pub struct Dispatcher {
    engine: Arc<Engine>,
    store: Arc<dyn Store>,
    worker_id: String,
    task_lock_ttl: Duration,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, worker_id: String, task_lock_ttl: Duration) -> Self {
        let store = Arc::clone(engine.store());
        Self {
            engine,
            store,
            worker_id,
            task_lock_ttl,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim up to `limit` tasks and hand each to the engine on a new thread.
    #[instrument(skip_all, fields(worker_id = %self.worker_id, limit = opts.limit, force = opts.force))]
    pub fn dispatch(&self, opts: DispatchOptions) -> Result<Dispatch> {
        let now = Utc::now();
        let candidates = self
            .store
            .claimable_tasks(now, opts.limit, opts.force)
            .context("select claimable tasks")?;
        let mut dispatch = Dispatch::default();
        for task in candidates {
            let claimed = if opts.force && task.is_locked(now) {
                self.take_over(task.id, now)?
            } else {
                self.store
                    .try_lock_task(task.id, &self.worker_id, now, self.task_lock_ttl)
                    .with_context(|| format!("lock task {}", task.id))?
            };
            if !claimed {
                info!(task_id = task.id, "task claimed by another worker; skipping");
                dispatch.skipped.push(task.id);
                continue;
            }
            info!(task_id = task.id, title = %task.title, "task claimed");
            dispatch.claimed.push(task.id);
            dispatch.jobs.push((task.id, self.spawn(task.id)?));
        }
        if dispatch.claimed.is_empty() {
            info!("no tasks to dispatch");
        }
        Ok(dispatch)
    }

    fn take_over(&self, task_id: u64, now: DateTime<Utc>) -> Result<bool> {
        let mut task = self.store.get_task(task_id)?;
        warn!(
            task_id,
            previous_owner = task.locked_by.as_deref().unwrap_or(""),
            "forcing takeover of a live task lock"
        );
        task.unlock(now);
        if !task.try_lock(&self.worker_id, now, self.task_lock_ttl) {
            return Ok(false);
        }
        self.store.update_task(&task)?;
        Ok(true)
    }

    fn spawn(&self, task_id: u64) -> Result<JoinHandle<JobResult>> {
        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let worker_id = self.worker_id.clone();
        thread::Builder::new()
            .name(format!("task-{task_id}"))
            .spawn(move || run_job(&engine, store.as_ref(), task_id, &worker_id))
            .with_context(|| format!("spawn worker for task {task_id}"))
    }
}

fn run_job(engine: &Engine, store: &dyn Store, task_id: u64, worker_id: &str) -> JobResult {
    match engine.process_task(task_id, worker_id) {
        Ok(TaskOutcome::Completed) => JobResult::Completed,
        Ok(TaskOutcome::Deferred { milestone_id }) => JobResult::Deferred { milestone_id },
        Err(err) => {
            let requeued = match apply_retry_policy(store, task_id) {
                Ok(requeued) => requeued,
                Err(policy_err) => {
                    error!(task_id, err = %format!("{policy_err:#}"), "retry policy failed");
                    false
                }
            };
            JobResult::Failed {
                error: err.to_string(),
                requeued,
            }
        }
    }
}

/// Count the failed attempt and requeue while attempts remain.
pub fn apply_retry_policy(store: &dyn Store, task_id: u64) -> Result<bool> {
    let now = Utc::now();
    let mut task = store.get_task(task_id)?;
    task.attempts += 1;
    let max = task.task_type.max_attempts();
    let requeue = task.status == TaskStatus::Failed && task.attempts < max;
    if requeue {
        task.transition_to(TaskStatus::Pending, now)?;
        task.unlock(now);
        info!(task_id, attempts = task.attempts, max_attempts = max, "task requeued");
    } else {
        warn!(task_id, attempts = task.attempts, max_attempts = max, "task stays failed");
    }
    store.update_task(&task)?;
    Ok(requeue)
}

/// Dispatch every `interval` until `passes` runs out (forever when `None`).
pub fn work_loop(
    dispatcher: &Dispatcher,
    opts: DispatchOptions,
    interval: Duration,
    passes: Option<u32>,
    mut on_pass: impl FnMut(&[JobReport]),
) -> Result<()> {
    let mut done = 0u32;
    loop {
        let reports = dispatcher.dispatch(opts)?.wait();
        on_pass(&reports);
        done += 1;
        if passes.is_some_and(|limit| done >= limit) {
            return Ok(());
        }
        thread::sleep(interval);
    }
}
