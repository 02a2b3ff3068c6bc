//! Milestone Execution Engine.
//!
//! Drives one claimed task: plan via the `pm` role, materialize milestones,
//! run them strictly in sequence under per-milestone locks, then validate
//! with the project's tests. Any error forces the task to `failed`, clears
//! its lock, and is returned to the caller.

pub mod actions;
pub mod handlers;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::plan::{MilestoneDraft, default_plan};
use crate::core::plan_parser::parse_milestones;
use crate::core::role::AgentRole;
use crate::core::status::{MilestoneStatus, TaskStatus};
use crate::core::types::{Milestone, NewMilestone, Task, TaskType};
use crate::error::{CollaboratorError, EngineError};
use crate::gateway::{AgentContext, Gateway};
use crate::io::command_runner::{CommandRunner, TestRun};
use crate::io::config::ForemanConfig;
use crate::io::file_patcher::FilePatcher;
use crate::io::llm::ChatClient;
use crate::io::locks::{LockGuard, LockManager, try_lock};
use crate::io::prompt::{PromptEngine, PromptSection};
use crate::io::snapshot::snapshot_tree;
use crate::io::store::Store;
use crate::io::vcs::{self, VersionControl};

/// How a processing pass ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// A milestone lock was held elsewhere; the pass stopped before it.
    Deferred { milestone_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub milestone_lock_ttl: Duration,
    /// Replaces the per-type budget when set.
    pub execution_budget: Option<Duration>,
    pub upgrade_backup: Option<BackupSettings>,
}

/// Where upgrade tasks snapshot the workspace before planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSettings {
    pub dir: PathBuf,
    pub exclude: Vec<String>,
    /// Never copied, so a state directory inside the workspace stays out.
    pub state_dir: PathBuf,
}

impl EngineSettings {
    pub fn from_config(cfg: &ForemanConfig) -> Self {
        Self {
            milestone_lock_ttl: cfg.locks.milestone_ttl(),
            execution_budget: cfg.engine.execution_budget(),
            upgrade_backup: cfg.engine.backup_upgrades.then(|| BackupSettings {
                dir: cfg.state_dir.join("backups"),
                exclude: cfg.engine.backup_exclude.clone(),
                state_dir: cfg.state_dir.clone(),
            }),
        }
    }

    fn budget_for(&self, task_type: TaskType) -> Duration {
        self.execution_budget.unwrap_or_else(|| task_type.execution_budget())
    }
}

const MIN_HEARTBEAT: Duration = Duration::from_millis(50);

/// Run `f` while a scoped thread renews `guard` every third of its TTL, so a
/// handler that outlives one TTL keeps its milestone.
fn with_heartbeat<T>(guard: &LockGuard<'_>, f: impl FnOnce() -> T) -> T {
    let interval = (guard.ttl() / 3).max(MIN_HEARTBEAT);
    let (stop, stopped) = mpsc::channel::<()>();
    thread::scope(|scope| {
        scope.spawn(move || {
            while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                match guard.renew() {
                    Ok(true) => debug!(key = guard.key(), "lock renewed"),
                    Ok(false) => {
                        warn!(key = guard.key(), "lock lost while the milestone was running");
                        return;
                    }
                    Err(err) => {
                        warn!(key = guard.key(), err = %format!("{err:#}"), "lock renewal failed");
                    }
                }
            }
        });
        let out = f();
        drop(stop);
        out
    })
}

enum Step {
    Done,
    Deferred,
}

pub struct Engine {
    store: Arc<dyn Store>,
    gateway: Gateway,
    files: FilePatcher,
    commands: CommandRunner,
    locks: Arc<dyn LockManager>,
    vcs: Box<dyn VersionControl>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Gateway,
        files: FilePatcher,
        commands: CommandRunner,
        locks: Arc<dyn LockManager>,
        vcs: Box<dyn VersionControl>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            files,
            commands,
            locks,
            vcs,
            settings,
        }
    }

    /// Wire the sandbox, prompts, gateway and VCS hook from configuration.
    pub fn from_config(
        cfg: &ForemanConfig,
        store: Arc<dyn Store>,
        client: Arc<dyn ChatClient>,
        locks: Arc<dyn LockManager>,
    ) -> Result<Self> {
        let files = FilePatcher::from_config(&cfg.workspace)?;
        let commands = CommandRunner::new(&cfg.commands, files.root(), &cfg.workspace.allowed_roots)?;
        let prompts = PromptEngine::new(&files.root().display().to_string(), &cfg.commands.allowed)?;
        let gateway = Gateway::new(client, Arc::clone(&store), prompts, &cfg.llm);
        let vcs = vcs::from_config(&cfg.vcs, files.root());
        Ok(Self::new(
            store,
            gateway,
            files,
            commands,
            locks,
            vcs,
            EngineSettings::from_config(cfg),
        ))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Process a task claimed by `worker_id`.
    #[instrument(skip_all, fields(task_id = task_id, worker_id = %worker_id))]
    pub fn process_task(&self, task_id: u64, worker_id: &str) -> Result<TaskOutcome, EngineError> {
        let run_id = format!("task{task_id}-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        match self.run_task(task_id, worker_id, &run_id) {
            Ok(TaskOutcome::Completed) => Ok(TaskOutcome::Completed),
            Ok(TaskOutcome::Deferred { milestone_id }) => {
                self.store.release_task_lock(task_id, worker_id, Utc::now())?;
                Ok(TaskOutcome::Deferred { milestone_id })
            }
            Err(err) => {
                self.force_fail(task_id, &err);
                Err(err)
            }
        }
    }

    fn run_task(
        &self,
        task_id: u64,
        worker_id: &str,
        run_id: &str,
    ) -> Result<TaskOutcome, EngineError> {
        let started = Instant::now();
        let mut task = self.store.get_task(task_id)?;
        let budget = self.settings.budget_for(task.task_type);
        let deadline = started + budget;

        if task.status != TaskStatus::InProgress {
            task.transition_to(TaskStatus::InProgress, Utc::now())?;
            self.store.update_task(&task)?;
        }
        info!(run_id, title = %task.title, "task started");

        let existing = self.store.milestones_for_task(task_id)?;
        if needs_plan(&existing) {
            if task.task_type == TaskType::Upgrade {
                self.back_up_workspace(&task, run_id)?;
            }
            self.plan_task(&task, &existing, run_id)?;
        }

        let open: Vec<Milestone> = self
            .store
            .milestones_for_task(task_id)?
            .into_iter()
            .filter(|m| matches!(m.status, MilestoneStatus::Pending | MilestoneStatus::InProgress))
            .collect();
        for milestone in open {
            if remaining_budget(deadline).is_none() {
                return Err(EngineError::DeadlineExceeded {
                    task_id,
                    budget_secs: budget.as_secs(),
                });
            }
            match self.run_milestone(&task, &milestone, worker_id, run_id)? {
                Step::Done => {}
                Step::Deferred => {
                    return Ok(TaskOutcome::Deferred {
                        milestone_id: milestone.id,
                    });
                }
            }
        }

        self.validate()?;

        let now = Utc::now();
        let mut task = self.store.get_task(task_id)?;
        task.transition_to(TaskStatus::Completed, now)?;
        task.unlock(now);
        task.last_error = None;
        self.store.update_task(&task)?;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "task completed");
        Ok(TaskOutcome::Completed)
    }

    /// Copy the workspace aside before an upgrade touches it. A failed backup
    /// fails the task before any milestone runs.
    fn back_up_workspace(&self, task: &Task, run_id: &str) -> Result<(), EngineError> {
        let Some(backup) = &self.settings.upgrade_backup else {
            return Ok(());
        };
        let dest = backup.dir.join(format!("upgrade-{}-{run_id}", task.id));
        let report = snapshot_tree(
            self.files.root(),
            &dest,
            &backup.exclude,
            &[backup.state_dir.as_path()],
        )
        .map_err(|err| EngineError::BackupFailed(format!("{err:#}")))?;
        info!(dir = %report.dir.display(), files = report.files, "workspace backed up");
        Ok(())
    }

    /// Ask the planner for milestones and append them after any existing ones.
    ///
    /// An empty or unparseable plan falls back to [`default_plan`].
    #[instrument(skip_all, fields(task_id = task.id))]
    pub fn plan_task(
        &self,
        task: &Task,
        existing: &[Milestone],
        run_id: &str,
    ) -> Result<Vec<Milestone>, EngineError> {
        let mut sections = vec![handlers::task_section(task)];
        if !existing.is_empty() {
            let history = existing
                .iter()
                .map(|m| {
                    format!(
                        "{}. {} [{}] {}{}",
                        m.sequence,
                        m.title,
                        m.agent_role,
                        m.status,
                        m.failure_reason
                            .as_deref()
                            .map(|r| format!(": {r}"))
                            .unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(PromptSection::droppable("previous_attempt", history));
        }
        let ctx = AgentContext {
            run_id: run_id.to_string(),
            task_id: Some(task.id),
            milestone_id: None,
            sections,
        };

        let drafts = match self.gateway.execute(AgentRole::Pm, &ctx) {
            Ok(result) => parse_milestones(&result.raw_text).unwrap_or_else(|err| {
                warn!(err = %err, "planner returned no milestones; using default plan");
                default_plan()
            }),
            Err(EngineError::Collaborator(CollaboratorError::EmptyResponse)) => {
                warn!("planner returned an empty reply; using default plan");
                default_plan()
            }
            Err(err) => return Err(err),
        };
        self.materialize_plan(task.id, existing, drafts)
    }

    fn materialize_plan(
        &self,
        task_id: u64,
        existing: &[Milestone],
        drafts: Vec<MilestoneDraft>,
    ) -> Result<Vec<Milestone>, EngineError> {
        let base = existing.iter().map(|m| m.sequence).max().unwrap_or(0);
        let mut created = Vec::with_capacity(drafts.len());
        for (offset, draft) in (1..).zip(drafts) {
            let milestone = self.store.create_milestone(NewMilestone {
                task_id,
                sequence: base + offset,
                title: draft.title,
                description: draft.description,
                agent_role: draft.agent_role,
                input_data: draft.input_data,
                metadata: draft.metadata,
            })?;
            created.push(milestone);
        }
        info!(
            milestones = created.len(),
            roles = %created.iter().map(|m| m.agent_role.as_str()).collect::<Vec<_>>().join(","),
            "plan materialized"
        );
        Ok(created)
    }

    #[instrument(skip_all, fields(milestone_id = milestone.id, sequence = milestone.sequence, role = %milestone.agent_role))]
    fn run_milestone(
        &self,
        task: &Task,
        milestone: &Milestone,
        worker_id: &str,
        run_id: &str,
    ) -> Result<Step, EngineError> {
        let key = format!("milestone:{}", milestone.id);
        let Some(guard) = try_lock(
            self.locks.as_ref(),
            &key,
            worker_id,
            self.settings.milestone_lock_ttl,
        )?
        else {
            let contention = EngineError::LockContention { key };
            warn!(err = %contention, "deferring milestone");
            return Ok(Step::Deferred);
        };

        let mut current = self.store.get_milestone(milestone.id)?;
        match current.status {
            MilestoneStatus::Pending => {}
            MilestoneStatus::Completed => return Ok(Step::Done),
            MilestoneStatus::InProgress => {
                return Err(self.fail_milestone(&mut current, "abandoned by a previous worker")?);
            }
            MilestoneStatus::Failed | MilestoneStatus::Skipped => {
                let reason = current
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| format!("milestone is {}", current.status));
                return Err(EngineError::MilestoneExecutionFailed {
                    milestone_id: current.id,
                    sequence: current.sequence,
                    reason,
                });
            }
        }

        current.start(Utc::now())?;
        self.store.update_milestone(&current)?;
        info!("milestone started");

        let previous: Vec<Milestone> = self
            .store
            .milestones_for_task(task.id)?
            .into_iter()
            .filter(|m| m.sequence < current.sequence && m.status == MilestoneStatus::Completed)
            .collect();

        match with_heartbeat(&guard, || self.handle(task, &current, &previous, run_id)) {
            Ok(output) => {
                current.complete(output, Utc::now())?;
                self.store.update_milestone(&current)?;
                info!("milestone completed");
                if let Err(err) = self.vcs.milestone_completed(task, &current) {
                    warn!(err = %format!("{err:#}"), "version control hook failed");
                }
                Ok(Step::Done)
            }
            Err(err) if err.is_storage() => Err(err),
            Err(err) => {
                let reason = match &err {
                    EngineError::MilestoneExecutionFailed { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                Err(self.fail_milestone(&mut current, &reason)?)
            }
        }
    }

    /// Mark `milestone` failed and skip everything after it. Returns the
    /// error to propagate.
    fn fail_milestone(
        &self,
        milestone: &mut Milestone,
        reason: &str,
    ) -> Result<EngineError, EngineError> {
        let now = Utc::now();
        milestone.fail(reason, now)?;
        self.store.update_milestone(milestone)?;
        error!(milestone_id = milestone.id, reason, "milestone failed");

        let mut skipped = 0usize;
        for mut later in self.store.milestones_for_task(milestone.task_id)? {
            if later.sequence > milestone.sequence && later.status == MilestoneStatus::Pending {
                later.skip(now)?;
                self.store.update_milestone(&later)?;
                skipped += 1;
            }
        }
        if skipped > 0 {
            info!(skipped, "remaining milestones skipped");
        }
        Ok(EngineError::MilestoneExecutionFailed {
            milestone_id: milestone.id,
            sequence: milestone.sequence,
            reason: reason.to_string(),
        })
    }

    /// Final pass: project tests must pass or be absent.
    fn validate(&self) -> Result<(), EngineError> {
        match self.commands.run_tests(None)? {
            TestRun::Passed { runner, .. } => {
                info!(runner, "final validation passed");
                Ok(())
            }
            TestRun::Skipped { reason } => {
                info!(reason, "final validation skipped");
                Ok(())
            }
            TestRun::Failed { runner, result } => Err(EngineError::ValidationFailed(format!(
                "{runner} exited with {}",
                result
                    .exit_code
                    .map_or_else(|| "no status".to_string(), |c| c.to_string())
            ))),
        }
    }

    /// Best effort: record the error, move to `failed` where legal, unlock.
    fn force_fail(&self, task_id: u64, err: &EngineError) {
        let result = (|| -> Result<()> {
            let now = Utc::now();
            let mut task = self.store.get_task(task_id)?;
            if task.status.can_transition_to(TaskStatus::Failed) {
                task.transition_to(TaskStatus::Failed, now)?;
            }
            task.last_error = Some(err.to_string());
            task.unlock(now);
            self.store.update_task(&task)
        })();
        match result {
            Ok(()) => error!(task_id, err = %err, "task failed"),
            Err(store_err) => error!(
                task_id,
                err = %err,
                store_err = %format!("{store_err:#}"),
                "task failed and could not be marked"
            ),
        }
    }
}

/// Plan when nothing is left to run and the task is not already finished:
/// a fresh task, or one whose previous attempt failed.
fn needs_plan(existing: &[Milestone]) -> bool {
    let open = existing
        .iter()
        .any(|m| matches!(m.status, MilestoneStatus::Pending | MilestoneStatus::InProgress));
    let all_completed = !existing.is_empty()
        && existing
            .iter()
            .all(|m| m.status == MilestoneStatus::Completed);
    !open && !all_completed
}
