//! File-backed [`Store`]: one JSON document plus an append-only JSONL log.
//!
//! Layout under the state directory:
//!
//! - `state.json`: tasks and milestones, schema-checked on every load and
//!   rewritten atomically (temp file + rename) on every mutation.
//! - `interactions.jsonl`: one [`InteractionRecord`] per line.
//! - `state.lock`: exclusive OS file lock held for the duration of a
//!   read-modify-write, so several worker processes can share the directory.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::invariants::validate_milestone_order;
use crate::core::status::TaskStatus;
use crate::core::types::{InteractionRecord, Milestone, NewMilestone, NewTask, Task};
use crate::io::store::{Store, StoreState};

const STATE_SCHEMA: &str = include_str!("../../schemas/store.v1.schema.json");
const STATE_FILE: &str = "state.json";
const INTERACTIONS_FILE: &str = "interactions.jsonl";
const LOCK_FILE: &str = "state.lock";

const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(10);

pub struct JsonFileStore {
    dir: PathBuf,
    guard: Mutex<()>,
    validator: Validator,
}

impl std::fmt::Debug for JsonFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileStore").field("dir", &self.dir).finish()
    }
}

impl JsonFileStore {
    /// Open (or initialize) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create state dir {}", dir.display()))?;
        let schema: Value = serde_json::from_str(STATE_SCHEMA).context("parse state schema")?;
        let validator = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
        let store = Self {
            dir: dir.to_path_buf(),
            guard: Mutex::new(()),
            validator,
        };
        if !store.state_path().exists() {
            store.mutate(|_| Ok(()))?;
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn interactions_path(&self) -> PathBuf {
        self.dir.join(INTERACTIONS_FILE)
    }

    fn load(&self) -> Result<StoreState> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(StoreState::new());
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let value: Value =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        if !self.validator.is_valid(&value) {
            let messages = self
                .validator
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(anyhow!(
                "{} failed schema validation:\n- {}",
                path.display(),
                messages.join("\n- ")
            ));
        }
        let state: StoreState = serde_json::from_value(value)
            .with_context(|| format!("decode {}", path.display()))?;
        let mut ordered: Vec<Milestone> = state.milestones.values().cloned().collect();
        ordered.sort_by_key(|m| (m.task_id, m.id));
        let errors = validate_milestone_order(&ordered);
        if !errors.is_empty() {
            bail!("invariant violations:\n- {}", errors.join("\n- "));
        }
        Ok(state)
    }

    fn write(&self, state: &StoreState) -> Result<()> {
        let mut payload = serde_json::to_string_pretty(state).context("serialize state")?;
        payload.push('\n');
        write_atomic(&self.state_path(), &payload)
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> Result<T>) -> Result<T> {
        let _local = self.guard.lock().map_err(|_| anyhow!("store mutex poisoned"))?;
        let state = self.load()?;
        f(&state)
    }

    /// Read-modify-write under both the in-process mutex and the lock file.
    /// The state is only written back when `f` succeeds.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let _local = self.guard.lock().map_err(|_| anyhow!("store mutex poisoned"))?;
        let _file = StateFileLock::acquire(&self.dir.join(LOCK_FILE))?;
        let mut state = self.load()?;
        let out = f(&mut state)?;
        self.write(&state)?;
        Ok(out)
    }

    fn read_interactions(&self) -> Result<Vec<InteractionRecord>> {
        let path = self.interactions_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<InteractionRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(line = line_no + 1, err = %err, "skipping unreadable interaction"),
            }
        }
        Ok(records)
    }
}

impl Store for JsonFileStore {
    fn create_task(&self, new: NewTask) -> Result<Task> {
        self.mutate(|state| Ok(state.create_task(new, Utc::now())))
    }

    fn get_task(&self, id: u64) -> Result<Task> {
        self.read(|state| state.task(id).cloned())
    }

    fn update_task(&self, task: &Task) -> Result<()> {
        self.mutate(|state| state.update_task(task))
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.read(|state| Ok(state.list_tasks(status)))
    }

    fn claimable_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        include_locked: bool,
    ) -> Result<Vec<Task>> {
        self.read(|state| Ok(state.claimable_tasks(now, limit, include_locked)))
    }

    fn try_lock_task(
        &self,
        id: u64,
        worker: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        self.mutate(|state| state.try_lock_task(id, worker, now, ttl))
    }

    fn release_task_lock(&self, id: u64, worker: &str, now: DateTime<Utc>) -> Result<bool> {
        self.mutate(|state| state.release_task_lock(id, worker, now))
    }

    fn create_milestone(&self, new: NewMilestone) -> Result<Milestone> {
        self.mutate(|state| state.create_milestone(new, Utc::now()))
    }

    fn get_milestone(&self, id: u64) -> Result<Milestone> {
        self.read(|state| state.milestone(id).cloned())
    }

    fn milestones_for_task(&self, task_id: u64) -> Result<Vec<Milestone>> {
        self.read(|state| Ok(state.milestones_for_task(task_id)))
    }

    fn update_milestone(&self, milestone: &Milestone) -> Result<()> {
        self.mutate(|state| state.update_milestone(milestone))
    }

    fn append_interaction(&self, mut record: InteractionRecord) -> Result<u64> {
        let path = self.interactions_path();
        self.mutate(|state| {
            record.id = state.next_interaction_id();
            let mut line = serde_json::to_string(&record).context("serialize interaction")?;
            line.push('\n');
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            file.write_all(line.as_bytes())
                .with_context(|| format!("append {}", path.display()))?;
            Ok(record.id)
        })
    }

    fn interactions(&self, task_id: Option<u64>) -> Result<Vec<InteractionRecord>> {
        let _local = self.guard.lock().map_err(|_| anyhow!("store mutex poisoned"))?;
        let records = self.read_interactions()?;
        Ok(records
            .into_iter()
            .filter(|r| task_id.is_none() || r.task_id == task_id)
            .collect())
    }

    fn prune_interactions(&self, cutoff: DateTime<Utc>, dry_run: bool) -> Result<usize> {
        let _local = self.guard.lock().map_err(|_| anyhow!("store mutex poisoned"))?;
        let _file = StateFileLock::acquire(&self.dir.join(LOCK_FILE))?;
        let records = self.read_interactions()?;
        let (stale, kept): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.created_at < cutoff);
        if !dry_run && !stale.is_empty() {
            let mut payload = String::new();
            for record in &kept {
                payload.push_str(&serde_json::to_string(record).context("serialize interaction")?);
                payload.push('\n');
            }
            write_atomic(&self.interactions_path(), &payload)?;
            debug!(removed = stale.len(), kept = kept.len(), "pruned interactions");
        }
        Ok(stale.len())
    }
}

/// Exclusive OS lock on `state.lock`, held for one read-modify-write.
///
/// The file itself is never removed; the kernel drops the lock when the
/// handle closes, including when the holding process dies.
struct StateFileLock {
    _file: File,
}

impl StateFileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock {}", path.display()))?;
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(Self { _file: file }),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        bail!("timed out waiting for state lock {}", path.display());
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(TryLockError::Error(err)) => {
                    return Err(err).with_context(|| format!("lock {}", path.display()));
                }
            }
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
