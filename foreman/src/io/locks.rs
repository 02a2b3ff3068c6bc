//! Short-lived, non-blocking exclusive locks keyed by string.
//!
//! Acquisition is try-once: a held lock is reported as contention and the
//! caller moves on. Every lock carries an owner and an expiry, so a crashed
//! holder never blocks progress past its TTL.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lock backend shared by all workers that must exclude each other.
pub trait LockManager: Send + Sync {
    /// Try once. `Ok(false)` when another owner holds an unexpired lock.
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Push the expiry of a lock `owner` still holds to `now + ttl`.
    /// `Ok(false)` when the lock was lost.
    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Release if `owner` still holds the lock.
    fn release(&self, key: &str, owner: &str) -> Result<()>;
}

/// Held lock, released on drop.
pub struct LockGuard<'a> {
    locks: &'a dyn LockManager,
    key: String,
    owner: String,
    ttl: Duration,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Extend the lease by another TTL.
    pub fn renew(&self) -> Result<bool> {
        self.locks.renew(&self.key, &self.owner, self.ttl)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.locks.release(&self.key, &self.owner) {
            Ok(()) => debug!(key = %self.key, "lock released"),
            Err(err) => warn!(key = %self.key, err = %format!("{err:#}"), "failed to release lock"),
        }
    }
}

/// Acquire `key` for `owner`, returning `None` on contention.
pub fn try_lock<'a>(
    locks: &'a dyn LockManager,
    key: &str,
    owner: &str,
    ttl: Duration,
) -> Result<Option<LockGuard<'a>>> {
    if !locks.try_acquire(key, owner, ttl)? {
        return Ok(None);
    }
    debug!(key, owner, ttl_secs = ttl.as_secs(), "lock acquired");
    Ok(Some(LockGuard {
        locks,
        key: key.to_string(),
        owner: owner.to_string(),
        ttl,
    }))
}

/// In-process locks.
#[derive(Debug, Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockManager for MemoryLocks {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().map_err(|_| anyhow!("lock table poisoned"))?;
        let now = Instant::now();
        if let Some((_, expires)) = held.get(key)
            && *expires > now
        {
            return Ok(false);
        }
        held.insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().map_err(|_| anyhow!("lock table poisoned"))?;
        match held.get_mut(key) {
            Some((holder, expires)) if holder == owner => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut held = self.held.lock().map_err(|_| anyhow!("lock table poisoned"))?;
        if held.get(key).is_some_and(|(holder, _)| holder == owner) {
            held.remove(key);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    owner: String,
    expires_at: DateTime<Utc>,
}

const GUARD_FILE: &str = ".guard";

/// Cross-process locks: one JSON record per key in a directory.
///
/// Every read-check-write runs under an exclusive OS lock on `.guard`, so
/// deciding that a record is absent or expired and replacing it is one step
/// for all processes and threads sharing the directory. Records are written
/// to a temp file and renamed into place, so a reader never sees a partial
/// record.
#[derive(Debug, Clone)]
pub struct FileLocks {
    dir: PathBuf,
}

impl FileLocks {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create lock dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.lock"))
    }

    /// Run `f` while holding the directory guard.
    fn guarded<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let path = self.dir.join(GUARD_FILE);
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        guard
            .lock()
            .with_context(|| format!("lock {}", path.display()))?;
        // Unlocked when `guard` is dropped.
        f()
    }

    fn read(path: &Path) -> Result<Option<LockFile>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read lock {}", path.display())),
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                // Written by something else; treat as expired.
                warn!(path = %path.display(), err = %err, "unreadable lock record");
                Ok(None)
            }
        }
    }

    fn write(path: &Path, owner: &str, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).context("lock ttl out of range")?;
        let record = LockFile {
            owner: owner.to_string(),
            expires_at: Utc::now() + ttl,
        };
        let payload = serde_json::to_string(&record).context("serialize lock")?;
        let tmp = path.with_extension("lock.tmp");
        fs::write(&tmp, payload).with_context(|| format!("write lock {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("install lock {}", path.display()))
    }
}

impl LockManager for FileLocks {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let path = self.path_for(key);
        self.guarded(|| {
            if let Some(existing) = Self::read(&path)? {
                if existing.expires_at > Utc::now() {
                    return Ok(false);
                }
                warn!(key, previous_owner = %existing.owner, "reclaiming expired lock");
            }
            Self::write(&path, owner, ttl)?;
            Ok(true)
        })
    }

    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let path = self.path_for(key);
        self.guarded(|| match Self::read(&path)? {
            Some(existing) if existing.owner == owner => {
                Self::write(&path, owner, ttl)?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        let path = self.path_for(key);
        self.guarded(|| match Self::read(&path)? {
            Some(existing) if existing.owner == owner => fs::remove_file(&path)
                .with_context(|| format!("remove lock {}", path.display())),
            _ => Ok(()),
        })
    }
}
