//! Retention sweep for interaction records and stale log files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::io::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
    pub interactions: usize,
    pub log_files: Vec<PathBuf>,
}

/// Delete interaction records and `*.log` files older than `days`.
///
/// With `dry_run` nothing is deleted; the report lists what would be.
pub fn sweep(
    store: &dyn Store,
    log_dir: Option<&Path>,
    days: u32,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let cutoff = now - Duration::days(i64::from(days));
    let interactions = store
        .prune_interactions(cutoff, dry_run)
        .context("prune interaction records")?;
    let log_files = match log_dir {
        Some(dir) => sweep_logs(dir, cutoff, dry_run)?,
        None => Vec::new(),
    };
    info!(
        %cutoff,
        dry_run,
        interactions,
        log_files = log_files.len(),
        "retention sweep finished"
    );
    Ok(SweepReport {
        cutoff,
        dry_run,
        interactions,
        log_files,
    })
}

fn sweep_logs(dir: &Path, cutoff: DateTime<Utc>, dry_run: bool) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "log directory missing; nothing to sweep");
        return Ok(Vec::new());
    }
    let cutoff = SystemTime::from(cutoff);
    let mut matched = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "log") {
            continue;
        }
        let modified = entry
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .modified()
            .with_context(|| format!("mtime {}", path.display()))?;
        if modified >= cutoff {
            continue;
        }
        if !dry_run {
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), err = %err, "failed to delete log file");
                continue;
            }
        }
        matched.push(path.to_path_buf());
    }
    matched.sort();
    Ok(matched)
}
