//! Point-in-time copy of a workspace tree.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    pub dir: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

/// Copy regular files under `src` into `dest`, which must not exist yet.
///
/// Directories named in `exclude_names` and anything under `skip` (for
/// example the state directory that holds `dest`) are left out. Symlinks are
/// not followed or copied.
#[instrument(skip_all, fields(src = %src.display(), dest = %dest.display()))]
pub fn snapshot_tree(
    src: &Path,
    dest: &Path,
    exclude_names: &[String],
    skip: &[&Path],
) -> Result<SnapshotReport> {
    if dest.exists() {
        bail!("snapshot target {} already exists", dest.display());
    }
    let src = src
        .canonicalize()
        .with_context(|| format!("canonicalize {}", src.display()))?;
    let skip: Vec<PathBuf> = skip
        .iter()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
        .collect();
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;

    let mut report = SnapshotReport {
        dir: dest.to_path_buf(),
        files: 0,
        bytes: 0,
    };
    let walker = WalkDir::new(&src).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 {
            return true;
        }
        if skip.iter().any(|s| entry.path().starts_with(s)) {
            return false;
        }
        !entry.file_type().is_dir()
            || !entry
                .file_name()
                .to_str()
                .is_some_and(|name| exclude_names.iter().any(|ex| ex == name))
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&src) else {
            continue;
        };
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let copied = fs::copy(entry.path(), &target)
            .with_context(|| format!("copy {}", entry.path().display()))?;
        debug!(file = %rel.display(), bytes = copied, "snapshot file");
        report.files += 1;
        report.bytes += copied;
    }
    info!(files = report.files, bytes = report.bytes, "snapshot written");
    Ok(report)
}
