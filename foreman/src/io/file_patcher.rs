//! Workspace-confined file operations.
//!
//! Every path handed to [`FilePatcher`] is relative to the workspace root.
//! Absolute paths and `..` components are rejected before any filesystem
//! call; the nearest existing ancestor is then canonicalized so a symlink
//! cannot lead outside the root either.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::patch::{EditOutcome, apply_edits};
use crate::core::plan::PatchEdit;
use crate::error::SandboxError;
use crate::io::config::WorkspaceConfig;

/// Directories never descended into when listing files.
const SKIPPED_DIRS: [&str; 4] = [".git", "node_modules", "vendor", "target"];

/// Outcome of [`FilePatcher::patch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub path: String,
    pub outcomes: Vec<EditOutcome>,
    /// Whether the file was rewritten.
    pub written: bool,
}

impl PatchReport {
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.applied()
    }
}

/// File operations confined to a workspace root.
#[derive(Debug, Clone)]
pub struct FilePatcher {
    root: PathBuf,
    allowed_extensions: Vec<String>,
}

impl FilePatcher {
    /// Create the root if needed and pin its canonical location.
    pub fn new(root: &Path, allowed_extensions: Vec<String>) -> Result<Self, SandboxError> {
        fs::create_dir_all(root)
            .map_err(|e| SandboxError::io("create workspace root", root.display().to_string(), e))?;
        let root = root
            .canonicalize()
            .map_err(|e| SandboxError::io("canonicalize", root.display().to_string(), e))?;
        Ok(Self {
            root,
            allowed_extensions,
        })
    }

    pub fn from_config(cfg: &WorkspaceConfig) -> Result<Self, SandboxError> {
        Self::new(&cfg.root, cfg.allowed_extensions.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a workspace-relative path to an absolute path under the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, SandboxError> {
        let traversal = || SandboxError::PathTraversal {
            path: relative.to_string(),
        };

        let rel = Path::new(relative);
        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in rel.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(traversal());
                }
            }
        }
        if depth == 0 || relative.contains('\0') {
            return Err(traversal());
        }

        let anchor = deepest_existing(&resolved);
        // A dangling symlink cannot be canonicalized; treat it as an escape.
        let real = anchor.canonicalize().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => traversal(),
            _ => SandboxError::io("canonicalize", relative, e),
        })?;
        if !real.starts_with(&self.root) {
            warn!(path = relative, real = %real.display(), "path resolves outside workspace");
            return Err(traversal());
        }
        Ok(resolved)
    }

    pub fn exists(&self, relative: &str) -> Result<bool, SandboxError> {
        Ok(self.resolve(relative)?.exists())
    }

    pub fn read(&self, relative: &str) -> Result<String, SandboxError> {
        let path = self.resolve(relative)?;
        if !path.is_file() {
            return Err(SandboxError::NotFound {
                path: relative.to_string(),
            });
        }
        fs::read_to_string(&path).map_err(|e| SandboxError::io("read", relative, e))
    }

    /// Write a file, creating parent directories as needed.
    #[instrument(skip_all, fields(path = relative, bytes = content.len()))]
    pub fn write(&self, relative: &str, content: &str) -> Result<(), SandboxError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SandboxError::io("create dir", relative, e))?;
        }
        fs::write(&path, content).map_err(|e| SandboxError::io("write", relative, e))?;
        debug!("wrote file");
        Ok(())
    }

    pub fn delete(&self, relative: &str) -> Result<(), SandboxError> {
        let path = self.resolve(relative)?;
        if !path.is_file() {
            return Err(SandboxError::NotFound {
                path: relative.to_string(),
            });
        }
        fs::remove_file(&path).map_err(|e| SandboxError::io("delete", relative, e))
    }

    /// Create a directory tree. Returns `false` if it already existed.
    pub fn create_dir(&self, relative: &str) -> Result<bool, SandboxError> {
        let path = self.resolve(relative)?;
        if path.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(&path).map_err(|e| SandboxError::io("create dir", relative, e))?;
        Ok(true)
    }

    pub fn move_file(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if !source.exists() {
            return Err(SandboxError::NotFound {
                path: from.to_string(),
            });
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| SandboxError::io("create dir", to, e))?;
        }
        fs::rename(&source, &target).map_err(|e| SandboxError::io("move", from, e))
    }

    /// List files with an allowed extension, relative to the root, sorted.
    pub fn list_files(&self, under: Option<&str>) -> Result<Vec<String>, SandboxError> {
        let start = match under {
            Some(dir) => self.resolve(dir)?,
            None => self.root.clone(),
        };
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(&start).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name))
        });
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                SandboxError::io("walk", path, e.into())
            })?;
            if !entry.file_type().is_file() || !self.has_allowed_extension(entry.path()) {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                let parts: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(parts.join("/"));
            }
        }
        files.sort();
        Ok(files)
    }

    fn has_allowed_extension(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.allowed_extensions
            .iter()
            .any(|ext| name == ext || name.ends_with(&format!(".{ext}")))
    }

    /// Apply ordered edits to an existing file.
    ///
    /// Each edit reports its own outcome. The file is rewritten only when at
    /// least one edit succeeded and the content changed.
    #[instrument(skip_all, fields(path = relative, edits = edits.len()))]
    pub fn patch(&self, relative: &str, edits: &[PatchEdit]) -> Result<PatchReport, SandboxError> {
        let original = self.read(relative)?;
        let (patched, outcomes) = apply_edits(&original, edits);
        let any_applied = outcomes.iter().any(|o| o.success);
        let written = any_applied && patched != original;
        if written {
            let path = self.resolve(relative)?;
            fs::write(&path, &patched).map_err(|e| SandboxError::io("write", relative, e))?;
        }
        let report = PatchReport {
            path: relative.to_string(),
            outcomes,
            written,
        };
        debug!(
            applied = report.applied(),
            failed = report.failed(),
            written,
            "patched file"
        );
        Ok(report)
    }
}

fn deepest_existing(path: &Path) -> &Path {
    let mut current = path;
    while fs::symlink_metadata(current).is_err() {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}
