//! Orchestrator configuration stored in `foreman.toml`.
//!
//! Every component receives its settings from an explicit [`ForemanConfig`]
//! at construction time; nothing reads process-wide state.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForemanConfig {
    /// Directory for persisted state, locks and transcripts.
    pub state_dir: PathBuf,
    pub workspace: WorkspaceConfig,
    pub commands: CommandsConfig,
    pub llm: LlmConfig,
    pub locks: LocksConfig,
    pub dispatcher: DispatcherConfig,
    pub retention: RetentionConfig,
    pub vcs: VcsConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root every file operation is confined to.
    pub root: PathBuf,
    /// Extensions listed by file enumeration (suffix match, so `blade.php` works).
    pub allowed_extensions: Vec<String>,
    /// Extra directories commands may run in besides `root`.
    pub allowed_roots: Vec<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("workspace"),
            allowed_extensions: [
                "rs", "toml", "php", "blade.php", "js", "ts", "vue", "json", "yaml", "yml",
                "md", "txt", "css", "scss", "sql", "env.example",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            allowed_roots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsConfig {
    /// Base command names that may run.
    pub allowed: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            allowed: [
                "cargo", "composer", "npm", "npx", "php", "node", "pytest", "python3", "git",
                "ls", "cat", "mkdir",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            timeout_secs: 300,
            output_limit_bytes: 100_000,
        }
    }
}

impl CommandsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// Collaborator command; receives a JSON request on stdin.
    pub command: Vec<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Identical requests inside this window reuse the cached reply.
    pub cache_ttl_secs: u64,
    /// Byte budget for the rendered user prompt.
    pub prompt_budget_bytes: usize,
    pub output_limit_bytes: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: vec!["foreman-llm".to_string()],
            model: "claude-sonnet".to_string(),
            temperature: 0.2,
            max_tokens: 8192,
            timeout_secs: 600,
            cache_ttl_secs: 3600,
            prompt_budget_bytes: 60_000,
            output_limit_bytes: 2_000_000,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocksConfig {
    pub task_ttl_secs: u64,
    pub milestone_ttl_secs: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            task_ttl_secs: 3600,
            milestone_ttl_secs: 120,
        }
    }
}

impl LocksConfig {
    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn milestone_ttl(&self) -> Duration {
        Duration::from_secs(self.milestone_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Tasks claimed per dispatch pass.
    pub limit: usize,
    /// Seconds between passes in `foreman work`.
    pub interval_secs: u64,
    /// Overrides the derived `worker-<host>-<pid>` identity.
    pub worker_id: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            limit: 1,
            interval_secs: 60,
            worker_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: u32,
    /// Directory swept for stale `*.log` files.
    pub log_dir: Option<PathBuf>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VcsConfig {
    /// Commit workspace changes after each completed milestone.
    pub enabled: bool,
    pub branch_prefix: String,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            branch_prefix: "foreman/task-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Overrides the per-type wall-clock budget of one task run.
    pub execution_budget_secs: Option<u64>,
    /// Snapshot the workspace under `<state_dir>/backups` before an upgrade
    /// task is planned.
    pub backup_upgrades: bool,
    /// Directory names skipped by the upgrade snapshot.
    pub backup_exclude: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_budget_secs: None,
            backup_upgrades: true,
            backup_exclude: [".git", "target", "node_modules", "vendor"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl EngineConfig {
    pub fn execution_budget(&self) -> Option<Duration> {
        self.execution_budget_secs.map(Duration::from_secs)
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".foreman"),
            workspace: WorkspaceConfig::default(),
            commands: CommandsConfig::default(),
            llm: LlmConfig::default(),
            locks: LocksConfig::default(),
            dispatcher: DispatcherConfig::default(),
            retention: RetentionConfig::default(),
            vcs: VcsConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workspace.allowed_extensions.is_empty() {
            return Err(anyhow!("workspace.allowed_extensions must not be empty"));
        }
        if self.commands.allowed.is_empty() {
            return Err(anyhow!("commands.allowed must not be empty"));
        }
        if self.commands.timeout_secs == 0 {
            return Err(anyhow!("commands.timeout_secs must be > 0"));
        }
        if self.commands.output_limit_bytes == 0 {
            return Err(anyhow!("commands.output_limit_bytes must be > 0"));
        }
        if self.llm.command.is_empty() || self.llm.command[0].trim().is_empty() {
            return Err(anyhow!("llm.command must be a non-empty array"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(anyhow!("llm.temperature must be within 0.0..=2.0"));
        }
        if self.llm.prompt_budget_bytes == 0 {
            return Err(anyhow!("llm.prompt_budget_bytes must be > 0"));
        }
        if self.locks.task_ttl_secs == 0 || self.locks.milestone_ttl_secs == 0 {
            return Err(anyhow!("lock TTLs must be > 0"));
        }
        if self.dispatcher.limit == 0 {
            return Err(anyhow!("dispatcher.limit must be > 0"));
        }
        if self.dispatcher.interval_secs == 0 {
            return Err(anyhow!("dispatcher.interval_secs must be > 0"));
        }
        if self.engine.execution_budget_secs == Some(0) {
            return Err(anyhow!("engine.execution_budget_secs must be > 0"));
        }
        Ok(())
    }

    /// Resolve relative paths against the directory holding the config file.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        let resolve = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        };
        self.state_dir = resolve(&self.state_dir);
        self.workspace.root = resolve(&self.workspace.root);
        self.workspace.allowed_roots = self
            .workspace
            .allowed_roots
            .iter()
            .map(|p| resolve(p))
            .collect();
        self.retention.log_dir = self.retention.log_dir.as_deref().map(resolve);
        self
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ForemanConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("foreman.toml");
        let cfg = ForemanConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("foreman.toml");
        fs::write(&path, "[locks]\nmilestone_ttl_secs = 30\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.locks.milestone_ttl_secs, 30);
        assert_eq!(cfg.locks.task_ttl_secs, 3600);
        assert_eq!(cfg.dispatcher.limit, 1);
    }

    #[test]
    fn engine_section_overrides_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("foreman.toml");
        fs::write(&path, "[engine]\nexecution_budget_secs = 90\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.engine.execution_budget(), Some(Duration::from_secs(90)));
        assert!(cfg.engine.backup_upgrades);

        fs::write(&path, "[engine]\nexecution_budget_secs = 0\n").expect("write");
        let err = load_config(&path).expect_err("zero budget");
        assert!(err.to_string().contains("execution_budget_secs"));
    }

    #[test]
    fn rejects_empty_allow_list() {
        let mut cfg = ForemanConfig::default();
        cfg.commands.allowed.clear();
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("commands.allowed"));
    }

    #[test]
    fn resolves_relative_paths_against_base() {
        let cfg = ForemanConfig::default().resolve_paths(Path::new("/srv/app"));
        assert_eq!(cfg.state_dir, PathBuf::from("/srv/app/.foreman"));
        assert_eq!(cfg.workspace.root, PathBuf::from("/srv/app/workspace"));
    }
}
