//! Allow-listed subprocess execution.
//!
//! Commands never go through a shell. The program must be on the allow-list,
//! arguments travel as a discrete list, and the working directory must sit
//! under one of the configured roots.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::SandboxError;
use crate::io::config::CommandsConfig;
use crate::io::process::run_command_with_timeout;

const SHELL_METACHARACTERS: [char; 3] = [';', '|', '&'];
const NPM_PLACEHOLDER_TEST: &str = "no test specified";

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// Shell-escaped rendering of the command, for logs and reports only.
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// A detected project test runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunner {
    pub label: &'static str,
    pub program: &'static str,
    pub args: Vec<String>,
}

/// Outcome of [`CommandRunner::run_tests`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestRun {
    Passed { runner: String, result: CommandResult },
    Failed { runner: String, result: CommandResult },
    /// No runner present. Not an error.
    Skipped { reason: String },
}

impl TestRun {
    /// Passed and skipped runs both count as acceptable.
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, TestRun::Failed { .. })
    }
}

/// Runs allow-listed commands inside permitted directories.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    allowed: Vec<String>,
    roots: Vec<PathBuf>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandRunner {
    /// `workspace_root` is the default working directory; `extra_roots` are
    /// additional directories commands may run in.
    pub fn new(
        cfg: &CommandsConfig,
        workspace_root: &Path,
        extra_roots: &[PathBuf],
    ) -> Result<Self, SandboxError> {
        let mut roots = Vec::with_capacity(extra_roots.len() + 1);
        for root in std::iter::once(workspace_root).chain(extra_roots.iter().map(PathBuf::as_path)) {
            let canonical = root
                .canonicalize()
                .map_err(|e| SandboxError::io("canonicalize", root.display().to_string(), e))?;
            roots.push(canonical);
        }
        Ok(Self {
            allowed: cfg.allowed.clone(),
            roots,
            timeout: cfg.timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        })
    }

    pub fn is_command_allowed(&self, command_line: &str) -> bool {
        self.validate(command_line).is_ok()
    }

    /// Reject chaining metacharacters, then check the base command name.
    pub fn validate(&self, command_line: &str) -> Result<(), SandboxError> {
        if command_line.contains(SHELL_METACHARACTERS) {
            return Err(SandboxError::CommandSyntaxRejected {
                command: command_line.to_string(),
            });
        }
        let not_allowed = || SandboxError::CommandNotAllowed {
            command: command_line.to_string(),
        };
        let program = command_line.split_whitespace().next().ok_or_else(not_allowed)?;
        let base = Path::new(program)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(not_allowed)?;
        if self.allowed.iter().any(|allowed| allowed == base) {
            Ok(())
        } else {
            Err(not_allowed())
        }
    }

    /// Split a command line on whitespace and run it.
    pub fn run_line(
        &self,
        command_line: &str,
        workdir: Option<&Path>,
    ) -> Result<CommandResult, SandboxError> {
        self.validate(command_line)?;
        let mut parts = command_line.split_whitespace();
        let program = parts.next().unwrap_or_default();
        let args: Vec<String> = parts.map(str::to_string).collect();
        self.run(program, &args, workdir)
    }

    /// Run `program` with discrete `args`.
    ///
    /// A program that fails to spawn yields an unsuccessful result rather
    /// than an error; policy violations are errors.
    #[instrument(skip_all, fields(program = program))]
    pub fn run(
        &self,
        program: &str,
        args: &[String],
        workdir: Option<&Path>,
    ) -> Result<CommandResult, SandboxError> {
        self.validate(program)?;
        let dir = self.resolve_workdir(workdir)?;
        let rendered = render_command(program, args);
        info!(command = %rendered, dir = %dir.display(), "running command");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&dir);
        let result = match run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
        {
            Ok(out) => CommandResult {
                command: rendered,
                success: out.success(),
                exit_code: out.exit_code(),
                stdout: out.stdout_text(),
                stderr: out.stderr_text(),
                timed_out: out.timed_out,
                duration_ms: out.elapsed.as_millis() as u64,
            },
            Err(err) => {
                warn!(err = %format!("{err:#}"), "command failed to run");
                CommandResult {
                    command: rendered,
                    success: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                    timed_out: false,
                    duration_ms: 0,
                }
            }
        };
        debug!(success = result.success, exit_code = ?result.exit_code, "command finished");
        Ok(result)
    }

    fn resolve_workdir(&self, workdir: Option<&Path>) -> Result<PathBuf, SandboxError> {
        let Some(dir) = workdir else {
            return Ok(self.roots[0].clone());
        };
        let candidate = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.roots[0].join(dir)
        };
        let denied = || SandboxError::WorkdirNotAllowed {
            path: dir.to_path_buf(),
        };
        let real = candidate.canonicalize().map_err(|_| denied())?;
        if real.is_dir() && self.roots.iter().any(|root| real.starts_with(root)) {
            Ok(real)
        } else {
            Err(denied())
        }
    }

    /// Detect and run the project's tests. Absence of a runner is `Skipped`.
    #[instrument(skip_all)]
    pub fn run_tests(&self, project_dir: Option<&Path>) -> Result<TestRun, SandboxError> {
        let dir = self.resolve_workdir(project_dir)?;
        let runner = match detect_test_runner(&dir) {
            Ok(runner) => runner,
            Err(reason) => {
                info!(%reason, "tests skipped");
                return Ok(TestRun::Skipped { reason });
            }
        };
        let result = self.run(runner.program, &runner.args, Some(&dir))?;
        let label = runner.label.to_string();
        Ok(if result.success {
            TestRun::Passed {
                runner: label,
                result,
            }
        } else {
            TestRun::Failed {
                runner: label,
                result,
            }
        })
    }
}

/// Probe marker files in `dir`. `Err` carries the reason tests are skipped.
pub fn detect_test_runner(dir: &Path) -> Result<TestRunner, String> {
    if dir.join("Cargo.toml").is_file() {
        return Ok(TestRunner {
            label: "cargo",
            program: "cargo",
            args: vec!["test".to_string(), "--quiet".to_string()],
        });
    }

    let mut reasons = Vec::new();
    if dir.join("composer.json").is_file() {
        if dir.join("vendor/bin/phpunit").is_file() {
            return Ok(TestRunner {
                label: "phpunit",
                program: "php",
                args: vec!["vendor/bin/phpunit".to_string()],
            });
        }
        reasons.push("composer project without vendor/bin/phpunit");
    }

    let package_json = dir.join("package.json");
    if package_json.is_file() {
        let script = fs::read_to_string(&package_json)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|pkg| pkg.pointer("/scripts/test").and_then(Value::as_str).map(str::to_string));
        match script {
            Some(script) if !script.contains(NPM_PLACEHOLDER_TEST) => {
                return Ok(TestRunner {
                    label: "npm",
                    program: "npm",
                    args: vec!["test".to_string()],
                });
            }
            _ => reasons.push("package.json has no real test script"),
        }
    }

    let pyproject_has_pytest = fs::read_to_string(dir.join("pyproject.toml"))
        .is_ok_and(|raw| raw.contains("[tool.pytest"));
    if dir.join("pytest.ini").is_file() || pyproject_has_pytest {
        return Ok(TestRunner {
            label: "pytest",
            program: "pytest",
            args: vec!["-q".to_string()],
        });
    }

    if reasons.is_empty() {
        Err("no test runner detected".to_string())
    } else {
        Err(reasons.join("; "))
    }
}

/// Quote an argument for display so it reads as a single shell word.
pub fn shell_escape(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@,+%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(shell_escape(program))
        .chain(args.iter().map(|arg| shell_escape(arg)))
        .collect::<Vec<_>>()
        .join(" ")
}
