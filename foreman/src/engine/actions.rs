//! Applies typed execution-plan actions and file changes through the sandbox.
//!
//! Each action reports its own outcome; one failure never stops the rest.
//! Policy violations (path traversal, disallowed commands) are reported as
//! failed actions like any other error. A `change_directory` action scopes the
//! rest of its batch to a workspace subdirectory.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::plan::{Action, FileChange, Improvement, InsertPosition, PatchEdit};
use crate::error::SandboxError;
use crate::io::command_runner::CommandRunner;
use crate::io::file_patcher::FilePatcher;

/// Result of one action or file change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub index: usize,
    pub action: &'static str,
    pub target: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Outcomes of a batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub outcomes: Vec<ActionOutcome>,
}

impl ExecutionReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    pub fn failures(&self) -> Vec<&ActionOutcome> {
        self.outcomes.iter().filter(|o| !o.success).collect()
    }

    /// `"kind target: message"` for every failed entry.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .iter()
            .map(|o| format!("{} {}: {}", o.action, o.target, o.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

struct Applied {
    message: String,
    success: bool,
    detail: Option<Value>,
}

impl Applied {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
            detail: None,
        }
    }
}

pub struct ActionExecutor<'a> {
    files: &'a FilePatcher,
    commands: &'a CommandRunner,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(files: &'a FilePatcher, commands: &'a CommandRunner) -> Self {
        Self { files, commands }
    }

    pub fn execute(&self, actions: &[Action]) -> ExecutionReport {
        let mut cwd: Option<String> = None;
        let mut outcomes = Vec::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            let action = match &cwd {
                Some(dir) => action.within(dir),
                None => action.clone(),
            };
            let (success, message, detail) = match self.apply(&action, &mut cwd) {
                Ok(applied) => (applied.success, applied.message, applied.detail),
                Err(err) => (false, err.to_string(), None),
            };
            if success {
                debug!(index, action = action.kind(), target = action.target(), "action applied");
            } else {
                warn!(index, action = action.kind(), target = action.target(), %message, "action failed");
            }
            outcomes.push(ActionOutcome {
                index,
                action: action.kind(),
                target: action.target().to_string(),
                success,
                message,
                detail,
            });
        }
        ExecutionReport { outcomes }
    }

    fn apply(&self, action: &Action, cwd: &mut Option<String>) -> Result<Applied, SandboxError> {
        match action {
            Action::CreateFolder { path } => Ok(if self.files.create_dir(path)? {
                Applied::ok("created")
            } else {
                Applied::ok("already exists")
            }),
            Action::CreateFile { path, content } => {
                if self.files.exists(path)? {
                    return Err(SandboxError::AlreadyExists { path: path.clone() });
                }
                self.files.write(path, content)?;
                Ok(Applied::ok(format!("wrote {} bytes", content.len())))
            }
            Action::UpdateFile { path, content } => {
                if !self.files.exists(path)? {
                    return Err(SandboxError::NotFound { path: path.clone() });
                }
                self.files.write(path, content)?;
                Ok(Applied::ok(format!("wrote {} bytes", content.len())))
            }
            Action::ReplaceFile { path, content } => {
                self.files.write(path, content)?;
                Ok(Applied::ok(format!("wrote {} bytes", content.len())))
            }
            Action::MoveFile { from, to } => {
                self.files.move_file(from, to)?;
                Ok(Applied::ok(format!("moved to {to}")))
            }
            Action::DeleteFile { path } => {
                self.files.delete(path)?;
                Ok(Applied::ok("deleted"))
            }
            Action::PatchFile { path, edits } => {
                let report = self.files.patch(path, edits)?;
                Ok(Applied {
                    message: format!("{} of {} edits applied", report.applied(), edits.len()),
                    success: report.applied() > 0,
                    detail: serde_json::to_value(&report.outcomes).ok(),
                })
            }
            Action::AddToFile {
                path,
                content,
                position,
                marker,
            } => self.add_to_file(path, content, *position, marker.as_deref()),
            Action::RemoveFromFile { path, content } => {
                let current = self.files.read(path)?;
                if content.is_empty() || !current.contains(content.as_str()) {
                    return Ok(Applied {
                        message: "content not found".to_string(),
                        success: false,
                        detail: None,
                    });
                }
                self.files.write(path, &current.replace(content.as_str(), ""))?;
                Ok(Applied::ok("removed"))
            }
            Action::AnalyzeFile { path, analysis } => {
                let current = self.files.read(path)?;
                let note = analysis.as_deref().unwrap_or("no notes");
                Ok(Applied {
                    message: format!("analyzed: {note}"),
                    success: true,
                    detail: Some(serde_json::json!({
                        "bytes": current.len(),
                        "lines": current.lines().count(),
                        "analysis": analysis,
                    })),
                })
            }
            Action::ImproveFile { path, improvements } => self.improve_file(path, improvements),
            Action::ChangeDirectory { path } => {
                let Some(dir) = normalize_dir(path)? else {
                    *cwd = None;
                    return Ok(Applied::ok("now in workspace root"));
                };
                if !self.files.resolve(&dir)?.is_dir() {
                    return Err(SandboxError::NotFound { path: dir });
                }
                let message = format!("now in {dir}");
                *cwd = Some(dir);
                Ok(Applied::ok(message))
            }
            Action::RunCommand {
                command,
                args,
                workdir,
            } => {
                let workdir = workdir.as_deref().map(Path::new);
                let result = if args.is_empty() {
                    self.commands.run_line(command, workdir)?
                } else {
                    self.commands.run(command, args, workdir)?
                };
                let message = match result.exit_code {
                    _ if result.timed_out => "timed out".to_string(),
                    Some(code) => format!("exit code {code}"),
                    None => "did not run".to_string(),
                };
                Ok(Applied {
                    message,
                    success: result.success,
                    detail: serde_json::to_value(&result).ok(),
                })
            }
        }
    }

    fn add_to_file(
        &self,
        path: &str,
        content: &str,
        position: InsertPosition,
        marker: Option<&str>,
    ) -> Result<Applied, SandboxError> {
        let current = if self.files.exists(path)? {
            self.files.read(path)?
        } else {
            String::new()
        };
        let updated = match position {
            InsertPosition::End if current.is_empty() => content.to_string(),
            InsertPosition::End => format!("{current}\n{content}"),
            InsertPosition::Start if current.is_empty() => content.to_string(),
            InsertPosition::Start => format!("{content}\n{current}"),
            InsertPosition::After => {
                let Some(marker) = marker.filter(|m| !m.is_empty()) else {
                    return Ok(Applied {
                        message: "position 'after' requires a marker".to_string(),
                        success: false,
                        detail: None,
                    });
                };
                let Some(at) = current.find(marker) else {
                    return Ok(Applied {
                        message: format!("marker '{marker}' not found"),
                        success: false,
                        detail: None,
                    });
                };
                let split = at + marker.len();
                format!("{}\n{}{}", &current[..split], content, &current[split..])
            }
        };
        self.files.write(path, &updated)?;
        Ok(Applied::ok("added"))
    }

    fn improve_file(&self, path: &str, improvements: &[Improvement]) -> Result<Applied, SandboxError> {
        if !self.files.exists(path)? {
            return Err(SandboxError::NotFound {
                path: path.to_string(),
            });
        }
        if improvements.is_empty() {
            return Ok(Applied::ok("no improvements listed"));
        }
        let edits: Vec<PatchEdit> = improvements
            .iter()
            .map(|i| PatchEdit::Replace {
                search: i.replace.clone(),
                replace: i.with.clone(),
            })
            .collect();
        let report = self.files.patch(path, &edits)?;
        Ok(Applied {
            message: format!("{} of {} improvements applied", report.applied(), edits.len()),
            success: report.applied() > 0,
            detail: serde_json::to_value(&report.outcomes).ok(),
        })
    }

    /// Write full contents or apply patches for each change.
    pub fn materialize(&self, changes: &[FileChange]) -> ExecutionReport {
        let outcomes = changes
            .iter()
            .enumerate()
            .map(|(index, change)| {
                let applied = match (&change.content, change.patches.is_empty()) {
                    (Some(content), _) => self
                        .files
                        .write(&change.path, content)
                        .map(|()| Applied::ok(format!("wrote {} bytes", content.len()))),
                    (None, false) => self.files.patch(&change.path, &change.patches).map(|report| {
                        Applied {
                            message: format!(
                                "{} of {} edits applied",
                                report.applied(),
                                change.patches.len()
                            ),
                            success: report.applied() > 0,
                            detail: serde_json::to_value(&report.outcomes).ok(),
                        }
                    }),
                    (None, true) => Ok(Applied {
                        message: "no content or patches".to_string(),
                        success: false,
                        detail: None,
                    }),
                };
                let (success, message, detail) = match applied {
                    Ok(a) => (a.success, a.message, a.detail),
                    Err(err) => (false, err.to_string(), None),
                };
                if !success {
                    warn!(path = %change.path, %message, "file change failed");
                }
                ActionOutcome {
                    index,
                    action: "file_change",
                    target: change.path.clone(),
                    success,
                    message,
                    detail,
                }
            })
            .collect();
        ExecutionReport { outcomes }
    }
}

/// Collapse `.` and `..` in a workspace-relative directory. `None` is the
/// workspace root; climbing above it is a traversal.
fn normalize_dir(path: &str) -> Result<Option<String>, SandboxError> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(SandboxError::PathTraversal {
                        path: path.to_string(),
                    });
                }
            }
            other => parts.push(other),
        }
    }
    Ok((!parts.is_empty()).then(|| parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::CommandsConfig;

    fn sandbox() -> (tempfile::TempDir, FilePatcher, CommandRunner) {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FilePatcher::new(dir.path(), vec![".rs".to_string(), ".md".to_string()])
            .expect("patcher");
        let commands =
            CommandRunner::new(&CommandsConfig::default(), dir.path(), &[]).expect("runner");
        (dir, files, commands)
    }

    #[test]
    fn file_actions_report_independently() {
        let (dir, files, commands) = sandbox();
        let executor = ActionExecutor::new(&files, &commands);
        let report = executor.execute(&[
            Action::CreateFolder {
                path: "src".to_string(),
            },
            Action::CreateFile {
                path: "src/lib.rs".to_string(),
                content: "pub fn a() {}\n".to_string(),
            },
            Action::CreateFile {
                path: "src/lib.rs".to_string(),
                content: "again".to_string(),
            },
            Action::UpdateFile {
                path: "../escape.rs".to_string(),
                content: "x".to_string(),
            },
            Action::PatchFile {
                path: "src/lib.rs".to_string(),
                edits: vec![PatchEdit::Replace {
                    search: "a()".to_string(),
                    replace: "b()".to_string(),
                }],
            },
        ]);

        let flags: Vec<bool> = report.outcomes.iter().map(|o| o.success).collect();
        assert_eq!(flags, vec![true, true, false, false, true]);
        assert!(!report.all_succeeded());
        assert!(report.failure_summary().contains("create_file src/lib.rs"));
        let written = std::fs::read_to_string(dir.path().join("src/lib.rs")).expect("read");
        assert_eq!(written, "pub fn b() {}\n");
        assert!(!dir.path().parent().expect("parent").join("escape.rs").exists());
    }

    #[test]
    fn add_and_remove_content() {
        let (dir, files, commands) = sandbox();
        files.write("notes.md", "# Notes\nbody").expect("seed");
        let executor = ActionExecutor::new(&files, &commands);
        let report = executor.execute(&[
            Action::AddToFile {
                path: "notes.md".to_string(),
                content: "intro".to_string(),
                position: InsertPosition::After,
                marker: Some("# Notes".to_string()),
            },
            Action::AddToFile {
                path: "notes.md".to_string(),
                content: "tail".to_string(),
                position: InsertPosition::End,
                marker: None,
            },
            Action::RemoveFromFile {
                path: "notes.md".to_string(),
                content: "body\n".to_string(),
            },
            Action::AddToFile {
                path: "notes.md".to_string(),
                content: "x".to_string(),
                position: InsertPosition::After,
                marker: Some("missing".to_string()),
            },
        ]);
        let flags: Vec<bool> = report.outcomes.iter().map(|o| o.success).collect();
        assert_eq!(flags, vec![true, true, true, false]);
        let text = std::fs::read_to_string(dir.path().join("notes.md")).expect("read");
        assert_eq!(text, "# Notes\nintro\ntail");
    }

    #[test]
    fn disallowed_commands_fail_without_running() {
        let (_dir, files, commands) = sandbox();
        let executor = ActionExecutor::new(&files, &commands);
        let report = executor.execute(&[
            Action::RunCommand {
                command: "rm -rf / ; echo pwned".to_string(),
                args: Vec::new(),
                workdir: None,
            },
            Action::RunCommand {
                command: "curl".to_string(),
                args: vec!["http://example.com".to_string()],
                workdir: None,
            },
        ]);
        assert!(report.outcomes.iter().all(|o| !o.success));
        assert!(report.outcomes[0].message.contains("rejected"));
    }

    #[test]
    fn materialize_writes_content_and_patches() {
        let (dir, files, commands) = sandbox();
        files.write("src/main.rs", "fn main() {}\n").expect("seed");
        let executor = ActionExecutor::new(&files, &commands);
        let report = executor.materialize(&[
            FileChange {
                path: "src/new.rs".to_string(),
                content: Some("pub struct New;\n".to_string()),
                patches: Vec::new(),
            },
            FileChange {
                path: "src/main.rs".to_string(),
                content: None,
                patches: vec![PatchEdit::Prepend {
                    content: "mod new;".to_string(),
                }],
            },
            FileChange {
                path: "src/empty.rs".to_string(),
                content: None,
                patches: Vec::new(),
            },
        ]);
        let flags: Vec<bool> = report.outcomes.iter().map(|o| o.success).collect();
        assert_eq!(flags, vec![true, true, false]);
        let main = std::fs::read_to_string(dir.path().join("src/main.rs")).expect("read");
        assert_eq!(main, "mod new;\nfn main() {}\n");
    }

    #[test]
    fn improve_and_analyze_files() {
        let (dir, files, commands) = sandbox();
        files.write("src/lib.rs", "fn old() {}\nfn keep() {}\n").expect("seed");
        let executor = ActionExecutor::new(&files, &commands);
        let report = executor.execute(&[
            Action::AnalyzeFile {
                path: "src/lib.rs".to_string(),
                analysis: Some("naming is dated".to_string()),
            },
            Action::ImproveFile {
                path: "src/lib.rs".to_string(),
                improvements: vec![
                    Improvement {
                        replace: "old".to_string(),
                        with: "new".to_string(),
                    },
                    Improvement {
                        replace: "absent".to_string(),
                        with: "x".to_string(),
                    },
                ],
            },
            Action::ImproveFile {
                path: "src/missing.rs".to_string(),
                improvements: Vec::new(),
            },
            Action::AnalyzeFile {
                path: "src/missing.rs".to_string(),
                analysis: None,
            },
        ]);
        let flags: Vec<bool> = report.outcomes.iter().map(|o| o.success).collect();
        assert_eq!(flags, vec![true, true, false, false]);
        assert_eq!(report.outcomes[0].message, "analyzed: naming is dated");
        let detail = report.outcomes[0].detail.as_ref().expect("detail");
        assert_eq!(detail["lines"], 2);
        assert_eq!(report.outcomes[1].message, "1 of 2 improvements applied");
        let text = std::fs::read_to_string(dir.path().join("src/lib.rs")).expect("read");
        assert_eq!(text, "fn new() {}\nfn keep() {}\n");
    }

    #[test]
    fn change_directory_scopes_later_actions() {
        let (dir, files, commands) = sandbox();
        files.create_dir("app/src").expect("mkdir");
        let executor = ActionExecutor::new(&files, &commands);
        let report = executor.execute(&[
            Action::ChangeDirectory {
                path: "nowhere".to_string(),
            },
            Action::ChangeDirectory {
                path: "../".to_string(),
            },
            Action::ChangeDirectory {
                path: "app".to_string(),
            },
            Action::CreateFile {
                path: "src/lib.rs".to_string(),
                content: "pub fn a() {}\n".to_string(),
            },
            Action::ChangeDirectory {
                path: "src".to_string(),
            },
            Action::CreateFile {
                path: "mod.rs".to_string(),
                content: String::new(),
            },
            Action::ChangeDirectory {
                path: "../..".to_string(),
            },
            Action::CreateFile {
                path: "README.md".to_string(),
                content: "# root\n".to_string(),
            },
        ]);
        let flags: Vec<bool> = report.outcomes.iter().map(|o| o.success).collect();
        assert_eq!(flags, vec![false, false, true, true, true, true, true, true]);
        assert_eq!(report.outcomes[3].target, "app/src/lib.rs");
        assert_eq!(report.outcomes[5].target, "app/src/mod.rs");
        assert!(dir.path().join("app/src/lib.rs").is_file());
        assert!(dir.path().join("app/src/mod.rs").is_file());
        assert!(dir.path().join("README.md").is_file());
        assert!(!dir.path().join("app/README.md").exists());
    }
}
