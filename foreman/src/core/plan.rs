//! Ephemeral plan types recovered from model output.
//!
//! Plans are never persisted. A milestone plan becomes milestone records; an
//! execution plan is a list of [`Action`]s consumed by the sandbox.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::role::AgentRole;

/// Milestone descriptor as produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "agent_type", alias = "agent_role", alias = "role")]
    pub agent_role: AgentRole,
    #[serde(default = "empty_object")]
    pub input_data: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

impl MilestoneDraft {
    pub fn new(title: &str, description: &str, agent_role: AgentRole) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            agent_role,
            input_data: empty_object(),
            metadata: empty_object(),
        }
    }
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Fixed fallback plan used when no milestones can be recovered.
pub fn default_plan() -> Vec<MilestoneDraft> {
    vec![
        MilestoneDraft::new(
            "Requirements Analysis",
            "Analyze and clarify the task requirements",
            AgentRole::Ba,
        ),
        MilestoneDraft::new(
            "Implementation",
            "Implement the required functionality",
            AgentRole::Dev,
        ),
        MilestoneDraft::new(
            "Testing",
            "Test the implemented functionality",
            AgentRole::Qa,
        ),
    ]
}

/// One in-memory edit applied by the file patcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatchEdit {
    /// Replace every occurrence of `search`.
    Replace {
        search: String,
        #[serde(default)]
        replace: String,
    },
    /// Insert `content` on a new line after the first occurrence of `after`.
    Insert { after: String, content: String },
    Append { content: String },
    Prepend { content: String },
}

/// Where `add_to_file` places its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    #[default]
    End,
    Start,
    After,
}

/// A file/command action from an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CreateFolder {
        path: String,
    },
    /// Create a new file. Fails if the file already exists.
    CreateFile {
        path: String,
        #[serde(default)]
        content: String,
    },
    /// Overwrite an existing file.
    UpdateFile {
        path: String,
        content: String,
    },
    /// Write a file whether or not it exists.
    ReplaceFile {
        path: String,
        content: String,
    },
    MoveFile {
        from: String,
        to: String,
    },
    DeleteFile {
        path: String,
    },
    PatchFile {
        path: String,
        edits: Vec<PatchEdit>,
    },
    AddToFile {
        path: String,
        content: String,
        #[serde(default)]
        position: InsertPosition,
        #[serde(default)]
        marker: Option<String>,
    },
    RemoveFromFile {
        path: String,
        content: String,
    },
    /// Read-only inspection; records the note without touching the file.
    AnalyzeFile {
        path: String,
        #[serde(default)]
        analysis: Option<String>,
    },
    /// Literal replacements applied to an existing file.
    ImproveFile {
        path: String,
        #[serde(default)]
        improvements: Vec<Improvement>,
    },
    /// Resolve later paths and commands in this batch relative to `path`.
    #[serde(alias = "cd")]
    ChangeDirectory {
        path: String,
    },
    #[serde(
        alias = "install_package",
        alias = "install_npm",
        alias = "run_npm",
        alias = "run_artisan"
    )]
    RunCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        workdir: Option<String>,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::CreateFolder { .. } => "create_folder",
            Action::CreateFile { .. } => "create_file",
            Action::UpdateFile { .. } => "update_file",
            Action::ReplaceFile { .. } => "replace_file",
            Action::MoveFile { .. } => "move_file",
            Action::DeleteFile { .. } => "delete_file",
            Action::PatchFile { .. } => "patch_file",
            Action::AddToFile { .. } => "add_to_file",
            Action::RemoveFromFile { .. } => "remove_from_file",
            Action::AnalyzeFile { .. } => "analyze_file",
            Action::ImproveFile { .. } => "improve_file",
            Action::ChangeDirectory { .. } => "change_directory",
            Action::RunCommand { .. } => "run_command",
        }
    }

    /// Primary path (or command) the action targets, for reporting.
    pub fn target(&self) -> &str {
        match self {
            Action::CreateFolder { path }
            | Action::CreateFile { path, .. }
            | Action::UpdateFile { path, .. }
            | Action::ReplaceFile { path, .. }
            | Action::DeleteFile { path }
            | Action::PatchFile { path, .. }
            | Action::AddToFile { path, .. }
            | Action::RemoveFromFile { path, .. }
            | Action::AnalyzeFile { path, .. }
            | Action::ImproveFile { path, .. }
            | Action::ChangeDirectory { path } => path,
            Action::MoveFile { from, .. } => from,
            Action::RunCommand { command, .. } => command,
        }
    }

    /// The same action with every path (and a missing command workdir)
    /// placed under the workspace-relative directory `dir`.
    pub fn within(&self, dir: &str) -> Action {
        let join = |path: &str| format!("{}/{}", dir.trim_end_matches('/'), path);
        let mut rebased = self.clone();
        match &mut rebased {
            Action::CreateFolder { path }
            | Action::CreateFile { path, .. }
            | Action::UpdateFile { path, .. }
            | Action::ReplaceFile { path, .. }
            | Action::DeleteFile { path }
            | Action::PatchFile { path, .. }
            | Action::AddToFile { path, .. }
            | Action::RemoveFromFile { path, .. }
            | Action::AnalyzeFile { path, .. }
            | Action::ImproveFile { path, .. }
            | Action::ChangeDirectory { path } => *path = join(path.as_str()),
            Action::MoveFile { from, to } => {
                *from = join(from.as_str());
                *to = join(to.as_str());
            }
            Action::RunCommand { workdir, .. } => {
                *workdir = Some(match workdir.as_deref() {
                    Some(sub) if sub.starts_with('/') => sub.to_string(),
                    Some(sub) => join(sub),
                    None => dir.to_string(),
                });
            }
        }
        rebased
    }
}

/// One `improve_file` replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Improvement {
    #[serde(alias = "search")]
    pub replace: String,
    #[serde(default)]
    pub with: String,
}

/// A file write requested by a role reply (`file_changes` entries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(alias = "file", alias = "file_path")]
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub patches: Vec<PatchEdit>,
}

/// A fenced code block recovered from free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// File path announced before the block (`File: src/lib.rs`), if any.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_plan_is_analysis_then_implementation_then_testing() {
        let roles: Vec<AgentRole> = default_plan().iter().map(|m| m.agent_role).collect();
        assert_eq!(roles, vec![AgentRole::Ba, AgentRole::Dev, AgentRole::Qa]);
    }

    #[test]
    fn actions_decode_by_tag() {
        let action: Action = serde_json::from_value(json!({
            "action": "patch_file",
            "path": "src/lib.rs",
            "edits": [
                {"search": "a", "replace": "b", "type": "replace"},
                {"type": "append", "content": "tail"}
            ]
        }))
        .expect("decode");
        assert_eq!(action.kind(), "patch_file");
        let Action::PatchFile { edits, .. } = action else {
            panic!("expected patch_file");
        };
        assert_eq!(edits.len(), 2);
    }

    #[test]
    fn package_install_aliases_map_to_run_command() {
        let action: Action = serde_json::from_value(json!({
            "action": "install_package",
            "command": "npm",
            "args": ["install", "left-pad"]
        }))
        .expect("decode");
        assert_eq!(action.kind(), "run_command");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let result: Result<Action, _> =
            serde_json::from_value(json!({"action": "move_file", "from": "a"}));
        assert!(result.is_err());
    }

    #[test]
    fn improve_and_analyze_decode() {
        let action: Action = serde_json::from_value(json!({
            "action": "improve_file",
            "path": "src/lib.rs",
            "improvements": [{"replace": "old", "with": "new"}]
        }))
        .expect("decode");
        let Action::ImproveFile { improvements, .. } = &action else {
            panic!("expected improve_file");
        };
        assert_eq!(improvements[0].with, "new");

        let analyze: Action =
            serde_json::from_value(json!({"action": "analyze_file", "path": "README.md"}))
                .expect("decode");
        assert_eq!(analyze.kind(), "analyze_file");
    }

    #[test]
    fn within_rebases_paths_and_default_workdir() {
        let moved = Action::MoveFile {
            from: "a.rs".to_string(),
            to: "b.rs".to_string(),
        }
        .within("app/");
        assert_eq!(
            moved,
            Action::MoveFile {
                from: "app/a.rs".to_string(),
                to: "app/b.rs".to_string(),
            }
        );

        let command = Action::RunCommand {
            command: "cargo".to_string(),
            args: Vec::new(),
            workdir: None,
        }
        .within("app");
        let Action::RunCommand { workdir, .. } = command else {
            panic!("expected run_command");
        };
        assert_eq!(workdir.as_deref(), Some("app"));
    }
}
