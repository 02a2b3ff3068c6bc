//! Per-role milestone handlers.
//!
//! Every handler asks the gateway for the milestone's role. File-producing
//! roles then write through the sandbox; `qa` also runs the project tests.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::{info, warn};

use super::Engine;
use super::actions::{ActionExecutor, ExecutionReport};
use crate::core::plan::FileChange;
use crate::core::plan_parser::{extract_file_changes, parse_actions, parse_milestones};
use crate::core::role::AgentRole;
use crate::core::types::{Milestone, Task};
use crate::error::EngineError;
use crate::gateway::{AgentContext, AgentPayload, AgentResult};
use crate::io::command_runner::TestRun;
use crate::io::prompt::PromptSection;

const LISTED_FILES: usize = 20;
const OUTPUT_TAIL_BYTES: usize = 2_000;

impl Engine {
    /// Dispatch on the closed set of roles.
    pub(super) fn handle(
        &self,
        task: &Task,
        milestone: &Milestone,
        previous: &[Milestone],
        run_id: &str,
    ) -> Result<Value, EngineError> {
        let mut ctx = AgentContext {
            run_id: run_id.to_string(),
            task_id: Some(task.id),
            milestone_id: Some(milestone.id),
            sections: milestone_sections(task, milestone, previous),
        };
        match milestone.agent_role {
            AgentRole::Pm => self.handle_planning(&ctx),
            AgentRole::Ba | AgentRole::Ux => self.handle_analysis(milestone.agent_role, &ctx),
            AgentRole::Arch => {
                ctx.sections.push(self.project_section()?);
                self.handle_architecture(milestone, &ctx)
            }
            AgentRole::Dev => {
                ctx.sections.push(self.project_section()?);
                self.handle_development(milestone, &ctx)
            }
            AgentRole::Qa => self.handle_quality(milestone, &ctx),
            AgentRole::Doc => self.handle_documentation(milestone, &ctx),
        }
    }

    /// A mid-run `pm` milestone reviews the plan; it does not add milestones.
    fn handle_planning(&self, ctx: &AgentContext) -> Result<Value, EngineError> {
        let result = self.gateway.execute(AgentRole::Pm, ctx)?;
        let proposed = parse_milestones(&result.raw_text).unwrap_or_default();
        Ok(json!({
            "response": result.data_json(),
            "proposed_milestones": proposed,
            "cached": result.cached,
        }))
    }

    fn handle_analysis(&self, role: AgentRole, ctx: &AgentContext) -> Result<Value, EngineError> {
        let result = self.gateway.execute(role, ctx)?;
        Ok(json!({
            "response": result.data_json(),
            "cached": result.cached,
        }))
    }

    fn handle_architecture(
        &self,
        milestone: &Milestone,
        ctx: &AgentContext,
    ) -> Result<Value, EngineError> {
        let result = self.gateway.execute(AgentRole::Arch, ctx)?;
        let report = self.executor().materialize(&file_changes(&result));
        ensure_applied(milestone, "file changes", &report)?;
        Ok(json!({
            "response": result.data_json(),
            "files": report.to_json(),
            "cached": result.cached,
        }))
    }

    /// File changes from the reply; otherwise actions, embedded in the reply
    /// or requested as a streamed execution plan.
    fn handle_development(
        &self,
        milestone: &Milestone,
        ctx: &AgentContext,
    ) -> Result<Value, EngineError> {
        let result = self.gateway.execute(AgentRole::Dev, ctx)?;
        let executor = self.executor();

        let changes = file_changes(&result);
        let files = executor.materialize(&changes);
        ensure_applied(milestone, "file changes", &files)?;

        let embedded = match &result.data {
            AgentPayload::Structured(value) if value.get("actions").is_some() => {
                parse_actions(&result.raw_text).ok().map(|plan| plan.actions)
            }
            _ => None,
        };
        let actions = match embedded {
            Some(actions) => actions,
            None if changes.is_empty() => {
                info!(milestone_id = milestone.id, "no file changes in reply; requesting execution plan");
                self.gateway.request_actions(ctx)?.actions
            }
            None => Vec::new(),
        };
        let report = executor.execute(&actions);
        ensure_applied(milestone, "actions", &report)?;

        Ok(json!({
            "response": result.data_json(),
            "files": files.to_json(),
            "actions": report.to_json(),
            "cached": result.cached,
        }))
    }

    fn handle_quality(&self, milestone: &Milestone, ctx: &AgentContext) -> Result<Value, EngineError> {
        let result = self.gateway.execute(AgentRole::Qa, ctx)?;
        let tests = self.commands.run_tests(None)?;
        if let TestRun::Failed { runner, result } = &tests {
            return Err(EngineError::MilestoneExecutionFailed {
                milestone_id: milestone.id,
                sequence: milestone.sequence,
                reason: format!(
                    "{runner} tests failed: {}",
                    tail(if result.stderr.trim().is_empty() {
                        &result.stdout
                    } else {
                        &result.stderr
                    })
                ),
            });
        }
        Ok(json!({
            "assessment": result.data_json(),
            "tests": tests,
            "cached": result.cached,
        }))
    }

    fn handle_documentation(
        &self,
        milestone: &Milestone,
        ctx: &AgentContext,
    ) -> Result<Value, EngineError> {
        let result = self.gateway.execute(AgentRole::Doc, ctx)?;
        let mut changes = documentation_files(&result);
        changes.extend(file_changes(&result));
        let report = self.executor().materialize(&changes);
        ensure_applied(milestone, "documentation", &report)?;
        Ok(json!({
            "response": result.data_json(),
            "files": report.to_json(),
            "cached": result.cached,
        }))
    }

    fn executor(&self) -> ActionExecutor<'_> {
        ActionExecutor::new(&self.files, &self.commands)
    }

    fn project_section(&self) -> Result<PromptSection, EngineError> {
        let files = self.files.list_files(None)?;
        Ok(PromptSection::droppable("project_files", project_summary(&files)))
    }
}

fn ensure_applied(
    milestone: &Milestone,
    what: &str,
    report: &ExecutionReport,
) -> Result<(), EngineError> {
    if report.all_succeeded() {
        return Ok(());
    }
    warn!(
        milestone_id = milestone.id,
        failed = report.failures().len(),
        total = report.outcomes.len(),
        "{what} failed"
    );
    Err(EngineError::MilestoneExecutionFailed {
        milestone_id: milestone.id,
        sequence: milestone.sequence,
        reason: format!("{what} failed: {}", report.failure_summary()),
    })
}

/// Task, milestone and prior outputs. Prior outputs are droppable, most
/// recent first so the oldest are shed first under budget.
pub(crate) fn milestone_sections(
    task: &Task,
    milestone: &Milestone,
    previous: &[Milestone],
) -> Vec<PromptSection> {
    let mut sections = vec![
        task_section(task),
        PromptSection::required(
            "milestone",
            pretty(&json!({
                "sequence": milestone.sequence,
                "title": milestone.title,
                "description": milestone.description,
                "agent_role": milestone.agent_role,
                "input_data": milestone.input_data,
            })),
        ),
    ];
    for done in previous.iter().rev() {
        let Some(output) = &done.output_data else {
            continue;
        };
        sections.push(PromptSection::droppable(
            &format!("previous_{}_{}", done.sequence, done.agent_role),
            format!("{}\n{}", done.title, pretty(output)),
        ));
    }
    sections
}

pub(crate) fn task_section(task: &Task) -> PromptSection {
    PromptSection::required(
        "task",
        pretty(&json!({
            "id": task.id,
            "type": task.task_type,
            "title": task.title,
            "description": task.description,
            "content": task.content,
            "priority": task.priority,
        })),
    )
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// File count, first files, and counts per top-level directory and extension.
pub(crate) fn project_summary(files: &[String]) -> String {
    if files.is_empty() {
        return "The workspace has no matching files yet.".to_string();
    }
    let mut dirs: BTreeMap<&str, usize> = BTreeMap::new();
    let mut exts: BTreeMap<&str, usize> = BTreeMap::new();
    for file in files {
        let dir = file.split_once('/').map_or(".", |(dir, _)| dir);
        *dirs.entry(dir).or_default() += 1;
        let name = file.rsplit('/').next().unwrap_or(file);
        let ext = name.rsplit_once('.').map_or("(none)", |(_, ext)| ext);
        *exts.entry(ext).or_default() += 1;
    }

    let mut out = format!("{} files\n", files.len());
    for file in files.iter().take(LISTED_FILES) {
        out.push_str(&format!("- {file}\n"));
    }
    if files.len() > LISTED_FILES {
        out.push_str(&format!("... and {} more\n", files.len() - LISTED_FILES));
    }
    let join = |counts: &BTreeMap<&str, usize>| {
        counts
            .iter()
            .map(|(name, count)| format!("{name} ({count})"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    out.push_str(&format!("directories: {}\n", join(&dirs)));
    out.push_str(&format!("file types: {}", join(&exts)));
    out
}

fn file_changes(result: &AgentResult) -> Vec<FileChange> {
    match &result.data {
        AgentPayload::FileChanges(changes) => changes.clone(),
        AgentPayload::Structured(_) => extract_file_changes(&result.raw_text),
        AgentPayload::CodeBlocks(blocks) => blocks
            .iter()
            .filter_map(|block| {
                Some(FileChange {
                    path: block.path.clone()?,
                    content: Some(block.content.clone()),
                    patches: Vec::new(),
                })
            })
            .collect(),
        AgentPayload::Text(_) => Vec::new(),
    }
}

/// `{"documentation": [{"path", "content"}]}` entries.
fn documentation_files(result: &AgentResult) -> Vec<FileChange> {
    let AgentPayload::Structured(value) = &result.data else {
        return Vec::new();
    };
    let Some(Value::Array(items)) = value.get("documentation") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let path = item.get("path").and_then(Value::as_str)?;
            let content = item.get("content").and_then(Value::as_str)?;
            Some(FileChange {
                path: path.to_string(),
                content: Some(content.to_string()),
                patches: Vec::new(),
            })
        })
        .collect()
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    if text.len() <= OUTPUT_TAIL_BYTES {
        return text;
    }
    let mut start = text.len() - OUTPUT_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
