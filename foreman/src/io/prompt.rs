//! Role prompts and budgeted context rendering.
//!
//! System prompts are minijinja templates, one per role plus one for
//! execution plans. The user message is a list of context sections rendered
//! through `context.md`; sections are marked `required` or `droppable` and
//! droppable ones are shed (newest first) to fit a byte budget.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::role::AgentRole;

const PM_TEMPLATE: &str = include_str!("prompts/pm.md");
const BA_TEMPLATE: &str = include_str!("prompts/ba.md");
const UX_TEMPLATE: &str = include_str!("prompts/ux.md");
const ARCH_TEMPLATE: &str = include_str!("prompts/arch.md");
const DEV_TEMPLATE: &str = include_str!("prompts/dev.md");
const QA_TEMPLATE: &str = include_str!("prompts/qa.md");
const DOC_TEMPLATE: &str = include_str!("prompts/doc.md");
const ACTIONS_TEMPLATE: &str = include_str!("prompts/actions.md");
const CONTEXT_TEMPLATE: &str = include_str!("prompts/context.md");

const TRUNCATED_MARKER: &str = "\n[truncated]";

/// One block of the user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptSection {
    /// Word characters only; rendered upper-cased as the block heading.
    pub key: String,
    pub body: String,
    pub required: bool,
}

impl PromptSection {
    pub fn required(key: &str, body: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            body: body.into(),
            required: true,
        }
    }

    pub fn droppable(key: &str, body: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            body: body.into(),
            required: false,
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    workspace: String,
    allowed_commands: Vec<String>,
}

impl PromptEngine {
    pub fn new(workspace: &str, allowed_commands: &[String]) -> Result<Self> {
        let mut env = Environment::new();
        let templates = [
            ("pm", PM_TEMPLATE),
            ("ba", BA_TEMPLATE),
            ("ux", UX_TEMPLATE),
            ("arch", ARCH_TEMPLATE),
            ("dev", DEV_TEMPLATE),
            ("qa", QA_TEMPLATE),
            ("doc", DOC_TEMPLATE),
            ("actions", ACTIONS_TEMPLATE),
            ("context", CONTEXT_TEMPLATE),
        ];
        for (name, source) in templates {
            env.add_template(name, source)
                .with_context(|| format!("load {name} template"))?;
        }
        Ok(Self {
            env,
            workspace: workspace.to_string(),
            allowed_commands: allowed_commands.to_vec(),
        })
    }

    pub fn system_prompt(&self, role: AgentRole) -> Result<String> {
        self.render_system(role.as_str())
    }

    /// System prompt for a streamed execution plan.
    pub fn actions_prompt(&self) -> Result<String> {
        self.render_system("actions")
    }

    fn render_system(&self, name: &str) -> Result<String> {
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(context! {
                workspace => self.workspace.as_str(),
                allowed_commands => self.allowed_commands.as_slice(),
            })
            .with_context(|| format!("render {name} template"))?;
        Ok(rendered.trim().to_string())
    }

    /// Render the user message within `budget` bytes.
    pub fn user_prompt(&self, sections: &[PromptSection], budget: usize) -> Result<String> {
        let template = self.env.get_template("context")?;
        let rendered = template
            .render(context! { sections => sections })
            .context("render context template")?;
        let mut parsed = parse_sections(&rendered);
        apply_budget(&mut parsed, budget);
        Ok(render_sections(&parsed))
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("valid section regex")
    });

    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections, last first, then truncate the last section.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    while total_len(sections) > budget {
        let Some(idx) = sections.iter().rposition(|s| !s.required) else {
            break;
        };
        let dropped = sections.remove(idx);
        debug!(
            section = dropped.key,
            bytes_dropped = dropped.content.len(),
            "dropped section for budget"
        );
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let other_len = total - last.content.len();
    let allowed = budget.saturating_sub(other_len);
    let before_len = last.content.len();
    if allowed > TRUNCATED_MARKER.len() {
        truncate_at_char_boundary(&mut last.content, allowed - TRUNCATED_MARKER.len());
        last.content.push_str(TRUNCATED_MARKER);
    } else {
        truncate_at_char_boundary(&mut last.content, allowed);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let body = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("CONTEXT:\n{body}")
}
