//! Recover milestone and action plans from free-form model output.
//!
//! Resolution order, first success wins:
//!
//! 1. whole-text JSON (recursing into string wrappers such as `response`)
//! 2. JSON objects in fenced code blocks
//! 3. balanced-brace objects carrying the plan key, then truncation repair
//! 4. fenced JSON arrays
//! 5. a lazy single-capture regex
//! 6. `## Milestone N: Title` headings (milestones only)

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::json_recovery::{
    balanced_objects, clean, decode, fenced_arrays, fenced_objects, repair_truncated,
};
use crate::core::plan::{Action, CodeBlock, FileChange, MilestoneDraft, empty_object};
use crate::core::role::AgentRole;
use crate::error::PlanParseError;

/// String fields that often wrap the real payload one level down.
const WRAPPER_KEYS: [&str; 5] = ["raw_content", "response", "content", "message", "text"];
const MAX_WRAPPER_DEPTH: usize = 3;

static LAZY_MILESTONES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{[\s\S]*?"milestones"[\s\S]*?\}"#).expect("valid milestones regex")
});

static LAZY_ACTIONS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{[\s\S]*?"actions"[\s\S]*?\}"#).expect("valid actions regex")
});

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#+\s*(?:milestone|step)\b\s*\d*[.:)]*\s*(.*)$").expect("valid heading regex")
});

static NAMED_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?:File|Path|Update|Create):\s*`?([^\s`]+)`?\s*\n```[\w.+-]*\n([\s\S]*?)```")
        .expect("valid named block regex")
});

static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```([\w.+-]*)\n([\s\S]*?)```").expect("valid code block regex"));

/// Parse a milestone plan. Items without a title are dropped; items without a
/// recognizable role get one inferred from their title.
pub fn parse_milestones(text: &str) -> Result<Vec<MilestoneDraft>, PlanParseError> {
    let cleaned = clean(text);
    let drafts = milestones_from(&cleaned, 0)
        .or_else(|| milestones_from_headings(&cleaned))
        .unwrap_or_default();
    if drafts.is_empty() {
        return Err(PlanParseError::NoMilestones { len: text.len() });
    }
    Ok(drafts)
}

fn milestones_from(text: &str, depth: usize) -> Option<Vec<MilestoneDraft>> {
    if let Some(value) = decode(text) {
        if let Some(drafts) = milestone_list(&value) {
            return Some(drafts);
        }
        if depth < MAX_WRAPPER_DEPTH {
            for key in WRAPPER_KEYS {
                if let Some(Value::String(inner)) = value.get(key)
                    && !inner.trim().is_empty()
                    && inner != text
                    && let Some(drafts) = milestones_from(inner, depth + 1)
                    && !drafts.is_empty()
                {
                    return Some(drafts);
                }
            }
        }
    }

    fenced_objects(text)
        .into_iter()
        .filter_map(decode)
        .find_map(|value| milestone_list(&value))
        .or_else(|| keyed_object(text, "milestones").and_then(|v| milestone_list(&v)))
        .or_else(|| {
            fenced_arrays(text)
                .into_iter()
                .filter_map(decode)
                .find_map(|value| milestone_array(&value))
        })
        .or_else(|| {
            LAZY_MILESTONES_RE
                .find(text)
                .and_then(|m| decode(m.as_str()))
                .and_then(|value| milestone_list(&value))
        })
}

/// `{"milestones": [...]}` or a bare array of titled objects.
fn milestone_list(value: &Value) -> Option<Vec<MilestoneDraft>> {
    match value.get("milestones") {
        Some(Value::Array(items)) => Some(normalize_milestones(items)),
        _ => milestone_array(value),
    }
}

fn milestone_array(value: &Value) -> Option<Vec<MilestoneDraft>> {
    let items = value.as_array()?;
    items.first()?.get("title")?;
    Some(normalize_milestones(items))
}

fn normalize_milestones(items: &[Value]) -> Vec<MilestoneDraft> {
    items.iter().filter_map(normalize_milestone).collect()
}

fn normalize_milestone(item: &Value) -> Option<MilestoneDraft> {
    let obj = item.as_object()?;
    let title = str_field(obj, &["title", "name"])?.trim().to_string();
    if title.is_empty() {
        return None;
    }
    let agent_role = str_field(obj, &["agent_type", "agent_role", "role"])
        .and_then(|raw| raw.parse::<AgentRole>().ok())
        .unwrap_or_else(|| AgentRole::infer_from_title(&title));
    Some(MilestoneDraft {
        description: str_field(obj, &["description"]).unwrap_or_default().to_string(),
        input_data: object_field(obj, "input_data"),
        metadata: object_field(obj, "metadata"),
        title,
        agent_role,
    })
}

fn milestones_from_headings(text: &str) -> Option<Vec<MilestoneDraft>> {
    let mut drafts: Vec<MilestoneDraft> = Vec::new();
    let mut in_milestone = false;

    for line in text.lines().map(str::trim) {
        if let Some(caps) = HEADING_RE.captures(line) {
            let title = caps.get(1).map_or("", |m| m.as_str()).trim();
            in_milestone = !title.is_empty();
            if in_milestone {
                drafts.push(MilestoneDraft::new(
                    title,
                    "",
                    AgentRole::infer_from_title(title),
                ));
            }
        } else if line.starts_with('#') {
            in_milestone = false;
        } else if in_milestone
            && !line.is_empty()
            && let Some(current) = drafts.last_mut()
        {
            if !current.description.is_empty() {
                current.description.push('\n');
            }
            current.description.push_str(line);
        }
    }

    (!drafts.is_empty()).then_some(drafts)
}

/// Actions recovered from an execution-plan reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionPlan {
    pub actions: Vec<Action>,
    /// Items that looked like actions but did not decode, with the reason.
    pub rejected: Vec<String>,
}

/// Parse an execution plan (`{"actions": [...]}` or a bare array).
///
/// Individual items that fail to decode are reported in
/// [`ActionPlan::rejected`] rather than failing the whole plan.
pub fn parse_actions(text: &str) -> Result<ActionPlan, PlanParseError> {
    let cleaned = clean(text);
    let items = action_items(&cleaned, 0).unwrap_or_default();
    if items.is_empty() {
        return Err(PlanParseError::NoActions { len: text.len() });
    }

    let mut plan = ActionPlan::default();
    for (index, item) in items.into_iter().enumerate() {
        let item = normalize_action(item);
        match serde_json::from_value::<Action>(item) {
            Ok(action) => plan.actions.push(action),
            Err(err) => plan.rejected.push(format!("action {index}: {err}")),
        }
    }
    Ok(plan)
}

fn action_items(text: &str, depth: usize) -> Option<Vec<Value>> {
    if let Some(value) = decode(text) {
        if let Some(items) = action_list(&value) {
            return Some(items);
        }
        if depth < MAX_WRAPPER_DEPTH {
            for key in WRAPPER_KEYS {
                if let Some(Value::String(inner)) = value.get(key)
                    && inner != text
                    && let Some(items) = action_items(inner, depth + 1)
                {
                    return Some(items);
                }
            }
        }
    }

    fenced_objects(text)
        .into_iter()
        .filter_map(decode)
        .find_map(|value| action_list(&value))
        .or_else(|| keyed_object(text, "actions").and_then(|v| action_list(&v)))
        .or_else(|| {
            fenced_arrays(text)
                .into_iter()
                .filter_map(decode)
                .find_map(|value| action_list(&value))
        })
        .or_else(|| {
            LAZY_ACTIONS_RE
                .find(text)
                .and_then(|m| decode(m.as_str()))
                .and_then(|value| action_list(&value))
        })
}

fn action_list(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Object(obj) => match obj.get("actions") {
            Some(Value::Array(items)) => Some(items.clone()),
            _ => None,
        },
        Value::Array(items) if items.first().and_then(|i| i.get("action")).is_some() => {
            Some(items.clone())
        }
        _ => None,
    }
}

/// Default untyped edits to `replace` so they decode as [`crate::core::plan::PatchEdit`].
fn normalize_action(mut item: Value) -> Value {
    for key in ["edits", "patches"] {
        if let Some(Value::Array(edits)) = item.get_mut(key) {
            default_edit_types(edits);
        }
    }
    item
}

fn default_edit_types(edits: &mut [Value]) {
    for edit in edits {
        if let Some(obj) = edit.as_object_mut() {
            obj.entry("type")
                .or_insert_with(|| Value::String("replace".to_string()));
        }
    }
}

/// Extract the first JSON object carrying any of `keys`.
///
/// Tries fenced objects, the whole text, balanced-brace objects and finally
/// truncation repair.
pub fn extract_keyed_json(text: &str, keys: &[&str]) -> Option<Value> {
    let cleaned = clean(text);
    let has_key = |value: &Value| keys.iter().any(|key| value.get(key).is_some());

    if let Some(value) = fenced_objects(&cleaned)
        .into_iter()
        .filter_map(decode)
        .find(|value| has_key(value))
    {
        return Some(value);
    }
    if let Some(value) = decode(&cleaned).filter(|value| value.is_object()) {
        return Some(value);
    }
    keys.iter().find_map(|key| keyed_object(&cleaned, key))
}

/// Balanced-brace search for an object carrying `key`, repairing truncation.
fn keyed_object(text: &str, key: &str) -> Option<Value> {
    let needle = format!("\"{key}\"");
    if let Some(value) = balanced_objects(text)
        .into_iter()
        .filter(|candidate| candidate.contains(&needle))
        .filter_map(decode)
        .find(|value| value.get(key).is_some())
    {
        return Some(value);
    }

    // Truncated output: repair from the nearest opener before the key.
    let key_at = text.find(&needle)?;
    let start = text[..key_at].rfind('{')?;
    repair_truncated(&text[start..])
        .and_then(|repaired| decode(&repaired))
        .filter(|value| value.get(key).is_some())
}

/// File changes announced in a reply, from JSON `file_changes` or from
/// `File: path` labels followed by a fenced block.
pub fn extract_file_changes(text: &str) -> Vec<FileChange> {
    if let Some(value) = extract_keyed_json(text, &["file_changes"])
        && let Some(Value::Array(items)) = value.get("file_changes")
    {
        let changes: Vec<FileChange> = items
            .iter()
            .cloned()
            .filter_map(|mut item| {
                if let Some(Value::Array(patches)) = item.get_mut("patches") {
                    default_edit_types(patches);
                }
                serde_json::from_value(item).ok()
            })
            .collect();
        if !changes.is_empty() {
            return changes;
        }
    }

    NAMED_BLOCK_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let path = caps.get(1)?.as_str().trim().to_string();
            let content = caps.get(2)?.as_str().to_string();
            Some(FileChange {
                path,
                content: Some(content),
                patches: Vec::new(),
            })
        })
        .collect()
}

/// Every fenced code block, with the path label preceding it when present.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let named: Vec<(usize, String)> = NAMED_BLOCK_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let path = caps.get(1)?.as_str().trim().to_string();
            let body_start = caps.get(2)?.start();
            Some((body_start, path))
        })
        .collect();

    CODE_BLOCK_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let body = caps.get(2)?;
            let language = caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .filter(|lang| !lang.is_empty());
            let path = named
                .iter()
                .find(|(start, _)| *start == body.start())
                .map(|(_, path)| path.clone());
            Some(CodeBlock {
                path,
                language,
                content: body.as_str().to_string(),
            })
        })
        .collect()
}

fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| obj.get(*key).and_then(Value::as_str))
}

fn object_field(obj: &Map<String, Value>, key: &str) -> Value {
    match obj.get(key) {
        Some(value @ Value::Object(_)) => value.clone(),
        _ => empty_object(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::PatchEdit;
    use serde_json::json;

    fn sample() -> Vec<MilestoneDraft> {
        vec![
            MilestoneDraft {
                input_data: json!({"scope": "auth"}),
                ..MilestoneDraft::new("Analyze login flow", "Collect constraints", AgentRole::Ba)
            },
            MilestoneDraft::new("Implement login", "Write the handler", AgentRole::Dev),
            MilestoneDraft::new("Test login", "", AgentRole::Qa),
        ]
    }

    fn serialized() -> String {
        serde_json::to_string(&json!({ "milestones": sample() })).expect("serialize")
    }

    #[test]
    fn well_formed_json_round_trips() {
        assert_eq!(parse_milestones(&serialized()), Ok(sample()));
    }

    #[test]
    fn truncated_json_is_repaired() {
        let full = serialized();
        // Drop the final closing brace, then everything from the array close on.
        let one = &full[..full.len() - 1];
        assert_eq!(parse_milestones(one), Ok(sample()));
        let two = &full[..full.len() - 2];
        assert_eq!(parse_milestones(two), Ok(sample()));
    }

    #[test]
    fn truncated_json_inside_prose_is_repaired() {
        let full = serialized();
        let text = format!("Here is the plan:\n{}", &full[..full.len() - 2]);
        assert_eq!(parse_milestones(&text), Ok(sample()));
    }

    #[test]
    fn reply_cut_inside_a_later_milestone_keeps_the_complete_ones() {
        let text = r#"Plan: {"milestones":[{"title":"Gather requirements","agent_type":"ba"},{"title":"Build","desc"#;
        let drafts = parse_milestones(text).expect("parse");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "Gather requirements");
        assert_eq!(drafts[0].agent_role, AgentRole::Ba);
    }

    #[test]
    fn strips_zero_width_characters() {
        let text = format!("\u{FEFF}{}\u{200B}", serialized());
        assert_eq!(parse_milestones(&text), Ok(sample()));
    }

    #[test]
    fn reads_fenced_block_inside_prose() {
        let text = format!("Sure!\n```json\n{}\n```\nLet me know.", serialized());
        assert_eq!(parse_milestones(&text), Ok(sample()));
    }

    #[test]
    fn reads_embedded_object_with_braces_in_strings() {
        let text = r#"Plan follows {"milestones":[{"title":"Implement {braces}","agent_type":"dev"}]} done"#;
        let drafts = parse_milestones(text).expect("parse");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "Implement {braces}");
    }

    #[test]
    fn unwraps_string_wrappers() {
        let inner = serialized();
        let text = serde_json::to_string(&json!({ "response": inner })).expect("serialize");
        assert_eq!(parse_milestones(&text), Ok(sample()));
    }

    #[test]
    fn reads_fenced_array() {
        let text = "```json\n[{\"title\": \"Write docs\"}, {\"title\": \"Testing\"}]\n```";
        let drafts = parse_milestones(text).expect("parse");
        let roles: Vec<AgentRole> = drafts.iter().map(|d| d.agent_role).collect();
        assert_eq!(roles, vec![AgentRole::Doc, AgentRole::Qa]);
    }

    #[test]
    fn infers_missing_roles_and_defaults_payloads() {
        let drafts =
            parse_milestones(r#"{"milestones":[{"title":"Design the dashboard"}]}"#).expect("parse");
        assert_eq!(drafts[0].agent_role, AgentRole::Ux);
        assert_eq!(drafts[0].input_data, json!({}));
        assert_eq!(drafts[0].description, "");
    }

    #[test]
    fn falls_back_to_markdown_headings() {
        let text = "# Plan\n## Milestone 1: Requirements gathering\nTalk to users.\nList needs.\n\n## Milestone 2: Implement API\nBuild endpoints.\n### Step 3: Testing\n";
        let drafts = parse_milestones(text).expect("parse");
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].title, "Requirements gathering");
        assert_eq!(drafts[0].agent_role, AgentRole::Ba);
        assert_eq!(drafts[0].description, "Talk to users.\nList needs.");
        assert_eq!(drafts[1].agent_role, AgentRole::Dev);
        assert_eq!(drafts[2].agent_role, AgentRole::Qa);
    }

    #[test]
    fn plural_heading_is_not_a_milestone() {
        let text = "## Milestones Overview\nThree phases follow.\n## Milestone 1: Gather requirements\nInterview users.\n## Steps taken so far\nNone yet.\n## Step 2. Build it\n";
        let drafts = parse_milestones(text).expect("parse");
        let titles: Vec<&str> = drafts.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["Gather requirements", "Build it"]);
        assert_eq!(drafts[0].description, "Interview users.");
    }

    #[test]
    fn empty_text_is_a_parse_failure() {
        assert_eq!(
            parse_milestones(""),
            Err(PlanParseError::NoMilestones { len: 0 })
        );
        assert!(parse_milestones("I could not produce a plan.").is_err());
    }

    #[test]
    fn parses_actions_and_reports_rejects() {
        let text = r#"```json
{"actions": [
  {"action": "create_folder", "path": "src/auth"},
  {"action": "patch_file", "path": "src/lib.rs", "edits": [{"search": "a", "replace": "b"}]},
  {"action": "teleport", "path": "x"}
]}
```"#;
        let plan = parse_actions(text).expect("parse");
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(
            plan.actions[1],
            Action::PatchFile {
                path: "src/lib.rs".to_string(),
                edits: vec![PatchEdit::Replace {
                    search: "a".to_string(),
                    replace: "b".to_string()
                }],
            }
        );
    }

    #[test]
    fn parses_bare_action_array() {
        let plan = parse_actions(r#"[{"action":"delete_file","path":"old.txt"}]"#).expect("parse");
        assert_eq!(plan.actions[0].kind(), "delete_file");
    }

    #[test]
    fn extracts_named_file_blocks() {
        let text = "Here you go.\nFile: src/main.rs\n```rust\nfn main() {}\n```\nand\n```text\nloose\n```";
        let changes = extract_file_changes(text);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "src/main.rs");
        assert_eq!(changes[0].content.as_deref(), Some("fn main() {}\n"));

        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].path.as_deref(), Some("src/main.rs"));
        assert_eq!(blocks[0].language.as_deref(), Some("rust"));
        assert_eq!(blocks[1].path, None);
    }

    #[test]
    fn extracts_json_file_changes_with_default_patch_type() {
        let text = r#"{"file_changes":[{"path":"a.md","patches":[{"search":"x","replace":"y"}]}]}"#;
        let changes = extract_file_changes(text);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].patches.len(), 1);
    }
}
