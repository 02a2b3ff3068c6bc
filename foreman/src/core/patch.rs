//! In-memory application of patch edits.

use serde::Serialize;

use crate::core::plan::PatchEdit;

/// Result of one edit within a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    pub index: usize,
    pub success: bool,
    pub message: String,
}

/// Apply `edits` in order. A failed edit leaves the content as the previous
/// edit produced it; later edits still run.
pub fn apply_edits(content: &str, edits: &[PatchEdit]) -> (String, Vec<EditOutcome>) {
    let mut current = content.to_string();
    let mut outcomes = Vec::with_capacity(edits.len());

    for (index, edit) in edits.iter().enumerate() {
        let outcome = match apply_edit(&current, edit) {
            Ok((next, message)) => {
                current = next;
                EditOutcome {
                    index,
                    success: true,
                    message,
                }
            }
            Err(message) => EditOutcome {
                index,
                success: false,
                message,
            },
        };
        outcomes.push(outcome);
    }

    (current, outcomes)
}

fn apply_edit(content: &str, edit: &PatchEdit) -> Result<(String, String), String> {
    match edit {
        PatchEdit::Replace { search, replace } => {
            if search.is_empty() {
                return Err("replace requires a non-empty search string".to_string());
            }
            let count = content.matches(search.as_str()).count();
            if count == 0 {
                return Err("search string not found".to_string());
            }
            Ok((
                content.replace(search.as_str(), replace),
                format!("replaced {count} occurrence(s)"),
            ))
        }
        PatchEdit::Insert { after, content: insert } => {
            if after.is_empty() {
                return Err("insert requires a non-empty anchor".to_string());
            }
            let count = content.matches(after.as_str()).count();
            if count == 0 {
                return Err("anchor not found".to_string());
            }
            Ok((
                content.replace(after.as_str(), &format!("{after}\n{insert}")),
                format!("inserted after {count} anchor(s)"),
            ))
        }
        PatchEdit::Append { content: tail } => {
            Ok((format!("{content}\n{tail}"), "appended".to_string()))
        }
        PatchEdit::Prepend { content: head } => {
            Ok((format!("{head}\n{content}"), "prepended".to_string()))
        }
    }
}
