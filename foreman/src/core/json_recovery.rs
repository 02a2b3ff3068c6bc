//! Low-level helpers for recovering JSON from unreliable model output.
//!
//! Scanners here are string- and escape-aware: braces inside JSON string
//! literals never affect nesting depth.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static INVISIBLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x{200B}-\x{200D}\x{FEFF}]").expect("valid invisible regex"));

static FENCED_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:json|javascript)?\s*(\{.*?\})\s*```").expect("valid fenced object regex")
});

static FENCED_ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:json|javascript)?\s*(\[\s*\{.*?\}\s*\])\s*```")
        .expect("valid fenced array regex")
});

/// Strip zero-width characters, BOMs and stray control characters.
pub fn clean(text: &str) -> String {
    INVISIBLE_RE
        .replace_all(text, "")
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Decode `text` as JSON if the whole (trimmed) string is valid.
pub fn decode(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

/// Bodies of fenced code blocks whose content is a JSON object.
pub fn fenced_objects(text: &str) -> Vec<&str> {
    FENCED_OBJECT_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// Bodies of fenced code blocks whose content is a JSON array of objects.
pub fn fenced_arrays(text: &str) -> Vec<&str> {
    FENCED_ARRAY_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// Every balanced `{...}` span in `text`, outermost first, in source order.
///
/// Nested objects are reported too, after their parent, so a key buried in a
/// wrapper object can still be found.
pub fn balanced_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut starts: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &byte) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' if !starts.is_empty() => in_string = true,
            b'{' => starts.push(idx),
            b'}' => {
                if let Some(start) = starts.pop() {
                    spans.push((starts.len(), start, idx + 1));
                }
            }
            _ => {}
        }
    }

    // Depth first, then position: outer objects before the ones they contain.
    spans.sort_by_key(|&(depth, start, _)| (depth, start));
    spans
        .into_iter()
        .map(|(_, start, end)| &text[start..end])
        .collect()
}

/// Repair JSON cut off mid-stream.
///
/// Scans from the first `{` or `[`. If the text already contains a complete
/// top-level value, the trailing garbage is trimmed. Otherwise an open string
/// is closed, a dangling separator is removed, and the missing closers are
/// appended in reverse nesting order. If that still does not decode, the
/// text is cut back to the last point that leaves every array element whole
/// and closed there.
/// Returns `None` when no opener exists.
pub fn repair_truncated(text: &str) -> Option<String> {
    let start = text.find(['{', '['])?;
    let body = &text[start..];
    let mut stack: Vec<u8> = Vec::new();
    // (end of a complete value, closers still open there)
    let mut cuts: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &byte) in body.as_bytes().iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.last() == Some(&byte) {
                    stack.pop();
                }
                if stack.is_empty() {
                    return Some(body[..=idx].to_string());
                }
                if whole_elements(&stack) {
                    cuts.push((idx + 1, stack.clone()));
                }
            }
            b',' if whole_elements(&stack) => cuts.push((idx, stack.clone())),
            _ => {}
        }
    }

    let mut repaired = body.to_string();
    if escaped {
        repaired.pop();
    }
    if in_string {
        repaired.push('"');
    }
    loop {
        let trimmed = repaired.trim_end();
        if let Some(stripped) = trimmed.strip_suffix(',') {
            repaired = stripped.to_string();
        } else {
            repaired.truncate(trimmed.len());
            break;
        }
    }
    if repaired.ends_with(':') {
        repaired.push_str("null");
    }
    close(&mut repaired, &stack);
    if decode(&repaired).is_some() {
        return Some(repaired);
    }

    for (end, open) in cuts.iter().rev() {
        let mut candidate = body[..*end].to_string();
        close(&mut candidate, open);
        if decode(&candidate).is_some() {
            return Some(candidate);
        }
    }
    Some(repaired)
}

/// A cut here keeps every array element whole: either it sits directly in an
/// array or no array encloses it.
fn whole_elements(open: &[u8]) -> bool {
    open.last() == Some(&b']') || !open.contains(&b']')
}

fn close(text: &mut String, open: &[u8]) {
    text.extend(open.iter().rev().map(|&closer| closer as char));
}
