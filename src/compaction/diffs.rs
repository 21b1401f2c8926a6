//! Per-file diff extraction from about-to-be-compacted history.
//!
//! Walks assistant tool calls that edited files and keeps the most recent
//! diff per path, newest file first, so the reinjected attachments describe
//! where the work actually stands.

use super::pending::FileEditDiff;
use crate::compaction::MAX_EDITED_FILES;
use crate::message::{ContentPart, Message, Role};
use std::collections::HashSet;

/// Tool-name fragments that indicate a file edit.
const EDIT_TOOL_FRAGMENTS: &[&str] = &["edit", "write", "patch"];

fn is_edit_tool(name: &str) -> bool {
    let lower = name.to_lowercase();
    EDIT_TOOL_FRAGMENTS.iter().any(|f| lower.contains(f))
}

fn diff_from_arguments(path: &str, arguments: &serde_json::Value) -> Option<String> {
    if let Some(diff) = arguments.get("diff").and_then(|v| v.as_str()) {
        return Some(diff.to_string());
    }
    // No explicit diff: synthesize one from the written content.
    let content = arguments
        .get("content")
        .or_else(|| arguments.get("new_string"))
        .and_then(|v| v.as_str())?;
    Some(format!("+++ {path}\n{content}"))
}

/// Extract the edited-file diffs worth carrying across a compaction.
///
/// Newest edit wins per path; the result is ordered most-recently-edited
/// first and capped at `MAX_EDITED_FILES`.
pub fn extract_file_diffs(history: &[Message]) -> Vec<FileEditDiff> {
    let mut seen_paths: HashSet<String> = HashSet::new();
    let mut diffs: Vec<FileEditDiff> = Vec::new();

    'outer: for message in history.iter().rev() {
        if message.role != Role::Assistant {
            continue;
        }
        for part in message.parts.iter().rev() {
            let ContentPart::ToolCall {
                name, arguments, ..
            } = part
            else {
                continue;
            };
            if !is_edit_tool(name) {
                continue;
            }
            let Some(path) = arguments
                .get("path")
                .or_else(|| arguments.get("file_path"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            if !seen_paths.insert(path.to_string()) {
                continue;
            }
            let Some(diff) = diff_from_arguments(path, arguments) else {
                continue;
            };
            diffs.push(FileEditDiff::new(path, diff));
            if diffs.len() >= MAX_EDITED_FILES {
                break 'outer;
            }
        }
    }

    diffs
}
