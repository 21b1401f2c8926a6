//! Budgeted expansion of mention tokens into synthetic context messages.

use super::token::{MentionToken, guess_language, parse_mentions, resolve_within_workspace};
use super::{
    MAX_FILE_CONTENT_BYTES, MAX_FILE_LINES, MAX_LINE_BYTES, MAX_MENTIONS_PER_PASS,
    MAX_SOURCE_FILE_BYTES, MAX_TOTAL_INJECTED_BYTES,
};
use crate::message::{Message, Role};
use crate::stores::Runtime;
use crate::util::truncate_utf8;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// A materialized mention block plus its budget cost.
struct MentionBlock {
    text: String,
    content_bytes: usize,
}

/// Expand `@file` mentions across the conversation.
///
/// Scans non-synthetic user messages newest-first and turns each fresh,
/// resolvable mention into a fenced content block. Blocks for a message are
/// inserted as one synthetic message immediately before it. Messages whose
/// mentions were materialized get those tokens appended to their
/// `file_mention_snapshot` so the content is never re-read.
///
/// Every resolution failure (escaping path, missing file, directory,
/// oversized file, binary content) silently skips that single mention.
pub async fn inject_file_mentions(
    mut messages: Vec<Message>,
    runtime: &dyn Runtime,
    workspace_root: &Path,
) -> Vec<Message> {
    let mut seen: HashSet<String> = messages
        .iter()
        .flat_map(|m| m.meta.file_mention_snapshot.iter().cloned())
        .collect();

    let mut remaining_bytes = MAX_TOTAL_INJECTED_BYTES;
    let mut remaining_mentions = MAX_MENTIONS_PER_PASS;

    // (target index, blocks, materialized raw tokens), newest target first.
    let mut insertions: Vec<(usize, Vec<String>, Vec<String>)> = Vec::new();

    for index in (0..messages.len()).rev() {
        let message = &messages[index];
        if message.role != Role::User || message.meta.synthetic {
            continue;
        }
        let text = message.text();
        let tokens = parse_mentions(&text);
        if tokens.is_empty() {
            continue;
        }

        let mut blocks = Vec::new();
        let mut materialized = Vec::new();
        for token in tokens {
            if remaining_mentions == 0 || remaining_bytes == 0 {
                break;
            }
            if !seen.insert(token.raw.clone()) {
                continue;
            }
            match materialize(runtime, workspace_root, &token, remaining_bytes).await {
                Some(block) => {
                    remaining_bytes = remaining_bytes.saturating_sub(block.content_bytes);
                    remaining_mentions -= 1;
                    blocks.push(block.text);
                    materialized.push(token.raw);
                }
                None => {
                    debug!(token = %token.raw, "mention not resolvable, skipped");
                }
            }
        }
        if !blocks.is_empty() {
            insertions.push((index, blocks, materialized));
        }
    }

    // Insert newest-first so earlier indices stay valid.
    for (index, blocks, materialized) in insertions {
        messages[index]
            .meta
            .file_mention_snapshot
            .extend(materialized);
        let synthetic = Message::synthetic_user(blocks.join("\n\n"));
        messages.insert(index, synthetic);
    }

    messages
}

async fn materialize(
    runtime: &dyn Runtime,
    workspace_root: &Path,
    token: &MentionToken,
    remaining_total_bytes: usize,
) -> Option<MentionBlock> {
    let absolute = resolve_within_workspace(workspace_root, &token.path)?;

    let stat = runtime.stat(&absolute).await.ok()?;
    if stat.is_directory || stat.size > MAX_SOURCE_FILE_BYTES {
        return None;
    }

    let content = runtime.read_file_string(&absolute).await.ok()?;
    if content.contains('\0') {
        return None; // binary-looking
    }

    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return None;
    }
    let total = lines.len();

    let (requested_start, requested_end) = match token.range {
        Some((a, b)) => {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            (lo.max(1) as usize, hi as usize)
        }
        None => (1, total),
    };
    if requested_start > total {
        return None;
    }
    let requested_end = requested_end.min(total);

    let file_budget = MAX_FILE_CONTENT_BYTES.min(remaining_total_bytes);
    let mut kept: Vec<&str> = Vec::new();
    let mut used_bytes = 0usize;
    let mut truncated = false;
    let mut served_end = requested_start - 1;

    for (offset, line) in lines[requested_start - 1..requested_end].iter().enumerate() {
        if kept.len() >= MAX_FILE_LINES {
            truncated = true;
            break;
        }
        let (clamped, line_cut) = truncate_utf8(line, MAX_LINE_BYTES);
        if line_cut {
            truncated = true;
        }
        let cost = clamped.len() + 1; // newline
        if used_bytes + cost > file_budget {
            truncated = true;
            break;
        }
        used_bytes += cost;
        kept.push(clamped);
        served_end = requested_start + offset;
    }

    if kept.is_empty() {
        return None;
    }

    let language = guess_language(&token.path);
    let truncated_attr = if truncated { " truncated=\"true\"" } else { "" };
    let text = format!(
        "```{language} path=\"{path}\" lines=\"{start}-{end}\"{truncated_attr}\n{body}\n```",
        path = token.path,
        start = requested_start,
        end = served_end,
        body = kept.join("\n"),
    );

    Some(MentionBlock {
        text,
        content_bytes: used_bytes,
    })
}
