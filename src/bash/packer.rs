//! Heuristic keep-range selection for noisy command output.
//!
//! The packer scans for lines worth keeping — error reports, stack-frame
//! lines, merge-conflict markers — and grows a small context window around
//! each hit. Windows are merged and capped to the caller's budget. When the
//! scan finds nothing at all, the packer returns an empty set and the
//! caller may hand the output to the LLM fallback instead.

use super::ranges::{KeepRange, cap_ranges, merge_ranges};
use regex::Regex;
use std::sync::LazyLock;

/// Context lines kept before each important line.
const CONTEXT_LINES_BEFORE: u32 = 2;

/// Context lines kept after each important line.
const CONTEXT_LINES_AFTER: u32 = 3;

/// Head/tail anchor size: the first and last lines of output usually carry
/// the invocation echo and the final status.
const ANCHOR_LINES: u32 = 5;

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\berror\b|\bfailed\b|\bfailure\b|\bfatal\b|panicked at|\bexception\b|\btraceback\b|assertion",
    )
    .unwrap()
});

static STACK_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    // JS/JVM frames, Python frames, rustc/cargo spans, native backtraces.
    Regex::new(
        r#"^\s+at\s+\S|^\s+File "[^"]+", line \d+|-->\s*\S+:\d+|^\s*#?\d+:\s*0x[0-9a-fA-F]+"#,
    )
    .unwrap()
});

static CONFLICT_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(<{7}|={7}|>{7}|\|{7})").unwrap());

fn is_important_line(line: &str) -> bool {
    CONFLICT_MARKER_RE.is_match(line)
        || STACK_FRAME_RE.is_match(line)
        || ERROR_LINE_RE.is_match(line)
}

/// Pick keep-ranges for `raw` under a `max_kept_lines` budget.
///
/// Returns an empty set when no line looks important; callers treat that as
/// "heuristics have no opinion" and fall back to the LLM runner or to raw
/// truncation.
pub fn pack_output_ranges(raw: &str, max_kept_lines: u32) -> Vec<KeepRange> {
    if max_kept_lines == 0 {
        return Vec::new();
    }
    let lines: Vec<&str> = raw.lines().collect();
    let total = lines.len() as u32;
    if total == 0 {
        return Vec::new();
    }

    let mut ranges: Vec<KeepRange> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if !is_important_line(line) {
            continue;
        }
        let line_no = idx as u32 + 1;
        let start = line_no.saturating_sub(CONTEXT_LINES_BEFORE).max(1);
        let end = (line_no + CONTEXT_LINES_AFTER).min(total);
        ranges.push(KeepRange::new(start, end));
    }

    if ranges.is_empty() {
        return Vec::new();
    }

    // Anchor the head and tail alongside the hits so the invocation echo
    // and final status survive trimming.
    ranges.push(KeepRange::new(1, ANCHOR_LINES.min(total)));
    ranges.push(KeepRange::new(total.saturating_sub(ANCHOR_LINES - 1).max(1), total));

    cap_ranges(merge_ranges(ranges), max_kept_lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bash::ranges::apply_keep_ranges;

    #[test]
    fn test_no_important_lines_yields_empty() {
        let raw = (1..=50)
            .map(|i| format!("listing entry {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(pack_output_ranges(&raw, 100).is_empty());
    }

    #[test]
    fn test_error_line_gets_context_window() {
        let mut lines: Vec<String> = (1..=40).map(|i| format!("line {i}")).collect();
        lines[19] = "error: something broke".to_string();
        let raw = lines.join("\n");

        let ranges = pack_output_ranges(&raw, 100);
        let out = apply_keep_ranges(&raw, &ranges);
        assert!(out.text.contains("error: something broke"));
        // Two lines of context before, three after.
        assert!(out.text.contains("line 18"));
        assert!(out.text.contains("line 23"));
    }

    #[test]
    fn test_head_and_tail_anchored_with_hits() {
        let mut lines: Vec<String> = (1..=100).map(|i| format!("line {i}")).collect();
        lines[49] = "FAILED tests/thing_test.py::test_x".to_string();
        let raw = lines.join("\n");

        let ranges = pack_output_ranges(&raw, 100);
        let out = apply_keep_ranges(&raw, &ranges);
        assert!(out.text.contains("line 1"));
        assert!(out.text.contains("line 100"));
    }

    #[test]
    fn test_budget_respected() {
        let mut lines: Vec<String> = (1..=500).map(|i| format!("line {i}")).collect();
        for i in (0..500).step_by(10) {
            lines[i] = format!("error at step {i}");
        }
        let raw = lines.join("\n");

        let ranges = pack_output_ranges(&raw, 40);
        let out = apply_keep_ranges(&raw, &ranges);
        assert!(out.kept_lines <= 40);
        assert!(out.kept_lines > 0);
    }

    #[test]
    fn test_conflict_markers_detected() {
        let raw = "a\n<<<<<<< HEAD\nours\n=======\ntheirs\n>>>>>>> branch\nb";
        let ranges = pack_output_ranges(raw, 100);
        let out = apply_keep_ranges(raw, &ranges);
        assert_eq!(out.kept_lines, 7); // small input, everything windows in
    }

    #[test]
    fn test_stack_frames_detected() {
        let raw = "\
Traceback (most recent call last):
  File \"app.py\", line 12, in <module>
    run()
ValueError: bad input";
        let ranges = pack_output_ranges(raw, 10);
        assert!(!ranges.is_empty());
    }
}
