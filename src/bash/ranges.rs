//! Keep-range normalization, merging, capping and application.
//!
//! Ranges come from two untrusted sources — heuristics and model tool
//! calls — so application is defensive throughout: inverted pairs are
//! swapped at construction, out-of-bounds ranges are clamped to the real
//! line count, and the result is always a verbatim subset of the input
//! lines, never synthesized or reordered.

/// An inclusive, 1-indexed line interval selected for retention.
///
/// The constructor normalizes, so a held `KeepRange` always satisfies
/// `1 <= start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepRange {
    start: u32,
    end: u32,
}

impl KeepRange {
    /// Build a range from a possibly-inverted pair. `new(10, 2)` is the
    /// same range as `new(2, 10)`; zero endpoints are lifted to line 1.
    pub fn new(a: u32, b: u32) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self {
            start: lo.max(1),
            end: hi.max(1),
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of lines covered; a normalized range always covers at least
    /// one line.
    pub fn line_count(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Clamp to `1..=total_lines`; `None` if the range lies entirely past
    /// the end of the output.
    pub fn clamp_to(&self, total_lines: u32) -> Option<KeepRange> {
        if total_lines == 0 || self.start > total_lines {
            return None;
        }
        Some(KeepRange {
            start: self.start,
            end: self.end.min(total_lines),
        })
    }

    fn overlaps_or_adjacent(&self, other: &KeepRange) -> bool {
        // Adjacent means no gap between end and the next start.
        other.start <= self.end.saturating_add(1)
    }
}

/// Merge overlapping and adjacent ranges into a sorted, disjoint set.
pub fn merge_ranges(mut ranges: Vec<KeepRange>) -> Vec<KeepRange> {
    if ranges.is_empty() {
        return ranges;
    }
    ranges.sort_by_key(|r| (r.start, r.end));

    let mut merged: Vec<KeepRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.overlaps_or_adjacent(&range) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Truncate a sorted, disjoint range set to at most `max_kept_lines` total
/// lines, splitting the boundary range if needed.
pub fn cap_ranges(ranges: Vec<KeepRange>, max_kept_lines: u32) -> Vec<KeepRange> {
    if max_kept_lines == 0 {
        return Vec::new();
    }
    let mut budget = max_kept_lines;
    let mut capped = Vec::with_capacity(ranges.len());
    for range in ranges {
        if budget == 0 {
            break;
        }
        if range.line_count() <= budget {
            budget -= range.line_count();
            capped.push(range);
        } else {
            capped.push(KeepRange::new(range.start, range.start + budget - 1));
            budget = 0;
        }
    }
    capped
}

/// Filtered output plus line accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredOutput {
    pub text: String,
    pub kept_lines: usize,
    pub total_lines: usize,
}

/// Apply keep-ranges to raw output.
///
/// Ranges are normalized (merged, clamped to the real line count) before
/// application. Every line of the result appears verbatim in the input, in
/// input order.
pub fn apply_keep_ranges(raw: &str, ranges: &[KeepRange]) -> FilteredOutput {
    let lines: Vec<&str> = raw.lines().collect();
    let total_lines = lines.len();

    let clamped: Vec<KeepRange> = ranges
        .iter()
        .filter_map(|r| r.clamp_to(total_lines as u32))
        .collect();
    let merged = merge_ranges(clamped);

    let mut kept: Vec<&str> = Vec::new();
    for range in &merged {
        // 1-indexed inclusive to 0-indexed slice bounds.
        let start = (range.start - 1) as usize;
        let end = range.end as usize;
        kept.extend_from_slice(&lines[start..end]);
    }

    FilteredOutput {
        kept_lines: kept.len(),
        text: kept.join("\n"),
        total_lines,
    }
}
