//! Bash-output compaction: policy, heuristic range packing, LLM fallback.
//!
//! Flow for one tool call:
//!
//! 1. `policy::decide_bash_output_compaction` looks at the script and the
//!    output size counters and decides whether compaction is warranted at
//!    all, and with what kept-line budget.
//! 2. `packer::pack_output_ranges` picks keep-ranges heuristically around
//!    error-looking lines.
//! 3. When the heuristics find nothing, `fallback::FallbackRunner` asks a
//!    small single-tool model agent to pick the ranges instead.
//! 4. `ranges::apply_keep_ranges` turns the ranges into filtered output with
//!    a subset-only guarantee: every kept line is byte-identical to a line
//!    of the original.

pub mod fallback;
pub mod packer;
pub mod policy;
pub mod ranges;

pub use fallback::{FallbackOptions, FallbackRunner};
pub use packer::pack_output_ranges;
pub use policy::{
    BashOutputParams, CommandIntent, CompactionDecision, LimitsConfig, SkipReason,
    decide_bash_output_compaction,
};
pub use ranges::{FilteredOutput, KeepRange, apply_keep_ranges, cap_ranges, merge_ranges};

/// Hard ceiling on lines a bash tool result may occupy before compaction is
/// forced regardless of special cases.
pub const HARD_MAX_LINES: usize = 300;

/// Hard ceiling on bytes a bash tool result may occupy before compaction is
/// forced regardless of special cases.
pub const HARD_MAX_BYTES: usize = 48_000;

/// Line ceiling for the "small exploration output" skip. Sits above the
/// default trigger threshold so moderately-over listings pass untouched.
pub const EXPLORATION_SMALL_MAX_LINES: usize = 250;

/// Byte ceiling for the "small exploration output" skip.
pub const EXPLORATION_SMALL_MAX_BYTES: usize = 24_576;

/// Upper bound on a boosted kept-line budget. Boosts never exceed this even
/// for conflict-marker searches.
pub const BOOSTED_KEPT_LINES_CAP: u32 = 300;

/// Format the notice shown in place of dropped output.
pub fn format_saved_notice(saved_path: &str) -> String {
    format!("[output trimmed; full output saved to {saved_path}]")
}
