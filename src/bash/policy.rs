//! The bash-output compaction decision.
//!
//! `decide_bash_output_compaction` is a pure function over the script text
//! and the output size counters. It decides *whether* compaction should run
//! and with what kept-line budget; picking the actual lines is the packer's
//! job.
//!
//! Every "skip this special case" and "boost the budget" path is gated on
//! the caller still running default limits. A user who customized their
//! thresholds or budget gets them applied verbatim, with no silent
//! overrides.

use super::{
    BOOSTED_KEPT_LINES_CAP, EXPLORATION_SMALL_MAX_BYTES, EXPLORATION_SMALL_MAX_LINES,
    HARD_MAX_BYTES, HARD_MAX_LINES,
};
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

/// Output-size limits for bash tool results.
///
/// Hosts may deserialize this from their config file; any deviation from
/// the defaults disables the special-case skips and budget boosts below.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LimitsConfig {
    /// Line count above which compaction is considered.
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,
    /// Byte count above which compaction is considered.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Kept-line budget handed to the packer when compaction proceeds.
    #[serde(default = "default_max_kept_lines")]
    pub max_kept_lines: u32,
}

fn default_max_output_lines() -> usize {
    200
}

fn default_max_output_bytes() -> usize {
    20_000
}

fn default_max_kept_lines() -> u32 {
    100
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_output_lines: default_max_output_lines(),
            max_output_bytes: default_max_output_bytes(),
            max_kept_lines: default_max_kept_lines(),
        }
    }
}

impl LimitsConfig {
    /// Whether the caller is still on stock limits. Special-case skips and
    /// budget boosts only apply then.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Why compaction was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BelowThreshold,
    AlreadyTargetedScript,
    PlanFileInScript,
    ConflictMarkerSearchWithinLimits,
    ExplorationOutputSmall,
}

/// Coarse classification of what a command was trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandIntent {
    /// Reading the workspace: listings, searches, git status.
    Exploration,
    /// Build/test/install runs that stream logs.
    Logs,
    Unknown,
}

/// Pure output of the policy; consumed by the tool-output pipeline and
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionDecision {
    pub should_compact: bool,
    pub skip_reason: Option<SkipReason>,
    pub triggered_by_lines: bool,
    pub triggered_by_bytes: bool,
    pub already_targeted: bool,
    pub intent: CommandIntent,
    pub effective_max_kept_lines: u32,
}

impl CompactionDecision {
    fn skip(reason: SkipReason, partial: Self) -> Self {
        Self {
            should_compact: false,
            skip_reason: Some(reason),
            ..partial
        }
    }
}

/// Inputs to the policy for one tool invocation.
#[derive(Debug, Clone)]
pub struct BashOutputParams<'a> {
    /// Tool identifier; special-case handling applies to `"bash"` only.
    pub tool_name: &'a str,
    /// Human-readable invocation label shown in the transcript.
    pub display_name: &'a str,
    /// The shell script that was run.
    pub script: &'a str,
    /// Line count of the raw output.
    pub total_lines: usize,
    /// Byte count of the raw output.
    pub total_bytes: usize,
    /// Configured plan-file path in tilde form (e.g. `~/.agent/plan.md`),
    /// if the session has one.
    pub plan_file_path: Option<&'a str>,
}

/// Decide whether (and how hard) to compact one command's output.
pub fn decide_bash_output_compaction(
    params: &BashOutputParams<'_>,
    limits: &LimitsConfig,
) -> CompactionDecision {
    let triggered_by_lines = params.total_lines > limits.max_output_lines;
    let triggered_by_bytes = params.total_bytes > limits.max_output_bytes;

    let base = CompactionDecision {
        should_compact: false,
        skip_reason: None,
        triggered_by_lines,
        triggered_by_bytes,
        already_targeted: false,
        intent: CommandIntent::Unknown,
        effective_max_kept_lines: limits.max_kept_lines,
    };

    // Cheapest path first: nothing exceeded, nothing to do.
    if !triggered_by_lines && !triggered_by_bytes {
        return CompactionDecision::skip(SkipReason::BelowThreshold, base);
    }

    if params.tool_name != "bash" {
        // Non-bash tool outputs get the plain budget with no special cases.
        return CompactionDecision {
            should_compact: true,
            ..base
        };
    }

    let intent = classify_intent(params.display_name, params.script);
    let already_targeted = script_already_targets_output(params.script);
    let defaults_in_effect = limits.is_default();
    let conflict_search = is_conflict_marker_search(params.script);
    let within_hard_limits =
        params.total_lines <= HARD_MAX_LINES && params.total_bytes <= HARD_MAX_BYTES;

    let base = CompactionDecision {
        already_targeted,
        intent,
        ..base
    };

    if defaults_in_effect {
        // The script already limits its own output; trimming further would
        // remove exactly what the caller asked for.
        if already_targeted {
            return CompactionDecision::skip(SkipReason::AlreadyTargetedScript, base);
        }

        // The plan file is the conversation's source of truth and must
        // never be silently truncated.
        if let Some(plan_path) = params.plan_file_path
            && script_reads_plan_file(params.script, plan_path)
        {
            return CompactionDecision::skip(SkipReason::PlanFileInScript, base);
        }

        if conflict_search && within_hard_limits {
            return CompactionDecision::skip(SkipReason::ConflictMarkerSearchWithinLimits, base);
        }

        if intent == CommandIntent::Exploration
            && params.total_lines <= EXPLORATION_SMALL_MAX_LINES
            && params.total_bytes <= EXPLORATION_SMALL_MAX_BYTES
        {
            return CompactionDecision::skip(SkipReason::ExplorationOutputSmall, base);
        }
    }

    let mut effective_max_kept_lines = limits.max_kept_lines;
    if defaults_in_effect && (conflict_search || intent == CommandIntent::Exploration) {
        effective_max_kept_lines = BOOSTED_KEPT_LINES_CAP;
    }

    CompactionDecision {
        should_compact: true,
        effective_max_kept_lines,
        ..base
    }
}

/// Command words whose presence means "just a wrapper, look at the next
/// word".
const WRAPPER_WORDS: &[&str] = &["sudo", "command", "env", "nice", "time", "nohup", "stdbuf"];

const EXPLORATION_COMMANDS: &[&str] = &[
    "ls", "find", "fd", "rg", "grep", "cat", "head", "tree", "wc", "stat", "du", "file", "which",
    "type", "pwd",
];

const LOGS_COMMANDS: &[&str] = &[
    "make", "npm", "yarn", "pnpm", "bun", "cargo", "mvn", "gradle", "go", "pytest", "jest",
    "vitest", "tsc",
];

/// Git subcommands that read rather than mutate.
const GIT_EXPLORATION_SUBCOMMANDS: &[&str] = &["status", "log", "diff", "show", "branch"];

fn first_command_word(script: &str) -> Option<String> {
    let words = shlex::split(script)?;
    let mut iter = words.into_iter();
    while let Some(word) = iter.next() {
        // Skip VAR=value assignments, option flags and wrapper commands.
        if word.contains('=') || word.starts_with('-') {
            continue;
        }
        let basename = word.rsplit('/').next().unwrap_or(&word).to_string();
        if WRAPPER_WORDS.contains(&basename.as_str()) {
            continue;
        }
        if basename == "git" {
            // Classify by the subcommand.
            for next in iter.by_ref() {
                if !next.starts_with('-') {
                    return Some(format!("git {next}"));
                }
            }
            return Some("git".to_string());
        }
        return Some(basename);
    }
    None
}

fn classify_intent(display_name: &str, script: &str) -> CommandIntent {
    let label = display_name.to_lowercase();
    if ["search", "list", "explore", "find", "read", "inspect"]
        .iter()
        .any(|kw| label.contains(kw))
    {
        return CommandIntent::Exploration;
    }
    if ["build", "test", "install", "compile", "lint"]
        .iter()
        .any(|kw| label.contains(kw))
    {
        return CommandIntent::Logs;
    }

    match first_command_word(script) {
        Some(word) => {
            if let Some(sub) = word.strip_prefix("git ") {
                if GIT_EXPLORATION_SUBCOMMANDS.contains(&sub) {
                    CommandIntent::Exploration
                } else {
                    CommandIntent::Unknown
                }
            } else if EXPLORATION_COMMANDS.contains(&word.as_str()) {
                CommandIntent::Exploration
            } else if LOGS_COMMANDS.contains(&word.as_str()) {
                CommandIntent::Logs
            } else {
                CommandIntent::Unknown
            }
        }
        None => CommandIntent::Unknown,
    }
}

static SED_RANGE_ARG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+,\s*(\d+|\$)\s*p$").unwrap());

static AWK_NR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"NR\s*(==|<=|>=|<|>)").unwrap());

/// Detect whether the script already limits its own output with `head`,
/// `tail`, `sed -n 'a,bp'` or an `awk 'NR...'` guard, including behind
/// `sudo`/`command`-style wrappers, anywhere in a pipeline.
pub fn script_already_targets_output(script: &str) -> bool {
    for segment in script.split('|') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let Some(words) = shlex::split(segment) else {
            continue;
        };
        let mut command: Option<&str> = None;
        for word in &words {
            if word.contains('=') || word.starts_with('-') {
                continue;
            }
            let basename = word.rsplit('/').next().unwrap_or(word);
            if WRAPPER_WORDS.contains(&basename) {
                continue;
            }
            command = Some(basename);
            break;
        }
        match command {
            Some("head") | Some("tail") => return true,
            Some("sed") => {
                let has_n = words
                    .iter()
                    .any(|w| w.starts_with('-') && w.contains('n') && !w.starts_with("--"));
                let has_range = words.iter().any(|w| SED_RANGE_ARG_RE.is_match(w));
                if has_n && has_range {
                    return true;
                }
            }
            Some("awk") => {
                if words.iter().any(|w| AWK_NR_RE.is_match(w)) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// Literal conflict markers or their regex quantifier forms.
static CONFLICT_SEARCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Literal runs of seven, or the `<{7}` / `<\{7\}` quantifier spellings.
    Regex::new(r"<{7}|={7}|>{7}|[<=>]\\?\{7").unwrap()
});

/// Whether the script is searching for merge-conflict markers.
pub fn is_conflict_marker_search(script: &str) -> bool {
    CONFLICT_SEARCH_RE.is_match(script)
}

/// Whether the script reads the configured plan file, in either its tilde
/// form or its home-expanded absolute form.
fn script_reads_plan_file(script: &str, plan_path_tilde: &str) -> bool {
    if script.contains(plan_path_tilde) {
        return true;
    }
    if let Some(rest) = plan_path_tilde.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        let expanded = home.join(rest);
        return script.contains(&expanded.to_string_lossy().into_owned());
    }
    false
}
