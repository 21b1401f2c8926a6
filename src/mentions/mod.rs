//! File-mention context injection.
//!
//! `@path` references in user messages are expanded into fenced content
//! blocks so the model can see the mentioned files without a tool round
//! trip. Three properties matter more than completeness:
//!
//! - **Budgets**: global and per-file caps bound the injected bytes and
//!   lines no matter how many mentions the conversation holds. Messages are
//!   scanned newest-first so the current turn wins under the global caps.
//! - **Position anchoring**: a mention's blocks become a synthetic message
//!   inserted immediately *before* the message that made the mention, so on
//!   later turns the prompt prefix is byte-stable and provider-side prompt
//!   caching keeps working.
//! - **No re-reads**: a token recorded in a message's
//!   `file_mention_snapshot` is never fetched again, even when the file has
//!   changed on disk. Staleness is surfaced by separate change
//!   notifications, never by silently swapping content under a cached
//!   prefix.

mod injector;
mod token;

pub use injector::inject_file_mentions;
pub use token::{MentionToken, parse_mentions, resolve_within_workspace};

/// Most mentions materialized per injection pass.
pub const MAX_MENTIONS_PER_PASS: usize = 10;

/// Global cap on injected content across all messages.
pub const MAX_TOTAL_INJECTED_BYTES: usize = 64 * 1024;

/// Per-file cap on injected content.
pub const MAX_FILE_CONTENT_BYTES: usize = 32 * 1024;

/// Per-file cap on injected lines.
pub const MAX_FILE_LINES: usize = 500;

/// Per-line byte cap; longer lines are truncated, not dropped.
pub const MAX_LINE_BYTES: usize = 4 * 1024;

/// Files larger than this on disk are not read at all.
pub const MAX_SOURCE_FILE_BYTES: u64 = 2 * 1024 * 1024;
