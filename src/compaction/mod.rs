//! History compaction.
//!
//! Replaces full conversation history with a model-generated summary while
//! preserving, on disk, the context the next turn still needs.
//!
//! The engine enforces a strict ordering so a crash at any point leaves a
//! recoverable state:
//!
//! 1. delete any stale partial-stream checkpoint
//! 2. persist pending post-compaction state (the durable signal that a
//!    compaction started)
//! 3. clear history
//! 4. append the summary message
//!
//! Recovery is then just "does a pending-state file exist with no summary
//! consumed yet" — `PendingStateStore` re-reads it lazily after a restart.

mod diffs;
mod engine;
mod pending;

pub use diffs::extract_file_diffs;
pub use engine::{CompactionEngine, StreamEndEvent};
pub use pending::{FileEditDiff, PendingPostCompaction, PendingStateStore};

/// Most edited-file diffs carried across a compaction.
pub const MAX_EDITED_FILES: usize = 20;

/// Byte cap per carried diff; longer diffs are clamped and flagged.
pub const MAX_FILE_CONTENT_SIZE: usize = 16 * 1024;

/// File name of the pending-state document inside a session directory.
pub const PENDING_STATE_FILE_NAME: &str = "pending-compaction.json";
