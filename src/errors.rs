//! Typed error hierarchy for the condense pipeline.
//!
//! Three top-level types cover the three failure domains:
//! - `StoreError` — ordinary failures reported by collaborator stores
//! - `CompactionError` — compaction engine and pending-state failures
//! - `SessionError` — per-turn orchestration failures surfaced to the host
//!
//! Model-provider failures (`ModelError`) are deliberately coarse: the only
//! distinction the pipeline acts on is "context window exceeded" vs
//! "aborted" vs everything else.

use std::path::PathBuf;
use thiserror::Error;

/// An ordinary failure reported by a collaborator store.
///
/// Stores return these as values; they never panic for expected failures
/// such as a missing session or an I/O error underneath.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed for session {session_id}: {message}")]
pub struct StoreError {
    /// The store operation that failed (e.g. `clear_history`).
    pub operation: &'static str,
    /// Session the operation targeted.
    pub session_id: String,
    /// Human-readable failure description.
    pub message: String,
}

impl StoreError {
    /// Create a new store error.
    pub fn new(
        operation: &'static str,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            session_id: session_id.into(),
            message: message.into(),
        }
    }
}

/// Errors from a single model invocation.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The assembled prompt exceeds the model's context window.
    #[error("Model context window exceeded")]
    ContextExceeded,

    /// The invocation was aborted via the supplied cancellation signal.
    #[error("Model invocation aborted")]
    Aborted,

    /// Any other provider-reported failure.
    #[error("Model provider error: {0}")]
    Provider(String),
}

/// Errors from the compaction engine and pending-state persistence.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("Failed to persist pending post-compaction state at {path}: {source}")]
    PendingPersistFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a session turn.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session was disposed while the turn was in flight.
    #[error("Session disposed while a message was in flight")]
    Disposed,

    /// The provider rejected the turn for size even after the one retry
    /// without reinjected attachments.
    #[error("Model context window exceeded")]
    ContextExceeded,

    #[error("Model invocation failed: {0}")]
    Model(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
