//! Pending post-compaction state: the crash-safety anchor.
//!
//! One JSON document per session directory, written before history is
//! cleared and deleted once the derived attachments were reinjected (or
//! discarded). Absence of the file means "no pending attachments"; a
//! malformed file is treated the same way, never as an error that blocks a
//! turn.

use super::{MAX_EDITED_FILES, MAX_FILE_CONTENT_SIZE, PENDING_STATE_FILE_NAME};
use crate::errors::CompactionError;
use crate::util::truncate_utf8;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A per-file diff preserved across a compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEditDiff {
    pub path: String,
    pub diff: String,
    pub truncated: bool,
}

impl FileEditDiff {
    /// Build a diff entry, clamping the body to `MAX_FILE_CONTENT_SIZE`.
    pub fn new(path: impl Into<String>, diff: impl Into<String>) -> Self {
        let diff = diff.into();
        let (clamped, cut) = truncate_utf8(&diff, MAX_FILE_CONTENT_SIZE);
        Self {
            path: path.into(),
            diff: clamped.to_string(),
            truncated: cut,
        }
    }
}

/// The persisted pending post-compaction document.
///
/// Construction enforces the schema invariants: at most
/// `MAX_EDITED_FILES` entries, each body within `MAX_FILE_CONTENT_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPostCompaction {
    pub version: u32,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub diffs: Vec<FileEditDiff>,
}

impl PendingPostCompaction {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(mut diffs: Vec<FileEditDiff>) -> Self {
        diffs.truncate(MAX_EDITED_FILES);
        Self {
            version: Self::CURRENT_VERSION,
            created_at: Utc::now().timestamp_millis(),
            diffs,
        }
    }
}

/// Single-writer store for the pending-state document.
///
/// Lazy-loads from disk on first `peek`, which is how a crash between
/// "history cleared" and "attachments consumed" self-heals after restart.
#[derive(Debug)]
pub struct PendingStateStore {
    path: PathBuf,
    loaded: bool,
    state: Option<PendingPostCompaction>,
}

impl PendingStateStore {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            path: session_dir.join(PENDING_STATE_FILE_NAME),
            loaded: false,
            state: None,
        }
    }

    /// Persist a fresh pending state, replacing any previous document.
    pub async fn persist(&mut self, state: PendingPostCompaction) -> Result<(), CompactionError> {
        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| anyhow::anyhow!("serialize pending state: {e}"))?;
        tokio::fs::write(&self.path, json).await.map_err(|source| {
            CompactionError::PendingPersistFailed {
                path: self.path.clone(),
                source,
            }
        })?;
        debug!(path = %self.path.display(), diffs = state.diffs.len(), "pending state persisted");
        self.state = Some(state);
        self.loaded = true;
        Ok(())
    }

    /// Current pending state, loading from disk on first access.
    pub async fn peek(&mut self) -> Option<&PendingPostCompaction> {
        if !self.loaded {
            self.state = self.load_from_disk().await;
            self.loaded = true;
        }
        self.state.as_ref()
    }

    /// The attachments were reinjected; drop the document.
    pub async fn ack_consumed(&mut self) {
        debug!(path = %self.path.display(), "pending state consumed");
        self.remove().await;
    }

    /// Drop the document without reinjection.
    pub async fn discard(&mut self, reason: &str) {
        info!(path = %self.path.display(), reason, "pending state discarded");
        self.remove().await;
    }

    /// Undo a persist after a failed history clear; without this the next
    /// turn would reinject attachments for a compaction that never
    /// happened.
    pub async fn rollback(&mut self) {
        debug!(path = %self.path.display(), "pending state rolled back");
        self.remove().await;
    }

    async fn remove(&mut self) {
        self.state = None;
        self.loaded = true;
        if let Err(err) = tokio::fs::remove_file(&self.path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %err, "could not remove pending state file");
        }
    }

    async fn load_from_disk(&self) -> Option<PendingPostCompaction> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %err, "could not read pending state");
                }
                return None;
            }
        };
        match serde_json::from_slice::<PendingPostCompaction>(&bytes) {
            Ok(state) if state.version == PendingPostCompaction::CURRENT_VERSION => Some(state),
            Ok(state) => {
                warn!(version = state.version, "unknown pending state version, ignoring");
                None
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "malformed pending state, ignoring");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> PendingPostCompaction {
        PendingPostCompaction::new(vec![
            FileEditDiff::new("src/a.rs", "+++ src/a.rs\n+fn a() {}"),
            FileEditDiff::new("src/b.rs", "+++ src/b.rs\n+fn b() {}"),
        ])
    }

    #[tokio::test]
    async fn test_persist_peek_ack_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = PendingStateStore::new(dir.path());

        store.persist(sample_state()).await.unwrap();
        assert!(dir.path().join(PENDING_STATE_FILE_NAME).exists());
        assert_eq!(store.peek().await.unwrap().diffs.len(), 2);

        store.ack_consumed().await;
        assert!(store.peek().await.is_none());
        assert!(!dir.path().join(PENDING_STATE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_lazy_load_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut store = PendingStateStore::new(dir.path());
            store.persist(sample_state()).await.unwrap();
        }
        // A fresh store (fresh process) finds the document on disk.
        let mut store = PendingStateStore::new(dir.path());
        let state = store.peek().await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.diffs[0].path, "src/a.rs");
    }

    #[tokio::test]
    async fn test_missing_file_is_no_pending_state() {
        let dir = tempdir().unwrap();
        let mut store = PendingStateStore::new(dir.path());
        assert!(store.peek().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_file_is_no_pending_state() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join(PENDING_STATE_FILE_NAME), b"{not json")
            .await
            .unwrap();
        let mut store = PendingStateStore::new(dir.path());
        assert!(store.peek().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_version_ignored() {
        let dir = tempdir().unwrap();
        tokio::fs::write(
            dir.path().join(PENDING_STATE_FILE_NAME),
            br#"{"version": 9, "created_at": 0, "diffs": []}"#,
        )
        .await
        .unwrap();
        let mut store = PendingStateStore::new(dir.path());
        assert!(store.peek().await.is_none());
    }

    #[tokio::test]
    async fn test_discard_removes_file() {
        let dir = tempdir().unwrap();
        let mut store = PendingStateStore::new(dir.path());
        store.persist(sample_state()).await.unwrap();
        store.discard("context-exceeded on reinjection").await;
        assert!(!dir.path().join(PENDING_STATE_FILE_NAME).exists());
    }

    #[test]
    fn test_diff_clamped_with_flag() {
        let big = "x".repeat(MAX_FILE_CONTENT_SIZE * 2);
        let diff = FileEditDiff::new("big.rs", big);
        assert_eq!(diff.diff.len(), MAX_FILE_CONTENT_SIZE);
        assert!(diff.truncated);
    }

    #[test]
    fn test_state_caps_file_count() {
        let diffs = (0..50)
            .map(|i| FileEditDiff::new(format!("f{i}.rs"), "+x"))
            .collect();
        let state = PendingPostCompaction::new(diffs);
        assert_eq!(state.diffs.len(), MAX_EDITED_FILES);
    }
}
