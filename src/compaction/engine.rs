//! The compaction engine: summarize, atomically replace, survive crashes.

use super::diffs::extract_file_diffs;
use super::pending::{PendingPostCompaction, PendingStateStore};
use crate::errors::CompactionError;
use crate::message::{CompactionSource, CompactionTrigger, Message, Role};
use crate::stores::{ChatEvent, EventBus, HistoryStore, PartialStreamStore};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// End-of-stream notification for the summarization turn.
#[derive(Debug, Clone)]
pub struct StreamEndEvent {
    /// The generated summary text.
    pub summary: String,
}

/// Orchestrates the replace-history-with-summary protocol.
///
/// Owned per session; the processed-request set lives here, tied to the
/// session lifecycle, never in process-global state. It guards against the
/// same stream-end event being delivered twice to this instance — it is not
/// a cross-instance correctness boundary.
pub struct CompactionEngine {
    session_id: String,
    workspace_id: String,
    history: Arc<dyn HistoryStore>,
    partials: Arc<dyn PartialStreamStore>,
    events: Arc<dyn EventBus>,
    pending: Arc<Mutex<PendingStateStore>>,
    processed_requests: HashSet<String>,
}

impl CompactionEngine {
    pub fn new(
        session_id: impl Into<String>,
        workspace_id: impl Into<String>,
        history: Arc<dyn HistoryStore>,
        partials: Arc<dyn PartialStreamStore>,
        events: Arc<dyn EventBus>,
        pending: Arc<Mutex<PendingStateStore>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            workspace_id: workspace_id.into(),
            history,
            partials,
            events,
            pending,
            processed_requests: HashSet::new(),
        }
    }

    /// Handle the end of a summarization stream.
    ///
    /// Returns `Ok(false)` when there is nothing to do or the summary is
    /// unusable (the request stays unprocessed so a retry can succeed), and
    /// `Ok(true)` once the request has been processed — including repeat
    /// deliveries, which are absorbed with zero side effects.
    pub async fn handle_completion(
        &mut self,
        event: &StreamEndEvent,
    ) -> Result<bool, CompactionError> {
        let history = self.history.get_history(&self.session_id).await?;

        let Some(request) = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User && !m.meta.synthetic)
        else {
            return Ok(false);
        };
        if !request.is_compaction_request() {
            return Ok(false);
        }
        if self.processed_requests.contains(&request.id) {
            debug!(request_id = %request.id, "compaction request already processed");
            return Ok(true);
        }

        let summary = event.summary.trim();
        if summary.is_empty() {
            warn!("compaction summary empty, leaving request unprocessed");
            return Ok(false);
        }
        if is_bare_json_object(summary) {
            // The model emitted a tool call as text instead of prose.
            warn!("compaction summary is a bare JSON object, leaving request unprocessed");
            return Ok(false);
        }

        let trigger = match request.compaction_source() {
            Some(CompactionSource::IdleCompaction) => CompactionTrigger::Idle,
            None => CompactionTrigger::User,
        };
        let request_id = request.id.clone();

        // Stale checkpoint first: a late checkpoint commit after the clear
        // would re-append content the summary already covers.
        if let Err(err) = self.partials.delete_partial(&self.session_id).await {
            warn!(error = %err, "could not delete partial-stream checkpoint");
        }

        // Persist the pending state before clearing; the file on disk is
        // the durable signal that a compaction started.
        let diffs = extract_file_diffs(&history);
        let state = PendingPostCompaction::new(diffs);
        let diff_count = state.diffs.len();
        {
            let mut pending = self.pending.lock().await;
            pending.persist(state).await?;
        }

        let removed = match self.history.clear_history(&self.session_id).await {
            Ok(removed) => removed,
            Err(err) => {
                // Without the real clear, the persisted state would cause a
                // duplicate reinjection; take it back out.
                self.pending.lock().await.rollback().await;
                return Err(CompactionError::Storage(err));
            }
        };

        let mut summary_message = Message::assistant(summary);
        summary_message.meta.compacted = Some(trigger);
        summary_message.meta.timestamp = match trigger {
            CompactionTrigger::User => Utc::now(),
            CompactionTrigger::Idle => idle_summary_timestamp(&history),
        };

        if let Err(err) = self
            .history
            .append_to_history(&self.session_id, summary_message.clone())
            .await
        {
            self.pending.lock().await.rollback().await;
            return Err(CompactionError::Storage(err));
        }

        self.events.emit(
            &self.workspace_id,
            ChatEvent::HistoryRemoved {
                sequences: removed.clone(),
            },
        );
        self.events.emit(
            &self.workspace_id,
            ChatEvent::Message {
                message: summary_message,
            },
        );

        self.processed_requests.insert(request_id);
        info!(
            trigger = ?trigger,
            removed_messages = removed.len(),
            carried_diffs = diff_count,
            "history compacted"
        );
        Ok(true)
    }
}

/// Timestamp for an idle-triggered summary: the max of the last real user
/// message and the last previously-compacted summary — never the
/// compaction request's own fresh timestamp, so idle compaction cannot
/// make a dormant workspace look recently active.
fn idle_summary_timestamp(history: &[Message]) -> DateTime<Utc> {
    let last_user = history
        .iter()
        .rev()
        .find(|m| m.role == Role::User && !m.meta.synthetic && !m.is_compaction_request())
        .map(|m| m.meta.timestamp);
    let last_summary = history
        .iter()
        .rev()
        .find(|m| m.meta.compacted.is_some())
        .map(|m| m.meta.timestamp);

    match (last_user, last_summary) {
        (Some(u), Some(s)) => u.max(s),
        (Some(t), None) | (None, Some(t)) => t,
        (None, None) => Utc::now(),
    }
}

/// A summary that parses as a bare JSON object is a tool call leaked into
/// prose, not a summary.
fn is_bare_json_object(text: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(text),
        Ok(serde_json::Value::Object(_))
    )
}
