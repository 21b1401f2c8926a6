//! Session orchestration: the compaction-adjacent slice.
//!
//! Owns three behaviors the engine cannot:
//!
//! - **Reinjection**: the first turn after a compaction carries attachments
//!   derived from the pending post-compaction state (plan-file reference
//!   plus edited-file diffs), anchored as a synthetic message before the
//!   user turn.
//! - **Retry budget of one**: if that turn fails with a provider
//!   context-exceeded error, the partial assistant message is dropped, the
//!   pending state is discarded for good, and the same user turn is
//!   re-issued once without the attachments. A second context-exceeded is
//!   surfaced, not retried.
//! - **Dispose safety**: turns are serialized through an internal queue
//!   lock; disposal cancels a token that is checked after every await, so a
//!   disposal mid-turn resolves the in-flight call with
//!   `SessionError::Disposed` instead of starting a model stream or
//!   emitting events.

use crate::compaction::{PendingPostCompaction, PendingStateStore};
use crate::errors::{ModelError, SessionError};
use crate::message::{Message, Role};
use crate::stores::{ChatEvent, EventBus, GenerateRequest, HistoryStore, ModelClient};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Output-token budget for a regular conversation turn.
const TURN_MAX_OUTPUT_TOKENS: u32 = 8_192;

/// What happened during one `send_message` turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub assistant: Message,
    /// Post-compaction attachments were reinjected for this turn.
    pub attachments_reinjected: bool,
    /// The turn was re-issued without attachments after a
    /// context-exceeded.
    pub retried_without_attachments: bool,
}

/// Per-session orchestrator. All state is owned here and dies with the
/// session; nothing is process-global.
pub struct SessionOrchestrator {
    session_id: String,
    workspace_id: String,
    history: Arc<dyn HistoryStore>,
    model: Arc<dyn ModelClient>,
    events: Arc<dyn EventBus>,
    pending: Arc<Mutex<PendingStateStore>>,
    /// Tilde-form plan file path referenced in reinjection attachments.
    plan_file_path: Option<String>,
    /// Serializes turns: one in-flight model stream per session.
    turn_queue: Mutex<()>,
    cancel: CancellationToken,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        workspace_id: impl Into<String>,
        history: Arc<dyn HistoryStore>,
        model: Arc<dyn ModelClient>,
        events: Arc<dyn EventBus>,
        pending: Arc<Mutex<PendingStateStore>>,
        plan_file_path: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            workspace_id: workspace_id.into(),
            history,
            model,
            events,
            pending,
            plan_file_path,
            turn_queue: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Begin disposal. Idempotent; in-flight turns resolve with
    /// `SessionError::Disposed` at their next suspension point.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation token checked by long-running work on this session.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one user turn through the model.
    pub async fn send_message(&self, text: &str) -> Result<TurnOutcome, SessionError> {
        let _slot = self.turn_queue.lock().await;
        self.checkpoint()?;

        let user = Message::user(text);
        self.history
            .append_to_history(&self.session_id, user.clone())
            .await?;
        // Disposal may have begun while the append was in flight; do not
        // initiate a model stream in that case.
        self.checkpoint()?;

        let attachments = {
            let mut pending = self.pending.lock().await;
            pending
                .peek()
                .await
                .map(|state| build_reinjection_attachments(state, self.plan_file_path.as_deref()))
        };
        self.checkpoint()?;

        match self.stream_turn(attachments.as_deref()).await {
            Ok(assistant) => {
                if attachments.is_some() {
                    self.pending.lock().await.ack_consumed().await;
                }
                Ok(TurnOutcome {
                    assistant,
                    attachments_reinjected: attachments.is_some(),
                    retried_without_attachments: false,
                })
            }
            Err(SessionError::ContextExceeded) if attachments.is_some() => {
                info!("reinjected attachments exceeded context, retrying without them");
                // Drop whatever partial assistant content got persisted.
                if let Err(err) = self
                    .history
                    .truncate_after_message(&self.session_id, &user.id)
                    .await
                {
                    debug!(error = %err, "could not truncate partial assistant message");
                }
                self.pending
                    .lock()
                    .await
                    .discard("context-exceeded on reinjection")
                    .await;
                self.checkpoint()?;

                // Exactly one retry, and never with attachments again.
                let assistant = self.stream_turn(None).await?;
                Ok(TurnOutcome {
                    assistant,
                    attachments_reinjected: false,
                    retried_without_attachments: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// One model stream over the current history.
    async fn stream_turn(&self, attachments: Option<&str>) -> Result<Message, SessionError> {
        let mut messages = self.history.get_history(&self.session_id).await?;
        self.checkpoint()?;

        if let Some(text) = attachments {
            // Anchor attachments immediately before the latest user turn.
            let insert_at = messages
                .iter()
                .rposition(|m| m.role == Role::User)
                .unwrap_or(messages.len());
            messages.insert(insert_at, Message::synthetic_user(text));
        }

        let request = GenerateRequest {
            system_prompt: String::new(),
            messages,
            tools: Vec::new(),
            max_output_tokens: TURN_MAX_OUTPUT_TOKENS,
        };
        let response = self
            .model
            .generate(request, &self.cancel)
            .await
            .map_err(|err| match err {
                ModelError::ContextExceeded => SessionError::ContextExceeded,
                ModelError::Aborted => SessionError::Disposed,
                ModelError::Provider(message) => SessionError::Model(message),
            })?;
        // Forwarded handlers are no-ops once disposal has begun: neither
        // the append nor the event emission below may run.
        self.checkpoint()?;

        let assistant = Message::assistant(response.text);
        self.history
            .append_to_history(&self.session_id, assistant.clone())
            .await?;
        self.emit(ChatEvent::Message {
            message: assistant.clone(),
        });
        Ok(assistant)
    }

    fn emit(&self, event: ChatEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.events.emit(&self.workspace_id, event);
    }

    fn checkpoint(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            Err(SessionError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// Render pending post-compaction state as the attachment text for the
/// next turn.
fn build_reinjection_attachments(
    state: &PendingPostCompaction,
    plan_file_path: Option<&str>,
) -> String {
    let mut out = String::from(
        "The conversation history was just compacted. Durable context that survives the summary:\n",
    );
    if let Some(plan) = plan_file_path {
        out.push_str(&format!(
            "\nPlan file: {plan} — re-read it before continuing; it is the source of truth.\n"
        ));
    }
    if !state.diffs.is_empty() {
        out.push_str("\nRecently edited files:\n");
        for diff in &state.diffs {
            out.push_str(&format!("\n## {}{}\n```diff\n{}\n```\n",
                diff.path,
                if diff.truncated { " (truncated)" } else { "" },
                diff.diff,
            ));
        }
    }
    out
}
