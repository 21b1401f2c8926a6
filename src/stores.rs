//! Collaborator contracts consumed by the pipeline.
//!
//! The pipeline owns no history, no partial-stream checkpoints, no file
//! access and no model transport. It consumes all of those through the
//! narrow traits here; hosts provide the real implementations, tests
//! provide in-memory fakes.

use crate::errors::{ModelError, StoreError};
use crate::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Long-term conversation history, owned externally.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full ordered history for a session.
    async fn get_history(&self, session_id: &str) -> StoreResult<Vec<Message>>;

    /// Append one message; the store assigns `history_sequence`.
    async fn append_to_history(&self, session_id: &str, message: Message) -> StoreResult<()>;

    /// Remove all history, returning the removed sequence numbers.
    async fn clear_history(&self, session_id: &str) -> StoreResult<Vec<u64>>;

    /// Remove everything appended after the given message (used to drop a
    /// partial assistant turn before a retry).
    async fn truncate_after_message(&self, session_id: &str, message_id: &str) -> StoreResult<()>;
}

/// Partial-stream checkpoints, owned externally. Deleted defensively before
/// compaction so a late checkpoint commit cannot re-append stale content
/// after the history clear.
#[async_trait]
pub trait PartialStreamStore: Send + Sync {
    async fn delete_partial(&self, session_id: &str) -> StoreResult<()>;
}

/// A chat event pushed to whoever listens — UI, channel routing, logs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatEvent {
    /// History entries with these sequence numbers were removed.
    HistoryRemoved { sequences: Vec<u64> },
    /// A message was appended.
    Message { message: Message },
}

/// Fire-and-forget event fan-out. The pipeline does not know or care who
/// listens.
pub trait EventBus: Send + Sync {
    fn emit(&self, workspace_id: &str, event: ChatEvent);
}

/// Result of a file stat through the runtime.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub is_directory: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Workspace file access. Every call may fail per-file; callers treat a
/// failure as "not resolvable" and move on.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn stat(&self, path: &Path) -> anyhow::Result<FileStat>;
    async fn read_file_string(&self, path: &Path) -> anyhow::Result<String>;
}

/// A tool offered to the model for a single invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: serde_json::Value,
}

/// One single-shot model invocation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    /// Bounded output budget; providers may clip below this.
    pub max_output_tokens: u32,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCall,
    Length,
    Other,
}

/// A tool call the model asked for.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Response from a single model invocation.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub finish_reason: FinishReason,
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: TokenUsage,
}

/// Single-shot model invocation with abort support.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Issue one generation call. Implementations must observe `cancel` and
    /// return `ModelError::Aborted` promptly once it fires.
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, ModelError>;
}
