//! Conversation data model shared across the pipeline.
//!
//! History is owned by an external store; this crate only reads, appends and
//! clears through the `stores` contracts. The types here mirror what that
//! store persists, plus the metadata bag the pipeline itself cares about:
//! compaction tags, the synthetic flag, and the file-mention snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One part of a message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        output: String,
    },
}

/// What triggered the compaction that produced a summary message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionTrigger {
    User,
    Idle,
}

/// Discriminator on a compaction request for auto-triggered compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionSource {
    IdleCompaction,
}

/// Structured agent metadata attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentMeta {
    /// The user (or the idle trigger) asked for history compaction.
    CompactionRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<CompactionSource>,
    },
    /// A reusable skill was invoked for this turn.
    AgentSkill { name: String },
}

/// Metadata bag carried by every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Monotonic position in the history store.
    pub history_sequence: u64,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Ephemeral messages are never persisted to long-term history and are
    /// skipped by mention scanning.
    #[serde(default)]
    pub synthetic: bool,
    /// Set on a summary message that replaced compacted history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<CompactionTrigger>,
    /// Structured agent metadata, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_meta: Option<AgentMeta>,
    /// Mention tokens already materialized for this message. Tokens listed
    /// here are never re-read from disk, keeping the prompt prefix stable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_mention_snapshot: Vec<String>,
}

impl MessageMeta {
    /// Fresh metadata stamped "now" with an unassigned sequence number.
    /// The history store assigns the real sequence on append.
    pub fn new() -> Self {
        Self {
            history_sequence: 0,
            timestamp: Utc::now(),
            synthetic: false,
            compacted: None,
            agent_meta: None,
            file_mention_snapshot: Vec::new(),
        }
    }
}

impl Default for MessageMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// An entry in conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    pub meta: MessageMeta,
}

impl Message {
    /// Create a plain user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            parts: vec![ContentPart::Text { text: text.into() }],
            meta: MessageMeta::new(),
        }
    }

    /// Create a plain assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            parts: vec![ContentPart::Text { text: text.into() }],
            meta: MessageMeta::new(),
        }
    }

    /// Create an ephemeral user message that must never reach long-term
    /// history (injected mention blocks, reinjection attachments).
    pub fn synthetic_user(text: impl Into<String>) -> Self {
        let mut message = Self::user(text);
        message.meta.synthetic = true;
        message
    }

    /// Concatenated text of all `Text` parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Whether this is a user-authored compaction request.
    pub fn is_compaction_request(&self) -> bool {
        self.role == Role::User
            && matches!(
                self.meta.agent_meta,
                Some(AgentMeta::CompactionRequest { .. })
            )
    }

    /// The compaction-request source discriminator, if this message is a
    /// compaction request.
    pub fn compaction_source(&self) -> Option<CompactionSource> {
        match self.meta.agent_meta {
            Some(AgentMeta::CompactionRequest { source }) => source,
            _ => None,
        }
    }
}
