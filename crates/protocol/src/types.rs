//! Records shared across the core, storage, and UI

use serde::{Deserialize, Serialize};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    /// Map an upstream role string; anything unknown counts as assistant
    /// output so it is never silently discarded.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "user" => MessageRole::User,
            "system" => MessageRole::System,
            _ => MessageRole::Assistant,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// Kind of a reconstructed message part
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Text,
    Reasoning,
    Tool,
    File,
    Step,
    #[default]
    Unknown,
}

impl PartKind {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "text" => PartKind::Text,
            "reasoning" => PartKind::Reasoning,
            "tool" => PartKind::Tool,
            "file" => PartKind::File,
            "step-start" | "step-finish" => PartKind::Step,
            _ => PartKind::Unknown,
        }
    }
}

/// One reconstructed part of an agent message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub kind: PartKind,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_status: Option<String>,
}

/// Raw event payload retained in arrival order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub kind: String,
    pub payload: serde_json::Value,
    pub at_ms: i64,
}

/// A message reconstructed from incremental agent events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub client_session_id: String,
    pub message_id: String,
    pub role: MessageRole,
    /// Ordered concatenation of the text-kind parts.
    pub text: String,
    pub parts: Vec<MessagePart>,
    pub timeline: Vec<TimelineEntry>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// A client session as the storage layer records it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_session_id: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Changes to apply to a session record (delta updates)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_session_id: Option<Option<String>>,
}

/// A project grouping client sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub root_path: String,
}

/// A session's git worktree as the git collaborator reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub id: String,
    pub client_session_id: String,
    pub path: String,
    pub branch_name: String,
    pub branch_renamed: bool,
}

/// Changes to apply to a worktree record (delta updates)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorktreeFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_renamed: Option<bool>,
}

/// Payload handed to the desktop notifier when a backgrounded session idles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNotification {
    pub client_session_id: String,
    pub project_id: String,
    pub title: String,
    pub body: String,
}

/// One part of an outgoing prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptPart {
    Text {
        text: String,
    },
    File {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
}

impl PromptPart {
    pub fn text(text: impl Into<String>) -> Self {
        PromptPart::Text { text: text.into() }
    }

    /// The user-visible text of this part, if it has one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PromptPart::Text { text } => Some(text),
            PromptPart::File { .. } => None,
        }
    }
}
