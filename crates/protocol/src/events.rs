//! Normalized events pushed from the core to the UI sink

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event kind emitted when the branch auto-rename side effect succeeds.
pub const EVENT_BRANCH_RENAMED: &str = "branch.renamed";
/// Event kind emitted when the agent-server subprocess dies underneath us.
pub const EVENT_SERVER_EXITED: &str = "server.exited";

/// One normalized event for the UI.
///
/// `kind` is the upstream event name (for example `session.idle` or
/// `message.part.updated`) or one of the core-emitted kinds above. The
/// payload is passed through untouched so the UI stays forward-compatible
/// with upstream event shapes the core does not model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_session_id: String,
    pub payload: Value,
    /// Set when the event came from a subagent attributed to this session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_session_id: Option<String>,
}

impl SessionEvent {
    pub fn new(kind: impl Into<String>, client_session_id: impl Into<String>, payload: Value) -> Self {
        SessionEvent {
            kind: kind.into(),
            client_session_id: client_session_id.into(),
            payload,
            child_session_id: None,
        }
    }

    pub fn with_child(mut self, child_session_id: impl Into<String>) -> Self {
        self.child_session_id = Some(child_session_id.into());
        self
    }
}
