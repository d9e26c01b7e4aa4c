//! In-memory reconstruction of messages from incremental agent events.
//!
//! The server streams message updates and part fragments; this store folds
//! them into whole [`MessageRecord`]s. Transitions are synchronous and IO
//! free. Callers run them under the core lock and persist the returned
//! snapshots afterwards.

use std::collections::HashMap;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use paddock_agent_client::PartUpdate;
use paddock_protocol::time::{normalize_timestamp_ms, now_ms};
use paddock_protocol::{MessagePart, MessageRecord, MessageRole, PartKind, TimelineEntry};

// ---------------------------------------------------------------------------
// Echo guard
// ---------------------------------------------------------------------------

/// Remembers the last prompt sent per client session so the server echoing
/// it back as streamed text is dropped instead of duplicating the user's
/// message in the transcript.
#[derive(Debug, Default)]
pub struct EchoGuard {
    prompts: DashMap<String, String>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prime(&self, client_session_id: &str, prompt: &str) {
        self.prompts
            .insert(client_session_id.to_string(), prompt.to_string());
    }

    pub fn clear(&self, client_session_id: &str) {
        self.prompts.remove(client_session_id);
    }

    /// Whether `fragment` is the primed prompt coming back at us. A
    /// fragment that stops matching clears the guard, so only the leading
    /// echo is swallowed and real output streams through.
    pub fn should_drop(&self, client_session_id: &str, fragment: &str) -> bool {
        let verdict = match self.prompts.get(client_session_id) {
            Some(prompt) => prompt.starts_with(fragment),
            None => return false,
        };
        if !verdict {
            self.prompts.remove(client_session_id);
        }
        verdict
    }
}

// ---------------------------------------------------------------------------
// Message store
// ---------------------------------------------------------------------------

/// Reconstructed messages keyed by `(client session id, message id)`.
#[derive(Debug, Default)]
pub struct MessageStore {
    records: HashMap<(String, String), MessageRecord>,
}

impl MessageStore {
    /// Fold in a message-level update. Returns the updated snapshot, or
    /// `None` when the update was dropped.
    pub fn apply_message_update(
        &mut self,
        client_session_id: &str,
        message_id: &str,
        role: Option<&str>,
        kind: &str,
        payload: &Value,
        info: &Value,
    ) -> Option<MessageRecord> {
        // The user's own messages are already in the client's hands.
        if role == Some("user") {
            return None;
        }
        let record = self.entry(client_session_id, message_id);
        if let Some(role) = role {
            record.role = MessageRole::from_wire(role);
        }
        if let Some(created) = info
            .get("time")
            .and_then(|time| time.get("created"))
            .and_then(normalize_timestamp_ms)
        {
            record.created_at_ms = created;
        }
        record.updated_at_ms = event_time(info.get("time"));
        record.timeline.push(TimelineEntry {
            kind: kind.to_string(),
            payload: payload.clone(),
            at_ms: record.updated_at_ms,
        });
        Some(record.clone())
    }

    /// Fold in a part update. Returns the updated snapshot, or `None` when
    /// the fragment was a user echo or a user-role part.
    pub fn apply_part_update(
        &mut self,
        client_session_id: &str,
        part: &PartUpdate,
        kind: &str,
        payload: &Value,
        echo: &EchoGuard,
    ) -> Option<MessageRecord> {
        if part.role.as_deref() == Some("user") {
            return None;
        }
        if matches!(part.kind.as_deref(), None | Some("text")) {
            let fragment = part.delta.as_deref().or(part.text.as_deref());
            if let Some(fragment) = fragment {
                if echo.should_drop(client_session_id, fragment) {
                    debug!(
                        component = "message_store",
                        event = "message_store.echo_dropped",
                        client_session_id = %client_session_id,
                        "Dropped prompt echo fragment"
                    );
                    return None;
                }
            }
        }

        let record = self.entry(client_session_id, &part.message_id);
        if let Some(role) = part.role.as_deref() {
            record.role = MessageRole::from_wire(role);
        }

        // Upsert the part by id, falling back to call id for tool parts
        // that never carry one.
        let position = if part.id.is_some() {
            record.parts.iter().position(|p| p.id == part.id)
        } else if part.call_id.is_some() {
            record.parts.iter().position(|p| p.call_id == part.call_id)
        } else {
            None
        };
        let index = match position {
            Some(index) => index,
            None => {
                record.parts.push(MessagePart {
                    id: part.id.clone(),
                    call_id: part.call_id.clone(),
                    ..MessagePart::default()
                });
                record.parts.len() - 1
            }
        };
        let slot = &mut record.parts[index];
        if let Some(kind) = part.kind.as_deref() {
            slot.kind = PartKind::from_wire(kind);
        }
        if slot.call_id.is_none() {
            slot.call_id = part.call_id.clone();
        }
        if let Some(delta) = part.delta.as_deref() {
            slot.text.push_str(delta);
        } else if let Some(text) = part.text.as_deref() {
            slot.text = text.to_string();
        }
        if let Some(tool) = part.tool.as_deref() {
            slot.tool_name = Some(tool.to_string());
        }
        if let Some(state) = part.state.as_ref() {
            if let Some(status) = state.status.as_deref() {
                slot.tool_status = Some(status.to_string());
            }
            if let Some(input) = state.input.as_ref() {
                slot.tool_input = Some(input.to_string());
            }
            if let Some(output) = state.output.as_deref() {
                slot.tool_output = Some(output.to_string());
            }
        }

        record.text = flatten_text(&record.parts);
        record.updated_at_ms = event_time(part.time.as_ref());
        record.timeline.push(TimelineEntry {
            kind: kind.to_string(),
            payload: payload.clone(),
            at_ms: record.updated_at_ms,
        });
        Some(record.clone())
    }

    pub fn remove_message(&mut self, client_session_id: &str, message_id: &str) {
        self.records
            .remove(&(client_session_id.to_string(), message_id.to_string()));
    }

    pub fn remove_session(&mut self, client_session_id: &str) {
        self.records
            .retain(|(session, _), _| session != client_session_id);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn get(&self, client_session_id: &str, message_id: &str) -> Option<&MessageRecord> {
        self.records
            .get(&(client_session_id.to_string(), message_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn entry(&mut self, client_session_id: &str, message_id: &str) -> &mut MessageRecord {
        self.records
            .entry((client_session_id.to_string(), message_id.to_string()))
            .or_insert_with(|| {
                let now = now_ms();
                MessageRecord {
                    client_session_id: client_session_id.to_string(),
                    message_id: message_id.to_string(),
                    role: MessageRole::Assistant,
                    text: String::new(),
                    parts: Vec::new(),
                    timeline: Vec::new(),
                    created_at_ms: now,
                    updated_at_ms: now,
                }
            })
    }
}

/// Ordered concatenation of the text-kind parts.
fn flatten_text(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .filter(|part| part.kind == PartKind::Text)
        .map(|part| part.text.as_str())
        .collect()
}

/// Best timestamp for an event, preferring the completion side of the
/// server's `time` object and falling back to the wall clock.
fn event_time(time: Option<&Value>) -> i64 {
    time.and_then(|value| {
        value
            .get("end")
            .or_else(|| value.get("completed"))
            .or_else(|| value.get("start"))
            .or_else(|| value.get("created"))
            .and_then(normalize_timestamp_ms)
            .or_else(|| normalize_timestamp_ms(value))
    })
    .unwrap_or_else(now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use paddock_agent_client::ToolState;
    use serde_json::json;

    fn text_part(message_id: &str, part_id: &str, delta: &str) -> PartUpdate {
        PartUpdate {
            session_id: "ext-1".to_string(),
            message_id: message_id.to_string(),
            id: Some(part_id.to_string()),
            kind: Some("text".to_string()),
            delta: Some(delta.to_string()),
            ..PartUpdate::default()
        }
    }

    #[test]
    fn deltas_accumulate_into_part_and_flattened_text() {
        let mut store = MessageStore::default();
        let echo = EchoGuard::new();

        store.apply_part_update("cs-1", &text_part("msg-1", "prt-1", "He"), "message.part.updated", &json!({}), &echo);
        let snapshot = store
            .apply_part_update("cs-1", &text_part("msg-1", "prt-1", "llo"), "message.part.updated", &json!({}), &echo)
            .expect("snapshot");

        assert_eq!(snapshot.parts.len(), 1);
        assert_eq!(snapshot.parts[0].text, "Hello");
        assert_eq!(snapshot.text, "Hello");
        assert_eq!(snapshot.timeline.len(), 2);
    }

    #[test]
    fn text_replaces_while_delta_appends() {
        let mut store = MessageStore::default();
        let echo = EchoGuard::new();

        store.apply_part_update("cs-1", &text_part("msg-1", "prt-1", "working"), "message.part.updated", &json!({}), &echo);
        let replacement = PartUpdate {
            session_id: "ext-1".to_string(),
            message_id: "msg-1".to_string(),
            id: Some("prt-1".to_string()),
            kind: Some("text".to_string()),
            text: Some("done".to_string()),
            ..PartUpdate::default()
        };
        let snapshot = store
            .apply_part_update("cs-1", &replacement, "message.part.updated", &json!({}), &echo)
            .expect("snapshot");
        assert_eq!(snapshot.parts[0].text, "done");
    }

    #[test]
    fn tool_parts_match_on_call_id_and_merge_state() {
        let mut store = MessageStore::default();
        let echo = EchoGuard::new();

        let running = PartUpdate {
            session_id: "ext-1".to_string(),
            message_id: "msg-1".to_string(),
            call_id: Some("call-1".to_string()),
            kind: Some("tool".to_string()),
            tool: Some("bash".to_string()),
            state: Some(ToolState {
                status: Some("running".to_string()),
                input: Some(json!({"command": "ls"})),
                output: None,
            }),
            ..PartUpdate::default()
        };
        store.apply_part_update("cs-1", &running, "message.part.updated", &json!({}), &echo);

        let completed = PartUpdate {
            session_id: "ext-1".to_string(),
            message_id: "msg-1".to_string(),
            call_id: Some("call-1".to_string()),
            kind: Some("tool".to_string()),
            state: Some(ToolState {
                status: Some("completed".to_string()),
                input: None,
                output: Some("src".to_string()),
            }),
            ..PartUpdate::default()
        };
        let snapshot = store
            .apply_part_update("cs-1", &completed, "message.part.updated", &json!({}), &echo)
            .expect("snapshot");

        assert_eq!(snapshot.parts.len(), 1);
        let part = &snapshot.parts[0];
        assert_eq!(part.kind, PartKind::Tool);
        assert_eq!(part.tool_name.as_deref(), Some("bash"));
        assert_eq!(part.tool_status.as_deref(), Some("completed"));
        assert_eq!(part.tool_input.as_deref(), Some(r#"{"command":"ls"}"#));
        assert_eq!(part.tool_output.as_deref(), Some("src"));
        // Tool text stays out of the flattened text.
        assert_eq!(snapshot.text, "");
    }

    #[test]
    fn user_role_is_never_stored() {
        let mut store = MessageStore::default();
        let echo = EchoGuard::new();

        let dropped = store.apply_message_update(
            "cs-1",
            "msg-1",
            Some("user"),
            "message.updated",
            &json!({}),
            &json!({}),
        );
        assert!(dropped.is_none());

        let user_part = PartUpdate {
            session_id: "ext-1".to_string(),
            message_id: "msg-1".to_string(),
            id: Some("prt-1".to_string()),
            role: Some("user".to_string()),
            text: Some("hi".to_string()),
            ..PartUpdate::default()
        };
        assert!(store
            .apply_part_update("cs-1", &user_part, "message.part.updated", &json!({}), &echo)
            .is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn echo_guard_drops_prefix_then_clears_on_mismatch() {
        let echo = EchoGuard::new();
        echo.prime("cs-1", "fix the bug");

        assert!(echo.should_drop("cs-1", "fix the b"));
        assert!(echo.should_drop("cs-1", "fix the bug"));
        // First non-matching fragment passes through and clears the guard.
        assert!(!echo.should_drop("cs-1", "Sure, I'll"));
        assert!(!echo.should_drop("cs-1", "fix the b"));
    }

    #[test]
    fn echoed_prompt_is_not_stored_but_later_text_is() {
        let mut store = MessageStore::default();
        let echo = EchoGuard::new();
        echo.prime("cs-1", "fix the bug");

        let dropped = store.apply_part_update(
            "cs-1",
            &text_part("msg-1", "prt-1", "fix the b"),
            "message.part.updated",
            &json!({}),
            &echo,
        );
        assert!(dropped.is_none());
        assert!(store.is_empty());

        let kept = store
            .apply_part_update(
                "cs-1",
                &text_part("msg-1", "prt-1", "Sure, I'll"),
                "message.part.updated",
                &json!({}),
                &echo,
            )
            .expect("kept");
        assert_eq!(kept.text, "Sure, I'll");
    }

    #[test]
    fn message_update_sets_role_and_times() {
        let mut store = MessageStore::default();

        let info = json!({
            "id": "msg-1",
            "sessionID": "ext-1",
            "role": "assistant",
            "time": {"created": 1_713_997_600, "completed": 1_713_997_700}
        });
        let snapshot = store
            .apply_message_update("cs-1", "msg-1", Some("assistant"), "message.updated", &json!({}), &info)
            .expect("snapshot");

        assert_eq!(snapshot.role, MessageRole::Assistant);
        assert_eq!(snapshot.created_at_ms, 1_713_997_600_000);
        assert_eq!(snapshot.updated_at_ms, 1_713_997_700_000);
    }

    #[test]
    fn remove_session_drops_only_that_sessions_messages() {
        let mut store = MessageStore::default();
        let echo = EchoGuard::new();
        store.apply_part_update("cs-1", &text_part("msg-1", "p", "a"), "message.part.updated", &json!({}), &echo);
        store.apply_part_update("cs-2", &text_part("msg-2", "p", "b"), "message.part.updated", &json!({}), &echo);

        store.remove_session("cs-1");
        assert!(store.get("cs-1", "msg-1").is_none());
        assert!(store.get("cs-2", "msg-2").is_some());
    }
}
