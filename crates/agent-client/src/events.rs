//! Event-stream decode
//!
//! The server pushes SSE frames whose `data:` payload is a JSON object of
//! the shape `{"type": "...", "properties": {...}}`, optionally tagged with
//! the directory it is scoped to. Decoding happens once at the stream
//! boundary; the core routes on the closed [`AgentEvent`] enum and unknown
//! kinds land in [`AgentEvent::Unrecognized`] with their payload intact.

use serde::Deserialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: Value,
    #[serde(default)]
    directory: Option<String>,
}

/// Session metadata as the server reports it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "parentID", default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub status: Option<Value>,
}

impl SessionInfo {
    /// Flatten the server's status shape (`"busy"` or `{"type": "busy"}`).
    pub fn status_label(&self) -> Option<String> {
        match self.status.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map.get("type").and_then(Value::as_str).map(String::from),
            _ => None,
        }
    }
}

/// Body of a `message.part.updated` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartUpdate {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    /// Part identity; tool parts may only carry `callID`.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "callID", default)]
    pub call_id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Full replacement text for the part.
    #[serde(default)]
    pub text: Option<String>,
    /// Incremental fragment to append to the part.
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub state: Option<ToolState>,
    #[serde(default)]
    pub time: Option<Value>,
}

/// Execution state of a tool part.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<String>,
}

// ---------------------------------------------------------------------------
// Decoded events
// ---------------------------------------------------------------------------

/// One decoded event off the stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ServerConnected,
    ServerHeartbeat,
    SessionUpdated {
        session: SessionInfo,
    },
    SessionDeleted {
        session_id: String,
    },
    SessionIdle {
        session_id: String,
    },
    SessionError {
        session_id: Option<String>,
        error: Value,
    },
    MessageUpdated {
        session_id: String,
        message_id: String,
        role: Option<String>,
        info: Value,
    },
    MessagePartUpdated {
        part: PartUpdate,
    },
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    PermissionUpdated {
        session_id: String,
        request: Value,
    },
    /// Anything the decode does not model. The raw payload stays on the
    /// envelope so these can still be routed and forwarded.
    Unrecognized {
        kind: String,
    },
}

impl AgentEvent {
    pub fn decode(kind: &str, raw: &Value) -> AgentEvent {
        let body = raw.get("properties").unwrap_or(raw);
        match kind {
            "server.connected" => AgentEvent::ServerConnected,
            "server.heartbeat" => AgentEvent::ServerHeartbeat,

            "session.updated" => match decode_session(body) {
                Some(session) => AgentEvent::SessionUpdated { session },
                None => unrecognized(kind),
            },

            "session.deleted" => match decode_session(body) {
                Some(session) if !session.id.is_empty() => AgentEvent::SessionDeleted {
                    session_id: session.id,
                },
                _ => unrecognized(kind),
            },

            "session.idle" => match string_at(body, &["sessionID"]) {
                Some(session_id) => AgentEvent::SessionIdle { session_id },
                None => unrecognized(kind),
            },

            "session.error" => AgentEvent::SessionError {
                session_id: string_at(body, &["sessionID"]),
                error: body.get("error").cloned().unwrap_or_else(|| body.clone()),
            },

            "message.updated" => {
                let info = body.get("info").unwrap_or(body);
                let session_id = string_at(info, &["sessionID"]);
                let message_id = string_at(info, &["id"]);
                match (session_id, message_id) {
                    (Some(session_id), Some(message_id)) => AgentEvent::MessageUpdated {
                        session_id,
                        message_id,
                        role: string_at(info, &["role"]),
                        info: info.clone(),
                    },
                    _ => unrecognized(kind),
                }
            }

            "message.part.updated" => {
                let Some(part_value) = body.get("part") else {
                    return unrecognized(kind);
                };
                match serde_json::from_value::<PartUpdate>(part_value.clone()) {
                    Ok(mut part) => {
                        if part.delta.is_none() {
                            part.delta = string_at(body, &["delta"]);
                        }
                        AgentEvent::MessagePartUpdated { part }
                    }
                    Err(_) => unrecognized(kind),
                }
            }

            "message.removed" => {
                let session_id = string_at(body, &["sessionID"]);
                let message_id = string_at(body, &["messageID"]);
                match (session_id, message_id) {
                    (Some(session_id), Some(message_id)) => AgentEvent::MessageRemoved {
                        session_id,
                        message_id,
                    },
                    _ => unrecognized(kind),
                }
            }

            "permission.updated" => match string_at(body, &["sessionID"]) {
                Some(session_id) => AgentEvent::PermissionUpdated {
                    session_id,
                    request: body.clone(),
                },
                None => unrecognized(kind),
            },

            _ => unrecognized(kind),
        }
    }
}

fn unrecognized(kind: &str) -> AgentEvent {
    AgentEvent::Unrecognized {
        kind: kind.to_string(),
    }
}

fn decode_session(body: &Value) -> Option<SessionInfo> {
    let candidate = body.get("info").or_else(|| body.get("session")).unwrap_or(body);
    let session: SessionInfo = serde_json::from_value(candidate.clone()).ok()?;
    if session.id.is_empty() {
        return None;
    }
    Some(session)
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().map(|s| s.to_string())
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One frame off the event stream: the decoded event plus the raw payload
/// the decode did not consume.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Directory the server scoped this event to, when it says.
    pub directory: Option<String>,
    pub kind: String,
    pub event: AgentEvent,
    /// The frame as received.
    pub payload: Value,
}

impl EventEnvelope {
    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_str(data)?;
        let raw: RawEvent = serde_json::from_value(payload.clone())?;
        let event = AgentEvent::decode(&raw.kind, &payload);
        Ok(Self {
            directory: raw.directory,
            kind: raw.kind,
            event,
            payload,
        })
    }

    /// Probe the raw payload for a session id, trying the known wire shapes
    /// in fixed order.
    pub fn probe_session_id(&self) -> Option<String> {
        extract_session_id(&self.payload)
    }
}

/// Session-id probe used for events the decode does not model.
pub fn extract_session_id(raw: &Value) -> Option<String> {
    if let Some(id) = string_at(raw, &["sessionID"]) {
        return Some(id);
    }
    if let Some(id) = string_at(raw, &["properties", "sessionID"]) {
        return Some(id);
    }
    if let Some(id) = string_at(raw, &["properties", "part", "sessionID"]) {
        return Some(id);
    }
    if let Some(id) = string_at(raw, &["properties", "session", "id"]) {
        return Some(id);
    }
    None
}

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

/// Reassembles SSE frames out of arbitrary byte-chunk boundaries. Only
/// `data:` lines matter; comment lines and event names are skipped.
pub(crate) struct SseAccumulator {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
            data_lines: Vec::new(),
        }
    }

    /// Feed one chunk; returns the payloads of every frame it completed.
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        events
    }
}
