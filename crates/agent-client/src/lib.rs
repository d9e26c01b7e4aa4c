//! Paddock Agent Client
//!
//! Everything that touches the external agent server: spawning the
//! subprocess and parsing the endpoint it advertises, the HTTP API surface,
//! and the SSE event stream with its typed decode. The orchestration core
//! never sees wire shapes, only [`AgentApi`] and [`EventEnvelope`].

use std::time::Duration;

use thiserror::Error;

pub mod events;
pub mod http;
pub mod process;

pub use events::{AgentEvent, EventEnvelope, PartUpdate, SessionInfo, ToolState};
pub use http::{AgentApi, EventSubscription, HttpAgentClient};
pub use process::{ServerConfig, ServerProcess};

/// Errors at the agent-server boundary
#[derive(Debug, Error)]
pub enum AgentServerError {
    #[error("server did not advertise an endpoint within {waited:?}; output:\n{output}")]
    SpawnTimeout { waited: Duration, output: String },

    #[error("server exited during startup ({status}); output:\n{output}")]
    SpawnExited { status: String, output: String },

    #[error("failed to spawn server: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("event channel closed")]
    ChannelClosed,
}
