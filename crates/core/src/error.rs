//! Orchestration errors surfaced to the UI/IPC layer.
//!
//! Only the session entry points return errors. Everything that happens on
//! the event path — routing misses, side-effect failures, persist failures —
//! is logged and swallowed so the stream keeps flowing.

use thiserror::Error;

use paddock_agent_client::AgentServerError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The agent server could not be spawned or refused a call.
    #[error(transparent)]
    Server(#[from] AgentServerError),

    /// No client session is mapped for the given external session.
    #[error("no session mapped for {external_id} in {directory}")]
    UnknownSession {
        directory: String,
        external_id: String,
    },
}
