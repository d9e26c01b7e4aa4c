//! Paddock Core
//!
//! The session-orchestration engine behind the Paddock desktop app. One
//! shared agent server subprocess serves every connected client session;
//! this crate owns that subprocess's lifecycle, the ref-counted
//! per-directory event streams, and the routing of agent events back to
//! the client sessions that own them.
//!
//! The entry point is [`Orchestrator`]. Embedders supply storage, git, and
//! desktop integration through the traits in [`traits`], and receive
//! [`paddock_protocol::SessionEvent`]s on the channel handed back by the
//! constructor.

pub mod branch_rename;
pub mod error;
pub mod lifecycle;
pub mod message_store;
mod notify;
pub mod orchestrator;
pub mod parent_cache;
mod router;
pub mod session_map;
mod state;
pub mod subscription;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::OrchestratorError;
pub use lifecycle::{LaunchedServer, ProcessLauncher, ServerHandle, ServerLauncher};
pub use notify::NOTIFY_IDLE_KEY;
pub use orchestrator::{ConnectOutcome, Orchestrator, OrchestratorConfig, ReconnectOutcome};
pub use traits::{Desktop, Storage, WorktreeGit};
