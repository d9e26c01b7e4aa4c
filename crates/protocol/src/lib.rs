//! Paddock Protocol
//!
//! Shared types between the Paddock orchestration core, its storage layer,
//! and the desktop UI. These types are serialized as JSON over the app's
//! IPC channel.

use uuid::Uuid;

pub mod events;
pub mod time;
pub mod types;

pub use events::{SessionEvent, EVENT_BRANCH_RENAMED, EVENT_SERVER_EXITED};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
