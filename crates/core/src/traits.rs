//! Collaborator traits the orchestration core drives.
//!
//! The core owns no storage, git plumbing, or desktop integration of its
//! own. The desktop shell and the dev CLI each wire in implementations of
//! these traits; tests use in-memory fakes.

use async_trait::async_trait;

use paddock_protocol::{
    MessageRecord, ProjectRecord, SessionChanges, SessionNotification, SessionRecord,
    WorktreeFields, WorktreeRecord,
};

/// Git branch and worktree operations for a session's checkout.
#[async_trait]
pub trait WorktreeGit: Send + Sync {
    /// Whether `name` exists as a local branch in the session's repository.
    async fn branch_exists(&self, name: &str) -> anyhow::Result<bool>;

    /// Rename `from` to `to` in the repository behind `worktree_path`.
    async fn rename_branch(&self, worktree_path: &str, from: &str, to: &str)
        -> anyhow::Result<()>;

    /// The worktree bound to a client session, if one exists.
    async fn worktree_for_session(
        &self,
        client_session_id: &str,
    ) -> anyhow::Result<Option<WorktreeRecord>>;

    /// Apply delta updates to a worktree record.
    async fn update_worktree(&self, worktree_id: &str, fields: WorktreeFields)
        -> anyhow::Result<()>;
}

/// Durable records the core reads and upserts. Long-term ownership of the
/// data lives with the implementation.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn session(&self, client_session_id: &str) -> anyhow::Result<Option<SessionRecord>>;

    async fn project(&self, project_id: &str) -> anyhow::Result<Option<ProjectRecord>>;

    async fn update_session(
        &self,
        client_session_id: &str,
        changes: SessionChanges,
    ) -> anyhow::Result<()>;

    /// Persist a reconstructed message snapshot, replacing any previous one
    /// with the same session and message id.
    async fn upsert_message(&self, record: &MessageRecord) -> anyhow::Result<()>;

    async fn setting(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Desktop shell primitives the core needs for notifications.
#[async_trait]
pub trait Desktop: Send + Sync {
    /// Whether the app window currently has focus.
    async fn window_focused(&self) -> anyhow::Result<bool>;

    /// Show a desktop notification for an idle session.
    async fn notify(&self, notification: SessionNotification) -> anyhow::Result<()>;
}
