//! Git collaborator for the dev CLI.
//!
//! The desktop app manages one worktree per client session; the CLI runs
//! its session in the repository checkout itself, so the worktree
//! registered here is the repo root and the branch is whatever HEAD points
//! at. Branch probes and renames shell out to git.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tokio::process::Command;
use tracing::warn;

use paddock_core::WorktreeGit;
use paddock_protocol::{new_id, WorktreeFields, WorktreeRecord};

use crate::storage::Db;

pub struct CliWorktrees {
    db: Db,
    repo_root: PathBuf,
}

impl CliWorktrees {
    pub fn new(db: Db, repo_root: PathBuf) -> Self {
        Self { db, repo_root }
    }

    /// Bind the repository checkout to `client_session_id` as its worktree.
    /// Replaces any earlier binding for the same session. Returns `None`
    /// when HEAD is not on a branch; the session still works, it just never
    /// gets a branch auto-rename.
    pub async fn register(&self, client_session_id: &str) -> anyhow::Result<Option<WorktreeRecord>> {
        let Some(branch) = self.current_branch().await else {
            warn!(
                component = "cli",
                event = "worktree.unbound",
                path = %self.repo_root.display(),
                "Not on a git branch; branch auto-rename is disabled for this session"
            );
            return Ok(None);
        };
        let record = WorktreeRecord {
            id: new_id(),
            client_session_id: client_session_id.to_string(),
            path: self.repo_root.display().to_string(),
            branch_name: branch,
            branch_renamed: false,
        };
        let row = record.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO worktrees (id, client_session_id, path, branch_name, branch_renamed)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(client_session_id) DO UPDATE SET
                       id = ?1, path = ?3, branch_name = ?4, branch_renamed = ?5",
                    params![
                        row.id,
                        row.client_session_id,
                        row.path,
                        row.branch_name,
                        row.branch_renamed
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(Some(record))
    }

    /// Current branch of the repository, if HEAD is on one.
    async fn current_branch(&self) -> Option<String> {
        let name = run_git(&["rev-parse", "--abbrev-ref", "HEAD"], &self.repo_root).await?;
        if name == "HEAD" {
            // Detached.
            return None;
        }
        Some(name)
    }
}

#[async_trait]
impl WorktreeGit for CliWorktrees {
    async fn branch_exists(&self, name: &str) -> anyhow::Result<bool> {
        let status = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("refs/heads/{name}"))
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("could not run git rev-parse")?;
        Ok(status.success())
    }

    async fn rename_branch(&self, worktree_path: &str, from: &str, to: &str) -> anyhow::Result<()> {
        let output = Command::new("git")
            .args(["branch", "-m", from, to])
            .current_dir(worktree_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("could not run git branch -m")?;
        if !output.status.success() {
            bail!(
                "git branch -m {from} {to} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn worktree_for_session(
        &self,
        client_session_id: &str,
    ) -> anyhow::Result<Option<WorktreeRecord>> {
        let id = client_session_id.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, client_session_id, path, branch_name, branch_renamed
                         FROM worktrees WHERE client_session_id = ?1",
                        params![id],
                        worktree_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }

    async fn update_worktree(&self, worktree_id: &str, fields: WorktreeFields) -> anyhow::Result<()> {
        let id = worktree_id.to_string();
        self.db
            .call(move |conn| {
                if let Some(branch_name) = fields.branch_name {
                    conn.execute(
                        "UPDATE worktrees SET branch_name = ?2 WHERE id = ?1",
                        params![id, branch_name],
                    )?;
                }
                if let Some(branch_renamed) = fields.branch_renamed {
                    conn.execute(
                        "UPDATE worktrees SET branch_renamed = ?2 WHERE id = ?1",
                        params![id, branch_renamed],
                    )?;
                }
                Ok(())
            })
            .await
    }
}

fn worktree_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorktreeRecord> {
    Ok(WorktreeRecord {
        id: row.get(0)?,
        client_session_id: row.get(1)?,
        path: row.get(2)?,
        branch_name: row.get(3)?,
        branch_renamed: row.get(4)?,
    })
}

async fn run_git(args: &[&str], cwd: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
