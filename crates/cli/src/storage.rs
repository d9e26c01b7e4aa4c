//! SQLite persistence for the dev CLI.
//!
//! The desktop app owns these records in production; the CLI keeps its own
//! small database so the orchestration core has real storage to talk to.
//! Every call opens a fresh connection on the blocking pool; WAL and a busy
//! timeout make that safe at CLI volumes.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use paddock_core::Storage;
use paddock_protocol::time::now_ms;
use paddock_protocol::{MessageRecord, ProjectRecord, SessionChanges, SessionRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    root_path  TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS sessions (
    id                   TEXT PRIMARY KEY,
    project_id           TEXT NOT NULL REFERENCES projects(id),
    title                TEXT,
    directory            TEXT,
    external_session_id  TEXT,
    created_at_ms        INTEGER NOT NULL,
    updated_at_ms        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    client_session_id  TEXT NOT NULL,
    message_id         TEXT NOT NULL,
    role               TEXT NOT NULL,
    text               TEXT NOT NULL,
    parts              TEXT NOT NULL,
    timeline           TEXT NOT NULL,
    created_at_ms      INTEGER NOT NULL,
    updated_at_ms      INTEGER NOT NULL,
    PRIMARY KEY (client_session_id, message_id)
);

CREATE TABLE IF NOT EXISTS settings (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS worktrees (
    id                 TEXT PRIMARY KEY,
    client_session_id  TEXT NOT NULL UNIQUE,
    path               TEXT NOT NULL,
    branch_name        TEXT NOT NULL,
    branch_renamed     INTEGER NOT NULL DEFAULT 0
);
";

/// Handle to the CLI database. Cheap to clone; connections are per-call.
#[derive(Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = db.connect()?;
        conn.execute_batch(SCHEMA)
            .context("could not apply database schema")?;
        Ok(db)
    }

    fn connect(&self) -> anyhow::Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("could not open database at {}", self.path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(conn)
    }

    /// Run a closure against a fresh connection on the blocking pool.
    pub async fn call<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || op(&db.connect()?))
            .await
            .context("database task panicked")?
    }
}

/// [`Storage`] backed by the CLI database, plus the seeding helpers the
/// CLI needs at startup.
pub struct SqliteStorage {
    db: Db,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self {
            db: Db::open(path)?,
        })
    }

    pub fn db(&self) -> Db {
        self.db.clone()
    }

    pub async fn insert_project(&self, record: &ProjectRecord) -> anyhow::Result<()> {
        let record = record.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO projects (id, name, root_path) VALUES (?1, ?2, ?3)",
                    params![record.id, record.name, record.root_path],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn project_by_root(&self, root_path: &str) -> anyhow::Result<Option<ProjectRecord>> {
        let root_path = root_path.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, name, root_path FROM projects WHERE root_path = ?1",
                        params![root_path],
                        project_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }

    pub async fn insert_session(&self, record: &SessionRecord) -> anyhow::Result<()> {
        let record = record.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, project_id, title, directory,
                                           external_session_id, created_at_ms, updated_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.id,
                        record.project_id,
                        record.title,
                        record.directory,
                        record.external_session_id,
                        record.created_at_ms,
                        record.updated_at_ms
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn session(&self, client_session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let id = client_session_id.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, project_id, title, directory, external_session_id,
                                created_at_ms, updated_at_ms
                         FROM sessions WHERE id = ?1",
                        params![id],
                        session_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }

    async fn project(&self, project_id: &str) -> anyhow::Result<Option<ProjectRecord>> {
        let id = project_id.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, name, root_path FROM projects WHERE id = ?1",
                        params![id],
                        project_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }

    async fn update_session(
        &self,
        client_session_id: &str,
        changes: SessionChanges,
    ) -> anyhow::Result<()> {
        let id = client_session_id.to_string();
        self.db
            .call(move |conn| {
                let now = now_ms();
                if let Some(title) = changes.title {
                    conn.execute(
                        "UPDATE sessions SET title = ?2, updated_at_ms = ?3 WHERE id = ?1",
                        params![id, title, now],
                    )?;
                }
                if let Some(external_session_id) = changes.external_session_id {
                    conn.execute(
                        "UPDATE sessions SET external_session_id = ?2, updated_at_ms = ?3
                         WHERE id = ?1",
                        params![id, external_session_id, now],
                    )?;
                }
                Ok(())
            })
            .await
    }

    async fn upsert_message(&self, record: &MessageRecord) -> anyhow::Result<()> {
        let record = record.clone();
        self.db
            .call(move |conn| {
                let parts = serde_json::to_string(&record.parts)?;
                let timeline = serde_json::to_string(&record.timeline)?;
                conn.execute(
                    "INSERT INTO messages (client_session_id, message_id, role, text, parts,
                                           timeline, created_at_ms, updated_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(client_session_id, message_id) DO UPDATE SET
                       role = ?3, text = ?4, parts = ?5, timeline = ?6, updated_at_ms = ?8",
                    params![
                        record.client_session_id,
                        record.message_id,
                        record.role.as_str(),
                        record.text,
                        parts,
                        timeline,
                        record.created_at_ms,
                        record.updated_at_ms
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = key.to_string();
        self.db
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM settings WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = ?2",
                    params![key, value],
                )?;
                Ok(())
            })
            .await
    }
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRecord> {
    Ok(ProjectRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        root_path: row.get(2)?,
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        directory: row.get(3)?,
        external_session_id: row.get(4)?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
    })
}
