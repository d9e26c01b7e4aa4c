//! Paddock CLI
//!
//! Dev harness for the orchestration core: runs one client session in a
//! repository against a freshly spawned agent server, prints every session
//! event as a JSON line, and forwards stdin lines as prompts.

mod logging;
mod storage;
mod worktrees;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use paddock_agent_client::ServerConfig;
use paddock_core::{Desktop, Orchestrator, OrchestratorConfig, Storage};
use paddock_protocol::time::now_ms;
use paddock_protocol::{new_id, ProjectRecord, PromptPart, SessionNotification, SessionRecord};

use crate::logging::init_logging;
use crate::storage::SqliteStorage;
use crate::worktrees::CliWorktrees;

#[derive(Parser, Debug)]
#[command(name = "paddock", about = "Drive a Paddock agent session from the terminal")]
struct Cli {
    /// Working directory for the session (defaults to the current directory).
    #[arg(long)]
    directory: Option<PathBuf>,

    /// Data directory for the database and logs. Defaults to `~/.paddock`.
    #[arg(long, env = "PADDOCK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Reuse an existing client session id instead of minting a new one.
    #[arg(long)]
    session: Option<String>,

    /// Agent server binary.
    #[arg(long, env = "PADDOCK_SERVER_CMD", default_value = "opencode")]
    server_cmd: String,

    /// Arguments before the listen flags (repeatable). Defaults to `serve`.
    #[arg(long = "server-arg")]
    server_args: Vec<String>,

    /// Seconds to wait for the server to advertise its endpoint.
    #[arg(long, env = "PADDOCK_STARTUP_TIMEOUT_SECS", default_value = "20")]
    startup_timeout: u64,
}

/// The terminal has no app window, so every idle notification fires; it
/// lands on stderr instead of the OS notification center.
struct CliDesktop;

#[async_trait]
impl Desktop for CliDesktop {
    async fn window_focused(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn notify(&self, notification: SessionNotification) -> anyhow::Result<()> {
        info!(
            component = "cli",
            event = "cli.notification",
            client_session_id = %notification.client_session_id,
            title = %notification.title,
            "Session idle"
        );
        eprintln!("* {}: {}", notification.title, notification.body);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directory = match cli.directory {
        Some(path) => path,
        None => std::env::current_dir().context("could not resolve current directory")?,
    };
    let directory = directory
        .canonicalize()
        .with_context(|| format!("could not canonicalize {}", directory.display()))?;
    let directory_str = directory.display().to_string();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("could not resolve home directory")?
            .join(".paddock"),
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("could not create {}", data_dir.display()))?;
    let _logging = init_logging(&data_dir)?;

    let storage = Arc::new(SqliteStorage::open(data_dir.join("paddock.db"))?);

    let project = match storage.project_by_root(&directory_str).await? {
        Some(project) => project,
        None => {
            let project = ProjectRecord {
                id: new_id(),
                name: directory
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "workspace".to_string()),
                root_path: directory_str.clone(),
            };
            storage.insert_project(&project).await?;
            project
        }
    };

    let client_session_id = cli.session.unwrap_or_else(new_id);
    if storage.session(&client_session_id).await?.is_none() {
        let now = now_ms();
        storage
            .insert_session(&SessionRecord {
                id: client_session_id.clone(),
                project_id: project.id.clone(),
                title: None,
                directory: Some(directory_str.clone()),
                external_session_id: None,
                created_at_ms: now,
                updated_at_ms: now,
            })
            .await?;
    }

    let worktrees = Arc::new(CliWorktrees::new(storage.db(), directory.clone()));
    if let Some(worktree) = worktrees.register(&client_session_id).await? {
        info!(
            component = "cli",
            event = "cli.worktree_bound",
            branch = %worktree.branch_name,
            "Session bound to the current branch"
        );
    }

    let defaults = ServerConfig::default();
    let server = ServerConfig {
        command: cli.server_cmd,
        args: if cli.server_args.is_empty() {
            defaults.args
        } else {
            cli.server_args
        },
        startup_timeout: Duration::from_secs(cli.startup_timeout),
        request_timeout: defaults.request_timeout,
    };

    let (orchestrator, mut events) = Orchestrator::new(
        OrchestratorConfig { server },
        storage.clone(),
        worktrees,
        Arc::new(CliDesktop),
    );

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(error) => warn!(
                    component = "cli",
                    event = "cli.event_encode_failed",
                    error = %error,
                    "Could not encode session event"
                ),
            }
        }
    });

    // A previously bound external session is resumed when it still exists
    // upstream; anything else gets a fresh one.
    let mut external_session_id = None;
    if let Some(existing) = storage.session(&client_session_id).await? {
        if let Some(previous) = existing.external_session_id {
            let outcome = orchestrator
                .reconnect(&directory_str, &previous, &client_session_id)
                .await?;
            if outcome.success {
                eprintln!(
                    "Resumed session {previous}{}",
                    outcome
                        .status
                        .map(|status| format!(" ({status})"))
                        .unwrap_or_default()
                );
                external_session_id = Some(previous);
            }
        }
    }
    let external_session_id = match external_session_id {
        Some(id) => id,
        None => {
            let outcome = orchestrator
                .connect(&directory_str, &client_session_id)
                .await?;
            outcome.external_session_id
        }
    };

    eprintln!("Session {external_session_id} in {directory_str}");
    eprintln!("Type a prompt and press enter. /abort interrupts, /quit exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/abort" => {
                if let Err(error) = orchestrator.abort(&directory_str, &external_session_id).await {
                    eprintln!("abort failed: {error}");
                }
            }
            prompt => {
                if let Err(error) = orchestrator
                    .prompt(
                        &directory_str,
                        &external_session_id,
                        vec![PromptPart::text(prompt)],
                    )
                    .await
                {
                    eprintln!("prompt failed: {error}");
                }
            }
        }
    }

    orchestrator
        .disconnect(&directory_str, &external_session_id)
        .await;
    orchestrator.shutdown().await;
    Ok(())
}
