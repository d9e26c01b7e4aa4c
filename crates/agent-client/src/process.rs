//! Agent-server subprocess lifecycle
//!
//! Spawns the external agent server with an auto-assigned port and waits for
//! it to advertise its endpoint on stdout. One server is shared by every
//! session; the orchestration core decides when to spawn and when to kill.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AgentServerError;

/// How the agent-server subprocess is launched and talked to.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Binary to launch (a name on PATH or an absolute path).
    pub command: String,
    /// Arguments before the listen flags, e.g. `["serve"]`.
    pub args: Vec<String>,
    /// How long to wait for the endpoint line on stdout.
    pub startup_timeout: Duration,
    /// Timeout for plain HTTP calls. Never applied to the event stream.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "opencode".to_string(),
            args: vec!["serve".to_string()],
            startup_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// A running agent-server subprocess and the endpoint it advertised.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    endpoint: String,
}

impl ServerProcess {
    /// Spawn the server and wait for it to print its endpoint.
    ///
    /// The server gets `--port 0` so the OS assigns a free port; the bound
    /// address is read back from stdout. Output printed before the endpoint
    /// line is captured and attached to spawn errors.
    pub async fn spawn(config: &ServerConfig) -> Result<Self, AgentServerError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .arg("--hostname")
            .arg("127.0.0.1")
            .arg("--port")
            .arg("0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            component = "agent_client",
            event = "server.spawn",
            command = %config.command,
            "Spawning agent server"
        );

        let mut child = command
            .spawn()
            .map_err(|e| AgentServerError::Spawn(format!("{}: {}", config.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentServerError::Spawn("no stdout on server process".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "agent_client",
                        event = "server.stderr",
                        line = %line,
                        "Agent server stderr"
                    );
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let mut captured = String::new();
        let deadline = tokio::time::Instant::now() + config.startup_timeout;

        let endpoint = loop {
            match tokio::time::timeout_at(deadline, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    if let Some(endpoint) = parse_endpoint(&line) {
                        break endpoint;
                    }
                    captured.push_str(&line);
                    captured.push('\n');
                }
                Ok(Ok(None)) => {
                    // EOF before the endpoint line: the server is gone (or
                    // closed stdout without it, which is just as fatal).
                    let status =
                        match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                            Ok(Ok(status)) => status.to_string(),
                            _ => {
                                child.kill().await.ok();
                                "closed stdout without exiting".to_string()
                            }
                        };
                    return Err(AgentServerError::SpawnExited {
                        status,
                        output: captured,
                    });
                }
                Ok(Err(e)) => {
                    child.kill().await.ok();
                    return Err(AgentServerError::Io(e));
                }
                Err(_elapsed) => {
                    child.kill().await.ok();
                    return Err(AgentServerError::SpawnTimeout {
                        waited: config.startup_timeout,
                        output: captured,
                    });
                }
            }
        };

        info!(
            component = "agent_client",
            event = "server.ready",
            endpoint = %endpoint,
            pid = ?child.id(),
            "Agent server advertised endpoint"
        );

        // Keep draining stdout so the server never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(
                    component = "agent_client",
                    event = "server.stdout",
                    line = %line,
                    "Agent server stdout"
                );
            }
        });

        Ok(Self { child, endpoint })
    }

    /// Base URL the server is listening on.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Hand the child to a background watcher.
    ///
    /// The returned receiver resolves with the exit status if the server dies
    /// on its own. Cancelling `cancel` instead kills the process; the
    /// receiver then never resolves.
    pub fn watch(mut self, cancel: CancellationToken) -> oneshot::Receiver<String> {
        let (exited_tx, exited_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                result = self.child.wait() => {
                    let status = match result {
                        Ok(status) => status.to_string(),
                        Err(e) => format!("wait error: {}", e),
                    };
                    warn!(
                        component = "agent_client",
                        event = "server.exited",
                        status = %status,
                        "Agent server exited on its own"
                    );
                    let _ = exited_tx.send(status);
                }
                () = cancel.cancelled() => {
                    self.child.kill().await.ok();
                    debug!(
                        component = "agent_client",
                        event = "server.killed",
                        "Agent server terminated on release"
                    );
                }
            }
        });
        exited_rx
    }
}

/// Pull the advertised endpoint out of a startup line. The server prints
/// something like `agent server listening on http://127.0.0.1:49152`.
fn parse_endpoint(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(|token| token.trim_end_matches('/').to_string())
}
