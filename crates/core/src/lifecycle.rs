//! Agent-server lifecycle.
//!
//! One agent-server subprocess backs every session. The slot spawns it on
//! first acquire and holds its lock across the spawn, so a concurrent first
//! caller awaits the in-flight attempt instead of spawning a second server.
//! Releasing the slot cancels the handle's root token, which kills the
//! subprocess and, through child tokens, every directory subscription.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use paddock_agent_client::{
    AgentApi, AgentServerError, HttpAgentClient, ServerConfig, ServerProcess,
};

/// A running agent server as the core sees it.
pub struct ServerHandle {
    /// API surface of the running server.
    pub api: Arc<dyn AgentApi>,
    /// Root cancellation token. Directory subscriptions run on child
    /// tokens; cancelling this tears the whole server down as a batch.
    pub shutdown: CancellationToken,
}

/// What a launcher hands back for a fresh server.
pub struct LaunchedServer {
    pub api: Arc<dyn AgentApi>,
    /// Resolves with the exit status if the server dies on its own. Dropped
    /// without a value when the shutdown token kills the process instead.
    pub exited: oneshot::Receiver<String>,
}

/// Seam between the slot and the concrete spawn, so tests can stand in a
/// fake server.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, shutdown: CancellationToken) -> Result<LaunchedServer, AgentServerError>;
}

/// Production launcher: spawn the subprocess, parse the endpoint it
/// advertises, and talk to it over HTTP.
pub struct ProcessLauncher {
    config: ServerConfig,
}

impl ProcessLauncher {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(&self, shutdown: CancellationToken) -> Result<LaunchedServer, AgentServerError> {
        let process = ServerProcess::spawn(&self.config).await?;
        let api = HttpAgentClient::new(process.endpoint(), self.config.request_timeout)?;
        let exited = process.watch(shutdown);
        Ok(LaunchedServer {
            api: Arc::new(api),
            exited,
        })
    }
}

/// A successful acquire. `exited` is `Some` exactly when this call spawned
/// the server, so one caller ends up watching for unexpected death.
pub struct Acquired {
    pub handle: Arc<ServerHandle>,
    pub exited: Option<oneshot::Receiver<String>>,
}

/// Single-flight owner of the shared server subprocess.
pub struct ServerSlot {
    launcher: Arc<dyn ServerLauncher>,
    slot: Mutex<Option<Arc<ServerHandle>>>,
}

impl ServerSlot {
    pub fn new(launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            launcher,
            slot: Mutex::new(None),
        }
    }

    /// The running handle, spawning the server if there is none. A failed
    /// spawn leaves the slot empty, so the next acquire retries.
    pub async fn acquire(&self) -> Result<Acquired, AgentServerError> {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(Acquired {
                handle: handle.clone(),
                exited: None,
            });
        }
        let shutdown = CancellationToken::new();
        let launched = self.launcher.launch(shutdown.clone()).await?;
        let handle = Arc::new(ServerHandle {
            api: launched.api,
            shutdown,
        });
        *slot = Some(handle.clone());
        info!(
            component = "lifecycle",
            event = "server.acquired",
            "Agent server running"
        );
        Ok(Acquired {
            handle,
            exited: Some(launched.exited),
        })
    }

    pub async fn current(&self) -> Option<Arc<ServerHandle>> {
        self.slot.lock().await.clone()
    }

    /// Take the handle and cancel its root token, killing the subprocess
    /// and every subscription stream. A later acquire spawns fresh.
    pub async fn release(&self) -> Option<Arc<ServerHandle>> {
        let handle = self.slot.lock().await.take()?;
        handle.shutdown.cancel();
        info!(
            component = "lifecycle",
            event = "server.released",
            "Agent server released"
        );
        Some(handle)
    }

    /// Release only if the slot still holds `handle`. The exit watcher uses
    /// this so a server that was already released (or replaced by a newer
    /// spawn) is not torn down twice.
    pub async fn release_if(&self, handle: &Arc<ServerHandle>) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, handle) => {
                slot.take();
                handle.shutdown.cancel();
                true
            }
            _ => false,
        }
    }
}
