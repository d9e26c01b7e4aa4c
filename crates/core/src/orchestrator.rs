//! The session orchestration facade.
//!
//! One `Orchestrator` per app. The UI/IPC layer calls the session
//! operations here; everything event-shaped flows back through the
//! unbounded channel returned from the constructor. Internally this wires
//! the server slot, the shared [`CoreState`], and the router together and
//! owns the persistence of the session identity map.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use paddock_agent_client::{AgentServerError, ServerConfig};
use paddock_protocol::{PromptPart, SessionChanges, SessionEvent, EVENT_SERVER_EXITED};

use crate::error::OrchestratorError;
use crate::lifecycle::{ProcessLauncher, ServerHandle, ServerLauncher, ServerSlot};
use crate::message_store::EchoGuard;
use crate::router::Router;
use crate::session_map::{SessionKey, SessionMap, SESSION_MAP_KEY};
use crate::state::CoreState;
use crate::subscription::run_pull_loop;
use crate::traits::{Desktop, Storage, WorktreeGit};

/// Construction-time knobs.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
}

/// Result of [`Orchestrator::connect`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub external_session_id: String,
}

/// Result of [`Orchestrator::reconnect`]. `success: false` means the
/// external session no longer exists upstream and the caller should
/// `connect` fresh instead.
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Entry point for everything session-shaped.
#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<Mutex<CoreState>>,
    slot: Arc<ServerSlot>,
    router: Arc<Router>,
    echo: Arc<EchoGuard>,
    storage: Arc<dyn Storage>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Orchestrator {
    /// Build an orchestrator that spawns the real agent-server subprocess.
    /// The returned receiver carries every normalized event for the UI.
    pub fn new(
        config: OrchestratorConfig,
        storage: Arc<dyn Storage>,
        git: Arc<dyn WorktreeGit>,
        desktop: Arc<dyn Desktop>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::with_launcher(
            Arc::new(ProcessLauncher::new(config.server)),
            storage,
            git,
            desktop,
        )
    }

    /// Build with an injected launcher. Tests use this to stand in a fake
    /// agent server.
    pub fn with_launcher(
        launcher: Arc<dyn ServerLauncher>,
        storage: Arc<dyn Storage>,
        git: Arc<dyn WorktreeGit>,
        desktop: Arc<dyn Desktop>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(CoreState::default()));
        let echo = Arc::new(EchoGuard::new());
        let router = Arc::new(Router::new(
            state.clone(),
            echo.clone(),
            storage.clone(),
            git,
            desktop,
            events_tx.clone(),
        ));
        let orchestrator = Self {
            state,
            slot: Arc::new(ServerSlot::new(launcher)),
            router,
            echo,
            storage,
            events_tx,
        };
        (orchestrator, events_rx)
    }

    /// Open a fresh external session for `directory` and bind it to the
    /// given client session. Starts the agent server and the directory's
    /// event stream as needed.
    pub async fn connect(
        &self,
        directory: &str,
        client_session_id: &str,
    ) -> Result<ConnectOutcome, OrchestratorError> {
        self.ensure_map_loaded().await;
        let handle = self.acquire_server().await?;
        let created = handle.api.create_session(directory).await?;
        let external_session_id = created.id;

        self.register_session(&handle, directory, &external_session_id, client_session_id)
            .await?;

        // Best effort; the identity map is the source of truth for routing.
        let changes = SessionChanges {
            external_session_id: Some(Some(external_session_id.clone())),
            ..SessionChanges::default()
        };
        if let Err(error) = self.storage.update_session(client_session_id, changes).await {
            warn!(
                component = "orchestrator",
                event = "session.record_failed",
                client_session_id = %client_session_id,
                error = %error,
                "Could not record external session id"
            );
        }

        info!(
            component = "orchestrator",
            event = "session.connected",
            directory = %directory,
            client_session_id = %client_session_id,
            external_session_id = %external_session_id,
            "Connected session"
        );
        Ok(ConnectOutcome {
            external_session_id,
        })
    }

    /// Rebind an already-known external session, typically after an app
    /// restart. Joins the directory's stream without double-counting if the
    /// mapping is already live.
    pub async fn reconnect(
        &self,
        directory: &str,
        external_session_id: &str,
        client_session_id: &str,
    ) -> Result<ReconnectOutcome, OrchestratorError> {
        self.ensure_map_loaded().await;
        let handle = self.acquire_server().await?;

        let info = match handle.api.session_info(directory, external_session_id).await {
            Ok(info) => info,
            Err(AgentServerError::Api { status: 404, .. }) => {
                info!(
                    component = "orchestrator",
                    event = "session.gone",
                    directory = %directory,
                    external_session_id = %external_session_id,
                    "External session no longer exists upstream"
                );
                return Ok(ReconnectOutcome {
                    success: false,
                    status: None,
                });
            }
            Err(error) => return Err(error.into()),
        };

        self.register_session(&handle, directory, external_session_id, client_session_id)
            .await?;
        info!(
            component = "orchestrator",
            event = "session.reconnected",
            directory = %directory,
            client_session_id = %client_session_id,
            external_session_id = %external_session_id,
            "Reconnected session"
        );
        Ok(ReconnectOutcome {
            success: true,
            status: info.status_label(),
        })
    }

    /// Unbind an external session. The last session on a directory closes
    /// that directory's stream; the last session overall releases the
    /// server.
    pub async fn disconnect(&self, directory: &str, external_session_id: &str) {
        self.ensure_map_loaded().await;
        let (mapping, remaining) = {
            let mut state = self.state.lock().await;
            let removed = state
                .sessions
                .remove(&SessionKey::scoped(directory, external_session_id))
                .or_else(|| state.sessions.remove(&SessionKey::legacy(external_session_id)));
            let Some(mapping) = removed else {
                debug!(
                    component = "orchestrator",
                    event = "session.disconnect_unknown",
                    directory = %directory,
                    external_session_id = %external_session_id,
                    "Disconnect for a session that is not mapped"
                );
                return;
            };
            if mapping.active {
                state.subscriptions.release(directory);
            }
            state.parents.evict_session(directory, external_session_id);
            state.messages.remove_session(&mapping.client_session_id);
            (mapping, state.sessions.active_count())
        };
        self.echo.clear(&mapping.client_session_id);
        self.persist_map().await;

        info!(
            component = "orchestrator",
            event = "session.disconnected",
            directory = %directory,
            client_session_id = %mapping.client_session_id,
            external_session_id = %external_session_id,
            "Disconnected session"
        );
        if remaining == 0 {
            self.release_server().await;
        }
    }

    /// Send prompt parts to a mapped session, priming the echo guard with
    /// the prompt text so the server echoing it back is not stored twice.
    pub async fn prompt(
        &self,
        directory: &str,
        external_session_id: &str,
        parts: Vec<PromptPart>,
    ) -> Result<(), OrchestratorError> {
        self.ensure_map_loaded().await;
        let client_session_id = self.resolve_client(directory, external_session_id).await?;
        let handle = self.acquire_server().await?;

        let prompt_text = parts
            .iter()
            .filter_map(PromptPart::as_text)
            .collect::<Vec<_>>()
            .join("\n");
        if !prompt_text.is_empty() {
            self.echo.prime(&client_session_id, &prompt_text);
        }

        if let Err(error) = handle
            .api
            .send_prompt(directory, external_session_id, &parts)
            .await
        {
            self.echo.clear(&client_session_id);
            return Err(error.into());
        }
        debug!(
            component = "orchestrator",
            event = "session.prompted",
            directory = %directory,
            client_session_id = %client_session_id,
            parts = parts.len(),
            "Sent prompt"
        );
        Ok(())
    }

    /// Abort whatever the session's agent is doing. A no-op when the server
    /// is not running, since there is nothing to abort.
    pub async fn abort(
        &self,
        directory: &str,
        external_session_id: &str,
    ) -> Result<(), OrchestratorError> {
        self.ensure_map_loaded().await;
        let client_session_id = self.resolve_client(directory, external_session_id).await?;
        let Some(handle) = self.slot.current().await else {
            debug!(
                component = "orchestrator",
                event = "session.abort_idle",
                external_session_id = %external_session_id,
                "Abort with no server running"
            );
            return Ok(());
        };
        handle.api.abort(directory, external_session_id).await?;
        self.echo.clear(&client_session_id);
        Ok(())
    }

    /// App quit: release the server and every stream unconditionally. The
    /// persisted identity map survives for the next run's reconnects.
    pub async fn shutdown(&self) {
        self.state.lock().await.sessions.deactivate_all();
        self.release_server().await;
        info!(
            component = "orchestrator",
            event = "orchestrator.shutdown",
            "Orchestrator shut down"
        );
    }

    pub async fn server_running(&self) -> bool {
        self.slot.current().await.is_some()
    }

    async fn acquire_server(&self) -> Result<Arc<ServerHandle>, OrchestratorError> {
        let acquired = self.slot.acquire().await?;
        if let Some(exited) = acquired.exited {
            self.spawn_exit_watch(acquired.handle.clone(), exited);
        }
        Ok(acquired.handle)
    }

    /// Bind the key, settle the directory ref counts, and open the stream
    /// when this session is the directory's first. On a failed stream open
    /// the half-registered session is rolled back and the error surfaced.
    async fn register_session(
        &self,
        handle: &Arc<ServerHandle>,
        directory: &str,
        external_session_id: &str,
        client_session_id: &str,
    ) -> Result<(), OrchestratorError> {
        let key = SessionKey::scoped(directory, external_session_id);
        let token = {
            let mut state = self.state.lock().await;
            let outcome = state.sessions.insert(key.clone(), client_session_id);
            for displaced in &outcome.displaced {
                if let Some(displaced_directory) = displaced.directory.as_deref() {
                    state.subscriptions.release(displaced_directory);
                    state
                        .parents
                        .evict_session(displaced_directory, &displaced.external_id);
                }
            }
            if outcome.already_active {
                None
            } else {
                state.subscriptions.retain(directory, &handle.shutdown)
            }
        };

        if let Some(token) = token {
            match handle.api.subscribe(directory, token.clone()).await {
                Ok(subscription) => {
                    tokio::spawn(run_pull_loop(
                        self.router.clone(),
                        handle.api.clone(),
                        directory.to_string(),
                        subscription,
                        token,
                    ));
                }
                Err(error) => {
                    {
                        let mut state = self.state.lock().await;
                        state.subscriptions.release(directory);
                        state.sessions.remove(&key);
                    }
                    self.persist_map().await;
                    return Err(error.into());
                }
            }
        }

        self.persist_map().await;
        Ok(())
    }

    async fn resolve_client(
        &self,
        directory: &str,
        external_session_id: &str,
    ) -> Result<String, OrchestratorError> {
        self.state
            .lock()
            .await
            .sessions
            .resolve(directory, external_session_id)
            .ok_or_else(|| OrchestratorError::UnknownSession {
                directory: directory.to_string(),
                external_id: external_session_id.to_string(),
            })
    }

    /// Release the server and forget all per-server state. The handle's
    /// root token already cancelled every pull loop.
    async fn release_server(&self) {
        if self.slot.release().await.is_none() {
            return;
        }
        let mut state = self.state.lock().await;
        state.subscriptions.clear();
        state.parents.clear();
        state.messages.clear();
    }

    fn spawn_exit_watch(&self, handle: Arc<ServerHandle>, exited: oneshot::Receiver<String>) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            // A dropped sender means the release path killed the server on
            // purpose; only a delivered status is an unexpected death.
            if let Ok(status) = exited.await {
                orchestrator.handle_server_exit(handle, &status).await;
            }
        });
    }

    /// The subprocess died on its own. Tear down like `release` (the kill
    /// already happened), deactivate every session, and tell the UI which
    /// sessions lost their server. Persisted mappings stay for reconnects.
    async fn handle_server_exit(&self, handle: Arc<ServerHandle>, status: &str) {
        if !self.slot.release_if(&handle).await {
            return;
        }
        let live = {
            let mut state = self.state.lock().await;
            state.subscriptions.clear();
            state.parents.clear();
            state.messages.clear();
            state.sessions.deactivate_all()
        };
        warn!(
            component = "orchestrator",
            event = "server.exited",
            status = %status,
            sessions = live.len(),
            "Agent server exited; sessions deactivated"
        );
        for client_session_id in live {
            let event = SessionEvent::new(
                EVENT_SERVER_EXITED,
                client_session_id,
                json!({ "status": status }),
            );
            let _ = self.events_tx.send(event);
        }
    }

    /// Merge the persisted identity map in before the first operation that
    /// needs it. A storage read failure leaves the flag unset so the next
    /// operation retries.
    async fn ensure_map_loaded(&self) {
        if self.state.lock().await.map_loaded {
            return;
        }
        let loaded = match self.storage.setting(SESSION_MAP_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => Some(SessionMap::from_settings_json(&value)),
                Err(error) => {
                    warn!(
                        component = "orchestrator",
                        event = "session_map.corrupt",
                        error = %error,
                        "Persisted session map is not valid JSON; starting empty"
                    );
                    Some(SessionMap::default())
                }
            },
            Ok(None) => Some(SessionMap::default()),
            Err(error) => {
                warn!(
                    component = "orchestrator",
                    event = "session_map.load_failed",
                    error = %error,
                    "Could not load persisted session map"
                );
                None
            }
        };

        let mut state = self.state.lock().await;
        if state.map_loaded {
            return;
        }
        if let Some(loaded) = loaded {
            state.sessions.merge_persisted(loaded);
            state.map_loaded = true;
        }
    }

    async fn persist_map(&self) {
        let raw = self.state.lock().await.sessions.to_settings_json().to_string();
        if let Err(error) = self.storage.set_setting(SESSION_MAP_KEY, &raw).await {
            warn!(
                component = "orchestrator",
                event = "session_map.persist_failed",
                error = %error,
                "Could not persist session map"
            );
        }
    }
}
