//! Event routing from the agent server to client sessions.
//!
//! Every envelope off a directory stream lands here. The router attributes
//! it to a client session (following parent links for subagents), runs the
//! side effects only top-level events get, folds message events into the
//! reconstruction store, and forwards a normalized event to the UI sink.
//! Unroutable events are dropped; side-effect failures are logged and never
//! stop the forward.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use paddock_agent_client::{AgentApi, AgentEvent, EventEnvelope};
use paddock_protocol::{SessionChanges, SessionEvent, EVENT_BRANCH_RENAMED};

use crate::branch_rename::{rename_for_title, RenameOutcome};
use crate::message_store::EchoGuard;
use crate::notify::maybe_notify;
use crate::state::CoreState;
use crate::traits::{Desktop, Storage, WorktreeGit};

/// A routed event's attribution.
struct Resolved {
    client_session_id: String,
    /// External id of the subagent the event came from, when the session
    /// was only reachable through a parent link.
    child: Option<String>,
}

pub(crate) struct Router {
    state: Arc<Mutex<CoreState>>,
    echo: Arc<EchoGuard>,
    storage: Arc<dyn Storage>,
    git: Arc<dyn WorktreeGit>,
    desktop: Arc<dyn Desktop>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Router {
    pub(crate) fn new(
        state: Arc<Mutex<CoreState>>,
        echo: Arc<EchoGuard>,
        storage: Arc<dyn Storage>,
        git: Arc<dyn WorktreeGit>,
        desktop: Arc<dyn Desktop>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            state,
            echo,
            storage,
            git,
            desktop,
            events,
        }
    }

    /// Route one envelope from `stream_directory`'s pull loop. The loop
    /// awaits this before pulling again, so events within a directory are
    /// handled strictly in arrival order.
    pub(crate) async fn handle(
        &self,
        api: &dyn AgentApi,
        envelope: EventEnvelope,
        stream_directory: &str,
    ) {
        // The envelope can carry its own directory tag; it wins over the
        // stream the event arrived on.
        let directory = envelope.directory.as_deref().unwrap_or(stream_directory);

        if matches!(
            envelope.event,
            AgentEvent::ServerConnected | AgentEvent::ServerHeartbeat
        ) {
            return;
        }

        let Some(external_id) = session_id_of(&envelope) else {
            debug!(
                component = "router",
                event = "router.no_session_id",
                kind = %envelope.kind,
                directory = %directory,
                "Dropping event without a session id"
            );
            return;
        };

        let Some(resolved) = self.resolve_session(api, directory, &external_id).await else {
            debug!(
                component = "router",
                event = "router.unroutable",
                kind = %envelope.kind,
                external_id = %external_id,
                directory = %directory,
                "Dropping event for unmapped session"
            );
            return;
        };

        // Subagent events carry their parent's attribution but never drive
        // notifications, renames, or the message store.
        if resolved.child.is_none() {
            match &envelope.event {
                AgentEvent::SessionIdle { .. } => {
                    maybe_notify(
                        self.storage.as_ref(),
                        self.desktop.as_ref(),
                        &resolved.client_session_id,
                    )
                    .await;
                }
                AgentEvent::SessionUpdated { session } => {
                    if let Some(title) = session.title.as_deref() {
                        self.apply_title(&resolved.client_session_id, title).await;
                    }
                }
                _ => {}
            }
            self.update_messages(&resolved.client_session_id, &envelope)
                .await;
        }

        let mut event = SessionEvent::new(
            envelope.kind.clone(),
            resolved.client_session_id,
            envelope.payload.clone(),
        );
        if let Some(child) = resolved.child {
            event = event.with_child(child);
        }
        self.forward(event);
    }

    /// Map an external id to a client session, going through the parent
    /// cache (and one `session_info` lookup on a cache miss) for subagents.
    async fn resolve_session(
        &self,
        api: &dyn AgentApi,
        directory: &str,
        external_id: &str,
    ) -> Option<Resolved> {
        let cached_parent = {
            let mut state = self.state.lock().await;
            if let Some(client_session_id) = state.sessions.resolve(directory, external_id) {
                return Some(Resolved {
                    client_session_id,
                    child: None,
                });
            }
            state.parents.get(directory, external_id)
        };

        let parent_id = match cached_parent {
            // Confirmed to have no parent; nothing to attribute to.
            Some(None) => return None,
            Some(Some(parent_id)) => Some(parent_id),
            None => match api.session_info(directory, external_id).await {
                Ok(info) => {
                    let mut state = self.state.lock().await;
                    state
                        .parents
                        .insert(directory, external_id, info.parent_id.clone());
                    info.parent_id
                }
                // Left uncached so the next event for this session retries.
                Err(error) => {
                    debug!(
                        component = "router",
                        event = "router.parent_lookup_failed",
                        external_id = %external_id,
                        directory = %directory,
                        error = %error,
                        "Parent lookup failed"
                    );
                    None
                }
            },
        };

        let parent_id = parent_id?;
        let client_session_id = self
            .state
            .lock()
            .await
            .sessions
            .resolve(directory, &parent_id)?;
        Some(Resolved {
            client_session_id,
            child: Some(external_id.to_string()),
        })
    }

    /// Persist a session title and run the branch auto-rename behind it.
    async fn apply_title(&self, client_session_id: &str, title: &str) {
        let changes = SessionChanges {
            title: Some(title.to_string()),
            ..SessionChanges::default()
        };
        if let Err(error) = self.storage.update_session(client_session_id, changes).await {
            warn!(
                component = "router",
                event = "router.title_persist_failed",
                client_session_id = %client_session_id,
                error = %error,
                "Could not persist session title"
            );
        }

        if let RenameOutcome::Renamed { from, to } =
            rename_for_title(self.git.as_ref(), client_session_id, title).await
        {
            self.forward(SessionEvent::new(
                EVENT_BRANCH_RENAMED,
                client_session_id,
                json!({ "from": from, "to": to }),
            ));
        }
    }

    /// Fold a message event into the store and persist the snapshot.
    async fn update_messages(&self, client_session_id: &str, envelope: &EventEnvelope) {
        let snapshot = match &envelope.event {
            AgentEvent::MessageUpdated {
                message_id,
                role,
                info,
                ..
            } => {
                let mut state = self.state.lock().await;
                state.messages.apply_message_update(
                    client_session_id,
                    message_id,
                    role.as_deref(),
                    &envelope.kind,
                    &envelope.payload,
                    info,
                )
            }
            AgentEvent::MessagePartUpdated { part } => {
                let mut state = self.state.lock().await;
                state.messages.apply_part_update(
                    client_session_id,
                    part,
                    &envelope.kind,
                    &envelope.payload,
                    &self.echo,
                )
            }
            AgentEvent::MessageRemoved { message_id, .. } => {
                self.state
                    .lock()
                    .await
                    .messages
                    .remove_message(client_session_id, message_id);
                None
            }
            _ => None,
        };

        if let Some(snapshot) = snapshot {
            if let Err(error) = self.storage.upsert_message(&snapshot).await {
                warn!(
                    component = "router",
                    event = "router.message_persist_failed",
                    client_session_id = %client_session_id,
                    message_id = %snapshot.message_id,
                    error = %error,
                    "Could not persist message snapshot"
                );
            }
        }
    }

    fn forward(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!(
                component = "router",
                event = "router.sink_closed",
                "UI sink dropped; event discarded"
            );
        }
    }
}

/// Session id for routing, from the typed payload where the decode has one
/// and from the raw-payload probe otherwise.
fn session_id_of(envelope: &EventEnvelope) -> Option<String> {
    match &envelope.event {
        AgentEvent::ServerConnected | AgentEvent::ServerHeartbeat => None,
        AgentEvent::SessionUpdated { session } => Some(session.id.clone()),
        AgentEvent::SessionDeleted { session_id }
        | AgentEvent::SessionIdle { session_id }
        | AgentEvent::MessageUpdated { session_id, .. }
        | AgentEvent::MessageRemoved { session_id, .. }
        | AgentEvent::PermissionUpdated { session_id, .. } => Some(session_id.clone()),
        AgentEvent::SessionError { session_id, .. } => session_id
            .clone()
            .or_else(|| envelope.probe_session_id()),
        AgentEvent::MessagePartUpdated { part } => Some(part.session_id.clone()),
        AgentEvent::Unrecognized { .. } => envelope.probe_session_id(),
    }
}
