//! Ref-counted event subscriptions, one per directory.
//!
//! [`SubscriptionTable`] owns the per-directory session counts and their
//! cancellation tokens; [`run_pull_loop`] is the task body that drains one
//! directory's stream into the router.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use paddock_agent_client::{AgentApi, EventSubscription};

use crate::router::Router;

/// One live event stream for a directory.
#[derive(Debug)]
struct DirectorySubscription {
    cancel: CancellationToken,
    session_count: usize,
}

/// Tracks how many sessions share each directory's stream. The pull loops
/// themselves run elsewhere; this table only owns the counts and the
/// cancellation tokens.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: HashMap<String, DirectorySubscription>,
}

impl SubscriptionTable {
    /// Add one reference to `directory`. The first reference mints a child
    /// token of `parent` and returns it so the caller can start the pull
    /// loop; later references return `None`.
    pub fn retain(&mut self, directory: &str, parent: &CancellationToken) -> Option<CancellationToken> {
        match self.entries.get_mut(directory) {
            Some(subscription) => {
                subscription.session_count += 1;
                debug!(
                    component = "subscription",
                    event = "subscription.retained",
                    directory = %directory,
                    session_count = subscription.session_count,
                    "Shared existing directory subscription"
                );
                None
            }
            None => {
                let cancel = parent.child_token();
                self.entries.insert(
                    directory.to_string(),
                    DirectorySubscription {
                        cancel: cancel.clone(),
                        session_count: 1,
                    },
                );
                Some(cancel)
            }
        }
    }

    /// Drop one reference. At zero the stream is cancelled and the entry
    /// removed; returns true when that happened.
    pub fn release(&mut self, directory: &str) -> bool {
        let Some(subscription) = self.entries.get_mut(directory) else {
            return false;
        };
        subscription.session_count = subscription.session_count.saturating_sub(1);
        if subscription.session_count > 0 {
            return false;
        }
        if let Some(subscription) = self.entries.remove(directory) {
            subscription.cancel.cancel();
            debug!(
                component = "subscription",
                event = "subscription.cancelled",
                directory = %directory,
                "Cancelled directory subscription"
            );
        }
        true
    }

    pub fn count(&self, directory: &str) -> usize {
        self.entries
            .get(directory)
            .map(|subscription| subscription.session_count)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry. For use after the server handle's root token has
    /// already cancelled the streams.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Drain one directory's event stream into the router.
///
/// Each envelope is routed to completion before the next pull, so events
/// within a directory are never reordered or overlapped. Cancellation is
/// the normal way out; a stream that ends on its own is logged and the
/// loop exits without restarting.
pub(crate) async fn run_pull_loop(
    router: Arc<Router>,
    api: Arc<dyn AgentApi>,
    directory: String,
    mut subscription: EventSubscription,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(
                    component = "subscription",
                    event = "subscription.closed",
                    directory = %directory,
                    "Directory pull loop cancelled"
                );
                return;
            }
            envelope = subscription.next_event() => {
                match envelope {
                    Some(envelope) => router.handle(api.as_ref(), envelope, &directory).await,
                    None if cancel.is_cancelled() => {
                        debug!(
                            component = "subscription",
                            event = "subscription.closed",
                            directory = %directory,
                            "Directory pull loop cancelled"
                        );
                        return;
                    }
                    None => {
                        warn!(
                            component = "subscription",
                            event = "subscription.stream_ended",
                            directory = %directory,
                            "Event stream ended without being cancelled"
                        );
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retain_mints_a_token_later_ones_only_count() {
        let parent = CancellationToken::new();
        let mut table = SubscriptionTable::default();

        let token = table.retain("/work/a", &parent);
        assert!(token.is_some());
        assert!(table.retain("/work/a", &parent).is_none());
        assert_eq!(table.count("/work/a"), 2);
    }

    #[test]
    fn release_cancels_only_at_zero() {
        let parent = CancellationToken::new();
        let mut table = SubscriptionTable::default();
        let token = table.retain("/work/a", &parent).unwrap();
        table.retain("/work/a", &parent);

        assert!(!table.release("/work/a"));
        assert!(!token.is_cancelled());

        assert!(table.release("/work/a"));
        assert!(token.is_cancelled());
        assert_eq!(table.count("/work/a"), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn release_of_unknown_directory_is_a_no_op() {
        let mut table = SubscriptionTable::default();
        assert!(!table.release("/work/missing"));
    }

    #[test]
    fn cancelling_the_parent_reaches_child_tokens() {
        let parent = CancellationToken::new();
        let mut table = SubscriptionTable::default();
        let token = table.retain("/work/a", &parent).unwrap();

        parent.cancel();
        assert!(token.is_cancelled());
    }

    mod pull_loop {
        use super::*;
        use crate::message_store::EchoGuard;
        use crate::session_map::SessionKey;
        use crate::state::CoreState;
        use crate::test_support::{FakeAgentApi, FakeDesktop, FakeGit, FakeStorage};
        use paddock_agent_client::EventEnvelope;
        use paddock_protocol::SessionEvent;
        use serde_json::json;
        use tokio::sync::{mpsc, Mutex};

        async fn fixture() -> (Arc<Router>, mpsc::UnboundedReceiver<SessionEvent>) {
            let state = Arc::new(Mutex::new(CoreState::default()));
            state
                .lock()
                .await
                .sessions
                .insert(SessionKey::scoped("/work/a", "ext-1"), "cs-1");
            let (ui_tx, ui_rx) = mpsc::unbounded_channel();
            let router = Arc::new(Router::new(
                state,
                Arc::new(EchoGuard::new()),
                Arc::new(FakeStorage::default()),
                Arc::new(FakeGit::default()),
                Arc::new(FakeDesktop::default()),
                ui_tx,
            ));
            (router, ui_rx)
        }

        fn idle_envelope() -> EventEnvelope {
            EventEnvelope::parse(
                &json!({"type": "session.idle", "properties": {"sessionID": "ext-1"}}).to_string(),
            )
            .expect("parse")
        }

        #[tokio::test]
        async fn routes_events_until_the_stream_closes() {
            let (router, mut ui_rx) = fixture().await;
            let api: Arc<dyn AgentApi> = FakeAgentApi::new();
            let (tx, rx) = mpsc::channel(8);
            let cancel = CancellationToken::new();

            let task = tokio::spawn(run_pull_loop(
                router,
                api,
                "/work/a".to_string(),
                EventSubscription::from_receiver(rx),
                cancel,
            ));

            tx.send(idle_envelope()).await.expect("send");
            let event = ui_rx.recv().await.expect("routed event");
            assert_eq!(event.client_session_id, "cs-1");

            // Closing the stream ends the loop even without cancellation.
            drop(tx);
            task.await.expect("loop exits");
        }

        #[tokio::test]
        async fn cancellation_stops_the_loop() {
            let (router, _ui_rx) = fixture().await;
            let api: Arc<dyn AgentApi> = FakeAgentApi::new();
            let (_tx, rx) = mpsc::channel::<EventEnvelope>(8);
            let cancel = CancellationToken::new();

            let task = tokio::spawn(run_pull_loop(
                router,
                api,
                "/work/a".to_string(),
                EventSubscription::from_receiver(rx),
                cancel.clone(),
            ));

            cancel.cancel();
            task.await.expect("loop exits");
        }
    }
}
