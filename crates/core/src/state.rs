//! Shared orchestration state.

use crate::message_store::MessageStore;
use crate::parent_cache::ParentCache;
use crate::session_map::SessionMap;
use crate::subscription::SubscriptionTable;

/// The maps every session operation and the router mutate, kept behind one
/// `tokio::sync::Mutex`. The lock is only ever held across synchronous
/// sections; upstream calls and collaborator IO happen outside it.
#[derive(Debug, Default)]
pub(crate) struct CoreState {
    pub(crate) sessions: SessionMap,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) parents: ParentCache,
    pub(crate) messages: MessageStore,
    /// The persisted session map is merged in once, on the first operation
    /// that needs it.
    pub(crate) map_loaded: bool,
}
