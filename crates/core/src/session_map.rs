//! Identity map from external agent sessions to client sessions.
//!
//! Events off the wire carry external session ids; everything the app
//! persists is keyed by client session id. Keys are scoped by directory
//! because external ids are only unique per directory on the server side.
//! The map survives restarts through the settings store, including entries
//! written by older builds that predate directory scoping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Settings key the map is persisted under.
pub const SESSION_MAP_KEY: &str = "session.map";

/// Key for one external session. `directory: None` marks an entry persisted
/// before keys were directory-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub directory: Option<String>,
    pub external_id: String,
}

impl SessionKey {
    pub fn scoped(directory: &str, external_id: &str) -> Self {
        Self {
            directory: Some(directory.to_string()),
            external_id: external_id.to_string(),
        }
    }

    pub fn legacy(external_id: &str) -> Self {
        Self {
            directory: None,
            external_id: external_id.to_string(),
        }
    }
}

/// One mapped session.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub client_session_id: String,
    /// Entries loaded from persistence start inactive. A connect or
    /// reconnect claims them, and only active entries hold a subscription
    /// reference.
    pub active: bool,
}

/// What an insert did, so the caller can settle subscription ref counts.
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// The same key was already active before the insert.
    pub already_active: bool,
    /// Active keys that pointed at the same client session and were
    /// displaced; their directories each lose a subscription reference.
    pub displaced: Vec<SessionKey>,
}

#[derive(Debug, Default)]
pub struct SessionMap {
    entries: HashMap<SessionKey, Mapping>,
}

impl SessionMap {
    /// Bind `key` to a client session and mark it active. Any other key
    /// still pointing at the same client session is removed so each client
    /// session has exactly one live key.
    pub fn insert(&mut self, key: SessionKey, client_session_id: &str) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();

        let stale: Vec<SessionKey> = self
            .entries
            .iter()
            .filter(|(other, mapping)| {
                **other != key && mapping.client_session_id == client_session_id
            })
            .map(|(other, _)| other.clone())
            .collect();
        for old_key in stale {
            if let Some(mapping) = self.entries.remove(&old_key) {
                debug!(
                    component = "session_map",
                    event = "session_map.displaced",
                    client_session_id = %client_session_id,
                    external_id = %old_key.external_id,
                    "Displaced stale session mapping"
                );
                if mapping.active {
                    outcome.displaced.push(old_key);
                }
            }
        }

        if let Some(existing) = self.entries.get(&key) {
            outcome.already_active = existing.active;
        }
        self.entries.insert(
            key,
            Mapping {
                client_session_id: client_session_id.to_string(),
                active: true,
            },
        );
        outcome
    }

    /// Resolve an external id seen on `directory`'s stream.
    ///
    /// The scoped key wins. A legacy unscoped entry is adopted into scoped
    /// form on first sight. As a last resort any entry with the same
    /// external id matches, since persisted state can spell the scoping
    /// directory differently than the stream does.
    pub fn resolve(&mut self, directory: &str, external_id: &str) -> Option<String> {
        let scoped = SessionKey::scoped(directory, external_id);
        if let Some(mapping) = self.entries.get(&scoped) {
            return Some(mapping.client_session_id.clone());
        }
        if let Some(mapping) = self.entries.remove(&SessionKey::legacy(external_id)) {
            debug!(
                component = "session_map",
                event = "session_map.migrated",
                external_id = %external_id,
                directory = %directory,
                "Adopted legacy session mapping into directory scope"
            );
            let client_session_id = mapping.client_session_id.clone();
            self.entries.insert(scoped, mapping);
            return Some(client_session_id);
        }
        self.entries
            .iter()
            .find(|(key, _)| key.external_id == external_id)
            .map(|(_, mapping)| mapping.client_session_id.clone())
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<Mapping> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Mapping> {
        self.entries.get(key)
    }

    pub fn active_count(&self) -> usize {
        self.entries.values().filter(|mapping| mapping.active).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark every entry inactive, returning the client ids that were live.
    /// Used when the shared server goes away underneath the sessions.
    pub fn deactivate_all(&mut self) -> Vec<String> {
        let mut live = Vec::new();
        for mapping in self.entries.values_mut() {
            if mapping.active {
                mapping.active = false;
                live.push(mapping.client_session_id.clone());
            }
        }
        live.sort();
        live
    }

    /// Adopt entries loaded from persistence. In-memory entries win on
    /// conflict.
    pub fn merge_persisted(&mut self, loaded: SessionMap) {
        for (key, mapping) in loaded.entries {
            self.entries.entry(key).or_insert(mapping);
        }
    }

    pub fn to_settings_json(&self) -> Value {
        let mut rows: Vec<PersistedMapping> = self
            .entries
            .iter()
            .map(|(key, mapping)| PersistedMapping {
                directory: key.directory.clone(),
                external_id: key.external_id.clone(),
                client_session_id: mapping.client_session_id.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        serde_json::to_value(rows).unwrap_or_else(|_| Value::Array(Vec::new()))
    }

    /// Load from the persisted settings value. The current shape is an
    /// array of scoped entries; the oldest builds wrote a flat object of
    /// external id to client session id, which loads as unscoped keys.
    pub fn from_settings_json(value: &Value) -> Self {
        let mut map = SessionMap::default();
        match value {
            Value::Array(rows) => {
                for row in rows {
                    if let Ok(entry) = serde_json::from_value::<PersistedMapping>(row.clone()) {
                        map.entries.insert(
                            SessionKey {
                                directory: entry.directory,
                                external_id: entry.external_id,
                            },
                            Mapping {
                                client_session_id: entry.client_session_id,
                                active: false,
                            },
                        );
                    }
                }
            }
            Value::Object(fields) => {
                for (external_id, client) in fields {
                    if let Some(client_session_id) = client.as_str() {
                        map.entries.insert(
                            SessionKey::legacy(external_id),
                            Mapping {
                                client_session_id: client_session_id.to_string(),
                                active: false,
                            },
                        );
                    }
                }
            }
            _ => {}
        }
        map
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    directory: Option<String>,
    external_id: String,
    client_session_id: String,
}
