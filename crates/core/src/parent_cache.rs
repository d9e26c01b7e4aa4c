//! Cached parent links for subagent sessions.

use std::collections::HashMap;

/// Parent lookups keyed by `(directory, child external id)`.
///
/// A cached `None` records a server answer of "this session has no parent"
/// and short-circuits future lookups. Transport failures are never cached,
/// so the next event for the same child retries the lookup.
#[derive(Debug, Default)]
pub struct ParentCache {
    links: HashMap<(String, String), Option<String>>,
}

impl ParentCache {
    /// Outer `None` means not cached; inner `None` means cached orphan.
    pub fn get(&self, directory: &str, child_id: &str) -> Option<Option<String>> {
        self.links
            .get(&(directory.to_string(), child_id.to_string()))
            .cloned()
    }

    pub fn insert(&mut self, directory: &str, child_id: &str, parent: Option<String>) {
        self.links
            .insert((directory.to_string(), child_id.to_string()), parent);
    }

    /// Drop every link in `directory` that involves `external_id`, whether
    /// as the child or as the parent. Links never outlive the session
    /// mapping they hang off.
    pub fn evict_session(&mut self, directory: &str, external_id: &str) {
        self.links.retain(|(dir, child), parent| {
            dir != directory || (child != external_id && parent.as_deref() != Some(external_id))
        });
    }

    pub fn clear(&mut self) {
        self.links.clear();
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
