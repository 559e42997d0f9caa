//! Group → Adapter lookup learned from inbound traffic.

use botrelay_core::AdapterId;
use dashmap::DashMap;

/// Which Adapter last reported activity in each group.
#[derive(Debug, Default)]
pub struct ContactCache {
    groups: DashMap<String, AdapterId>,
}

impl ContactCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `adapter` can reach `group`.
    pub fn remember_group(&self, group: &str, adapter: &AdapterId) {
        if self.groups.get(group).is_some_and(|current| *current == *adapter) {
            return;
        }
        let _ = self.groups.insert(group.to_owned(), adapter.clone());
    }

    /// Adapter that owns `group`, if known.
    pub fn adapter_for_group(&self, group: &str) -> Option<AdapterId> {
        self.groups.get(group).map(|entry| entry.value().clone())
    }

    /// Point every group owned by `old` at `new`.
    pub fn rename_adapter(&self, old: &AdapterId, new: &AdapterId) {
        self.groups
            .iter_mut()
            .filter(|entry| entry.value() == old)
            .for_each(|mut entry| *entry.value_mut() = new.clone());
    }

    /// Number of known groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether nothing has been learned.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
