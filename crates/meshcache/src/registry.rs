//! Process-wide table of named groups.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::caching::{Loader, LocalCache, MemoryCache};
use crate::endpoint::GroupKey;
use crate::group::{Group, GroupOptions};
use crate::picker::PeerPicker;

static GLOBAL: Lazy<Registry> = Lazy::new(|| Registry {
    groups: DashMap::new(),
});

/// The process-wide group table.
///
/// Groups are keyed by `(name, self endpoint)` so several peers hosted in
/// one process (as in tests) keep their namespaces apart. Registration is
/// idempotent: the first winning registration is kept.
pub struct Registry {
    groups: DashMap<GroupKey, Arc<Group>>,
}

impl Registry {
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Registers a group, or returns the canonical instance if the key is
    /// already taken.
    ///
    /// Without an explicit cache the group gets a default-sized memory
    /// cache wired to the group's stats sink.
    pub fn new_group(
        &self,
        name: &str,
        loader: Arc<dyn Loader>,
        picker: Arc<PeerPicker>,
        cache: Option<Arc<dyn LocalCache>>,
        options: GroupOptions,
    ) -> Arc<Group> {
        let key = GroupKey::new(name, picker.self_endpoint());
        self.groups
            .entry(key)
            .or_insert_with(|| {
                let cache = cache.unwrap_or_else(|| {
                    Arc::new(MemoryCache::with_defaults(Arc::clone(&options.stats)))
                });
                Arc::new(Group::new(name, loader, picker, cache, options))
            })
            .clone()
    }

    /// Looks up a group for inbound dispatch.
    pub fn get_group(&self, key: &GroupKey) -> Option<Arc<Group>> {
        self.groups.get(key).map(|group| Arc::clone(group.value()))
    }
}
