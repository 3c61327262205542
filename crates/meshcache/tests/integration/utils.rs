use std::sync::Arc;

use meshcache::{
    Group, GroupOptions, Loader, LocalCache, PeerEndpoint, PeerPool, Registry,
};

/// Builds the group's picker on `pool`, points it at `peers`, and registers
/// the group.
pub fn register_group(
    pool: &Arc<PeerPool>,
    peers: &[PeerEndpoint],
    name: &str,
    loader: Arc<dyn Loader>,
    cache: Option<Arc<dyn LocalCache>>,
    options: GroupOptions,
) -> Arc<Group> {
    let picker = pool.get_picker(name, None);
    picker.set(peers);
    Registry::global().new_group(name, loader, picker, cache, options)
}
