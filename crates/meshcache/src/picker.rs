//! Key-to-peer placement.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::PeerClient;
use crate::endpoint::PeerEndpoint;
use crate::hashing::{default_key_hasher, jump_hash, KeyHasher};

/// Hands out clients for the peer picker's endpoints.
///
/// The pool implements this: the self endpoint binds to the in-process
/// handler (never an outbound client, which would loop requests back into
/// ourselves), every other endpoint to a breaker-wrapped remote client.
pub trait ClientSource: Send + Sync + 'static {
    fn self_endpoint(&self) -> &PeerEndpoint;
    fn local_client(&self) -> Arc<dyn PeerClient>;
    fn remote_client(&self, endpoint: &PeerEndpoint) -> Arc<dyn PeerClient>;
}

#[derive(Default)]
struct PickerState {
    /// Sorted; the sort order fixes the hash buckets.
    endpoints: Vec<PeerEndpoint>,
    clients: HashMap<PeerEndpoint, Arc<dyn PeerClient>>,
}

/// Maps keys onto an ordered replica list over the current peer set.
pub struct PeerPicker {
    source: Arc<dyn ClientSource>,
    key_hasher: KeyHasher,
    state: Mutex<PickerState>,
}

impl PeerPicker {
    pub fn new(source: Arc<dyn ClientSource>, key_hasher: Option<KeyHasher>) -> Self {
        Self {
            source,
            key_hasher: key_hasher.unwrap_or_else(default_key_hasher),
            state: Mutex::new(PickerState::default()),
        }
    }

    pub fn self_endpoint(&self) -> PeerEndpoint {
        self.source.self_endpoint().clone()
    }

    /// Replaces the peer set.
    pub fn set(&self, endpoints: &[PeerEndpoint]) {
        let mut state = self.state.lock();
        state.endpoints.clear();
        state.clients.clear();
        self.extend(&mut state, endpoints);
    }

    /// Unions `endpoints` into the peer set.
    pub fn add(&self, endpoints: &[PeerEndpoint]) {
        let mut state = self.state.lock();
        self.extend(&mut state, endpoints);
    }

    fn extend(&self, state: &mut PickerState, endpoints: &[PeerEndpoint]) {
        for endpoint in endpoints {
            if state.clients.contains_key(endpoint) {
                continue;
            }
            let client = if endpoint == self.source.self_endpoint() {
                self.source.local_client()
            } else {
                self.source.remote_client(endpoint)
            };
            state.clients.insert(endpoint.clone(), client);
            state.endpoints.push(endpoint.clone());
        }
        state.endpoints.sort();
    }

    /// Number of peers currently known.
    pub fn count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    /// Ordered replica clients for `key`: the canonical owner first, then
    /// deterministic fallbacks. No endpoint appears twice; the result length
    /// is `min(n, peer count)`.
    pub fn pick_peers(&self, key: &str, n: usize) -> Vec<Arc<dyn PeerClient>> {
        let (mut buckets, clients) = {
            let state = self.state.lock();
            (state.endpoints.clone(), state.clients.clone())
        };

        let hash = (self.key_hasher)(key);
        let mut picked = Vec::with_capacity(n.min(buckets.len()));
        while picked.len() < n && !buckets.is_empty() {
            let index = jump_hash(hash, buckets.len() as u32) as usize;
            let endpoint = buckets.remove(index);
            if let Some(client) = clients.get(&endpoint) {
                picked.push(Arc::clone(client));
            }
        }
        picked
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use futures::future::BoxFuture;
    use tokio_util::sync::CancellationToken;

    use crate::caching::{CacheControl, CacheError, CacheResult, Sink};

    use super::*;

    struct StubClient {
        endpoint: PeerEndpoint,
        local: bool,
    }

    impl PeerClient for StubClient {
        fn is_local(&self) -> bool {
            self.local
        }

        fn endpoint(&self) -> &PeerEndpoint {
            &self.endpoint
        }

        fn get<'a>(
            &'a self,
            _group: &'a str,
            _key: &'a str,
            _sink: Sink<'a>,
            _cache_control: &'a CacheControl,
            _token: &'a CancellationToken,
        ) -> BoxFuture<'a, CacheResult<()>> {
            Box::pin(async { Err(CacheError::InternalError) })
        }
    }

    struct StubSource {
        self_endpoint: PeerEndpoint,
    }

    impl ClientSource for StubSource {
        fn self_endpoint(&self) -> &PeerEndpoint {
            &self.self_endpoint
        }

        fn local_client(&self) -> Arc<dyn PeerClient> {
            Arc::new(StubClient {
                endpoint: self.self_endpoint.clone(),
                local: true,
            })
        }

        fn remote_client(&self, endpoint: &PeerEndpoint) -> Arc<dyn PeerClient> {
            Arc::new(StubClient {
                endpoint: endpoint.clone(),
                local: false,
            })
        }
    }

    fn picker_with_peers(peer_count: u16) -> PeerPicker {
        let endpoints: Vec<_> = (0..peer_count)
            .map(|i| PeerEndpoint::new(&format!("peer-{i}"), 80))
            .collect();
        let picker = PeerPicker::new(
            Arc::new(StubSource {
                self_endpoint: endpoints[0].clone(),
            }),
            None,
        );
        picker.set(&endpoints);
        picker
    }

    #[test]
    fn test_result_length_and_distinctness() {
        let picker = picker_with_peers(5);
        for key in ["a", "b", "some-longer-key"] {
            let picked = picker.pick_peers(key, 5);
            assert_eq!(picked.len(), 5);
            let distinct: HashSet<_> = picked
                .iter()
                .map(|client| client.endpoint().clone())
                .collect();
            assert_eq!(distinct.len(), 5);

            assert_eq!(picker.pick_peers(key, 8).len(), 5);
            assert_eq!(picker.pick_peers(key, 2).len(), 2);
        }
    }

    #[test]
    fn test_owner_is_stable_prefix() {
        let picker = picker_with_peers(5);
        for i in 0..50 {
            let key = format!("key-{i}");
            let owner = picker.pick_peers(&key, 1)[0].endpoint().clone();
            let replicas = picker.pick_peers(&key, 5);
            assert_eq!(replicas[0].endpoint(), &owner);
        }
    }

    #[test]
    fn test_self_binds_to_local_client() {
        let picker = picker_with_peers(3);
        let self_endpoint = picker.self_endpoint();
        for i in 0..50 {
            let key = format!("key-{i}");
            for client in picker.pick_peers(&key, 3) {
                assert_eq!(client.is_local(), *client.endpoint() == self_endpoint);
            }
        }
    }

    #[test]
    fn test_set_replaces_and_add_unions() {
        let a = PeerEndpoint::new("a", 80);
        let b = PeerEndpoint::new("b", 80);
        let c = PeerEndpoint::new("c", 80);

        let picker = PeerPicker::new(
            Arc::new(StubSource {
                self_endpoint: a.clone(),
            }),
            None,
        );

        picker.set(std::slice::from_ref(&a));
        assert_eq!(picker.count(), 1);

        picker.add(&[b.clone(), c.clone()]);
        assert_eq!(picker.count(), 3);
        picker.add(&[b.clone()]);
        assert_eq!(picker.count(), 3);

        picker.set(&[b, c]);
        assert_eq!(picker.count(), 2);
    }

    #[test]
    fn test_placement_spreads_over_peers() {
        let picker = picker_with_peers(4);
        let mut owners = HashSet::new();
        for i in 0..200 {
            let key = format!("spread-{i}");
            owners.insert(picker.pick_peers(&key, 1)[0].endpoint().clone());
        }
        assert_eq!(owners.len(), 4);
    }
}
