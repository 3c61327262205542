//! Shared helpers for meshcache tests: tracing setup, a counting stats
//! sink, closure-backed origin loaders, and ephemeral peer servers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use meshcache::{
    CacheControl, CacheError, CacheResult, Config, Loader, PeerEndpoint, PeerPool, Sink, StatsSink,
};

/// Setup function for tests.
///
/// Initializes logging; safe to call multiple times.
pub fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A stats sink that counts every trace, for assertions.
#[derive(Debug, Default)]
pub struct CountingStats {
    gets: AtomicU64,
    cache_hits: AtomicU64,
    loads_deduped: AtomicU64,
    local_loads: AtomicU64,
    peer_loads: AtomicU64,
    server_requests: AtomicU64,
    retries: AtomicU64,
    over_capacity: AtomicU64,
}

impl CountingStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::SeqCst)
    }

    pub fn loads_deduped(&self) -> u64 {
        self.loads_deduped.load(Ordering::SeqCst)
    }

    pub fn local_loads(&self) -> u64 {
        self.local_loads.load(Ordering::SeqCst)
    }

    pub fn peer_loads(&self) -> u64 {
        self.peer_loads.load(Ordering::SeqCst)
    }

    pub fn server_requests(&self) -> u64 {
        self.server_requests.load(Ordering::SeqCst)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn over_capacity(&self) -> u64 {
        self.over_capacity.load(Ordering::SeqCst)
    }
}

impl StatsSink for CountingStats {
    fn trace_gets(&self) {
        self.gets.fetch_add(1, Ordering::SeqCst);
    }

    fn trace_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    fn trace_loads_deduped(&self) {
        self.loads_deduped.fetch_add(1, Ordering::SeqCst);
    }

    fn trace_local_loads(&self) {
        self.local_loads.fetch_add(1, Ordering::SeqCst);
    }

    fn trace_peer_loads(&self) {
        self.peer_loads.fetch_add(1, Ordering::SeqCst);
    }

    fn trace_server_requests(&self) {
        self.server_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn trace_roundtrip_latency(&self, _elapsed: Duration) {}

    fn trace_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn trace_item_over_capacity(&self) {
        self.over_capacity.fetch_add(1, Ordering::SeqCst);
    }
}

/// Origin loader backed by a closure from key (and cache control) to
/// payload bytes, counting invocations.
pub struct FnLoader<F> {
    load: F,
    calls: AtomicUsize,
}

impl<F> FnLoader<F>
where
    F: Fn(&str, &CacheControl) -> CacheResult<Vec<u8>> + Send + Sync + 'static,
{
    pub fn new(load: F) -> Arc<Self> {
        Arc::new(Self {
            load,
            calls: AtomicUsize::new(0),
        })
    }

    /// How many times the origin ran.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> Loader for FnLoader<F>
where
    F: Fn(&str, &CacheControl) -> CacheResult<Vec<u8>> + Send + Sync + 'static,
{
    fn load_into<'a>(
        &'a self,
        key: &'a str,
        sink: Sink<'a>,
        cache_control: &'a CacheControl,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            if token.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            let payload = (self.load)(key, cache_control)?;
            sink.write_all(&payload).await?;
            Ok(())
        })
    }
}

/// An origin that echoes the key back as the payload.
pub fn echo_loader(
) -> Arc<FnLoader<impl Fn(&str, &CacheControl) -> CacheResult<Vec<u8>> + Send + Sync + 'static>> {
    FnLoader::new(|key: &str, _: &CacheControl| Ok(key.as_bytes().to_vec()))
}

/// Binds a peer pool on an ephemeral localhost port and serves it.
pub async fn spawn_peer(config: Config) -> (Arc<PeerPool>, PeerEndpoint) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding a test listener");
    let port = listener.local_addr().expect("listener address").port();
    let endpoint = PeerEndpoint::new("127.0.0.1", port);
    let pool = PeerPool::new(endpoint.clone(), config);
    tokio::spawn(Arc::clone(&pool).serve(listener));
    (pool, endpoint)
}

/// An endpoint that is guaranteed to refuse connections: the port was bound
/// once and released.
pub async fn dead_endpoint() -> PeerEndpoint {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding a throwaway listener");
    let port = listener.local_addr().expect("listener address").port();
    drop(listener);
    PeerEndpoint::new("127.0.0.1", port)
}
