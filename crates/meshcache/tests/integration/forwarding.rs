use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use meshcache::{
    CacheControl, CacheError, CacheResult, Config, Group, GroupKey, GroupOptions, Loader,
    Registry, Sink,
};
use meshcache_test::{echo_loader, setup, spawn_peer, CountingStats};

use crate::utils::register_group;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_peers_forward_to_the_owner() {
    setup();

    let (pool1, ep1) = spawn_peer(Config::default()).await;
    let (pool2, ep2) = spawn_peer(Config::default()).await;
    let peers = [ep1.clone(), ep2.clone()];

    let loader1 = echo_loader();
    let loader2 = echo_loader();
    let stats1 = CountingStats::new();
    let stats2 = CountingStats::new();

    let group1 = register_group(
        &pool1,
        &peers,
        "two-peer-forwarding",
        loader1.clone(),
        None,
        GroupOptions {
            stats: stats1.clone(),
            ..Default::default()
        },
    );
    let group2 = register_group(
        &pool2,
        &peers,
        "two-peer-forwarding",
        loader2.clone(),
        None,
        GroupOptions {
            stats: stats2.clone(),
            ..Default::default()
        },
    );

    let token = CancellationToken::new();
    for _round in 0..2 {
        for key in ["foo", "bar"] {
            assert_eq!(group1.get_bytes(key, &token).await.unwrap(), key.as_bytes());
            assert_eq!(group2.get_bytes(key, &token).await.unwrap(), key.as_bytes());
        }
    }

    // one origin fill per distinct key across the whole peer set
    assert_eq!(loader1.calls() + loader2.calls(), 2);

    // every forwarded load showed up as exactly one server request
    assert_eq!(
        stats1.peer_loads() + stats2.peer_loads(),
        stats1.server_requests() + stats2.server_requests()
    );
    assert_eq!(stats1.gets() + stats2.gets(), 8);
}

/// Parses the key as `n` and, for `n >= 2`, reads `n - 1` and `n - 2` back
/// through the same group, exercising recursive forwarded loads.
struct FibLoader {
    group_key: GroupKey,
    calls: Arc<AtomicUsize>,
}

impl Loader for FibLoader {
    fn load_into<'a>(
        &'a self,
        key: &'a str,
        sink: Sink<'a>,
        _cache_control: &'a CacheControl,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n: u64 = key
                .parse()
                .map_err(|_| CacheError::InternalServerError(format!("not a number: {key}")))?;
            let value = if n < 2 {
                n
            } else {
                let group = Registry::global()
                    .get_group(&self.group_key)
                    .ok_or(CacheError::InternalError)?;
                let a = fetch_number(&group, n - 1, token).await?;
                let b = fetch_number(&group, n - 2, token).await?;
                a + b
            };
            sink.write_all(value.to_string().as_bytes()).await?;
            Ok(())
        })
    }
}

async fn fetch_number(group: &Group, n: u64, token: &CancellationToken) -> CacheResult<u64> {
    let payload = group.get_bytes(&n.to_string(), token).await?;
    let text = String::from_utf8(payload).map_err(|_| CacheError::InternalError)?;
    text.parse().map_err(|_| CacheError::InternalError)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recursive_fibonacci_fills_each_number_once() {
    setup();

    // Deep recursive chains hold one admission permit per open server
    // request, so the limiter needs headroom beyond the recursion depth.
    let config = Config {
        max_concurrent_requests: 256,
        ..Default::default()
    };
    let (pool1, ep1) = spawn_peer(config.clone()).await;
    let (pool2, ep2) = spawn_peer(config).await;
    let peers = [ep1.clone(), ep2.clone()];

    let calls1 = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::new(AtomicUsize::new(0));
    let stats1 = CountingStats::new();
    let stats2 = CountingStats::new();

    let group1 = register_group(
        &pool1,
        &peers,
        "recursive-fibonacci",
        Arc::new(FibLoader {
            group_key: GroupKey::new("recursive-fibonacci", ep1.clone()),
            calls: Arc::clone(&calls1),
        }),
        None,
        GroupOptions {
            stats: stats1.clone(),
            ..Default::default()
        },
    );
    register_group(
        &pool2,
        &peers,
        "recursive-fibonacci",
        Arc::new(FibLoader {
            group_key: GroupKey::new("recursive-fibonacci", ep2.clone()),
            calls: Arc::clone(&calls2),
        }),
        None,
        GroupOptions {
            stats: stats2.clone(),
            ..Default::default()
        },
    );

    let token = CancellationToken::new();
    let payload = group1.get_bytes("90", &token).await.unwrap();
    assert_eq!(payload, b"2880067194370816120");

    // one origin fill per distinct n in 0..=90 across both peers
    assert_eq!(calls1.load(Ordering::SeqCst) + calls2.load(Ordering::SeqCst), 91);

    // forwarded loads and served peer requests line up
    assert_eq!(
        stats1.peer_loads() + stats2.peer_loads(),
        stats1.server_requests() + stats2.server_requests()
    );
}
