use tokio_util::sync::CancellationToken;

use meshcache::{Config, GroupOptions, PeerClient};
use meshcache_test::{dead_endpoint, echo_loader, setup, spawn_peer, CountingStats};

use crate::utils::register_group;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_owner_degrades_to_local_origin() {
    setup();

    let (pool, ep1) = spawn_peer(Config::default()).await;
    let dead = dead_endpoint().await;
    let peers = [ep1.clone(), dead.clone()];

    let loader = echo_loader();
    let stats = CountingStats::new();
    let group = register_group(
        &pool,
        &peers,
        "unreachable-owner",
        loader.clone(),
        None,
        GroupOptions {
            stats: stats.clone(),
            ..Default::default()
        },
    );

    // keys the dead peer owns
    let mut owned_by_dead = (0..1000)
        .map(|i| format!("key-{i}"))
        .filter(|key| group.picker().pick_peers(key, 1)[0].endpoint() == &dead);
    let key = owned_by_dead.next().expect("a key owned by the dead peer");
    let probe = owned_by_dead.next().expect("a second key owned by the dead peer");

    let token = CancellationToken::new();

    // Each call attempts the dead owner, fails to connect, and retries onto
    // the local replica. Two sequential failures trip the breaker
    // (breaker_max_failures defaults to 2).
    for _ in 0..2 {
        assert_eq!(group.get_bytes(&key, &token).await.unwrap(), key.as_bytes());
    }
    assert_eq!(stats.retries(), 2);
    assert_eq!(loader.calls(), 1);

    // Breaker open: the cold key fails fast without touching the network
    // and falls back to a direct origin read. A real connection attempt
    // would be retryable and bump the retry counter; breaker-open is not.
    assert_eq!(
        group.get_bytes(&probe, &token).await.unwrap(),
        probe.as_bytes()
    );
    assert_eq!(stats.retries(), 2);
    assert_eq!(loader.calls(), 2);
    assert_eq!(stats.peer_loads(), 3);
}
