use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use meshcache::{CacheControl, CacheError, Config, DiskCache, GroupOptions, LocalCache};
use meshcache_test::{echo_loader, setup, spawn_peer, FnLoader};

use crate::utils::register_group;

#[tokio::test]
async fn test_local_roundtrip() {
    setup();

    let (pool, endpoint) = spawn_peer(Config::default()).await;
    let loader = FnLoader::new(|_key: &str, _control: &CacheControl| Ok(b"HelloWorld".to_vec()));
    let group = register_group(
        &pool,
        std::slice::from_ref(&endpoint),
        "local-roundtrip",
        loader.clone(),
        None,
        GroupOptions::default(),
    );

    let token = CancellationToken::new();
    let control = CacheControl::new();
    let mut sink = Vec::new();
    group.get("key1", &mut sink, &control, &token).await.unwrap();
    assert_eq!(sink, b"HelloWorld");
    assert!(!control.no_store());

    // served from the local cache now
    assert_eq!(group.get_bytes("key1", &token).await.unwrap(), b"HelloWorld");
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_no_store_propagates_and_skips_cache() {
    setup();

    let (pool, endpoint) = spawn_peer(Config::default()).await;
    let loader = FnLoader::new(|_key: &str, control: &CacheControl| {
        control.set_no_store(true);
        Ok(b"HelloWorld".to_vec())
    });
    let group = register_group(
        &pool,
        std::slice::from_ref(&endpoint),
        "local-no-store",
        loader.clone(),
        None,
        GroupOptions::default(),
    );

    let token = CancellationToken::new();
    let control = CacheControl::new();
    let mut sink = Vec::new();
    group.get("key1", &mut sink, &control, &token).await.unwrap();
    assert_eq!(sink, b"HelloWorld");
    assert!(control.no_store());
    assert!(!group.cache().contains("key1").await);

    // not retained: the origin runs again
    assert_eq!(group.get_bytes("key1", &token).await.unwrap(), b"HelloWorld");
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_cancelled_token_stops_the_call() {
    setup();

    let (pool, endpoint) = spawn_peer(Config::default()).await;
    let loader = echo_loader();
    let group = register_group(
        &pool,
        std::slice::from_ref(&endpoint),
        "local-cancelled",
        loader.clone(),
        None,
        GroupOptions::default(),
    );

    let token = CancellationToken::new();
    token.cancel();
    let control = CacheControl::new();
    let mut sink = Vec::new();
    let result = group.get("key1", &mut sink, &control, &token).await;

    assert_eq!(result, Err(CacheError::Cancelled));
    assert!(sink.is_empty());
    assert_eq!(loader.calls(), 0);
}

#[tokio::test]
async fn test_disk_backed_roundtrip() {
    setup();

    let cache_dir = tempfile::tempdir().unwrap();
    let (pool, endpoint) = spawn_peer(Config::default()).await;
    let loader =
        FnLoader::new(|key: &str, _control: &CacheControl| Ok(format!("disk:{key}").into_bytes()));
    let disk = DiskCache::new(cache_dir.path(), 16, Arc::new(meshcache::NullStats)).unwrap();
    let group = register_group(
        &pool,
        std::slice::from_ref(&endpoint),
        "local-disk-roundtrip",
        loader.clone(),
        Some(Arc::new(disk)),
        GroupOptions::default(),
    );

    let token = CancellationToken::new();
    assert_eq!(group.get_bytes("key1", &token).await.unwrap(), b"disk:key1");
    assert_eq!(group.get_bytes("key1", &token).await.unwrap(), b"disk:key1");
    assert_eq!(loader.calls(), 1);
    assert!(group.cache().contains("key1").await);
}
