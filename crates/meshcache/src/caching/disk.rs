//! Refcounted file-backed LRU.
//!
//! Entries live in exactly one of two tables: the idle LRU map, where the
//! cache holds the only reference, or the in-use map, where callers hold
//! leases on top of the cache's reference. One async reader/writer lock
//! serializes table transitions and eviction; the refcounts themselves are
//! plain atomics.
//!
//! Invariants, at every lock release:
//!
//! - An entry is in at most one of the two tables.
//! - While `in_cache` is set, the cache's own reference is counted.
//! - A lease keeps the refcount above zero and the backing file on disk
//!   until the lease is released.
//! - `max_entry_count` caps the idle table only; the total can transiently
//!   exceed it by the number of in-use entries.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::lru::{LruMap, LruOptions};
use crate::stats::StatsSink;

use super::fs::CacheFs;
use super::{CacheControl, CacheError, CacheResult, EntryHandle, Filler, LocalCache};

pub(crate) struct DiskEntry {
    key: String,
    path: Mutex<Option<PathBuf>>,
    refs: AtomicU32,
    in_cache: AtomicBool,
}

impl DiskEntry {
    fn new(key: &str, path: PathBuf, in_cache: bool) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_owned(),
            path: Mutex::new(Some(path)),
            refs: AtomicU32::new(1),
            in_cache: AtomicBool::new(in_cache),
        })
    }

    fn delete_file(&self, fs: &CacheFs) {
        if let Some(path) = self.path.lock().take() {
            fs.delete(&path);
        }
    }
}

/// Takes the cache's own reference away from an entry leaving the cache.
///
/// Outstanding leases keep the file alive; the final release deletes it.
fn finish_erase(fs: &CacheFs, entry: &DiskEntry) {
    entry.in_cache.store(false, Ordering::SeqCst);
    if entry.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
        entry.delete_file(fs);
    }
}

struct DiskState {
    /// Idle entries; the cache holds their only reference.
    lru: LruMap<String, Arc<DiskEntry>>,
    /// Leased entries, refcount >= 2.
    in_use: HashMap<String, Arc<DiskEntry>>,
}

struct DiskShared {
    fs: Arc<CacheFs>,
    state: RwLock<DiskState>,
    stats: Arc<dyn StatsSink>,
}

/// A disk-backed cache bounding resident idle entries to `max_entry_count`
/// while callers may hold open leases against retired entries.
pub struct DiskCache {
    shared: Arc<DiskShared>,
}

impl DiskCache {
    pub fn new(
        root: &Path,
        max_entry_count: usize,
        stats: Arc<dyn StatsSink>,
    ) -> io::Result<Self> {
        let fs = Arc::new(CacheFs::new(root)?);
        let evict_fs = Arc::clone(&fs);
        let lru = LruMap::new(LruOptions {
            max_entries: max_entry_count,
            ..Default::default()
        })
        .on_evict(move |_key: &String, entry: &Arc<DiskEntry>| finish_erase(&evict_fs, entry));

        Ok(Self {
            shared: Arc::new(DiskShared {
                fs,
                state: RwLock::new(DiskState {
                    lru,
                    in_use: HashMap::new(),
                }),
                stats,
            }),
        })
    }

    fn lease(&self, entry: Arc<DiskEntry>) -> EntryHandle {
        EntryHandle::Disk(DiskEntryHandle {
            entry,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Idle entry count, for bounds checks.
    pub async fn idle_len(&self) -> usize {
        self.shared.state.read().await.lru.len()
    }

    /// Leased entry count.
    pub async fn in_use_len(&self) -> usize {
        self.shared.state.read().await.in_use.len()
    }
}

impl LocalCache for DiskCache {
    fn get_or_add<'a>(
        &'a self,
        key: &'a str,
        fill: Filler,
        cache_control: CacheControl,
        token: CancellationToken,
    ) -> BoxFuture<'a, CacheResult<EntryHandle>> {
        Box::pin(async move {
            if token.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            // Leased entries can be re-leased under the read lock; the
            // refcount alone carries the new lease.
            {
                let state = self.shared.state.read().await;
                if let Some(entry) = state.in_use.get(key) {
                    entry.refs.fetch_add(1, Ordering::SeqCst);
                    self.shared.stats.trace_cache_hits();
                    return Ok(self.lease(Arc::clone(entry)));
                }
            }

            let mut state = self.shared.state.write().await;
            if let Some(entry) = state.in_use.get(key) {
                entry.refs.fetch_add(1, Ordering::SeqCst);
                self.shared.stats.trace_cache_hits();
                return Ok(self.lease(Arc::clone(entry)));
            }
            if let Some(entry) = state.lru.remove(key) {
                // idle -> leased: the cache keeps its reference, the caller
                // adds one
                entry.refs.fetch_add(1, Ordering::SeqCst);
                state.in_use.insert(key.to_owned(), Arc::clone(&entry));
                self.shared.stats.trace_cache_hits();
                return Ok(self.lease(entry));
            }

            // Still absent: write the payload while holding the write lock,
            // so at most one on-disk insert happens per key.
            let path = self.shared.fs.write_atomic(fill, &token).await?;

            if cache_control.no_store() {
                // consumed once by this caller, deleted on release
                let entry = DiskEntry::new(key, path, false);
                return Ok(self.lease(entry));
            }

            let entry = DiskEntry::new(key, path, true);
            entry.refs.fetch_add(1, Ordering::SeqCst);
            state.in_use.insert(key.to_owned(), Arc::clone(&entry));
            Ok(self.lease(entry))
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.shared.state.write().await;
            let entry = match state.in_use.remove(key) {
                Some(entry) => Some(entry),
                None => state.lru.remove(key),
            };
            if let Some(entry) = entry {
                finish_erase(&self.shared.fs, &entry);
            }
        })
    }

    fn contains<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let state = self.shared.state.read().await;
            state.in_use.contains_key(key) || state.lru.contains_key(key)
        })
    }
}

/// A lease on one disk entry.
pub struct DiskEntryHandle {
    entry: Arc<DiskEntry>,
    shared: Arc<DiskShared>,
}

impl DiskEntryHandle {
    pub fn key(&self) -> &str {
        &self.entry.key
    }

    /// The entry's backing file, while the lease is held.
    pub fn path(&self) -> Option<PathBuf> {
        self.entry.path.lock().clone()
    }

    pub(super) async fn open(&self) -> CacheResult<tokio::fs::File> {
        let path = self
            .entry
            .path
            .lock()
            .clone()
            .ok_or(CacheError::InternalError)?;
        self.shared.fs.open_read(&path).await
    }

    /// Releases the lease, moving the entry back to the idle table or
    /// deleting the backing file if the entry is no longer cached.
    pub async fn release(self) {
        let DiskEntryHandle { entry, shared } = self;

        if entry.in_cache.load(Ordering::SeqCst) {
            let mut state = shared.state.write().await;
            // an erase may have raced us to the lock
            if entry.in_cache.load(Ordering::SeqCst) {
                let remaining = entry.refs.fetch_sub(1, Ordering::SeqCst) - 1;
                if remaining == 1 {
                    // last lease gone; back to the idle table, which may
                    // evict in turn
                    state.in_use.remove(&entry.key);
                    state.lru.add(entry.key.clone(), Arc::clone(&entry), 1);
                } else if remaining == 0 {
                    state.in_use.remove(&entry.key);
                    entry.delete_file(&shared.fs);
                }
                return;
            }
        }

        // Not cached (no-store entries, or erased while we awaited the
        // lock). The refcount only decreases in this phase, so no lock is
        // needed.
        if entry.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            entry.delete_file(&shared.fs);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future;
    use tokio::io::AsyncWriteExt;

    use crate::stats::null_stats;

    use super::*;

    fn payload_filler(payload: Vec<u8>) -> Filler {
        Box::new(move |sink| {
            Box::pin(async move {
                sink.write_all(&payload).await?;
                Ok(())
            })
        })
    }

    async fn fill(cache: &DiskCache, key: &str, payload: &[u8]) -> EntryHandle {
        cache
            .get_or_add(
                key,
                payload_filler(payload.to_vec()),
                CacheControl::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    async fn read_and_release(entry: EntryHandle) -> Vec<u8> {
        let mut out = Vec::new();
        let token = CancellationToken::new();
        entry.copy_to(&mut out, &token, None).await.unwrap();
        entry.dispose().await;
        out
    }

    fn disk_path(entry: &EntryHandle) -> PathBuf {
        match entry {
            EntryHandle::Disk(handle) => handle.path().unwrap(),
            EntryHandle::Memory(_) => panic!("expected a disk entry"),
        }
    }

    fn cache(dir: &Path, max_entries: usize) -> DiskCache {
        DiskCache::new(dir, max_entries, null_stats()).unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_and_table_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 8);

        let entry = fill(&cache, "key", b"payload").await;
        assert_eq!(cache.in_use_len().await, 1);
        assert_eq!(cache.idle_len().await, 0);

        assert_eq!(read_and_release(entry).await, b"payload");
        assert_eq!(cache.in_use_len().await, 0);
        assert_eq!(cache.idle_len().await, 1);

        // hit: back to the in-use table
        let entry = fill(&cache, "key", b"ignored").await;
        assert_eq!(cache.in_use_len().await, 1);
        assert_eq!(cache.idle_len().await, 0);
        assert_eq!(read_and_release(entry).await, b"payload");
    }

    #[tokio::test]
    async fn test_concurrent_cold_misses_fill_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(dir.path(), 8));
        let fills = Arc::new(AtomicUsize::new(0));

        let callers = (0..8).map(|_| {
            let cache = Arc::clone(&cache);
            let fills = Arc::clone(&fills);
            async move {
                let fills = Arc::clone(&fills);
                let fill: Filler = Box::new(move |sink| {
                    Box::pin(async move {
                        fills.fetch_add(1, Ordering::SeqCst);
                        sink.write_all(b"once").await?;
                        Ok(())
                    })
                });
                let entry = cache
                    .get_or_add("key", fill, CacheControl::new(), CancellationToken::new())
                    .await
                    .unwrap();
                read_and_release(entry).await
            }
        });

        for payload in future::join_all(callers).await {
            assert_eq!(payload, b"once");
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eviction_deletes_idle_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1);

        let first = fill(&cache, "first", b"1").await;
        let first_path = disk_path(&first);
        first.dispose().await;

        let second = fill(&cache, "second", b"2").await;
        second.dispose().await;

        assert_eq!(cache.idle_len().await, 1);
        assert!(!cache.contains("first").await);
        assert!(!first_path.exists());
        assert!(cache.contains("second").await);
    }

    #[tokio::test]
    async fn test_leased_entries_survive_eviction_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1);

        let held = fill(&cache, "held", b"held").await;
        let held_path = disk_path(&held);

        for i in 0..3 {
            let key = format!("filler-{i}");
            let entry = fill(&cache, &key, b"x").await;
            entry.dispose().await;
        }

        // the idle cap never touched the leased entry
        assert!(held_path.exists());
        assert_eq!(cache.in_use_len().await, 1);
        assert!(cache.idle_len().await <= 1);

        assert_eq!(read_and_release(held).await, b"held");
        assert!(cache.contains("held").await);
    }

    #[tokio::test]
    async fn test_remove_while_leased_defers_file_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 8);

        let entry = fill(&cache, "key", b"payload").await;
        let path = disk_path(&entry);

        cache.remove("key").await;
        assert!(!cache.contains("key").await);
        assert!(path.exists());

        // the lease still reads the retired entry
        assert_eq!(read_and_release(entry).await, b"payload");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_remove_idle_deletes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 8);

        let entry = fill(&cache, "key", b"payload").await;
        let path = disk_path(&entry);
        entry.dispose().await;
        assert!(path.exists());

        cache.remove("key").await;
        assert!(!cache.contains("key").await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_no_store_entry_not_tracked_and_deleted_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 8);

        let control = CacheControl::new();
        let flight_control = control.clone();
        let fill: Filler = Box::new(move |sink| {
            Box::pin(async move {
                flight_control.set_no_store(true);
                sink.write_all(b"secret").await?;
                Ok(())
            })
        });
        let entry = cache
            .get_or_add("key", fill, control.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(control.no_store());
        assert!(!cache.contains("key").await);
        let path = disk_path(&entry);

        assert_eq!(read_and_release(entry).await, b"secret");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_shared_leases_release_in_any_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 8);

        let a = fill(&cache, "key", b"payload").await;
        let b = fill(&cache, "key", b"payload").await;
        let path = disk_path(&a);

        cache.remove("key").await;
        a.dispose().await;
        assert!(path.exists());
        b.dispose().await;
        assert!(!path.exists());
    }
}
