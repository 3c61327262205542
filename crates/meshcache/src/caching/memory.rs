//! Byte-buffer LRU backing store.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::lru::{LruMap, LruOptions};
use crate::singleflight::SingleFlight;
use crate::stats::StatsSink;

use super::{CacheControl, CacheError, CacheResult, EntryHandle, Filler, LocalCache};

/// Bounds for a [`MemoryCache`].
#[derive(Debug, Clone)]
pub struct MemoryCacheOptions {
    /// Entry cap; 0 disables count-based eviction.
    pub max_entries: usize,
    /// Byte capacity; 0 disables charge-based eviction.
    pub capacity: u64,
    /// Entry time-to-live; `None` disables expiry.
    pub ttl: Option<std::time::Duration>,
}

impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self {
            max_entries: 0,
            capacity: 64 * 1024 * 1024,
            ttl: None,
        }
    }
}

/// An in-memory byte LRU with single-flight fills.
///
/// Concurrent misses for one key run the filler once; followers share the
/// leader's buffer. The flight re-checks the map before filling, so the LRU
/// itself never has to arbitrate duplicate inserts.
pub struct MemoryCache {
    inner: Arc<Inner>,
}

struct Inner {
    lru: LruMap<String, Bytes>,
    flights: SingleFlight<FlightOutcome>,
    stats: Arc<dyn StatsSink>,
}

#[derive(Clone)]
struct FlightOutcome {
    bytes: Bytes,
    no_store: bool,
}

impl MemoryCache {
    pub fn new(options: MemoryCacheOptions, stats: Arc<dyn StatsSink>) -> Self {
        let over_capacity_stats = Arc::clone(&stats);
        let lru = LruMap::new(LruOptions {
            max_entries: options.max_entries,
            capacity: options.capacity,
            ttl: options.ttl,
            replace_on_add: true,
        })
        .on_over_capacity(move |_key: &String, _value: &Bytes| {
            over_capacity_stats.trace_item_over_capacity()
        });

        Self {
            inner: Arc::new(Inner {
                lru,
                flights: SingleFlight::new(),
                stats,
            }),
        }
    }

    pub fn with_defaults(stats: Arc<dyn StatsSink>) -> Self {
        Self::new(MemoryCacheOptions::default(), stats)
    }

    pub fn len(&self) -> usize {
        self.inner.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lru.is_empty()
    }
}

impl LocalCache for MemoryCache {
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
            if let Some(bytes) = self.inner.lru.try_get(key) {
                self.inner.stats.trace_cache_hits();
                return Ok(EntryHandle::Memory(bytes));
            }

            let inner = Arc::clone(&self.inner);
            let flight_key = key.to_owned();
            let flight_control = cache_control.clone();
            let factory = async move {
                // A racing fill may have landed between the outer lookup and
                // this flight's installation.
                if let Some(bytes) = inner.lru.try_get(&flight_key) {
                    inner.stats.trace_cache_hits();
                    return Ok(FlightOutcome {
                        bytes,
                        no_store: false,
                    });
                }

                let mut buf = Vec::new();
                fill(&mut buf).await?;
                let bytes = Bytes::from(buf);

                let no_store = flight_control.no_store();
                if !no_store {
                    inner
                        .lru
                        .add(flight_key, bytes.clone(), bytes.len() as u64);
                }
                Ok(FlightOutcome { bytes, no_store })
            };

            let (result, leader) = self.inner.flights.run(key, factory).await;
            if !leader {
                self.inner.stats.trace_loads_deduped();
            }
            let outcome = result?;
            if outcome.no_store {
                cache_control.set_no_store(true);
            }
            Ok(EntryHandle::Memory(outcome.bytes))
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.inner.lru.remove(key);
        })
    }

    fn contains<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.inner.lru.contains_key(key) })
    }
}
