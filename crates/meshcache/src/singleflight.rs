//! Per-key coalescing of in-flight fills.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::caching::{CacheError, CacheResult};
use crate::utils::defer;

type Flight<T> = Shared<BoxFuture<'static, CacheResult<T>>>;

/// Coalesces concurrent fills for the same key into one execution.
///
/// The first caller for a key installs a flight and leads it; followers
/// arriving while the flight is live await the same result. The slot is
/// removed as soon as the factory settles, before the result becomes
/// visible to followers, so the very next arrival starts a fresh flight.
pub struct SingleFlight<T> {
    flights: Arc<DashMap<String, Flight<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Number of flights currently in progress.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// Runs `factory` for `key`, or joins the flight already running it.
    ///
    /// Returns the result and whether this caller led the flight. Errors are
    /// propagated identically to every waiter. The factory is spawned on the
    /// runtime so it runs to completion even if all waiters are dropped, and
    /// the slot is reclaimed even if the factory panics.
    pub async fn run<F>(&self, key: &str, factory: F) -> (CacheResult<T>, bool)
    where
        F: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let (flight, leader) = match self.flights.entry(key.to_owned()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let flights = Arc::clone(&self.flights);
                let slot = key.to_owned();
                let task = tokio::spawn(async move {
                    // The guard drops when the factory settles, which is
                    // strictly before the join handle resolves below.
                    let _slot = defer(move || {
                        flights.remove(&slot);
                    });
                    factory.await
                });
                let flight: Flight<T> = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(_) => Err(CacheError::InternalError),
                    }
                }
                .boxed()
                .shared();
                entry.insert(flight.clone());
                (flight, true)
            }
        };
        (flight.await, leader)
    }
}
