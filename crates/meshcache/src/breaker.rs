//! Per-peer outbound failure tripping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheControl, CacheError, CacheResult, Sink};
use crate::client::PeerClient;
use crate::endpoint::PeerEndpoint;

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    last_attempt: Option<Instant>,
}

/// Wraps an outbound client, failing fast while the peer looks down.
///
/// The breaker is open while `max_failures` sequential failures have been
/// seen and the last attempt is younger than `backoff`. The failure counter
/// caps at `max_failures`, so once the back-off window elapses exactly one
/// probe is let through per window until the peer recovers. "Server busy"
/// responses never count: the peer is alive, just shedding load.
pub struct CircuitBreaker {
    inner: Arc<dyn PeerClient>,
    max_failures: u32,
    backoff: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(inner: Arc<dyn PeerClient>, max_failures: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_failures,
            backoff,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn check_and_mark_attempt(&self) -> CacheResult<()> {
        let mut state = self.state.lock();
        if state.failures >= self.max_failures {
            if let Some(last_attempt) = state.last_attempt {
                if last_attempt.elapsed() < self.backoff {
                    return Err(CacheError::BreakerOpen);
                }
            }
        }
        state.last_attempt = Some(Instant::now());
        Ok(())
    }

    fn record(&self, result: &CacheResult<()>) {
        match result {
            Ok(()) => self.state.lock().failures = 0,
            Err(CacheError::ServerBusy) => {}
            Err(_) => {
                let mut state = self.state.lock();
                state.failures = (state.failures + 1).min(self.max_failures);
            }
        }
    }
}

impl PeerClient for CircuitBreaker {
    fn is_local(&self) -> bool {
        self.inner.is_local()
    }

    fn endpoint(&self) -> &PeerEndpoint {
        self.inner.endpoint()
    }

    fn get<'a>(
        &'a self,
        group: &'a str,
        key: &'a str,
        sink: Sink<'a>,
        cache_control: &'a CacheControl,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            self.check_and_mark_attempt()?;
            let result = self
                .inner
                .get(group, key, sink, cache_control, token)
                .await;
            self.record(&result);
            result
        })
    }
}
