//! Stats sink capability.

use std::sync::Arc;
use std::time::Duration;

/// Receives operational counters from the load pipeline.
///
/// Implementations must be thread-safe. Every method defaults to a no-op so
/// sinks only override what they record.
pub trait StatsSink: Send + Sync + 'static {
    /// A `get` entered a group.
    fn trace_gets(&self) {}
    /// A local cache lookup was served without running the origin.
    fn trace_cache_hits(&self) {}
    /// A load was coalesced onto an already running flight.
    fn trace_loads_deduped(&self) {}
    /// The origin loader ran in this process.
    fn trace_local_loads(&self) {}
    /// A load was sent to a remote peer.
    fn trace_peer_loads(&self) {}
    /// The peer server dispatched an inbound request.
    fn trace_server_requests(&self) {}
    /// End-to-end latency of one `get`.
    fn trace_roundtrip_latency(&self, _elapsed: Duration) {}
    /// A replica attempt was retried.
    fn trace_retry(&self) {}
    /// An item too large for the memory cache was reported and dropped.
    fn trace_item_over_capacity(&self) {}
    /// Inbound requests in flight after admission.
    fn trace_concurrent_server_requests(&self, _in_flight: usize) {}
}

/// The always-available sink that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStats;

impl StatsSink for NullStats {}

pub fn null_stats() -> Arc<dyn StatsSink> {
    Arc::new(NullStats)
}
