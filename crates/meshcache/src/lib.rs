//! # meshcache
//!
//! A distributed read-through cache for immutable, unversioned payloads.
//!
//! A fixed set of cooperating processes (peers) serve reads for string keys.
//! For any given key, one peer is the canonical owner; requests arriving at
//! non-owners are forwarded to the owner, so a value is fetched from its
//! authoritative origin at most once across the whole peer set while
//! subsequent hits are served from local memory or disk. Concurrent requests
//! for the same missing key are coalesced to one fill, both inside a process
//! and across processes.
//!
//! ## Layers
//!
//! A read goes through the following layers:
//!
//! - The [`Group`] orchestrator resolves the key's owner through the
//!   [`PeerPicker`] (jump consistent hashing over the sorted peer set).
//! - If the owner is this process, the group consults its local cache: an
//!   in-memory byte LRU ([`MemoryCache`]) or a refcounted file-backed LRU
//!   ([`DiskCache`]). Misses run the embedder-supplied origin [`Loader`]
//!   exactly once per process, deduplicated by the single-flight gate.
//! - If the owner is a different peer, the group calls that peer's server
//!   through a circuit-breaker-wrapped HTTP client. Retryable failures move
//!   on to deterministic fallback replicas; when every peer is unreachable
//!   the group degrades to a direct origin read, trading deduplication for
//!   availability.
//!
//! The [`PeerPool`] hosts the server side of the wire protocol (one
//! `POST /Get` route), applies fair-share admission, and hands out the lazily
//! built outbound clients. Groups are registered in the process-wide
//! [`Registry`] keyed by `(name, self endpoint)`, which is how inbound peer
//! requests are dispatched without ever re-entering the forwarding path.

pub mod breaker;
pub mod caching;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod group;
pub mod hashing;
pub mod lru;
pub mod picker;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod singleflight;
pub mod stats;
mod utils;
pub mod validate;

pub use crate::caching::{
    CacheControl, CacheError, CacheResult, DiskCache, EntryHandle, Filler, Loader, LocalCache,
    MemoryCache, MemoryCacheOptions, Sink,
};
pub use crate::client::PeerClient;
pub use crate::config::Config;
pub use crate::endpoint::{GroupKey, PeerEndpoint};
pub use crate::group::{Group, GroupOptions};
pub use crate::picker::{ClientSource, PeerPicker};
pub use crate::pool::PeerPool;
pub use crate::registry::Registry;
pub use crate::stats::{NullStats, StatsSink};
pub use crate::validate::{PayloadCheck, Validator};
