//! The local caching layers and the types shared across the load pipeline.
//!
//! Two backends implement the [`LocalCache`] seam consumed by the group
//! orchestrator:
//!
//! - [`MemoryCache`], a byte-buffer LRU guarded by the single-flight gate so
//!   concurrent misses for one key run the origin exactly once.
//! - [`DiskCache`], a refcounted file-backed LRU that lets callers hold open
//!   leases against entries already retired from the LRU.
//!
//! Both hand out an [`EntryHandle`] which must be disposed on every exit
//! path once its bytes have been consumed.

mod disk;
mod fs;
mod memory;

pub use self::disk::{DiskCache, DiskEntryHandle};
pub use self::fs::CacheFs;
pub use self::memory::{MemoryCache, MemoryCacheOptions};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::validate::PayloadCheck;

/// An error that happens while loading a payload, locally or from a peer.
///
/// The variants mirror what travels over the wire between peers, plus the
/// purely local conditions (breaker, retry exhaustion, validation,
/// cancellation).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The owner peer does not host the requested group.
    #[error("group not found: {0}")]
    GroupNotFound(String),
    /// The owner rejected the request at its admission limit.
    #[error("server busy")]
    ServerBusy,
    /// The peer failed while serving the request.
    #[error("internal server error: {0}")]
    InternalServerError(String),
    /// The peer could not be reached.
    #[error("connect failure: {0}")]
    ConnectFailure(String),
    /// The local circuit breaker refused the call.
    #[error("circuit breaker open")]
    BreakerOpen,
    /// The retry engine gave up; carries the last cause.
    #[error("retries exhausted: {0}")]
    ExhaustedRetry(String),
    /// The validator rejected the payload.
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    /// The caller cancelled the request.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected local failure.
    ///
    /// This variant never crosses the wire as such; a peer serving a request
    /// that hits one reports an internal server error instead.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Whether the orchestrator may retry this error on another replica.
    pub fn is_peer_retryable(&self) -> bool {
        matches!(
            self,
            Self::InternalServerError(_)
                | Self::ServerBusy
                | Self::GroupNotFound(_)
                | Self::ConnectFailure(_)
        )
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e;
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// Result of a load, either the value or the reason it is unavailable.
pub type CacheResult<T = ()> = Result<T, CacheError>;

/// Per-request cache directives shared between the caller and the pipeline.
///
/// Cloning yields another handle onto the same flags, so a no-store decision
/// made by the origin loader mid-fill is visible to every holder, including
/// the caller that started the request.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    no_store: Arc<AtomicBool>,
}

impl CacheControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the payload must be kept out of the local caches.
    pub fn no_store(&self) -> bool {
        self.no_store.load(Ordering::Relaxed)
    }

    pub fn set_no_store(&self, value: bool) {
        self.no_store.store(value, Ordering::Relaxed);
    }
}

/// The byte sink payloads are streamed into.
pub type Sink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// A deferred fill writing one payload into whatever sink it is given.
///
/// The memory cache points this at an in-memory buffer, the disk cache at a
/// freshly created temp file.
pub type Filler = Box<dyn for<'a> FnOnce(Sink<'a>) -> BoxFuture<'a, CacheResult<()>> + Send>;

/// The origin loader supplied by the embedder.
pub trait Loader: Send + Sync + 'static {
    /// Writes the payload identified by `key` into `sink` without closing
    /// it. Implementations may flip `cache_control` to no-store to keep the
    /// result out of the local caches, and must honor `token`.
    fn load_into<'a>(
        &'a self,
        key: &'a str,
        sink: Sink<'a>,
        cache_control: &'a CacheControl,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, CacheResult<()>>;
}

/// The seam between the group orchestrator and its per-process cache.
pub trait LocalCache: Send + Sync + 'static {
    /// Returns the cached entry for `key`, running `fill` on a miss.
    ///
    /// When `cache_control` ends up as no-store, the filled payload is still
    /// returned to this caller but not retained.
    fn get_or_add<'a>(
        &'a self,
        key: &'a str,
        fill: Filler,
        cache_control: CacheControl,
        token: CancellationToken,
    ) -> BoxFuture<'a, CacheResult<EntryHandle>>;

    /// Discards `key`.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()>;

    /// Whether `key` is currently resident.
    fn contains<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool>;
}

/// A leased view of one cached payload.
///
/// Handles must be disposed on every exit path after the payload has been
/// consumed; for disk entries the lease is what keeps the backing file from
/// being unlinked.
pub enum EntryHandle {
    /// Bytes resident in the memory cache.
    Memory(Bytes),
    /// A refcounted disk entry.
    Disk(DiskEntryHandle),
}

impl EntryHandle {
    /// Streams the payload into `sink`, feeding every chunk to `check`.
    pub async fn copy_to(
        &self,
        sink: Sink<'_>,
        token: &CancellationToken,
        mut check: Option<&mut (dyn PayloadCheck + 'static)>,
    ) -> CacheResult<()> {
        match self {
            EntryHandle::Memory(bytes) => {
                if token.is_cancelled() {
                    return Err(CacheError::Cancelled);
                }
                if let Some(check) = check.as_mut() {
                    check.observe(bytes);
                }
                sink.write_all(bytes).await?;
            }
            EntryHandle::Disk(handle) => {
                let mut file = handle.open().await?;
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    if token.is_cancelled() {
                        return Err(CacheError::Cancelled);
                    }
                    let read = file.read(&mut buf).await?;
                    if read == 0 {
                        break;
                    }
                    if let Some(check) = check.as_mut() {
                        check.observe(&buf[..read]);
                    }
                    sink.write_all(&buf[..read]).await?;
                }
            }
        }
        sink.flush().await?;
        Ok(())
    }

    /// Releases the lease.
    pub async fn dispose(self) {
        match self {
            EntryHandle::Memory(_) => {}
            EntryHandle::Disk(handle) => handle.release().await,
        }
    }
}
