//! User-facing configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a peer pool and the caches built around it.
///
/// Every field has a default, so a config file only names what it changes.
/// Durations parse in humantime notation (`2m`, `500ms`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for disk-backed caches. `None` keeps groups memory-only.
    pub cache_dir: Option<PathBuf>,

    /// Concurrent inbound peer requests admitted before the server sheds
    /// load with "server busy".
    pub max_concurrent_requests: usize,

    /// Outbound per-request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Outbound connection timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Replica attempts a group makes before degrading to a direct origin
    /// read.
    pub max_retry: usize,

    /// Sequential failures after which an outbound client trips open.
    pub breaker_max_failures: u32,

    /// How long a tripped client fails fast before letting one probe
    /// through.
    #[serde(with = "humantime_serde")]
    pub breaker_backoff: Duration,

    /// Delay between replica retry attempts.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Resident entry cap for a disk cache's idle table.
    pub max_disk_entries: usize,

    /// Byte capacity of an in-memory cache.
    pub max_memory_bytes: u64,

    /// Entry cap for an in-memory cache; 0 disables count-based eviction.
    pub max_memory_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_concurrent_requests: 24,
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_millis(500),
            max_retry: 3,
            breaker_max_failures: 2,
            breaker_backoff: Duration::from_secs(10),
            retry_backoff: Duration::ZERO,
            max_disk_entries: 1024,
            max_memory_bytes: 64 * 1024 * 1024,
            max_memory_entries: 0,
        }
    }
}
