//! The read-through orchestrator.
//!
//! A group is a named namespace of keys with a single origin loader. `get`
//! resolves the key's replicas through the peer picker and walks them with
//! the retry engine: the local replica reads through the local cache, remote
//! replicas are fetched over the wire through their circuit breakers. When
//! the peer path is out of options the group degrades to a direct origin
//! read, trading deduplication for availability.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::caching::{
    CacheControl, CacheError, CacheResult, Filler, Loader, LocalCache, Sink,
};
use crate::client::PeerClient;
use crate::picker::PeerPicker;
use crate::retry::{RetryContext, RetryPolicy};
use crate::stats::{NullStats, StatsSink};
use crate::validate::Validator;

/// Tunables for one group.
pub struct GroupOptions {
    /// Replica attempts before degrading to a direct origin read.
    pub max_retry: usize,
    pub stats: Arc<dyn StatsSink>,
    pub validator: Option<Arc<dyn Validator>>,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            max_retry: 3,
            stats: Arc::new(NullStats),
            validator: None,
        }
    }
}

/// A named cache namespace. Created through the registry, never destroyed.
pub struct Group {
    name: String,
    loader: Arc<dyn Loader>,
    picker: Arc<PeerPicker>,
    cache: Arc<dyn LocalCache>,
    stats: Arc<dyn StatsSink>,
    max_retry: usize,
    validator: Option<Arc<dyn Validator>>,
}

struct LoadState<'a, 'b> {
    group: &'a Group,
    key: &'a str,
    replicas: &'a [Arc<dyn PeerClient>],
    cache_control: &'a CacheControl,
    token: &'a CancellationToken,
    sink: Sink<'b>,
    tried_local: bool,
}

impl Group {
    pub(crate) fn new(
        name: &str,
        loader: Arc<dyn Loader>,
        picker: Arc<PeerPicker>,
        cache: Arc<dyn LocalCache>,
        options: GroupOptions,
    ) -> Self {
        Self {
            name: name.to_owned(),
            loader,
            picker,
            cache,
            stats: options.stats,
            max_retry: options.max_retry,
            validator: options.validator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<dyn StatsSink> {
        &self.stats
    }

    pub fn cache(&self) -> &Arc<dyn LocalCache> {
        &self.cache
    }

    pub fn picker(&self) -> &Arc<PeerPicker> {
        &self.picker
    }

    /// Fetches `key`, streaming the payload into `sink`.
    ///
    /// This is the forwarding entry point: if a different peer owns the key
    /// the request is sent there, so the whole peer set fills each key from
    /// the origin at most once while every peer can serve it.
    pub async fn get(
        &self,
        key: &str,
        sink: Sink<'_>,
        cache_control: &CacheControl,
        token: &CancellationToken,
    ) -> CacheResult<()> {
        self.stats.trace_gets();
        if token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let start = Instant::now();
        let result = self.load(key, sink, cache_control, token).await;
        self.stats.trace_roundtrip_latency(start.elapsed());
        result
    }

    /// Fetches `key` without consulting other peers.
    ///
    /// This is what the peer server dispatches inbound requests to; going
    /// through `get` instead would bounce requests between peers whose peer
    /// lists disagree. The payload passes through the entry validator, and a
    /// rejected payload is removed from the local cache before the error
    /// surfaces.
    pub async fn get_locally(
        &self,
        key: &str,
        sink: Sink<'_>,
        cache_control: &CacheControl,
        token: &CancellationToken,
    ) -> CacheResult<()> {
        if token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.local_load(key, sink, cache_control, token, true).await
    }

    /// Convenience wrapper collecting the payload into a buffer.
    pub async fn get_bytes(&self, key: &str, token: &CancellationToken) -> CacheResult<Vec<u8>> {
        let mut buf = Vec::new();
        let cache_control = CacheControl::default();
        self.get(key, &mut buf, &cache_control, token).await?;
        Ok(buf)
    }

    async fn load(
        &self,
        key: &str,
        sink: Sink<'_>,
        cache_control: &CacheControl,
        token: &CancellationToken,
    ) -> CacheResult<()> {
        let replicas = self.picker.pick_peers(key, self.picker.count());
        if replicas.is_empty() {
            return self.local_load(key, sink, cache_control, token, false).await;
        }

        let attempts = self.max_retry.min(replicas.len());
        let policy = RetryPolicy {
            max_attempts: attempts,
            backoff: Duration::ZERO,
        };

        let mut state = LoadState {
            group: self,
            key,
            replicas: &replicas,
            cache_control,
            token,
            sink,
            tried_local: false,
        };
        let outcome = policy
            .run_with(CacheError::is_peer_retryable, &mut state, attempt)
            .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(CacheError::Cancelled) => Err(CacheError::Cancelled),
            // the failed attempt already was the local read; running it
            // again would only duplicate the origin call
            Err(err) if state.tried_local => Err(err),
            Err(err) => {
                tracing::warn!(
                    group = %self.name,
                    key,
                    error = %err,
                    "Peer path failed, reading directly from origin",
                );
                self.local_load(key, state.sink, cache_control, token, false)
                    .await
            }
        }
    }

    async fn local_load(
        &self,
        key: &str,
        sink: Sink<'_>,
        cache_control: &CacheControl,
        token: &CancellationToken,
        validate: bool,
    ) -> CacheResult<()> {
        let fill = self.filler(key, cache_control, token);
        let entry = self
            .cache
            .get_or_add(key, fill, cache_control.clone(), token.clone())
            .await?;

        let mut check = if validate {
            self.validator.as_ref().map(|v| v.begin(key))
        } else {
            None
        };
        let copied = entry.copy_to(sink, token, check.as_deref_mut()).await;
        entry.dispose().await;
        copied?;

        if let Some(check) = check {
            if let Err(err) = check.finish() {
                self.cache.remove(key).await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn peer_load(
        &self,
        client: &Arc<dyn PeerClient>,
        key: &str,
        sink: Sink<'_>,
        cache_control: &CacheControl,
        token: &CancellationToken,
    ) -> CacheResult<()> {
        self.stats.trace_peer_loads();

        // Buffer the peer's payload so a failed attempt leaves the caller's
        // sink untouched for the next replica.
        let mut buf = Vec::new();
        let result = client
            .get(&self.name, key, &mut buf, cache_control, token)
            .await;
        if let Err(err) = result {
            if !matches!(err, CacheError::BreakerOpen) {
                tracing::warn!(
                    group = %self.name,
                    key,
                    peer = %client.endpoint(),
                    error = %err,
                    "Peer load failed",
                );
            }
            return Err(err);
        }

        if let Some(validator) = &self.validator {
            let mut check = validator.begin(key);
            check.observe(&buf);
            check.finish()?;
        }

        sink.write_all(&buf).await?;
        sink.flush().await?;
        Ok(())
    }

    fn filler(
        &self,
        key: &str,
        cache_control: &CacheControl,
        token: &CancellationToken,
    ) -> Filler {
        let loader = Arc::clone(&self.loader);
        let stats = Arc::clone(&self.stats);
        let key = key.to_owned();
        let cache_control = cache_control.clone();
        let token = token.clone();
        Box::new(move |sink| {
            Box::pin(async move {
                stats.trace_local_loads();
                loader.load_into(&key, sink, &cache_control, &token).await
            })
        })
    }
}

/// One replica attempt of the peer-load-or-local state machine.
fn attempt<'c>(
    ctx: &'c mut RetryContext,
    state: &'c mut LoadState<'_, '_>,
) -> futures::future::BoxFuture<'c, CacheResult<()>> {
    Box::pin(async move {
        let Some(client) = state.replicas.get(ctx.attempt()) else {
            ctx.set_exhausted();
            return Err(CacheError::ExhaustedRetry("replica list spent".into()));
        };
        if ctx.attempt() > 0 {
            state.group.stats.trace_retry();
        }
        if client.is_local() {
            state.tried_local = true;
            state
                .group
                .local_load(
                    state.key,
                    &mut *state.sink,
                    state.cache_control,
                    state.token,
                    false,
                )
                .await
        } else {
            state
                .group
                .peer_load(
                    client,
                    state.key,
                    &mut *state.sink,
                    state.cache_control,
                    state.token,
                )
                .await
        }
    })
}
