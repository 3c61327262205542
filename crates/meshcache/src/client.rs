//! Outbound wire protocol.
//!
//! One request type: a form-encoded `POST /Get` with the `groupName` and
//! `key` fields, answered with the raw payload bytes as
//! `application/octet-stream`. The client maps response statuses back onto
//! the error taxonomy and propagates a `Cache-Control: no-store` response
//! header into the caller's cache control before streaming the body.

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheControl, CacheError, CacheResult, Sink};
use crate::endpoint::PeerEndpoint;

/// An outbound (or in-process) connection to one peer.
pub trait PeerClient: Send + Sync + 'static {
    /// Whether this client dispatches in-process instead of over the wire.
    fn is_local(&self) -> bool;

    fn endpoint(&self) -> &PeerEndpoint;

    /// Fetches `key` from `group` on this peer, streaming the payload into
    /// `sink`.
    fn get<'a>(
        &'a self,
        group: &'a str,
        key: &'a str,
        sink: Sink<'a>,
        cache_control: &'a CacheControl,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, CacheResult<()>>;
}

/// HTTP client for one remote peer.
#[derive(Debug)]
pub struct HttpPeerClient {
    endpoint: PeerEndpoint,
    url: String,
    http: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(endpoint: PeerEndpoint, http: reqwest::Client) -> Self {
        let url = format!("http://{endpoint}/Get");
        Self {
            endpoint,
            url,
            http,
        }
    }
}

impl PeerClient for HttpPeerClient {
    fn is_local(&self) -> bool {
        false
    }

    fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
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
            tracing::debug!(peer = %self.endpoint, group, key, "Fetching from peer");

            let request = self
                .http
                .post(&self.url)
                .form(&[("groupName", group), ("key", key)])
                .send();
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(CacheError::Cancelled),
                response = request => response.map_err(connect_failure)?,
            };

            let status = response.status();
            if !status.is_success() {
                let reason = response.text().await.unwrap_or_default();
                return Err(match status {
                    StatusCode::NOT_FOUND => CacheError::GroupNotFound(group.to_owned()),
                    StatusCode::SERVICE_UNAVAILABLE => CacheError::ServerBusy,
                    _ => CacheError::InternalServerError(if reason.is_empty() {
                        status.to_string()
                    } else {
                        reason
                    }),
                });
            }

            if no_store_response(response.headers()) {
                cache_control.set_no_store(true);
            }

            let stream = response.bytes_stream();
            futures::pin_mut!(stream);
            loop {
                let chunk = tokio::select! {
                    biased;
                    // dropping the stream cancels the response
                    _ = token.cancelled() => return Err(CacheError::Cancelled),
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => sink.write_all(&bytes).await?,
                    Some(Err(err)) => return Err(connect_failure(err)),
                    None => break,
                }
            }
            sink.flush().await?;
            Ok(())
        })
    }
}

/// Maps a transport error onto the taxonomy, surfacing the deepest cause
/// (for instance the raw "connection refused" message).
fn connect_failure(error: reqwest::Error) -> CacheError {
    let mut source: &dyn std::error::Error = &error;
    while let Some(next) = source.source() {
        source = next;
    }
    CacheError::ConnectFailure(source.to_string())
}

fn no_store_response(headers: &HeaderMap) -> bool {
    headers
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("no-store"))
}
