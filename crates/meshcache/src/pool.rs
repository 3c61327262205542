//! The peer pool: local server, admission limiter, and client cache.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Form, Router};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::caching::{CacheControl, CacheError, CacheResult, Sink};
use crate::client::{HttpPeerClient, PeerClient};
use crate::config::Config;
use crate::endpoint::{GroupKey, PeerEndpoint};
use crate::hashing::KeyHasher;
use crate::picker::{ClientSource, PeerPicker};
use crate::registry::Registry;

/// One process's wire presence: serves inbound peer requests for the self
/// endpoint and hands out outbound clients for everyone else.
///
/// Inbound requests are admitted through a zero-wait semaphore; when no
/// permit is free the request is rejected as busy rather than queued, which
/// keeps a slow group from stalling the whole peer.
pub struct PeerPool {
    self_endpoint: PeerEndpoint,
    config: Config,
    limiter: Semaphore,
    http: reqwest::Client,
    clients: Mutex<HashMap<PeerEndpoint, Arc<dyn PeerClient>>>,
    pickers: Mutex<HashMap<String, Arc<PeerPicker>>>,
}

impl PeerPool {
    pub fn new(self_endpoint: PeerEndpoint, config: Config) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .unwrap();

        Arc::new(Self {
            limiter: Semaphore::new(config.max_concurrent_requests),
            self_endpoint,
            config,
            http,
            clients: Mutex::new(HashMap::new()),
            pickers: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The wire router: a single `POST /Get`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/Get", post(handle_get))
            .with_state(Arc::clone(self))
    }

    /// Serves the wire endpoint on `listener` until it closes.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        tracing::info!(endpoint = %self.self_endpoint, "Starting peer server");
        axum::serve(listener, self.router()).await
    }

    /// The breaker-wrapped outbound client for `endpoint`, built lazily and
    /// cached.
    pub fn get_client(&self, endpoint: &PeerEndpoint) -> Arc<dyn PeerClient> {
        let mut clients = self.clients.lock();
        Arc::clone(clients.entry(endpoint.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                Arc::new(HttpPeerClient::new(endpoint.clone(), self.http.clone())),
                self.config.breaker_max_failures,
                self.config.breaker_backoff,
            ))
        }))
    }

    /// The picker for `group_name`, memoized per group.
    pub fn get_picker(
        self: &Arc<Self>,
        group_name: &str,
        key_hasher: Option<KeyHasher>,
    ) -> Arc<PeerPicker> {
        let mut pickers = self.pickers.lock();
        Arc::clone(
            pickers
                .entry(group_name.to_owned())
                .or_insert_with(|| {
                    let source: Arc<dyn ClientSource> = self.clone();
                    Arc::new(PeerPicker::new(source, key_hasher))
                }),
        )
    }
}

impl ClientSource for PeerPool {
    fn self_endpoint(&self) -> &PeerEndpoint {
        &self.self_endpoint
    }

    fn local_client(&self) -> Arc<dyn PeerClient> {
        Arc::new(LocalClient {
            endpoint: self.self_endpoint.clone(),
        })
    }

    fn remote_client(&self, endpoint: &PeerEndpoint) -> Arc<dyn PeerClient> {
        self.get_client(endpoint)
    }
}

/// The in-process handler standing in for a network client to ourselves.
struct LocalClient {
    endpoint: PeerEndpoint,
}

impl PeerClient for LocalClient {
    fn is_local(&self) -> bool {
        true
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
            let group_key = GroupKey::new(group, self.endpoint.clone());
            let target = Registry::global()
                .get_group(&group_key)
                .ok_or_else(|| CacheError::GroupNotFound(group.to_owned()))?;
            // local-only semantics: never re-enter the forwarding path
            target.get_locally(key, sink, cache_control, token).await
        })
    }
}

#[derive(Debug, Deserialize)]
struct GetForm {
    #[serde(rename = "groupName")]
    group_name: Option<String>,
    key: Option<String>,
}

async fn handle_get(State(pool): State<Arc<PeerPool>>, Form(form): Form<GetForm>) -> Response {
    let Ok(_permit) = pool.limiter.try_acquire() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, &CacheError::ServerBusy);
    };

    let (Some(group_name), Some(key)) = (form.group_name, form.key) else {
        return text_response(StatusCode::BAD_REQUEST, "missing groupName or key".to_owned());
    };

    let group_key = GroupKey::new(&group_name, pool.self_endpoint.clone());
    let Some(group) = Registry::global().get_group(&group_key) else {
        return error_response(
            StatusCode::NOT_FOUND,
            &CacheError::GroupNotFound(group_name),
        );
    };

    group.stats().trace_server_requests();
    let in_flight = pool.config.max_concurrent_requests - pool.limiter.available_permits();
    group.stats().trace_concurrent_server_requests(in_flight);

    let cache_control = CacheControl::new();
    let token = CancellationToken::new();
    let mut payload = Vec::new();
    match group
        .get_locally(&key, &mut payload, &cache_control, &token)
        .await
    {
        Ok(()) => payload_response(payload, cache_control.no_store()),
        Err(err) => error_response(status_for(&err), &err),
    }
}

fn status_for(error: &CacheError) -> StatusCode {
    match error {
        CacheError::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
        CacheError::GroupNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn payload_response(payload: Vec<u8>, no_store: bool) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONNECTION, "close");
    if no_store {
        builder = builder.header(header::CACHE_CONTROL, "no-store");
    }
    builder.body(Body::from(payload)).unwrap()
}

fn error_response(status: StatusCode, error: &CacheError) -> Response {
    text_response(status, error.to_string())
}

fn text_response(status: StatusCode, reason: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONNECTION, "close")
        .body(Body::from(reason))
        .unwrap()
}
