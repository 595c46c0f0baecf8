// Chain Cache - freshness-bounded cache for upstream chain data
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Cache server: wires the store, publisher and poller to HTTP and WebSocket

use crate::{
    error::ApiError,
    health::HealthService,
    poller::{Poller, PollerConfig, DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT},
    publisher::{Publisher, DEFAULT_SUBSCRIBER_BUFFER},
    store::ValueStore,
    types::CacheKey,
    upstream::{AlloyUpstream, Upstream},
};
use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::{Result, WrapErr};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{fmt::Display, future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

/// Builder for configuring a [`CacheServer`] with sensible defaults
#[derive(Debug, Clone)]
pub struct CacheServerBuilder {
    upstream_url: Option<String>,
    poll_interval: Duration,
    request_timeout: Duration,
    subscriber_buffer: usize,
    track_blocks: bool,
    track_gas_price: bool,
}

impl Default for CacheServerBuilder {
    fn default() -> Self {
        Self {
            upstream_url: None,

            // Poller Configuration
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            track_blocks: true,
            track_gas_price: true,

            // Subscriber Configuration
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl CacheServerBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the upstream RPC URL (required by [`CacheServerBuilder::build`])
    pub fn upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = Some(url.into());
        self
    }

    /// Set the delay between poll cycles
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the bound on each upstream call
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-subscriber queue length
    pub fn subscriber_buffer(mut self, events: usize) -> Self {
        self.subscriber_buffer = events;
        self
    }

    /// Enable or disable caching of block contents
    pub fn track_blocks(mut self, enabled: bool) -> Self {
        self.track_blocks = enabled;
        self
    }

    /// Enable or disable gas price tracking
    pub fn track_gas_price(mut self, enabled: bool) -> Self {
        self.track_gas_price = enabled;
        self
    }

    fn poller_config(&self) -> Result<PollerConfig> {
        if self.poll_interval.is_zero() {
            eyre::bail!("Poll interval must be greater than zero");
        }
        if self.request_timeout.is_zero() {
            eyre::bail!("Request timeout must be greater than zero");
        }
        Ok(PollerConfig {
            poll_interval: self.poll_interval,
            request_timeout: self.request_timeout,
            track_blocks: self.track_blocks,
            track_gas_price: self.track_gas_price,
        })
    }

    /// Build the server against the configured upstream URL
    pub async fn build(self) -> Result<CacheServer> {
        let url = self.upstream_url.as_deref().ok_or_else(|| eyre::eyre!("Upstream URL is required"))?;
        let upstream = AlloyUpstream::connect(url).await?;
        self.build_with_upstream(Arc::new(upstream))
    }

    /// Build the server against an already constructed upstream
    pub fn build_with_upstream(self, upstream: Arc<dyn Upstream>) -> Result<CacheServer> {
        Ok(CacheServer::new(upstream, self.poller_config()?, self.subscriber_buffer))
    }
}

/// Cache server combining polling, querying and subscriptions
///
/// ```no_run
/// # use chain_cache::server::CacheServerBuilder;
/// # use std::time::Duration;
/// # async fn example() -> eyre::Result<()> {
/// let server = CacheServerBuilder::new()
///     .upstream_url("http://127.0.0.1:8545")
///     .poll_interval(Duration::from_millis(500))
///     .build()
///     .await?;
/// server.serve(([127, 0, 0, 1], 4000).into()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CacheServer {
    publisher: Arc<Publisher>,
    health: Arc<HealthService>,
    upstream: Arc<dyn Upstream>,
    poller_config: PollerConfig,
}

#[derive(Clone)]
struct AppState {
    publisher: Arc<Publisher>,
    health: Arc<HealthService>,
    send_timeout: Duration,
}

impl CacheServer {
    /// Creates a server with an empty store
    ///
    /// Nothing is polled until the server starts serving.
    pub fn new(upstream: Arc<dyn Upstream>, poller_config: PollerConfig, subscriber_buffer: usize) -> Self {
        let store = Arc::new(ValueStore::new());
        let publisher = Arc::new(Publisher::new(store, subscriber_buffer));
        Self { publisher, health: Arc::new(HealthService::new()), upstream, poller_config }
    }

    /// The store backing this server
    pub fn store(&self) -> &Arc<ValueStore> {
        self.publisher.store()
    }

    /// The publisher fanning out updates
    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// A poller writing into this server's store
    pub fn poller(&self) -> Poller {
        Poller::new(
            self.upstream.clone(),
            self.store().clone(),
            self.publisher.clone(),
            self.poller_config.clone(),
        )
    }

    /// HTTP routes:
    /// - `GET /` and `GET /?key=<key>` - cached values
    /// - `GET /ws` - WebSocket subscription
    /// - `GET /health` - service status
    pub fn router(&self) -> Router {
        let state = AppState {
            publisher: self.publisher.clone(),
            health: self.health.clone(),
            send_timeout: self.poller_config.request_timeout,
        };

        Router::new()
            .route("/", get(handle_query).options(handle_preflight).fallback(handle_method_not_allowed))
            .route("/ws", get(handle_ws).options(handle_preflight).fallback(handle_method_not_allowed))
            .route(
                "/health",
                get(handle_health).options(handle_preflight).fallback(handle_method_not_allowed),
            )
            .fallback(handle_not_found)
            .layer(SetResponseHeaderLayer::overriding(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, OPTIONS"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("*"),
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Binds `addr` and serves until Ctrl-C
    ///
    /// A bind failure is returned as an error; the caller treats it as fatal.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener =
            TcpListener::bind(addr).await.wrap_err_with(|| format!("Failed to bind {addr}"))?;

        self.serve_on(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await
    }

    /// Serves on an already bound listener until `shutdown` resolves
    ///
    /// The poller starts once the listener is known to be good and stops when
    /// serving ends.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let app = self.router();
        let _poller = AbortOnDrop(self.poller().spawn());

        info!("Chain cache listening on {}", addr);
        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        info!("Chain cache on {} stopped", addr);
        Ok(())
    }
}

/// Stops the poller when the server future ends or is dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    key: Option<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    query: Result<Query<QueryParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = query.map_err(|e| {
        debug!("Malformed query: {}", e);
        ApiError::KeyNotFound
    })?;
    let store = state.publisher.store();

    let mut body = Map::new();
    match params.key {
        Some(name) => {
            let key: CacheKey = name.parse().map_err(|_| ApiError::KeyNotFound)?;
            let entry = store.get(key).await.ok_or(ApiError::KeyNotFound)?;
            body.insert(name, serde_json::to_value(&entry.value)?);
        }
        None => {
            let entries = store.get_all().await;
            for key in CacheKey::ALL {
                if let Some(entry) = entries.get(&key) {
                    body.insert(key.as_str().to_string(), serde_json::to_value(&entry.value)?);
                }
            }
        }
    }

    Ok(Json(Value::Object(body)))
}

async fn handle_preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn handle_method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn handle_not_found(method: Method) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    ApiError::NotFound.into_response()
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    Json(state.health.report(&state.publisher).await)
}

async fn handle_ws(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return ApiError::BadRequest(rejection.body_text()).into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state.publisher, state.send_timeout))
}

async fn handle_socket(socket: WebSocket, publisher: Arc<Publisher>, send_timeout: Duration) {
    let (sender, receiver) = socket.split();
    stream_events(sender, receiver, publisher, send_timeout).await;
}

/// Streams snapshot and live events to one WebSocket client
///
/// Client messages are read only to notice a close. The subscriber is removed
/// when either side goes away, or when a single send does not complete within
/// `send_timeout`.
async fn stream_events<S, R>(mut sender: S, mut receiver: R, publisher: Arc<Publisher>, send_timeout: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut subscription = publisher.subscribe().await;
    let id = subscription.id();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(payload) = event else {
                    debug!("Subscriber {} dropped by publisher", id);
                    break;
                };
                let message = Message::Text(payload.to_string().into());
                match tokio::time::timeout(send_timeout, sender.send(message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Failed to send to subscriber {}: {}", id, e);
                        break;
                    }
                    Err(_) => {
                        warn!("Subscriber {} stopped reading for {:?}, disconnecting", id, send_timeout);
                        break;
                    }
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("WebSocket error from subscriber {}: {}", id, e);
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    publisher.unsubscribe(id).await;
    let _ = tokio::time::timeout(send_timeout, sender.close()).await;
}
