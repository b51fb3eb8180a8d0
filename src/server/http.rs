//! HTTP routes
//!
//! - `GET|HEAD /v/{channel_id}` (optionally `{channel_id}.ts`): live transport
//!   stream of a channel
//! - `POST /api/channels/{channel_id}/next`: fail over to the next candidate
//! - `POST /api/channels/{channel_id}/streams/{stream_id}`: play a specific
//!   stream
//! - `GET /api/channels`, `GET /api/stats`: statistics

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::channel::{ChannelReader, ChannelService, ClientConnection, ClientGuard};
use crate::error::Error;
use crate::model::ChannelId;
use crate::source::ByteStream;
use crate::stats::{ChannelStats, ServerStats};

use super::config::ServerConfig;

/// MPEG transport stream content type
pub const TS_CONTENT_TYPE: &str = "video/mp2t";

/// Connection counters
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub rejected_connections: AtomicU64,
    pub total_bytes_sent: AtomicU64,
}

/// Shared state of the HTTP handlers
pub struct AppState {
    service: Arc<ChannelService>,
    config: ServerConfig,
    connections: Option<Arc<Semaphore>>,
    counters: Arc<ServerCounters>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, service: Arc<ChannelService>) -> Self {
        let connections = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            service,
            config,
            connections,
            counters: Arc::new(ServerCounters::default()),
            started_at: Instant::now(),
        }
    }

    pub fn service(&self) -> &Arc<ChannelService> {
        &self.service
    }

    pub fn counters(&self) -> &Arc<ServerCounters> {
        &self.counters
    }

    /// Point-in-time server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected_connections.load(Ordering::Relaxed),
            total_bytes_sent: self.counters.total_bytes_sent.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
            channels: self.service.channel_stats(),
            sources: self.service.source_stats(),
        }
    }
}

/// Build the relay router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v/{channel}", get(stream_handler).head(stream_handler))
        .route("/api/channels", get(channels_handler))
        .route("/api/channels/{channel}/next", post(next_stream_handler))
        .route(
            "/api/channels/{channel}/streams/{stream_id}",
            post(switch_stream_handler),
        )
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

/// Error mapped to an HTTP status
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::ChannelNotFound(_) | Error::ClientNotFound(_) | Error::NoViableCandidate { .. } => {
                StatusCode::NOT_FOUND
            }
            Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, self.0.to_string()).into_response()
    }
}

/// Parse `12` or `12.ts`
fn parse_channel(raw: &str) -> Option<ChannelId> {
    raw.strip_suffix(".ts").unwrap_or(raw).parse().ok()
}

/// Releases the viewer slot when the response body is dropped
struct ViewerSlot {
    counters: Arc<ServerCounters>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for ViewerSlot {
    fn drop(&mut self) {
        self.counters
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Response body that keeps the client attached while it is alive
struct GuardedStream {
    _guard: ClientGuard,
    _slot: ViewerSlot,
    inner: ByteStream,
    counters: Arc<ServerCounters>,
}

impl Stream for GuardedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            self.counters
                .total_bytes_sent
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        res
    }
}

fn ts_headers() -> [(header::HeaderName, &'static str); 3] {
    [
        (header::CONTENT_TYPE, TS_CONTENT_TYPE),
        (header::CACHE_CONTROL, "no-cache, no-store"),
        (header::PRAGMA, "no-cache"),
    ]
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    method: Method,
    request: Request,
) -> Response {
    let Some(channel_id) = parse_channel(&channel) else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };

    if method == Method::HEAD {
        if state.service.has_channel(channel_id).await {
            return (StatusCode::OK, ts_headers()).into_response();
        }
        return StatusCode::NOT_FOUND.into_response();
    }

    let permit = match &state.connections {
        Some(sem) => match Arc::clone(sem).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                state
                    .counters
                    .rejected_connections
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel_id = channel_id, "Viewer rejected: limit reached");
                return (StatusCode::SERVICE_UNAVAILABLE, "Too many viewers").into_response();
            }
        },
        None => None,
    };

    state
        .counters
        .total_connections
        .fetch_add(1, Ordering::Relaxed);
    state
        .counters
        .active_connections
        .fetch_add(1, Ordering::Relaxed);
    let slot = ViewerSlot {
        counters: Arc::clone(&state.counters),
        _permit: permit,
    };

    let mut client = ClientConnection::new(channel_id);
    if let Some(ConnectInfo(peer)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        client = client.with_peer(*peer);
    }
    if let Some(agent) = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
    {
        client = client.with_user_agent(agent);
    }
    let client = Arc::new(client);

    let channel = match state
        .service
        .attach_client(Arc::clone(&client), channel_id)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(
                channel_id = channel_id,
                client_id = %client.id(),
                error = %e,
                "Attach failed"
            );
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let guard = ClientGuard::new(Arc::clone(&state.service), Arc::clone(&client));
    let reader = ChannelReader::new(channel, client, state.config.poll_interval);
    let body = GuardedStream {
        _guard: guard,
        _slot: slot,
        inner: read_with_timeout(reader, state.config.client_read_timeout),
        counters: Arc::clone(&state.counters),
    };

    (StatusCode::OK, ts_headers(), Body::from_stream(body)).into_response()
}

/// Reader stream that ends once no data arrives within `timeout`
fn read_with_timeout(reader: ChannelReader, timeout: std::time::Duration) -> ByteStream {
    if timeout.is_zero() {
        return reader.into_stream();
    }

    Box::pin(futures::stream::unfold(reader, move |mut reader| async move {
        match tokio::time::timeout(timeout, reader.next_chunk()).await {
            Ok(chunk) => chunk.map(|chunk| (Ok(chunk), reader)),
            Err(_) => {
                tracing::info!(
                    client_id = %reader.client().id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Viewer timed out waiting for data"
                );
                None
            }
        }
    }))
}

#[derive(Debug, Serialize)]
struct SwitchResponse {
    channel_id: ChannelId,
    switched: bool,
}

async fn next_stream_handler(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> Result<Response, ApiError> {
    let channel_id = parse_channel(&channel).ok_or(Error::ChannelNotFound(-1))?;

    if !state.service.force_next_stream(channel_id) {
        return Err(Error::ChannelNotFound(channel_id).into());
    }

    let body = SwitchResponse {
        channel_id,
        switched: true,
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

async fn switch_stream_handler(
    State(state): State<Arc<AppState>>,
    Path((channel, stream_id)): Path<(String, String)>,
) -> Result<Json<ChannelStats>, ApiError> {
    let channel_id = parse_channel(&channel).ok_or(Error::ChannelNotFound(-1))?;

    if !state.service.switch_to_stream(channel_id, &stream_id).await? {
        return Err(Error::NoViableCandidate { channel_id }.into());
    }

    let channel = state
        .service
        .channel(channel_id)
        .ok_or(Error::ChannelNotFound(channel_id))?;
    Ok(Json(channel.stats()))
}

async fn channels_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelStats>> {
    Json(state.service.channel_stats())
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<ServerStats> {
    Json(state.stats())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use tower::ServiceExt;

    use super::*;
    use crate::config::RelayConfig;
    use crate::context::RelayContext;
    use crate::model::ResolvedStream;
    use crate::source::{Upstream, UpstreamConnector};

    /// Serves one chunk per stream and then stays open
    struct StaticConnector;

    #[async_trait]
    impl UpstreamConnector for StaticConnector {
        async fn connect(&self, stream: &ResolvedStream) -> crate::error::Result<Upstream> {
            let chunk = Bytes::from(format!("ts:{}", stream.id));
            let body = futures::stream::iter(vec![Ok::<_, std::io::Error>(chunk)])
                .chain(futures::stream::pending());
            Ok(Upstream::from_stream(Box::pin(body)))
        }
    }

    const CONFIG: &str = r#"{
        "server": { "max_connections": 1, "poll_interval_ms": 10 },
        "streaming": { "retry_delay_ms": 0 },
        "channels": [
            { "id": 1, "name": "News", "streams": [
                { "id": "a", "name": "A", "url": "http://up/a" },
                { "id": "b", "name": "B", "url": "http://up/b", "rank": 1 }
            ]}
        ]
    }"#;

    fn app() -> (Router, Arc<AppState>) {
        let config = RelayConfig::from_json(CONFIG).unwrap();
        let context = RelayContext::with_connector(config, Arc::new(StaticConnector)).unwrap();
        let state = Arc::new(AppState::new(
            context.config().server_config().unwrap(),
            Arc::clone(context.service()),
        ));
        (router(Arc::clone(&state)), state)
    }

    fn request(method: Method, uri: &str) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_parse_channel() {
        assert_eq!(parse_channel("12"), Some(12));
        assert_eq!(parse_channel("12.ts"), Some(12));
        assert_eq!(parse_channel("abc"), None);
        assert_eq!(parse_channel(".ts"), None);
    }

    #[tokio::test]
    async fn test_stream_channel() {
        let (app, state) = app();

        let response = app.oneshot(request(Method::GET, "/v/1.ts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], TS_CONTENT_TYPE);

        let mut body = response.into_body().into_data_stream();
        let chunk = body.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"ts:a");
        assert_eq!(state.service().client_count(), 1);
        assert_eq!(state.stats().active_connections, 1);

        drop(body);
        wait_for(|| state.service().client_count() == 0).await;
        assert_eq!(state.stats().active_connections, 0);
        assert_eq!(state.stats().total_bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_not_found() {
        let (app, _state) = app();

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/v/99"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(request(Method::GET, "/v/abc")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_viewer_limit() {
        let (app, state) = app();

        let first = app
            .clone()
            .oneshot(request(Method::GET, "/v/1"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .clone()
            .oneshot(request(Method::GET, "/v/1"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.stats().rejected_connections, 1);

        drop(first);
        let third = app.oneshot(request(Method::GET, "/v/1")).await.unwrap();
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_head_does_not_attach() {
        let (app, state) = app();

        let response = app
            .clone()
            .oneshot(request(Method::HEAD, "/v/1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], TS_CONTENT_TYPE);
        assert_eq!(state.service().client_count(), 0);

        let response = app.oneshot(request(Method::HEAD, "/v/5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_switching() {
        let (app, state) = app();

        // Nothing live yet
        let response = app
            .clone()
            .oneshot(request(Method::POST, "/api/channels/1/next"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let viewer = app
            .clone()
            .oneshot(request(Method::GET, "/v/1"))
            .await
            .unwrap();
        assert_eq!(viewer.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/api/channels/1/streams/b"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let channel = state.service().channel(1).unwrap();
        assert_eq!(channel.current_stream().unwrap().id, "b");

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/api/channels/1/streams/zzz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request(Method::POST, "/api/channels/1/next"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        drop(viewer);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (app, _state) = app();

        let response = app.oneshot(request(Method::GET, "/api/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["total_connections"], 0);
        assert!(json["channels"].as_array().unwrap().is_empty());
    }
}
