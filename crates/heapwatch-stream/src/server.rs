//! HTTP push server
//!
//! Exposes the long-lived subscription endpoint plus transport counters:
//!
//! - `GET /stream?channels=a,b&filters=<json>`: server-sent events
//! - `GET /stats`: transport counters
//! - `GET /channels`: per-channel subscriber counts and last broadcast
//!
//! CORS preflight is handled by the tower-http layer when enabled.

use crate::hub::{StreamEvent, StreamFilter, StreamHub};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use heapwatch_common::config::StreamingConfig;
use heapwatch_common::{AgentEvent, Error, Result, SafeTimer};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

/// Pluggable bearer-token check for the subscription endpoint.
#[async_trait::async_trait]
pub trait StreamAuthenticator: Send + Sync {
    async fn authenticate(&self, token: Option<&str>) -> bool;
}

struct ServerState {
    hub: StreamHub,
    config: StreamingConfig,
    auth: Option<Arc<dyn StreamAuthenticator>>,
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    channels: Option<String>,
    filters: Option<String>,
}

/// The running stream server.
pub struct StreamServer {
    hub: StreamHub,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    heartbeat: SafeTimer,
    events: broadcast::Sender<AgentEvent>,
}

impl StreamServer {
    /// Bind and start serving. `port` 0 selects an ephemeral port.
    pub async fn start(
        config: StreamingConfig,
        hub: StreamHub,
        auth: Option<Arc<dyn StreamAuthenticator>>,
        events: broadcast::Sender<AgentEvent>,
    ) -> Result<Self> {
        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind {}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Network(format!("local_addr: {}", e)))?;

        let state = Arc::new(ServerState {
            hub: hub.clone(),
            config: config.clone(),
            auth,
        });

        let mut app = Router::new()
            .route("/stream", get(stream_handler))
            .route("/stats", get(stats_handler))
            .route("/channels", get(channels_handler))
            .with_state(state);
        if config.cors {
            app = app.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "stream server exited with error");
            }
        });

        let heartbeat_hub = hub.clone();
        let heartbeat = SafeTimer::spawn(
            "stream-heartbeat",
            Duration::from_millis(config.heartbeat_interval_ms.max(100)),
            move || {
                let hub = heartbeat_hub.clone();
                async move {
                    hub.heartbeat();
                    Ok(())
                }
            },
        );

        info!(addr = %local_addr, "stream server started");
        let _ = events.send(AgentEvent::StreamingStarted {
            addr: local_addr.to_string(),
        });

        Ok(Self {
            hub,
            local_addr,
            shutdown,
            heartbeat,
            events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    /// Stop accepting and drain; existing subscribers are dropped by the
    /// connection teardown.
    pub fn stop(&self) {
        self.heartbeat.stop();
        let _ = self.shutdown.send(true);
        info!(addr = %self.local_addr, "stream server stopped");
        let _ = self.events.send(AgentEvent::StreamingStopped);
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Unsubscribes when the SSE connection goes away.
struct SubscriptionGuard {
    hub: StreamHub,
    id: Uuid,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

fn frame(event: &StreamEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

async fn stream_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Response {
    if state.config.authentication {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let authorized = match &state.auth {
            Some(auth) => auth.authenticate(token).await,
            // Authentication demanded but no predicate installed:
            // fail closed.
            None => false,
        };
        if !authorized {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    if state.hub.subscriber_count() >= state.config.max_connections {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let channels: Vec<String> = params
        .channels
        .as_deref()
        .map(|c| {
            c.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .filter(|c: &Vec<String>| !c.is_empty())
        .unwrap_or_else(|| vec!["default".to_string()]);
    let filter: StreamFilter = params
        .filters
        .as_deref()
        .and_then(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| warn!(error = %e, "ignoring malformed stream filter"))
                .ok()
        })
        .unwrap_or_default();

    let (id, rx, replay) = state.hub.subscribe(channels.clone(), filter);
    let guard = SubscriptionGuard {
        hub: state.hub.clone(),
        id,
    };

    let connected = StreamEvent {
        id: Uuid::new_v4(),
        event_type: "connected".into(),
        timestamp: chrono::Utc::now(),
        channel: "system".into(),
        payload: serde_json::json!({
            "type": "connected",
            "subscriberId": id,
            "channels": channels,
        }),
    };

    let initial = stream::iter(
        std::iter::once(connected)
            .chain(replay)
            .map(|e| Ok::<Event, Infallible>(frame(&e)))
            .collect::<Vec<_>>(),
    );
    let live = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv().await.map(|event| {
            (
                Ok::<Event, Infallible>(frame(&event)),
                (rx, guard),
            )
        })
    });
    let body: std::pin::Pin<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>> =
        Box::pin(initial.chain(live));

    let mut response = Sse::new(body)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response();
    // Push responses must not be buffered by intermediaries.
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        "x-accel-buffering",
        header::HeaderValue::from_static("no"),
    );
    response
}

async fn stats_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.hub.stats())
}

async fn channels_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.hub.channels())
}
