use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tether_core::OperationRegistry;
use tether_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::connection::{serve_connection, ConnectionContext};
use crate::dispatcher::Dispatcher;
use crate::registry::{self, ConnectionRegistry};
use crate::runner::RunnerOptions;
use crate::transport::AxumTransport;

/// Reaper cadence relative to the idle timeout.
const REAPER_DIVISOR: u32 = 3;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub connection: ConnectionContext,
    /// Open WebSocket connections, so shutdown can wait for them.
    pub connections: TaskTracker,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and start serving. Returns a handle to inspect and stop the server.
pub async fn start(
    config: &ServerConfig,
    operations: Arc<dyn OperationRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let registry = Arc::new(ConnectionRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(
        operations,
        RunnerOptions {
            include_stat: config.include_stat,
            metrics: metrics.clone(),
        },
    ));

    let state = AppState {
        connection: ConnectionContext {
            dispatcher,
            registry: Arc::clone(&registry),
            settings: config.connection_settings(),
            metrics,
            shutdown: shutdown.clone(),
        },
        connections: TaskTracker::new(),
    };
    let connections = state.connections.clone();

    let reaper = config.idle_timeout().map(|timeout| {
        let every = (timeout / REAPER_DIVISOR).max(Duration::from_secs(1));
        registry::start_idle_reaper(Arc::clone(&registry), every, timeout)
    });

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "Tether server started");

    let graceful = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        registry,
        shutdown,
        connections,
        drain_timeout: config.drain_timeout(),
        server,
        reaper,
    })
}

/// Handle returned by [`start`]; keeps background tasks alive.
pub struct ServerHandle {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    connections: TaskTracker,
    drain_timeout: Duration,
    server: tokio::task::JoinHandle<()>,
    reaper: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The open-connections registry, for pushing `notify` envelopes.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Stop accepting, close every connection through its normal teardown,
    /// and wait for them to finish.
    pub async fn shutdown(self) {
        tracing::info!(connections = self.registry.count(), "Shutting down");
        self.shutdown.cancel();
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }

        self.connections.close();
        // Each connection drains its own operations within `drain_timeout`.
        let budget = self.drain_timeout + Duration::from_secs(1);
        if tokio::time::timeout(budget, self.connections.wait()).await.is_err() {
            tracing::warn!(remaining = self.registry.count(), "Connections still open after shutdown timeout");
        }
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "Server task did not exit cleanly");
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let token = state.connections.token();
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state).await;
        drop(token);
    })
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let summary = serve_connection(AxumTransport::new(socket), &state.connection).await;
    tracing::debug!(
        session_id = %summary.session_id,
        reason = summary.reason.as_str(),
        drained = summary.drained,
        "WebSocket handler finished"
    );
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "connections": state.connection.registry.count(),
    }))
}

/// JSON snapshot of every recorded metric.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state
        .connection
        .metrics
        .as_ref()
        .map(|m| m.snapshot())
        .unwrap_or_default();
    Json(snapshot)
}
