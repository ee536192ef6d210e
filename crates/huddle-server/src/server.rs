use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::registry::RoomRegistry;
use crate::router::MessageRouter;
use crate::websocket::session::{self, SessionContext};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<MessageRouter>,
    pub metrics: PrometheusHandle,
    pub config: Arc<ServerConfig>,
    pub start_time: Instant,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: PrometheusHandle) -> Self {
        let config = config.normalized();
        let registry = Arc::new(RoomRegistry::new());
        let router = Arc::new(MessageRouter::new(registry, config.join_policy));
        Self {
            router,
            metrics,
            config: Arc::new(config),
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            router: Arc::clone(&self.router),
            max_send_queue: self.config.max_send_queue,
            heartbeat_interval: Duration::from_secs(self.config.heartbeat_interval_secs),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns a handle to shut it down.
///
/// `metrics` renders `/metrics`; counters are recorded through whichever
/// `metrics` recorder is installed globally.
pub async fn start(config: ServerConfig, metrics: PrometheusHandle) -> Result<ServerHandle, ServerError> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let state = AppState::new(config, metrics);
    let registry = Arc::clone(state.router.registry());
    let shutdown = state.shutdown.clone();
    info!(
        addr = %local_addr,
        join_policy = %state.router.policy(),
        max_send_queue = state.config.max_send_queue,
        "relay server listening"
    );

    let app = build_router(state);
    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        registry,
        shutdown,
        server,
    })
}

/// Handle returned by [`start`]. Dropping it leaves the server running.
pub struct ServerHandle {
    pub addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Stop accepting, close every session, and wait up to `timeout` for
    /// the listener and all sessions to finish.
    pub async fn shutdown(self, timeout: Duration) {
        self.shutdown.cancel();
        let registry = self.registry;
        let server = self.server;
        let drained = tokio::time::timeout(timeout, async move {
            let _ = server.await;
            while registry.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "shutdown timed out");
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let ctx = state.session_context();
    ws.max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| session::run_session(socket, ctx))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.router.registry();
    Json(health::health_check(
        state.start_time,
        registry.connection_count(),
        registry.len(),
        registry.room_count(),
    ))
}

/// GET /metrics (Prometheus text format)
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}
