//! Probe and metrics routes plus the listener loop shared with the API
//!
//! - `/healthz` answers as long as the process serves HTTP
//! - `/readyz` answers 200 once `main` has wired the deployer, 503 before
//!   that and again while shutting down
//! - `/metrics` renders the `DeployerMetrics` registry

use crate::server::metrics::SharedMetrics;
use crate::server::shutdown::ShutdownSignal;
use axum::{
    extract::State,
    http::{header, StatusCode},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Readiness flag shared between `main` and the `/readyz` handler
#[derive(Debug, Clone, Default)]
pub struct ReadinessState(Arc<AtomicBool>);

impl ReadinessState {
    /// Starts not ready
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self) {
        self.0.store(true, Ordering::Release);
        debug!("Readiness set");
    }

    pub fn set_not_ready(&self) {
        self.0.store(false, Ordering::Release);
        debug!("Readiness cleared");
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct ServerState {
    readiness: ReadinessState,
    metrics: SharedMetrics,
}

impl ServerState {
    pub fn new(readiness: ReadinessState, metrics: SharedMetrics) -> Self {
        ServerState { readiness, metrics }
    }
}

async fn liveness() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<ServerState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn render_metrics(
    State(state): State<ServerState>,
) -> Result<([(header::HeaderName, &'static str); 1], String), (StatusCode, String)> {
    let body = state.metrics.encode().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {}", e),
        )
    })?;
    Ok(([(header::CONTENT_TYPE, PROMETHEUS_TEXT)], body))
}

pub fn health_router(readiness_state: ReadinessState, metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(render_metrics))
        .with_state(ServerState::new(readiness_state, metrics))
}

/// Serve `app` on an already bound listener until `shutdown` fires
///
/// In-flight requests are allowed to finish after the signal.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

/// Bind every interface on `port` and serve `app` until shutdown
pub async fn run_server(
    port: u16,
    app: Router,
    shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!(port = %port, "Listening for deployment API, probe and metrics requests");
    serve(listener, app, shutdown).await
}
