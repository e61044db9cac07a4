//! HTTP server for the deployment API, health and metrics endpoints
//!
//! Provides Kubernetes health probes:
//! - `/healthz` - Liveness probe (process is running)
//! - `/readyz` - Readiness probe (deployer is ready to serve)
//!
//! Also provides graceful shutdown handling for SIGTERM/SIGINT.

pub mod api;
mod health;
pub mod metrics;
pub mod shutdown;

pub use health::{health_router, run_server, serve, ReadinessState, ServerState};
pub use metrics::{create_metrics, DeployerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
