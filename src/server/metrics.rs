//! Prometheus metrics for the deployer
//!
//! - Rollout outcomes by strategy
//! - Rollout durations
//! - Rollouts currently running

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Deployer metrics registry
///
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DeployerMetrics {
    registry: Registry,
    /// Finished rollouts by strategy and result (success, failure)
    pub deployments_total: IntCounterVec,
    /// Rollout duration in seconds, lock wait excluded
    pub deployment_duration_seconds: HistogramVec,
    /// Rollouts holding an application lock right now
    pub deployments_in_progress: IntGauge,
}

impl DeployerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let deployments_total = IntCounterVec::new(
            Opts::new("cutover_deployments_total", "Total number of finished rollouts"),
            &["strategy", "result"],
        )?;
        registry.register(Box::new(deployments_total.clone()))?;

        // Rollouts wait on pods and health checks, so buckets reach into minutes
        let deployment_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "cutover_deployment_duration_seconds",
                "Duration of a rollout in seconds",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["strategy"],
        )?;
        registry.register(Box::new(deployment_duration_seconds.clone()))?;

        let deployments_in_progress = IntGauge::new(
            "cutover_deployments_in_progress",
            "Number of rollouts currently running",
        )?;
        registry.register(Box::new(deployments_in_progress.clone()))?;

        Ok(Self {
            registry,
            deployments_total,
            deployment_duration_seconds,
            deployments_in_progress,
        })
    }

    pub fn record_started(&self) {
        self.deployments_in_progress.inc();
    }

    pub fn record_success(&self, strategy: &str, duration_secs: f64) {
        self.record_finished(strategy, "success", duration_secs);
    }

    pub fn record_failure(&self, strategy: &str, duration_secs: f64) {
        self.record_finished(strategy, "failure", duration_secs);
    }

    fn record_finished(&self, strategy: &str, result: &str, duration_secs: f64) {
        self.deployments_in_progress.dec();
        self.deployments_total
            .with_label_values(&[strategy, result])
            .inc();
        self.deployment_duration_seconds
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Shared metrics handle
pub type SharedMetrics = Arc<DeployerMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(DeployerMetrics::new()?))
}
