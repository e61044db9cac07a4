//! Pod health polling
//!
//! A pod is probed on a fixed interval until it reports healthy or the
//! caller's timeout elapses. Connection errors, undecodable bodies and
//! `{"healthy": false}` all mean "not yet" and are retried.

use crate::controller::race::{race_with_timeout, RaceOutcome};
use crate::model::HealthCheckType;
use async_trait::async_trait;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP method used for health requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthCheckMethod {
    #[default]
    Get,
    Post,
}

impl FromStr for HealthCheckMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HealthCheckMethod::Get),
            "POST" => Ok(HealthCheckMethod::Post),
            other => Err(format!("unsupported health check method '{}'", other)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    healthy: bool,
}

/// Trait for waiting on a single pod's health endpoint
///
/// Returns false on timeout and never errors.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn wait_for_healthy(
        &self,
        url: &str,
        check_type: HealthCheckType,
        timeout: Duration,
    ) -> bool;
}

/// Health probe over HTTP using reqwest
#[derive(Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    method: HealthCheckMethod,
    interval: Duration,
}

impl HttpHealthProbe {
    pub fn new(method: HealthCheckMethod, interval: Duration) -> Self {
        // Each attempt is bounded so one hung connection cannot eat the whole budget
        let client = match reqwest::Client::builder()
            .timeout(interval.max(Duration::from_secs(1)))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to build health check HTTP client, using default");
                reqwest::Client::new()
            }
        };
        HttpHealthProbe {
            client,
            method,
            interval,
        }
    }

    async fn probe_once(&self, url: &str, check_type: HealthCheckType) -> bool {
        let request = match self.method {
            HealthCheckMethod::Get => self.client.get(url),
            HealthCheckMethod::Post => self.client.post(url),
        };

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %url, error = %e, "Health check request failed");
                return false;
            }
        };

        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "Health check returned non-success");
            return false;
        }

        match check_type {
            HealthCheckType::Simple => true,
            HealthCheckType::Probe => match response.json::<ProbeResponse>().await {
                Ok(body) => body.healthy,
                Err(e) => {
                    debug!(url = %url, error = %e, "Health check body not decodable");
                    false
                }
            },
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn wait_for_healthy(
        &self,
        url: &str,
        check_type: HealthCheckType,
        timeout: Duration,
    ) -> bool {
        let probe = self.clone();
        let url = url.to_string();

        let outcome = race_with_timeout(timeout, move |token| async move {
            loop {
                if probe.probe_once(&url, check_type).await {
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(probe.interval) => {}
                }
            }
        })
        .await;

        matches!(outcome, RaceOutcome::Completed(()))
    }
}

/// Scripted probe for tests
#[cfg(test)]
pub struct MockHealthProbe {
    healthy_calls: Option<usize>,
    calls: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockHealthProbe {
    /// Every pod is healthy
    pub fn healthy() -> Self {
        MockHealthProbe {
            healthy_calls: None,
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Every pod stays unhealthy until its timeout
    pub fn unhealthy() -> Self {
        Self::healthy_for(0)
    }

    /// The first `n` probed pods are healthy, later ones are not
    pub fn healthy_for(n: usize) -> Self {
        MockHealthProbe {
            healthy_calls: Some(n),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn probed_urls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl HealthProbe for MockHealthProbe {
    async fn wait_for_healthy(
        &self,
        url: &str,
        _check_type: HealthCheckType,
        _timeout: Duration,
    ) -> bool {
        let mut calls = self.calls.lock().unwrap();
        calls.push(url.to_string());
        match self.healthy_calls {
            None => true,
            Some(n) => calls.len() <= n,
        }
    }
}

#[cfg(test)]
#[path = "health_check_test.rs"]
mod tests;
