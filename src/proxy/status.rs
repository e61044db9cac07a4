//! Post-switch confirmation against the proxy's own status endpoint
//!
//! The nginx VTS module reports upstream pools as
//! `{"upstreamZones": {"<pool>": [{"server": "...", "down": false}, ...]}}`.
//! A pool counts as live once it is listed with at least one member and no
//! member is down.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct StatusReport {
    #[serde(rename = "upstreamZones", default)]
    upstream_zones: HashMap<String, Vec<UpstreamMember>>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMember {
    #[serde(default)]
    down: bool,
}

/// Polls the proxy status page until a backend pool is live
pub struct StatusConfirmer {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    interval: Duration,
}

impl StatusConfirmer {
    pub fn new(url: impl Into<String>, timeout: Duration, interval: Duration) -> Self {
        StatusConfirmer {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
            interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True once `pool` is reported with all members up; false on timeout
    ///
    /// Fetch and decode errors count as "not yet".
    pub async fn wait_for_pool(&self, pool: &str) -> bool {
        let poll = async {
            loop {
                match self.fetch().await {
                    Ok(report) if pool_is_live(&report, pool) => return,
                    Ok(_) => debug!(pool = %pool, "Backend pool not live yet"),
                    Err(e) => debug!(pool = %pool, error = %e, "Proxy status unavailable"),
                }
                tokio::time::sleep(self.interval).await;
            }
        };
        tokio::time::timeout(self.timeout, poll).await.is_ok()
    }

    async fn fetch(&self) -> Result<StatusReport, reqwest::Error> {
        self.client
            .get(&self.url)
            .timeout(self.interval.max(Duration::from_secs(1)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

fn pool_is_live(report: &StatusReport, pool: &str) -> bool {
    report
        .upstream_zones
        .get(pool)
        .map(|members| !members.is_empty() && members.iter().all(|m| !m.down))
        .unwrap_or(false)
}

/// nginx upstream pool name for a Service port: `{namespace}-{service}-{port}`
pub fn pool_name(namespace: &str, service: &str, port: i32) -> String {
    format!("{}-{}-{}", namespace, service, port)
}
