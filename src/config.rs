//! Process configuration
//!
//! Every setting comes from a `CUTOVER_*` environment variable and has a
//! default, so the deployer starts with no configuration at all against an
//! in-cluster scheduler and an in-process store.

use crate::controller::health_check::HealthCheckMethod;
use crate::controller::replicaset::LifecycleConfig;
use crate::proxy::ProxyKind;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const ENV_PREFIX: &str = "CUTOVER_";

#[derive(Debug, Clone)]
pub struct DeployerConfig {
    /// Scheduler API URL; `None` infers in-cluster or kubeconfig settings
    pub kubernetes_url: Option<String>,
    /// etcd URL for records and the kv proxy; `None` keeps everything in memory
    pub etcd_url: Option<String>,
    pub port: u16,
    pub health_check_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_check_method: HealthCheckMethod,
    /// Settle time between endpoint registration and the frontend switch
    pub proxy_reload: Duration,
    pub pod_ready_timeout: Duration,
    pub scale_down_timeout: Duration,
    pub proxy: ProxyKind,
    /// Ingress controller status page used to confirm a backend went live
    pub proxy_status_url: Option<String>,
    pub proxy_confirm_timeout: Duration,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        DeployerConfig {
            kubernetes_url: None,
            etcd_url: None,
            port: 8000,
            health_check_timeout: Duration::from_secs(120),
            health_check_interval: Duration::from_secs(2),
            health_check_method: HealthCheckMethod::Get,
            proxy_reload: Duration::from_secs(3),
            pod_ready_timeout: Duration::from_secs(600),
            scale_down_timeout: Duration::from_secs(90),
            proxy: ProxyKind::Kv,
            proxy_status_url: None,
            proxy_confirm_timeout: Duration::from_secs(60),
        }
    }
}

impl DeployerConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    ///
    /// Unparseable values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = DeployerConfig::default();
        let env = |key: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let seconds = |key: &str, default: Duration| {
            parsed(key, env(key), default.as_secs()).map_or(default, Duration::from_secs)
        };

        DeployerConfig {
            kubernetes_url: env("KUBERNETES_URL"),
            etcd_url: env("ETCD_URL"),
            port: parsed("PORT", env("PORT"), defaults.port).unwrap_or(defaults.port),
            health_check_timeout: seconds(
                "HEALTH_CHECK_TIMEOUT_SECONDS",
                defaults.health_check_timeout,
            ),
            health_check_interval: seconds(
                "HEALTH_CHECK_INTERVAL_SECONDS",
                defaults.health_check_interval,
            ),
            health_check_method: parsed(
                "HEALTH_CHECK_METHOD",
                env("HEALTH_CHECK_METHOD"),
                defaults.health_check_method,
            )
            .unwrap_or(defaults.health_check_method),
            proxy_reload: seconds("PROXY_RELOAD_SECONDS", defaults.proxy_reload),
            pod_ready_timeout: seconds("POD_READY_TIMEOUT_SECONDS", defaults.pod_ready_timeout),
            scale_down_timeout: seconds("SCALE_DOWN_TIMEOUT_SECONDS", defaults.scale_down_timeout),
            proxy: parsed("PROXY", env("PROXY"), defaults.proxy).unwrap_or(defaults.proxy),
            proxy_status_url: env("PROXY_STATUS_URL"),
            proxy_confirm_timeout: seconds(
                "PROXY_CONFIRM_TIMEOUT_SECONDS",
                defaults.proxy_confirm_timeout,
            ),
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            pod_ready_timeout: self.pod_ready_timeout,
            scale_down_timeout: self.scale_down_timeout,
            health_timeout: self.health_check_timeout,
        }
    }
}

/// Parse `raw` if present, warning and returning `None` when it does not parse
fn parsed<T>(key: &str, raw: Option<String>, default: T) -> Option<T>
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    let raw = raw?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                variable = %format!("{}{}", ENV_PREFIX, key),
                value = %raw,
                default = ?default,
                error = %e,
                "Invalid configuration value, using default"
            );
            None
        }
    }
}
