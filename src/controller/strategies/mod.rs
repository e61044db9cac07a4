//! Deployment strategies
//!
//! Each `DeploymentType` maps to one strategy. A strategy drives the replica
//! lifecycle and the proxy for a single version; status bookkeeping and
//! failure cleanup stay with the coordinator.

pub mod blue_green;
pub mod redeploy;
pub mod rolling;

#[cfg(test)]
pub(crate) mod testing;

use crate::cluster::ClusterError;
use crate::controller::progress::ProgressLog;
use crate::controller::replicaset::{backend_servers, LifecycleError, ReplicaLifecycle};
use crate::model::{DeploymentType, Descriptor};
use crate::proxy::{BackendRef, BackendServer, FrontendSpec, ProxyError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur during strategy execution
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

impl StrategyError {
    /// Readiness ceiling reached, as opposed to an explicit failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, StrategyError::Lifecycle(e) if e.is_timeout())
    }
}

/// Everything one rollout needs
pub struct RolloutContext {
    pub descriptor: Descriptor,
    /// Resolved version being rolled out
    pub version: String,
    pub lifecycle: Arc<ReplicaLifecycle>,
    pub progress: Arc<dyn ProgressLog>,
    /// Settle interval between registering endpoints and switching the frontend
    pub proxy_reload: Duration,
}

impl RolloutContext {
    pub fn backend(&self) -> BackendRef {
        BackendRef::new(
            self.descriptor.namespace.as_str(),
            self.descriptor.app_name.as_str(),
            self.version.as_str(),
        )
    }

    pub async fn log(&self, line: impl Into<String>) {
        self.progress.log(line.into()).await;
    }

    /// Create the hostname's frontend if the descriptor declares one
    ///
    /// An existing frontend keeps its backend.
    async fn ensure_frontend(&self) -> Result<Option<FrontendSpec>, StrategyError> {
        let Some(spec) = FrontendSpec::from_descriptor(&self.descriptor) else {
            return Ok(None);
        };
        let key = self
            .lifecycle
            .proxy()
            .create_frontend(&spec, &self.backend())
            .await?;
        self.log(format!("Frontend for {} at {}", spec.hostname, key))
            .await;
        Ok(Some(spec))
    }

    /// Create the version Service; failure is logged and the rollout continues
    async fn create_service_permissive(&self) {
        if let Err(e) = self
            .lifecycle
            .create_service(&self.descriptor, &self.version)
            .await
        {
            warn!(
                app = %self.descriptor.app_name,
                version = %self.version,
                error = %e,
                "Service creation failed, continuing"
            );
            self.log(format!(
                "Failed to create service {}-{}: {}",
                self.descriptor.app_name, self.version, e
            ))
            .await;
        }
    }

    /// Log the readiness outcome with a line distinguishing timeout from failure
    async fn report_readiness(&self, result: Result<(), LifecycleError>) -> Result<(), StrategyError> {
        let line = match &result {
            Ok(()) => format!(
                "{} pods of version {} are running",
                self.descriptor.replicas, self.version
            ),
            Err(LifecycleError::Timeout { after, .. }) => format!(
                "Timeout waiting for pods of version {} after {}s",
                self.version,
                after.as_secs()
            ),
            Err(LifecycleError::Unhealthy { pod }) => {
                format!("Pod {} failed its health check", pod)
            }
            Err(e) => format!("Error waiting for pods: {}", e),
        };
        self.log(line).await;
        Ok(result?)
    }

    /// Register the version Service's endpoints under each of `backends`
    ///
    /// Returns the servers added. A missing Service registers nothing,
    /// matching the permissive create.
    async fn register_endpoints(
        &self,
        backends: &[BackendRef],
    ) -> Result<Vec<BackendServer>, StrategyError> {
        let service_name = self.backend().service_name();
        let Some(service) = self
            .lifecycle
            .get_version_service(&self.descriptor, &self.version)
            .await?
        else {
            warn!(service = %service_name, "No version service, no endpoints registered");
            self.log(format!("No service {}, no endpoints registered", service_name))
                .await;
            return Ok(Vec::new());
        };

        let servers = backend_servers(&service, self.descriptor.use_compression);
        for backend in backends {
            for server in &servers {
                self.lifecycle
                    .proxy()
                    .add_backend_server(backend, server)
                    .await?;
            }
        }
        info!(
            service = %service_name,
            servers = servers.len(),
            backends = backends.len(),
            "Registered backend servers"
        );
        Ok(servers)
    }

    /// Take `servers` back out of `backend`; failures only warn
    ///
    /// Servers are keyed by address, so each address is removed once.
    async fn withdraw_endpoints(&self, backend: &BackendRef, servers: &[BackendServer]) {
        let addresses: BTreeSet<&str> = servers.iter().map(|s| s.ip_address.as_str()).collect();
        for ip in addresses {
            if let Err(e) = self
                .lifecycle
                .proxy()
                .delete_backend_server(backend, ip)
                .await
            {
                warn!(backend = %backend.id(), ip = %ip, error = %e, "Failed to withdraw backend server");
                continue;
            }
            self.log(format!("Withdrew {} from backend {}", ip, backend.id()))
                .await;
        }
    }

    /// Wait for the proxy to pick up new endpoints, then move the hostname over
    async fn cut_over(&self, frontend: &FrontendSpec) -> Result<(), StrategyError> {
        tokio::time::sleep(self.proxy_reload).await;
        let backend = self.backend();
        let previous = self
            .lifecycle
            .proxy()
            .switch_backend(&frontend.namespace, &frontend.hostname, &backend)
            .await?;
        info!(
            hostname = %frontend.hostname,
            from = %previous,
            to = %backend.id(),
            "Switched frontend"
        );
        self.log(format!(
            "Switched {} from {} to {}",
            frontend.hostname,
            previous,
            backend.id()
        ))
        .await;
        Ok(())
    }

    /// Remove other versions; failures only warn
    async fn cleanup_old_versions(&self) {
        match self
            .lifecycle
            .cleanup_old_versions(&self.descriptor, &self.version)
            .await
        {
            Ok(()) => self.log("Removed old versions").await,
            Err(e) => {
                warn!(app = %self.descriptor.app_name, error = %e, "Old version cleanup incomplete");
                self.log(format!("Old version cleanup incomplete: {}", e))
                    .await;
            }
        }
    }
}

/// One rollout algorithm
#[async_trait]
pub trait DeploymentStrategy: Send + Sync {
    /// Strategy name for logging and metrics
    fn name(&self) -> &'static str;

    /// Roll out `ctx.version`; returns once traffic reaches it or on failure
    async fn deploy(&self, ctx: &RolloutContext) -> Result<(), StrategyError>;
}

pub fn select_strategy(deployment_type: DeploymentType) -> Box<dyn DeploymentStrategy> {
    match deployment_type {
        DeploymentType::BlueGreen => Box::new(blue_green::BlueGreenStrategy),
        DeploymentType::Rolling => Box::new(rolling::RollingStrategy),
        DeploymentType::Redeploy => Box::new(redeploy::RedeployStrategy),
    }
}
