//! Deployment coordinator
//!
//! Owns the status machine of a deployment record. Every deploy and undeploy
//! of one application runs under that application's lock; the coordinator is
//! the only place where errors become persisted status.

use crate::controller::clock::Clock;
use crate::controller::lock::AppLocks;
use crate::controller::progress::ProgressLog;
use crate::controller::replicaset::{LifecycleError, ReplicaLifecycle};
use crate::controller::strategies::{select_strategy, RolloutContext, StrategyError};
use crate::model::{Deployment, DeploymentStatus, DeploymentType, Descriptor, ValidationError};
use crate::registry::{DeploymentStore, StoreError};
use crate::server::metrics::SharedMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Registry error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error("Version {version} of '{app}' is already deployed")]
    AlreadyDeployed { app: String, version: String },

    #[error("Undeploy incomplete: {}", .0.join("; "))]
    Teardown(Vec<String>),

    #[error("Deployment '{0}' not found")]
    NotFound(String),
}

/// Persists status changes and progress lines of one deployment as they happen
pub struct Tracker {
    record: Mutex<Deployment>,
    store: Arc<dyn DeploymentStore>,
    clock: Arc<dyn Clock>,
}

impl Tracker {
    fn new(record: Deployment, store: Arc<dyn DeploymentStore>, clock: Arc<dyn Clock>) -> Self {
        Tracker {
            record: Mutex::new(record),
            store,
            clock,
        }
    }

    pub async fn snapshot(&self) -> Deployment {
        self.record.lock().await.clone()
    }

    async fn persist(&self, record: &Deployment) {
        if let Err(e) = self.store.update(record).await {
            warn!(deployment = %record.id, error = %e, "Failed to persist deployment record");
        }
    }

    async fn set_status(&self, status: DeploymentStatus) {
        let mut record = self.record.lock().await;
        record.set_status(status, self.clock.now());
        record.append_log(format!("Status {}", status), self.clock.now());
        info!(deployment = %record.id, app = %record.app_name(), status = %status, "Deployment status changed");
        self.persist(&record).await;
    }

    async fn set_version(&self, version: &str) {
        let mut record = self.record.lock().await;
        record.version = version.to_string();
        record.append_log(format!("Deploying version {}", version), self.clock.now());
        self.persist(&record).await;
    }
}

#[async_trait]
impl ProgressLog for Tracker {
    async fn log(&self, line: String) {
        let mut record = self.record.lock().await;
        record.append_log(line, self.clock.now());
        self.persist(&record).await;
    }
}

pub struct Deployer {
    lifecycle: Arc<ReplicaLifecycle>,
    store: Arc<dyn DeploymentStore>,
    locks: Arc<AppLocks>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    proxy_reload: Duration,
}

impl Deployer {
    pub fn new(
        lifecycle: Arc<ReplicaLifecycle>,
        store: Arc<dyn DeploymentStore>,
        locks: Arc<AppLocks>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
        proxy_reload: Duration,
    ) -> Self {
        Deployer {
            lifecycle,
            store,
            locks,
            clock,
            metrics,
            proxy_reload,
        }
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    /// Validate a descriptor and persist its DEPLOYING record
    async fn accept(&self, mut descriptor: Descriptor) -> Result<Deployment, DeployError> {
        descriptor.normalize();
        descriptor.validate()?;
        let deployment = Deployment::new(descriptor, self.clock.now());
        self.store.create(&deployment).await?;
        info!(
            deployment = %deployment.id,
            app = %deployment.app_name(),
            namespace = %deployment.namespace(),
            strategy = %deployment.descriptor.deployment_type,
            "Accepted deployment"
        );
        Ok(deployment)
    }

    /// Deploy and wait for the outcome
    ///
    /// Errors only when the descriptor is rejected or the record cannot be
    /// created; rollout failures come back as a FAILURE record.
    pub async fn deploy(&self, descriptor: Descriptor) -> Result<Deployment, DeployError> {
        let deployment = self.accept(descriptor).await?;
        Ok(self.run(deployment).await)
    }

    /// Accept a deployment and roll it out in the background
    pub async fn start_deploy(
        self: &Arc<Self>,
        descriptor: Descriptor,
    ) -> Result<Deployment, DeployError> {
        let deployment = self.accept(descriptor).await?;
        let deployer = self.clone();
        let background = deployment.clone();
        tokio::spawn(async move {
            deployer.run(background).await;
        });
        Ok(deployment)
    }

    async fn run(&self, deployment: Deployment) -> Deployment {
        let descriptor = deployment.descriptor.clone();
        let tracker = Arc::new(Tracker::new(
            deployment,
            self.store.clone(),
            self.clock.clone(),
        ));

        let _guard = self.locks.acquire(&descriptor.lock_key()).await;
        tracker.log("Acquired application lock".to_string()).await;

        let strategy = select_strategy(descriptor.deployment_type);
        self.metrics.record_started();
        let started = Instant::now();

        let version = match self.prepare(&descriptor, &tracker).await {
            Ok(version) => version,
            Err(e) => {
                self.fail(&tracker, &e).await;
                self.metrics
                    .record_failure(strategy.name(), started.elapsed().as_secs_f64());
                return tracker.snapshot().await;
            }
        };

        let ctx = RolloutContext {
            descriptor: descriptor.clone(),
            version: version.clone(),
            lifecycle: self.lifecycle.clone(),
            progress: tracker.clone(),
            proxy_reload: self.proxy_reload,
        };

        match strategy.deploy(&ctx).await {
            Ok(()) => {
                tracker.set_status(DeploymentStatus::Deployed).await;
                self.metrics
                    .record_success(strategy.name(), started.elapsed().as_secs_f64());
                let deployed = tracker.snapshot().await;
                self.demote_previous(&deployed).await;
                deployed
            }
            Err(e) => {
                if e.is_timeout() {
                    error!(app = %descriptor.app_name, version = %version, error = %e, "Rollout timed out");
                }
                // A restart never created anything of its own to remove
                if descriptor.deployment_type != DeploymentType::Redeploy {
                    self.remove_failed_version(&tracker).await;
                }
                self.fail(&tracker, &DeployError::from(e)).await;
                self.metrics
                    .record_failure(strategy.name(), started.elapsed().as_secs_f64());
                tracker.snapshot().await
            }
        }
    }

    /// Resolve the version and refuse one that is already deployed
    async fn prepare(
        &self,
        descriptor: &Descriptor,
        tracker: &Tracker,
    ) -> Result<String, DeployError> {
        if descriptor.deployment_type == DeploymentType::Redeploy {
            let version = self.lifecycle.current_version(descriptor).await?;
            tracker.set_version(&version).await;
            return Ok(version);
        }

        let version = self.lifecycle.resolve_version(descriptor).await?;
        tracker.set_version(&version).await;
        if self
            .lifecycle
            .version_service_exists(descriptor, &version)
            .await?
        {
            return Err(DeployError::AlreadyDeployed {
                app: descriptor.app_name.clone(),
                version,
            });
        }
        self.lifecycle
            .cluster()
            .ensure_namespace(&descriptor.namespace)
            .await
            .map_err(LifecycleError::from)?;
        Ok(version)
    }

    async fn fail(&self, tracker: &Tracker, e: &DeployError) {
        let record = tracker.snapshot().await;
        error!(
            deployment = %record.id,
            app = %record.app_name(),
            version = %record.version,
            error = %e,
            "Deployment failed"
        );
        tracker.log(format!("Deployment failed: {}", e)).await;
        tracker.set_status(DeploymentStatus::Failure).await;
    }

    /// Best-effort removal of what a failed rollout created
    ///
    /// Runs while the record still says DEPLOYING.
    async fn remove_failed_version(&self, tracker: &Tracker) {
        let record = tracker.snapshot().await;
        let descriptor = &record.descriptor;
        if let Err(e) = self.lifecycle.remove_version(descriptor, &record.version).await {
            warn!(app = %descriptor.app_name, version = %record.version, error = %e, "Failed version cleanup incomplete");
            tracker.log(format!("Cleanup incomplete: {}", e)).await;
        }

        // Only a frontend this attempt created still points at its backend
        let Some(hostname) = descriptor.frontend.as_deref() else {
            return;
        };
        let proxy = self.lifecycle.proxy();
        match proxy.get_frontend(&descriptor.namespace, hostname).await {
            Ok(Some(frontend)) if frontend.backend_id == record.backend_id() => {
                if let Err(e) = proxy.delete_frontend(&descriptor.namespace, hostname).await {
                    warn!(hostname = %hostname, error = %e, "Failed to remove frontend");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(hostname = %hostname, error = %e, "Failed to read frontend"),
        }
    }

    /// Move other DEPLOYED records of the application to UNDEPLOYED
    async fn demote_previous(&self, current: &Deployment) {
        let records = match self
            .store
            .list_by_app(current.namespace(), current.app_name())
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(app = %current.app_name(), error = %e, "Failed to list previous deployments");
                return;
            }
        };

        for mut record in records {
            if record.id == current.id || record.status != DeploymentStatus::Deployed {
                continue;
            }
            record.set_status(DeploymentStatus::Undeployed, self.clock.now());
            record.append_log(
                format!("Superseded by deployment {}", current.id),
                self.clock.now(),
            );
            if let Err(e) = self.store.update(&record).await {
                warn!(deployment = %record.id, error = %e, "Failed to demote previous deployment");
            }
        }
    }

    pub async fn get(
        &self,
        namespace: &str,
        app_name: &str,
        id: &str,
    ) -> Result<Deployment, DeployError> {
        self.store
            .get_by_id(namespace, app_name, id)
            .await?
            .ok_or_else(|| DeployError::NotFound(id.to_string()))
    }

    /// Tear down an application deployed by `deployment`
    ///
    /// Anything but a DEPLOYED record is left alone apart from history
    /// deletion. Teardown keeps going past failures and reports them together.
    pub async fn undeploy(
        &self,
        deployment: Deployment,
        delete_history: bool,
    ) -> Result<Deployment, DeployError> {
        let descriptor = deployment.descriptor.clone();
        let _guard = self.locks.acquire(&descriptor.lock_key()).await;

        // The record may have moved on while we waited for the lock
        let current = self
            .store
            .get_by_id(&descriptor.namespace, &descriptor.app_name, &deployment.id)
            .await?
            .unwrap_or(deployment);

        if current.status != DeploymentStatus::Deployed {
            info!(
                deployment = %current.id,
                status = %current.status,
                "Deployment is not active, nothing to tear down"
            );
            if delete_history {
                let failures = self.delete_history(&descriptor).await;
                if !failures.is_empty() {
                    return Err(DeployError::Teardown(failures));
                }
            }
            return Ok(current);
        }

        let tracker = Tracker::new(current, self.store.clone(), self.clock.clone());
        tracker.set_status(DeploymentStatus::Undeploying).await;
        info!(app = %descriptor.app_name, namespace = %descriptor.namespace, "Undeploying application");

        let mut failures = self.lifecycle.teardown(&descriptor).await;
        if let Some(hostname) = descriptor.frontend.as_deref() {
            if let Err(e) = self
                .lifecycle
                .proxy()
                .delete_frontend(&descriptor.namespace, hostname)
                .await
            {
                failures.push(format!("frontend {}: {}", hostname, e));
            }
        }

        if failures.is_empty() {
            tracker.log("Application removed".to_string()).await;
            tracker.set_status(DeploymentStatus::Undeployed).await;
        } else {
            for failure in &failures {
                tracker.log(format!("Teardown failed: {}", failure)).await;
            }
            tracker.set_status(DeploymentStatus::Failure).await;
        }
        let result = tracker.snapshot().await;

        if delete_history {
            failures.extend(self.delete_history(&descriptor).await);
        }

        if failures.is_empty() {
            Ok(result)
        } else {
            error!(app = %descriptor.app_name, failures = failures.len(), "Undeploy incomplete");
            Err(DeployError::Teardown(failures))
        }
    }

    /// Delete every record of the application, unreadable ones included
    async fn delete_history(&self, descriptor: &Descriptor) -> Vec<String> {
        let ids = match self
            .store
            .list_ids(&descriptor.namespace, &descriptor.app_name)
            .await
        {
            Ok(ids) => ids,
            Err(e) => return vec![format!("listing history: {}", e)],
        };

        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self
                .store
                .delete(&descriptor.namespace, &descriptor.app_name, &id)
                .await
            {
                failures.push(format!("history {}: {}", id, e));
            }
        }
        info!(app = %descriptor.app_name, "Deleted deployment history");
        failures
    }
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod tests;
