//! Rolling strategy
//!
//! The new replica-set starts at full size next to the old one. Each new pod
//! that is confirmed healthy takes one replica away from the old set, until
//! the old set reaches zero. A failing new pod stops the loop and leaves the
//! old set where it got to; the new version's endpoints are taken back out
//! of the old backend, which stays routed.

use super::{DeploymentStrategy, RolloutContext, StrategyError};
use crate::cluster::{
    app_selector, desired_replicas, label, ClusterClient, ClusterError, EventStream, WatchedEvent,
    LABEL_VERSION,
};
use crate::controller::pod_watch::{PodCallback, WatchStep};
use crate::controller::replicaset::LifecycleError;
use crate::proxy::{BackendRef, FrontendSpec};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RollingStrategy;

/// Consecutive watch failures tolerated while waiting for one scale step
const MAX_WATCH_RESTARTS: u32 = 3;

/// Takes one replica from the old set per confirmed new pod
struct RollingScaler {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    selector: String,
    old_name: String,
    old_replicas: i32,
    new_replicas: i32,
    confirmed: i32,
    /// List resource version to resume from; `None` re-lists first
    resource_version: Option<String>,
    events: Option<EventStream<ReplicaSet>>,
}

impl RollingScaler {
    async fn scale_old_to(&mut self, target: i32) -> Result<(), LifecycleError> {
        self.cluster
            .scale_replica_set(&self.namespace, &self.old_name, target)
            .await?;
        self.old_replicas = target;
        info!(replicaset = %self.old_name, replicas = target, "Scaled down old replica-set");
        self.await_scaled(target).await
    }

    /// Fresh list of the app's replica-sets
    ///
    /// Returns the old set's desired count, or `None` once it is gone, and
    /// keeps the list's resource version for the next watch.
    async fn relist(&mut self) -> Result<Option<i32>, LifecycleError> {
        let snapshot = self
            .cluster
            .list_replica_sets(&self.namespace, &self.selector)
            .await?;
        self.resource_version = Some(snapshot.resource_version);
        Ok(snapshot
            .items
            .iter()
            .find(|rs| rs.metadata.name.as_deref() == Some(self.old_name.as_str()))
            .map(desired_replicas))
    }

    /// Drop the watch so the next round re-lists, unless failures keep coming
    fn restart_after(&mut self, err: ClusterError, restarts: &mut u32) -> Result<(), LifecycleError> {
        *restarts += 1;
        if *restarts > MAX_WATCH_RESTARTS {
            return Err(LifecycleError::Watch(err.to_string()));
        }
        warn!(replicaset = %self.old_name, error = %err, "Replica-set watch failed, re-listing");
        self.events = None;
        self.resource_version = None;
        Ok(())
    }

    fn deleted_error(&self) -> LifecycleError {
        LifecycleError::Watch(format!(
            "replica-set {} deleted during rolling update",
            self.old_name
        ))
    }

    /// Block until the old set's own update event reports `target`
    ///
    /// A failed watch is re-established from a fresh list, whose state also
    /// answers the wait if the update already happened.
    async fn await_scaled(&mut self, target: i32) -> Result<(), LifecycleError> {
        let mut restarts = 0;
        loop {
            if self.events.is_none() {
                let resource_version = match self.resource_version.clone() {
                    Some(rv) => rv,
                    None => match self.relist().await? {
                        None => return Err(self.deleted_error()),
                        Some(replicas) if replicas <= target => return Ok(()),
                        Some(_) => self.resource_version.clone().unwrap_or_default(),
                    },
                };
                match self
                    .cluster
                    .watch_replica_sets(&self.namespace, &self.selector, &resource_version)
                    .await
                {
                    Ok(stream) => self.events = Some(stream),
                    Err(e) => {
                        self.restart_after(e, &mut restarts)?;
                        continue;
                    }
                }
            }
            let Some(events) = self.events.as_mut() else {
                continue;
            };

            match events.next().await {
                Some(Ok(event)) => {
                    restarts = 0;
                    let rs = event.object();
                    if let Some(rv) = rs.metadata.resource_version.as_ref() {
                        self.resource_version = Some(rv.clone());
                    }
                    if rs.metadata.name.as_deref() != Some(self.old_name.as_str()) {
                        continue;
                    }
                    match event {
                        WatchedEvent::Deleted(_) => return Err(self.deleted_error()),
                        WatchedEvent::Added(rs) | WatchedEvent::Modified(rs) => {
                            if desired_replicas(&rs) <= target {
                                return Ok(());
                            }
                        }
                    }
                }
                Some(Err(e)) => self.restart_after(e, &mut restarts)?,
                // Server closed the watch; resume from the last seen version
                None => self.events = None,
            }
        }
    }
}

#[async_trait]
impl PodCallback for RollingScaler {
    type Output = ();

    async fn on_confirmed(&mut self, pod: &Pod) -> Result<WatchStep<()>, LifecycleError> {
        self.confirmed += 1;
        debug!(pod = ?pod.metadata.name, confirmed = self.confirmed, "New pod confirmed");

        if self.old_replicas > 0 {
            self.scale_old_to(self.old_replicas - 1).await?;
        }

        if self.confirmed < self.new_replicas {
            return Ok(WatchStep::Continue);
        }
        // Every new pod is up; anything left in the old set goes
        if self.old_replicas > 0 {
            self.scale_old_to(0).await?;
        }
        Ok(WatchStep::Break(()))
    }
}

#[async_trait]
impl DeploymentStrategy for RollingStrategy {
    fn name(&self) -> &'static str {
        "rolling"
    }

    async fn deploy(&self, ctx: &RolloutContext) -> Result<(), StrategyError> {
        let descriptor = &ctx.descriptor;
        let lifecycle = &ctx.lifecycle;
        info!(
            app = %descriptor.app_name,
            namespace = %descriptor.namespace,
            version = %ctx.version,
            replicas = descriptor.replicas,
            "Starting rolling rollout"
        );

        let previous = match lifecycle
            .find_previous_replica_set(descriptor, &ctx.version)
            .await?
        {
            Some(rs) => Some(name_and_version(&rs)?),
            None => None,
        };

        let frontend = ctx.ensure_frontend().await?;
        ctx.create_service_permissive().await;
        lifecycle.create_replica_set(descriptor, &ctx.version).await?;
        ctx.log(format!(
            "Created replica-set {}-{} with {} replicas",
            descriptor.app_name, ctx.version, descriptor.replicas
        ))
        .await;

        let Some((old_name, old_version)) = previous else {
            // Nothing to replace: plain readiness gate
            if descriptor.replicas > 0 {
                let ready = lifecycle
                    .wait_for_ready(descriptor, &ctx.version, descriptor.replicas)
                    .await;
                ctx.report_readiness(ready).await?;
            }
            ctx.register_endpoints(&[ctx.backend()]).await?;
            if let Some(frontend) = &frontend {
                ctx.cut_over(frontend).await?;
            }
            return Ok(());
        };

        // Both versions serve while the old set shrinks
        let old_backend = BackendRef::new(
            descriptor.namespace.as_str(),
            descriptor.app_name.as_str(),
            old_version.as_str(),
        );
        let overlap = ctx
            .register_endpoints(&[old_backend.clone(), ctx.backend()])
            .await?;

        if let Err(e) = self
            .replace_old_set(ctx, &old_name, frontend.as_ref())
            .await
        {
            // The old backend stays routed
            ctx.withdraw_endpoints(&old_backend, &overlap).await;
            return Err(e);
        }
        ctx.cleanup_old_versions().await;
        Ok(())
    }
}

/// Name and version label of the set being replaced
fn name_and_version(rs: &ReplicaSet) -> Result<(String, String), LifecycleError> {
    let name = rs.metadata.name.clone().unwrap_or_default();
    match label(&rs.metadata, LABEL_VERSION) {
        Some(version) if !version.is_empty() => Ok((name, version.to_string())),
        other => Err(LifecycleError::InvalidVersionLabel {
            name,
            label: other.unwrap_or_default().to_string(),
        }),
    }
}

impl RollingStrategy {
    /// Shrink `old_name` as new pods come up, then move the frontend over
    async fn replace_old_set(
        &self,
        ctx: &RolloutContext,
        old_name: &str,
        frontend: Option<&FrontendSpec>,
    ) -> Result<(), StrategyError> {
        let descriptor = &ctx.descriptor;
        let lifecycle = &ctx.lifecycle;

        let mut scaler = RollingScaler {
            cluster: lifecycle.cluster().clone(),
            namespace: descriptor.namespace.clone(),
            selector: app_selector(&descriptor.app_name),
            old_name: old_name.to_string(),
            old_replicas: 0,
            new_replicas: descriptor.replicas,
            confirmed: 0,
            resource_version: None,
            events: None,
        };
        // Seed from a list version, not the object's own
        let current = scaler.relist().await?;
        let old_replicas = current.ok_or_else(|| scaler.deleted_error())?;
        scaler.old_replicas = old_replicas;

        ctx.log(format!(
            "Replacing {} ({} replicas) pod by pod",
            old_name, scaler.old_replicas
        ))
        .await;

        if descriptor.replicas == 0 {
            lifecycle.scale_down_and_delete(&descriptor.namespace, old_name).await?;
        } else {
            let result = lifecycle
                .pod_watch()
                .watch_with_timeout(
                    lifecycle.watch_spec(descriptor, &ctx.version),
                    scaler,
                    lifecycle.config().pod_ready_timeout,
                )
                .await;
            if result.is_err() {
                let left = lifecycle
                    .current_replicas(&descriptor.namespace, old_name)
                    .await
                    .unwrap_or_default();
                ctx.log(format!("Rolling update stopped with {} left at {} replicas", old_name, left))
                    .await;
            }
            ctx.report_readiness(result).await?;
        }

        if let Some(frontend) = frontend {
            ctx.cut_over(frontend).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "rolling_test.rs"]
mod tests;
