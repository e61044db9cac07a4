//! Redeploy strategy
//!
//! Restarts the current version's pods one at a time. Each deleted pod must
//! be replaced by a new, confirmed pod before the next one goes, so at most
//! one replica is unavailable. Services and the proxy are left alone.

use super::{DeploymentStrategy, RolloutContext, StrategyError};
use crate::cluster::ClusterError;
use crate::controller::pod_watch::{PodCallback, WatchStep};
use crate::controller::replicaset::LifecycleError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use tracing::{info, warn};

pub struct RedeployStrategy;

/// Breaks on the first confirmed replacement pod
struct Replacement;

#[async_trait]
impl PodCallback for Replacement {
    type Output = String;

    async fn on_confirmed(&mut self, pod: &Pod) -> Result<WatchStep<String>, LifecycleError> {
        Ok(WatchStep::Break(pod.metadata.name.clone().unwrap_or_default()))
    }
}

#[async_trait]
impl DeploymentStrategy for RedeployStrategy {
    fn name(&self) -> &'static str {
        "redeploy"
    }

    async fn deploy(&self, ctx: &RolloutContext) -> Result<(), StrategyError> {
        let descriptor = &ctx.descriptor;
        let lifecycle = &ctx.lifecycle;
        let spec = lifecycle.watch_spec(descriptor, &ctx.version);

        let original: Vec<String> = lifecycle
            .cluster()
            .list_pods(&spec.namespace, &spec.selector)
            .await?
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect();
        info!(
            app = %descriptor.app_name,
            version = %ctx.version,
            pods = original.len(),
            "Restarting pods"
        );
        ctx.log(format!(
            "Restarting {} pods of version {}",
            original.len(),
            ctx.version
        ))
        .await;

        for name in &original {
            let existing: HashSet<String> = lifecycle
                .cluster()
                .list_pods(&spec.namespace, &spec.selector)
                .await?
                .items
                .into_iter()
                .filter_map(|p| p.metadata.name)
                .collect();

            match lifecycle.cluster().delete_pod(&spec.namespace, name).await {
                Ok(()) => {}
                Err(ClusterError::NotFound { .. }) => {
                    warn!(pod = %name, "Pod already gone, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let mut waiting = spec.clone();
            waiting.ignore = existing;
            let result = lifecycle
                .pod_watch()
                .watch_with_timeout(waiting, Replacement, lifecycle.config().pod_ready_timeout)
                .await;
            let replacement = match result {
                Ok(replacement) => replacement,
                Err(e) => return ctx.report_readiness(Err(e)).await,
            };
            ctx.log(format!("Replaced pod {} with {}", name, replacement))
                .await;
        }

        Ok(())
    }
}
