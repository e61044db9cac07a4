//! Blue-green strategy
//!
//! Builds the new version completely beside the old one, then switches the
//! hostname's frontend to it in one write. Old versions are removed after
//! the switch.

use super::{DeploymentStrategy, RolloutContext, StrategyError};
use async_trait::async_trait;
use tracing::info;

pub struct BlueGreenStrategy;

#[async_trait]
impl DeploymentStrategy for BlueGreenStrategy {
    fn name(&self) -> &'static str {
        "blue-green"
    }

    async fn deploy(&self, ctx: &RolloutContext) -> Result<(), StrategyError> {
        let descriptor = &ctx.descriptor;
        info!(
            app = %descriptor.app_name,
            namespace = %descriptor.namespace,
            version = %ctx.version,
            replicas = descriptor.replicas,
            "Starting blue-green rollout"
        );

        let frontend = ctx.ensure_frontend().await?;

        ctx.create_service_permissive().await;

        ctx.lifecycle
            .create_replica_set(descriptor, &ctx.version)
            .await?;
        ctx.log(format!(
            "Created replica-set {}-{} with {} replicas",
            descriptor.app_name, ctx.version, descriptor.replicas
        ))
        .await;

        if descriptor.replicas == 0 {
            ctx.log("Zero replicas requested, skipping readiness wait")
                .await;
        } else {
            let ready = ctx
                .lifecycle
                .wait_for_ready(descriptor, &ctx.version, descriptor.replicas)
                .await;
            ctx.report_readiness(ready).await?;
        }

        ctx.register_endpoints(&[ctx.backend()]).await?;

        if let Some(frontend) = &frontend {
            ctx.cut_over(frontend).await?;
        }

        ctx.cleanup_old_versions().await;
        Ok(())
    }
}

#[cfg(test)]
#[path = "blue_green_test.rs"]
mod tests;
