//! Pod-watch protocol
//!
//! 1. List matching pods and remember the snapshot's resource version.
//! 2. Confirm every pod already running (health-checked when configured).
//! 3. Watch from the snapshot; confirm each pod as it reaches Running.
//! 4. After each confirmation ask the callback whether to stop.
//!
//! The whole protocol runs inside `race_with_timeout`, so a timeout cancels
//! the open watch and any in-flight health poll.

use crate::cluster::{is_pod_running, pod_ip, ClusterClient, WatchedEvent};
use crate::controller::health_check::HealthProbe;
use crate::controller::race::{race_with_timeout, RaceOutcome};
use crate::controller::replicaset::LifecycleError;
use crate::model::{Descriptor, HealthCheckType};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause before re-establishing a watch the server closed
const REWATCH_BACKOFF: Duration = Duration::from_millis(200);

pub enum WatchStep<T> {
    /// Finish watching with this result
    Break(T),
    /// Keep watching
    Continue,
}

/// Invoked once per newly confirmed pod
#[async_trait]
pub trait PodCallback: Send {
    type Output: Send;

    async fn on_confirmed(&mut self, pod: &Pod) -> Result<WatchStep<Self::Output>, LifecycleError>;
}

/// Where and how a pod's health endpoint is probed
#[derive(Debug, Clone, PartialEq)]
pub struct HealthTarget {
    pub port: i32,
    pub path: String,
    pub check_type: HealthCheckType,
}

impl HealthTarget {
    pub fn from_descriptor(descriptor: &Descriptor) -> Option<HealthTarget> {
        descriptor
            .health_check_target()
            .map(|(port, path, check_type)| HealthTarget {
                port,
                path,
                check_type,
            })
    }

    pub fn url(&self, ip: &str) -> String {
        format!("http://{}:{}/{}", ip, self.port, self.path)
    }
}

/// Which pods to watch
#[derive(Debug, Clone)]
pub struct WatchSpec {
    pub namespace: String,
    pub selector: String,
    pub health: Option<HealthTarget>,
    /// Pods that must never be confirmed (e.g. the ones being replaced)
    pub ignore: HashSet<String>,
}

#[derive(Clone)]
pub struct PodWatch {
    cluster: Arc<dyn ClusterClient>,
    probe: Arc<dyn HealthProbe>,
    health_timeout: Duration,
}

impl PodWatch {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        probe: Arc<dyn HealthProbe>,
        health_timeout: Duration,
    ) -> Self {
        PodWatch {
            cluster,
            probe,
            health_timeout,
        }
    }

    /// Run the protocol until the callback breaks, a pod fails, or `timeout` fires
    pub async fn watch_with_timeout<C>(
        &self,
        spec: WatchSpec,
        callback: C,
        timeout: Duration,
    ) -> Result<C::Output, LifecycleError>
    where
        C: PodCallback + 'static,
        C::Output: 'static,
    {
        let watch = self.clone();
        let selector = spec.selector.clone();
        let outcome = race_with_timeout(timeout, move |token| async move {
            watch.run(spec, callback, token).await
        })
        .await;

        match outcome {
            RaceOutcome::Completed(result) => result,
            RaceOutcome::TimedOut => {
                warn!(selector = %selector, ?timeout, "Timed out waiting for pods");
                Err(LifecycleError::Timeout {
                    what: format!("pods matching {}", selector),
                    after: timeout,
                })
            }
            RaceOutcome::Abandoned => Err(LifecycleError::Watch(format!(
                "pod watch for {} ended unexpectedly",
                selector
            ))),
        }
    }

    async fn run<C: PodCallback>(
        &self,
        spec: WatchSpec,
        mut callback: C,
        token: CancellationToken,
    ) -> Result<C::Output, LifecycleError> {
        let snapshot = self
            .cluster
            .list_pods(&spec.namespace, &spec.selector)
            .await?;
        let mut confirmed = spec.ignore.clone();
        let mut resource_version = snapshot.resource_version;

        for pod in &snapshot.items {
            if let Some(step) = self.consider(&spec, &mut confirmed, &mut callback, pod).await? {
                return Ok(step);
            }
        }

        loop {
            let mut events = self
                .cluster
                .watch_pods(&spec.namespace, &spec.selector, &resource_version)
                .await?;

            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => {
                        return Err(LifecycleError::Watch("pod watch cancelled".to_string()));
                    }
                    next = events.next() => next,
                };

                let event = match next {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => return Err(LifecycleError::Watch(e.to_string())),
                    None => break,
                };

                if let Some(rv) = event.object().metadata.resource_version.as_ref() {
                    resource_version = rv.clone();
                }

                match &event {
                    WatchedEvent::Added(pod) | WatchedEvent::Modified(pod) => {
                        if let Some(step) =
                            self.consider(&spec, &mut confirmed, &mut callback, pod).await?
                        {
                            return Ok(step);
                        }
                    }
                    WatchedEvent::Deleted(pod) => {
                        debug!(pod = ?pod.metadata.name, "Pod deleted during watch");
                    }
                }
            }

            debug!(selector = %spec.selector, rv = %resource_version, "Pod watch closed, re-watching");
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(LifecycleError::Watch("pod watch cancelled".to_string()));
                }
                _ = tokio::time::sleep(REWATCH_BACKOFF) => {}
            }
        }
    }

    /// Confirm a running pod once and hand it to the callback
    async fn consider<C: PodCallback>(
        &self,
        spec: &WatchSpec,
        confirmed: &mut HashSet<String>,
        callback: &mut C,
        pod: &Pod,
    ) -> Result<Option<C::Output>, LifecycleError> {
        let Some(name) = pod.metadata.name.as_deref() else {
            return Ok(None);
        };
        if confirmed.contains(name) || !is_pod_running(pod) {
            return Ok(None);
        }

        if let Some(health) = &spec.health {
            // Running pods get an IP; wait for the update that carries it
            let Some(ip) = pod_ip(pod) else {
                return Ok(None);
            };
            let url = health.url(ip);
            debug!(pod = %name, url = %url, "Checking pod health");
            if !self
                .probe
                .wait_for_healthy(&url, health.check_type, self.health_timeout)
                .await
            {
                warn!(pod = %name, url = %url, "Pod failed its health check");
                return Err(LifecycleError::Unhealthy {
                    pod: name.to_string(),
                });
            }
        }

        confirmed.insert(name.to_string());
        info!(pod = %name, "Pod confirmed running");

        match callback.on_confirmed(pod).await? {
            WatchStep::Break(output) => Ok(Some(output)),
            WatchStep::Continue => Ok(None),
        }
    }
}

#[cfg(test)]
#[path = "pod_watch_test.rs"]
mod tests;
