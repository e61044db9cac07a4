//! Replica lifecycle: one replica-set and Service per application version
//!
//! Creates the version's objects, waits until the desired number of healthy
//! pods run, resolves the next version number, and scales down and deletes
//! versions that are no longer current.

use crate::cluster::{
    app_selector, desired_replicas, is_pod_running, is_terminating, label, label_selector,
    version_selector, ClusterClient, ClusterError, WatchedEvent, LABEL_APP, LABEL_MANAGED_BY,
    LABEL_NAME, LABEL_VERSION, MANAGED_BY,
};
use crate::controller::health_check::HealthProbe;
use crate::controller::pod_watch::{HealthTarget, PodCallback, PodWatch, WatchSpec, WatchStep};
use crate::controller::race::{race_with_timeout, RaceOutcome};
use crate::model::{replica_set_name, Descriptor};
use crate::proxy::{BackendRef, BackendServer, ProxyBackend, ProxyError};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{
    EnvVar, Pod, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ENV_APP_NAME: &str = "APP_NAME";
pub const ENV_APP_VERSION: &str = "APP_VERSION";
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Timeout after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Pod '{pod}' failed its health check")]
    Unhealthy { pod: String },

    #[error("Watch failed: {0}")]
    Watch(String),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Cannot resolve next version: {count} active replica-sets ({})", .names.join(", "))]
    AmbiguousVersion { count: usize, names: Vec<String> },

    #[error("Replica-set '{name}' has non-numeric version label '{label}'")]
    InvalidVersionLabel { name: String, label: String },

    #[error("No active replica-set for '{app}' in '{namespace}'")]
    NoActiveVersion { namespace: String, app: String },

    #[error("Cleanup incomplete: {}", .0.join("; "))]
    Cleanup(Vec<String>),
}

impl LifecycleError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LifecycleError::Timeout { .. })
    }
}

/// Ceilings for the blocking waits of a rollout
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Watch ceiling while waiting for a version's pods
    pub pod_ready_timeout: Duration,
    /// How long to wait for pods to disappear after scaling to zero
    pub scale_down_timeout: Duration,
    /// Per-pod health poll ceiling
    pub health_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            pod_ready_timeout: Duration::from_secs(600),
            scale_down_timeout: Duration::from_secs(90),
            health_timeout: Duration::from_secs(120),
        }
    }
}

fn version_labels(descriptor: &Descriptor, version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), descriptor.app_name.clone()),
        (
            LABEL_NAME.to_string(),
            replica_set_name(&descriptor.app_name, version),
        ),
        (LABEL_VERSION.to_string(), version.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Add `name=value` unless the container already declares `name`
fn inject_env(env: &mut Vec<EnvVar>, name: &str, value: &str) {
    if env.iter().any(|e| e.name == name) {
        return;
    }
    env.push(EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    });
}

/// Build the replica-set for one version of a descriptor
///
/// Name `{app}-{version}`; replica-set, selector and pod template all carry
/// the app/name/version/managed-by labels. Every container gets APP_NAME,
/// APP_VERSION and POD_NAMESPACE.
pub fn build_replica_set(descriptor: &Descriptor, version: &str) -> ReplicaSet {
    let labels = version_labels(descriptor, version);
    let selector = LabelSelector {
        match_labels: Some(BTreeMap::from([
            (
                LABEL_NAME.to_string(),
                replica_set_name(&descriptor.app_name, version),
            ),
            (LABEL_VERSION.to_string(), version.to_string()),
        ])),
        ..Default::default()
    };

    let mut pod_spec = descriptor.pod_spec.clone();
    for container in &mut pod_spec.containers {
        let env = container.env.get_or_insert_with(Vec::new);
        inject_env(env, ENV_APP_NAME, &descriptor.app_name);
        inject_env(env, ENV_APP_VERSION, version);
        inject_env(env, ENV_POD_NAMESPACE, &descriptor.namespace);
    }

    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(replica_set_name(&descriptor.app_name, version)),
            namespace: Some(descriptor.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(descriptor.replicas),
            selector,
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            }),
            ..Default::default()
        }),
        status: None,
    }
}

fn service_ports(descriptor: &Descriptor) -> Vec<ServicePort> {
    descriptor
        .container_ports()
        .into_iter()
        .map(|port| ServicePort {
            name: Some(format!("port-{}", port)),
            port,
            target_port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect()
}

/// Service `{app}-{version}` selecting exactly one version's pods
pub fn build_service(descriptor: &Descriptor, version: &str) -> Service {
    let rs_name = replica_set_name(&descriptor.app_name, version);
    Service {
        metadata: ObjectMeta {
            name: Some(rs_name.clone()),
            namespace: Some(descriptor.namespace.clone()),
            labels: Some(version_labels(descriptor, version)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([
                (LABEL_NAME.to_string(), rs_name),
                (LABEL_VERSION.to_string(), version.to_string()),
            ])),
            ports: Some(service_ports(descriptor)),
            ..Default::default()
        }),
        status: None,
    }
}

/// Version-less Service `{app}` selecting every version's pods
pub fn build_persistent_service(descriptor: &Descriptor) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(descriptor.app_name.clone()),
            namespace: Some(descriptor.namespace.clone()),
            labels: Some(BTreeMap::from([
                (LABEL_APP.to_string(), descriptor.app_name.clone()),
                (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                LABEL_APP.to_string(),
                descriptor.app_name.clone(),
            )])),
            ports: Some(service_ports(descriptor)),
            ..Default::default()
        }),
        status: None,
    }
}

/// Cluster-internal endpoints of a Service, one per port
pub fn backend_servers(service: &Service, compression_enabled: bool) -> Vec<BackendServer> {
    let Some(spec) = service.spec.as_ref() else {
        return Vec::new();
    };
    let Some(ip) = spec.cluster_ip.as_deref().filter(|ip| *ip != "None") else {
        return Vec::new();
    };
    spec.ports
        .iter()
        .flatten()
        .map(|port| BackendServer {
            ip_address: ip.to_string(),
            port: port.port,
            compression_enabled,
        })
        .collect()
}

/// Breaks once the number of running pods equals the desired count
struct ReadyCounter {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    selector: String,
    desired: i32,
}

#[async_trait]
impl PodCallback for ReadyCounter {
    type Output = ();

    async fn on_confirmed(&mut self, _pod: &Pod) -> Result<WatchStep<()>, LifecycleError> {
        let snapshot = self
            .cluster
            .list_pods(&self.namespace, &self.selector)
            .await?;
        let running = snapshot.items.iter().filter(|p| is_pod_running(p)).count() as i32;
        debug!(selector = %self.selector, running, desired = self.desired, "Counted running pods");
        if running == self.desired {
            Ok(WatchStep::Break(()))
        } else {
            Ok(WatchStep::Continue)
        }
    }
}

/// Wait until every pod in `selector` is gone
async fn pods_gone(
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    selector: String,
    token: CancellationToken,
) -> Result<(), LifecycleError> {
    let snapshot = cluster.list_pods(&namespace, &selector).await?;
    let mut remaining: HashSet<String> = snapshot
        .items
        .iter()
        .filter_map(|p| p.metadata.name.clone())
        .collect();
    if remaining.is_empty() {
        return Ok(());
    }

    let mut events = cluster
        .watch_pods(&namespace, &selector, &snapshot.resource_version)
        .await?;
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                return Err(LifecycleError::Watch("scale-down watch cancelled".to_string()));
            }
            next = events.next() => next,
        };
        match next {
            Some(Ok(WatchedEvent::Deleted(pod))) => {
                if let Some(name) = pod.metadata.name.as_ref() {
                    remaining.remove(name);
                }
                if remaining.is_empty() {
                    return Ok(());
                }
            }
            Some(Ok(WatchedEvent::Added(pod))) => {
                if let Some(name) = pod.metadata.name {
                    remaining.insert(name);
                }
            }
            Some(Ok(WatchedEvent::Modified(_))) => {}
            Some(Err(e)) => return Err(LifecycleError::Watch(e.to_string())),
            None => return Err(LifecycleError::Watch("pod watch closed".to_string())),
        }
    }
}

pub struct ReplicaLifecycle {
    cluster: Arc<dyn ClusterClient>,
    proxy: Arc<dyn ProxyBackend>,
    pods: PodWatch,
    config: LifecycleConfig,
}

impl ReplicaLifecycle {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        proxy: Arc<dyn ProxyBackend>,
        probe: Arc<dyn HealthProbe>,
        config: LifecycleConfig,
    ) -> Self {
        let pods = PodWatch::new(cluster.clone(), probe, config.health_timeout);
        ReplicaLifecycle {
            cluster,
            proxy,
            pods,
            config,
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterClient> {
        &self.cluster
    }

    pub fn proxy(&self) -> &Arc<dyn ProxyBackend> {
        &self.proxy
    }

    pub fn pod_watch(&self) -> &PodWatch {
        &self.pods
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Replica-sets of an application that are not being deleted
    pub async fn active_replica_sets(
        &self,
        descriptor: &Descriptor,
    ) -> Result<Vec<ReplicaSet>, LifecycleError> {
        let sets = self
            .cluster
            .list_replica_sets(&descriptor.namespace, &app_selector(&descriptor.app_name))
            .await?;
        Ok(sets
            .items
            .into_iter()
            .filter(|rs| !is_terminating(&rs.metadata))
            .collect())
    }

    /// Version to deploy: the descriptor's own, or one past the active version
    ///
    /// No active replica-set gives "1"; more than one is ambiguous.
    pub async fn resolve_version(&self, descriptor: &Descriptor) -> Result<String, LifecycleError> {
        if !descriptor.is_auto_version() {
            return Ok(descriptor.version.clone());
        }

        let active = self.active_replica_sets(descriptor).await?;
        match active.as_slice() {
            [] => Ok("1".to_string()),
            [current] => {
                let name = current.metadata.name.clone().unwrap_or_default();
                let current_label = label(&current.metadata, LABEL_VERSION).unwrap_or_default();
                let number: u64 =
                    current_label
                        .parse()
                        .map_err(|_| LifecycleError::InvalidVersionLabel {
                            name,
                            label: current_label.to_string(),
                        })?;
                Ok((number + 1).to_string())
            }
            many => Err(LifecycleError::AmbiguousVersion {
                count: many.len(),
                names: many
                    .iter()
                    .filter_map(|rs| rs.metadata.name.clone())
                    .collect(),
            }),
        }
    }

    /// Version label of the single active replica-set, for in-place restarts
    pub async fn current_version(&self, descriptor: &Descriptor) -> Result<String, LifecycleError> {
        let active = self.active_replica_sets(descriptor).await?;
        match active.as_slice() {
            [] => Err(LifecycleError::NoActiveVersion {
                namespace: descriptor.namespace.clone(),
                app: descriptor.app_name.clone(),
            }),
            [current] => label(&current.metadata, LABEL_VERSION)
                .map(|v| v.to_string())
                .ok_or_else(|| LifecycleError::InvalidVersionLabel {
                    name: current.metadata.name.clone().unwrap_or_default(),
                    label: String::new(),
                }),
            many => Err(LifecycleError::AmbiguousVersion {
                count: many.len(),
                names: many
                    .iter()
                    .filter_map(|rs| rs.metadata.name.clone())
                    .collect(),
            }),
        }
    }

    /// The single active replica-set other than `new_version`, if any
    pub async fn find_previous_replica_set(
        &self,
        descriptor: &Descriptor,
        new_version: &str,
    ) -> Result<Option<ReplicaSet>, LifecycleError> {
        let others: Vec<ReplicaSet> = self
            .active_replica_sets(descriptor)
            .await?
            .into_iter()
            .filter(|rs| label(&rs.metadata, LABEL_VERSION) != Some(new_version))
            .collect();
        if others.len() > 1 {
            return Err(LifecycleError::AmbiguousVersion {
                count: others.len(),
                names: others
                    .iter()
                    .filter_map(|rs| rs.metadata.name.clone())
                    .collect(),
            });
        }
        Ok(others.into_iter().next())
    }

    pub async fn version_service_exists(
        &self,
        descriptor: &Descriptor,
        version: &str,
    ) -> Result<bool, LifecycleError> {
        let name = replica_set_name(&descriptor.app_name, version);
        Ok(self
            .cluster
            .get_service(&descriptor.namespace, &name)
            .await?
            .is_some())
    }

    /// Create the version Service, and the persistent `{app}` Service if absent
    pub async fn create_service(
        &self,
        descriptor: &Descriptor,
        version: &str,
    ) -> Result<Service, LifecycleError> {
        let ns = &descriptor.namespace;
        if self
            .cluster
            .get_service(ns, &descriptor.app_name)
            .await?
            .is_none()
        {
            match self
                .cluster
                .create_service(ns, &build_persistent_service(descriptor))
                .await
            {
                Ok(_) | Err(ClusterError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let service = self
            .cluster
            .create_service(ns, &build_service(descriptor, version))
            .await?;
        info!(app = %descriptor.app_name, namespace = %ns, version = %version, "Created service");
        Ok(service)
    }

    pub async fn get_version_service(
        &self,
        descriptor: &Descriptor,
        version: &str,
    ) -> Result<Option<Service>, LifecycleError> {
        let name = replica_set_name(&descriptor.app_name, version);
        Ok(self.cluster.get_service(&descriptor.namespace, &name).await?)
    }

    pub async fn create_replica_set(
        &self,
        descriptor: &Descriptor,
        version: &str,
    ) -> Result<ReplicaSet, LifecycleError> {
        let replica_set = build_replica_set(descriptor, version);
        let created = self
            .cluster
            .create_replica_set(&descriptor.namespace, &replica_set)
            .await?;
        info!(
            app = %descriptor.app_name,
            namespace = %descriptor.namespace,
            version = %version,
            replicas = descriptor.replicas,
            "Created replica-set"
        );
        Ok(created)
    }

    /// Health selector and target for a version's pods
    pub fn watch_spec(&self, descriptor: &Descriptor, version: &str) -> WatchSpec {
        WatchSpec {
            namespace: descriptor.namespace.clone(),
            selector: version_selector(&descriptor.app_name, version),
            health: HealthTarget::from_descriptor(descriptor),
            ignore: HashSet::new(),
        }
    }

    /// Wait until `desired` pods of a version are running, bounded by the watch ceiling
    pub async fn wait_for_ready(
        &self,
        descriptor: &Descriptor,
        version: &str,
        desired: i32,
    ) -> Result<(), LifecycleError> {
        if desired == 0 {
            return Ok(());
        }
        let spec = self.watch_spec(descriptor, version);
        let counter = ReadyCounter {
            cluster: self.cluster.clone(),
            namespace: spec.namespace.clone(),
            selector: spec.selector.clone(),
            desired,
        };
        self.pods
            .watch_with_timeout(spec, counter, self.config.pod_ready_timeout)
            .await
    }

    /// Scale a replica-set to zero, wait for its pods to go, then delete it
    ///
    /// A missing replica-set is already done. A slow scale-down is logged and
    /// the replica-set is deleted anyway.
    pub async fn scale_down_and_delete(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), LifecycleError> {
        match self.cluster.scale_replica_set(namespace, name, 0).await {
            Ok(_) => {}
            Err(ClusterError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let cluster = self.cluster.clone();
        let ns = namespace.to_string();
        let selector = label_selector(&[(LABEL_NAME, name)]);
        match race_with_timeout(self.config.scale_down_timeout, move |token| {
            pods_gone(cluster, ns, selector, token)
        })
        .await
        {
            RaceOutcome::Completed(Ok(())) => {
                debug!(replicaset = %name, "Pods gone after scale-down")
            }
            RaceOutcome::Completed(Err(e)) => {
                warn!(replicaset = %name, error = %e, "Could not confirm scale-down")
            }
            RaceOutcome::TimedOut | RaceOutcome::Abandoned => warn!(
                replicaset = %name,
                timeout = ?self.config.scale_down_timeout,
                "Timed out waiting for scale-down"
            ),
        }

        match self.cluster.delete_replica_set(namespace, name).await {
            Ok(()) | Err(ClusterError::NotFound { .. }) => {
                info!(namespace = %namespace, replicaset = %name, "Deleted replica-set");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), LifecycleError> {
        match self.cluster.delete_service(namespace, name).await {
            Ok(()) | Err(ClusterError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove everything belonging to one version: replica-set, Service, backend
    ///
    /// Attempts every step and reports all failures together.
    pub async fn remove_version(
        &self,
        descriptor: &Descriptor,
        version: &str,
    ) -> Result<(), LifecycleError> {
        let ns = &descriptor.namespace;
        let name = replica_set_name(&descriptor.app_name, version);
        let mut failures = Vec::new();

        if let Err(e) = self.scale_down_and_delete(ns, &name).await {
            failures.push(format!("replica-set {}: {}", name, e));
        }
        if let Err(e) = self.delete_service(ns, &name).await {
            failures.push(format!("service {}: {}", name, e));
        }
        let backend = BackendRef::new(ns.as_str(), descriptor.app_name.as_str(), version);
        if let Err(e) = self.proxy.delete_deployment(&backend).await {
            failures.push(format!("backend {}: {}", backend.id(), e));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Cleanup(failures))
        }
    }

    /// Remove every version except `current`, keeping the persistent Service
    pub async fn cleanup_old_versions(
        &self,
        descriptor: &Descriptor,
        current: &str,
    ) -> Result<(), LifecycleError> {
        let ns = &descriptor.namespace;
        let selector = app_selector(&descriptor.app_name);
        let mut failures = Vec::new();

        for rs in self.cluster.list_replica_sets(ns, &selector).await?.items {
            let version = label(&rs.metadata, LABEL_VERSION).map(|v| v.to_string());
            if version.as_deref() == Some(current) {
                continue;
            }
            let Some(name) = rs.metadata.name.as_deref() else {
                continue;
            };
            info!(app = %descriptor.app_name, replicaset = %name, "Removing old version");
            if let Err(e) = self.scale_down_and_delete(ns, name).await {
                failures.push(format!("replica-set {}: {}", name, e));
            }
            if let Some(version) = version {
                let backend =
                    BackendRef::new(ns.as_str(), descriptor.app_name.as_str(), version);
                if let Err(e) = self.proxy.delete_deployment(&backend).await {
                    failures.push(format!("backend {}: {}", backend.id(), e));
                }
            }
        }

        for service in self.cluster.list_services(ns, &selector).await? {
            let Some(version) = label(&service.metadata, LABEL_VERSION) else {
                continue;
            };
            if version == current {
                continue;
            }
            let Some(name) = service.metadata.name.as_deref() else {
                continue;
            };
            if let Err(e) = self.delete_service(ns, name).await {
                failures.push(format!("service {}: {}", name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Cleanup(failures))
        }
    }

    /// Remove every replica-set, Service and backend of an application
    ///
    /// Never stops at the first failure; returns every failure message.
    pub async fn teardown(&self, descriptor: &Descriptor) -> Vec<String> {
        let ns = &descriptor.namespace;
        let selector = app_selector(&descriptor.app_name);
        let mut failures = Vec::new();

        match self.cluster.list_services(ns, &selector).await {
            Ok(services) => {
                for service in services {
                    let Some(name) = service.metadata.name.as_deref() else {
                        continue;
                    };
                    if let Err(e) = self.delete_service(ns, name).await {
                        failures.push(format!("service {}: {}", name, e));
                    }
                }
            }
            Err(e) => failures.push(format!("listing services: {}", e)),
        }

        match self.cluster.list_replica_sets(ns, &selector).await {
            Ok(sets) => {
                for rs in sets.items {
                    let Some(name) = rs.metadata.name.as_deref() else {
                        continue;
                    };
                    if let Err(e) = self.scale_down_and_delete(ns, name).await {
                        failures.push(format!("replica-set {}: {}", name, e));
                    }
                    if let Some(version) = label(&rs.metadata, LABEL_VERSION) {
                        let backend =
                            BackendRef::new(ns.as_str(), descriptor.app_name.as_str(), version);
                        if let Err(e) = self.proxy.delete_deployment(&backend).await {
                            failures.push(format!("backend {}: {}", backend.id(), e));
                        }
                    }
                }
            }
            Err(e) => failures.push(format!("listing replica-sets: {}", e)),
        }

        failures
    }

    /// Desired replicas currently set on a replica-set, 0 if it is gone
    pub async fn current_replicas(&self, namespace: &str, name: &str) -> Result<i32, LifecycleError> {
        Ok(self
            .cluster
            .get_replica_set(namespace, name)
            .await?
            .map(|rs| desired_replicas(&rs))
            .unwrap_or(0))
    }
}

#[cfg(test)]
#[path = "replicaset_test.rs"]
mod tests;
