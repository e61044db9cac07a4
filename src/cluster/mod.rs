//! Typed access to the container scheduler
//!
//! `ClusterClient` is the seam between the deployer and Kubernetes.
//! Production code uses `KubeClusterClient`; tests use the in-memory
//! `MockCluster`, which replays watch events from a resource version.

mod kubernetes;
#[cfg(test)]
pub mod mock;

pub use kubernetes::KubeClusterClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

pub const LABEL_APP: &str = "app";
pub const LABEL_NAME: &str = "name";
pub const LABEL_VERSION: &str = "version";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const MANAGED_BY: &str = "cutover";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Watch failed: {0}")]
    WatchFailed(String),
}

/// A watch notification for one resource
#[derive(Debug, Clone)]
pub enum WatchedEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchedEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchedEvent::Added(obj) | WatchedEvent::Modified(obj) | WatchedEvent::Deleted(obj) => {
                obj
            }
        }
    }
}

/// Live event sequence; dropping it closes the underlying watch
pub type EventStream<K> = BoxStream<'static, Result<WatchedEvent<K>, ClusterError>>;

/// List result together with the resource version to watch from
#[derive(Debug, Clone)]
pub struct Snapshot<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// Operations the deployer needs from the scheduler
///
/// Every read is a fresh request; implementations must not cache.
/// `selector` is an equality-based label selector (`k=v,k2=v2`).
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create the namespace unless it already exists
    async fn ensure_namespace(&self, name: &str) -> Result<(), ClusterError>;

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Snapshot<ReplicaSet>, ClusterError>;

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ClusterError>;

    async fn create_replica_set(
        &self,
        namespace: &str,
        replica_set: &ReplicaSet,
    ) -> Result<ReplicaSet, ClusterError>;

    /// Set `spec.replicas`, returning the updated object
    async fn scale_replica_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<ReplicaSet, ClusterError>;

    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn watch_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<ReplicaSet>, ClusterError>;

    async fn list_pods(&self, namespace: &str, selector: &str)
        -> Result<Snapshot<Pod>, ClusterError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<Pod>, ClusterError>;

    async fn list_services(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Service>, ClusterError>;

    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, ClusterError>;

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ClusterError>;

    async fn get_ingress(&self, namespace: &str, name: &str)
        -> Result<Option<Ingress>, ClusterError>;

    async fn list_ingresses(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Ingress>, ClusterError>;

    async fn create_ingress(
        &self,
        namespace: &str,
        ingress: &Ingress,
    ) -> Result<Ingress, ClusterError>;

    async fn replace_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> Result<Ingress, ClusterError>;

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

/// Build an equality label selector from pairs
pub fn label_selector(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Selector for every object belonging to an application
pub fn app_selector(app_name: &str) -> String {
    label_selector(&[(LABEL_APP, app_name), (LABEL_MANAGED_BY, MANAGED_BY)])
}

/// Selector for the pods of one application version
pub fn version_selector(app_name: &str, version: &str) -> String {
    let rs_name = crate::model::replica_set_name(app_name, version);
    label_selector(&[(LABEL_NAME, &rs_name), (LABEL_VERSION, version)])
}

pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels.as_ref().and_then(|l| l.get(key)).map(|s| s.as_str())
}

/// Objects with a deletion timestamp are on their way out
pub fn is_terminating(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

pub fn is_pod_running(pod: &Pod) -> bool {
    !is_terminating(&pod.metadata)
        && pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|phase| phase == "Running")
            .unwrap_or(false)
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
}

pub fn desired_replicas(replica_set: &ReplicaSet) -> i32 {
    replica_set
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0)
}
