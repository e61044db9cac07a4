//! In-memory `ClusterClient` for tests
//!
//! Simulates just enough of the scheduler for rollout tests:
//! - a replica-set "controller" that creates/removes pods to match `spec.replicas`
//! - a per-kind event log so watches replay from a resource version
//! - per-application accounting of concurrent mutation calls
//! - one-shot failure injection for create calls

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{
    label, ClusterClient, ClusterError, EventStream, Snapshot, WatchedEvent, LABEL_APP,
    LABEL_NAME,
};
use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Pod, PodStatus, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

type Key = (String, String);

/// What newly created pods look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodStartup {
    /// Pods are Running with an IP as soon as they exist
    Running,
    /// Pods stay Pending until `start_pending_pods` is called
    Pending,
}

#[derive(Default)]
struct State {
    resource_version: u64,
    replica_sets: BTreeMap<Key, ReplicaSet>,
    pods: BTreeMap<Key, Pod>,
    services: BTreeMap<Key, Service>,
    secrets: BTreeMap<Key, Secret>,
    namespaces: std::collections::BTreeSet<String>,
    ingresses: BTreeMap<Key, Ingress>,
    pod_events: Vec<(u64, String, WatchedEvent<Pod>)>,
    rs_events: Vec<(u64, String, WatchedEvent<ReplicaSet>)>,
    /// Replica-set watches must start at or after this version
    rs_compacted_at: u64,
    pod_counter: u64,
    ip_counter: u64,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.resource_version += 1;
        self.resource_version
    }
}

pub struct MockCluster {
    state: Mutex<State>,
    pod_tx: broadcast::Sender<(u64, String, WatchedEvent<Pod>)>,
    rs_tx: broadcast::Sender<(u64, String, WatchedEvent<ReplicaSet>)>,
    startup: Mutex<PodStartup>,
    mutation_delay: Mutex<Duration>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
    fail_next_service_create: Mutex<bool>,
    fail_next_replica_set_create: Mutex<bool>,
    fail_service_deletes: Mutex<bool>,
    expire_next_rs_watch: Mutex<bool>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        let (pod_tx, _) = broadcast::channel(1024);
        let (rs_tx, _) = broadcast::channel(1024);
        MockCluster {
            state: Mutex::new(State::default()),
            pod_tx,
            rs_tx,
            startup: Mutex::new(PodStartup::Running),
            mutation_delay: Mutex::new(Duration::ZERO),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: Mutex::new(HashMap::new()),
            fail_next_service_create: Mutex::new(false),
            fail_next_replica_set_create: Mutex::new(false),
            fail_service_deletes: Mutex::new(false),
            expire_next_rs_watch: Mutex::new(false),
        }
    }

    pub fn set_pod_startup(&self, startup: PodStartup) {
        *self.startup.lock().unwrap() = startup;
    }

    /// Make every mutation take this long, so overlapping calls are observable
    pub fn set_mutation_delay(&self, delay: Duration) {
        *self.mutation_delay.lock().unwrap() = delay;
    }

    pub fn fail_next_service_create(&self) {
        *self.fail_next_service_create.lock().unwrap() = true;
    }

    pub fn fail_next_replica_set_create(&self) {
        *self.fail_next_replica_set_create.lock().unwrap() = true;
    }

    /// Make every Service deletion fail until turned off
    pub fn fail_service_deletes(&self, fail: bool) {
        *self.fail_service_deletes.lock().unwrap() = fail;
    }

    /// Drop the replica-set event history, like apiserver compaction
    ///
    /// Watches from an older resource version then fail as expired.
    pub fn compact_replica_set_events(&self) {
        let mut state = self.state.lock().unwrap();
        state.rs_compacted_at = state.resource_version;
        state.rs_events.clear();
    }

    /// Make the next replica-set watch fail with an expiry error
    pub fn expire_next_replica_set_watch(&self) {
        *self.expire_next_rs_watch.lock().unwrap() = true;
    }

    /// Highest number of mutation calls seen in flight at once for an app
    pub fn max_concurrent_mutations(&self, app: &str) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(app)
            .copied()
            .unwrap_or(0)
    }

    pub fn replica_set(&self, namespace: &str, name: &str) -> Option<ReplicaSet> {
        let state = self.state.lock().unwrap();
        state.replica_sets.get(&key(namespace, name)).cloned()
    }

    pub fn replica_set_names(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .replica_sets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn service_names(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .services
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        let state = self.state.lock().unwrap();
        state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        let state = self.state.lock().unwrap();
        state.ingresses.get(&key(namespace, name)).cloned()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().unwrap().namespaces.iter().cloned().collect()
    }

    pub fn insert_secret(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        state.secrets.insert(key(namespace, name), secret);
    }

    /// Insert a replica-set as-is, without the simulated controller
    pub fn insert_replica_set(&self, namespace: &str, replica_set: ReplicaSet) {
        let mut state = self.state.lock().unwrap();
        let name = replica_set.metadata.name.clone().unwrap_or_default();
        state.replica_sets.insert(key(namespace, &name), replica_set);
    }

    /// Move every Pending pod in a namespace to Running
    pub fn start_pending_pods(&self, namespace: &str) {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<Key> = state
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace
                    && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending")
            })
            .map(|(k, _)| k.clone())
            .collect();

        for pod_key in pending {
            state.ip_counter += 1;
            let ip = format!("10.1.{}.{}", state.ip_counter / 250, state.ip_counter % 250 + 1);
            let version = state.next_version();
            let pod = state.pods.get_mut(&pod_key).expect("pod listed above");
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some(ip),
                ..Default::default()
            });
            pod.metadata.resource_version = Some(version.to_string());
            let pod = pod.clone();
            self.emit_pod(&mut state, version, namespace, WatchedEvent::Modified(pod));
        }
    }

    fn emit_pod(&self, state: &mut State, version: u64, namespace: &str, event: WatchedEvent<Pod>) {
        state
            .pod_events
            .push((version, namespace.to_string(), event.clone()));
        let _ = self.pod_tx.send((version, namespace.to_string(), event));
    }

    fn emit_rs(
        &self,
        state: &mut State,
        version: u64,
        namespace: &str,
        event: WatchedEvent<ReplicaSet>,
    ) {
        state
            .rs_events
            .push((version, namespace.to_string(), event.clone()));
        let _ = self.rs_tx.send((version, namespace.to_string(), event));
    }

    /// Create or remove pods until the replica-set's pod count matches its spec
    fn reconcile_pods(&self, state: &mut State, namespace: &str, rs_name: &str) {
        let desired = state
            .replica_sets
            .get(&key(namespace, rs_name))
            .map(super::desired_replicas)
            .unwrap_or(0);
        let template_labels = state
            .replica_sets
            .get(&key(namespace, rs_name))
            .and_then(|rs| rs.spec.as_ref())
            .and_then(|s| s.template.as_ref())
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();

        let owned: Vec<Key> = state
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && label(&pod.metadata, LABEL_NAME) == Some(rs_name)
            })
            .map(|(k, _)| k.clone())
            .collect();

        let current = owned.len() as i32;
        if current > desired {
            for pod_key in owned.iter().take((current - desired) as usize) {
                let version = state.next_version();
                if let Some(pod) = state.pods.remove(pod_key) {
                    self.emit_pod(state, version, namespace, WatchedEvent::Deleted(pod));
                }
            }
        }

        let startup = *self.startup.lock().unwrap();
        for _ in current..desired {
            state.pod_counter += 1;
            let pod_name = format!("{}-{}", rs_name, state.pod_counter);
            let version = state.next_version();
            let status = match startup {
                PodStartup::Running => {
                    state.ip_counter += 1;
                    PodStatus {
                        phase: Some("Running".to_string()),
                        pod_ip: Some(format!(
                            "10.1.{}.{}",
                            state.ip_counter / 250,
                            state.ip_counter % 250 + 1
                        )),
                        ..Default::default()
                    }
                }
                PodStartup::Pending => PodStatus {
                    phase: Some("Pending".to_string()),
                    ..Default::default()
                },
            };
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some(pod_name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(template_labels.clone()),
                    resource_version: Some(version.to_string()),
                    ..Default::default()
                },
                spec: None,
                status: Some(status),
            };
            state.pods.insert(key(namespace, &pod_name), pod.clone());
            self.emit_pod(state, version, namespace, WatchedEvent::Added(pod));
        }
    }

    /// Account one mutation against the owning app while it runs
    async fn track(&self, app: Option<String>) {
        let Some(app) = app else {
            return;
        };
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(app.clone()).or_insert(0);
            *count += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            let seen = max.entry(app.clone()).or_insert(0);
            *seen = (*seen).max(*count);
        }
        let delay = *self.mutation_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(&app) {
            *count -= 1;
        }
    }

    fn app_of<K>(map: &BTreeMap<Key, K>, namespace: &str, name: &str, meta: fn(&K) -> &ObjectMeta)
        -> Option<String>
    {
        map.get(&key(namespace, name))
            .and_then(|obj| label(meta(obj), LABEL_APP).map(|s| s.to_string()))
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn matches(meta: &ObjectMeta, selector: &[(String, String)]) -> bool {
    selector
        .iter()
        .all(|(k, v)| label(meta, k) == Some(v.as_str()))
}

fn not_found(kind: &'static str, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind,
        name: name.to_string(),
    }
}

/// Replay logged events after `from`, then follow the live channel
///
/// The receiver must be subscribed while the state lock is held so that no
/// event falls between the backlog and the live stream.
fn replay<K>(
    backlog: Vec<(u64, String, WatchedEvent<K>)>,
    rx: broadcast::Receiver<(u64, String, WatchedEvent<K>)>,
    namespace: String,
    selector: Vec<(String, String)>,
    meta: fn(&K) -> &ObjectMeta,
) -> EventStream<K>
where
    K: Clone + Send + Sync + 'static,
{
    let live = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    stream::iter(backlog)
        .chain(live)
        .filter(move |(_, ns, event)| {
            future::ready(*ns == namespace && matches(meta(event.object()), &selector))
        })
        .map(|(_, _, event)| Ok(event))
        .boxed()
}

fn pod_meta(pod: &Pod) -> &ObjectMeta {
    &pod.metadata
}

fn rs_meta(rs: &ReplicaSet) -> &ObjectMeta {
    &rs.metadata
}

fn svc_meta(svc: &Service) -> &ObjectMeta {
    &svc.metadata
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.state.lock().unwrap().namespaces.insert(name.to_string());
        Ok(())
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Snapshot<ReplicaSet>, ClusterError> {
        let selector = parse_selector(selector);
        let state = self.state.lock().unwrap();
        Ok(Snapshot {
            items: state
                .replica_sets
                .iter()
                .filter(|((ns, _), rs)| ns == namespace && matches(&rs.metadata, &selector))
                .map(|(_, rs)| rs.clone())
                .collect(),
            resource_version: state.resource_version.to_string(),
        })
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ClusterError> {
        Ok(self.replica_set(namespace, name))
    }

    async fn create_replica_set(
        &self,
        namespace: &str,
        replica_set: &ReplicaSet,
    ) -> Result<ReplicaSet, ClusterError> {
        self.track(label(&replica_set.metadata, LABEL_APP).map(|s| s.to_string()))
            .await;
        let name = replica_set.metadata.name.clone().unwrap_or_default();

        if std::mem::take(&mut *self.fail_next_replica_set_create.lock().unwrap()) {
            return Err(ClusterError::WatchFailed(format!(
                "injected failure creating ReplicaSet {}",
                name
            )));
        }

        let mut state = self.state.lock().unwrap();
        if state.replica_sets.contains_key(&key(namespace, &name)) {
            return Err(ClusterError::AlreadyExists {
                kind: "ReplicaSet",
                name,
            });
        }
        let version = state.next_version();
        let mut created = replica_set.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(version.to_string());
        state
            .replica_sets
            .insert(key(namespace, &name), created.clone());
        self.emit_rs(&mut state, version, namespace, WatchedEvent::Added(created.clone()));
        self.reconcile_pods(&mut state, namespace, &name);
        Ok(created)
    }

    async fn scale_replica_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<ReplicaSet, ClusterError> {
        let app = {
            let state = self.state.lock().unwrap();
            Self::app_of(&state.replica_sets, namespace, name, rs_meta)
        };
        self.track(app).await;

        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let scaled = {
            let rs = state
                .replica_sets
                .get_mut(&key(namespace, name))
                .ok_or_else(|| not_found("ReplicaSet", name))?;
            if let Some(spec) = rs.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
            rs.metadata.resource_version = Some(version.to_string());
            rs.clone()
        };
        self.emit_rs(&mut state, version, namespace, WatchedEvent::Modified(scaled.clone()));
        self.reconcile_pods(&mut state, namespace, name);
        Ok(scaled)
    }

    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let app = {
            let state = self.state.lock().unwrap();
            Self::app_of(&state.replica_sets, namespace, name, rs_meta)
        };
        self.track(app).await;

        let mut state = self.state.lock().unwrap();
        let removed = state
            .replica_sets
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("ReplicaSet", name))?;
        let version = state.next_version();
        self.emit_rs(&mut state, version, namespace, WatchedEvent::Deleted(removed));
        Ok(())
    }

    async fn watch_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<ReplicaSet>, ClusterError> {
        let from: u64 = resource_version.parse().unwrap_or(0);
        let state = self.state.lock().unwrap();
        let expired = std::mem::take(&mut *self.expire_next_rs_watch.lock().unwrap());
        if expired || from < state.rs_compacted_at {
            let err = ClusterError::WatchFailed(format!(
                "too old resource version: {} ({})",
                from, state.rs_compacted_at
            ));
            return Ok(stream::once(future::ready(Err(err))).boxed());
        }
        let rx = self.rs_tx.subscribe();
        let backlog = state
            .rs_events
            .iter()
            .filter(|(v, _, _)| *v > from)
            .cloned()
            .collect();
        Ok(replay(
            backlog,
            rx,
            namespace.to_string(),
            parse_selector(selector),
            rs_meta,
        ))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Snapshot<Pod>, ClusterError> {
        let selector = parse_selector(selector);
        let state = self.state.lock().unwrap();
        Ok(Snapshot {
            items: state
                .pods
                .iter()
                .filter(|((ns, _), pod)| ns == namespace && matches(&pod.metadata, &selector))
                .map(|(_, pod)| pod.clone())
                .collect(),
            resource_version: state.resource_version.to_string(),
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let app = {
            let state = self.state.lock().unwrap();
            Self::app_of(&state.pods, namespace, name, pod_meta)
        };
        self.track(app).await;

        let mut state = self.state.lock().unwrap();
        let removed = state
            .pods
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("Pod", name))?;
        let version = state.next_version();
        let owner = label(&removed.metadata, LABEL_NAME).map(|s| s.to_string());
        self.emit_pod(&mut state, version, namespace, WatchedEvent::Deleted(removed));

        // The owning replica-set replaces deleted pods
        if let Some(owner) = owner {
            if state.replica_sets.contains_key(&key(namespace, &owner)) {
                self.reconcile_pods(&mut state, namespace, &owner);
            }
        }
        Ok(())
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<Pod>, ClusterError> {
        let from: u64 = resource_version.parse().unwrap_or(0);
        let state = self.state.lock().unwrap();
        let rx = self.pod_tx.subscribe();
        let backlog = state
            .pod_events
            .iter()
            .filter(|(v, _, _)| *v > from)
            .cloned()
            .collect();
        Ok(replay(
            backlog,
            rx,
            namespace.to_string(),
            parse_selector(selector),
            pod_meta,
        ))
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Service>, ClusterError> {
        let selector = parse_selector(selector);
        let state = self.state.lock().unwrap();
        Ok(state
            .services
            .iter()
            .filter(|((ns, _), svc)| ns == namespace && matches(&svc.metadata, &selector))
            .map(|(_, svc)| svc.clone())
            .collect())
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state.services.get(&key(namespace, name)).cloned())
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        self.track(label(&service.metadata, LABEL_APP).map(|s| s.to_string()))
            .await;
        let name = service.metadata.name.clone().unwrap_or_default();

        if std::mem::take(&mut *self.fail_next_service_create.lock().unwrap()) {
            return Err(ClusterError::WatchFailed(format!(
                "injected failure creating Service {}",
                name
            )));
        }

        let mut state = self.state.lock().unwrap();
        if state.services.contains_key(&key(namespace, &name)) {
            return Err(ClusterError::AlreadyExists {
                kind: "Service",
                name,
            });
        }
        state.ip_counter += 1;
        let cluster_ip = format!("10.96.0.{}", state.ip_counter % 250 + 1);
        let mut created = service.clone();
        created.metadata.namespace = Some(namespace.to_string());
        if let Some(spec) = created.spec.as_mut() {
            if spec.cluster_ip.is_none() {
                spec.cluster_ip = Some(cluster_ip);
            }
        }
        state.services.insert(key(namespace, &name), created.clone());
        Ok(created)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let app = {
            let state = self.state.lock().unwrap();
            Self::app_of(&state.services, namespace, name, svc_meta)
        };
        self.track(app).await;

        if *self.fail_service_deletes.lock().unwrap() {
            return Err(ClusterError::WatchFailed(format!(
                "injected failure deleting service {}",
                name
            )));
        }
        let mut state = self.state.lock().unwrap();
        state
            .services
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("Service", name))
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state.secrets.get(&key(namespace, name)).cloned())
    }

    async fn get_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Ingress>, ClusterError> {
        Ok(self.ingress(namespace, name))
    }

    async fn list_ingresses(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Ingress>, ClusterError> {
        let selector = parse_selector(selector);
        let state = self.state.lock().unwrap();
        Ok(state
            .ingresses
            .iter()
            .filter(|((ns, _), ing)| ns == namespace && matches(&ing.metadata, &selector))
            .map(|(_, ing)| ing.clone())
            .collect())
    }

    async fn create_ingress(
        &self,
        namespace: &str,
        ingress: &Ingress,
    ) -> Result<Ingress, ClusterError> {
        let name = ingress.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if state.ingresses.contains_key(&key(namespace, &name)) {
            return Err(ClusterError::AlreadyExists {
                kind: "Ingress",
                name,
            });
        }
        state.ingresses.insert(key(namespace, &name), ingress.clone());
        Ok(ingress.clone())
    }

    async fn replace_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> Result<Ingress, ClusterError> {
        let mut state = self.state.lock().unwrap();
        let existing = state
            .ingresses
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("Ingress", name))?;
        *existing = ingress.clone();
        Ok(ingress.clone())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state
            .ingresses
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("Ingress", name))
    }
}
