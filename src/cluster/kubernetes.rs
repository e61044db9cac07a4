use super::{ClusterClient, ClusterError, EventStream, Snapshot, WatchedEvent};
use async_trait::async_trait;
use futures::{future, StreamExt};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

/// `ClusterClient` backed by the Kubernetes API via kube-rs
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
}

impl KubeClusterClient {
    pub fn new(client: kube::Client) -> Self {
        KubeClusterClient { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Translate 404/409 into typed errors, everything else passes through
fn classify(err: kube::Error, kind: &'static str, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(ref api) if api.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ref api) if api.code == 409 => ClusterError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        other => ClusterError::KubeError(other),
    }
}

fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or("<unnamed>")
}

async fn watch_events<K>(
    api: Api<K>,
    selector: &str,
    resource_version: &str,
) -> Result<EventStream<K>, ClusterError>
where
    K: Clone + DeserializeOwned + Debug + Send + 'static,
{
    let params = WatchParams::default().labels(selector);
    let stream = api.watch(&params, resource_version).await?;

    Ok(stream
        .filter_map(|event| {
            future::ready(match event {
                Ok(WatchEvent::Added(obj)) => Some(Ok(WatchedEvent::Added(obj))),
                Ok(WatchEvent::Modified(obj)) => Some(Ok(WatchedEvent::Modified(obj))),
                Ok(WatchEvent::Deleted(obj)) => Some(Ok(WatchedEvent::Deleted(obj))),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(e)) => Some(Err(ClusterError::WatchFailed(format!("{:?}", e)))),
                Err(e) => Some(Err(ClusterError::KubeError(e))),
            })
        })
        .boxed())
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn ensure_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await?.is_some() {
            return Ok(());
        }
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = %name, "Created namespace");
                Ok(())
            }
            // Lost a race with another creator
            Err(kube::Error::Api(ref e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Snapshot<ReplicaSet>, ClusterError> {
        let api: Api<ReplicaSet> = self.api(namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(Snapshot {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ClusterError> {
        let api: Api<ReplicaSet> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_replica_set(
        &self,
        namespace: &str,
        replica_set: &ReplicaSet,
    ) -> Result<ReplicaSet, ClusterError> {
        let api: Api<ReplicaSet> = self.api(namespace);
        let name = object_name(&replica_set.metadata);
        debug!(namespace = %namespace, replicaset = %name, "Creating ReplicaSet");
        api.create(&PostParams::default(), replica_set)
            .await
            .map_err(|e| classify(e, "ReplicaSet", name))
    }

    async fn scale_replica_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<ReplicaSet, ClusterError> {
        let api: Api<ReplicaSet> = self.api(namespace);
        let scale_patch = serde_json::json!({
            "spec": {
                "replicas": replicas
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&scale_patch))
            .await
            .map_err(|e| classify(e, "ReplicaSet", name))
    }

    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<ReplicaSet> = self.api(namespace);
        api.delete(name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, "ReplicaSet", name))?;
        Ok(())
    }

    async fn watch_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<ReplicaSet>, ClusterError> {
        watch_events(self.api(namespace), selector, resource_version).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Snapshot<Pod>, ClusterError> {
        let api: Api<Pod> = self.api(namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(Snapshot {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Pod> = self.api(namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, "Pod", name))?;
        Ok(())
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<Pod>, ClusterError> {
        watch_events(self.api(namespace), selector, resource_version).await
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Service>, ClusterError> {
        let api: Api<Service> = self.api(namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClusterError> {
        let api: Api<Service> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let api: Api<Service> = self.api(namespace);
        let name = object_name(&service.metadata);
        api.create(&PostParams::default(), service)
            .await
            .map_err(|e| classify(e, "Service", name))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Service> = self.api(namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, "Service", name))?;
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        let api: Api<Secret> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Ingress>, ClusterError> {
        let api: Api<Ingress> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_ingresses(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Ingress>, ClusterError> {
        let api: Api<Ingress> = self.api(namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn create_ingress(
        &self,
        namespace: &str,
        ingress: &Ingress,
    ) -> Result<Ingress, ClusterError> {
        let api: Api<Ingress> = self.api(namespace);
        let name = object_name(&ingress.metadata);
        api.create(&PostParams::default(), ingress)
            .await
            .map_err(|e| classify(e, "Ingress", name))
    }

    async fn replace_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> Result<Ingress, ClusterError> {
        let api: Api<Ingress> = self.api(namespace);
        api.replace(name, &PostParams::default(), ingress)
            .await
            .map_err(|e| classify(e, "Ingress", name))
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Ingress> = self.api(namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, "Ingress", name))?;
        Ok(())
    }
}
