//! Shared rollout fixtures for strategy and coordinator tests

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::RolloutContext;
use crate::cluster::mock::MockCluster;
use crate::controller::health_check::MockHealthProbe;
use crate::controller::progress::RecordingProgress;
use crate::controller::replicaset::{LifecycleConfig, ReplicaLifecycle};
use crate::kv::MemoryStore;
use crate::model::{Descriptor, HealthCheck};
use crate::proxy::{KvProxy, ProxyBackend};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec};
use std::sync::Arc;
use std::time::Duration;

pub const HOST: &str = "shop.example.com";

pub struct Harness {
    pub cluster: Arc<MockCluster>,
    pub store: Arc<MemoryStore>,
    pub proxy: Arc<KvProxy>,
    pub probe: Arc<MockHealthProbe>,
    pub lifecycle: Arc<ReplicaLifecycle>,
    pub progress: Arc<RecordingProgress>,
}

impl Harness {
    pub fn new(probe: MockHealthProbe) -> Self {
        Self::with_config(probe, LifecycleConfig::default())
    }

    pub fn with_config(probe: MockHealthProbe, config: LifecycleConfig) -> Self {
        let cluster = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryStore::new());
        let proxy = Arc::new(KvProxy::new(store.clone()));
        let probe = Arc::new(probe);
        let lifecycle = Arc::new(ReplicaLifecycle::new(
            cluster.clone(),
            proxy.clone(),
            probe.clone(),
            config,
        ));
        Harness {
            cluster,
            store,
            proxy,
            probe,
            lifecycle,
            progress: Arc::new(RecordingProgress::default()),
        }
    }

    pub fn context(&self, descriptor: Descriptor, version: &str) -> RolloutContext {
        RolloutContext {
            descriptor,
            version: version.to_string(),
            lifecycle: self.lifecycle.clone(),
            progress: self.progress.clone(),
            proxy_reload: Duration::ZERO,
        }
    }

    /// Create a version's Service and replica-set without any gating
    pub async fn seed_version(&self, descriptor: &Descriptor, version: &str) {
        self.lifecycle
            .create_service(descriptor, version)
            .await
            .unwrap();
        self.lifecycle
            .create_replica_set(descriptor, version)
            .await
            .unwrap();
    }

    /// Backend id the hostname currently routes to
    pub async fn routed_backend(&self) -> Option<String> {
        self.proxy
            .get_frontend("prod", HOST)
            .await
            .unwrap()
            .map(|f| f.backend_id)
    }

    pub async fn backend_servers(&self, backend_id: &str) -> usize {
        use crate::kv::KeyValueStore;
        self.store
            .list(&format!("/proxy/backends/{}", backend_id))
            .await
            .unwrap()
            .len()
    }
}

/// `shop` in `prod` on port 8080 with a health check and a public hostname
pub fn descriptor(replicas: i32) -> Descriptor {
    Descriptor {
        id: "d".to_string(),
        app_name: "shop".to_string(),
        namespace: "prod".to_string(),
        replicas,
        version: "auto".to_string(),
        pod_spec: PodSpec {
            containers: vec![Container {
                name: "shop".to_string(),
                image: Some("shop:1".to_string()),
                ports: Some(vec![ContainerPort {
                    container_port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        },
        frontend: Some(HOST.to_string()),
        health_check: Some(HealthCheck::default()),
        ..Default::default()
    }
}
