use super::{BackendRef, BackendServer, Frontend, FrontendSpec, ProxyBackend, ProxyError};
use crate::kv::KeyValueStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

const BACKENDS_DIR: &str = "/proxy/backends";
const FRONTENDS_DIR: &str = "/proxy/frontends";
const FRONTEND_KIND: &str = "http";

/// Proxy driven by records in the key-value store
///
/// `/proxy/backends/{backendId}/{ip}` → `{IPAddress, Port, CompressionEnabled}`
/// `/proxy/frontends/{hostname}` → `{Hostname, Type, BackendId}`
///
/// Frontends are global per hostname, so the namespace argument is unused here.
/// There is no post-switch confirmation: the write to the store is the cutover.
pub struct KvProxy {
    store: Arc<dyn KeyValueStore>,
}

impl KvProxy {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        KvProxy { store }
    }

    fn frontend_key(hostname: &str) -> String {
        format!("{}/{}", FRONTENDS_DIR, hostname)
    }

    fn backend_dir(backend: &BackendRef) -> String {
        format!("{}/{}", BACKENDS_DIR, backend.id())
    }

    async fn read_frontend(&self, hostname: &str) -> Result<Option<Frontend>, ProxyError> {
        let key = Self::frontend_key(hostname);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ProxyError::CorruptRecord {
                key,
                message: e.to_string(),
            })
    }
}

fn encode<T: serde::Serialize>(key: &str, value: &T) -> Result<String, ProxyError> {
    serde_json::to_string(value).map_err(|e| ProxyError::CorruptRecord {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl ProxyBackend for KvProxy {
    fn name(&self) -> &'static str {
        "kv"
    }

    async fn add_backend_server(
        &self,
        backend: &BackendRef,
        server: &BackendServer,
    ) -> Result<(), ProxyError> {
        self.store.mkdir(BACKENDS_DIR).await?;
        let dir = Self::backend_dir(backend);
        self.store.mkdir(&dir).await?;

        let key = format!("{}/{}", dir, server.ip_address);
        self.store.set(&key, &encode(&key, server)?).await?;
        debug!(backend = %backend.id(), ip = %server.ip_address, port = server.port, "Registered backend server");
        Ok(())
    }

    async fn delete_backend_server(
        &self,
        backend: &BackendRef,
        ip: &str,
    ) -> Result<(), ProxyError> {
        let key = format!("{}/{}", Self::backend_dir(backend), ip);
        self.store.delete(&key).await?;
        Ok(())
    }

    async fn create_frontend(
        &self,
        frontend: &FrontendSpec,
        backend: &BackendRef,
    ) -> Result<String, ProxyError> {
        self.store.mkdir(FRONTENDS_DIR).await?;
        let key = Self::frontend_key(&frontend.hostname);
        let record = Frontend {
            hostname: frontend.hostname.clone(),
            kind: FRONTEND_KIND.to_string(),
            backend_id: backend.id(),
        };

        if self.store.create(&key, &encode(&key, &record)?).await? {
            info!(hostname = %frontend.hostname, backend = %record.backend_id, "Created frontend");
        } else {
            debug!(hostname = %frontend.hostname, "Frontend already exists, leaving it unchanged");
        }
        Ok(key)
    }

    async fn get_frontend(
        &self,
        _namespace: &str,
        hostname: &str,
    ) -> Result<Option<Frontend>, ProxyError> {
        self.read_frontend(hostname).await
    }

    async fn switch_backend(
        &self,
        _namespace: &str,
        hostname: &str,
        backend: &BackendRef,
    ) -> Result<String, ProxyError> {
        let mut frontend = self
            .read_frontend(hostname)
            .await?
            .ok_or_else(|| ProxyError::FrontendNotFound(hostname.to_string()))?;

        let previous = std::mem::replace(&mut frontend.backend_id, backend.id());
        let key = Self::frontend_key(hostname);
        self.store.set(&key, &encode(&key, &frontend)?).await?;

        info!(hostname = %hostname, from = %previous, to = %frontend.backend_id, "Switched frontend backend");
        Ok(previous)
    }

    async fn delete_deployment(&self, backend: &BackendRef) -> Result<(), ProxyError> {
        if self.store.delete(&Self::backend_dir(backend)).await? {
            debug!(backend = %backend.id(), "Removed backend registrations");
        }
        Ok(())
    }

    async fn delete_frontend(&self, _namespace: &str, hostname: &str) -> Result<(), ProxyError> {
        self.store.delete(&Self::frontend_key(hostname)).await?;
        Ok(())
    }
}
