//! Deployment record persistence
//!
//! Records are keyed by namespace, application and deployment id so that
//! the history of one application can be listed without scanning others.

use crate::kv::{key_name, KeyValueStore, KvError};
use crate::model::Deployment;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

const DEPLOYMENTS_DIR: &str = "/cutover/deployments";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Deployment '{0}' not found")]
    NotFound(String),

    #[error("Deployment '{0}' already exists")]
    AlreadyExists(String),

    #[error("Registry store error: {0}")]
    Kv(#[from] KvError),

    #[error("Corrupt deployment record at '{key}': {message}")]
    Corrupt { key: String, message: String },
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn create(&self, deployment: &Deployment) -> Result<(), StoreError>;

    async fn update(&self, deployment: &Deployment) -> Result<(), StoreError>;

    async fn get_by_id(
        &self,
        namespace: &str,
        app_name: &str,
        id: &str,
    ) -> Result<Option<Deployment>, StoreError>;

    /// Every readable record of an application, oldest first
    ///
    /// Records that fail to decode are skipped with a warning.
    async fn list_by_app(
        &self,
        namespace: &str,
        app_name: &str,
    ) -> Result<Vec<Deployment>, StoreError>;

    /// Ids of every record of an application, readable or not
    async fn list_ids(&self, namespace: &str, app_name: &str) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, namespace: &str, app_name: &str, id: &str) -> Result<(), StoreError>;
}

/// `DeploymentStore` on top of the shared key-value store
pub struct KvDeploymentStore {
    store: Arc<dyn KeyValueStore>,
}

impl KvDeploymentStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        KvDeploymentStore { store }
    }

    fn app_dir(namespace: &str, app_name: &str) -> String {
        format!("{}/{}/{}", DEPLOYMENTS_DIR, namespace, app_name)
    }

    fn key(namespace: &str, app_name: &str, id: &str) -> String {
        format!("{}/{}", Self::app_dir(namespace, app_name), id)
    }

    fn key_of(deployment: &Deployment) -> String {
        Self::key(deployment.namespace(), deployment.app_name(), &deployment.id)
    }

    fn encode(key: &str, deployment: &Deployment) -> Result<String, StoreError> {
        serde_json::to_string(deployment).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    fn decode(key: &str, raw: &str) -> Result<Deployment, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl DeploymentStore for KvDeploymentStore {
    async fn create(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let key = Self::key_of(deployment);
        if !self
            .store
            .create(&key, &Self::encode(&key, deployment)?)
            .await?
        {
            return Err(StoreError::AlreadyExists(deployment.id.clone()));
        }
        Ok(())
    }

    async fn update(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let key = Self::key_of(deployment);
        if self.store.get(&key).await?.is_none() {
            return Err(StoreError::NotFound(deployment.id.clone()));
        }
        self.store
            .set(&key, &Self::encode(&key, deployment)?)
            .await?;
        Ok(())
    }

    async fn get_by_id(
        &self,
        namespace: &str,
        app_name: &str,
        id: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let key = Self::key(namespace, app_name, id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(Self::decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    async fn list_by_app(
        &self,
        namespace: &str,
        app_name: &str,
    ) -> Result<Vec<Deployment>, StoreError> {
        let mut deployments: Vec<Deployment> = self
            .store
            .list(&Self::app_dir(namespace, app_name))
            .await?
            .iter()
            .filter_map(|(key, raw)| match Self::decode(key, raw) {
                Ok(deployment) => Some(deployment),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable deployment record");
                    None
                }
            })
            .collect();
        deployments.sort_by_key(|d| d.created);
        Ok(deployments)
    }

    async fn list_ids(&self, namespace: &str, app_name: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .list(&Self::app_dir(namespace, app_name))
            .await?
            .iter()
            .map(|(key, _)| key_name(key).to_string())
            .collect())
    }

    async fn delete(&self, namespace: &str, app_name: &str, id: &str) -> Result<(), StoreError> {
        if !self.store.delete(&Self::key(namespace, app_name, id)).await? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
