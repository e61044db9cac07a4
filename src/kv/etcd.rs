use super::{KeyValueStore, KvError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// etcd v2 error code for "key not found"
const ERROR_KEY_NOT_FOUND: u16 = 100;
/// etcd v2 error codes for "already exists" / "not a file" on create
const ERROR_NODE_EXISTS: u16 = 105;
const ERROR_NOT_A_FILE: u16 = 102;

/// `KeyValueStore` over the etcd v2 `/v2/keys` HTTP API
pub struct EtcdStore {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: EtcdNode,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u16,
}

impl EtcdStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build etcd HTTP client, using default");
                reqwest::Client::new()
            }
        };
        EtcdStore {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/v2/keys/{}", self.base_url, key.trim_start_matches('/'))
    }

    /// Turn a non-success response into `KvError`, returning the etcd error code if any
    async fn failure(response: reqwest::Response, key: &str) -> (Option<u16>, KvError) {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let code = serde_json::from_str::<EtcdErrorBody>(&body)
            .ok()
            .map(|b| b.error_code);
        (
            code,
            KvError::Status {
                status,
                key: key.to_string(),
                body: body.chars().take(200).collect(),
            },
        )
    }

    async fn fetch(&self, key: &str) -> Result<Option<EtcdNode>, KvError> {
        let response = self.client.get(self.url(key)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::failure(response, key).await.1);
        }
        let parsed: EtcdResponse = response.json().await.map_err(|e| KvError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(parsed.node))
    }
}

#[async_trait]
impl KeyValueStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .fetch(key)
            .await?
            .filter(|node| !node.dir)
            .and_then(|node| node.value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        debug!(key = %key, "etcd set");
        let response = self
            .client
            .put(self.url(key))
            .form(&[("value", value)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::failure(response, key).await.1);
        }
        Ok(())
    }

    async fn create(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let response = self
            .client
            .put(self.url(key))
            .query(&[("prevExist", "false")])
            .form(&[("value", value)])
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(true);
        }
        match Self::failure(response, key).await {
            (Some(ERROR_NODE_EXISTS), _) => Ok(false),
            (_, err) => Err(err),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        debug!(key = %key, "etcd delete");
        let response = self
            .client
            .delete(self.url(key))
            .query(&[("recursive", "true")])
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(true);
        }
        match Self::failure(response, key).await {
            (Some(ERROR_KEY_NOT_FOUND), _) => Ok(false),
            (_, err) => Err(err),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<(String, String)>, KvError> {
        let Some(node) = self.fetch(dir).await? else {
            return Ok(Vec::new());
        };
        Ok(node
            .nodes
            .into_iter()
            .filter(|child| !child.dir)
            .filter_map(|child| Some((child.key?, child.value?)))
            .collect())
    }

    async fn mkdir(&self, dir: &str) -> Result<(), KvError> {
        let response = self
            .client
            .put(self.url(dir))
            .query(&[("dir", "true"), ("prevExist", "false")])
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        match Self::failure(response, dir).await {
            (Some(ERROR_NODE_EXISTS), _) | (Some(ERROR_NOT_A_FILE), _) => Ok(()),
            (_, err) => Err(err),
        }
    }
}
