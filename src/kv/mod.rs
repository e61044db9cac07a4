//! Hierarchical key-value store shared by the kv proxy and the deployment registry
//!
//! Keys are slash-separated paths (`/proxy/frontends/shop.example.com`).
//! Directories are implicit for writes but can be created explicitly with `mkdir`.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("Key-value store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Key-value store returned HTTP {status} for '{key}': {body}")]
    Status {
        status: u16,
        key: String,
        body: String,
    },

    #[error("Failed to decode key-value response for '{key}': {message}")]
    Decode { key: String, message: String },
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value of a leaf key, `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write a leaf key, creating missing parent directories
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Write a leaf key only if it is absent; returns whether it was written
    async fn create(&self, key: &str, value: &str) -> Result<bool, KvError>;

    /// Remove a key or a whole directory; returns whether anything was removed
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Leaf entries directly under a directory as `(key, value)`, empty if absent
    async fn list(&self, dir: &str) -> Result<Vec<(String, String)>, KvError>;

    /// Create a directory if absent; an existing directory is not an error
    async fn mkdir(&self, dir: &str) -> Result<(), KvError>;
}

/// Last path segment of a key
pub fn key_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
