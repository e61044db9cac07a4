//! Proxy backend management
//!
//! A frontend maps one public hostname to exactly one backend id; a backend
//! is a pool of endpoints for one application version. Two implementations
//! share the `ProxyBackend` contract:
//! - `KvProxy` writes routing records into the key-value store watched by the proxy
//! - `IngressProxy` renders one nginx Ingress per hostname
//!
//! Endpoint registration and frontend switching are separate writes. Callers
//! must register a version's endpoints before switching a frontend to it.

mod ingress;
mod kv;
mod status;

pub use ingress::IngressProxy;
pub use kv::KvProxy;
pub use status::StatusConfirmer;

use crate::cluster::ClusterError;
use crate::kv::KvError;
use crate::model::{backend_id, replica_set_name, Descriptor, HttpHeader};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Proxy store error: {0}")]
    Store(#[from] KvError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Corrupt proxy record at '{key}': {message}")]
    CorruptRecord { key: String, message: String },

    #[error("No frontend for hostname '{0}'")]
    FrontendNotFound(String),

    #[error("No TLS secret for '{hostname}' (tried: {})", .tried.join(", "))]
    TlsSecretNotFound { hostname: String, tried: Vec<String> },

    #[error("Proxy did not confirm backend pool '{pool}' within {timeout:?} (rolled back: {rolled_back})")]
    ConfirmationTimeout {
        pool: String,
        timeout: Duration,
        rolled_back: bool,
    },
}

/// Identifies one application version's backend pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRef {
    pub namespace: String,
    pub app_name: String,
    pub version: String,
}

impl BackendRef {
    pub fn new(
        namespace: impl Into<String>,
        app_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        BackendRef {
            namespace: namespace.into(),
            app_name: app_name.into(),
            version: version.into(),
        }
    }

    /// `{namespace}-{app}-{version}`
    pub fn id(&self) -> String {
        backend_id(&self.namespace, &self.app_name, &self.version)
    }

    /// Version Service carrying this backend's traffic
    pub fn service_name(&self) -> String {
        replica_set_name(&self.app_name, &self.version)
    }
}

/// One endpoint inside a backend pool
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackendServer {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "Port")]
    pub port: i32,
    #[serde(rename = "CompressionEnabled")]
    pub compression_enabled: bool,
}

/// Stored routing rule for a hostname
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Frontend {
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "BackendId")]
    pub backend_id: String,
}

/// Proxy behaviour requested by a descriptor for its public hostname
#[derive(Debug, Clone, PartialEq)]
pub struct FrontendSpec {
    pub hostname: String,
    pub namespace: String,
    pub app_name: String,
    /// Port of the version Service the proxy should target
    pub service_port: i32,
    pub use_compression: bool,
    pub sticky_sessions: bool,
    pub additional_headers: Vec<HttpHeader>,
    pub tls_secret_name: Option<String>,
    pub redirect_www: bool,
}

impl FrontendSpec {
    /// `None` when the descriptor declares no public hostname
    pub fn from_descriptor(descriptor: &Descriptor) -> Option<FrontendSpec> {
        let hostname = descriptor.frontend.clone()?;
        Some(FrontendSpec {
            hostname,
            namespace: descriptor.namespace.clone(),
            app_name: descriptor.app_name.clone(),
            service_port: descriptor.first_container_port().unwrap_or(80),
            use_compression: descriptor.use_compression,
            sticky_sessions: descriptor.sticky_sessions,
            additional_headers: descriptor.additional_headers.clone(),
            tls_secret_name: descriptor.tls_secret_name.clone(),
            redirect_www: descriptor.redirect_www,
        })
    }
}

#[async_trait]
pub trait ProxyBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn add_backend_server(
        &self,
        backend: &BackendRef,
        server: &BackendServer,
    ) -> Result<(), ProxyError>;

    async fn delete_backend_server(&self, backend: &BackendRef, ip: &str)
        -> Result<(), ProxyError>;

    /// Create the frontend for a hostname pointing at `backend`
    ///
    /// Idempotent: an existing frontend is left unmodified and its key returned.
    async fn create_frontend(
        &self,
        frontend: &FrontendSpec,
        backend: &BackendRef,
    ) -> Result<String, ProxyError>;

    async fn get_frontend(
        &self,
        namespace: &str,
        hostname: &str,
    ) -> Result<Option<Frontend>, ProxyError>;

    /// Point a hostname at `backend`, returning the previous backend id
    ///
    /// Read-modify-write; concurrent switches of one hostname are serialized
    /// by the caller's per-application lock, not here.
    async fn switch_backend(
        &self,
        namespace: &str,
        hostname: &str,
        backend: &BackendRef,
    ) -> Result<String, ProxyError>;

    /// Remove every endpoint registered for `backend`
    async fn delete_deployment(&self, backend: &BackendRef) -> Result<(), ProxyError>;

    /// Remove a hostname's frontend; missing is not an error
    async fn delete_frontend(&self, namespace: &str, hostname: &str) -> Result<(), ProxyError>;
}

/// Which proxy implementation the process drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Kv,
    Ingress,
}

impl std::str::FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kv" | "etcd" => Ok(ProxyKind::Kv),
            "ingress" | "nginx" => Ok(ProxyKind::Ingress),
            other => Err(format!("unknown proxy kind '{}'", other)),
        }
    }
}
