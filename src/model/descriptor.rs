use k8s_openapi::api::core::v1::PodSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Version sentinel asking the deployer to compute the next version
pub const AUTO_VERSION: &str = "auto";

/// Default path polled on each pod when health checks are enabled
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "health";

/// Rejected descriptor, surfaced to callers before any cluster mutation
#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid descriptor: {0}")]
pub struct ValidationError(pub String);

/// Application descriptor
///
/// Immutable per version. Versions of the same application share
/// `appName` + `namespace`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Opaque identifier, generated when the caller leaves it empty
    #[serde(default)]
    pub id: String,

    pub app_name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Desired replica count for the new version
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Target version, or `"auto"` to derive it from the active replica-set
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub deployment_type: DeploymentType,

    /// Pod template for every replica of this version
    pub pod_spec: PodSpec,

    /// Public hostname routed through the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,

    #[serde(default)]
    pub use_compression: bool,

    #[serde(default)]
    pub sticky_sessions: bool,

    /// Extra response headers added by the proxy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_headers: Vec<HttpHeader>,

    /// Secret holding the certificate for `frontend` (ingress proxy only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,

    /// Redirect `www.<frontend>` to `<frontend>` (ingress proxy only)
    #[serde(default)]
    pub redirect_www: bool,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_replicas() -> i32 {
    1
}

fn default_version() -> String {
    AUTO_VERSION.to_string()
}

/// Rollout algorithm requested by the descriptor
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeploymentType {
    #[default]
    #[serde(rename = "blue-green")]
    BlueGreen,
    #[serde(rename = "rolling")]
    Rolling,
    #[serde(rename = "redeploy")]
    Redeploy,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::BlueGreen => "blue-green",
            DeploymentType::Rolling => "rolling",
            DeploymentType::Redeploy => "redeploy",
        }
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-pod health check configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Path on the pod, without leading slash (default: `health`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Container port to probe (default: first declared container port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(default, rename = "type")]
    pub check_type: HealthCheckType,
}

/// How a health response is interpreted
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    /// JSON body `{"healthy": true}`
    #[default]
    Probe,
    /// Any 2xx response
    Simple,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HttpHeader {
    pub header: String,
    pub value: String,
}

impl Descriptor {
    /// Parse, normalize and validate a descriptor submitted as JSON
    ///
    /// Unknown deployment types fail here, not during dispatch.
    pub fn from_json(json: &str) -> Result<Descriptor, ValidationError> {
        let mut descriptor: Descriptor =
            serde_json::from_str(json).map_err(|e| ValidationError(e.to_string()))?;
        descriptor.normalize();
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Fill generated and defaulted fields
    pub fn normalize(&mut self) {
        self.app_name = self.app_name.trim().to_string();
        self.namespace = self.namespace.trim().to_string();
        if self.namespace.is_empty() {
            self.namespace = default_namespace();
        }
        self.version = self.version.trim().to_string();
        if self.version.is_empty() {
            self.version = default_version();
        }
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        self.frontend = self
            .frontend
            .take()
            .map(|f| f.trim().to_ascii_lowercase())
            .filter(|f| !f.is_empty());
    }

    /// Validate constraints the JSON shape cannot express
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_dns_label(&self.app_name) {
            return Err(ValidationError(format!(
                "appName must be a lowercase DNS label, got '{}'",
                self.app_name
            )));
        }

        if !is_dns_label(&self.namespace) {
            return Err(ValidationError(format!(
                "namespace must be a lowercase DNS label, got '{}'",
                self.namespace
            )));
        }

        if self.replicas < 0 {
            return Err(ValidationError(format!(
                "replicas must be >= 0, got {}",
                self.replicas
            )));
        }

        if !self.is_auto_version() && !is_dns_label(&self.version) {
            return Err(ValidationError(format!(
                "version must be '{}' or a DNS label, got '{}'",
                AUTO_VERSION, self.version
            )));
        }

        if self.pod_spec.containers.is_empty() {
            return Err(ValidationError(
                "podSpec must declare at least one container".to_string(),
            ));
        }

        if let Some(frontend) = &self.frontend {
            if frontend.contains("://") || frontend.contains('/') || frontend.contains(' ') {
                return Err(ValidationError(format!(
                    "frontend must be a bare hostname, got '{}'",
                    frontend
                )));
            }
        }

        if let Some(health_check) = &self.health_check {
            if let Some(port) = health_check.port {
                if !(1..=65535).contains(&port) {
                    return Err(ValidationError(format!(
                        "healthCheck.port must be 1-65535, got {}",
                        port
                    )));
                }
            } else if self.first_container_port().is_none() {
                return Err(ValidationError(
                    "healthCheck requires a port: none given and no container port declared"
                        .to_string(),
                ));
            }
        }

        for (i, header) in self.additional_headers.iter().enumerate() {
            if header.header.trim().is_empty() {
                return Err(ValidationError(format!(
                    "additionalHeaders[{}].header cannot be empty",
                    i
                )));
            }
        }

        Ok(())
    }

    pub fn is_auto_version(&self) -> bool {
        self.version.is_empty() || self.version == AUTO_VERSION
    }

    /// Key used for per-application mutual exclusion
    pub fn lock_key(&self) -> String {
        format!("{}-{}", self.namespace, self.app_name)
    }

    /// All container ports declared across the pod spec, in declaration order
    pub fn container_ports(&self) -> Vec<i32> {
        self.pod_spec
            .containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .map(|p| p.container_port)
            .collect()
    }

    pub fn first_container_port(&self) -> Option<i32> {
        self.container_ports().first().copied()
    }

    /// Port and path probed on each pod, if health checks are enabled
    pub fn health_check_target(&self) -> Option<(i32, String, HealthCheckType)> {
        let health_check = self.health_check.as_ref()?;
        let port = health_check.port.or_else(|| self.first_container_port())?;
        let path = health_check
            .path
            .as_deref()
            .unwrap_or(DEFAULT_HEALTH_CHECK_PATH)
            .trim_start_matches('/')
            .to_string();
        Some((port, path, health_check.check_type))
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends
fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

#[cfg(test)]
#[path = "descriptor_test.rs"]
mod tests;
