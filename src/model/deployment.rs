use super::descriptor::Descriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single rollout attempt
///
/// DEPLOYING → DEPLOYED | FAILURE, and DEPLOYED → UNDEPLOYING → UNDEPLOYED | FAILURE.
/// A newer successful deployment demotes older DEPLOYED records to UNDEPLOYED.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentStatus {
    Deploying,
    Deployed,
    Undeploying,
    Undeployed,
    Failure,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Deploying => "DEPLOYING",
            DeploymentStatus::Deployed => "DEPLOYED",
            DeploymentStatus::Undeploying => "UNDEPLOYING",
            DeploymentStatus::Undeployed => "UNDEPLOYED",
            DeploymentStatus::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// One rollout attempt of a descriptor
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub descriptor: Descriptor,
    /// Resolved version; equals the descriptor's version unless auto-versioned
    pub version: String,
    pub status: DeploymentStatus,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    /// Append-only progress lines for operators
    #[serde(default)]
    pub log: Vec<String>,
}

impl Deployment {
    /// Start a new attempt in DEPLOYING
    pub fn new(descriptor: Descriptor, now: DateTime<Utc>) -> Self {
        Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            version: descriptor.version.clone(),
            descriptor,
            status: DeploymentStatus::Deploying,
            created: now,
            last_modified: now,
            log: Vec::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.descriptor.namespace
    }

    pub fn app_name(&self) -> &str {
        &self.descriptor.app_name
    }

    pub fn append_log(&mut self, line: impl Into<String>, now: DateTime<Utc>) {
        self.log.push(format!("{} {}", now.to_rfc3339(), line.into()));
        self.last_modified = now;
    }

    pub fn set_status(&mut self, status: DeploymentStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_modified = now;
    }

    /// Proxy backend id of this attempt's version
    pub fn backend_id(&self) -> String {
        backend_id(self.namespace(), self.app_name(), &self.version)
    }
}

/// Backend pool identifier: `{namespace}-{app}-{version}`
pub fn backend_id(namespace: &str, app_name: &str, version: &str) -> String {
    format!("{}-{}-{}", namespace, app_name, version)
}

/// Replica-set and version Service name: `{app}-{version}`
pub fn replica_set_name(app_name: &str, version: &str) -> String {
    format!("{}-{}", app_name, version)
}
