//! Application descriptors and deployment records
//!
//! A `Descriptor` is what callers submit; a `Deployment` is one rollout
//! attempt of a descriptor, persisted by the registry.

pub mod deployment;
pub mod descriptor;

pub use deployment::{backend_id, replica_set_name, Deployment, DeploymentStatus};
pub use descriptor::{
    DeploymentType, Descriptor, HealthCheck, HealthCheckType, HttpHeader, ValidationError,
    AUTO_VERSION,
};
