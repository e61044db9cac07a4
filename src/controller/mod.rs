//! Rollout orchestration
//!
//! The `Deployer` serializes work per application and drives one of the
//! strategies; strategies use the replica lifecycle, the pod watch and the
//! proxy backend to move traffic to a new version.

pub mod clock;
pub mod coordinator;
pub mod health_check;
pub mod lock;
pub mod pod_watch;
pub mod progress;
pub mod race;
pub mod replicaset;
pub mod strategies;

pub use coordinator::{DeployError, Deployer};
pub use replicaset::{LifecycleConfig, LifecycleError, ReplicaLifecycle};
