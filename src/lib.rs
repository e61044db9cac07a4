//! cutover: zero-downtime application rollouts on Kubernetes
//!
//! Deploys versioned replica-sets behind a reverse proxy using blue-green,
//! rolling or redeploy strategies, gating every traffic switch on pod health.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod kv;
pub mod model;
pub mod proxy;
pub mod registry;
pub mod server;
