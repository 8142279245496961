//! Resource graph deployment for kroforge.
//!
//! Provides:
//! - `KubeClusterClient`, the kube-rs backed cluster client
//! - `ReferenceResolver` for cross-resource placeholders
//! - `ReadinessRegistry` and the readiness poller
//! - `DeploymentEngine` with direct and controller backends
//! - Rollback and the cluster `EventMonitor`

pub mod controller;
pub mod engine;
pub mod events;
pub mod kubernetes;
pub mod readiness;
pub mod resolver;
pub mod rollback;

#[cfg(test)]
mod testing;

pub use engine::DeploymentEngine;
pub use events::EventMonitor;
pub use kubernetes::KubeClusterClient;
pub use readiness::ReadinessRegistry;
pub use resolver::ReferenceResolver;
pub use rollback::rollback_resources;

pub use kroforge_core::deployment::{
    DeploymentEvent, DeploymentMode, DeploymentOptions, DeploymentResult, DeploymentStatus,
    EngineSettings,
};
