//! Deployment options, results and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::DeploymentId;
use crate::cluster::ClusterEvent;
use crate::readiness::ReadinessResult;
use crate::resource::{DeployedResource, ResourceStatus};
use crate::rollback::{RollbackConfig, RollbackResult, RollbackStatus};

/// Which backend applies the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Apply every resource individually.
    #[default]
    Direct,
    /// Hand the whole graph to a cluster-side controller through one instance.
    Controller,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::Direct => write!(f, "direct"),
            DeploymentMode::Controller => write!(f, "controller"),
        }
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(DeploymentMode::Direct),
            "controller" | "kro" => Ok(DeploymentMode::Controller),
            other => Err(format!("unknown deployment mode: {other}")),
        }
    }
}

/// Retry behaviour for transient API errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * exp) as u128;
        Duration::from_millis(millis.min(self.max_delay.as_millis()) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// When a deployment rolls back what it applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// Leave everything in place.
    #[default]
    Never,
    /// Roll back when nothing succeeded.
    Failure,
    /// Roll back whenever anything failed.
    PartialOrFailure,
}

impl RollbackTrigger {
    pub fn applies_to(self, status: DeploymentStatus) -> bool {
        match self {
            RollbackTrigger::Never => false,
            RollbackTrigger::Failure => status == DeploymentStatus::Failed,
            RollbackTrigger::PartialOrFailure => status != DeploymentStatus::Success,
        }
    }
}

/// Configuration for one `deploy()` call.
#[derive(Debug, Clone)]
pub struct DeploymentOptions {
    pub mode: DeploymentMode,
    /// Namespace for namespaced resources that don't name one.
    pub namespace: String,
    /// Overall budget for the call; cancels in-flight work when it elapses.
    pub timeout: Duration,
    pub wait_for_ready: bool,
    /// Defaults to [`RetryPolicy::default`] when unset.
    pub retry_policy: Option<RetryPolicy>,
    pub progress: Option<mpsc::UnboundedSender<DeploymentEvent>>,
    pub rollback_on: RollbackTrigger,
    pub rollback: RollbackConfig,
    /// Cancelling this token aborts the deployment.
    pub cancellation: CancellationToken,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Direct,
            namespace: "default".to_string(),
            timeout: Duration::from_secs(300),
            wait_for_ready: true,
            retry_policy: None,
            progress: None,
            rollback_on: RollbackTrigger::Never,
            rollback: RollbackConfig::default(),
            cancellation: CancellationToken::new(),
        }
    }
}

impl DeploymentOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }

    /// Send a progress event, ignoring a closed receiver.
    pub fn emit(&self, event: DeploymentEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }
}

/// Engine-wide settings shared by every deployment it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Budget for a CRD to report `Established`.
    pub crd_establishment_timeout: Duration,
    /// Upper bound on resources dispatched at once within a level.
    pub max_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            crd_establishment_timeout: Duration::from_secs(60),
            max_concurrency: 8,
        }
    }
}

/// Overall outcome of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Success,
    Partial,
    Failed,
}

impl DeploymentStatus {
    /// Aggregate from counts of succeeded resources.
    pub fn from_counts(succeeded: usize, total: usize) -> Self {
        if succeeded == total {
            DeploymentStatus::Success
        } else if succeeded > 0 {
            DeploymentStatus::Partial
        } else {
            DeploymentStatus::Failed
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStatus::Success => write!(f, "success"),
            DeploymentStatus::Partial => write!(f, "partial"),
            DeploymentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Where in a resource's lifecycle an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Validation,
    Dependency,
    Resolution,
    Deployment,
    Establishment,
    Readiness,
    StatusHydration,
    Rollback,
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentPhase::Validation => "validation",
            DeploymentPhase::Dependency => "dependency",
            DeploymentPhase::Resolution => "resolution",
            DeploymentPhase::Deployment => "deployment",
            DeploymentPhase::Establishment => "establishment",
            DeploymentPhase::Readiness => "readiness",
            DeploymentPhase::StatusHydration => "status_hydration",
            DeploymentPhase::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// An error attributed to one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceError {
    pub resource_id: String,
    pub phase: DeploymentPhase,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl ResourceError {
    pub fn new(
        resource_id: impl Into<String>,
        phase: DeploymentPhase,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            phase,
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of one `deploy()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    /// Applied resources, in the order they were applied.
    pub resources: Vec<DeployedResource>,
    pub errors: Vec<ResourceError>,
    pub duration: Duration,
    /// Hydrated graph status, when the graph declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_status: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackResult>,
}

impl DeploymentResult {
    pub fn resource(&self, id: &str) -> Option<&DeployedResource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn errors_for(&self, id: &str) -> Vec<&ResourceError> {
        self.errors.iter().filter(|e| e.resource_id == id).collect()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for e in &self.errors {
            if e.phase != DeploymentPhase::StatusHydration && !ids.contains(&e.resource_id.as_str())
            {
                ids.push(&e.resource_id);
            }
        }
        ids
    }
}

/// Progress reported while a deployment runs.
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    Started {
        deployment_id: DeploymentId,
        graph: String,
        resources: usize,
    },
    ResourceStatusChanged {
        resource_id: String,
        status: ResourceStatus,
    },
    ReadinessPolled {
        resource_id: String,
        attempt: u32,
        result: ReadinessResult,
    },
    Retrying {
        resource_id: String,
        attempt: u32,
        error: String,
    },
    ResourceFailed {
        resource_id: String,
        phase: DeploymentPhase,
        error: String,
    },
    ClusterEvent {
        resource_id: String,
        event: ClusterEvent,
    },
    RollbackStarted {
        resources: usize,
    },
    ResourceRolledBack {
        resource_id: String,
    },
    RollbackCompleted {
        status: RollbackStatus,
    },
    Completed {
        deployment_id: DeploymentId,
        status: DeploymentStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(9), Duration::from_millis(350));
    }

    #[test]
    fn test_status_from_counts() {
        assert_eq!(DeploymentStatus::from_counts(3, 3), DeploymentStatus::Success);
        assert_eq!(DeploymentStatus::from_counts(1, 3), DeploymentStatus::Partial);
        assert_eq!(DeploymentStatus::from_counts(0, 3), DeploymentStatus::Failed);
        assert_eq!(DeploymentStatus::from_counts(0, 0), DeploymentStatus::Success);
    }

    #[test]
    fn test_rollback_trigger() {
        assert!(!RollbackTrigger::Never.applies_to(DeploymentStatus::Failed));
        assert!(RollbackTrigger::Failure.applies_to(DeploymentStatus::Failed));
        assert!(!RollbackTrigger::Failure.applies_to(DeploymentStatus::Partial));
        assert!(RollbackTrigger::PartialOrFailure.applies_to(DeploymentStatus::Partial));
        assert!(!RollbackTrigger::PartialOrFailure.applies_to(DeploymentStatus::Success));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("direct".parse::<DeploymentMode>(), Ok(DeploymentMode::Direct));
        assert_eq!(
            "controller".parse::<DeploymentMode>(),
            Ok(DeploymentMode::Controller)
        );
        assert!("helm".parse::<DeploymentMode>().is_err());
    }
}
