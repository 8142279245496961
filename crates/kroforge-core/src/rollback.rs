//! Rollback configuration and results.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How resources are deleted during rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Grace period in seconds for the first delete attempt.
    pub grace_period: Option<u32>,
    /// Retry a failed delete with a zero grace period.
    pub force: bool,
    /// Wait until each resource is gone, up to this long.
    pub timeout: Option<Duration>,
    /// Interval between existence checks while waiting.
    pub poll_interval: Duration,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            grace_period: None,
            force: false,
            timeout: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackStatus::Success => write!(f, "success"),
            RollbackStatus::Partial => write!(f, "partial"),
            RollbackStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A resource that could not be rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackError {
    pub resource_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    /// Ids removed, in the order they were processed.
    pub rolled_back_resources: Vec<String>,
    pub duration: Duration,
    pub status: RollbackStatus,
    pub errors: Vec<RollbackError>,
}

impl RollbackResult {
    pub fn status_for(rolled_back: usize, failed: usize) -> RollbackStatus {
        if failed == 0 {
            RollbackStatus::Success
        } else if rolled_back > 0 {
            RollbackStatus::Partial
        } else {
            RollbackStatus::Failed
        }
    }
}
