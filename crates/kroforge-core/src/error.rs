//! Error types for kroforge.

use std::time::Duration;
use thiserror::Error;

use crate::cluster::ApiError;
use crate::readiness::ReadinessResult;
use crate::resource::ObjectRef;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("invalid resource graph: {0}")]
    InvalidGraph(String),

    #[error("failed to resolve reference {resource_id}.{field_path}: {reason}")]
    ReferenceResolution {
        resource_id: String,
        field_path: String,
        reason: String,
    },

    #[error("failed to evaluate expression `{expression}`: {message}")]
    CelExpression {
        expression: String,
        identifier: Option<String>,
        message: String,
    },

    #[error("failed to deploy {resource_id} ({object}): {source}")]
    ResourceDeployment {
        resource_id: String,
        object: ObjectRef,
        #[source]
        source: ApiError,
    },

    #[error("{resource_id} did not become ready within {timeout:?}{}", last_reason(.last))]
    ReadinessTimeout {
        resource_id: String,
        timeout: Duration,
        last: Option<ReadinessResult>,
    },

    #[error("{resource_id} will not become ready: {}", describe(.result))]
    ReadinessFailed {
        resource_id: String,
        result: ReadinessResult,
    },

    #[error("CRD {crd} was not established within {timeout:?}")]
    CrdEstablishmentTimeout { crd: String, timeout: Duration },

    #[error("{resource_id} skipped, dependencies failed: {}", .dependencies.join(", "))]
    DependencyFailed {
        resource_id: String,
        dependencies: Vec<String>,
    },

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("rollback of {resource_id} failed: {message}")]
    Rollback {
        resource_id: String,
        message: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

fn describe(result: &ReadinessResult) -> String {
    match (&result.reason, &result.message) {
        (Some(reason), Some(message)) => format!("{reason}: {message}"),
        (Some(text), None) | (None, Some(text)) => text.clone(),
        (None, None) => "no reason given".to_string(),
    }
}

fn last_reason(last: &Option<ReadinessResult>) -> String {
    match last {
        Some(result) if result.reason.is_some() || result.message.is_some() => {
            format!(" (last: {})", describe(result))
        }
        _ => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
