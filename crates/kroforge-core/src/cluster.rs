//! Cluster API client trait.
//!
//! The engine talks to the cluster only through [`ClusterClient`], addressing
//! objects by `{apiVersion, kind, namespace, name}`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::resource::ObjectRef;

/// An error returned by the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}{message}", .status.map(|s| format!("{s} ")).unwrap_or_default())]
pub struct ApiError {
    /// HTTP status code, if the request reached the server.
    pub status: Option<u16>,
    /// Machine-readable reason, e.g. `AlreadyExists`.
    pub reason: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// An error that never reached the server (connection, TLS, decoding).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: "Transport".to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, "NotFound", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, "AlreadyExists", message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }

    /// Worth retrying: network failures, throttling, server errors and
    /// not-found (a dependency such as a namespace may not exist yet).
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(404) | Some(429) => true,
            Some(code) => code >= 500,
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Event type reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEventType {
    Normal,
    Warning,
}

/// A cluster event concerning one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub event_type: ClusterEventType,
    pub reason: String,
    pub message: String,
    pub involved: ObjectRef,
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Trait for cluster API backends.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Name of this client.
    fn name(&self) -> &'static str;

    /// Read the live object.
    async fn read(&self, target: &ObjectRef) -> ApiResult<Value>;

    /// Create an object from a manifest. Returns the live object.
    async fn create(&self, manifest: &Value) -> ApiResult<Value>;

    /// Merge-patch an existing object with a manifest.
    async fn patch(&self, manifest: &Value) -> ApiResult<Value>;

    /// Replace an existing object. The manifest must carry `metadata.resourceVersion`.
    async fn replace(&self, manifest: &Value) -> ApiResult<Value>;

    /// Delete an object. `grace_period` is in seconds; `Some(0)` forces deletion.
    async fn delete(&self, target: &ObjectRef, grace_period: Option<u32>) -> ApiResult<()>;

    /// Stream events about an object until the stream is dropped.
    async fn watch_events(
        &self,
        target: &ObjectRef,
    ) -> ApiResult<BoxStream<'static, ApiResult<ClusterEvent>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ApiError::not_found("x").is_transient());
        assert!(ApiError::new(503, "ServiceUnavailable", "x").is_transient());
        assert!(ApiError::new(429, "TooManyRequests", "x").is_transient());
        assert!(ApiError::transport("connection reset").is_transient());
        assert!(!ApiError::new(422, "Invalid", "x").is_transient());
        assert!(!ApiError::new(403, "Forbidden", "x").is_transient());
        assert!(ApiError::conflict("exists").is_conflict());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ApiError::new(422, "Invalid", "spec.replicas: must be >= 0").to_string(),
            "422 spec.replicas: must be >= 0"
        );
        assert_eq!(ApiError::transport("eof").to_string(), "eof");
    }
}
