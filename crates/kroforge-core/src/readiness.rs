//! Readiness results and the evaluator trait.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of inspecting a live resource.
///
/// Not-ready is an ordinary answer, never an error. A `terminal` answer
/// means the resource will not become ready and polling should stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessResult {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ReadinessResult {
    pub fn ready() -> Self {
        Self {
            ready: true,
            terminal: false,
            reason: None,
            message: None,
            details: None,
        }
    }

    pub fn ready_with(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ready()
        }
    }

    pub fn not_ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ready: false,
            terminal: false,
            reason: Some(reason.into()),
            message: Some(message.into()),
            details: None,
        }
    }

    /// Not ready, and never will be.
    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            terminal: true,
            ..Self::not_ready(reason, message)
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Decides whether a live resource has reached its operational ready state.
pub trait ReadinessEvaluator: Send + Sync {
    fn evaluate(&self, live: &Value) -> ReadinessResult;
}

impl<F> ReadinessEvaluator for F
where
    F: Fn(&Value) -> ReadinessResult + Send + Sync,
{
    fn evaluate(&self, live: &Value) -> ReadinessResult {
        self(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_closure_is_an_evaluator() {
        let evaluator = |live: &Value| {
            if live["status"]["phase"] == "Bound" {
                ReadinessResult::ready()
            } else {
                ReadinessResult::not_ready("Pending", "volume not bound")
            }
        };
        assert!(evaluator.evaluate(&json!({"status": {"phase": "Bound"}})).ready);
        assert!(!evaluator.evaluate(&json!({})).ready);
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let json = serde_json::to_value(ReadinessResult::ready()).unwrap();
        assert_eq!(json, json!({"ready": true}));
    }

    #[test]
    fn test_failed_is_terminal() {
        let failed = ReadinessResult::failed("JobFailed", "BackoffLimitExceeded");
        assert!(!failed.ready);
        assert!(failed.terminal);
        assert!(!ReadinessResult::not_ready("JobRunning", "0/1").terminal);

        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["terminal"], json!(true));
        let back: ReadinessResult = serde_json::from_value(json!({"ready": false})).unwrap();
        assert!(!back.terminal);
    }
}
