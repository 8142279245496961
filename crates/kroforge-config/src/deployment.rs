//! Deployment configuration parsing.
//!
//! ```kdl
//! deployment "webapp" {
//!     mode "direct"
//!     namespace "production"
//!     timeout "5m"
//!     wait-for-ready "true"
//!     concurrency 4
//!     readiness poll-interval="2s" crd-timeout="60s"
//!     retry max-attempts=5 initial-delay="1s" max-delay="30s" multiplier=2
//!     rollback on="failure" force="true" grace-period=30 timeout="60s"
//! }
//! ```

use crate::duration::parse_duration;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use kroforge_core::deployment::{
    DeploymentMode, DeploymentOptions, EngineSettings, RetryPolicy, RollbackTrigger,
};
use kroforge_core::rollback::RollbackConfig;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Parsed deployment configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentConfig {
    pub name: Option<String>,
    pub mode: DeploymentMode,
    pub namespace: String,
    pub timeout: Duration,
    pub wait_for_ready: bool,
    pub retry: Option<RetryPolicy>,
    pub rollback_on: RollbackTrigger,
    pub rollback: RollbackConfig,
    pub settings: EngineSettings,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        let options = DeploymentOptions::default();
        Self {
            name: None,
            mode: options.mode,
            namespace: options.namespace,
            timeout: options.timeout,
            wait_for_ready: options.wait_for_ready,
            retry: None,
            rollback_on: options.rollback_on,
            rollback: options.rollback,
            settings: EngineSettings::default(),
        }
    }
}

impl DeploymentConfig {
    /// Split into per-call options and engine settings.
    pub fn into_parts(self) -> (DeploymentOptions, EngineSettings) {
        let options = DeploymentOptions {
            mode: self.mode,
            namespace: self.namespace,
            timeout: self.timeout,
            wait_for_ready: self.wait_for_ready,
            retry_policy: self.retry,
            rollback_on: self.rollback_on,
            rollback: self.rollback,
            ..DeploymentOptions::default()
        };
        (options, self.settings)
    }

    /// Override fields from `KROFORGE_NAMESPACE`, `KROFORGE_MODE` and `KROFORGE_TIMEOUT`.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Override fields from an arbitrary variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(namespace) = lookup("KROFORGE_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Some(mode) = lookup("KROFORGE_MODE") {
            self.mode = mode.parse().map_err(|message| ConfigError::Environment {
                var: "KROFORGE_MODE".to_string(),
                message,
            })?;
        }
        if let Some(timeout) = lookup("KROFORGE_TIMEOUT") {
            self.timeout = parse_duration(&timeout).map_err(|message| ConfigError::Environment {
                var: "KROFORGE_TIMEOUT".to_string(),
                message,
            })?;
        }
        Ok(())
    }
}

/// Parse a deployment configuration from KDL text.
///
/// Settings may sit inside a `deployment` node or at the top level.
pub fn parse_deployment_config(kdl: &str) -> ConfigResult<DeploymentConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = DeploymentConfig::default();

    for node in doc.nodes() {
        if node.name().value() == "deployment" {
            config.name = get_first_string_arg(node);
            if let Some(children) = node.children() {
                for child in children.nodes() {
                    apply_node(&mut config, child)?;
                }
            }
        } else {
            apply_node(&mut config, node)?;
        }
    }

    Ok(config)
}

/// Read and parse a configuration file.
pub fn load_deployment_config(path: impl AsRef<Path>) -> ConfigResult<DeploymentConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_deployment_config(&text)
}

fn apply_node(config: &mut DeploymentConfig, node: &KdlNode) -> ConfigResult<()> {
    match node.name().value() {
        "mode" => {
            let mode = require_string_arg(node, "mode")?;
            config.mode = mode.parse().map_err(|message| invalid("mode", message))?;
        }
        "namespace" => {
            config.namespace = require_string_arg(node, "namespace")?;
        }
        "timeout" => {
            config.timeout = require_duration(first_arg(node), "timeout")?;
        }
        "wait-for-ready" | "wait_for_ready" => {
            config.wait_for_ready = require_bool(first_arg(node), "wait-for-ready")?;
        }
        "concurrency" => {
            let value = require_u32(first_arg(node), "concurrency")?;
            if value == 0 {
                return Err(invalid("concurrency", "must be at least 1"));
            }
            config.settings.max_concurrency = value as usize;
        }
        "readiness" => {
            if let Some(v) = node.get("poll-interval") {
                config.settings.poll_interval =
                    require_duration(Some(v), "readiness poll-interval")?;
            }
            if let Some(v) = node.get("crd-timeout") {
                config.settings.crd_establishment_timeout =
                    require_duration(Some(v), "readiness crd-timeout")?;
            }
        }
        "retry" => {
            let mut policy = RetryPolicy::default();
            if let Some(v) = node.get("max-attempts") {
                policy.max_attempts = require_u32(Some(v), "retry max-attempts")?.max(1);
            }
            if let Some(v) = node.get("initial-delay") {
                policy.initial_delay = require_duration(Some(v), "retry initial-delay")?;
            }
            if let Some(v) = node.get("max-delay") {
                policy.max_delay = require_duration(Some(v), "retry max-delay")?;
            }
            if let Some(v) = node.get("multiplier") {
                policy.multiplier = v
                    .as_float()
                    .or_else(|| v.as_integer().map(|i| i as f64))
                    .ok_or_else(|| invalid("retry multiplier", "expected a number"))?;
            }
            config.retry = Some(policy);
        }
        "rollback" => {
            if let Some(v) = node.get("on") {
                let on = v
                    .as_string()
                    .ok_or_else(|| invalid("rollback on", "expected a string"))?;
                config.rollback_on = match on {
                    "never" => RollbackTrigger::Never,
                    "failure" => RollbackTrigger::Failure,
                    "partial" | "partial-or-failure" => RollbackTrigger::PartialOrFailure,
                    other => {
                        return Err(invalid(
                            "rollback on",
                            format!("unknown trigger: {other}"),
                        ));
                    }
                };
            }
            if let Some(v) = node.get("force") {
                config.rollback.force = require_bool(Some(v), "rollback force")?;
            }
            if let Some(v) = node.get("grace-period") {
                config.rollback.grace_period = Some(require_u32(Some(v), "rollback grace-period")?);
            }
            if let Some(v) = node.get("timeout") {
                config.rollback.timeout = Some(require_duration(Some(v), "rollback timeout")?);
            }
        }
        other => {
            debug!(node = %other, "Ignoring unknown configuration node");
        }
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn require_string_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn require_duration(value: Option<&KdlValue>, field: &str) -> ConfigResult<Duration> {
    let value = value.ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    if let Some(s) = value.as_string() {
        return parse_duration(s).map_err(|message| invalid(field, message));
    }
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .map(Duration::from_secs)
        .ok_or_else(|| invalid(field, "expected a duration"))
}

fn require_u32(value: Option<&KdlValue>, field: &str) -> ConfigResult<u32> {
    let value = value.ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value
        .as_integer()
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| invalid(field, "expected a non-negative integer"))
}

fn require_bool(value: Option<&KdlValue>, field: &str) -> ConfigResult<bool> {
    let value = value.ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    if let Some(b) = value.as_bool() {
        return Ok(b);
    }
    match value.as_string() {
        Some("true") | Some("yes") => Ok(true),
        Some("false") | Some("no") => Ok(false),
        _ => Err(invalid(field, "expected a boolean")),
    }
}
