//! KDL configuration parsing for kroforge.
//!
//! This crate handles parsing of:
//! - Deployment configuration (`deployment { ... }` documents)
//! - Human-friendly durations (`500ms`, `2s`, `5m`)
//! - Environment overrides

pub mod deployment;
pub mod duration;
pub mod error;

pub use deployment::{DeploymentConfig, load_deployment_config, parse_deployment_config};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
