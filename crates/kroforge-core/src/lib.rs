//! Core domain types and traits for kroforge.
//!
//! This crate contains:
//! - Deployment identifiers and the error taxonomy
//! - Resource graphs and the dependency graph
//! - Placeholder values and field paths
//! - Readiness results and the evaluator trait
//! - Status hydration
//! - Cluster client and expression engine traits

pub mod cluster;
pub mod deployment;
pub mod error;
pub mod expression;
pub mod graph;
pub mod hydration;
pub mod id;
pub mod path;
pub mod placeholder;
pub mod readiness;
pub mod resource;
pub mod rollback;

pub use error::{Error, Result};
pub use id::DeploymentId;
