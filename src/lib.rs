//! aws-asg-roller - rolling updates for AWS auto-scaling groups
//!
//! The roller watches a configured set of auto-scaling groups and replaces
//! instances running an outdated launch configuration or launch template,
//! one instance at a time per group. Before every termination the group is
//! grown by one slot, the replacement must report healthy, and (when the
//! Kubernetes integration is enabled) the node must be Ready and drained.
//!
//! # Modules
//!
//! - [`cloud`] - Cloud provider abstraction (AWS Auto Scaling + EC2)
//! - [`readiness`] - Workload orchestrator abstraction (Kubernetes)
//! - [`classify`] - Partitioning of group members into outdated and current
//! - [`roller`] - The per-tick reconciliation core and control loop
//! - [`config`] - Environment-driven configuration
//! - [`error`] - Error types for the roller

#![deny(missing_docs)]

pub mod classify;
pub mod cloud;
pub mod config;
pub mod error;
pub mod readiness;
pub mod roller;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Health status reported by the auto-scaling group for a functioning
/// instance. Any other value is treated as not-healthy.
pub const HEALTHY: &str = "Healthy";

/// Default time between reconcile passes when neither `ROLLER_INTERVAL`
/// nor `ROLLER_CHECK_DELAY` is set.
pub const DEFAULT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
