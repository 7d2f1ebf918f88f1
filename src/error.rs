//! Error types for the roller

use thiserror::Error;

/// Main error type for roller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration, including groups that carry
    /// neither a launch configuration nor a launch template
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient cloud condition (scaling activity in progress, resource
    /// contention, network failure); the next pass retries
    #[error("transient cloud error: {0}")]
    CloudTransient(String),

    /// Any other cloud provider failure
    #[error("cloud error: {0}")]
    Cloud(String),

    /// Readiness or drain operation failed
    #[error("readiness error: {0}")]
    Readiness(String),

    /// A mutation would break a size invariant, e.g. raising desired above
    /// max while raising max is disallowed
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transient cloud error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::CloudTransient(msg.into())
    }

    /// Create a cloud error with the given message
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// Create a readiness error with the given message
    pub fn readiness(msg: impl Into<String>) -> Self {
        Self::Readiness(msg.into())
    }

    /// Create an invariant violation with the given message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}
