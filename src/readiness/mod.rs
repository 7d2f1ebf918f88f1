//! Workload orchestrator abstraction
//!
//! The reconciler consults a [`ReadinessProvider`] before terminating an
//! outdated instance: the replacement nodes must be Ready, and the victim
//! is cordoned and drained first. The provider is optional; without it the
//! roller trusts the cloud health status alone.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Result;

pub mod kubernetes;

pub use kubernetes::KubernetesReadiness;

/// Capability trait over the orchestrator's view of worker nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReadinessProvider: Send + Sync {
    /// How many of the given nodes are not currently Ready.
    ///
    /// A hostname with no backing node record counts as not-ready.
    async fn unready_count(&self, hostnames: &[String], ids: &[String]) -> Result<usize>;

    /// Prepare the given nodes for removal: cordon, and when `drain` is
    /// set evict their workloads, returning only once eviction completed.
    /// `drain_force` permits evicting pods that have no controller.
    async fn prepare_termination(
        &self,
        hostnames: &[String],
        ids: &[String],
        drain: bool,
        drain_force: bool,
    ) -> Result<()>;

    /// Idempotently mark the nodes so an external autoscaler refrains from
    /// scaling them down
    async fn mark_no_scale_down(&self, hostnames: &[String]) -> Result<()>;

    /// Idempotently remove the scale-down marker from the nodes
    async fn unmark_no_scale_down(&self, hostnames: &[String]) -> Result<()>;
}
