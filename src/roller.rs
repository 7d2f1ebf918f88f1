//! The per-tick reconciliation core and control loop
//!
//! For each managed group a pass either grows the group by one slot,
//! waits for capacity and readiness, terminates exactly one outdated
//! instance, or restores the pre-roll size. The pre-roll desired count
//! ("original desired") is what keeps a roll safe: during a roll the
//! group runs at `original + 1` so terminating an outdated instance
//! never dips below the operator's intended size, and the recorded value
//! survives controller restarts via an optional group tag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classify;
use crate::cloud::{CloudGroupProvider, Group, Instance};
use crate::config::Config;
use crate::error::Error;
use crate::readiness::ReadinessProvider;
use crate::{Result, HEALTHY};

/// Knobs the reconciler honours; a subset of [`Config`]
#[derive(Debug, Clone)]
pub struct RollerOptions {
    /// Persist the pre-roll desired count as a group tag
    pub original_desired_on_tag: bool,
    /// Permit raising a group's max size when desired+1 would exceed it
    pub can_increase_max: bool,
    /// Drain nodes before termination; false cordons only
    pub drain: bool,
    /// Permit evicting pods without a controller during a drain
    pub drain_force: bool,
}

impl Default for RollerOptions {
    fn default() -> Self {
        Self {
            original_desired_on_tag: false,
            can_increase_max: false,
            drain: true,
            drain_force: false,
        }
    }
}

impl From<&Config> for RollerOptions {
    fn from(config: &Config) -> Self {
        Self {
            original_desired_on_tag: config.original_desired_on_tag,
            can_increase_max: config.can_increase_max,
            drain: config.drain,
            drain_force: config.drain_force,
        }
    }
}

/// What one pass decided for one group: the desired count to converge to
/// and at most one instance to terminate
#[derive(Debug, Clone, PartialEq, Eq)]
struct Adjustment {
    desired: i32,
    terminate: Option<String>,
}

impl Adjustment {
    fn unchanged(group: &Group) -> Self {
        Self {
            desired: group.desired,
            terminate: None,
        }
    }
}

/// Reconciliation driver for a set of auto-scaling groups
pub struct Roller {
    cloud: Arc<dyn CloudGroupProvider>,
    readiness: Option<Arc<dyn ReadinessProvider>>,
    options: RollerOptions,
    original_desired: HashMap<String, i32>,
}

impl Roller {
    /// Create a roller over the given providers
    pub fn new(
        cloud: Arc<dyn CloudGroupProvider>,
        readiness: Option<Arc<dyn ReadinessProvider>>,
        options: RollerOptions,
    ) -> Self {
        Self {
            cloud,
            readiness,
            options,
            original_desired: HashMap::new(),
        }
    }

    /// The pre-roll desired count currently recorded for a group, if a
    /// roll is being tracked
    pub fn original_desired(&self, group_name: &str) -> Option<i32> {
        self.original_desired.get(group_name).copied()
    }

    /// Run reconcile passes forever, sleeping `interval` between them.
    ///
    /// Pass errors are logged and never stop the loop; only a process
    /// signal does, at the sleep boundary.
    pub async fn run(&mut self, group_names: &[String], interval: Duration) {
        loop {
            if let Err(err) = self.reconcile(group_names).await {
                warn!(error = %err, "reconcile pass failed");
            }
            debug!(seconds = interval.as_secs(), "sleeping until next pass");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal, exiting");
                    return;
                }
            }
        }
    }

    /// Run one pass over the named groups.
    ///
    /// Groups are processed independently: a failing group is logged and
    /// skipped until the next pass, and the first failure becomes the
    /// pass result.
    pub async fn reconcile(&mut self, group_names: &[String]) -> Result<()> {
        let groups = self.cloud.describe_groups(group_names).await?;
        let mut first_error = None;
        for group in &groups {
            if let Err(err) = self.reconcile_group(group).await {
                warn!(group = %group.name, error = %err, "group reconcile failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn reconcile_group(&mut self, group: &Group) -> Result<()> {
        let original = self.ensure_original_desired(group).await?;
        let (outdated, current) =
            classify::partition_instances(group, self.cloud.as_ref()).await?;

        if outdated.is_empty() && group.desired == original {
            debug!(group = %group.name, "ok");
            self.unmark_members(group).await;
            return Ok(());
        }
        if !outdated.is_empty() {
            info!(group = %group.name, outdated = outdated.len(), "group needs updates");
        }

        // Hostnames are only consulted through the readiness provider.
        let hostnames = if self.readiness.is_some() {
            self.cloud.describe_instances(&group.instance_ids()).await?
        } else {
            HashMap::new()
        };

        let adjustment = self
            .calculate_adjustment(group, original, &outdated, &current, &hostnames)
            .await?;
        debug!(
            group = %group.name,
            desired = adjustment.desired,
            original,
            terminate = adjustment.terminate.as_deref().unwrap_or("none"),
            "computed adjustment"
        );
        self.apply(group, original, &outdated, &adjustment).await
    }

    /// Fix the pre-roll desired count for the duration of a roll: first
    /// from memory, then from the persisted tag, then from the group's
    /// current desired
    async fn ensure_original_desired(&mut self, group: &Group) -> Result<i32> {
        if let Some(value) = self.original_desired.get(&group.name) {
            return Ok(*value);
        }
        if self.options.original_desired_on_tag {
            let tagged = self.cloud.read_original_desired_tag(&group.name).await?;
            if tagged >= 0 {
                debug!(group = %group.name, original = tagged, "adopted original desired from tag");
                self.original_desired.insert(group.name.clone(), tagged);
                return Ok(tagged);
            }
        }
        debug!(group = %group.name, original = group.desired, "adopted original desired from current desired");
        if self.options.original_desired_on_tag {
            self.cloud
                .write_original_desired_tag(&group.name, group.desired)
                .await?;
        }
        self.original_desired.insert(group.name.clone(), group.desired);
        Ok(group.desired)
    }

    /// Decide the next step for one group without mutating anything
    async fn calculate_adjustment(
        &self,
        group: &Group,
        original: i32,
        outdated: &[Instance],
        current: &[Instance],
        hostnames: &HashMap<String, String>,
    ) -> Result<Adjustment> {
        // All caught up: converge back to the pre-roll size.
        if outdated.is_empty() {
            return Ok(Adjustment {
                desired: original,
                terminate: None,
            });
        }

        // Roll not started: grow by one slot to host the replacement.
        if group.desired <= original {
            return Ok(Adjustment {
                desired: original + 1,
                terminate: None,
            });
        }

        // Rolling. Terminate one outdated instance only once the group
        // holds a full complement of healthy instances plus the spare.
        let healthy = group
            .instances
            .iter()
            .filter(|i| i.health_status == HEALTHY)
            .count() as i32;
        if healthy < original + 1 {
            info!(group = %group.name, healthy, needed = original + 1, "waiting for healthy capacity");
            return Ok(Adjustment::unchanged(group));
        }
        let booting = current.iter().filter(|i| i.health_status != HEALTHY).count();
        if booting > 0 {
            info!(group = %group.name, booting, "waiting for new instances to become healthy");
            return Ok(Adjustment::unchanged(group));
        }

        if let Some(readiness) = &self.readiness {
            let new_ids: Vec<String> = current.iter().map(|i| i.id.clone()).collect();
            let new_hosts: Vec<String> = new_ids
                .iter()
                .filter_map(|id| hostnames.get(id).cloned())
                .collect();
            if new_hosts.len() < new_ids.len() {
                info!(group = %group.name, "waiting for hostnames of new instances");
                return Ok(Adjustment::unchanged(group));
            }
            // Keep an external autoscaler from reclaiming the spare
            // capacity mid-roll. Failure here must not stall the roll.
            if let Err(err) = readiness.mark_no_scale_down(&new_hosts).await {
                warn!(group = %group.name, error = %err, "unable to disable scale-down on new nodes");
            }
            let unready = readiness.unready_count(&new_hosts, &new_ids).await?;
            if unready > 0 {
                info!(group = %group.name, unready, "waiting for new nodes to become ready");
                return Ok(Adjustment::unchanged(group));
            }
        }

        let candidate = &outdated[0];
        if let Some(readiness) = &self.readiness {
            let Some(hostname) = hostnames.get(&candidate.id) else {
                info!(group = %group.name, instance = %candidate.id, "waiting for hostname of termination candidate");
                return Ok(Adjustment::unchanged(group));
            };
            readiness
                .prepare_termination(
                    &[hostname.clone()],
                    &[candidate.id.clone()],
                    self.options.drain,
                    self.options.drain_force,
                )
                .await?;
        }

        Ok(Adjustment {
            desired: group.desired,
            terminate: Some(candidate.id.clone()),
        })
    }

    /// Apply a computed adjustment: max before desired, desired before
    /// termination
    async fn apply(
        &mut self,
        group: &Group,
        original: i32,
        outdated: &[Instance],
        adjustment: &Adjustment,
    ) -> Result<()> {
        if adjustment.desired != group.desired {
            self.set_desired(group, adjustment.desired).await?;
            if outdated.is_empty() {
                info!(group = %group.name, desired = adjustment.desired, "roll complete, restored original desired");
                self.original_desired.remove(&group.name);
                self.unmark_members(group).await;
            } else {
                info!(group = %group.name, desired = adjustment.desired, original, "grew group to host a replacement");
            }
        }
        if let Some(id) = &adjustment.terminate {
            info!(group = %group.name, instance = %id, "terminating outdated instance");
            self.cloud.terminate_instance(id).await?;
        }
        Ok(())
    }

    async fn set_desired(&self, group: &Group, count: i32) -> Result<()> {
        if count > group.max {
            if !self.options.can_increase_max {
                return Err(Error::invariant(format!(
                    "unable to raise desired for group {} to {}: exceeds max size {} and ROLLER_CAN_INCREASE_MAX is disabled",
                    group.name, count, group.max
                )));
            }
            info!(group = %group.name, max = count, "raising max size to fit desired");
            self.cloud.set_max(group, count).await?;
        }
        self.cloud.set_desired(group, count).await
    }

    /// Best-effort removal of the scale-down-disabled marker from every
    /// member node once a group no longer needs the spare capacity
    async fn unmark_members(&self, group: &Group) {
        let Some(readiness) = &self.readiness else {
            return;
        };
        let hostnames = match self.cloud.describe_instances(&group.instance_ids()).await {
            Ok(map) => map.into_values().collect::<Vec<_>>(),
            Err(err) => {
                warn!(group = %group.name, error = %err, "unable to resolve hostnames for annotation cleanup");
                return;
            }
        };
        if let Err(err) = readiness.unmark_no_scale_down(&hostnames).await {
            warn!(group = %group.name, error = %err, "unable to re-enable scale-down on nodes");
        }
    }
}
