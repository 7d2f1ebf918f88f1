//! Cloud provider abstraction
//!
//! The reconciler only ever sees the narrow [`CloudGroupProvider`]
//! capability trait and the plain data model below; the AWS SDK stays
//! behind [`aws::AwsGroupProvider`]. This keeps the core testable with
//! in-memory fakes and permits substitution of other providers.

use std::collections::HashMap;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Result;

pub mod aws;

pub use aws::AwsGroupProvider;

/// Tag key under which the pre-roll desired count is persisted on a group
pub const ORIGINAL_DESIRED_TAG: &str = "aws-asg-roller/OriginalDesired";

/// Launch template version sentinel resolved to the latest published version
pub const VERSION_LATEST: &str = "$Latest";

/// Launch template version sentinel resolved to the default version
pub const VERSION_DEFAULT: &str = "$Default";

/// Reference to a launch template as carried by groups and instances.
///
/// Two instances may share id and name yet differ by version, and the
/// version may be one of the [`VERSION_LATEST`] / [`VERSION_DEFAULT`]
/// sentinels rather than a concrete number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchTemplateRef {
    /// Launch template id, e.g. `lt-0a1b2c3d`
    pub id: Option<String>,
    /// Launch template name
    pub name: Option<String>,
    /// Version selector: a base-10 integer string or a sentinel
    pub version: Option<String>,
}

/// A launch template resolved against the cloud, with the concrete
/// version numbers the sentinels currently point at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplate {
    /// Launch template id
    pub id: String,
    /// Launch template name
    pub name: String,
    /// Currently published latest version number
    pub latest_version: i64,
    /// Currently published default version number
    pub default_version: i64,
}

/// A member instance of an auto-scaling group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instance {
    /// Instance id, e.g. `i-0123456789abcdef0`
    pub id: String,
    /// Launch configuration the instance was started from, if any
    pub launch_configuration: Option<String>,
    /// Launch template the instance was started from, if any
    pub launch_template: Option<LaunchTemplateRef>,
    /// Health status as reported by the group; see [`crate::HEALTHY`]
    pub health_status: String,
}

/// An auto-scaling group snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Current desired capacity
    pub desired: i32,
    /// Maximum capacity
    pub max: i32,
    /// Minimum capacity
    pub min: i32,
    /// Target launch configuration name, if the group uses one
    pub launch_configuration: Option<String>,
    /// Target launch template, if the group references one directly
    pub launch_template: Option<LaunchTemplateRef>,
    /// Launch template exposed via a mixed-instances policy, if any
    pub mixed_instances_template: Option<LaunchTemplateRef>,
    /// Member instances, in the order the cloud returned them
    pub instances: Vec<Instance>,
}

impl Group {
    /// The launch template the group is converging toward: the direct
    /// reference wins over the mixed-instances policy one
    pub fn target_template(&self) -> Option<&LaunchTemplateRef> {
        self.launch_template
            .as_ref()
            .or(self.mixed_instances_template.as_ref())
    }

    /// Ids of all member instances
    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.id.clone()).collect()
    }
}

/// Capability trait over the cloud's auto-scaling and compute APIs.
///
/// All operations may fail with [`crate::Error::CloudTransient`] for
/// conditions like "scaling activity in progress"; callers abandon the
/// current pass and retry on the next one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudGroupProvider: Send + Sync {
    /// Fetch the current snapshot of each named group
    async fn describe_groups(&self, names: &[String]) -> Result<Vec<Group>>;

    /// Resolve private DNS names for the given instance ids, keyed by id.
    ///
    /// An empty input returns an empty map without a cloud call.
    async fn describe_instances(&self, ids: &[String]) -> Result<HashMap<String, String>>;

    /// Resolve a launch template reference (by id when present, else by
    /// name) to its current latest/default version numbers
    async fn get_launch_template(
        &self,
        reference: &LaunchTemplateRef,
    ) -> Result<Option<LaunchTemplate>>;

    /// Set the group's desired capacity, honouring the cloud cooldown.
    ///
    /// Fails if `count` exceeds the group's max size.
    async fn set_desired(&self, group: &Group, count: i32) -> Result<()>;

    /// Raise the group's max size
    async fn set_max(&self, group: &Group, count: i32) -> Result<()>;

    /// Terminate one instance without decrementing the group's desired
    /// capacity, so the cloud launches a replacement
    async fn terminate_instance(&self, id: &str) -> Result<()>;

    /// Read the persisted pre-roll desired count from the group's
    /// [`ORIGINAL_DESIRED_TAG`] tag; -1 when absent or unparsable
    async fn read_original_desired_tag(&self, group_name: &str) -> Result<i32>;

    /// Persist the pre-roll desired count on the group's
    /// [`ORIGINAL_DESIRED_TAG`] tag (propagate-at-launch = false)
    async fn write_original_desired_tag(&self, group_name: &str, value: i32) -> Result<()>;
}
