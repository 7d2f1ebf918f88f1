//! Partitioning of group members into outdated and current instances
//!
//! Everything else in the roller relies on this partition for deciding
//! what to replace. Launch templates need care: two instances can share
//! template id and name yet differ by version, and a version may be the
//! `$Latest` / `$Default` sentinel, so versions are resolved to concrete
//! numbers against the group's target template before comparison.

use tracing::debug;

use crate::cloud::{
    CloudGroupProvider, Group, Instance, LaunchTemplate, LaunchTemplateRef, VERSION_DEFAULT,
    VERSION_LATEST,
};
use crate::error::Error;
use crate::Result;

/// Split a group's instances into (outdated, current).
///
/// The partition is total: every member lands in exactly one side.
/// Fails with a configuration error when the group exposes neither a
/// launch configuration nor a launch template.
pub async fn partition_instances(
    group: &Group,
    cloud: &dyn CloudGroupProvider,
) -> Result<(Vec<Instance>, Vec<Instance>)> {
    if let Some(target) = group.target_template() {
        partition_by_template(group, target, cloud).await
    } else if let Some(target) = &group.launch_configuration {
        Ok(partition_by_configuration(group, target))
    } else {
        Err(Error::config(format!(
            "group {} has neither launch configuration nor launch template",
            group.name
        )))
    }
}

async fn partition_by_template(
    group: &Group,
    target: &LaunchTemplateRef,
    cloud: &dyn CloudGroupProvider,
) -> Result<(Vec<Instance>, Vec<Instance>)> {
    let template = cloud
        .get_launch_template(target)
        .await?
        .ok_or_else(|| {
            Error::config(format!(
                "launch template for group {} not found",
                group.name
            ))
        })?;
    debug!(
        group = %group.name,
        template = %template.name,
        id = %template.id,
        latest = template.latest_version,
        default = template.default_version,
        "partitioning by launch template"
    );

    let mut outdated = Vec::new();
    let mut current = Vec::new();
    for instance in &group.instances {
        match &instance.launch_template {
            None => {
                debug!(instance = %instance.id, "outdated: no launch template");
                outdated.push(instance.clone());
            }
            Some(reference) if reference.name != target.name => {
                debug!(instance = %instance.id, "outdated: template name differs");
                outdated.push(instance.clone());
            }
            Some(reference) if reference.id != target.id => {
                debug!(instance = %instance.id, "outdated: template id differs");
                outdated.push(instance.clone());
            }
            Some(reference)
                if !versions_match(
                    &template,
                    target.version.as_deref(),
                    reference.version.as_deref(),
                ) =>
            {
                debug!(instance = %instance.id, "outdated: template version differs");
                outdated.push(instance.clone());
            }
            Some(_) => current.push(instance.clone()),
        }
    }
    Ok((outdated, current))
}

fn partition_by_configuration(group: &Group, target: &str) -> (Vec<Instance>, Vec<Instance>) {
    let mut outdated = Vec::new();
    let mut current = Vec::new();
    for instance in &group.instances {
        if instance.launch_configuration.as_deref() == Some(target) {
            current.push(instance.clone());
        } else {
            debug!(instance = %instance.id, "outdated: launch configuration differs");
            outdated.push(instance.clone());
        }
    }
    (outdated, current)
}

/// Compare two version selectors after resolving sentinels against the
/// target template's published numbers. Absent on both sides matches;
/// absent on one side does not.
pub fn versions_match(template: &LaunchTemplate, a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => resolve_version(template, a) == resolve_version(template, b),
        _ => false,
    }
}

fn resolve_version(template: &LaunchTemplate, version: &str) -> String {
    match version {
        VERSION_LATEST => template.latest_version.to_string(),
        VERSION_DEFAULT => template.default_version.to_string(),
        concrete => concrete.to_string(),
    }
}
