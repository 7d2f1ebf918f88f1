//! AWS adapter for the cloud provider abstraction
//!
//! Wraps the Auto Scaling and EC2 SDK clients behind
//! [`CloudGroupProvider`]. Faults the Auto Scaling API raises while a
//! scaling activity is in flight are classified as transient so the
//! reconciler abandons the pass and retries on the next tick.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_autoscaling::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_autoscaling::types as asg;
use aws_sdk_ec2::types as ec2;
use aws_smithy_types::error::display::DisplayErrorContext;
use tracing::debug;

use crate::cloud::{
    CloudGroupProvider, Group, Instance, LaunchTemplate, LaunchTemplateRef, ORIGINAL_DESIRED_TAG,
};
use crate::error::Error;
use crate::Result;

/// Fault codes the Auto Scaling API returns for conditions that resolve
/// on their own; see spec of DescribeAutoScalingGroups / SetDesiredCapacity
const TRANSIENT_FAULTS: [&str; 3] = [
    "ScalingActivityInProgress",
    "ResourceContention",
    "InvalidNextToken",
];

const RESOURCE_TYPE_GROUP: &str = "auto-scaling-group";

/// [`CloudGroupProvider`] backed by the AWS Auto Scaling and EC2 APIs
#[derive(Clone)]
pub struct AwsGroupProvider {
    autoscaling: aws_sdk_autoscaling::Client,
    ec2: aws_sdk_ec2::Client,
}

impl AwsGroupProvider {
    /// Build both service clients from a shared SDK configuration
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            autoscaling: aws_sdk_autoscaling::Client::new(config),
            ec2: aws_sdk_ec2::Client::new(config),
        }
    }
}

#[async_trait]
impl CloudGroupProvider for AwsGroupProvider {
    async fn describe_groups(&self, names: &[String]) -> Result<Vec<Group>> {
        let output = self
            .autoscaling
            .describe_auto_scaling_groups()
            .set_auto_scaling_group_names(Some(names.to_vec()))
            .send()
            .await
            .map_err(|e| classify("describing groups", e))?;
        Ok(output.auto_scaling_groups().iter().map(convert_group).collect())
    }

    async fn describe_instances(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let output = self
            .ec2
            .describe_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify("describing instances", e))?;
        Ok(hostnames_from_reservations(output.reservations()))
    }

    async fn get_launch_template(
        &self,
        reference: &LaunchTemplateRef,
    ) -> Result<Option<LaunchTemplate>> {
        let request = self.ec2.describe_launch_templates();
        let request = match (&reference.id, &reference.name) {
            (Some(id), _) if !id.is_empty() => request.launch_template_ids(id),
            (_, Some(name)) if !name.is_empty() => request.launch_template_names(name),
            _ => {
                return Err(Error::config(
                    "launch template reference carries neither id nor name",
                ))
            }
        };
        let output = request
            .send()
            .await
            .map_err(|e| classify("describing launch templates", e))?;
        Ok(output.launch_templates().first().map(|t| LaunchTemplate {
            id: t.launch_template_id().unwrap_or_default().to_string(),
            name: t.launch_template_name().unwrap_or_default().to_string(),
            latest_version: t.latest_version_number().unwrap_or_default(),
            default_version: t.default_version_number().unwrap_or_default(),
        }))
    }

    async fn set_desired(&self, group: &Group, count: i32) -> Result<()> {
        debug!(group = %group.name, desired = count, "setting desired capacity");
        self.autoscaling
            .set_desired_capacity()
            .auto_scaling_group_name(&group.name)
            .desired_capacity(count)
            .honor_cooldown(true)
            .send()
            .await
            .map_err(|e| classify(&format!("setting desired capacity for {}", group.name), e))?;
        Ok(())
    }

    async fn set_max(&self, group: &Group, count: i32) -> Result<()> {
        debug!(group = %group.name, max = count, "raising max size");
        self.autoscaling
            .update_auto_scaling_group()
            .auto_scaling_group_name(&group.name)
            .max_size(count)
            .send()
            .await
            .map_err(|e| classify(&format!("raising max size for {}", group.name), e))?;
        Ok(())
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        // Desired capacity must stay put so the group launches a replacement.
        self.autoscaling
            .terminate_instance_in_auto_scaling_group()
            .instance_id(id)
            .should_decrement_desired_capacity(false)
            .send()
            .await
            .map_err(|e| classify(&format!("terminating instance {id}"), e))?;
        Ok(())
    }

    async fn read_original_desired_tag(&self, group_name: &str) -> Result<i32> {
        let output = self
            .autoscaling
            .describe_tags()
            .filters(
                asg::Filter::builder()
                    .name(RESOURCE_TYPE_GROUP)
                    .values(group_name)
                    .build(),
            )
            .filters(
                asg::Filter::builder()
                    .name("key")
                    .values(ORIGINAL_DESIRED_TAG)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify(&format!("reading tags for {group_name}"), e))?;
        Ok(parse_original_desired(output.tags()))
    }

    async fn write_original_desired_tag(&self, group_name: &str, value: i32) -> Result<()> {
        let tag = asg::Tag::builder()
            .key(ORIGINAL_DESIRED_TAG)
            .value(value.to_string())
            .resource_id(group_name)
            .resource_type(RESOURCE_TYPE_GROUP)
            .propagate_at_launch(false)
            .build();
        debug!(group = %group_name, original = value, "recording original desired tag");
        self.autoscaling
            .create_or_update_tags()
            .tags(tag)
            .send()
            .await
            .map_err(|e| classify(&format!("writing tags for {group_name}"), e))?;
        Ok(())
    }
}

/// Map an SDK fault to our taxonomy, keeping the full error chain in the
/// message
fn classify<E>(operation: &str, err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{operation}: {}", DisplayErrorContext(&err));
    if matches!(&err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return Error::transient(detail);
    }
    match err.code() {
        Some(code) if TRANSIENT_FAULTS.contains(&code) => Error::transient(detail),
        _ => Error::cloud(detail),
    }
}

fn convert_group(group: &asg::AutoScalingGroup) -> Group {
    Group {
        name: group.auto_scaling_group_name().unwrap_or_default().to_string(),
        desired: group.desired_capacity().unwrap_or_default(),
        max: group.max_size().unwrap_or_default(),
        min: group.min_size().unwrap_or_default(),
        launch_configuration: group.launch_configuration_name().map(str::to_string),
        launch_template: group.launch_template().map(convert_template_ref),
        mixed_instances_template: group
            .mixed_instances_policy()
            .and_then(|policy| policy.launch_template())
            .and_then(|template| template.launch_template_specification())
            .map(convert_template_ref),
        instances: group.instances().iter().map(convert_instance).collect(),
    }
}

fn convert_instance(instance: &asg::Instance) -> Instance {
    Instance {
        id: instance.instance_id().unwrap_or_default().to_string(),
        launch_configuration: instance.launch_configuration_name().map(str::to_string),
        launch_template: instance.launch_template().map(convert_template_ref),
        health_status: instance.health_status().unwrap_or_default().to_string(),
    }
}

fn convert_template_ref(spec: &asg::LaunchTemplateSpecification) -> LaunchTemplateRef {
    LaunchTemplateRef {
        id: spec.launch_template_id().map(str::to_string),
        name: spec.launch_template_name().map(str::to_string),
        version: spec.version().map(str::to_string),
    }
}

fn hostnames_from_reservations(reservations: &[ec2::Reservation]) -> HashMap<String, String> {
    let mut hostnames = HashMap::new();
    for reservation in reservations {
        for instance in reservation.instances() {
            if let (Some(id), Some(dns)) = (instance.instance_id(), instance.private_dns_name()) {
                hostnames.insert(id.to_string(), dns.to_string());
            }
        }
    }
    hostnames
}

/// Extract the original desired count from a tag listing; -1 when the tag
/// is absent, duplicated, or unparsable
fn parse_original_desired(tags: &[asg::TagDescription]) -> i32 {
    if tags.len() != 1 {
        return -1;
    }
    tags[0]
        .value()
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(-1)
}
