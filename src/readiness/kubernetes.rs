//! Kubernetes readiness adapter
//!
//! On AWS the node name is always the instance's internal private DNS
//! name, so the roller can address nodes by the hostnames it resolves
//! from EC2. Listing is used over per-name gets: the node API cannot
//! filter a List on names, and the `kubernetes.io/hostname` label
//! respects `--hostname-override`, which may or may not be set.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Error;
use crate::readiness::ReadinessProvider;
use crate::Result;

/// Annotation that tells the cluster autoscaler to leave a node alone
pub const SCALE_DOWN_DISABLED_ANNOTATION: &str =
    "cluster-autoscaler.kubernetes.io/scale-down-disabled";

/// Annotation marking a static (mirror) pod; never evicted
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

/// [`ReadinessProvider`] backed by the Kubernetes node and eviction APIs
#[derive(Clone)]
pub struct KubernetesReadiness {
    client: Client,
    ignore_daemonsets: bool,
    delete_local_data: bool,
}

impl KubernetesReadiness {
    /// Wrap an established client with the drain pass-through flags
    pub fn new(client: Client, ignore_daemonsets: bool, delete_local_data: bool) -> Self {
        Self {
            client,
            ignore_daemonsets,
            delete_local_data,
        }
    }

    async fn cordon(&self, node_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({"spec": {"unschedulable": true}});
        nodes
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node = %node_name, "cordoned");
        Ok(())
    }

    async fn drain(&self, node_name: &str, force: bool) -> Result<()> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let on_node = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let list = pods.list(&on_node).await?;

        let mut pending: Vec<(String, String, Option<String>)> = Vec::new();
        for pod in list {
            let name = pod.name_any();
            let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
            if is_terminal(&pod) || is_mirror_pod(&pod) {
                continue;
            }
            if is_daemonset_pod(&pod) {
                if self.ignore_daemonsets {
                    continue;
                }
                return Err(Error::readiness(format!(
                    "cannot drain {node_name}: pod {namespace}/{name} is managed by a DaemonSet (set ROLLER_IGNORE_DAEMONSETS)"
                )));
            }
            if !has_controller(&pod) && !force {
                return Err(Error::readiness(format!(
                    "cannot drain {node_name}: pod {namespace}/{name} has no controller (set ROLLER_DRAIN_FORCE)"
                )));
            }
            if uses_local_storage(&pod) && !self.delete_local_data {
                return Err(Error::readiness(format!(
                    "cannot drain {node_name}: pod {namespace}/{name} uses emptyDir storage (set ROLLER_DELETE_LOCAL_DATA)"
                )));
            }

            let namespaced: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            match namespaced.evict(&name, &EvictParams::default()).await {
                Ok(_) => {
                    debug!(node = %node_name, pod = %name, namespace = %namespace, "evicted");
                    pending.push((namespace, name, pod.uid()));
                }
                // already gone
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.wait_for_evictions(node_name, pending).await
    }

    /// Block until every evicted pod is deleted (or replaced under a new
    /// uid), so termination never races running workloads
    async fn wait_for_evictions(
        &self,
        node_name: &str,
        mut pending: Vec<(String, String, Option<String>)>,
    ) -> Result<()> {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !pending.is_empty() {
            if Instant::now() >= deadline {
                let stuck: Vec<String> = pending
                    .iter()
                    .map(|(namespace, name, _)| format!("{namespace}/{name}"))
                    .collect();
                return Err(Error::readiness(format!(
                    "timed out draining {node_name}; still terminating: {}",
                    stuck.join(", ")
                )));
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;

            let mut remaining = Vec::new();
            for (namespace, name, uid) in pending {
                let namespaced: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
                match namespaced.get_opt(&name).await? {
                    Some(current) if current.uid() == uid => {
                        remaining.push((namespace, name, uid));
                    }
                    _ => {}
                }
            }
            pending = remaining;
        }
        Ok(())
    }

    async fn annotate(&self, node_name: &str, value: Option<&str>) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {
                "annotations": {
                    SCALE_DOWN_DISABLED_ANNOTATION: value,
                }
            }
        });
        nodes
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReadinessProvider for KubernetesReadiness {
    async fn unready_count(&self, hostnames: &[String], _ids: &[String]) -> Result<usize> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        let by_name: HashMap<String, &Node> = list
            .items
            .iter()
            .map(|node| (node.name_any(), node))
            .collect();

        let mut unready = 0;
        for hostname in hostnames {
            match by_name.get(hostname) {
                Some(node) if node_is_ready(node) => {}
                Some(_) => {
                    debug!(node = %hostname, "node not ready");
                    unready += 1;
                }
                None => {
                    debug!(node = %hostname, "node not registered");
                    unready += 1;
                }
            }
        }
        Ok(unready)
    }

    async fn prepare_termination(
        &self,
        hostnames: &[String],
        _ids: &[String],
        drain: bool,
        drain_force: bool,
    ) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        for hostname in hostnames {
            if nodes.get_opt(hostname).await?.is_none() {
                // Nothing to drain; the instance never registered.
                warn!(node = %hostname, "skipping drain of unregistered node");
                continue;
            }
            self.cordon(hostname).await?;
            if drain {
                self.drain(hostname, drain_force).await?;
            }
        }
        Ok(())
    }

    async fn mark_no_scale_down(&self, hostnames: &[String]) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        for hostname in hostnames {
            let Some(node) = nodes.get_opt(hostname).await? else {
                continue;
            };
            if annotation_value(&node) == Some("true") {
                continue;
            }
            self.annotate(hostname, Some("true")).await?;
            debug!(node = %hostname, "scale-down disabled");
        }
        Ok(())
    }

    async fn unmark_no_scale_down(&self, hostnames: &[String]) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        for hostname in hostnames {
            let Some(node) = nodes.get_opt(hostname).await? else {
                continue;
            };
            if annotation_value(&node).is_none() {
                continue;
            }
            // merge-patch null removes the key
            self.annotate(hostname, None).await?;
            debug!(node = %hostname, "scale-down re-enabled");
        }
        Ok(())
    }
}

/// The kubelet appends the Ready condition last and flips its status
/// between True/False/Unknown; anything but a trailing Ready=True means
/// the node cannot take workloads
fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.last())
        .map(|condition| condition.type_ == "Ready" && condition.status == "True")
        .unwrap_or(false)
}

fn annotation_value(node: &Node) -> Option<&str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(SCALE_DOWN_DISABLED_ANNOTATION))
        .map(String::as_str)
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(MIRROR_POD_ANNOTATION))
}

fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|owner| owner.kind == "DaemonSet"))
}

fn has_controller(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|owner| owner.controller == Some(true)))
}

fn uses_local_storage(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|volume| volume.empty_dir.is_some()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        NodeCondition, NodeStatus, PodSpec, PodStatus, Volume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn node_with_conditions(conditions: &[(&str, &str)]) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(
                    conditions
                        .iter()
                        .map(|(type_, status)| NodeCondition {
                            type_: type_.to_string(),
                            status: status.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_with_trailing_ready_true_condition_is_ready() {
        let node = node_with_conditions(&[
            ("MemoryPressure", "False"),
            ("DiskPressure", "False"),
            ("Ready", "True"),
        ]);
        assert!(node_is_ready(&node));
    }

    #[test]
    fn node_with_ready_condition_not_true_is_unready() {
        let node = node_with_conditions(&[("MemoryPressure", "False"), ("Ready", "False")]);
        assert!(!node_is_ready(&node));

        let node = node_with_conditions(&[("MemoryPressure", "False"), ("Ready", "Unknown")]);
        assert!(!node_is_ready(&node));
    }

    #[test]
    fn node_without_trailing_ready_condition_is_unready() {
        let node = node_with_conditions(&[("Ready", "True"), ("NetworkUnavailable", "False")]);
        assert!(!node_is_ready(&node));

        let node = node_with_conditions(&[]);
        assert!(!node_is_ready(&node));

        assert!(!node_is_ready(&Node::default()));
    }

    #[test]
    fn annotation_lookup_reads_scale_down_marker() {
        let mut node = Node::default();
        assert_eq!(annotation_value(&node), None);

        let mut annotations = BTreeMap::new();
        annotations.insert(SCALE_DOWN_DISABLED_ANNOTATION.to_string(), "true".to_string());
        node.metadata.annotations = Some(annotations);
        assert_eq!(annotation_value(&node), Some("true"));
    }

    fn pod_owned_by(kind: &str, controller: bool) -> Pod {
        Pod {
            metadata: kube::core::ObjectMeta {
                owner_references: Some(vec![OwnerReference {
                    kind: kind.to_string(),
                    controller: Some(controller),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn daemonset_pods_are_recognised() {
        assert!(is_daemonset_pod(&pod_owned_by("DaemonSet", true)));
        assert!(!is_daemonset_pod(&pod_owned_by("ReplicaSet", true)));
        assert!(!is_daemonset_pod(&Pod::default()));
    }

    #[test]
    fn naked_pods_have_no_controller() {
        assert!(has_controller(&pod_owned_by("ReplicaSet", true)));
        assert!(!has_controller(&pod_owned_by("ReplicaSet", false)));
        assert!(!has_controller(&Pod::default()));
    }

    #[test]
    fn mirror_pods_are_recognised() {
        let mut pod = Pod::default();
        assert!(!is_mirror_pod(&pod));

        let mut annotations = BTreeMap::new();
        annotations.insert(MIRROR_POD_ANNOTATION.to_string(), "mirror".to_string());
        pod.metadata.annotations = Some(annotations);
        assert!(is_mirror_pod(&pod));
    }

    #[test]
    fn empty_dir_volumes_count_as_local_storage() {
        let pod = Pod {
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "scratch".to_string(),
                    empty_dir: Some(Default::default()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(uses_local_storage(&pod));
        assert!(!uses_local_storage(&Pod::default()));
    }

    #[test]
    fn completed_pods_are_terminal() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Succeeded".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(is_terminal(&pod));
        assert!(!is_terminal(&Pod::default()));
    }
}
