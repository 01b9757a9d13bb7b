//! Small helpers to inspect [`Node`] and [`Pod`] objects.

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

/// A pod is considered failing once a non-ready container restarted more often than this.
pub const MAX_CONTAINER_RESTARTS: i32 = 10;

pub fn label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.labels().get(key).map(String::as_str)
}

pub fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.annotations().get(key).map(String::as_str)
}

pub fn is_node_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or_default()
}

/// Returns `true` if the node reports the `Ready` condition with status `True`.
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|status| status.phase.as_deref())
}

pub fn is_pod_running_or_pending(pod: &Pod) -> bool {
    matches!(pod_phase(pod), Some("Running" | "Pending"))
}

pub fn is_pod_completed(pod: &Pod) -> bool {
    matches!(pod_phase(pod), Some("Succeeded" | "Failed"))
}

/// Running with every container ready.
pub fn is_pod_running_and_ready(pod: &Pod) -> bool {
    if pod_phase(pod) != Some("Running") {
        return false;
    }

    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .is_some_and(|statuses| {
            !statuses.is_empty() && statuses.iter().all(|status| status.ready)
        })
}

/// Returns `true` if any (init) container is not ready and restarted more than
/// [`MAX_CONTAINER_RESTARTS`] times.
pub fn is_pod_failing(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };

    status
        .init_container_statuses
        .iter()
        .chain(status.container_statuses.iter())
        .flatten()
        .any(|container| !container.ready && container.restart_count > MAX_CONTAINER_RESTARTS)
}

/// A pod without any owner reference.
pub fn is_orphaned_pod(pod: &Pod) -> bool {
    pod.owner_references().is_empty()
}

/// Returns `true` once the API server started terminating the pod.
pub fn is_pod_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn is_daemon_set_pod(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.kind == "DaemonSet")
}

pub fn is_mirror_pod(pod: &Pod) -> bool {
    pod.annotations().contains_key("kubernetes.io/config.mirror")
}

pub fn has_controller(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true))
}

pub fn has_local_storage(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|volume| volume.empty_dir.is_some()))
}

pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Current wall clock time in unix seconds.
pub fn unix_now() -> i64 {
    jiff::Timestamp::now().as_second()
}
