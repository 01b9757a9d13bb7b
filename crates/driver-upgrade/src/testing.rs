//! An in-memory [`ClusterClient`] and object builders for tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{ControllerRevision, DaemonSet, DaemonSetSpec, DaemonSetStatus},
        core::v1::{
            ContainerStatus, EmptyDirVolumeSource, Node, NodeCondition, NodeSpec, NodeStatus, Pod,
            PodSpec, PodStatus, Volume,
        },
    },
    apimachinery::pkg::apis::meta::v1::{
        Condition, LabelSelector, ObjectMeta, OwnerReference, Time,
    },
};
use kube::ResourceExt;

use crate::{
    client::{ClusterClient, Error, PodQuery, Result},
    crd::node_maintenance::{
        CONDITION_REASON_READY, CONDITION_TYPE_READY, NodeMaintenance, NodeMaintenanceStatus,
    },
    events::NodeEvent,
    keys::POD_CONTROLLER_REVISION_HASH_LABEL,
};

pub const DRIVER_NAMESPACE: &str = "gpu-operator";

type PodKey = (String, String);

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    /// Frozen copy served by `get_node` while stale reads are enabled.
    stale_nodes: Option<BTreeMap<String, Node>>,
    pods: BTreeMap<PodKey, Pod>,
    daemon_sets: Vec<DaemonSet>,
    controller_revisions: Vec<ControllerRevision>,
    node_maintenances: BTreeMap<PodKey, NodeMaintenance>,
    events: Vec<(String, NodeEvent)>,
    throttled_evictions: BTreeMap<PodKey, u32>,
    sticky_pods: BTreeSet<PodKey>,
    evictions: usize,
    deletions: usize,
    next_uid: u64,
    next_resource_version: u64,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut Node> {
        self.nodes.get_mut(name).ok_or_else(|| Error::NotFound {
            kind: "Node",
            name: name.to_owned(),
        })
    }

    fn remove_pod(&mut self, key: &PodKey) -> Result<()> {
        if !self.pods.contains_key(key) {
            return Err(Error::NotFound {
                kind: "Pod",
                name: key.1.clone(),
            });
        }
        if !self.sticky_pods.contains(key) {
            self.pods.remove(key);
        }
        Ok(())
    }
}

/// Stores objects in memory and applies writes immediately.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(&self, node: Node) {
        self.state().nodes.insert(node.name_any(), node);
    }

    pub fn node(&self, name: &str) -> Node {
        self.state().nodes.get(name).cloned().unwrap()
    }

    pub fn node_label(&self, name: &str, key: &str) -> Option<String> {
        self.node(name).labels().get(key).cloned()
    }

    pub fn node_annotation(&self, name: &str, key: &str) -> Option<String> {
        self.node(name).annotations().get(key).cloned()
    }

    /// Replaces a node, e.g. to simulate a change by an administrator.
    pub fn update_node(&self, name: &str, update: impl FnOnce(&mut Node)) {
        let mut state = self.state();
        if let Some(node) = state.nodes.get_mut(name) {
            update(node);
        }
    }

    /// While enabled, `get_node` keeps returning the nodes as they were when it was enabled.
    pub fn set_stale_reads(&self, stale: bool) {
        let mut state = self.state();
        state.stale_nodes = stale.then(|| state.nodes.clone());
    }

    pub fn add_pod(&self, mut pod: Pod) {
        let mut state = self.state();
        if pod.metadata.uid.is_none() {
            state.next_uid += 1;
            pod.metadata.uid = Some(format!("pod-uid-{}", state.next_uid));
        }
        state
            .pods
            .insert((pod.namespace().unwrap_or_default(), pod.name_any()), pod);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Pod {
        self.state()
            .pods
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .unwrap()
    }

    pub fn pod_exists(&self, namespace: &str, name: &str) -> bool {
        self.state()
            .pods
            .contains_key(&(namespace.to_owned(), name.to_owned()))
    }

    pub fn update_pod(&self, namespace: &str, name: &str, update: impl FnOnce(&mut Pod)) {
        let mut state = self.state();
        if let Some(pod) = state.pods.get_mut(&(namespace.to_owned(), name.to_owned())) {
            update(pod);
        }
    }

    /// Rejects the next `times` evictions of a pod with HTTP 429.
    pub fn throttle_evictions(&self, namespace: &str, name: &str, times: u32) {
        self.state()
            .throttled_evictions
            .insert((namespace.to_owned(), name.to_owned()), times);
    }

    /// Accepts evictions and deletions of a pod without ever removing it.
    pub fn keep_pod_after_eviction(&self, namespace: &str, name: &str) {
        self.state()
            .sticky_pods
            .insert((namespace.to_owned(), name.to_owned()));
    }

    pub fn evictions(&self) -> usize {
        self.state().evictions
    }

    pub fn deletions(&self) -> usize {
        self.state().deletions
    }

    pub fn add_daemon_set(&self, daemon_set: DaemonSet) {
        self.state().daemon_sets.push(daemon_set);
    }

    pub fn add_controller_revision(&self, revision: ControllerRevision) {
        self.state().controller_revisions.push(revision);
    }

    pub fn add_node_maintenance(&self, mut node_maintenance: NodeMaintenance) {
        let mut state = self.state();
        node_maintenance.metadata.resource_version = Some(state.next_resource_version());
        state.node_maintenances.insert(
            (
                node_maintenance.namespace().unwrap_or_default(),
                node_maintenance.name_any(),
            ),
            node_maintenance,
        );
    }

    pub fn node_maintenance(&self, namespace: &str, name: &str) -> Option<NodeMaintenance> {
        self.state()
            .node_maintenances
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Sets the Ready condition the maintenance operator reports once a node is prepared.
    pub fn set_node_maintenance_ready(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        if let Some(node_maintenance) = state
            .node_maintenances
            .get_mut(&(namespace.to_owned(), name.to_owned()))
        {
            node_maintenance.status = Some(NodeMaintenanceStatus {
                conditions: vec![Condition {
                    type_: CONDITION_TYPE_READY.to_owned(),
                    reason: CONDITION_REASON_READY.to_owned(),
                    status: "True".to_owned(),
                    message: String::new(),
                    last_transition_time: Time(jiff::Timestamp::UNIX_EPOCH),
                    observed_generation: None,
                }],
            });
        }
    }

    pub fn events_for(&self, node_name: &str) -> Vec<NodeEvent> {
        self.state()
            .events
            .iter()
            .filter(|(name, _)| name == node_name)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_node(&self, name: &str) -> Result<Node> {
        let state = self.state();
        let nodes = state.stale_nodes.as_ref().unwrap_or(&state.nodes);
        nodes.get(name).cloned().ok_or_else(|| Error::NotFound {
            kind: "Node",
            name: name.to_owned(),
        })
    }

    async fn patch_node_label(&self, name: &str, key: &str, value: Option<&str>) -> Result<Node> {
        let mut state = self.state();
        let node = state.node_mut(name)?;
        match value {
            Some(value) => node.labels_mut().insert(key.to_owned(), value.to_owned()),
            None => node.labels_mut().remove(key),
        };
        Ok(node.clone())
    }

    async fn patch_node_annotation(
        &self,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Node> {
        let mut state = self.state();
        let node = state.node_mut(name)?;
        match value {
            Some(value) => node
                .annotations_mut()
                .insert(key.to_owned(), value.to_owned()),
            None => node.annotations_mut().remove(key),
        };
        Ok(node.clone())
    }

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<Node> {
        let mut state = self.state();
        let node = state.node_mut(name)?;
        node.spec.get_or_insert_with(NodeSpec::default).unschedulable = Some(unschedulable);
        Ok(node.clone())
    }

    async fn list_pods(&self, query: &PodQuery) -> Result<Vec<Pod>> {
        let selector = query.label_selector.as_deref().unwrap_or_default();
        Ok(self
            .state()
            .pods
            .values()
            .filter(|pod| {
                query
                    .namespace
                    .as_ref()
                    .is_none_or(|namespace| pod.namespace().as_ref() == Some(namespace))
            })
            .filter(|pod| {
                query.node_name.as_deref().is_none_or(|node_name| {
                    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
                        == Some(node_name)
                })
            })
            .filter(|pod| matches_selector(pod.labels(), selector))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.state()
            .pods
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Pod",
                name: name.to_owned(),
            })
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        let mut state = self.state();
        state.deletions += 1;
        state.remove_pod(&(namespace.to_owned(), name.to_owned()))
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        let key = (namespace.to_owned(), name.to_owned());
        let mut state = self.state();
        if let Some(remaining) = state.throttled_evictions.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::TooManyRequests {
                    kind: "Pod",
                    name: name.to_owned(),
                });
            }
        }
        state.evictions += 1;
        state.remove_pod(&key)
    }

    async fn list_daemon_sets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DaemonSet>> {
        Ok(self
            .state()
            .daemon_sets
            .iter()
            .filter(|ds| ds.namespace().as_deref() == Some(namespace))
            .filter(|ds| matches_selector(ds.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ControllerRevision>> {
        Ok(self
            .state()
            .controller_revisions
            .iter()
            .filter(|revision| revision.namespace().as_deref() == Some(namespace))
            .filter(|revision| matches_selector(revision.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn get_node_maintenance(&self, namespace: &str, name: &str) -> Result<NodeMaintenance> {
        self.node_maintenance(namespace, name)
            .ok_or_else(|| Error::NotFound {
                kind: "NodeMaintenance",
                name: name.to_owned(),
            })
    }

    async fn create_node_maintenance(
        &self,
        node_maintenance: &NodeMaintenance,
    ) -> Result<NodeMaintenance> {
        let key = (
            node_maintenance.namespace().unwrap_or_default(),
            node_maintenance.name_any(),
        );
        let mut state = self.state();
        if state.node_maintenances.contains_key(&key) {
            return Err(Error::Conflict {
                kind: "NodeMaintenance",
                name: key.1,
            });
        }

        let mut created = node_maintenance.clone();
        created.metadata.resource_version = Some(state.next_resource_version());
        state.node_maintenances.insert(key, created.clone());
        Ok(created)
    }

    async fn update_node_maintenance_requestors(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        additional_requestors: &[String],
    ) -> Result<NodeMaintenance> {
        let mut state = self.state();
        let next_resource_version = state.next_resource_version();
        let not_found = || Error::NotFound {
            kind: "NodeMaintenance",
            name: name.to_owned(),
        };
        let node_maintenance = state
            .node_maintenances
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(not_found)?;

        if resource_version.is_some()
            && resource_version != node_maintenance.metadata.resource_version.as_deref()
        {
            return Err(Error::Conflict {
                kind: "NodeMaintenance",
                name: name.to_owned(),
            });
        }

        node_maintenance.spec.additional_requestors = additional_requestors.to_vec();
        node_maintenance.metadata.resource_version = Some(next_resource_version);
        Ok(node_maintenance.clone())
    }

    async fn delete_node_maintenance(&self, namespace: &str, name: &str) -> Result<()> {
        self.state()
            .node_maintenances
            .remove(&(namespace.to_owned(), name.to_owned()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound {
                kind: "NodeMaintenance",
                name: name.to_owned(),
            })
    }

    async fn publish_node_event(&self, node: &Node, event: NodeEvent) -> Result<()> {
        self.state().events.push((node.name_any(), event));
        Ok(())
    }
}

/// Evaluates the equality and existence based subset of the label selector syntax, plus `in`.
fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    split_requirements(selector).iter().all(|requirement| {
        let requirement = requirement.trim();
        if let Some((key, values)) = requirement.split_once(" in ") {
            let values = values.trim().trim_start_matches('(').trim_end_matches(')');
            return labels
                .get(key.trim())
                .is_some_and(|value| values.split(',').any(|candidate| candidate.trim() == value));
        }
        if let Some((key, value)) = requirement.split_once("!=") {
            return labels.get(key.trim()).map(String::as_str) != Some(value.trim());
        }
        if let Some((key, value)) = requirement
            .split_once("==")
            .or_else(|| requirement.split_once('='))
        {
            return labels.get(key.trim()).map(String::as_str) == Some(value.trim());
        }
        if let Some(key) = requirement.strip_prefix('!') {
            return !labels.contains_key(key.trim());
        }
        labels.contains_key(requirement)
    })
}

/// Splits at commas outside of parentheses.
fn split_requirements(selector: &str) -> Vec<String> {
    let mut requirements = Vec::new();
    let mut current = String::new();
    let mut depth = 0_usize;
    for c in selector.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                requirements.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    requirements.push(current);
    requirements.retain(|requirement| !requirement.trim().is_empty());
    requirements
}

pub struct NodeBuilder {
    node: Node,
    ready: bool,
}

impl NodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            node: Node {
                metadata: ObjectMeta {
                    name: Some(name.to_owned()),
                    ..ObjectMeta::default()
                },
                ..Node::default()
            },
            ready: true,
        }
    }

    pub fn unschedulable(mut self, unschedulable: bool) -> Self {
        self.node
            .spec
            .get_or_insert_with(NodeSpec::default)
            .unschedulable = Some(unschedulable);
        self
    }

    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.node
            .labels_mut()
            .insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.node
            .annotations_mut()
            .insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn build(mut self) -> Node {
        self.node.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_owned(),
                status: if self.ready { "True" } else { "False" }.to_owned(),
                ..NodeCondition::default()
            }]),
            ..NodeStatus::default()
        });
        self.node
    }
}

pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            pod: Pod {
                metadata: ObjectMeta {
                    name: Some(name.to_owned()),
                    namespace: Some(namespace.to_owned()),
                    ..ObjectMeta::default()
                },
                spec: Some(PodSpec::default()),
                status: Some(PodStatus {
                    phase: Some("Running".to_owned()),
                    ..PodStatus::default()
                }),
            },
        }
    }

    pub fn on_node(mut self, node_name: &str) -> Self {
        self.spec().node_name = Some(node_name.to_owned());
        self
    }

    /// Adds a controller owner reference.
    pub fn owned_by(mut self, kind: &str, name: &str) -> Self {
        self.pod
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(OwnerReference {
                api_version: "apps/v1".to_owned(),
                kind: kind.to_owned(),
                name: name.to_owned(),
                uid: format!("uid-{name}"),
                controller: Some(true),
                block_owner_deletion: None,
            });
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod.labels_mut().insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.pod
            .annotations_mut()
            .insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.status().phase = Some(phase.to_owned());
        self
    }

    pub fn empty_dir(mut self) -> Self {
        self.spec().volumes.get_or_insert_with(Vec::new).push(Volume {
            name: "scratch".to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        });
        self
    }

    /// Sets a single container status.
    pub fn container(mut self, ready: bool, restart_count: i32) -> Self {
        self.status().container_statuses = Some(vec![ContainerStatus {
            name: "main".to_owned(),
            ready,
            restart_count,
            ..ContainerStatus::default()
        }]);
        self
    }

    pub fn terminating(mut self) -> Self {
        self.pod.metadata.deletion_timestamp = Some(Time(jiff::Timestamp::UNIX_EPOCH));
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }

    fn spec(&mut self) -> &mut PodSpec {
        self.pod.spec.get_or_insert_with(PodSpec::default)
    }

    fn status(&mut self) -> &mut PodStatus {
        self.pod.status.get_or_insert_with(PodStatus::default)
    }
}

/// A running and ready driver pod of the DaemonSet `daemon_set` created from `revision_hash`.
pub fn driver_pod(node_name: &str, daemon_set: &str, revision_hash: &str) -> Pod {
    PodBuilder::new(DRIVER_NAMESPACE, &format!("{daemon_set}-{node_name}"))
        .on_node(node_name)
        .owned_by("DaemonSet", daemon_set)
        .label("app", daemon_set)
        .label(POD_CONTROLLER_REVISION_HASH_LABEL, revision_hash)
        .container(true, 0)
        .build()
}

/// A driver DaemonSet labelled and selecting `app=<name>`.
pub fn daemon_set(name: &str, desired_number_scheduled: i32) -> DaemonSet {
    let labels = BTreeMap::from([("app".to_owned(), name.to_owned())]);
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(DRIVER_NAMESPACE.to_owned()),
            uid: Some(format!("uid-{name}")),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels),
                match_expressions: None,
            },
            ..DaemonSetSpec::default()
        }),
        status: Some(DaemonSetStatus {
            desired_number_scheduled,
            ..DaemonSetStatus::default()
        }),
    }
}

/// A revision of the DaemonSet `daemon_set` named like the DaemonSet controller names them.
pub fn controller_revision(daemon_set: &str, hash: &str, revision: i64) -> ControllerRevision {
    ControllerRevision {
        metadata: ObjectMeta {
            name: Some(format!("{daemon_set}-{hash}")),
            namespace: Some(DRIVER_NAMESPACE.to_owned()),
            labels: Some(BTreeMap::from([(
                "app".to_owned(),
                daemon_set.to_owned(),
            )])),
            ..ObjectMeta::default()
        },
        revision,
        data: None,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("", true)]
    #[case("app=driver", true)]
    #[case("app==driver,tier=node", true)]
    #[case("app!=driver", false)]
    #[case("app", true)]
    #[case("!app", false)]
    #[case("app in (driver, other)", true)]
    #[case("app in (other),tier=node", false)]
    fn selector_matching(#[case] selector: &str, #[case] expected: bool) {
        let labels = BTreeMap::from([
            ("app".to_owned(), "driver".to_owned()),
            ("tier".to_owned(), "node".to_owned()),
        ]);
        assert_eq!(matches_selector(&labels, selector), expected);
    }
}
