//! The point-in-time view of the upgrade, built by
//! [`ClusterUpgradeStateManager::build_state`](crate::manager::ClusterUpgradeStateManager::build_state).

use std::collections::BTreeMap;

use k8s_openapi::api::{apps::v1::DaemonSet, core::v1::{Node, Pod}};
use kube::ResourceExt;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

use crate::{crd::node_maintenance::NodeMaintenance, utils};

/// The upgrade state of a single node, stored in the node's upgrade state label.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    IntoStaticStr,
    Ord,
    PartialEq,
    PartialOrd,
)]
#[strum(serialize_all = "kebab-case")]
pub enum UpgradeState {
    /// The node has never been looked at, its label is empty or missing.
    #[strum(serialize = "")]
    Unknown,
    UpgradeRequired,
    CordonRequired,
    WaitForJobsRequired,
    PodDeletionRequired,
    DrainRequired,
    NodeMaintenanceRequired,
    PostMaintenanceRequired,
    PodRestartRequired,
    ValidationRequired,
    UncordonRequired,
    #[strum(serialize = "upgrade-done")]
    Done,
    #[strum(serialize = "upgrade-failed")]
    Failed,
}

impl UpgradeState {
    /// Parses a label value. Missing or unrecognized values map to [`UpgradeState::Unknown`], so
    /// that the node is re-evaluated from scratch.
    pub fn from_label(value: Option<&str>) -> Self {
        value
            .and_then(|value| value.parse().ok())
            .unwrap_or(Self::Unknown)
    }
}

/// Everything known about one node during one reconciliation.
#[derive(Clone, Debug)]
pub struct NodeUpgradeState {
    pub node: Node,
    pub driver_pod: Pod,
    /// `None` if the driver pod is orphaned.
    pub driver_daemon_set: Option<DaemonSet>,
    /// Only populated in requestor mode.
    pub node_maintenance: Option<NodeMaintenance>,
}

impl NodeUpgradeState {
    pub fn node_name(&self) -> String {
        self.node.name_any()
    }

    pub fn is_orphaned(&self) -> bool {
        self.driver_daemon_set.is_none() || utils::is_orphaned_pod(&self.driver_pod)
    }
}

/// Nodes bucketed by their [`UpgradeState`]. Every node appears in exactly one bucket.
#[derive(Clone, Debug, Default)]
pub struct ClusterUpgradeState {
    node_states: BTreeMap<UpgradeState, Vec<NodeUpgradeState>>,
}

impl ClusterUpgradeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the bucket of `state`, removing it from any other bucket first.
    pub fn insert(&mut self, state: UpgradeState, node_state: NodeUpgradeState) {
        let name = node_state.node_name();
        for bucket in self.node_states.values_mut() {
            bucket.retain(|existing| existing.node_name() != name);
        }
        self.node_states.entry(state).or_default().push(node_state);
    }

    /// Removes and returns all nodes of one bucket.
    pub fn take(&mut self, state: UpgradeState) -> Vec<NodeUpgradeState> {
        self.node_states.remove(&state).unwrap_or_default()
    }

    pub fn nodes(&self, state: UpgradeState) -> &[NodeUpgradeState] {
        self.node_states.get(&state).map_or(&[], Vec::as_slice)
    }

    pub fn count(&self, state: UpgradeState) -> usize {
        self.nodes(state).len()
    }

    /// Returns the state bucket the named node currently sits in.
    pub fn state_of(&self, node_name: &str) -> Option<UpgradeState> {
        self.iter()
            .find(|(_, node_state)| node_state.node_name() == node_name)
            .map(|(state, _)| state)
    }

    pub fn iter(&self) -> impl Iterator<Item = (UpgradeState, &NodeUpgradeState)> {
        self.node_states
            .iter()
            .flat_map(|(state, nodes)| nodes.iter().map(move |node| (*state, node)))
    }

    pub fn total_managed_nodes(&self) -> usize {
        self.node_states.values().map(Vec::len).sum()
    }

    /// Nodes that left `upgrade-required` but have not reached `upgrade-done` yet.
    pub fn upgrades_in_progress(&self) -> usize {
        self.total_managed_nodes().saturating_sub(
            self.count(UpgradeState::Unknown)
                + self.count(UpgradeState::Done)
                + self.count(UpgradeState::UpgradeRequired),
        )
    }

    pub fn upgrades_done(&self) -> usize {
        self.count(UpgradeState::Done)
    }

    pub fn upgrades_failed(&self) -> usize {
        self.count(UpgradeState::Failed)
    }

    pub fn upgrades_pending(&self) -> usize {
        self.count(UpgradeState::UpgradeRequired)
    }

    /// Nodes that are cordoned or not ready, plus nodes queued for cordoning which will become
    /// unavailable shortly.
    pub fn current_unavailable_nodes(&self) -> usize {
        self.iter()
            .filter(|(state, node_state)| {
                *state == UpgradeState::CordonRequired
                    || utils::is_node_unschedulable(&node_state.node)
                    || !utils::is_node_ready(&node_state.node)
            })
            .count()
    }
}
