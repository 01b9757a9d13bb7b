//! The upgrade state machine.
//!
//! A reconciliation calls [`ClusterUpgradeStateManager::build_state`] to take a snapshot of all
//! nodes running the driver, followed by [`ClusterUpgradeStateManager::apply_state`] to move the
//! nodes along:
//!
//! ```text
//! unknown ─┬─> upgrade-done
//!          └─> upgrade-required ─> cordon-required ─> wait-for-jobs-required
//!                │                 ─> pod-deletion-required ─> drain-required ─┐
//!                └─> node-maintenance-required ─> post-maintenance-required ──┤
//!                                                                             v
//!              upgrade-done <─ uncordon-required <─ validation-required <─ pod-restart-required
//! ```
//!
//! The phases run in the order above, once per call. Every successful transition also moves the
//! node within the snapshot, so a node can pass several phases in one call. All decisions are
//! derived from the labels, annotations and pods observed in the cluster, so a failed call can
//! simply be repeated. Calls must not overlap, which holds for a controller with a single worker.
//!
//! Only the phases that cordon, drain and uncordon depend on the [`ProcessNodeStateManager`]
//! strategy: [`InPlaceNodeStateManager`] does the work itself, [`RequestorNodeStateManager`]
//! delegates it to the maintenance operator.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::DaemonSet, core::v1::Pod};
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use strum::IntoEnumIterator;

use crate::{
    cli::UpgradeOptions,
    client::{self, ClusterClient, PodQuery},
    cordon_manager,
    crd::node_maintenance::NodeMaintenance,
    label_selector,
    node_state_provider, pod_manager,
    pod_manager::PodDeletionFilter,
    policy::{self, DriverUpgradePolicySpec},
    state::{ClusterUpgradeState, NodeUpgradeState, UpgradeState},
    utils,
};

pub use self::{
    common::CommonUpgradeManager, inplace::InPlaceNodeStateManager,
    requestor::RequestorNodeStateManager,
};

pub mod common;
pub mod inplace;
pub mod requestor;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list driver DaemonSets in namespace {namespace:?}"))]
    ListDaemonSets {
        source: client::Error,
        namespace: String,
    },

    #[snafu(display("failed to list driver pods in namespace {namespace:?}"))]
    ListDriverPods {
        source: client::Error,
        namespace: String,
    },

    #[snafu(display(
        "driver DaemonSet {daemon_set:?} has unscheduled pods ({scheduled} of {desired} scheduled)"
    ))]
    UnscheduledDriverPods {
        daemon_set: String,
        desired: i32,
        scheduled: usize,
    },

    #[snafu(display("failed to get node {node:?} of a driver pod"))]
    GetNode {
        source: node_state_provider::Error,
        node: String,
    },

    #[snafu(display("failed to update node {node:?}"))]
    UpdateNode {
        source: node_state_provider::Error,
        node: String,
    },

    #[snafu(display("failed to cordon node"))]
    Cordon { source: cordon_manager::Error },

    #[snafu(display("failed to uncordon node"))]
    Uncordon { source: cordon_manager::Error },

    #[snafu(display("failed to determine the driver revision on node {node:?}"))]
    DriverRevision {
        source: pod_manager::Error,
        node: String,
    },

    #[snafu(display("failed to wait for pod completion"))]
    PodCompletion { source: pod_manager::Error },

    #[snafu(display("failed to restart driver pods"))]
    RestartPods { source: pod_manager::Error },

    #[snafu(display("invalid upgrade policy"))]
    InvalidPolicy { source: policy::Error },

    #[snafu(display("failed to get NodeMaintenance {name:?}"))]
    GetNodeMaintenance { source: client::Error, name: String },

    #[snafu(display("failed to create NodeMaintenance {name:?}"))]
    CreateNodeMaintenance { source: client::Error, name: String },

    #[snafu(display("failed to update requestors of NodeMaintenance {name:?}"))]
    UpdateNodeMaintenance { source: client::Error, name: String },

    #[snafu(display("failed to delete NodeMaintenance {name:?}"))]
    DeleteNodeMaintenance { source: client::Error, name: String },
}

/// The strategy for the phases that take nodes out of and back into service.
#[async_trait]
pub trait ProcessNodeStateManager: Send + Sync {
    /// Starts the upgrade of as many `upgrade-required` nodes as the policy allows.
    async fn process_upgrade_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
        policy: &DriverUpgradePolicySpec,
    ) -> Result<()>;

    async fn process_node_maintenance_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
    ) -> Result<()>;

    async fn process_post_maintenance_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
    ) -> Result<()>;

    async fn process_uncordon_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
    ) -> Result<()>;

    /// The `NodeMaintenance` object of a node, if the strategy uses them.
    async fn node_maintenance(
        &self,
        _client: &dyn ClusterClient,
        _node_name: &str,
    ) -> Result<Option<NodeMaintenance>> {
        Ok(None)
    }
}

pub struct ClusterUpgradeStateManager {
    client: Arc<dyn ClusterClient>,
    common: CommonUpgradeManager,
    strategy: Box<dyn ProcessNodeStateManager>,
}

impl ClusterUpgradeStateManager {
    /// Uses the requestor strategy if the maintenance operator is enabled in `options`, the
    /// in-place strategy otherwise.
    pub fn new(client: Arc<dyn ClusterClient>, options: &UpgradeOptions) -> Self {
        let common = CommonUpgradeManager::new(client.clone(), options.keys());
        let strategy: Box<dyn ProcessNodeStateManager> =
            if options.requestor.use_maintenance_operator {
                tracing::info!(
                    requestor.id = options.requestor.requestor_id,
                    "delegating node maintenance to the maintenance operator"
                );
                Box::new(RequestorNodeStateManager::new(options.requestor.clone()))
            } else {
                Box::new(InPlaceNodeStateManager)
            };

        Self {
            client,
            common,
            strategy,
        }
    }

    /// Enables deleting the workload pods selected by `filter` before the driver restarts.
    pub fn with_pod_deletion_filter(mut self, filter: PodDeletionFilter) -> Self {
        self.common = self.common.with_pod_deletion_filter(filter);
        self
    }

    /// Enables validation. A node is only finished once the pods matching `pod_selector` on it
    /// are running and ready. Nodes still not validated after `timeout` fail the upgrade, see
    /// [`VALIDATION_TIMEOUT`](crate::validation_manager::VALIDATION_TIMEOUT) for the usual value.
    pub fn with_validation(mut self, pod_selector: &str, timeout: Duration) -> Self {
        self.common = self.common.with_validation(pod_selector, timeout);
        self
    }

    pub fn common(&self) -> &CommonUpgradeManager {
        &self.common
    }

    /// Collects every driver pod in `namespace` matching `driver_labels` together with its node
    /// and DaemonSet, bucketed by the upgrade state label of the node.
    #[tracing::instrument(skip(self, driver_labels))]
    pub async fn build_state(
        &self,
        namespace: &str,
        driver_labels: &BTreeMap<String, String>,
    ) -> Result<ClusterUpgradeState> {
        let selector = label_selector::from_labels(driver_labels);
        let daemon_sets = self
            .client
            .list_daemon_sets(namespace, &selector)
            .await
            .context(ListDaemonSetsSnafu { namespace })?;
        let pods = self
            .client
            .list_pods(&PodQuery::all().in_namespace(namespace).with_labels(selector))
            .await
            .context(ListDriverPodsSnafu { namespace })?;

        let mut driver_pods: Vec<(Pod, Option<DaemonSet>)> = Vec::new();
        for daemon_set in &daemon_sets {
            let owned = pods_owned_by(daemon_set, &pods);
            let desired = daemon_set
                .status
                .as_ref()
                .map_or(0, |status| status.desired_number_scheduled);
            if usize::try_from(desired).ok() != Some(owned.len()) {
                tracing::info!(
                    daemon_set = daemon_set.name_any(),
                    desired,
                    scheduled = owned.len(),
                    "driver DaemonSet has unscheduled pods"
                );
                return UnscheduledDriverPodsSnafu {
                    daemon_set: daemon_set.name_any(),
                    desired,
                    scheduled: owned.len(),
                }
                .fail();
            }
            driver_pods.extend(owned.into_iter().map(|pod| (pod, Some(daemon_set.clone()))));
        }
        driver_pods.extend(
            pods.iter()
                .filter(|pod| utils::is_orphaned_pod(pod))
                .map(|pod| (pod.clone(), None)),
        );

        let mut state = ClusterUpgradeState::new();
        for (pod, daemon_set) in driver_pods {
            let Some(node_name) = utils::pod_node_name(&pod).map(str::to_owned) else {
                tracing::info!(pod = pod.name_any(), "driver pod is not scheduled yet, skipping");
                continue;
            };

            let node = self
                .common
                .provider()
                .get_node(&node_name)
                .await
                .context(GetNodeSnafu { node: &node_name })?;
            let node_maintenance = self
                .strategy
                .node_maintenance(self.client.as_ref(), &node_name)
                .await?;
            let upgrade_state = UpgradeState::from_label(utils::label(
                &node,
                self.common.provider().keys().state_label(),
            ));

            state.insert(
                upgrade_state,
                NodeUpgradeState {
                    node,
                    driver_pod: pod,
                    driver_daemon_set: daemon_set,
                    node_maintenance,
                },
            );
        }

        Ok(state)
    }

    /// Moves the nodes of `state` along according to `policy`. Does nothing without a policy or
    /// with automatic upgrades disabled.
    #[tracing::instrument(skip_all)]
    pub async fn apply_state(
        &self,
        state: &mut ClusterUpgradeState,
        policy: Option<&DriverUpgradePolicySpec>,
    ) -> Result<()> {
        let Some(policy) = policy.filter(|policy| policy.auto_upgrade) else {
            tracing::info!("driver auto upgrade is disabled, skipping");
            return Ok(());
        };

        for upgrade_state in UpgradeState::iter() {
            tracing::debug!(
                upgrade.state = %upgrade_state,
                nodes = state.count(upgrade_state),
                "node states"
            );
        }

        let common = &self.common;
        common
            .process_done_or_unknown_nodes(state, UpgradeState::Unknown)
            .await?;
        common
            .process_done_or_unknown_nodes(state, UpgradeState::Done)
            .await?;

        // Counted after the pass above, which re-queues nodes with an outdated driver.
        tracing::info!(
            in_progress = state.upgrades_in_progress(),
            max_parallel_upgrades = policy.max_parallel_upgrades,
            available = self.upgrades_available(state, policy)?,
            total_nodes = state.total_managed_nodes(),
            "upgrades in progress"
        );
        self.strategy
            .process_upgrade_required_nodes(common, state, policy)
            .await?;
        common.process_cordon_required_nodes(state).await?;
        common
            .process_wait_for_jobs_required_nodes(state, policy)
            .await?;
        common
            .process_pod_deletion_required_nodes(state, policy)
            .await?;
        common.process_drain_nodes(state, policy).await?;
        self.strategy
            .process_node_maintenance_required_nodes(common, state)
            .await?;
        self.strategy
            .process_post_maintenance_required_nodes(common, state)
            .await?;
        common.process_pod_restart_nodes(state).await?;
        common.process_upgrade_failed_nodes(state).await?;
        common.process_validation_required_nodes(state).await?;
        self.strategy
            .process_uncordon_required_nodes(common, state)
            .await?;

        tracing::info!(
            done = state.upgrades_done(),
            failed = state.upgrades_failed(),
            in_progress = state.upgrades_in_progress(),
            pending = state.upgrades_pending(),
            "applied upgrade state"
        );
        Ok(())
    }

    /// Number of nodes that may start their upgrade now.
    pub fn upgrades_available(
        &self,
        state: &ClusterUpgradeState,
        policy: &DriverUpgradePolicySpec,
    ) -> Result<usize> {
        let max_unavailable = policy
            .max_unavailable_nodes(state.total_managed_nodes())
            .context(InvalidPolicySnafu)?;
        Ok(common::upgrades_available(
            state,
            policy.max_parallel_upgrades,
            max_unavailable,
        ))
    }
}

fn pods_owned_by(daemon_set: &DaemonSet, pods: &[Pod]) -> Vec<Pod> {
    let Some(uid) = daemon_set.uid() else {
        return Vec::new();
    };
    pods.iter()
        .filter(|pod| {
            pod.owner_references()
                .iter()
                .any(|owner| owner.kind == "DaemonSet" && owner.uid == uid)
        })
        .cloned()
        .collect()
}
