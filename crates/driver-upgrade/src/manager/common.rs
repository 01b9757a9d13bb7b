//! Phases shared by both node maintenance strategies.

use std::{sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use snafu::ResultExt;

use super::{
    CordonSnafu, DriverRevisionSnafu, PodCompletionSnafu, RestartPodsSnafu, Result,
    UpdateNodeSnafu,
};
use crate::{
    client::ClusterClient,
    cordon_manager::CordonManager,
    drain_manager::{DrainConfiguration, DrainManager},
    keys::{TRUE, UpgradeKeys},
    node_state_provider::NodeUpgradeStateProvider,
    pod_manager::{PodDeletionFilter, PodManager, PodManagerConfig},
    policy::DriverUpgradePolicySpec,
    safe_driver_load::SafeDriverLoadManager,
    state::{ClusterUpgradeState, NodeUpgradeState, UpgradeState},
    utils,
    validation_manager::{ValidationManager, ValidationOutcome},
};

/// Number of `upgrade-required` nodes that may start their upgrade.
///
/// Limited by `max_parallel_upgrades` (`0` means no limit) minus the upgrades in progress, and
/// by `max_unavailable` minus the nodes that are unavailable already.
pub fn upgrades_available(
    state: &ClusterUpgradeState,
    max_parallel_upgrades: u32,
    max_unavailable: usize,
) -> usize {
    let available = if max_parallel_upgrades == 0 {
        state.upgrades_pending()
    } else {
        (max_parallel_upgrades as usize).saturating_sub(state.upgrades_in_progress())
    };
    if available == 0 {
        return 0;
    }

    let unavailable = state.current_unavailable_nodes();
    if available + unavailable > max_unavailable {
        max_unavailable.saturating_sub(unavailable)
    } else {
        available
    }
}

/// How the driver pod of a node relates to its DaemonSet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodSyncStatus {
    Synced,
    Outdated,
    /// The pod has no DaemonSet, so it can never become synced.
    Orphaned,
}

pub struct CommonUpgradeManager {
    client: Arc<dyn ClusterClient>,
    provider: Arc<NodeUpgradeStateProvider>,
    cordon_manager: Arc<CordonManager>,
    drain_manager: DrainManager,
    pod_manager: PodManager,
    validation_manager: ValidationManager,
    safe_driver_load_manager: SafeDriverLoadManager,
    pod_deletion_enabled: bool,
}

impl CommonUpgradeManager {
    pub fn new(client: Arc<dyn ClusterClient>, keys: UpgradeKeys) -> Self {
        let provider = Arc::new(NodeUpgradeStateProvider::new(client.clone(), keys));
        let cordon_manager = Arc::new(CordonManager::new(client.clone()));

        Self {
            drain_manager: DrainManager::new(
                client.clone(),
                provider.clone(),
                cordon_manager.clone(),
            ),
            pod_manager: PodManager::new(client.clone(), provider.clone(), None),
            validation_manager: ValidationManager::new(client.clone(), provider.clone(), ""),
            safe_driver_load_manager: SafeDriverLoadManager::new(provider.clone()),
            pod_deletion_enabled: false,
            client,
            provider,
            cordon_manager,
        }
    }

    pub fn with_pod_deletion_filter(mut self, filter: PodDeletionFilter) -> Self {
        self.pod_manager =
            PodManager::new(self.client.clone(), self.provider.clone(), Some(filter));
        self.pod_deletion_enabled = true;
        self
    }

    pub fn with_validation(mut self, pod_selector: &str, timeout: Duration) -> Self {
        self.validation_manager =
            ValidationManager::new(self.client.clone(), self.provider.clone(), pod_selector)
                .with_timeout(timeout);
        self
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    pub fn provider(&self) -> &NodeUpgradeStateProvider {
        &self.provider
    }

    pub fn cordon_manager(&self) -> &CordonManager {
        &self.cordon_manager
    }

    pub fn drain_manager(&self) -> &DrainManager {
        &self.drain_manager
    }

    pub fn pod_manager(&self) -> &PodManager {
        &self.pod_manager
    }

    pub fn keys(&self) -> &UpgradeKeys {
        self.provider.keys()
    }

    /// Workload pods are deleted before the driver restarts if the policy asks for it and a
    /// filter selecting them was configured.
    pub fn is_pod_deletion_enabled(&self, policy: &DriverUpgradePolicySpec) -> bool {
        self.pod_deletion_enabled && policy.pod_deletion.is_some()
    }

    pub fn is_upgrade_requested(&self, node: &Node) -> bool {
        utils::annotation(node, self.keys().upgrade_requested()) == Some(TRUE)
    }

    /// Skipped nodes stay in `upgrade-required`. The flag is honoured as label and annotation.
    pub fn is_upgrade_skipped(&self, node: &Node) -> bool {
        let key = self.keys().skip_node();
        utils::label(node, key) == Some(TRUE) || utils::annotation(node, key) == Some(TRUE)
    }

    pub fn is_node_in_requestor_mode(&self, node: &Node) -> bool {
        utils::annotation(node, self.keys().requestor_mode()) == Some(TRUE)
    }

    pub async fn change_state(&self, node: &mut Node, new_state: UpgradeState) -> Result<()> {
        self.provider
            .change_node_upgrade_state(node, new_state)
            .await
            .context(UpdateNodeSnafu {
                node: node.name_any(),
            })
    }

    pub async fn change_annotation(
        &self,
        node: &mut Node,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        self.provider
            .change_node_upgrade_annotation(node, key, value)
            .await
            .context(UpdateNodeSnafu {
                node: node.name_any(),
            })
    }

    /// Changes the state of a node and moves it to the matching bucket of `state`.
    pub async fn transition(
        &self,
        state: &mut ClusterUpgradeState,
        mut node_state: NodeUpgradeState,
        new_state: UpgradeState,
    ) -> Result<()> {
        self.change_state(&mut node_state.node, new_state).await?;
        state.insert(new_state, node_state);
        Ok(())
    }

    pub async fn pod_sync_status(&self, node_state: &NodeUpgradeState) -> Result<PodSyncStatus> {
        let Some(daemon_set) = node_state.driver_daemon_set.as_ref() else {
            return Ok(PodSyncStatus::Orphaned);
        };
        if node_state.is_orphaned() {
            return Ok(PodSyncStatus::Orphaned);
        }

        let node = node_state.node_name();
        let pod_hash = PodManager::get_pod_controller_revision_hash(&node_state.driver_pod)
            .context(DriverRevisionSnafu { node: &node })?;
        let daemon_set_hash = self
            .pod_manager
            .get_daemon_set_controller_revision_hash(daemon_set)
            .await
            .context(DriverRevisionSnafu { node: &node })?;

        Ok(if pod_hash == daemon_set_hash {
            PodSyncStatus::Synced
        } else {
            PodSyncStatus::Outdated
        })
    }

    /// The driver pod runs the current revision and all its containers are ready.
    pub async fn is_driver_pod_in_sync(&self, node_state: &NodeUpgradeState) -> Result<bool> {
        Ok(self.pod_sync_status(node_state).await? == PodSyncStatus::Synced
            && utils::is_pod_running_and_ready(&node_state.driver_pod))
    }

    /// Flags nodes for an upgrade if their driver pod is outdated or orphaned, the driver waits
    /// for a safe load or an upgrade was requested. Unknown nodes not needing one are done.
    pub async fn process_done_or_unknown_nodes(
        &self,
        state: &mut ClusterUpgradeState,
        bucket: UpgradeState,
    ) -> Result<()> {
        for mut node_state in state.take(bucket) {
            let node_name = node_state.node_name();
            let sync_status = self.pod_sync_status(&node_state).await?;
            let upgrade_requested = self.is_upgrade_requested(&node_state.node);
            let waiting_for_safe_load = self
                .safe_driver_load_manager
                .is_waiting_for_safe_driver_load(&node_state.node);
            if waiting_for_safe_load {
                tracing::info!(node.name = node_name, "driver is waiting for safe load");
            }

            if sync_status != PodSyncStatus::Synced || waiting_for_safe_load || upgrade_requested {
                // Remember that the node was cordoned before, so that it is left cordoned.
                if utils::is_node_unschedulable(&node_state.node) {
                    let key = self.keys().initial_state().to_owned();
                    self.change_annotation(&mut node_state.node, &key, Some(TRUE))
                        .await?;
                }
                if upgrade_requested {
                    let key = self.keys().upgrade_requested().to_owned();
                    self.change_annotation(&mut node_state.node, &key, None)
                        .await?;
                }
                tracing::info!(
                    node.name = node_name,
                    pod.sync = ?sync_status,
                    upgrade_requested,
                    "node requires driver upgrade"
                );
                self.transition(state, node_state, UpgradeState::UpgradeRequired)
                    .await?;
                continue;
            }

            if bucket == UpgradeState::Unknown {
                self.transition(state, node_state, UpgradeState::Done)
                    .await?;
            } else {
                state.insert(bucket, node_state);
            }
        }
        Ok(())
    }

    /// Removes the nodes that may start their upgrade from the `upgrade-required` bucket.
    ///
    /// Skipped nodes always stay. Nodes cordoned by an administrator are let through even when
    /// no upgrade slot is left, since taking them out of service costs nothing.
    pub fn take_nodes_cleared_for_upgrade(
        &self,
        state: &mut ClusterUpgradeState,
        policy: &DriverUpgradePolicySpec,
    ) -> Result<Vec<NodeUpgradeState>> {
        let max_unavailable = policy
            .max_unavailable_nodes(state.total_managed_nodes())
            .context(super::InvalidPolicySnafu)?;
        let mut available = upgrades_available(state, policy.max_parallel_upgrades, max_unavailable);

        let mut cleared = Vec::new();
        for node_state in state.take(UpgradeState::UpgradeRequired) {
            let node_name = node_state.node_name();
            if self.is_upgrade_skipped(&node_state.node) {
                tracing::info!(node.name = node_name, "node is marked for skipping upgrades");
                state.insert(UpgradeState::UpgradeRequired, node_state);
                continue;
            }

            if available == 0 {
                if !utils::is_node_unschedulable(&node_state.node) {
                    tracing::debug!(
                        node.name = node_name,
                        "node upgrade limit reached, pausing further upgrades"
                    );
                    state.insert(UpgradeState::UpgradeRequired, node_state);
                    continue;
                }
                tracing::debug!(
                    node.name = node_name,
                    "node is already cordoned, progressing with driver upgrade"
                );
            } else {
                available -= 1;
            }
            cleared.push(node_state);
        }
        Ok(cleared)
    }

    pub async fn process_cordon_required_nodes(
        &self,
        state: &mut ClusterUpgradeState,
    ) -> Result<()> {
        for mut node_state in state.take(UpgradeState::CordonRequired) {
            self.cordon_manager
                .cordon(&mut node_state.node)
                .await
                .context(CordonSnafu)?;
            self.transition(state, node_state, UpgradeState::WaitForJobsRequired)
                .await?;
        }
        Ok(())
    }

    pub async fn process_wait_for_jobs_required_nodes(
        &self,
        state: &mut ClusterUpgradeState,
        policy: &DriverUpgradePolicySpec,
    ) -> Result<()> {
        let next_state = if self.is_pod_deletion_enabled(policy) {
            UpgradeState::PodDeletionRequired
        } else {
            UpgradeState::DrainRequired
        };

        let waiting = state.take(UpgradeState::WaitForJobsRequired);
        if policy.wait_for_completion_selector().is_none() {
            for node_state in waiting {
                self.transition(state, node_state, next_state).await?;
            }
            return Ok(());
        }

        let config = PodManagerConfig {
            nodes: waiting.iter().map(|node_state| node_state.node.clone()).collect(),
            deletion_spec: self
                .is_pod_deletion_enabled(policy)
                .then(|| policy.pod_deletion.clone())
                .flatten(),
            wait_for_completion_spec: policy.wait_for_completion.clone(),
            drain_enabled: policy.drain_enabled(),
        };
        let advanced = self
            .pod_manager
            .schedule_check_on_pod_completion(&config)
            .await
            .context(PodCompletionSnafu)?;

        for mut node_state in waiting {
            let node_name = node_state.node_name();
            match advanced.iter().find(|node| node.name_any() == node_name) {
                Some(node) => {
                    node_state.node = node.clone();
                    state.insert(next_state, node_state);
                }
                None => state.insert(UpgradeState::WaitForJobsRequired, node_state),
            }
        }
        Ok(())
    }

    /// Starts removing workload pods in the background, or skips ahead to `drain-required`.
    pub async fn process_pod_deletion_required_nodes(
        &self,
        state: &mut ClusterUpgradeState,
        policy: &DriverUpgradePolicySpec,
    ) -> Result<()> {
        let nodes = state.take(UpgradeState::PodDeletionRequired);
        if !self.is_pod_deletion_enabled(policy) {
            for node_state in nodes {
                self.transition(state, node_state, UpgradeState::DrainRequired)
                    .await?;
            }
            return Ok(());
        }

        self.pod_manager.schedule_pod_eviction(&PodManagerConfig {
            nodes: nodes.iter().map(|node_state| node_state.node.clone()).collect(),
            deletion_spec: policy.pod_deletion.clone(),
            wait_for_completion_spec: None,
            drain_enabled: policy.drain_enabled(),
        });
        for node_state in nodes {
            state.insert(UpgradeState::PodDeletionRequired, node_state);
        }
        Ok(())
    }

    /// Starts draining nodes in the background, or skips ahead to `pod-restart-required`.
    pub async fn process_drain_nodes(
        &self,
        state: &mut ClusterUpgradeState,
        policy: &DriverUpgradePolicySpec,
    ) -> Result<()> {
        let nodes = state.take(UpgradeState::DrainRequired);
        let Some(spec) = policy.drain.clone().filter(|spec| spec.enable) else {
            for node_state in nodes {
                self.transition(state, node_state, UpgradeState::PodRestartRequired)
                    .await?;
            }
            return Ok(());
        };

        self.drain_manager.schedule_nodes_drain(DrainConfiguration {
            spec,
            nodes: nodes.iter().map(|node_state| node_state.node.clone()).collect(),
        });
        for node_state in nodes {
            state.insert(UpgradeState::DrainRequired, node_state);
        }
        Ok(())
    }

    /// Restarts outdated driver pods and moves nodes on once the new driver runs.
    pub async fn process_pod_restart_nodes(&self, state: &mut ClusterUpgradeState) -> Result<()> {
        let mut pods_to_restart: Vec<Pod> = Vec::new();

        for mut node_state in state.take(UpgradeState::PodRestartRequired) {
            let node_name = node_state.node_name();
            if self.pod_sync_status(&node_state).await? != PodSyncStatus::Synced {
                if utils::is_pod_terminating(&node_state.driver_pod) {
                    tracing::debug!(node.name = node_name, "driver pod is already terminating");
                } else {
                    pods_to_restart.push(node_state.driver_pod.clone());
                }
                state.insert(UpgradeState::PodRestartRequired, node_state);
                continue;
            }

            // The new driver may wait for the safe load handshake after a restart mid upgrade.
            self.safe_driver_load_manager
                .unblock_loading(&mut node_state.node)
                .await
                .context(UpdateNodeSnafu { node: &node_name })?;

            if self.is_driver_pod_in_sync(&node_state).await? {
                if self.validation_manager.is_enabled() {
                    self.transition(state, node_state, UpgradeState::ValidationRequired)
                        .await?;
                } else {
                    self.update_node_to_uncordon_or_done(state, node_state)
                        .await?;
                }
            } else if utils::is_pod_failing(&node_state.driver_pod) {
                tracing::warn!(node.name = node_name, "driver pod is failing");
                self.transition(state, node_state, UpgradeState::Failed)
                    .await?;
            } else {
                state.insert(UpgradeState::PodRestartRequired, node_state);
            }
        }

        self.pod_manager
            .schedule_pods_restart(&pods_to_restart)
            .await
            .context(RestartPodsSnafu)
    }

    /// Recovers failed nodes once their driver pod runs the current revision.
    pub async fn process_upgrade_failed_nodes(
        &self,
        state: &mut ClusterUpgradeState,
    ) -> Result<()> {
        for node_state in state.take(UpgradeState::Failed) {
            if !self.is_driver_pod_in_sync(&node_state).await? {
                state.insert(UpgradeState::Failed, node_state);
                continue;
            }

            tracing::info!(node.name = node_state.node_name(), "driver recovered");
            if self.validation_manager.is_enabled() {
                self.transition(state, node_state, UpgradeState::ValidationRequired)
                    .await?;
            } else {
                self.update_node_to_uncordon_or_done(state, node_state)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn process_validation_required_nodes(
        &self,
        state: &mut ClusterUpgradeState,
    ) -> Result<()> {
        for mut node_state in state.take(UpgradeState::ValidationRequired) {
            let node_name = node_state.node_name();
            match self.validation_manager.validate(&mut node_state.node).await {
                Ok(ValidationOutcome::Valid) => {
                    self.update_node_to_uncordon_or_done(state, node_state)
                        .await?;
                }
                Ok(ValidationOutcome::Pending) => {
                    tracing::info!(node.name = node_name, "validation not done yet");
                    state.insert(UpgradeState::ValidationRequired, node_state);
                }
                Ok(ValidationOutcome::TimedOut) => {
                    state.insert(UpgradeState::Failed, node_state);
                }
                Err(error) => {
                    tracing::error!(
                        node.name = node_name,
                        error = &error as &dyn std::error::Error,
                        "failed to validate driver"
                    );
                    state.insert(UpgradeState::ValidationRequired, node_state);
                }
            }
        }
        Ok(())
    }

    /// Finishes a node. Nodes that were unschedulable before the upgrade skip the uncordon and
    /// lose the annotation recording that. Nodes in requestor mode are always uncordoned by the
    /// maintenance operator.
    pub async fn update_node_to_uncordon_or_done(
        &self,
        state: &mut ClusterUpgradeState,
        mut node_state: NodeUpgradeState,
    ) -> Result<()> {
        let key = self.keys().initial_state().to_owned();
        let initially_unschedulable = utils::annotation(&node_state.node, &key).is_some();

        if initially_unschedulable && !self.is_node_in_requestor_mode(&node_state.node) {
            self.change_state(&mut node_state.node, UpgradeState::Done)
                .await?;
            self.change_annotation(&mut node_state.node, &key, None)
                .await?;
            state.insert(UpgradeState::Done, node_state);
            return Ok(());
        }

        self.transition(state, node_state, UpgradeState::UncordonRequired)
            .await
    }
}
