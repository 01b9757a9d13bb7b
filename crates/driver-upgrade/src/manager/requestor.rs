//! Delegation of cordon, wait for jobs and drain to the maintenance operator.
//!
//! For every node cleared for an upgrade a [`NodeMaintenance`] object is requested. Once the
//! maintenance operator reports it as ready the driver pod is restarted as usual. After the
//! upgrade the request is released, which makes the maintenance operator uncordon the node.
//!
//! Several operators may share one object (same name prefix). The first creates it, the others
//! add themselves to `additionalRequestors`. The creator deletes it once everybody else left.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use snafu::ResultExt;

use super::{
    CommonUpgradeManager, CreateNodeMaintenanceSnafu, DeleteNodeMaintenanceSnafu,
    GetNodeMaintenanceSnafu, InPlaceNodeStateManager, ProcessNodeStateManager, Result,
    UpdateNodeMaintenanceSnafu,
};
use crate::{
    cli::RequestorOptions,
    client::ClusterClient,
    crd::node_maintenance::{
        DrainSpec, NodeMaintenance, NodeMaintenanceSpec, PodEvictionFiltersEntry,
        WaitForPodCompletionSpec,
    },
    keys::TRUE,
    policy::DriverUpgradePolicySpec,
    state::{ClusterUpgradeState, UpgradeState},
};

pub struct RequestorNodeStateManager {
    options: RequestorOptions,
    in_place: InPlaceNodeStateManager,
}

impl RequestorNodeStateManager {
    pub fn new(options: RequestorOptions) -> Self {
        Self {
            options,
            in_place: InPlaceNodeStateManager,
        }
    }

    pub fn options(&self) -> &RequestorOptions {
        &self.options
    }

    fn node_maintenance_spec(
        &self,
        node_name: &str,
        policy: &DriverUpgradePolicySpec,
    ) -> NodeMaintenanceSpec {
        let wait_for_pod_completion = policy
            .wait_for_completion
            .as_ref()
            .filter(|spec| !spec.pod_selector.is_empty())
            .map(|spec| WaitForPodCompletionSpec {
                pod_selector: spec.pod_selector.clone(),
                timeout_seconds: spec.timeout_seconds,
            });
        let drain_spec = policy
            .drain
            .as_ref()
            .filter(|spec| spec.enable)
            .map(|spec| DrainSpec {
                force: spec.force,
                pod_selector: spec.pod_selector.clone(),
                timeout_seconds: spec.timeout_seconds,
                delete_empty_dir: spec.delete_empty_dir,
                pod_eviction_filters: self
                    .options
                    .pod_eviction_filters
                    .iter()
                    .map(|regex| PodEvictionFiltersEntry {
                        by_resource_name_regex: regex.clone(),
                    })
                    .collect(),
            });

        NodeMaintenanceSpec {
            requestor_id: self.options.requestor_id.clone(),
            additional_requestors: Vec::new(),
            node_name: node_name.to_owned(),
            cordon: true,
            wait_for_pod_completion,
            drain_spec,
        }
    }

    /// Creates the `NodeMaintenance` object of a node, or joins it if another operator created
    /// it already.
    async fn request_node_maintenance(
        &self,
        client: &dyn ClusterClient,
        node: &Node,
        policy: &DriverUpgradePolicySpec,
    ) -> Result<NodeMaintenance> {
        let node_name = node.name_any();
        let namespace = &self.options.namespace;
        let name = self.options.node_maintenance_name(&node_name);

        match client.get_node_maintenance(namespace, &name).await {
            Ok(existing) if existing.is_requested_by(&self.options.requestor_id) => Ok(existing),
            Ok(existing) => {
                tracing::info!(
                    node.name = node_name,
                    node_maintenance = name,
                    owner = existing.spec.requestor_id,
                    "joining NodeMaintenance of another requestor"
                );
                let mut requestors = existing.spec.additional_requestors.clone();
                requestors.push(self.options.requestor_id.clone());
                client
                    .update_node_maintenance_requestors(
                        namespace,
                        &name,
                        existing.metadata.resource_version.as_deref(),
                        &requestors,
                    )
                    .await
                    .context(UpdateNodeMaintenanceSnafu { name })
            }
            Err(error) if error.is_not_found() => {
                tracing::info!(
                    node.name = node_name,
                    node_maintenance = name,
                    "creating NodeMaintenance"
                );
                let mut node_maintenance =
                    NodeMaintenance::new(&name, self.node_maintenance_spec(&node_name, policy));
                node_maintenance.metadata.namespace = Some(namespace.clone());
                client
                    .create_node_maintenance(&node_maintenance)
                    .await
                    .context(CreateNodeMaintenanceSnafu { name })
            }
            Err(source) => Err(source).context(GetNodeMaintenanceSnafu { name }),
        }
    }

    /// Deletes the `NodeMaintenance` object if we created it, otherwise leaves it.
    async fn release_node_maintenance(
        &self,
        client: &dyn ClusterClient,
        node_maintenance: &NodeMaintenance,
    ) -> Result<()> {
        let name = node_maintenance.name_any();
        let namespace = node_maintenance
            .namespace()
            .unwrap_or_else(|| self.options.namespace.clone());
        let requestor_id = &self.options.requestor_id;

        if node_maintenance.spec.requestor_id == *requestor_id {
            tracing::info!(node_maintenance = name, "deleting NodeMaintenance");
            return match client.delete_node_maintenance(&namespace, &name).await {
                Err(error) if error.is_not_found() => Ok(()),
                result => result.context(DeleteNodeMaintenanceSnafu { name }),
            };
        }

        if !node_maintenance.is_requested_by(requestor_id) {
            return Ok(());
        }
        tracing::info!(node_maintenance = name, "leaving NodeMaintenance");
        let requestors: Vec<String> = node_maintenance
            .spec
            .additional_requestors
            .iter()
            .filter(|requestor| *requestor != requestor_id)
            .cloned()
            .collect();
        match client
            .update_node_maintenance_requestors(
                &namespace,
                &name,
                node_maintenance.metadata.resource_version.as_deref(),
                &requestors,
            )
            .await
        {
            Err(error) if error.is_not_found() => Ok(()),
            result => result.map(|_| ()).context(UpdateNodeMaintenanceSnafu { name }),
        }
    }
}

#[async_trait]
impl ProcessNodeStateManager for RequestorNodeStateManager {
    async fn process_upgrade_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
        policy: &DriverUpgradePolicySpec,
    ) -> Result<()> {
        for mut node_state in common.take_nodes_cleared_for_upgrade(state, policy)? {
            let node_maintenance = self
                .request_node_maintenance(common.client().as_ref(), &node_state.node, policy)
                .await?;
            node_state.node_maintenance = Some(node_maintenance);

            let key = common.keys().requestor_mode().to_owned();
            common
                .change_annotation(&mut node_state.node, &key, Some(TRUE))
                .await?;
            common
                .transition(state, node_state, UpgradeState::NodeMaintenanceRequired)
                .await?;
        }
        Ok(())
    }

    async fn process_node_maintenance_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
    ) -> Result<()> {
        for node_state in state.take(UpgradeState::NodeMaintenanceRequired) {
            let node_name = node_state.node_name();
            match &node_state.node_maintenance {
                None => {
                    tracing::warn!(
                        node.name = node_name,
                        "NodeMaintenance is missing, requesting it again"
                    );
                    common
                        .transition(state, node_state, UpgradeState::UpgradeRequired)
                        .await?;
                }
                Some(node_maintenance) if node_maintenance.is_ready() => {
                    tracing::info!(node.name = node_name, "node maintenance is ready");
                    common
                        .transition(state, node_state, UpgradeState::PostMaintenanceRequired)
                        .await?;
                }
                Some(_) => {
                    tracing::debug!(node.name = node_name, "waiting for node maintenance");
                    state.insert(UpgradeState::NodeMaintenanceRequired, node_state);
                }
            }
        }
        Ok(())
    }

    async fn process_post_maintenance_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
    ) -> Result<()> {
        for node_state in state.take(UpgradeState::PostMaintenanceRequired) {
            common
                .transition(state, node_state, UpgradeState::PodRestartRequired)
                .await?;
        }
        Ok(())
    }

    async fn process_uncordon_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
    ) -> Result<()> {
        // Nodes upgraded before requestor mode was enabled are still uncordoned directly.
        let (requestor_nodes, in_place_nodes): (Vec<_>, Vec<_>) = state
            .take(UpgradeState::UncordonRequired)
            .into_iter()
            .partition(|node_state| common.is_node_in_requestor_mode(&node_state.node));
        for node_state in in_place_nodes {
            state.insert(UpgradeState::UncordonRequired, node_state);
        }
        self.in_place
            .process_uncordon_required_nodes(common, state)
            .await?;

        for mut node_state in requestor_nodes {
            if let Some(node_maintenance) = node_state.node_maintenance.take() {
                self.release_node_maintenance(common.client().as_ref(), &node_maintenance)
                    .await?;
            }

            for key in [common.keys().requestor_mode(), common.keys().initial_state()] {
                common
                    .change_annotation(&mut node_state.node, key, None)
                    .await?;
            }
            common
                .transition(state, node_state, UpgradeState::Done)
                .await?;
        }
        Ok(())
    }

    async fn node_maintenance(
        &self,
        client: &dyn ClusterClient,
        node_name: &str,
    ) -> Result<Option<NodeMaintenance>> {
        let name = self.options.node_maintenance_name(node_name);
        match client
            .get_node_maintenance(&self.options.namespace, &name)
            .await
        {
            Ok(node_maintenance) => Ok(Some(node_maintenance)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(source) => Err(source).context(GetNodeMaintenanceSnafu { name }),
        }
    }
}
