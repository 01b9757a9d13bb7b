//! The default strategy, the operator itself cordons and uncordons the node.

use async_trait::async_trait;
use snafu::ResultExt;

use super::{CommonUpgradeManager, ProcessNodeStateManager, Result, UncordonSnafu};
use crate::{
    policy::DriverUpgradePolicySpec,
    state::{ClusterUpgradeState, UpgradeState},
};

/// Cordons, drains and uncordons nodes directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct InPlaceNodeStateManager;

#[async_trait]
impl ProcessNodeStateManager for InPlaceNodeStateManager {
    async fn process_upgrade_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
        policy: &DriverUpgradePolicySpec,
    ) -> Result<()> {
        for node_state in common.take_nodes_cleared_for_upgrade(state, policy)? {
            common
                .transition(state, node_state, UpgradeState::CordonRequired)
                .await?;
        }
        Ok(())
    }

    async fn process_node_maintenance_required_nodes(
        &self,
        _common: &CommonUpgradeManager,
        _state: &mut ClusterUpgradeState,
    ) -> Result<()> {
        Ok(())
    }

    async fn process_post_maintenance_required_nodes(
        &self,
        _common: &CommonUpgradeManager,
        _state: &mut ClusterUpgradeState,
    ) -> Result<()> {
        Ok(())
    }

    async fn process_uncordon_required_nodes(
        &self,
        common: &CommonUpgradeManager,
        state: &mut ClusterUpgradeState,
    ) -> Result<()> {
        for mut node_state in state.take(UpgradeState::UncordonRequired) {
            common
                .cordon_manager()
                .uncordon(&mut node_state.node)
                .await
                .context(UncordonSnafu)?;
            common
                .transition(state, node_state, UpgradeState::Done)
                .await?;
        }
        Ok(())
    }
}
