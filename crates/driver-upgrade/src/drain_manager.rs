//! Cordons and drains nodes in the background.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tracing::Instrument;

use crate::{
    client::ClusterClient,
    cordon_manager::{self, CordonManager},
    drain::{self, DrainHelper, PodRemoval},
    events::NodeEvent,
    node_state_provider::{self, NodeUpgradeStateProvider},
    policy::DrainSpec,
    state::UpgradeState,
    sync::StringSet,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to cordon node"))]
    Cordon { source: cordon_manager::Error },

    #[snafu(display("failed to drain node"))]
    Drain { source: drain::Error },

    #[snafu(display("failed to update upgrade state"))]
    UpdateState { source: node_state_provider::Error },
}

/// Describes which nodes to drain and how.
#[derive(Clone, Debug)]
pub struct DrainConfiguration {
    pub spec: DrainSpec,
    pub nodes: Vec<Node>,
}

/// Runs at most one cordon and drain per node at a time. Drains are not awaited by the caller,
/// each one moves its node to `pod-restart-required` or `upgrade-failed` when it ends.
#[derive(Clone)]
pub struct DrainManager {
    client: Arc<dyn ClusterClient>,
    provider: Arc<NodeUpgradeStateProvider>,
    cordon_manager: Arc<CordonManager>,
    draining_nodes: StringSet,
}

impl DrainManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        provider: Arc<NodeUpgradeStateProvider>,
        cordon_manager: Arc<CordonManager>,
    ) -> Self {
        Self {
            client,
            provider,
            cordon_manager,
            draining_nodes: StringSet::new(),
        }
    }

    /// Returns `true` while a drain of the node is running.
    pub fn is_draining(&self, node_name: &str) -> bool {
        self.draining_nodes.contains(node_name)
    }

    /// Starts a drain for every node without one in flight.
    pub fn schedule_nodes_drain(&self, config: DrainConfiguration) {
        if !config.spec.enable {
            tracing::info!("drain is disabled, skipping");
            return;
        }

        for node in config.nodes {
            let name = node.name_any();
            let Some(guard) = self.draining_nodes.claim(&name) else {
                tracing::debug!(node.name = name, "drain already in progress, skipping");
                continue;
            };

            let manager = self.clone();
            let spec = config.spec.clone();
            let span = tracing::info_span!("drain_node", node.name = name);
            tokio::spawn(
                async move {
                    let _guard = guard;
                    manager.drain(node, &spec).await;
                }
                .instrument(span),
            );
        }
    }

    async fn drain(&self, mut node: Node, spec: &DrainSpec) {
        let next_state = match self.cordon_and_drain(&mut node, spec).await {
            Ok(()) => UpgradeState::PodRestartRequired,
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to drain node"
                );
                self.publish(
                    &node,
                    NodeEvent::warning(self.reason(), format!("Failed to drain the node, {error}")),
                )
                .await;
                UpgradeState::Failed
            }
        };

        if let Err(error) = self
            .provider
            .change_node_upgrade_state(&mut node, next_state)
            .await
            .context(UpdateStateSnafu)
        {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                upgrade.state = %next_state,
                "failed to record drain outcome"
            );
        }
    }

    async fn cordon_and_drain(&self, node: &mut Node, spec: &DrainSpec) -> Result<()> {
        self.cordon_manager.cordon(node).await.context(CordonSnafu)?;

        let reporter = self.clone();
        let reporting_node = node.clone();
        let mut helper = DrainHelper::new(self.client.clone()).on_pod_removed(Arc::new(
            move |pod: &Pod, removal: PodRemoval| {
                let reporter = reporter.clone();
                let node = reporting_node.clone();
                let note = format!("{removal} pod {}", pod.name_any());
                tokio::spawn(
                    async move {
                        let event = NodeEvent::normal(reporter.reason(), note);
                        reporter.publish(&node, event).await;
                    }
                    .in_current_span(),
                );
            },
        ));
        helper.force = spec.force;
        helper.delete_empty_dir = spec.delete_empty_dir;
        helper.ignore_all_daemon_sets = true;
        helper.timeout = DrainHelper::timeout_from_seconds(spec.timeout_seconds);
        helper.pod_selector.clone_from(&spec.pod_selector);

        tracing::info!("draining node");
        helper
            .drain_node(&node.name_any())
            .await
            .context(DrainSnafu)?;
        tracing::info!("drained node");
        Ok(())
    }

    fn reason(&self) -> String {
        format!("{}DriverUpgrade", self.provider.keys().driver_name())
    }

    async fn publish(&self, node: &Node, event: NodeEvent) {
        if let Err(error) = self.client.publish_node_event(node, event).await {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to publish drain event"
            );
        }
    }
}
