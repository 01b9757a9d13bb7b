//! Waits for validation pods to confirm that the upgraded driver works.

use std::{sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};

use crate::{
    client::{self, ClusterClient, PodQuery},
    node_state_provider::{self, NodeUpgradeStateProvider},
    state::UpgradeState,
    utils,
};

type Result<T, E = Error> = std::result::Result<T, E>;

pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list validation pods on node {node:?}"))]
    ListPods { source: client::Error, node: String },

    #[snafu(display("failed to update node {node:?}"))]
    UpdateNode {
        source: node_state_provider::Error,
        node: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// All validation pods on the node are running and ready.
    Valid,
    /// Validation pods are missing or not ready yet.
    Pending,
    /// Validation did not finish in time, the node was moved to `upgrade-failed`.
    TimedOut,
}

pub struct ValidationManager {
    client: Arc<dyn ClusterClient>,
    provider: Arc<NodeUpgradeStateProvider>,
    pod_selector: String,
    timeout: Duration,
}

impl ValidationManager {
    /// An empty `pod_selector` disables validation.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        provider: Arc<NodeUpgradeStateProvider>,
        pod_selector: impl Into<String>,
    ) -> Self {
        Self {
            client,
            provider,
            pod_selector: pod_selector.into(),
            timeout: VALIDATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.pod_selector.is_empty()
    }

    pub async fn validate(&self, node: &mut Node) -> Result<ValidationOutcome> {
        if !self.is_enabled() {
            return Ok(ValidationOutcome::Valid);
        }

        let node_name = node.name_any();
        let key = self.provider.keys().validation_start_time().to_owned();
        let pods = self
            .client
            .list_pods(
                &PodQuery::all()
                    .with_labels(self.pod_selector.clone())
                    .on_node(&node_name),
            )
            .await
            .context(ListPodsSnafu { node: &node_name })?;

        if pods.is_empty() || !pods.iter().all(utils::is_pod_running_and_ready) {
            tracing::info!(
                node.name = node_name,
                validation_pods = pods.len(),
                "validation not completed yet"
            );
            return self.handle_timeout(node, &key).await;
        }

        if utils::annotation(node, &key).is_some() {
            self.provider
                .change_node_upgrade_annotation(node, &key, None)
                .await
                .context(UpdateNodeSnafu { node: &node_name })?;
        }
        Ok(ValidationOutcome::Valid)
    }

    async fn handle_timeout(&self, node: &mut Node, key: &str) -> Result<ValidationOutcome> {
        let node_name = node.name_any();
        let timed_out = self
            .provider
            .is_timed_out(node, key, self.timeout)
            .await
            .context(UpdateNodeSnafu { node: &node_name })?;
        if !timed_out {
            return Ok(ValidationOutcome::Pending);
        }

        tracing::warn!(
            node.name = node_name,
            timeout = ?self.timeout,
            "validation did not complete in time"
        );
        self.provider
            .change_node_upgrade_state(node, UpgradeState::Failed)
            .await
            .context(UpdateNodeSnafu { node: &node_name })?;
        self.provider
            .change_node_upgrade_annotation(node, key, None)
            .await
            .context(UpdateNodeSnafu { node: &node_name })?;
        Ok(ValidationOutcome::TimedOut)
    }
}
