//! Reads and writes the upgrade state label and annotations of nodes.
//!
//! Writes assume a single active controller instance. Within the process, writes to the same
//! node are serialized, and every write waits until a fresh read of the node reflects it, so the
//! next reconciliation never acts on the value from before the write.

use std::{num::ParseIntError, sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tokio::time::{Instant, sleep};

use crate::{
    client::{self, ClusterClient},
    events::NodeEvent,
    keys::UpgradeKeys,
    state::UpgradeState,
    sync::KeyedMutex,
    utils,
};

type Result<T, E = Error> = std::result::Result<T, E>;

const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(10);
const PROPAGATION_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get node {node:?}"))]
    GetNode { source: client::Error, node: String },

    #[snafu(display("failed to set label {key:?} on node {node:?}"))]
    PatchLabel {
        source: client::Error,
        node: String,
        key: String,
    },

    #[snafu(display("failed to set annotation {key:?} on node {node:?}"))]
    PatchAnnotation {
        source: client::Error,
        node: String,
        key: String,
    },

    #[snafu(display("annotation {key:?} of node {node:?} holds no unix timestamp: {value:?}"))]
    ParseStartTime {
        source: ParseIntError,
        node: String,
        key: String,
        value: String,
    },

    #[snafu(display("node {node:?} did not reflect the update of {key:?} within {timeout:?}"))]
    Propagation {
        node: String,
        key: String,
        timeout: Duration,
    },
}

pub struct NodeUpgradeStateProvider {
    client: Arc<dyn ClusterClient>,
    keys: UpgradeKeys,
    node_locks: KeyedMutex,
    propagation_timeout: Duration,
    propagation_interval: Duration,
}

impl NodeUpgradeStateProvider {
    pub fn new(client: Arc<dyn ClusterClient>, keys: UpgradeKeys) -> Self {
        Self {
            client,
            keys,
            node_locks: KeyedMutex::new(),
            propagation_timeout: PROPAGATION_TIMEOUT,
            propagation_interval: PROPAGATION_INTERVAL,
        }
    }

    /// Overrides how long and how often writes are checked for visibility.
    pub fn with_propagation(mut self, timeout: Duration, interval: Duration) -> Self {
        self.propagation_timeout = timeout;
        self.propagation_interval = interval;
        self
    }

    pub fn keys(&self) -> &UpgradeKeys {
        &self.keys
    }

    pub async fn get_node(&self, name: &str) -> Result<Node> {
        self.client
            .get_node(name)
            .await
            .context(GetNodeSnafu { node: name })
    }

    /// Writes the upgrade state label and refreshes `node` with the updated object.
    pub async fn change_node_upgrade_state(
        &self,
        node: &mut Node,
        new_state: UpgradeState,
    ) -> Result<()> {
        let name = node.name_any();
        let key = self.keys.state_label().to_owned();
        let value = new_state.as_ref();
        let _guard = self.node_locks.lock(&name).await;

        self.client
            .patch_node_label(&name, &key, Some(value))
            .await
            .context(PatchLabelSnafu {
                node: &name,
                key: &key,
            })?;

        *node = self
            .wait_for_node(&name, &key, |node| utils::label(node, &key) == Some(value))
            .await?;

        tracing::info!(
            node.name = name,
            upgrade.state = %new_state,
            "changed node upgrade state"
        );

        let event = NodeEvent::state_changed(self.keys.driver_name(), new_state);
        if let Err(error) = self.client.publish_node_event(node, event).await {
            tracing::warn!(
                node.name = name,
                error = &error as &dyn std::error::Error,
                "failed to publish node state change event"
            );
        }

        Ok(())
    }

    /// Sets (`Some`) or removes (`None`) an annotation and refreshes `node` with the updated
    /// object.
    pub async fn change_node_upgrade_annotation(
        &self,
        node: &mut Node,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let name = node.name_any();
        let _guard = self.node_locks.lock(&name).await;

        self.client
            .patch_node_annotation(&name, key, value)
            .await
            .context(PatchAnnotationSnafu { node: &name, key })?;

        *node = self
            .wait_for_node(&name, key, |node| utils::annotation(node, key) == value)
            .await?;

        tracing::debug!(
            node.name = name,
            annotation.key = key,
            annotation.value = value,
            "changed node upgrade annotation"
        );

        Ok(())
    }

    /// Tracks a timeout in the annotation `key`, so that it survives controller restarts.
    ///
    /// The first call records the current unix time and returns `false`. Later calls return
    /// `true` once more than `timeout` passed since the recorded time.
    pub async fn is_timed_out(&self, node: &mut Node, key: &str, timeout: Duration) -> Result<bool> {
        let now = utils::unix_now();
        let Some(value) = utils::annotation(node, key) else {
            self.change_node_upgrade_annotation(node, key, Some(&now.to_string()))
                .await?;
            return Ok(false);
        };

        let start_time: i64 = value.parse().context(ParseStartTimeSnafu {
            node: node.name_any(),
            key,
            value,
        })?;
        let timeout = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
        Ok(now > start_time.saturating_add(timeout))
    }

    /// Re-reads the node until `is_updated` holds or the propagation timeout elapses.
    async fn wait_for_node(
        &self,
        name: &str,
        key: &str,
        is_updated: impl Fn(&Node) -> bool,
    ) -> Result<Node> {
        let deadline = Instant::now() + self.propagation_timeout;

        loop {
            let node = self.get_node(name).await?;
            if is_updated(&node) {
                return Ok(node);
            }
            if Instant::now() >= deadline {
                return PropagationSnafu {
                    node: name,
                    key,
                    timeout: self.propagation_timeout,
                }
                .fail();
            }

            tracing::debug!(node.name = name, key, "waiting for node update to become visible");
            sleep(self.propagation_interval).await;
        }
    }
}
