//! Marks nodes unschedulable before the driver is replaced and schedulable again afterwards.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};

use crate::client::{self, ClusterClient};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to cordon node {node:?}"))]
    Cordon { source: client::Error, node: String },

    #[snafu(display("failed to uncordon node {node:?}"))]
    Uncordon { source: client::Error, node: String },
}

/// Marks nodes (un)schedulable.
pub struct CordonManager {
    client: Arc<dyn ClusterClient>,
}

impl CordonManager {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Marks the node unschedulable and refreshes `node` with the updated object.
    pub async fn cordon(&self, node: &mut Node) -> Result<()> {
        let name = node.name_any();
        *node = self
            .client
            .set_node_unschedulable(&name, true)
            .await
            .context(CordonSnafu { node: &name })?;
        tracing::info!(node.name = name, "cordoned node");
        Ok(())
    }

    /// Marks the node schedulable and refreshes `node` with the updated object.
    pub async fn uncordon(&self, node: &mut Node) -> Result<()> {
        let name = node.name_any();
        *node = self
            .client
            .set_node_unschedulable(&name, false)
            .await
            .context(UncordonSnafu { node: &name })?;
        tracing::info!(node.name = name, "uncordoned node");
        Ok(())
    }
}
