//! Handshake that lets the driver pod wait before loading the kernel module.
//!
//! The init container of the driver pod sets the safe load annotation on its node and blocks
//! until the annotation is gone. The upgrade moves the node through cordon and drain first and
//! removes the annotation once the node is ready for the new driver.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;

use crate::{
    node_state_provider::{Error, NodeUpgradeStateProvider},
    utils,
};

pub struct SafeDriverLoadManager {
    provider: Arc<NodeUpgradeStateProvider>,
}

impl SafeDriverLoadManager {
    pub fn new(provider: Arc<NodeUpgradeStateProvider>) -> Self {
        Self { provider }
    }

    /// Returns `true` if the driver on this node waits to be allowed to load.
    pub fn is_waiting_for_safe_driver_load(&self, node: &Node) -> bool {
        utils::annotation(node, self.provider.keys().wait_for_safe_load())
            .is_some_and(|value| !value.is_empty())
    }

    /// Lets a waiting driver load by removing the annotation.
    pub async fn unblock_loading(&self, node: &mut Node) -> Result<(), Error> {
        let key = self.provider.keys().wait_for_safe_load().to_owned();
        if utils::annotation(node, &key).is_none() {
            return Ok(());
        }

        tracing::info!(node.name = ?node.metadata.name, "unblocking driver load");
        self.provider
            .change_node_upgrade_annotation(node, &key, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        keys::UpgradeKeys,
        testing::{FakeCluster, NodeBuilder},
    };

    fn manager(cluster: &Arc<FakeCluster>) -> SafeDriverLoadManager {
        SafeDriverLoadManager::new(Arc::new(NodeUpgradeStateProvider::new(
            cluster.clone(),
            UpgradeKeys::default(),
        )))
    }

    #[rstest]
    #[case(None, false)]
    #[case(Some(""), false)]
    #[case(Some("true"), true)]
    fn waiting_requires_non_empty_annotation(#[case] value: Option<&str>, #[case] expected: bool) {
        let cluster = FakeCluster::new();
        let mut builder = NodeBuilder::new("node-a");
        if let Some(value) = value {
            builder = builder.annotation(UpgradeKeys::default().wait_for_safe_load(), value);
        }

        assert_eq!(
            manager(&cluster).is_waiting_for_safe_driver_load(&builder.build()),
            expected
        );
    }

    #[tokio::test]
    async fn unblock_removes_annotation() {
        let cluster = FakeCluster::new();
        let key = UpgradeKeys::default().wait_for_safe_load().to_owned();
        cluster.add_node(NodeBuilder::new("node-a").annotation(&key, "true").build());
        let manager = manager(&cluster);
        let mut node = cluster.node("node-a");

        manager.unblock_loading(&mut node).await.unwrap();

        assert!(!manager.is_waiting_for_safe_driver_load(&node));
        assert_eq!(cluster.node_annotation("node-a", &key), None);
    }
}
