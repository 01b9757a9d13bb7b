//! Driver pod revisions and removal of workload pods.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use k8s_openapi::api::{
    apps::v1::DaemonSet,
    core::v1::{Node, Pod},
};
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::Instrument;

use crate::{
    client::{self, ClusterClient, PodQuery},
    drain::{self, DrainHelper, PodFilter},
    events::NodeEvent,
    keys::POD_CONTROLLER_REVISION_HASH_LABEL,
    label_selector::{LabelSelectorExt, SelectorError},
    node_state_provider::{self, NodeUpgradeStateProvider},
    policy::{PodDeletionSpec, WaitForCompletionSpec},
    state::UpgradeState,
    sync::StringSet,
    utils,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("pod {pod:?} has no {POD_CONTROLLER_REVISION_HASH_LABEL:?} label"))]
    MissingPodRevisionHash { pod: String },

    #[snafu(display("DaemonSet {daemon_set:?} has no selector"))]
    MissingSelector { daemon_set: String },

    #[snafu(display("DaemonSet {daemon_set:?} has an invalid selector"))]
    InvalidSelector {
        source: SelectorError,
        daemon_set: String,
    },

    #[snafu(display("failed to list ControllerRevisions of DaemonSet {daemon_set:?}"))]
    ListControllerRevisions {
        source: client::Error,
        daemon_set: String,
    },

    #[snafu(display("DaemonSet {daemon_set:?} has no ControllerRevisions"))]
    NoControllerRevisions { daemon_set: String },

    #[snafu(display("failed to list pods on node {node:?}"))]
    ListPods { source: client::Error, node: String },

    #[snafu(display("failed to delete pod {pod:?}"))]
    DeletePod { source: client::Error, pod: String },

    #[snafu(display("failed to remove workload pods from node {node:?}"))]
    RemoveWorkloadPods { source: drain::Error, node: String },

    #[snafu(display("only {deletable} of {expected} workload pods on node {node:?} can be deleted"))]
    EvictionIncomplete {
        node: String,
        expected: usize,
        deletable: usize,
    },

    #[snafu(display("failed to update node {node:?}"))]
    UpdateNode {
        source: node_state_provider::Error,
        node: String,
    },
}

/// Selects the workload pods that have to be removed before the driver can be restarted.
pub type PodDeletionFilter = PodFilter;

/// The nodes and policy for one scheduling call.
#[derive(Clone, Debug, Default)]
pub struct PodManagerConfig {
    pub nodes: Vec<Node>,
    pub deletion_spec: Option<PodDeletionSpec>,
    pub wait_for_completion_spec: Option<WaitForCompletionSpec>,
    pub drain_enabled: bool,
}

#[derive(Clone)]
pub struct PodManager {
    client: Arc<dyn ClusterClient>,
    provider: Arc<NodeUpgradeStateProvider>,
    pod_deletion_filter: Option<PodDeletionFilter>,
    nodes_in_progress: StringSet,
}

impl PodManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        provider: Arc<NodeUpgradeStateProvider>,
        pod_deletion_filter: Option<PodDeletionFilter>,
    ) -> Self {
        Self {
            client,
            provider,
            pod_deletion_filter,
            nodes_in_progress: StringSet::new(),
        }
    }

    /// Returns `true` while workload pods of the node are being evicted.
    pub fn is_evicting(&self, node_name: &str) -> bool {
        self.nodes_in_progress.contains(node_name)
    }

    /// The template revision a pod was created from.
    pub fn get_pod_controller_revision_hash(pod: &Pod) -> Result<String> {
        pod.labels()
            .get(POD_CONTROLLER_REVISION_HASH_LABEL)
            .cloned()
            .context(MissingPodRevisionHashSnafu {
                pod: pod.name_any(),
            })
    }

    /// The current template revision of a DaemonSet, taken from the ControllerRevision with the
    /// highest revision number.
    pub async fn get_daemon_set_controller_revision_hash(
        &self,
        daemon_set: &DaemonSet,
    ) -> Result<String> {
        let name = daemon_set.name_any();
        let namespace = daemon_set.namespace().unwrap_or_default();
        let selector = daemon_set
            .spec
            .as_ref()
            .map(|spec| &spec.selector)
            .context(MissingSelectorSnafu { daemon_set: &name })?
            .to_query_string()
            .context(InvalidSelectorSnafu { daemon_set: &name })?;

        let prefix = format!("{name}-");
        let mut revisions = self
            .client
            .list_controller_revisions(&namespace, &selector)
            .await
            .context(ListControllerRevisionsSnafu { daemon_set: &name })?;
        revisions.retain(|revision| revision.name_any().starts_with(&prefix));
        revisions.sort_by_key(|revision| revision.revision);

        let current = revisions
            .last()
            .context(NoControllerRevisionsSnafu { daemon_set: &name })?
            .name_any();
        Ok(current
            .strip_prefix(&prefix)
            .unwrap_or(current.as_str())
            .to_owned())
    }

    /// Starts removing the workload pods selected by the deletion filter from every node that
    /// has no removal in flight. Each node moves on to `pod-restart-required` on success. If not
    /// every selected pod can be removed, nothing is removed and the node moves to
    /// `drain-required` (drain enabled) or `upgrade-failed`.
    pub fn schedule_pod_eviction(&self, config: &PodManagerConfig) {
        let deletion_spec = config.deletion_spec.clone().unwrap_or_default();

        for node in &config.nodes {
            let name = node.name_any();
            let Some(guard) = self.nodes_in_progress.claim(&name) else {
                tracing::debug!(node.name = name, "pod eviction already in progress, skipping");
                continue;
            };

            let manager = self.clone();
            let node = node.clone();
            let deletion_spec = deletion_spec.clone();
            let drain_enabled = config.drain_enabled;
            let span = tracing::info_span!("evict_pods", node.name = name);
            tokio::spawn(
                async move {
                    let _guard = guard;
                    manager.evict(node, &deletion_spec, drain_enabled).await;
                }
                .instrument(span),
            );
        }
    }

    async fn evict(&self, mut node: Node, spec: &PodDeletionSpec, drain_enabled: bool) {
        let next_state = match self.evict_pods(&node, spec).await {
            Ok(()) => UpgradeState::PodRestartRequired,
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to delete workload pods"
                );
                self.publish(
                    &node,
                    NodeEvent::warning(self.reason(), format!("Failed to delete workload pods, {error}")),
                )
                .await;
                if drain_enabled {
                    UpgradeState::DrainRequired
                } else {
                    UpgradeState::Failed
                }
            }
        };

        if let Err(error) = self
            .provider
            .change_node_upgrade_state(&mut node, next_state)
            .await
        {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                upgrade.state = %next_state,
                "failed to record pod eviction outcome"
            );
        }
    }

    async fn evict_pods(&self, node: &Node, spec: &PodDeletionSpec) -> Result<()> {
        let node_name = node.name_any();
        let Some(filter) = self.pod_deletion_filter.clone() else {
            tracing::info!("no pod deletion filter configured, nothing to delete");
            return Ok(());
        };

        let pods = self
            .client
            .list_pods(&PodQuery::all().on_node(&node_name))
            .await
            .context(ListPodsSnafu { node: &node_name })?;
        let pods_to_delete = pods.iter().filter(|pod| filter(*pod)).count();
        if pods_to_delete == 0 {
            tracing::info!("no workload pods to delete");
            return Ok(());
        }

        let mut helper = DrainHelper::new(self.client.clone()).with_filter(filter);
        helper.force = spec.force;
        helper.delete_empty_dir = spec.delete_empty_dir;
        helper.ignore_all_daemon_sets = true;
        helper.timeout = DrainHelper::timeout_from_seconds(spec.timeout_seconds);

        let list = helper
            .pods_for_deletion(&node_name)
            .await
            .context(RemoveWorkloadPodsSnafu { node: &node_name })?;
        let deletable = list.pods();
        if deletable.len() != pods_to_delete {
            for reason in list.errors() {
                tracing::warn!(reason, "pod cannot be deleted");
            }
            return EvictionIncompleteSnafu {
                node: node_name,
                expected: pods_to_delete,
                deletable: deletable.len(),
            }
            .fail();
        }

        tracing::info!(pods = deletable.len(), "deleting workload pods");
        helper
            .delete_or_evict_pods(&deletable)
            .await
            .context(RemoveWorkloadPodsSnafu { node: node_name })
    }

    /// Deletes pods outright, so their DaemonSet recreates them from the current template.
    pub async fn schedule_pods_restart(&self, pods: &[Pod]) -> Result<()> {
        for pod in pods {
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            tracing::info!(pod.namespace = namespace, pod.name = name, "deleting pod");

            match self.client.delete_pod(&namespace, &name, None).await {
                Err(error) if error.is_not_found() => {}
                result => result.context(DeletePodSnafu {
                    pod: format!("{namespace}/{name}"),
                })?,
            }
        }
        Ok(())
    }

    /// Checks every node for running workload pods matching the completion selector, in
    /// parallel. Nodes without such pods, or whose wait timed out, move on to
    /// `pod-deletion-required` if pod deletion is configured, otherwise to `drain-required`.
    ///
    /// Returns the nodes that moved on.
    pub async fn schedule_check_on_pod_completion(
        &self,
        config: &PodManagerConfig,
    ) -> Result<Vec<Node>> {
        let next_state = if config.deletion_spec.is_some() {
            UpgradeState::PodDeletionRequired
        } else {
            UpgradeState::DrainRequired
        };
        let spec = config.wait_for_completion_spec.clone().unwrap_or_default();

        let checks = config
            .nodes
            .iter()
            .cloned()
            .map(|node| self.check_on_pod_completion(node, &spec, next_state));
        let mut advanced = Vec::new();
        for result in join_all(checks).await {
            if let Some(node) = result? {
                advanced.push(node);
            }
        }
        Ok(advanced)
    }

    async fn check_on_pod_completion(
        &self,
        mut node: Node,
        spec: &WaitForCompletionSpec,
        next_state: UpgradeState,
    ) -> Result<Option<Node>> {
        let node_name = node.name_any();
        let key = self
            .provider
            .keys()
            .wait_for_pod_completion_start_time()
            .to_owned();

        let pods = self
            .client
            .list_pods(
                &PodQuery::all()
                    .with_labels(spec.pod_selector.clone())
                    .on_node(&node_name),
            )
            .await
            .context(ListPodsSnafu { node: &node_name })?;

        if pods.iter().any(utils::is_pod_running_or_pending) {
            if spec.timeout_seconds == 0 {
                tracing::info!(node.name = node_name, "waiting for workload pods to complete");
                return Ok(None);
            }

            let timeout = Duration::from_secs(spec.timeout_seconds.into());
            let timed_out = self
                .provider
                .is_timed_out(&mut node, &key, timeout)
                .await
                .context(UpdateNodeSnafu { node: &node_name })?;
            if !timed_out {
                tracing::info!(node.name = node_name, "waiting for workload pods to complete");
                return Ok(None);
            }
            tracing::warn!(
                node.name = node_name,
                timeout_seconds = spec.timeout_seconds,
                "workload pods did not complete in time, moving on"
            );
        }

        if utils::annotation(&node, &key).is_some() {
            self.provider
                .change_node_upgrade_annotation(&mut node, &key, None)
                .await
                .context(UpdateNodeSnafu { node: &node_name })?;
        }
        self.provider
            .change_node_upgrade_state(&mut node, next_state)
            .await
            .context(UpdateNodeSnafu { node: &node_name })?;

        Ok(Some(node))
    }

    fn reason(&self) -> String {
        format!("{}DriverUpgrade", self.provider.keys().driver_name())
    }

    async fn publish(&self, node: &Node, event: NodeEvent) {
        if let Err(error) = self.client.publish_node_event(node, event).await {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to publish pod eviction event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        keys::UpgradeKeys,
        testing::{
            DRIVER_NAMESPACE, FakeCluster, NodeBuilder, PodBuilder, controller_revision,
            daemon_set, driver_pod,
        },
    };

    const GPU_WORKLOAD: &str = "gpu-workload";

    fn manager(cluster: &Arc<FakeCluster>) -> PodManager {
        let provider = Arc::new(NodeUpgradeStateProvider::new(
            cluster.clone(),
            UpgradeKeys::default(),
        ));
        let filter: PodDeletionFilter =
            Arc::new(|pod: &Pod| pod.labels().contains_key(GPU_WORKLOAD));
        PodManager::new(cluster.clone(), provider, Some(filter))
    }

    fn keys() -> UpgradeKeys {
        UpgradeKeys::default()
    }

    fn state_label(cluster: &FakeCluster, node: &str) -> Option<String> {
        cluster.node_label(node, keys().state_label())
    }

    async fn wait_for_evictions(manager: &PodManager, node_name: &str) {
        while manager.is_evicting(node_name) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn deletion_config(cluster: &FakeCluster, drain_enabled: bool) -> PodManagerConfig {
        PodManagerConfig {
            nodes: vec![cluster.node("node-a")],
            deletion_spec: Some(PodDeletionSpec::default()),
            wait_for_completion_spec: None,
            drain_enabled,
        }
    }

    #[test]
    fn pod_revision_hash_comes_from_label() {
        let pod = driver_pod("node-a", "driver", "abc");
        assert_eq!(PodManager::get_pod_controller_revision_hash(&pod).unwrap(), "abc");

        let unlabeled = PodBuilder::new("default", "plain").build();
        assert!(matches!(
            PodManager::get_pod_controller_revision_hash(&unlabeled),
            Err(Error::MissingPodRevisionHash { .. })
        ));
    }

    #[rstest]
    #[case(&[("aaa", 3), ("bbb", 1), ("ccc", 2)], "aaa")]
    #[case(&[("bbb", 1)], "bbb")]
    #[case(&[("ccc", 2), ("ddd", 10), ("eee", 9)], "ddd")]
    #[tokio::test]
    async fn daemon_set_revision_hash_is_highest_revision(
        #[case] revisions: &[(&str, i64)],
        #[case] expected: &str,
    ) {
        let cluster = FakeCluster::new();
        for (hash, revision) in revisions {
            cluster.add_controller_revision(controller_revision("driver", hash, *revision));
        }
        let manager = manager(&cluster);

        let hash = manager
            .get_daemon_set_controller_revision_hash(&daemon_set("driver", 1))
            .await
            .unwrap();

        assert_eq!(hash, expected);
    }

    #[tokio::test]
    async fn daemon_set_without_revisions_is_an_error() {
        let cluster = FakeCluster::new();
        let result = manager(&cluster)
            .get_daemon_set_controller_revision_hash(&daemon_set("driver", 1))
            .await;

        assert!(matches!(result, Err(Error::NoControllerRevisions { .. })));
    }

    #[tokio::test]
    async fn restart_deletes_pods() {
        let cluster = FakeCluster::new();
        let pod = driver_pod("node-a", "driver", "old");
        cluster.add_pod(pod.clone());

        manager(&cluster).schedule_pods_restart(&[pod]).await.unwrap();

        assert!(!cluster.pod_exists(DRIVER_NAMESPACE, "driver-node-a"));
        assert_eq!(cluster.evictions(), 0);
    }

    #[tokio::test]
    async fn no_matching_pods_requires_pod_restart() {
        let cluster = FakeCluster::new();
        cluster.add_node(NodeBuilder::new("node-a").build());
        cluster.add_pod(
            PodBuilder::new("default", "web")
                .on_node("node-a")
                .owned_by("ReplicaSet", "web")
                .build(),
        );
        let manager = manager(&cluster);

        manager.schedule_pod_eviction(&deletion_config(&cluster, false));
        wait_for_evictions(&manager, "node-a").await;

        assert!(cluster.pod_exists("default", "web"));
        assert_eq!(state_label(&cluster, "node-a").as_deref(), Some("pod-restart-required"));
    }

    #[tokio::test]
    async fn matching_pods_are_evicted() {
        let cluster = FakeCluster::new();
        cluster.add_node(NodeBuilder::new("node-a").build());
        cluster.add_pod(
            PodBuilder::new("default", "trainer")
                .on_node("node-a")
                .owned_by("Job", "trainer")
                .label(GPU_WORKLOAD, "true")
                .build(),
        );
        cluster.add_pod(
            PodBuilder::new("default", "web")
                .on_node("node-a")
                .owned_by("ReplicaSet", "web")
                .build(),
        );
        let manager = manager(&cluster);

        manager.schedule_pod_eviction(&deletion_config(&cluster, false));
        wait_for_evictions(&manager, "node-a").await;

        assert!(!cluster.pod_exists("default", "trainer"));
        assert!(cluster.pod_exists("default", "web"));
        assert_eq!(state_label(&cluster, "node-a").as_deref(), Some("pod-restart-required"));
    }

    #[rstest]
    #[case(true, "drain-required")]
    #[case(false, "upgrade-failed")]
    #[tokio::test]
    async fn undeletable_pods_fall_back(#[case] drain_enabled: bool, #[case] expected: &str) {
        let cluster = FakeCluster::new();
        cluster.add_node(NodeBuilder::new("node-a").build());
        cluster.add_pod(
            PodBuilder::new("default", "trainer")
                .on_node("node-a")
                .owned_by("Job", "trainer")
                .label(GPU_WORKLOAD, "true")
                .build(),
        );
        // Without a controller and without force this one blocks the deletion.
        cluster.add_pod(
            PodBuilder::new("default", "notebook")
                .on_node("node-a")
                .label(GPU_WORKLOAD, "true")
                .build(),
        );
        let manager = manager(&cluster);

        manager.schedule_pod_eviction(&deletion_config(&cluster, drain_enabled));
        wait_for_evictions(&manager, "node-a").await;

        assert!(cluster.pod_exists("default", "trainer"));
        assert!(cluster.pod_exists("default", "notebook"));
        assert_eq!(state_label(&cluster, "node-a").as_deref(), Some(expected));
    }

    #[tokio::test]
    async fn incomplete_eviction_is_reported() {
        let cluster = FakeCluster::new();
        let node = NodeBuilder::new("node-a").build();
        cluster.add_node(node.clone());
        cluster.add_pod(
            PodBuilder::new("default", "notebook")
                .on_node("node-a")
                .label(GPU_WORKLOAD, "true")
                .build(),
        );

        let result = manager(&cluster)
            .evict_pods(&node, &PodDeletionSpec::default())
            .await;

        assert!(matches!(
            result,
            Err(Error::EvictionIncomplete {
                expected: 1,
                deletable: 0,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_eviction_times_out() {
        let cluster = FakeCluster::new();
        let node = NodeBuilder::new("node-a").build();
        cluster.add_node(node.clone());
        cluster.add_pod(
            PodBuilder::new("default", "trainer")
                .on_node("node-a")
                .owned_by("Job", "trainer")
                .label(GPU_WORKLOAD, "true")
                .build(),
        );
        cluster.keep_pod_after_eviction("default", "trainer");
        let spec = PodDeletionSpec {
            timeout_seconds: 30,
            ..PodDeletionSpec::default()
        };

        let result = manager(&cluster).evict_pods(&node, &spec).await;

        assert!(matches!(
            result,
            Err(Error::RemoveWorkloadPods {
                source: drain::Error::Timeout { .. },
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_eviction_is_not_scheduled_twice() {
        let cluster = FakeCluster::new();
        cluster.add_node(NodeBuilder::new("node-a").build());
        cluster.add_pod(
            PodBuilder::new("default", "trainer")
                .on_node("node-a")
                .owned_by("Job", "trainer")
                .label(GPU_WORKLOAD, "true")
                .build(),
        );
        // The pod never goes away, so the first eviction keeps waiting for its deletion.
        cluster.keep_pod_after_eviction("default", "trainer");
        let manager = manager(&cluster);
        let config = PodManagerConfig {
            deletion_spec: Some(PodDeletionSpec {
                timeout_seconds: 30,
                ..PodDeletionSpec::default()
            }),
            ..deletion_config(&cluster, false)
        };

        manager.schedule_pod_eviction(&config);
        assert!(manager.is_evicting("node-a"));
        manager.schedule_pod_eviction(&config);
        wait_for_evictions(&manager, "node-a").await;

        assert_eq!(cluster.evictions(), 1);
        assert_eq!(state_label(&cluster, "node-a").as_deref(), Some("upgrade-failed"));
    }

    fn completion_config(cluster: &FakeCluster, timeout_seconds: u32) -> PodManagerConfig {
        PodManagerConfig {
            nodes: vec![cluster.node("node-a")],
            deletion_spec: None,
            wait_for_completion_spec: Some(WaitForCompletionSpec {
                pod_selector: "app=trainer".to_owned(),
                timeout_seconds,
            }),
            drain_enabled: false,
        }
    }

    fn running_trainer() -> Pod {
        PodBuilder::new("default", "trainer")
            .on_node("node-a")
            .owned_by("Job", "trainer")
            .label("app", "trainer")
            .build()
    }

    #[tokio::test]
    async fn running_jobs_hold_the_node() {
        let cluster = FakeCluster::new();
        cluster.add_node(NodeBuilder::new("node-a").build());
        cluster.add_pod(running_trainer());

        let advanced = manager(&cluster)
            .schedule_check_on_pod_completion(&completion_config(&cluster, 600))
            .await
            .unwrap();

        assert!(advanced.is_empty());
        assert_eq!(state_label(&cluster, "node-a"), None);
        assert!(
            cluster
                .node_annotation("node-a", keys().wait_for_pod_completion_start_time())
                .is_some()
        );
    }

    #[tokio::test]
    async fn completed_jobs_release_the_node() {
        let cluster = FakeCluster::new();
        cluster.add_node(
            NodeBuilder::new("node-a")
                .annotation(keys().wait_for_pod_completion_start_time(), "0")
                .build(),
        );
        cluster.add_pod(
            PodBuilder::new("default", "trainer")
                .on_node("node-a")
                .label("app", "trainer")
                .phase("Succeeded")
                .build(),
        );

        let advanced = manager(&cluster)
            .schedule_check_on_pod_completion(&completion_config(&cluster, 600))
            .await
            .unwrap();

        assert_eq!(advanced.len(), 1);
        assert_eq!(state_label(&cluster, "node-a").as_deref(), Some("drain-required"));
        assert_eq!(
            cluster.node_annotation("node-a", keys().wait_for_pod_completion_start_time()),
            None
        );
    }

    #[tokio::test]
    async fn job_wait_times_out() {
        let cluster = FakeCluster::new();
        let started = (utils::unix_now() - 700).to_string();
        cluster.add_node(
            NodeBuilder::new("node-a")
                .annotation(keys().wait_for_pod_completion_start_time(), &started)
                .build(),
        );
        cluster.add_pod(running_trainer());
        let mut config = completion_config(&cluster, 600);
        config.deletion_spec = Some(PodDeletionSpec::default());

        let advanced = manager(&cluster)
            .schedule_check_on_pod_completion(&config)
            .await
            .unwrap();

        assert_eq!(advanced.len(), 1);
        assert_eq!(
            state_label(&cluster, "node-a").as_deref(),
            Some("pod-deletion-required")
        );
        assert!(cluster.pod_exists("default", "trainer"));
    }
}
