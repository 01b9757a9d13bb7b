//! Access to the Kubernetes API.
//!
//! All cluster reads and writes of the upgrade machinery go through the [`ClusterClient`] trait.
//! [`Client`] implements it on top of a [`kube::Client`]. Keeping the surface this narrow makes
//! explicit which objects are touched: nodes are only patched (labels, annotations and
//! `spec.unschedulable`), pods are listed, evicted and deleted, DaemonSets and
//! ControllerRevisions are only read and `NodeMaintenance` objects are fully managed.

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{ControllerRevision, DaemonSet},
    core::v1::{Node, Pod},
};
use kube::{
    Api, Resource,
    api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams},
    runtime::events::{Recorder, Reporter},
};
use serde_json::json;
use snafu::Snafu;

use crate::{crd::node_maintenance::NodeMaintenance, events::NodeEvent};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{kind} {name:?} not found"))]
    NotFound { kind: &'static str, name: String },

    #[snafu(display("{kind} {name:?} was modified concurrently"))]
    Conflict { kind: &'static str, name: String },

    #[snafu(display("request for {kind} {name:?} was throttled"))]
    TooManyRequests { kind: &'static str, name: String },

    #[snafu(display("failed to {verb} {kind} {name:?}"))]
    Kube {
        source: kube::Error,
        verb: &'static str,
        kind: &'static str,
        name: String,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, Self::TooManyRequests { .. })
    }

    fn from_kube(source: kube::Error, verb: &'static str, kind: &'static str, name: &str) -> Self {
        let name = name.to_owned();
        match &source {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound { kind, name },
            kube::Error::Api(response) if response.code == 409 => Self::Conflict { kind, name },
            kube::Error::Api(response) if response.code == 429 => {
                Self::TooManyRequests { kind, name }
            }
            _ => Self::Kube {
                source,
                verb,
                kind,
                name,
            },
        }
    }
}

/// Selects pods by namespace, label selector and the node they are scheduled to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodQuery {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub node_name: Option<String>,
}

impl PodQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// An empty selector selects everything.
    pub fn with_labels(mut self, label_selector: impl Into<String>) -> Self {
        let label_selector = label_selector.into();
        self.label_selector = (!label_selector.is_empty()).then_some(label_selector);
        self
    }

    pub fn on_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(label_selector) = &self.label_selector {
            params = params.labels(label_selector);
        }
        if let Some(node_name) = &self.node_name {
            params = params.fields(&format!("spec.nodeName={node_name}"));
        }
        params
    }
}

/// The operations the upgrade machinery needs from the cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Sets (`Some`) or removes (`None`) one label of a node.
    async fn patch_node_label(&self, name: &str, key: &str, value: Option<&str>) -> Result<Node>;

    /// Sets (`Some`) or removes (`None`) one annotation of a node.
    async fn patch_node_annotation(
        &self,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Node>;

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<Node>;

    async fn list_pods(&self, query: &PodQuery) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Deletes a pod directly, bypassing PodDisruptionBudgets.
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()>;

    /// Evicts a pod through the eviction API, which respects PodDisruptionBudgets.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()>;

    async fn list_daemon_sets(&self, namespace: &str, label_selector: &str)
    -> Result<Vec<DaemonSet>>;

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ControllerRevision>>;

    async fn get_node_maintenance(&self, namespace: &str, name: &str) -> Result<NodeMaintenance>;

    async fn create_node_maintenance(
        &self,
        node_maintenance: &NodeMaintenance,
    ) -> Result<NodeMaintenance>;

    /// Replaces `spec.additionalRequestors`, failing with [`Error::Conflict`] if the object
    /// changed since `resource_version` was observed.
    async fn update_node_maintenance_requestors(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        additional_requestors: &[String],
    ) -> Result<NodeMaintenance>;

    async fn delete_node_maintenance(&self, namespace: &str, name: &str) -> Result<()>;

    async fn publish_node_event(&self, node: &Node, event: NodeEvent) -> Result<()>;
}

/// A [`ClusterClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    patch_params: PatchParams,
    post_params: PostParams,
    reporter: Reporter,
}

impl Client {
    /// `field_manager` is recorded as the owner of all written fields and as the reporting
    /// controller of published events.
    pub fn new(client: kube::Client, field_manager: &str) -> Self {
        Self {
            client,
            patch_params: PatchParams {
                field_manager: Some(field_manager.to_owned()),
                ..PatchParams::default()
            },
            post_params: PostParams {
                field_manager: Some(field_manager.to_owned()),
                ..PostParams::default()
            },
            reporter: Reporter {
                controller: field_manager.to_owned(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// Returns the wrapped [`kube::Client`].
    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn node_maintenances(&self, namespace: &str) -> Api<NodeMaintenance> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn merge_patch_node(&self, name: &str, patch: serde_json::Value) -> Result<Node> {
        self.nodes()
            .patch(name, &self.patch_params, &Patch::Merge(&patch))
            .await
            .map_err(|source| Error::from_kube(source, "patch", "Node", name))
    }
}

#[async_trait]
impl ClusterClient for Client {
    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes()
            .get(name)
            .await
            .map_err(|source| Error::from_kube(source, "get", "Node", name))
    }

    async fn patch_node_label(&self, name: &str, key: &str, value: Option<&str>) -> Result<Node> {
        self.merge_patch_node(name, json!({ "metadata": { "labels": { key: value } } }))
            .await
    }

    async fn patch_node_annotation(
        &self,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Node> {
        self.merge_patch_node(name, json!({ "metadata": { "annotations": { key: value } } }))
            .await
    }

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<Node> {
        let nodes = self.nodes();
        let result = if unschedulable {
            nodes.cordon(name).await
        } else {
            nodes.uncordon(name).await
        };
        result.map_err(|source| Error::from_kube(source, "cordon", "Node", name))
    }

    async fn list_pods(&self, query: &PodQuery) -> Result<Vec<Pod>> {
        let pods = self
            .pods(query.namespace.as_deref())
            .list(&query.list_params())
            .await
            .map_err(|source| {
                Error::from_kube(
                    source,
                    "list",
                    "Pod",
                    query.namespace.as_deref().unwrap_or_default(),
                )
            })?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods(Some(namespace))
            .get(name)
            .await
            .map_err(|source| Error::from_kube(source, "get", "Pod", name))
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds,
            ..DeleteParams::default()
        };
        self.pods(Some(namespace))
            .delete(name, &params)
            .await
            .map_err(|source| Error::from_kube(source, "delete", "Pod", name))?;
        Ok(())
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds,
                ..DeleteParams::default()
            }),
            ..EvictParams::default()
        };
        self.pods(Some(namespace))
            .evict(name, &params)
            .await
            .map_err(|source| Error::from_kube(source, "evict", "Pod", name))?;
        Ok(())
    }

    async fn list_daemon_sets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let daemon_sets = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|source| Error::from_kube(source, "list", "DaemonSet", namespace))?;
        Ok(daemon_sets.items)
    }

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ControllerRevision>> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        let revisions = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|source| Error::from_kube(source, "list", "ControllerRevision", namespace))?;
        Ok(revisions.items)
    }

    async fn get_node_maintenance(&self, namespace: &str, name: &str) -> Result<NodeMaintenance> {
        self.node_maintenances(namespace)
            .get(name)
            .await
            .map_err(|source| Error::from_kube(source, "get", "NodeMaintenance", name))
    }

    async fn create_node_maintenance(
        &self,
        node_maintenance: &NodeMaintenance,
    ) -> Result<NodeMaintenance> {
        let name = node_maintenance.meta().name.clone().unwrap_or_default();
        let namespace = node_maintenance.meta().namespace.clone().unwrap_or_default();
        self.node_maintenances(&namespace)
            .create(&self.post_params, node_maintenance)
            .await
            .map_err(|source| Error::from_kube(source, "create", "NodeMaintenance", &name))
    }

    async fn update_node_maintenance_requestors(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        additional_requestors: &[String],
    ) -> Result<NodeMaintenance> {
        // A merge patch carrying the resourceVersion is rejected with a conflict if the object
        // was changed in the meantime.
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "spec": { "additionalRequestors": additional_requestors },
        });
        self.node_maintenances(namespace)
            .patch(name, &self.patch_params, &Patch::Merge(&patch))
            .await
            .map_err(|source| Error::from_kube(source, "patch", "NodeMaintenance", name))
    }

    async fn delete_node_maintenance(&self, namespace: &str, name: &str) -> Result<()> {
        self.node_maintenances(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|source| Error::from_kube(source, "delete", "NodeMaintenance", name))?;
        Ok(())
    }

    async fn publish_node_event(&self, node: &Node, event: NodeEvent) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let name = node.meta().name.clone().unwrap_or_default();
        recorder
            .publish(&event.into_kube_event("UpgradeNode"), &node.object_ref(&()))
            .await
            .map_err(|source| Error::from_kube(source, "publish event for", "Node", &name))
    }
}
