//! The `NodeMaintenance` custom resource of the maintenance operator.
//!
//! In requestor mode cordoning and draining a node is delegated to the maintenance operator by
//! creating one of these objects. The maintenance operator owns the CRD, this crate only creates,
//! patches, deletes and reads the objects.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_REASON_READY: &str = "Ready";

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[kube(
    group = "maintenance.nvidia.com",
    version = "v1alpha1",
    kind = "NodeMaintenance",
    plural = "nodemaintenances",
    status = "NodeMaintenanceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NodeMaintenanceSpec {
    /// Identifies the operator that created this request.
    #[serde(rename = "requestorID")]
    pub requestor_id: String,

    /// Further operators sharing this request. The object is only removed once all of them are
    /// done with it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_requestors: Vec<String>,

    pub node_name: String,

    #[serde(default)]
    pub cordon: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_pod_completion: Option<WaitForPodCompletionSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_spec: Option<DrainSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForPodCompletionSpec {
    #[serde(default)]
    pub pod_selector: String,

    #[serde(default)]
    pub timeout_seconds: u32,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainSpec {
    #[serde(default)]
    pub force: bool,

    #[serde(default)]
    pub pod_selector: String,

    #[serde(default)]
    pub timeout_seconds: u32,

    #[serde(default)]
    pub delete_empty_dir: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_eviction_filters: Vec<PodEvictionFiltersEntry>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodEvictionFiltersEntry {
    /// Only pods requesting a resource matching this regex are evicted.
    pub by_resource_name_regex: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMaintenanceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeMaintenance {
    /// Returns `true` once the maintenance operator finished cordoning and draining the node.
    pub fn is_ready(&self) -> bool {
        self.status
            .iter()
            .flat_map(|status| &status.conditions)
            .any(|condition| {
                condition.type_ == CONDITION_TYPE_READY
                    && condition.reason == CONDITION_REASON_READY
            })
    }

    /// Returns `true` if `requestor_id` created this object or was added to it.
    pub fn is_requested_by(&self, requestor_id: &str) -> bool {
        self.spec.requestor_id == requestor_id
            || self
                .spec
                .additional_requestors
                .iter()
                .any(|requestor| requestor == requestor_id)
    }
}
