//! Label and annotation keys written to [`Node`](k8s_openapi::api::core::v1::Node) objects.
//!
//! All keys are scoped by the driver name, so that several driver DaemonSets (for example `gpu`
//! and `ofed`) can be upgraded independently on the same node.

/// Label set by the DaemonSet controller on every pod, naming the template revision it was
/// created from.
pub const POD_CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";

/// Value used for boolean labels and annotations.
pub const TRUE: &str = "true";

/// The set of node label and annotation keys used for one driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeKeys {
    driver_name: String,
    state_label: String,
    skip_node: String,
    wait_for_safe_load: String,
    initial_state: String,
    wait_for_pod_completion_start_time: String,
    validation_start_time: String,
    upgrade_requested: String,
    requestor_mode: String,
}

impl UpgradeKeys {
    pub fn new(driver_name: impl Into<String>) -> Self {
        let driver_name = driver_name.into();

        Self {
            state_label: format!("nvidia.com/{driver_name}-driver-upgrade-state"),
            skip_node: format!("nvidia.com/{driver_name}-driver-upgrade.skip"),
            wait_for_safe_load: format!(
                "nvidia.com/{driver_name}-driver-upgrade.driver-wait-for-safe-load"
            ),
            initial_state: format!(
                "nvidia.com/{driver_name}-driver-upgrade.node-initial-state.unschedulable"
            ),
            wait_for_pod_completion_start_time: format!(
                "nvidia.com/{driver_name}-driver-upgrade-wait-for-pod-completion-start-time"
            ),
            validation_start_time: format!(
                "nvidia.com/{driver_name}-driver-upgrade-validation-start-time"
            ),
            upgrade_requested: format!("nvidia.com/{driver_name}-driver-upgrade-requested"),
            requestor_mode: format!("nvidia.com/{driver_name}-driver-upgrade-requestor-mode"),
            driver_name,
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Label holding the current [`UpgradeState`](crate::state::UpgradeState) of a node.
    pub fn state_label(&self) -> &str {
        &self.state_label
    }

    /// Label (or annotation) which, when set to `true`, holds a node in `upgrade-required`.
    pub fn skip_node(&self) -> &str {
        &self.skip_node
    }

    /// Annotation set by the driver pod while it waits for the controller to allow the driver
    /// to load.
    pub fn wait_for_safe_load(&self) -> &str {
        &self.wait_for_safe_load
    }

    /// Annotation recording that the node was already unschedulable when the upgrade started.
    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    /// Annotation holding the unix time (seconds) at which waiting for workload pods started.
    pub fn wait_for_pod_completion_start_time(&self) -> &str {
        &self.wait_for_pod_completion_start_time
    }

    /// Annotation holding the unix time (seconds) at which validation started.
    pub fn validation_start_time(&self) -> &str {
        &self.validation_start_time
    }

    /// Annotation used by administrators to request an upgrade of a node manually.
    pub fn upgrade_requested(&self) -> &str {
        &self.upgrade_requested
    }

    /// Annotation marking a node whose maintenance is delegated to the maintenance operator.
    pub fn requestor_mode(&self) -> &str {
        &self.requestor_mode
    }
}

impl Default for UpgradeKeys {
    fn default() -> Self {
        Self::new("gpu")
    }
}
