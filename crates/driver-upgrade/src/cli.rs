//! Command line and environment configuration of the upgrade machinery.
//!
//! The options are meant to be flattened into the CLI of the operator embedding this crate:
//!
//! ```no_run
//! use clap::Parser;
//! use driver_upgrade::cli::UpgradeOptions;
//!
//! #[derive(clap::Parser)]
//! struct Opts {
//!     #[command(flatten)]
//!     upgrade: UpgradeOptions,
//! }
//!
//! let opts = Opts::parse();
//! println!("upgrading driver {}", opts.upgrade.driver_name);
//! ```

use clap::Args;

use crate::keys::UpgradeKeys;

#[derive(Clone, Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Driver Upgrade Options")]
pub struct UpgradeOptions {
    /// Name of the driver, used to scope all node labels and annotations, e.g. `gpu` results
    /// in the state label `nvidia.com/gpu-driver-upgrade-state`.
    #[arg(long, env = "DRIVER_NAME", default_value = "gpu")]
    pub driver_name: String,

    // Flattened structs go last to keep the help headings correct.
    #[command(flatten)]
    pub requestor: RequestorOptions,
}

impl UpgradeOptions {
    pub fn keys(&self) -> UpgradeKeys {
        UpgradeKeys::new(&self.driver_name)
    }
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            driver_name: "gpu".to_owned(),
            requestor: RequestorOptions::default(),
        }
    }
}

/// Delegation of cordon and drain to the maintenance operator.
#[derive(Clone, Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Maintenance Operator Options")]
pub struct RequestorOptions {
    /// Create `NodeMaintenance` objects instead of cordoning and draining nodes directly.
    #[arg(long = "maintenance-operator-enabled", env = "MAINTENANCE_OPERATOR_ENABLED")]
    pub use_maintenance_operator: bool,

    /// Namespace the `NodeMaintenance` objects are created in.
    #[arg(
        long = "maintenance-operator-requestor-namespace",
        env = "MAINTENANCE_OPERATOR_REQUESTOR_NAMESPACE",
        default_value = "default"
    )]
    pub namespace: String,

    /// Identifies this operator towards the maintenance operator.
    #[arg(
        long = "maintenance-operator-requestor-id",
        env = "MAINTENANCE_OPERATOR_REQUESTOR_ID",
        default_value = "nvidia.operator.com"
    )]
    pub requestor_id: String,

    /// Prefix of `NodeMaintenance` object names. Operators sharing a prefix share the object of
    /// a node.
    #[arg(
        long = "maintenance-operator-node-maintenance-prefix",
        env = "MAINTENANCE_OPERATOR_NODE_MAINTENANCE_PREFIX",
        default_value = "nvidia-operator"
    )]
    pub node_maintenance_name_prefix: String,

    /// Resource name regexes; only pods requesting a matching resource are evicted.
    #[arg(
        long = "maintenance-operator-pod-eviction-filter",
        env = "MAINTENANCE_OPERATOR_POD_EVICTION_FILTER",
        default_value = "nvidia.com/gpu-*",
        value_delimiter = ','
    )]
    pub pod_eviction_filters: Vec<String>,
}

impl RequestorOptions {
    /// The name of the `NodeMaintenance` object of a node.
    pub fn node_maintenance_name(&self, node_name: &str) -> String {
        format!("{}-{node_name}", self.node_maintenance_name_prefix)
    }
}

impl Default for RequestorOptions {
    fn default() -> Self {
        Self {
            use_maintenance_operator: false,
            namespace: "default".to_owned(),
            requestor_id: "nvidia.operator.com".to_owned(),
            node_maintenance_name_prefix: "nvidia-operator".to_owned(),
            pod_eviction_filters: vec!["nvidia.com/gpu-*".to_owned()],
        }
    }
}
