//! The upgrade policy, supplied by the caller on every reconciliation.

use std::num::ParseIntError;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

pub const DEFAULT_TIMEOUT_SECONDS: u32 = 300;
pub const DEFAULT_MAX_UNAVAILABLE: &str = "25%";

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("maxUnavailable {value:?} must be an integer or a percentage like \"25%\""))]
    InvalidMaxUnavailable { value: String },

    #[snafu(display("failed to parse maxUnavailable percentage {value:?}"))]
    ParsePercentage { source: ParseIntError, value: String },

    #[snafu(display("maxUnavailable percentage {value:?} must not exceed 100%"))]
    PercentageOutOfRange { value: String },
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverUpgradePolicySpec {
    /// Global switch for automatic upgrades. Nothing happens while this is `false`.
    #[serde(default)]
    pub auto_upgrade: bool,

    /// Number of nodes that can be upgraded in parallel, `0` means no limit.
    #[serde(default = "DriverUpgradePolicySpec::default_max_parallel_upgrades")]
    pub max_parallel_upgrades: u32,

    /// Maximum number of nodes that may be unavailable during the upgrade, either an absolute
    /// number or a percentage of all managed nodes (rounded up). `None` means no limit.
    #[serde(default = "DriverUpgradePolicySpec::default_max_unavailable")]
    pub max_unavailable: Option<IntOrString>,

    /// Deletes workload pods using the driver before restarting the driver pod.
    #[serde(default)]
    pub pod_deletion: Option<PodDeletionSpec>,

    /// Waits for matching workload pods to complete before deleting or draining anything.
    #[serde(default)]
    pub wait_for_completion: Option<WaitForCompletionSpec>,

    #[serde(default)]
    pub drain: Option<DrainSpec>,
}

impl Default for DriverUpgradePolicySpec {
    fn default() -> Self {
        Self {
            auto_upgrade: false,
            max_parallel_upgrades: Self::default_max_parallel_upgrades(),
            max_unavailable: Self::default_max_unavailable(),
            pod_deletion: None,
            wait_for_completion: None,
            drain: None,
        }
    }
}

impl DriverUpgradePolicySpec {
    fn default_max_parallel_upgrades() -> u32 {
        1
    }

    fn default_max_unavailable() -> Option<IntOrString> {
        Some(IntOrString::String(DEFAULT_MAX_UNAVAILABLE.to_owned()))
    }

    /// Resolves [`Self::max_unavailable`] against the number of managed nodes.
    pub fn max_unavailable_nodes(&self, total_nodes: usize) -> Result<usize> {
        match &self.max_unavailable {
            None => Ok(total_nodes),
            Some(IntOrString::Int(value)) => Ok(usize::try_from(*value).unwrap_or_default()),
            Some(IntOrString::String(value)) => {
                let Some(percentage) = value.trim().strip_suffix('%') else {
                    return InvalidMaxUnavailableSnafu { value }.fail();
                };
                let percentage: usize = percentage.parse().context(ParsePercentageSnafu { value })?;
                if percentage > 100 {
                    return PercentageOutOfRangeSnafu { value }.fail();
                }

                Ok(total_nodes.saturating_mul(percentage).div_ceil(100))
            }
        }
    }

    pub fn drain_enabled(&self) -> bool {
        self.drain.as_ref().is_some_and(|drain| drain.enable)
    }

    /// The pod selector to wait for, if waiting for pod completion is configured at all.
    pub fn wait_for_completion_selector(&self) -> Option<&str> {
        self.wait_for_completion
            .as_ref()
            .map(|spec| spec.pod_selector.as_str())
            .filter(|selector| !selector.is_empty())
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDeletionSpec {
    /// Also delete pods that are not managed by a controller.
    #[serde(default)]
    pub force: bool,

    /// Time to wait for the deletion to complete, `0` means no limit.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,

    /// Also delete pods using `emptyDir` volumes. Their local data is lost.
    #[serde(default)]
    pub delete_empty_dir: bool,
}

impl Default for PodDeletionSpec {
    fn default() -> Self {
        Self {
            force: false,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            delete_empty_dir: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForCompletionSpec {
    /// Label selector of the workload pods to wait for.
    #[serde(default)]
    pub pod_selector: String,

    /// Time to wait before moving on regardless, `0` means wait forever.
    #[serde(default)]
    pub timeout_seconds: u32,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainSpec {
    #[serde(default)]
    pub enable: bool,

    /// Also evict pods that are not managed by a controller.
    #[serde(default)]
    pub force: bool,

    /// Only evict pods matching this label selector.
    #[serde(default)]
    pub pod_selector: String,

    /// Time to wait for the drain to complete, `0` means no limit.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,

    /// Also evict pods using `emptyDir` volumes. Their local data is lost.
    #[serde(default)]
    pub delete_empty_dir: bool,
}

impl Default for DrainSpec {
    fn default() -> Self {
        Self {
            enable: false,
            force: false,
            pod_selector: String::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            delete_empty_dir: false,
        }
    }
}

fn default_timeout_seconds() -> u32 {
    DEFAULT_TIMEOUT_SECONDS
}
