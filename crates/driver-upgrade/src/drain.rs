//! Removes pods from a node, similar to `kubectl drain`.
//!
//! Draining is done client side. Pods are selected with the same rules `kubectl drain` applies:
//!
//! - Mirror (static) pods are never touched.
//! - DaemonSet pods are skipped when [`DrainHelper::ignore_all_daemon_sets`] is set, otherwise
//!   they block the drain, because the DaemonSet controller would recreate them right away.
//! - Running pods with `emptyDir` volumes block the drain unless
//!   [`DrainHelper::delete_empty_dir`] is set.
//! - Running pods without a controller block the drain unless [`DrainHelper::force`] is set,
//!   because nothing would recreate them.
//! - Additional caller supplied filters can exclude further pods.
//!
//! Pods are removed through the eviction API, which respects PodDisruptionBudgets, unless
//! eviction is disabled. Cordoning is not handled here, see
//! [`CordonManager`](crate::cordon_manager::CordonManager).

use std::{fmt, sync::Arc, time::Duration};

use futures::{StreamExt, TryStreamExt, stream};
use jiff::SignedDuration;
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Time};
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tokio::time::sleep;

use crate::{
    client::{self, ClusterClient, PodQuery},
    utils,
};

type Result<T, E = Error> = std::result::Result<T, E>;

// Upper bound of pods removed concurrently, waiting for their deletion included.
const CONCURRENT_EVICTIONS: usize = 5;

// A throttled eviction means a PodDisruptionBudget does not allow it yet. `kubectl drain` waits
// 5 seconds between attempts as well.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list pods on node {node:?}"))]
    ListPods { source: client::Error, node: String },

    #[snafu(display("cannot drain node {node:?}: {}", reasons.join("; ")))]
    PodsNotDeletable { node: String, reasons: Vec<String> },

    #[snafu(display("failed to evict pod {pod:?}"))]
    EvictPod { source: client::Error, pod: String },

    #[snafu(display("failed to delete pod {pod:?}"))]
    DeletePod { source: client::Error, pod: String },

    #[snafu(display("failed to wait for deletion of pod {pod:?}"))]
    WaitForDeletion { source: client::Error, pod: String },

    #[snafu(display("pods were not removed within {timeout:?}"))]
    Timeout { timeout: Duration },
}

/// Decides whether a pod should be removed. Returning `false` skips the pod.
pub type PodFilter = Arc<dyn Fn(&Pod) -> bool + Send + Sync>;

/// Called after a pod is gone.
pub type PodRemovedHook = Arc<dyn Fn(&Pod, PodRemoval) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodRemoval {
    Evicted,
    Deleted,
}

impl fmt::Display for PodRemoval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evicted => f.write_str("Evicted"),
            Self::Deleted => f.write_str("Deleted"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodDeleteStatus {
    Delete { warning: Option<String> },
    Skip { warning: Option<String> },
    Error(String),
}

#[derive(Clone, Debug)]
pub struct PodDelete {
    pub pod: Pod,
    pub status: PodDeleteStatus,
}

/// The outcome of selecting the pods of a node.
#[derive(Clone, Debug, Default)]
pub struct PodDeleteList {
    items: Vec<PodDelete>,
}

impl PodDeleteList {
    /// Pods that will be removed.
    pub fn pods(&self) -> Vec<Pod> {
        self.items
            .iter()
            .filter(|item| matches!(item.status, PodDeleteStatus::Delete { .. }))
            .map(|item| item.pod.clone())
            .collect()
    }

    /// Reasons why pods block the drain, one per pod.
    pub fn errors(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|item| match &item.status {
                PodDeleteStatus::Error(reason) => Some(format!(
                    "{namespace}/{name}: {reason}",
                    namespace = item.pod.namespace().unwrap_or_default(),
                    name = item.pod.name_any()
                )),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|item| match &item.status {
                PodDeleteStatus::Delete { warning } | PodDeleteStatus::Skip { warning } => {
                    warning.clone()
                }
                PodDeleteStatus::Error(_) => None,
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct DrainHelper {
    client: Arc<dyn ClusterClient>,

    /// Remove pods without a controller.
    pub force: bool,

    /// Remove pods using `emptyDir` volumes.
    pub delete_empty_dir: bool,

    pub ignore_all_daemon_sets: bool,

    /// `None` uses the grace period of each pod.
    pub grace_period_seconds: Option<u32>,

    /// Overall limit for removing pods, `None` waits forever.
    pub timeout: Option<Duration>,

    /// Only pods matching this label selector are considered.
    pub pod_selector: String,

    /// Delete pods directly instead of evicting them.
    pub disable_eviction: bool,

    additional_filters: Vec<PodFilter>,
    on_pod_removed: Option<PodRemovedHook>,
}

impl DrainHelper {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            force: false,
            delete_empty_dir: false,
            ignore_all_daemon_sets: true,
            grace_period_seconds: None,
            timeout: None,
            pod_selector: String::new(),
            disable_eviction: false,
            additional_filters: Vec::new(),
            on_pod_removed: None,
        }
    }

    /// Converts a timeout in seconds where `0` means no limit.
    pub fn timeout_from_seconds(seconds: u32) -> Option<Duration> {
        (seconds > 0).then(|| Duration::from_secs(seconds.into()))
    }

    pub fn with_filter(mut self, filter: PodFilter) -> Self {
        self.additional_filters.push(filter);
        self
    }

    pub fn on_pod_removed(mut self, hook: PodRemovedHook) -> Self {
        self.on_pod_removed = Some(hook);
        self
    }

    /// Removes all selected pods from the node, failing without removing anything if a pod
    /// blocks the drain.
    #[tracing::instrument(skip(self))]
    pub async fn drain_node(&self, node_name: &str) -> Result<()> {
        let list = self.pods_for_deletion(node_name).await?;

        let reasons = list.errors();
        if !reasons.is_empty() {
            return PodsNotDeletableSnafu {
                node: node_name,
                reasons,
            }
            .fail();
        }
        for warning in list.warnings() {
            tracing::warn!(node.name = node_name, warning, "drain warning");
        }

        self.delete_or_evict_pods(&list.pods()).await
    }

    /// Lists the pods of a node and classifies each of them.
    pub async fn pods_for_deletion(&self, node_name: &str) -> Result<PodDeleteList> {
        let query = PodQuery::all()
            .with_labels(self.pod_selector.clone())
            .on_node(node_name);
        let pods = self
            .client
            .list_pods(&query)
            .await
            .context(ListPodsSnafu { node: node_name })?;

        let items = pods
            .into_iter()
            .map(|pod| PodDelete {
                status: self.delete_status(&pod),
                pod,
            })
            .collect();

        Ok(PodDeleteList { items })
    }

    fn delete_status(&self, pod: &Pod) -> PodDeleteStatus {
        if utils::is_mirror_pod(pod) {
            return PodDeleteStatus::Skip { warning: None };
        }

        if is_deletion_overdue(pod, jiff::Timestamp::now()) {
            return PodDeleteStatus::Skip {
                warning: Some(format!(
                    "skipping pod {} which is already past its deletion grace period",
                    pod.name_any()
                )),
            };
        }

        if utils::is_daemon_set_pod(pod) {
            return if self.ignore_all_daemon_sets {
                PodDeleteStatus::Skip {
                    warning: Some(format!("ignoring DaemonSet-managed pod {}", pod.name_any())),
                }
            } else {
                PodDeleteStatus::Error("cannot delete DaemonSet-managed pods".to_owned())
            };
        }

        let mut warning = None;
        if !utils::is_pod_completed(pod) {
            if utils::has_local_storage(pod) {
                if !self.delete_empty_dir {
                    return PodDeleteStatus::Error(
                        "cannot delete pods with local storage".to_owned(),
                    );
                }
                warning = Some(format!("deleting pod {} with local storage", pod.name_any()));
            }

            if !utils::has_controller(pod) {
                if !self.force {
                    return PodDeleteStatus::Error(
                        "cannot delete pods that declare no controller".to_owned(),
                    );
                }
                warning = Some(format!(
                    "deleting pod {} not managed by a controller",
                    pod.name_any()
                ));
            }
        }

        if self.additional_filters.iter().any(|filter| !filter(pod)) {
            return PodDeleteStatus::Skip { warning: None };
        }

        PodDeleteStatus::Delete { warning }
    }

    /// Removes the given pods and waits until they are gone.
    pub async fn delete_or_evict_pods(&self, pods: &[Pod]) -> Result<()> {
        let removal = stream::iter(pods.iter().cloned())
            .map(|pod| self.remove_pod(pod))
            .buffer_unordered(CONCURRENT_EVICTIONS)
            .try_collect::<Vec<()>>();

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, removal)
                .await
                .map_err(|_| Error::Timeout { timeout })??,
            None => removal.await?,
        };
        Ok(())
    }

    async fn remove_pod(&self, pod: Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let pod_ref = format!("{namespace}/{name}");

        let removal = if self.disable_eviction {
            match self
                .client
                .delete_pod(&namespace, &name, self.grace_period_seconds)
                .await
            {
                Err(error) if error.is_not_found() => return Ok(()),
                result => result.context(DeletePodSnafu { pod: &pod_ref })?,
            }
            PodRemoval::Deleted
        } else {
            loop {
                match self
                    .client
                    .evict_pod(&namespace, &name, self.grace_period_seconds)
                    .await
                {
                    Ok(()) => break,
                    Err(error) if error.is_not_found() => return Ok(()),
                    Err(error) if error.is_too_many_requests() => {
                        tracing::warn!(
                            pod = pod_ref,
                            "eviction blocked, most likely by a PodDisruptionBudget, retrying in {:.0}s",
                            EVICTION_RETRY_INTERVAL.as_secs_f64()
                        );
                        sleep(EVICTION_RETRY_INTERVAL).await;
                    }
                    Err(error) => return Err(error).context(EvictPodSnafu { pod: &pod_ref }),
                }
            }
            PodRemoval::Evicted
        };

        self.wait_for_deletion(&pod, &pod_ref).await?;
        tracing::info!(pod = pod_ref, removal = %removal, "removed pod");

        if let Some(hook) = &self.on_pod_removed {
            hook(&pod, removal);
        }
        Ok(())
    }

    /// Polls until the pod is gone or was replaced by a new pod of the same name.
    async fn wait_for_deletion(&self, pod: &Pod, pod_ref: &str) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        loop {
            match self.client.get_pod(&namespace, &name).await {
                Err(error) if error.is_not_found() => return Ok(()),
                Err(error) => return Err(error).context(WaitForDeletionSnafu { pod: pod_ref }),
                Ok(current) if current.uid() != pod.uid() => return Ok(()),
                Ok(_) => {
                    tracing::debug!(pod = pod_ref, "waiting for pod deletion");
                    sleep(DELETION_CHECK_INTERVAL).await;
                }
            }
        }
    }
}

/// A pod that was deleted and whose grace period elapsed is only waiting for the kubelet. Evicting
/// it again would not speed anything up.
fn is_deletion_overdue(pod: &Pod, now: jiff::Timestamp) -> bool {
    let Some(Time(deleted_at)) = &pod.metadata.deletion_timestamp else {
        return false;
    };
    let grace_period =
        SignedDuration::from_secs(pod.metadata.deletion_grace_period_seconds.unwrap_or_default());
    now.duration_since(*deleted_at) > grace_period
}
