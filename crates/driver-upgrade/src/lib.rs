//! Rolling upgrades of kernel-module drivers deployed as DaemonSets.
//!
//! Replacing a driver pod unloads the kernel module, so the node has to be taken out of service
//! first. This crate moves every node running the driver through a state machine persisted in a
//! node label: cordon, wait for jobs, delete workload pods, drain, restart the driver pod,
//! validate and uncordon. The number of nodes upgraded at once is bounded by the
//! [`DriverUpgradePolicySpec`](policy::DriverUpgradePolicySpec).
//!
//! The embedding operator calls [`ClusterUpgradeStateManager::build_state`] and
//! [`ClusterUpgradeStateManager::apply_state`] from its reconciliation loop:
//!
//! ```no_run
//! # use std::{collections::BTreeMap, sync::Arc};
//! # use driver_upgrade::{cli::UpgradeOptions, client::Client, manager::ClusterUpgradeStateManager, policy::DriverUpgradePolicySpec};
//! # async fn reconcile(kube_client: kube::Client, policy: &DriverUpgradePolicySpec) -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(Client::new(kube_client, "gpu-operator"));
//! let manager = ClusterUpgradeStateManager::new(client, &UpgradeOptions::default());
//!
//! let driver_labels = BTreeMap::from([("app".to_owned(), "nvidia-driver-daemonset".to_owned())]);
//! let mut state = manager.build_state("gpu-operator", &driver_labels).await?;
//! manager.apply_state(&mut state, Some(policy)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`ClusterUpgradeStateManager::build_state`]: manager::ClusterUpgradeStateManager::build_state
//! [`ClusterUpgradeStateManager::apply_state`]: manager::ClusterUpgradeStateManager::apply_state

pub mod cli;
pub mod client;
pub mod cordon_manager;
pub mod crd;
pub mod drain;
pub mod drain_manager;
pub mod events;
pub mod keys;
pub mod label_selector;
pub mod logging;
pub mod manager;
pub mod node_state_provider;
pub mod pod_manager;
pub mod policy;
pub mod safe_driver_load;
pub mod state;
pub mod sync;
pub mod utils;
pub mod validation_manager;

#[cfg(test)]
mod testing;

// External re-exports
pub use k8s_openapi;
pub use kube;
