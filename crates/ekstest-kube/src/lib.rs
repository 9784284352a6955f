//! Cluster-API side of the ekstest harness
//!
//! - [`provisioner`] - installs `kubectl` and the identity-exchange helper
//! - [`kubeconfig`] - renders and parses the cluster credential file
//! - [`kubectl`] - runs `kubectl` and waits for nodes, pods and ingress hosts
//! - [`views`] - defensive parsers for `kubectl -o json` replies

#![deny(missing_docs)]

pub mod kubeconfig;
pub mod kubectl;
pub mod provisioner;
pub mod views;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use kubeconfig::CredentialParams;
pub use kubectl::Kubectl;
pub use provisioner::{BinarySpec, Provisioner, Toolchain};
pub use views::{NodeView, PodView};

/// Interval of every cluster-API poll loop
pub const KUBECTL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
