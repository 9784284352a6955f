//! Configuration store for the ekstest harness
//!
//! One YAML document holds both the frozen run parameters ([`Config`]) and
//! the mutable [`ClusterState`] record describing what has been created.
//! The document is layered (defaults, then the file, then `EKSTEST_*`
//! environment overrides), validated once, and afterwards only the state
//! record changes, always through the mutex-guarded [`Store`].

#![deny(missing_docs)]

pub mod config;
pub mod env;
pub mod state;
pub mod store;
pub mod validate;

pub use config::{AlbConfig, Config, TestMode};
pub use state::{
    AddOnState, ClusterState, KeyPairState, NetworkState, ProbeSummary, ResourceHandle,
    RoleState, StageState, WorkerNode, WorkerState,
};
pub use store::Store;
pub use validate::NameSeed;

/// Cluster status reported by the managed control plane when usable
pub const STATUS_ACTIVE: &str = "ACTIVE";
/// Control plane is being created
pub const STATUS_CREATING: &str = "CREATING";
/// Control plane is being deleted
pub const STATUS_DELETING: &str = "DELETING";
/// Control plane creation failed
pub const STATUS_FAILED: &str = "FAILED";
/// All resources are gone
pub const STATUS_DELETE_COMPLETE: &str = "DELETE_COMPLETE";
