//! ekstest - end-to-end harness for managed Kubernetes clusters
//!
//! The binary drives two things:
//! - [`tester`] - brings a cluster and its load-balancer add-on up against
//!   the provider, probes it and tears it down again, keeping a persisted
//!   record of everything it created
//! - [`suite`] - runs a user's build, install and test snippets against a
//!   cluster created by `kops` or `eksctl`
//!
//! The component crates do the work: `ekstest-config` owns the record,
//! `ekstest-cloud` the provider resources, `ekstest-kube` the cluster API,
//! `ekstest-addon` the add-on, and `ekstest-probe` the probes and artifacts.

#![deny(missing_docs)]

pub mod suite;
pub mod tester;

pub use suite::{SuiteRunner, TestConfig};
pub use tester::Tester;
