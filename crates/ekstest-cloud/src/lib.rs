//! Provider side of the ekstest harness
//!
//! - [`api`] - one trait per provider service plus [`CloudClients`]
//! - [`aws_cli`] - backend that shells out to the `aws` client
//! - [`templates`] - network and worker node group stack templates
//! - [`steward`] - create, wait and delete for every provider resource
//!
//! With the `testing` feature, [`fake::FakeCloud`] implements every service
//! over an in-memory world.

#![deny(missing_docs)]

pub mod api;
pub mod aws_cli;
pub mod steward;
pub mod templates;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use api::CloudClients;
pub use aws_cli::AwsCli;
pub use steward::{StewardContext, Timeouts};
