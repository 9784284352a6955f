//! Load-balancer controller add-on
//!
//! [`manifests`] renders every Kubernetes object the add-on needs from typed
//! k8s-openapi values. [`pipeline`] applies them in five recorded stages and
//! tears them down again in reverse.

#![deny(missing_docs)]

pub mod manifests;
pub mod pipeline;

pub use pipeline::{AddOnPipeline, AddOnTimeouts, Stage};
