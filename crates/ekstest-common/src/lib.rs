//! Shared plumbing for the ekstest workspace
//!
//! Everything here is consumed by more than one crate:
//! - [`error`] - the error kinds every component surfaces
//! - [`poll`] - the bounded-time, cancellable wait primitive
//! - [`exec`] - subprocess execution with per-call timeouts and process-group kill
//! - [`fs`] - atomic file writes with explicit permissions
//! - [`telemetry`] - tracing subscriber initialization

#![deny(missing_docs)]

pub mod error;
pub mod exec;
pub mod fs;
pub mod poll;
pub mod telemetry;

pub use error::{Error, ErrorKind};
pub use tokio_util::sync::CancellationToken;

/// Result type alias using the shared Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of a generated or user-supplied cluster name
pub const MAX_CLUSTER_NAME_LEN: usize = 42;

/// Number of leading bytes of subprocess output surfaced in errors outside debug mode
pub const COMMAND_OUTPUT_PREVIEW: usize = 30;
