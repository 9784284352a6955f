//! Probes against the deployed add-on and worker artifact collection
//!
//! - [`correctness`]: fetch until the backend answers with the expected body
//! - [`ingress_client`] and [`wrk`]: drive load and report throughput
//! - [`metrics`]: read the ingress client series from an exposition document
//! - [`logs`]: capture worker-node logs over SSH
//! - [`upload`]: push artifacts to the object store, never the private key

#![deny(missing_docs)]

pub mod correctness;
pub mod ingress_client;
pub mod logs;
pub mod metrics;
pub mod throughput;
pub mod upload;
pub mod wrk;

pub use correctness::CorrectnessProbe;
pub use logs::{LogCollection, LogCollector};
pub use metrics::{parse_metrics, MetricsSummary};
pub use throughput::{assert_throughput, ThroughputReport};
pub use upload::{gen_s3_url, GuardedUploader, S3Uploader, Uploader};
pub use wrk::{WrkResult, WrkRunner};
