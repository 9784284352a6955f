//! Throughput results and their assertions

use ekstest_common::{Error, Result};
use ekstest_config::ProbeSummary;
use std::path::PathBuf;
use tracing::{info, warn};

/// Outcome of one throughput run, whichever tool produced it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThroughputReport {
    /// Successful requests per second
    pub requests_per_second: f64,
    /// Requests issued
    pub requests: u64,
    /// Failed requests
    pub failures: i64,
    /// First few failure messages
    pub errors: Vec<String>,
    /// Raw tool output kept as an artifact
    pub output: String,
}

impl ThroughputReport {
    /// Summary as persisted in the add-on record
    pub fn summary(&self, output_path: PathBuf) -> ProbeSummary {
        ProbeSummary {
            requests_per_second: self.requests_per_second,
            failures: self.failures,
            errors: self.errors.clone(),
            output_path,
        }
    }
}

/// Check a report against the error budget and the QPS floor
///
/// The floor only applies when `expect_qps` is positive.
pub fn assert_throughput(report: &ThroughputReport, error_threshold: i64, expect_qps: f64) -> Result<()> {
    if report.failures > error_threshold {
        warn!(failures = report.failures, threshold = error_threshold, "error budget exceeded");
        return Err(Error::probe_assertion(
            "throughput",
            format!(
                "{} failed requests exceed the threshold of {}",
                report.failures, error_threshold
            ),
        ));
    }
    if expect_qps > 0.0 && report.requests_per_second < expect_qps {
        return Err(Error::probe_assertion(
            "throughput",
            format!(
                "observed {:.2} requests/sec, expected at least {:.2}",
                report.requests_per_second, expect_qps
            ),
        ));
    }
    info!(
        qps = report.requests_per_second,
        failures = report.failures,
        "throughput within budget"
    );
    Ok(())
}
