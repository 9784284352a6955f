//! `wrk` runner and output parser
//!
//! The parser reads the default `wrk --latency` report:
//!
//! ```text
//! Running 1m test @ http://example/
//!   2 threads and 200 connections
//!   Thread Stats   Avg      Stdev     Max   +/- Stdev
//!     Latency    36.79ms   21.24ms 305.36ms   78.90%
//!     Req/Sec     2.79k   279.76     3.53k    72.50%
//!   Latency Distribution
//!      50%   33.27ms
//!      75%   44.37ms
//!      90%   60.67ms
//!      99%  112.02ms
//!   333380 requests in 1.00m, 270.22MB read
//!   Non-2xx or 3xx responses: 12
//! Requests/sec:   5555.53
//! Transfer/sec:      4.50MB
//! ```
//!
//! Lines are matched on their leading token, so indentation and trailing
//! whitespace do not matter.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use ekstest_common::exec::{CommandRunner, CommandSpec};
use ekstest_common::poll::until_cancelled;
use ekstest_common::{CancellationToken, Error, Result};
use tracing::info;

use crate::throughput::ThroughputReport;

/// Parsed `wrk` report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WrkResult {
    /// Worker threads
    pub threads: u64,
    /// Open connections
    pub connections: u64,
    /// Mean latency
    pub latency_avg: Duration,
    /// Latency standard deviation
    pub latency_stdev: Duration,
    /// Worst latency
    pub latency_max: Duration,
    /// Median latency
    pub latency_p50: Duration,
    /// 75th percentile latency
    pub latency_p75: Duration,
    /// 90th percentile latency
    pub latency_p90: Duration,
    /// 99th percentile latency
    pub latency_p99: Duration,
    /// Completed requests
    pub requests: u64,
    /// Requests per second
    pub requests_per_second: f64,
    /// Total bytes read, as printed (`270.22MB`)
    pub transfer_total: String,
    /// Bytes per second, as printed (`4.50MB`)
    pub transfer_per_second: String,
    /// Responses outside 2xx/3xx
    pub non_2xx: u64,
    /// Connect, read, write and timeout errors
    pub socket_errors: u64,
}

impl WrkResult {
    /// Failed requests: bad statuses plus socket errors
    pub fn failures(&self) -> u64 {
        self.non_2xx + self.socket_errors
    }

    /// Convert to the tool-independent throughput report
    pub fn report(&self, output: impl Into<String>) -> ThroughputReport {
        ThroughputReport {
            requests_per_second: self.requests_per_second,
            requests: self.requests,
            failures: self.failures() as i64,
            errors: Vec::new(),
            output: output.into(),
        }
    }
}

fn invalid(line: &str, what: &str) -> Error {
    Error::serialization(format!("wrk output: cannot parse {} from {:?}", what, line.trim()))
}

/// Parse `12.5us`, `36.79ms`, `1.02s` or `2.00m`
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (value, unit) = s.split_at(split);
    let value: f64 = value.parse().ok()?;
    let secs = match unit {
        "us" => value / 1_000_000.0,
        "ms" => value / 1_000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    (secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Parse a `wrk` report
pub fn parse(output: &str) -> Result<WrkResult> {
    let mut result = WrkResult::default();
    let mut saw_requests = false;
    let mut saw_rate = false;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [threads, "threads", "and", connections, "connections", ..] => {
                result.threads = threads.parse().map_err(|_| invalid(line, "threads"))?;
                result.connections = connections
                    .parse()
                    .map_err(|_| invalid(line, "connections"))?;
            }
            ["Latency", avg, stdev, max, ..] => {
                result.latency_avg = parse_duration(avg).ok_or_else(|| invalid(line, "latency"))?;
                result.latency_stdev =
                    parse_duration(stdev).ok_or_else(|| invalid(line, "latency"))?;
                result.latency_max = parse_duration(max).ok_or_else(|| invalid(line, "latency"))?;
            }
            [pct, value] if pct.ends_with('%') => {
                let slot = match *pct {
                    "50%" | "50.000%" => &mut result.latency_p50,
                    "75%" | "75.000%" => &mut result.latency_p75,
                    "90%" | "90.000%" => &mut result.latency_p90,
                    "99%" | "99.000%" => &mut result.latency_p99,
                    _ => continue,
                };
                *slot = parse_duration(value).ok_or_else(|| invalid(line, "percentile"))?;
            }
            [requests, "requests", "in", _, total, "read"] => {
                result.requests = requests.parse().map_err(|_| invalid(line, "requests"))?;
                result.transfer_total = total.to_string();
                saw_requests = true;
            }
            ["Non-2xx", "or", "3xx", "responses:", count] => {
                result.non_2xx = count.parse().map_err(|_| invalid(line, "non-2xx"))?;
            }
            ["Socket", "errors:", rest @ ..] => {
                result.socket_errors = rest
                    .iter()
                    .map(|f| f.trim_end_matches(','))
                    .filter_map(|f| f.parse::<u64>().ok())
                    .sum();
            }
            ["Requests/sec:", rate] => {
                result.requests_per_second = rate.parse().map_err(|_| invalid(line, "requests/sec"))?;
                saw_rate = true;
            }
            ["Transfer/sec:", rate] => result.transfer_per_second = rate.to_string(),
            _ => {}
        }
    }

    if !saw_requests || !saw_rate {
        return Err(Error::serialization(
            "wrk output: missing request totals or Requests/sec",
        ));
    }
    Ok(result)
}

/// Merge results of several runs: latencies are averaged, counts summed
pub fn combine(results: &[WrkResult]) -> WrkResult {
    if results.is_empty() {
        return WrkResult::default();
    }
    let n = results.len() as u32;
    let avg = |f: fn(&WrkResult) -> Duration| results.iter().map(f).sum::<Duration>() / n;

    WrkResult {
        threads: results.iter().map(|r| r.threads).sum(),
        connections: results.iter().map(|r| r.connections).sum(),
        latency_avg: avg(|r| r.latency_avg),
        latency_stdev: avg(|r| r.latency_stdev),
        latency_max: results.iter().map(|r| r.latency_max).max().unwrap_or_default(),
        latency_p50: avg(|r| r.latency_p50),
        latency_p75: avg(|r| r.latency_p75),
        latency_p90: avg(|r| r.latency_p90),
        latency_p99: avg(|r| r.latency_p99),
        requests: results.iter().map(|r| r.requests).sum(),
        requests_per_second: results.iter().map(|r| r.requests_per_second).sum(),
        transfer_total: String::new(),
        transfer_per_second: String::new(),
        non_2xx: results.iter().map(|r| r.non_2xx).sum(),
        socket_errors: results.iter().map(|r| r.socket_errors).sum(),
    }
}

/// CSV with a header row and one row per result; latencies in milliseconds
pub fn to_csv(results: &[WrkResult]) -> String {
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let mut out = String::from(
        "threads,connections,latency_avg_ms,latency_stdev_ms,latency_max_ms,p50_ms,p75_ms,p90_ms,p99_ms,requests,requests_per_second,transfer_total,transfer_per_second,non_2xx,socket_errors\n",
    );
    for r in results {
        let _ = writeln!(
            out,
            "{},{},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{},{:.2},{},{},{},{}",
            r.threads,
            r.connections,
            ms(r.latency_avg),
            ms(r.latency_stdev),
            ms(r.latency_max),
            ms(r.latency_p50),
            ms(r.latency_p75),
            ms(r.latency_p90),
            ms(r.latency_p99),
            r.requests,
            r.requests_per_second,
            r.transfer_total,
            r.transfer_per_second,
            r.non_2xx,
            r.socket_errors,
        );
    }
    out
}

/// Invokes `wrk` against one endpoint
#[derive(Clone)]
pub struct WrkRunner {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl std::fmt::Debug for WrkRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrkRunner").field("binary", &self.binary).finish()
    }
}

impl WrkRunner {
    /// Runner using the `wrk` found on `PATH`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: "wrk".to_string(),
        }
    }

    /// Use a specific binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Command line for a run of `duration` with `connections` clients
    pub fn command(&self, url: &str, connections: usize, duration: Duration) -> CommandSpec {
        let connections = connections.max(1);
        let threads = connections.clamp(1, 16);
        let secs = duration.as_secs().max(1);
        CommandSpec::new(&self.binary)
            .arg(format!("--threads={}", threads))
            .arg(format!("--connections={}", connections))
            .arg(format!("--duration={}s", secs))
            .arg("--latency")
            .arg(url)
            .timeout(duration + Duration::from_secs(60))
    }

    /// Run and parse
    pub async fn run(
        &self,
        url: &str,
        connections: usize,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(WrkResult, String)> {
        let spec = self.command(url, connections, duration);
        info!(command = %spec, "running wrk");
        let out = until_cancelled("wrk", cancel, self.runner.run(spec.clone()))
            .await?
            .check(&spec, true)?;
        let parsed = parse(&out.stdout)?;
        info!(
            requests = parsed.requests,
            qps = parsed.requests_per_second,
            failures = parsed.failures(),
            "wrk finished"
        );
        Ok((parsed, out.stdout))
    }
}
