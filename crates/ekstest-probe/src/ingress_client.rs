//! In-process ingress load client
//!
//! `clients` concurrent requesters each issue `requests` GETs, walking the
//! route list round-robin from their own offset. Outcomes land in a private
//! prometheus registry: a success and a failure counter per route plus a
//! latency histogram. The rendered registry uses the same series names the
//! ingress test server exports, so [`crate::metrics::parse_metrics`] reads
//! both.

use std::sync::Arc;
use std::time::Duration;

use ekstest_common::poll::until_cancelled;
use ekstest_common::{CancellationToken, Error, Result};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::throughput::ThroughputReport;

/// Error messages kept in a report
pub const MAX_RECORDED_ERRORS: usize = 10;

/// Load-test parameters
#[derive(Debug, Clone)]
pub struct IngressClientConfig {
    /// Scheme and host, without a trailing slash
    pub endpoint: String,
    /// Paths to request
    pub routes: Vec<String>,
    /// Concurrent requesters
    pub clients: usize,
    /// Requests per requester
    pub requests: usize,
    /// Expected body size; other sizes count as failures
    pub response_size: Option<usize>,
    /// Per-request timeout
    pub request_timeout: Duration,
}

struct Instruments {
    registry: Registry,
    success: IntCounterVec,
    failure: IntCounterVec,
    latency: Histogram,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::internal_with_context("ingress-client-metrics", e.to_string())
}

impl Instruments {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let success = IntCounterVec::new(
            Opts::new("ingress_client_count_success", "Successful requests"),
            &["route"],
        )
        .map_err(metric_error)?;
        let failure = IntCounterVec::new(
            Opts::new("ingress_client_count_failure", "Failed requests"),
            &["route"],
        )
        .map_err(metric_error)?;
        let latency = Histogram::with_opts(
            HistogramOpts::new("ingress_client_latency", "Request latency in milliseconds")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
        )
        .map_err(metric_error)?;

        registry.register(Box::new(success.clone())).map_err(metric_error)?;
        registry.register(Box::new(failure.clone())).map_err(metric_error)?;
        registry.register(Box::new(latency.clone())).map_err(metric_error)?;
        Ok(Self {
            registry,
            success,
            failure,
            latency,
        })
    }

    fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metric_error)?;
        String::from_utf8(buf).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Drive the configured load and summarise it
pub async fn run(cfg: &IngressClientConfig, cancel: &CancellationToken) -> Result<ThroughputReport> {
    if cfg.routes.is_empty() {
        return Err(Error::invalid_config("test-server-routes", "no routes to request"));
    }
    let client = reqwest::Client::builder()
        .timeout(cfg.request_timeout)
        .build()
        .map_err(|e| Error::internal_with_context("ingress-client", e.to_string()))?;
    let instruments = Arc::new(Instruments::new()?);
    let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
    let routes = Arc::new(cfg.routes.clone());

    info!(
        endpoint = %cfg.endpoint,
        clients = cfg.clients,
        requests = cfg.requests,
        routes = routes.len(),
        "starting ingress load"
    );
    let started = Instant::now();

    let mut set = JoinSet::new();
    for worker in 0..cfg.clients {
        let client = client.clone();
        let instruments = instruments.clone();
        let errors = errors.clone();
        let routes = routes.clone();
        let endpoint = cfg.endpoint.clone();
        let requests = cfg.requests;
        let expected = cfg.response_size;
        let cancel = cancel.clone();

        set.spawn(async move {
            for i in 0..requests {
                if cancel.is_cancelled() {
                    return;
                }
                let route = &routes[(worker + i) % routes.len()];
                let begin = Instant::now();
                let outcome = fetch(&client, &format!("{}{}", endpoint, route), expected).await;
                instruments
                    .latency
                    .observe(begin.elapsed().as_secs_f64() * 1000.0);
                match outcome {
                    Ok(()) => instruments.success.with_label_values(&[route.as_str()]).inc(),
                    Err(msg) => {
                        instruments.failure.with_label_values(&[route.as_str()]).inc();
                        if let Ok(mut errs) = errors.lock() {
                            if errs.len() < MAX_RECORDED_ERRORS {
                                errs.push(msg);
                            }
                        }
                    }
                }
            }
        });
    }

    let drained = until_cancelled("ingress-client", cancel, async {
        while set.join_next().await.is_some() {}
        Ok(())
    })
    .await;
    if let Err(e) = drained {
        set.abort_all();
        return Err(e);
    }

    let elapsed = started.elapsed();
    let success: u64 = routes
        .iter()
        .map(|r| instruments.success.with_label_values(&[r.as_str()]).get())
        .sum();
    let failures: u64 = routes
        .iter()
        .map(|r| instruments.failure.with_label_values(&[r.as_str()]).get())
        .sum();
    let secs = elapsed.as_secs_f64();
    let requests_per_second = if secs > 0.0 { success as f64 / secs } else { 0.0 };
    debug!(success, failures, elapsed = ?elapsed, "ingress load finished");

    let errors = errors.lock().map(|e| e.clone()).unwrap_or_default();
    Ok(ThroughputReport {
        requests_per_second,
        requests: success + failures,
        failures: failures as i64,
        errors,
        output: instruments.render()?,
    })
}

async fn fetch(
    client: &reqwest::Client,
    url: &str,
    expected: Option<usize>,
) -> std::result::Result<(), String> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("GET {}: {}", url, e))?;
    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| format!("GET {}: reading body: {}", url, e))?;
    if !status.is_success() {
        return Err(format!("GET {}: status {}", url, status));
    }
    match expected {
        Some(size) if body.len() != size => Err(format!(
            "GET {}: body is {} bytes, expected {}",
            url,
            body.len(),
            size
        )),
        _ => Ok(()),
    }
}
