//! Controller and test-server metrics
//!
//! Only the ingress client series are interpreted; every other line of the
//! exposition text is ignored, and so are lines that do not parse.

use std::path::Path;

use ekstest_common::fs::{write_atomic, MODE_PRIVATE};
use ekstest_common::{Error, Result};
use tracing::info;

const SUCCESS: &str = "ingress_client_count_success";
const FAILURE: &str = "ingress_client_count_failure";
const LATENCY_BUCKET: &str = "ingress_client_latency_bucket";

/// One histogram bucket, de-accumulated
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyBucket {
    /// Exclusive lower bound (the previous bucket's `le`)
    pub lower: f64,
    /// Inclusive upper bound (`le`)
    pub upper: f64,
    /// Observations in `(lower, upper]`
    pub count: f64,
}

/// Totals extracted from an exposition document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    /// Successful requests over every route
    pub success: f64,
    /// Failed requests over every route
    pub failure: f64,
    /// Latency distribution sorted by lower bound
    pub latency: Vec<LatencyBucket>,
}

fn split_sample(line: &str) -> Option<(&str, &str, f64)> {
    let (series, value) = line.rsplit_once(char::is_whitespace)?;
    let value = value.trim().parse::<f64>().ok()?;
    let series = series.trim();
    match series.split_once('{') {
        Some((name, labels)) => Some((name, labels.trim_end_matches('}'), value)),
        None => Some((series, "", value)),
    }
}

fn label<'a>(labels: &'a str, key: &str) -> Option<&'a str> {
    labels.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"'))
    })
}

fn parse_bound(le: &str) -> Option<f64> {
    match le {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        other => other.parse().ok(),
    }
}

/// Extract success and failure totals and the latency distribution
pub fn parse_metrics(text: &str) -> MetricsSummary {
    let mut summary = MetricsSummary::default();
    // cumulative counts per upper bound, summed over label sets
    let mut cumulative: Vec<(f64, f64)> = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, labels, value)) = split_sample(line) else {
            continue;
        };
        match name {
            SUCCESS => summary.success += value,
            FAILURE => summary.failure += value,
            LATENCY_BUCKET => {
                let Some(le) = label(labels, "le").and_then(parse_bound) else {
                    continue;
                };
                match cumulative.iter_mut().find(|(bound, _)| *bound == le) {
                    Some((_, count)) => *count += value,
                    None => cumulative.push((le, value)),
                }
            }
            _ => {}
        }
    }

    cumulative.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut lower = f64::NEG_INFINITY;
    let mut seen = 0.0;
    for (upper, total) in cumulative {
        summary.latency.push(LatencyBucket {
            lower,
            upper,
            count: (total - seen).max(0.0),
        });
        lower = upper;
        seen = total;
    }
    summary
}

/// Fetch `url`, keep the body at `output`, and summarise it
pub async fn fetch_metrics(
    client: &reqwest::Client,
    url: &str,
    output: &Path,
) -> Result<(MetricsSummary, String)> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::probe_assertion("metrics", format!("GET {}: {}", url, e)))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| Error::probe_assertion("metrics", format!("GET {}: {}", url, e)))?;
    if !status.is_success() {
        return Err(Error::probe_assertion(
            "metrics",
            format!("GET {}: status {}", url, status),
        ));
    }

    write_atomic(output, body.as_bytes(), MODE_PRIVATE)?;
    let summary = parse_metrics(&body);
    info!(
        url,
        success = summary.success,
        failure = summary.failure,
        buckets = summary.latency.len(),
        "metrics collected"
    );
    Ok((summary, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;

    const SAMPLE: &str = r#"# HELP ingress_client_count_success Successful requests
# TYPE ingress_client_count_success counter
ingress_client_count_success{route="/ingress-test-00000"} 70
ingress_client_count_success{route="/ingress-test-00001"} 30
ingress_client_count_failure{route="/ingress-test-00000"} 2
# TYPE ingress_client_latency histogram
ingress_client_latency_bucket{le="50"} 60
ingress_client_latency_bucket{le="+Inf"} 102
ingress_client_latency_bucket{le="10"} 25
ingress_client_latency_sum 4100
ingress_client_latency_count 102
go_goroutines 12
this line is garbage
"#;

    #[test]
    fn test_parse_totals_and_buckets() {
        let m = parse_metrics(SAMPLE);
        assert_eq!(m.success, 100.0);
        assert_eq!(m.failure, 2.0);

        let bounds: Vec<f64> = m.latency.iter().map(|b| b.upper).collect();
        assert_eq!(bounds, vec![10.0, 50.0, f64::INFINITY]);
        let counts: Vec<f64> = m.latency.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![25.0, 35.0, 42.0]);
        assert_eq!(m.latency[1].lower, 10.0);
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(parse_metrics(""), MetricsSummary::default());
    }

    #[tokio::test]
    async fn test_fetch_persists_body() {
        let router = Router::new().route("/metrics", get(|| async { SAMPLE }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("metrics.txt");
        let (summary, body) = fetch_metrics(
            &reqwest::Client::new(),
            &format!("http://{}/metrics", addr),
            &out,
        )
        .await
        .unwrap();
        assert_eq!(summary.success, 100.0);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), body);
    }
}
