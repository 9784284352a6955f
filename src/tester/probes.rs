use std::time::Duration;

use ekstest_addon::manifests::{
    route_path, BACKEND_NAMESPACE, CONTROLLER_NAMESPACE, METRICS_PATH, TEST_SERVER_PATH,
};
use ekstest_cloud::steward::verify_target_health;
use ekstest_common::fs::{write_atomic, MODE_PRIVATE};
use ekstest_common::{Error, Result};
use ekstest_config::TestMode;
use ekstest_probe::ingress_client::{self, IngressClientConfig};
use ekstest_probe::metrics::fetch_metrics;
use ekstest_probe::{assert_throughput, CorrectnessProbe, ThroughputReport, WrkRunner};
use tracing::info;

use super::Tester;

/// Budget for every target behind a load balancer to turn healthy
pub const TARGET_HEALTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl Tester {
    fn ingress_host(&self, namespace: &str) -> Result<String> {
        self.store
            .state()
            .addon
            .dns_names
            .get(namespace)
            .cloned()
            .ok_or_else(|| {
                Error::internal_with_context(
                    "probe",
                    format!("no ingress host recorded for namespace {}; run up first", namespace),
                )
            })
    }

    /// Fetch the backend until it serves the expected body, then check
    /// target health behind every recorded load balancer
    pub async fn test_correctness(&self) -> Result<()> {
        let alb = &self.config().alb_ingress_controller;
        let host = self.ingress_host(BACKEND_NAMESPACE)?;
        let path = match alb.test_mode {
            TestMode::Nginx => "/",
            TestMode::IngressTestServer => TEST_SERVER_PATH,
        };
        let url = format!("http://{}{}", host, path);

        let mut probe = CorrectnessProbe::new(self.http.clone(), url, alb.test_response_size as usize);
        if let Some((attempts, every)) = self.correctness_schedule {
            probe = probe.with_schedule(attempts, every);
        }
        probe.run(&self.cancel).await?;

        let arns = self.store.state().addon.load_balancer_arns;
        for (name, arn) in &arns {
            verify_target_health(
                self.cloud.elb.as_ref(),
                arn,
                self.timeouts.short_interval,
                TARGET_HEALTH_TIMEOUT,
                &self.cancel,
            )
            .await?;
            info!(load_balancer = %name, "targets healthy");
        }
        Ok(())
    }

    /// Load the backend and check the error budget and QPS floor
    ///
    /// nginx mode runs `wrk`; test-server mode runs the in-process client
    /// over every generated route.
    pub async fn test_throughput(&self) -> Result<()> {
        let alb = &self.config().alb_ingress_controller;
        if !alb.test_scalability {
            info!("throughput test disabled");
            return Ok(());
        }
        let host = self.ingress_host(BACKEND_NAMESPACE)?;

        let report: ThroughputReport = match alb.test_mode {
            TestMode::Nginx => {
                let duration = Duration::from_secs(alb.test_scalability_minutes as u64 * 60);
                let (result, raw) = WrkRunner::new(self.host_runner.clone())
                    .run(
                        &format!("http://{}/", host),
                        alb.test_clients as usize,
                        duration,
                        &self.cancel,
                    )
                    .await?;
                result.report(raw)
            }
            TestMode::IngressTestServer => {
                let cfg = IngressClientConfig {
                    endpoint: format!("http://{}", host),
                    routes: (0..alb.test_server_routes as usize).map(route_path).collect(),
                    clients: alb.test_clients as usize,
                    requests: alb.test_client_requests as usize,
                    response_size: Some(alb.test_response_size as usize),
                    request_timeout: CLIENT_REQUEST_TIMEOUT,
                };
                ingress_client::run(&cfg, &self.cancel).await?
            }
        };

        write_atomic(&alb.scalability_output_path, report.output.as_bytes(), MODE_PRIVATE)?;
        let summary = report.summary(alb.scalability_output_path.clone());
        self.store.update(|s| s.addon.probe = summary)?;
        assert_throughput(&report, alb.test_client_error_threshold, alb.test_expect_qps)
    }

    /// Scrape the controller's metrics into the metrics output file
    pub async fn test_metrics(&self) -> Result<()> {
        let alb = &self.config().alb_ingress_controller;
        if !alb.test_metrics {
            info!("metrics test disabled");
            return Ok(());
        }
        let host = self.ingress_host(CONTROLLER_NAMESPACE)?;
        let url = format!("http://{}{}", host, METRICS_PATH);
        fetch_metrics(&self.http, &url, &alb.metrics_output_path).await?;
        Ok(())
    }
}
