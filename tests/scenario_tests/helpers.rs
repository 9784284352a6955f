//! Shared fixtures: a tester wired to the provider and kubectl doubles,
//! a loopback backend, and millisecond-scale wait budgets

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use ekstest::Tester;
use ekstest_addon::AddOnTimeouts;
use ekstest_cloud::fake::FakeCloud;
use ekstest_cloud::{CloudClients, Timeouts};
use ekstest_common::exec::{CommandOutput, MockCommandRunner};
use ekstest_config::validate::{validate_and_set_defaults, NameSeed};
use ekstest_config::{Config, Store};
use ekstest_kube::fake::FakeKubectl;
use ekstest_kube::provisioner::{Toolchain, AUTHENTICATOR, KUBECTL};

pub const BACKEND_HOST: &str = "k8s-default-ingressf-4e5f6a7b-2222.us-west-2.elb.amazonaws.com";
pub const BACKEND_LB: &str = "k8s-default-ingressf-4e5f6a7b";
pub const METRICS_HOST: &str = "k8s-kubesyst-ingressf-0a1b2c3d-1111.us-west-2.elb.amazonaws.com";
pub const METRICS_LB: &str = "k8s-kubesyst-ingressf-0a1b2c3d";

pub const METRICS_BODY: &str = r#"# HELP ingress_client_count_success Successful requests
# TYPE ingress_client_count_success counter
ingress_client_count_success{route="/"} 1200
# HELP ingress_client_count_failure Failed requests
# TYPE ingress_client_count_failure counter
ingress_client_count_failure{route="/"} 0
"#;

/// `wrk` report with the given number of bad responses
pub fn wrk_output(non_2xx: u64) -> String {
    let mut out = String::from(
        "Running 1m test @ http://backend/
  2 threads and 200 connections
  Thread Stats   Avg      Stdev     Max   +/- Stdev
    Latency     4.10ms    1.20ms   48.00ms   91.00%
  Latency Distribution
     50%    3.90ms
     75%    4.60ms
     90%    5.40ms
     99%    9.80ms
  72000 requests in 1.00m, 3.10MB read
",
    );
    if non_2xx > 0 {
        out.push_str(&format!("  Non-2xx or 3xx responses: {}\n", non_2xx));
    }
    out.push_str("Requests/sec:   1200.00\nTransfer/sec:     52.90KB\n");
    out
}

/// Host runner whose `wrk` prints `output`
pub fn wrk_runner(output: String) -> Arc<MockCommandRunner> {
    let mut runner = MockCommandRunner::new();
    runner
        .expect_run()
        .withf(|spec| spec.program == "wrk")
        .returning(move |_| Ok(CommandOutput::ok(output.clone())));
    Arc::new(runner)
}

/// Validated config rooted in `dir`
pub fn config(dir: &Path) -> Config {
    let mut cfg = Config {
        config_path: dir.join("scenario.yaml"),
        cluster_name: "scenario".to_string(),
        ..Default::default()
    };
    let seed = NameSeed {
        user_id: "ci".to_string(),
        hostname: "runner".to_string(),
        now: chrono::Utc::now(),
    };
    validate_and_set_defaults(&mut cfg, &seed).unwrap();
    cfg
}

pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        control_plane_pre_wait: Duration::ZERO,
        control_plane: Duration::from_secs(5),
        control_plane_interval: Duration::from_millis(10),
        cluster_delete_pre_wait: Duration::ZERO,
        cluster_delete: Duration::from_secs(5),
        stack: Duration::from_secs(5),
        stack_interval: Duration::from_millis(10),
        key_pair: Duration::from_secs(5),
        join: Duration::from_secs(5),
        dependency_retry: Duration::from_secs(5),
        short_interval: Duration::from_millis(10),
    }
}

pub fn fast_addon_timeouts() -> AddOnTimeouts {
    AddOnTimeouts {
        apply: Duration::from_secs(5),
        pods: Duration::from_secs(5),
        ingress_host: Duration::from_secs(5),
        load_balancer: Duration::from_secs(5),
        interval: Duration::from_millis(10),
    }
}

pub struct World {
    pub tester: Tester,
    pub cloud: Arc<FakeCloud>,
    pub kube: Arc<FakeKubectl>,
}

/// Tester over fresh doubles, with every worker registered and ready
pub async fn world(cfg: Config) -> World {
    let cloud = Arc::new(FakeCloud::new());
    let kube = Arc::new(FakeKubectl::new());
    kube.set_nodes(cfg.worker_node_asg_max as usize, true);
    let mut toolchain = Toolchain::default();
    toolchain.insert(KUBECTL, PathBuf::from("/usr/bin/kubectl"));
    toolchain.insert(AUTHENTICATOR, PathBuf::from("/usr/bin/aws-iam-authenticator"));
    let tester = Tester::new(
        Arc::new(Store::new(cfg)),
        CloudClients::from_backend(cloud.clone()),
        kube.clone(),
        &toolchain,
    )
    .await
    .unwrap();
    World { tester, cloud, kube }
}

/// Serve `size` zeros on `/` and a metrics page on `/metrics`
pub async fn serve_backend(size: usize) -> u16 {
    let body = "0".repeat(size);
    let app = Router::new()
        .route("/", get(move || async move { body }))
        .route("/metrics", get(|| async { METRICS_BODY }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Client that resolves both ingress hostnames to the loopback backend
pub fn loopback_client(port: u16) -> reqwest::Client {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    reqwest::Client::builder()
        .resolve(BACKEND_HOST, addr)
        .resolve(METRICS_HOST, addr)
        .build()
        .unwrap()
}

/// Point both ingresses, and the load balancers behind them, at `port`
pub fn route_ingresses(w: &World, port: u16) {
    let backend = format!("{}:{}", BACKEND_HOST, port);
    let metrics = format!("{}:{}", METRICS_HOST, port);
    w.kube.set_ingress_host("default", &backend);
    w.kube.set_ingress_host("kube-system", &metrics);
    w.cloud.expect_load_balancer(BACKEND_LB, &backend);
    w.cloud.expect_load_balancer(METRICS_LB, &metrics);
}

/// Every resource the provider saw created was deleted again
pub fn assert_nothing_leaked(cloud: &FakeCloud) {
    let deleted = cloud.deleted();
    for resource in cloud.created() {
        assert!(deleted.contains(&resource), "{} was never deleted", resource);
    }
    assert!(cloud.live_resources().is_empty(), "{:?}", cloud.live_resources());
}
