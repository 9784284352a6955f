//! Run parameters
//!
//! Every field has a default so a partial YAML document (or none at all) is
//! accepted; [`crate::validate::validate_and_set_defaults`] fills the derived
//! names and paths afterwards.

use std::fmt;
use std::path::PathBuf;

use ekstest_common::telemetry::LogFormat;
use serde::{Deserialize, Serialize};

use crate::state::ClusterState;

/// Default region
pub const DEFAULT_REGION: &str = "us-west-2";
/// Default Kubernetes version
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.29";
/// Default worker instance type
pub const DEFAULT_INSTANCE_TYPE: &str = "m5.large";
/// Default load-balancer controller image
pub const DEFAULT_CONTROLLER_IMAGE: &str = "docker.io/amazon/aws-alb-ingress-controller:v1.1.9";
/// Default ingress test server image
pub const DEFAULT_TEST_SERVER_IMAGE: &str = "public.ecr.aws/ekstest/ingress-test-server:latest";

/// Managed policies attached to the control-plane service role
pub const DEFAULT_SERVICE_ROLE_POLICIES: &[&str] = &[
    "arn:aws:iam::aws:policy/AmazonEKSServicePolicy",
    "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy",
];

/// Backend workload exposed through the load balancer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestMode {
    /// Multi-route test server driven by the in-process ingress client
    IngressTestServer,
    /// Single nginx route driven by `wrk`
    #[default]
    Nginx,
}

impl TestMode {
    /// Kebab-case name as written in the config
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IngressTestServer => "ingress-test-server",
            Self::Nginx => "nginx",
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Where this document is persisted
    pub config_path: PathBuf,

    /// Generated cluster credential file
    pub kubeconfig_path: PathBuf,
    /// Cluster-API client location
    pub kubectl_path: PathBuf,
    /// Download URL for the cluster-API client; empty means search `PATH`
    pub kubectl_download_url: String,
    /// Expected SHA-256 of the downloaded client; empty skips the check
    pub kubectl_download_sha256: String,
    /// Identity-exchange helper location
    pub aws_iam_authenticator_path: PathBuf,
    /// Download URL for the identity-exchange helper; empty means search `PATH`
    pub aws_iam_authenticator_download_url: String,
    /// Expected SHA-256 of the downloaded helper; empty skips the check
    pub aws_iam_authenticator_download_sha256: String,

    /// Enable debug logging and full subprocess output in errors
    pub log_debug: bool,
    /// Log line encoding
    pub log_format: LogFormat,
    /// Create an access-log bucket and point the load balancers at it
    pub log_access: bool,

    /// Upload the tester's config and credential file
    pub upload_tester_logs: bool,
    /// Upload collected worker-node logs
    pub upload_worker_node_logs: bool,
    /// Upload the generated credential file
    pub upload_kubeconfig: bool,
    /// Object-store bucket for artifacts; empty disables uploads
    pub artifact_bucket: String,
    /// Local directory for collected worker-node logs
    pub worker_node_logs_dir: PathBuf,

    /// Prefix used to generate the cluster name
    pub tag: String,
    /// Cluster name; generated when empty
    pub cluster_name: String,
    /// Provider region
    pub region: String,
    /// Kubernetes version of the control plane
    pub kubernetes_version: String,

    /// Three subnets across availability zones instead of one
    pub enable_ha: bool,
    /// CNI manifest applied after the control plane is ready; empty skips
    pub cni_manifest_url: String,

    /// Open TCP/22 on the worker security group and collect logs over SSH
    pub enable_worker_node_ssh: bool,
    /// Allow the control plane to reach every worker port, privileged ones included
    pub enable_worker_node_privileged_port_access: bool,
    /// Worker machine image
    pub worker_node_ami: String,
    /// Worker instance type
    pub worker_node_instance_type: String,
    /// Auto-scaling group minimum size
    pub worker_node_asg_min: u32,
    /// Auto-scaling group maximum size; also the number of nodes awaited
    pub worker_node_asg_max: u32,
    /// Worker root volume size
    pub worker_node_volume_size_gb: u32,

    /// Pause between a successful `Up` and teardown
    pub wait_before_down_seconds: u64,
    /// Tear everything down after the tests
    pub down: bool,

    /// Load-balancer add-on and probe parameters
    pub alb_ingress_controller: AlbConfig,

    /// Mutable record of what has been created
    pub cluster_state: ClusterState,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            kubeconfig_path: PathBuf::new(),
            kubectl_path: PathBuf::new(),
            kubectl_download_url: String::new(),
            kubectl_download_sha256: String::new(),
            aws_iam_authenticator_path: PathBuf::new(),
            aws_iam_authenticator_download_url: String::new(),
            aws_iam_authenticator_download_sha256: String::new(),
            log_debug: false,
            log_format: LogFormat::Text,
            log_access: false,
            upload_tester_logs: false,
            upload_worker_node_logs: false,
            upload_kubeconfig: false,
            artifact_bucket: String::new(),
            worker_node_logs_dir: PathBuf::new(),
            tag: String::new(),
            cluster_name: String::new(),
            region: DEFAULT_REGION.to_string(),
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            enable_ha: false,
            cni_manifest_url: String::new(),
            enable_worker_node_ssh: true,
            enable_worker_node_privileged_port_access: false,
            worker_node_ami: String::new(),
            worker_node_instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            worker_node_asg_min: 1,
            worker_node_asg_max: 1,
            worker_node_volume_size_gb: 40,
            wait_before_down_seconds: 0,
            down: true,
            alb_ingress_controller: AlbConfig::default(),
            cluster_state: ClusterState::default(),
        }
    }
}

impl Config {
    /// Directory holding the config document and generated files
    pub fn base_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Load-balancer add-on and probe parameters
///
/// The numeric probe parameters are signed so that a negative value in the
/// document is reported as invalid rather than silently wrapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AlbConfig {
    /// Deploy the add-on and run the probes
    pub enable: bool,
    /// Backend workload
    pub test_mode: TestMode,
    /// Load-balancer target type (`instance` or `ip`)
    pub target_type: String,
    /// Controller image
    pub controller_image: String,
    /// Ingress test server image
    pub test_server_image: String,
    /// Backend replicas
    pub test_server_replicas: i64,
    /// Number of routes the test server exposes
    pub test_server_routes: i64,
    /// Concurrent probe clients
    pub test_clients: i64,
    /// Requests issued by each client
    pub test_client_requests: i64,
    /// Backend response body size in bytes
    pub test_response_size: i64,
    /// Maximum tolerated failed requests
    pub test_client_error_threshold: i64,
    /// Minimum requests per second; zero disables the floor
    pub test_expect_qps: f64,
    /// Run the throughput probe
    pub test_scalability: bool,
    /// Duration of an external throughput run
    pub test_scalability_minutes: i64,
    /// Run the metrics probe
    pub test_metrics: bool,

    /// Rendered controller deployment
    pub ingress_controller_spec_path: PathBuf,
    /// Rendered backend deployment
    pub ingress_test_server_spec_path: PathBuf,
    /// Rendered ingress objects
    pub ingress_object_spec_path: PathBuf,
    /// Throughput probe output
    pub scalability_output_path: PathBuf,
    /// Metrics probe output
    pub metrics_output_path: PathBuf,
}

impl Default for AlbConfig {
    fn default() -> Self {
        Self {
            enable: false,
            test_mode: TestMode::Nginx,
            target_type: "instance".to_string(),
            controller_image: DEFAULT_CONTROLLER_IMAGE.to_string(),
            test_server_image: DEFAULT_TEST_SERVER_IMAGE.to_string(),
            test_server_replicas: 1,
            test_server_routes: 1,
            test_clients: 200,
            test_client_requests: 100,
            test_response_size: 40 * 1024,
            test_client_error_threshold: 10,
            test_expect_qps: 0.0,
            test_scalability: true,
            test_scalability_minutes: 1,
            test_metrics: true,
            ingress_controller_spec_path: PathBuf::new(),
            ingress_test_server_spec_path: PathBuf::new(),
            ingress_object_spec_path: PathBuf::new(),
            scalability_output_path: PathBuf::new(),
            metrics_output_path: PathBuf::new(),
        }
    }
}
