//! Mutable cluster-state record
//!
//! The record is the only authority teardown consults: a resource is deleted
//! when, and only when, its handle says it was created. Handles are flipped
//! by [`ResourceHandle::mark_created`] after a create is observed and by
//! [`ResourceHandle::mark_deleted`] after a delete (or a "not found") is
//! observed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity and observed status of one provider resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ResourceHandle {
    /// Logical name chosen by the harness
    pub name: String,
    /// Provider-assigned identifier (ARN, stack id, group id, ...)
    pub id: String,
    /// Last status reported by the provider
    pub status: String,
    /// When `status` was observed
    pub observed_at: Option<DateTime<Utc>>,
    /// A create was observed and no delete since
    pub created: bool,
    /// Last error recorded against this resource
    pub error: String,
}

impl ResourceHandle {
    /// Handle with only a logical name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Record a status poll result
    pub fn observe(&mut self, status: impl Into<String>) {
        self.status = status.into();
        self.observed_at = Some(Utc::now());
    }

    /// Record a successful create
    pub fn mark_created(&mut self, id: impl Into<String>, status: impl Into<String>) {
        self.id = id.into();
        self.created = true;
        self.error.clear();
        self.observe(status);
    }

    /// Record a successful (or already-gone) delete
    pub fn mark_deleted(&mut self, status: impl Into<String>) {
        self.created = false;
        self.observe(status);
    }

    /// Record a failure without changing `created`
    pub fn fail(&mut self, error: impl ToString) {
        self.error = error.to_string();
        self.observed_at = Some(Utc::now());
    }
}

/// Control-plane service role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RoleState {
    /// Role name, ARN and created flag
    pub handle: ResourceHandle,
    /// Managed-policy ARNs attached to the role
    pub policies: Vec<String>,
    /// Every policy in `policies` is attached
    pub policies_attached: bool,
}

/// Virtual-network stack and its outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NetworkState {
    /// Stack name, id and created flag
    pub handle: ResourceHandle,
    /// VPC id
    pub vpc_id: String,
    /// Subnet ids, in stack output order
    pub subnet_ids: Vec<String>,
    /// Control-plane security group id
    pub security_group_id: String,
}

/// SSH key pair used to reach worker nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct KeyPairState {
    /// Key name, fingerprint and created flag
    pub handle: ResourceHandle,
    /// On-disk private key (mode 0400); never uploaded
    pub private_key_path: PathBuf,
}

/// One worker instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerNode {
    /// Public IPv4 address
    pub public_ip: String,
    /// Private IPv4 address
    pub private_ip: String,
    /// Public DNS name
    pub public_dns: String,
    /// Private DNS name
    pub private_dns: String,
    /// Instance type
    pub instance_type: String,
    /// Subnet id
    pub subnet_id: String,
    /// Instance state name (`running`, ...)
    pub status: String,
    /// Registered with the cluster and reporting `Ready=True`
    pub ready: bool,
}

/// Worker auto-scaling stack and its derived outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerState {
    /// Stack name, id, status and created flag
    pub stack: ResourceHandle,
    /// `NodeInstanceRole` stack output
    pub instance_role_arn: String,
    /// `NodeSecurityGroup` stack output
    pub security_group_id: String,
    /// Physical id of the auto-scaling group
    pub asg_name: String,
    /// TCP/22 ingress was authorised on the worker security group
    pub ssh_authorized: bool,
    /// Instances of the auto-scaling group, keyed by instance id
    pub nodes: BTreeMap<String, WorkerNode>,
}

/// Progress marker of one add-on stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageState {
    /// Nothing done yet
    #[default]
    Init,
    /// Apply or create in flight
    Creating,
    /// Accepted by the cluster or provider
    Applied,
    /// Readiness observed
    Ready,
    /// Create or readiness failed
    Failed,
    /// Delete in flight
    Deleting,
    /// Deleted or never existed
    DeleteComplete,
}

impl StageState {
    /// Kebab-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Creating => "creating",
            Self::Applied => "applied",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::DeleteComplete => "delete-complete",
        }
    }

    /// True when the stage may have left something behind in the cluster
    pub fn needs_teardown(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Applied | Self::Ready | Self::Failed | Self::Deleting
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the last throughput probe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProbeSummary {
    /// Observed successful requests per second
    pub requests_per_second: f64,
    /// Failed requests
    pub failures: i64,
    /// First few error messages
    pub errors: Vec<String>,
    /// Raw probe output file
    pub output_path: PathBuf,
}

/// Load-balancer add-on progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AddOnState {
    /// At least one stage reached the cluster or provider
    pub created: bool,
    /// Controller cluster-role, service-account and binding
    pub rbac: StageState,
    /// Controller deployment and service
    pub controller: StageState,
    /// Controller security group stage
    pub security_group_stage: StageState,
    /// Controller security group
    pub security_group: ResourceHandle,
    /// Backend workload
    pub backend: StageState,
    /// Ingress objects
    pub ingress: StageState,
    /// Namespace to load-balancer DNS name
    pub dns_names: BTreeMap<String, String>,
    /// Load-balancer name to ARN
    pub load_balancer_arns: BTreeMap<String, String>,
    /// Last throughput probe
    pub probe: ProbeSummary,
    /// Last add-on error
    pub last_error: String,
}

/// Everything the harness created and what the provider last said about it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterState {
    /// Control-plane status (`ACTIVE`, `DELETING`, ...)
    pub status: String,
    /// API server endpoint
    pub endpoint: String,
    /// Base64 certificate-authority data
    pub certificate_authority: String,
    /// Managed platform version
    pub platform_version: String,
    /// Control-plane creation time reported by the provider
    pub created_at: Option<DateTime<Utc>>,
    /// Account the run operates in
    pub aws_account_id: String,
    /// Caller ARN
    pub caller_arn: String,
    /// Time from `Up` start to worker readiness
    pub cluster_up_took: String,
    /// Time the add-on took to expose its ingress hosts
    pub ingress_up_took: String,
    /// Last error surfaced by `Up` or `Down`
    pub last_error: String,

    /// Optional load-balancer access-log bucket
    pub access_log_bucket: ResourceHandle,
    /// Control-plane service role
    pub role: RoleState,
    /// Virtual-network stack
    pub network: NetworkState,
    /// Managed control plane
    pub control_plane: ResourceHandle,
    /// SSH key pair
    pub key_pair: KeyPairState,
    /// Worker auto-scaling stack
    pub worker: WorkerState,
    /// Load-balancer add-on
    pub addon: AddOnState,

    /// Collected worker log file to object-store key
    pub worker_logs: BTreeMap<String, String>,
}

impl ClusterState {
    /// Every created flag with its kebab-case name
    pub fn created_flags(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("access-log-bucket-created", self.access_log_bucket.created),
            ("role-created", self.role.handle.created),
            ("policies-attached", self.role.policies_attached),
            ("network-stack-created", self.network.handle.created),
            ("cluster-created", self.control_plane.created),
            ("key-pair-created", self.key_pair.handle.created),
            ("worker-created", self.worker.stack.created),
            ("addon-created", self.addon.created),
            ("alb-security-group-created", self.addon.security_group.created),
        ]
    }

    /// True while any resource still needs a delete
    pub fn any_created(&self) -> bool {
        self.created_flags().iter().any(|(_, created)| *created)
    }

    /// Names of the flags that are still set
    pub fn still_created(&self) -> Vec<&'static str> {
        self.created_flags()
            .into_iter()
            .filter_map(|(name, created)| created.then_some(name))
            .collect()
    }
}
