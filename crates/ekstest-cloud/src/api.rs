//! Provider service surface
//!
//! One trait per provider service, covering only the calls the stewards
//! make. Implementations classify failures through
//! [`ekstest_common::Error::from_provider`] so callers can match on
//! not-found and dependency-violation without parsing messages.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ekstest_common::{Error, Result};

/// Provider error codes meaning the create already happened
const ALREADY_EXISTS_CODES: &[&str] = &[
    "EntityAlreadyExists",
    "AlreadyExistsException",
    "InvalidKeyPair.Duplicate",
    "InvalidGroup.Duplicate",
    "InvalidPermission.Duplicate",
    "BucketAlreadyOwnedByYou",
];

/// True when a create failed only because the resource is already there
pub fn is_already_exists(err: &Error) -> bool {
    match err {
        Error::CloudTerminal { status, message, .. } => {
            ALREADY_EXISTS_CODES.contains(&status.as_str()) || message.contains("already exists")
        }
        _ => false,
    }
}

// =============================================================================
// STS
// =============================================================================

/// Who the harness is running as
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Account id
    pub account: String,
    /// Caller ARN
    pub arn: String,
    /// Unique user id
    pub user_id: String,
}

/// Security token service
#[async_trait]
pub trait Sts: Send + Sync {
    /// Identity of the configured credentials
    async fn get_caller_identity(&self) -> Result<CallerIdentity>;
}

// =============================================================================
// IAM
// =============================================================================

/// Identity and access management
#[async_trait]
pub trait Iam: Send + Sync {
    /// Create a role and return its ARN
    async fn create_role(&self, name: &str, trust_policy: &str) -> Result<String>;
    /// ARN of an existing role
    async fn get_role(&self, name: &str) -> Result<String>;
    /// Attach a managed policy
    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()>;
    /// Detach a managed policy
    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()>;
    /// Delete a role with no attached policies
    async fn delete_role(&self, name: &str) -> Result<()>;
}

// =============================================================================
// CloudFormation
// =============================================================================

/// Observed stack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDescription {
    /// Stack id
    pub id: String,
    /// Stack name
    pub name: String,
    /// Stack status (`CREATE_COMPLETE`, ...)
    pub status: String,
    /// Provider explanation of the status
    pub status_reason: String,
    /// Output key to value
    pub outputs: BTreeMap<String, String>,
}

/// One resource of a stack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackResource {
    /// Template logical id
    pub logical_id: String,
    /// Provider id
    pub physical_id: String,
    /// Resource type (`AWS::AutoScaling::AutoScalingGroup`, ...)
    pub resource_type: String,
}

/// Declarative stacks
#[async_trait]
pub trait CloudFormation: Send + Sync {
    /// Submit a stack and return its id
    async fn create_stack(&self, name: &str, template: &str) -> Result<String>;
    /// Observe a stack; not-found once deleted
    async fn describe_stack(&self, name: &str) -> Result<StackDescription>;
    /// Resources of a stack
    async fn list_stack_resources(&self, name: &str) -> Result<Vec<StackResource>>;
    /// Request stack deletion
    async fn delete_stack(&self, name: &str) -> Result<()>;
}

// =============================================================================
// EKS
// =============================================================================

/// Control-plane create request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterRequest {
    /// Cluster name
    pub name: String,
    /// Service role ARN
    pub role_arn: String,
    /// Subnets the control plane attaches to
    pub subnet_ids: Vec<String>,
    /// Control-plane security groups
    pub security_group_ids: Vec<String>,
    /// Kubernetes version
    pub version: String,
}

/// Observed control plane
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterDescription {
    /// Cluster name
    pub name: String,
    /// Cluster ARN
    pub arn: String,
    /// Status (`CREATING`, `ACTIVE`, ...)
    pub status: String,
    /// API server endpoint
    pub endpoint: String,
    /// Base64 CA data
    pub certificate_authority: String,
    /// Platform version
    pub platform_version: String,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
}

/// Managed control planes
#[async_trait]
pub trait Eks: Send + Sync {
    /// Request a control plane
    async fn create_cluster(&self, request: &ClusterRequest) -> Result<ClusterDescription>;
    /// Observe a control plane; not-found once deleted
    async fn describe_cluster(&self, name: &str) -> Result<ClusterDescription>;
    /// Request control-plane deletion
    async fn delete_cluster(&self, name: &str) -> Result<()>;
}

// =============================================================================
// EC2
// =============================================================================

/// Created key pair with its private material
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPairMaterial {
    /// Key name
    pub name: String,
    /// Provider fingerprint
    pub fingerprint: String,
    /// PEM private key
    pub private_key: String,
}

/// One security-group ingress permission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressPermission {
    /// IP protocol
    pub protocol: String,
    /// First port
    pub from_port: u16,
    /// Last port
    pub to_port: u16,
    /// Source CIDR
    pub cidr: String,
}

impl IngressPermission {
    /// TCP port open to the world
    pub fn tcp_anywhere(port: u16) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: port,
            to_port: port,
            cidr: "0.0.0.0/0".to_string(),
        }
    }
}

/// Observed instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceDescription {
    /// Instance id
    pub id: String,
    /// State name (`running`, ...)
    pub state: String,
    /// Instance type
    pub instance_type: String,
    /// Subnet id
    pub subnet_id: String,
    /// Public IPv4
    pub public_ip: String,
    /// Private IPv4
    pub private_ip: String,
    /// Public DNS name
    pub public_dns: String,
    /// Private DNS name
    pub private_dns: String,
}

/// Compute and networking
#[async_trait]
pub trait Ec2: Send + Sync {
    /// Create a key pair and return its private material
    async fn create_key_pair(&self, name: &str) -> Result<KeyPairMaterial>;
    /// Which of `names` exist
    async fn describe_key_pairs(&self, names: &[String]) -> Result<Vec<String>>;
    /// Delete a key pair
    async fn delete_key_pair(&self, name: &str) -> Result<()>;
    /// Create a security group and return its id
    async fn create_security_group(&self, name: &str, description: &str, vpc_id: &str) -> Result<String>;
    /// Authorise one ingress permission
    async fn authorize_ingress(&self, group_id: &str, permission: &IngressPermission) -> Result<()>;
    /// Revoke one ingress permission
    async fn revoke_ingress(&self, group_id: &str, permission: &IngressPermission) -> Result<()>;
    /// Delete a security group
    async fn delete_security_group(&self, group_id: &str) -> Result<()>;
    /// Describe instances by id
    async fn describe_instances(&self, ids: &[String]) -> Result<Vec<InstanceDescription>>;
}

// =============================================================================
// Auto Scaling
// =============================================================================

/// One member of an auto-scaling group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsgInstance {
    /// Instance id
    pub id: String,
    /// `Healthy` or `Unhealthy`
    pub health_status: String,
    /// `InService`, `Pending`, ...
    pub lifecycle_state: String,
}

/// Observed auto-scaling group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsgDescription {
    /// Group name
    pub name: String,
    /// Minimum size
    pub min_size: u32,
    /// Maximum size
    pub max_size: u32,
    /// Desired capacity
    pub desired_capacity: u32,
    /// Members
    pub instances: Vec<AsgInstance>,
}

/// Auto-scaling groups
#[async_trait]
pub trait AutoScaling: Send + Sync {
    /// Describe one group
    async fn describe_auto_scaling_group(&self, name: &str) -> Result<AsgDescription>;
}

// =============================================================================
// ELBv2
// =============================================================================

/// Application load balancer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadBalancer {
    /// ARN
    pub arn: String,
    /// Name
    pub name: String,
    /// Public DNS name
    pub dns_name: String,
    /// VPC id
    pub vpc_id: String,
}

/// Listener of a load balancer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listener {
    /// ARN
    pub arn: String,
    /// Owning load balancer
    pub load_balancer_arn: String,
}

/// Target group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetGroup {
    /// ARN
    pub arn: String,
    /// Name
    pub name: String,
    /// VPC id
    pub vpc_id: String,
    /// Load balancers routing to this group
    pub load_balancer_arns: Vec<String>,
}

/// Health of one target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetHealth {
    /// Target id
    pub target_id: String,
    /// `healthy`, `initial`, `unhealthy`, ...
    pub state: String,
}

/// Application load balancing
#[async_trait]
pub trait Elbv2: Send + Sync {
    /// Every load balancer in the region
    async fn describe_load_balancers(&self) -> Result<Vec<LoadBalancer>>;
    /// Listeners of one load balancer
    async fn describe_listeners(&self, load_balancer_arn: &str) -> Result<Vec<Listener>>;
    /// Delete a listener
    async fn delete_listener(&self, arn: &str) -> Result<()>;
    /// Delete a load balancer
    async fn delete_load_balancer(&self, arn: &str) -> Result<()>;
    /// Every target group in the region
    async fn describe_target_groups(&self) -> Result<Vec<TargetGroup>>;
    /// Health of the targets of one group
    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>>;
    /// Delete a target group
    async fn delete_target_group(&self, arn: &str) -> Result<()>;
}

// =============================================================================
// Object store
// =============================================================================

/// Buckets and objects
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create a bucket
    async fn create_bucket(&self, name: &str) -> Result<()>;
    /// Replace the bucket policy
    async fn put_bucket_policy(&self, name: &str, policy: &str) -> Result<()>;
    /// Delete a bucket and everything in it
    async fn delete_bucket(&self, name: &str) -> Result<()>;
    /// Upload a local file
    async fn put_object(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;
}

/// Every provider service the harness uses
#[derive(Clone)]
pub struct CloudClients {
    /// Security token service
    pub sts: Arc<dyn Sts>,
    /// Identity and access management
    pub iam: Arc<dyn Iam>,
    /// Declarative stacks
    pub cfn: Arc<dyn CloudFormation>,
    /// Managed control planes
    pub eks: Arc<dyn Eks>,
    /// Compute and networking
    pub ec2: Arc<dyn Ec2>,
    /// Auto-scaling groups
    pub asg: Arc<dyn AutoScaling>,
    /// Application load balancing
    pub elb: Arc<dyn Elbv2>,
    /// Buckets and objects
    pub s3: Arc<dyn ObjectStore>,
}

impl CloudClients {
    /// Route every service to one backend
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: Sts + Iam + CloudFormation + Eks + Ec2 + AutoScaling + Elbv2 + ObjectStore + 'static,
    {
        Self {
            sts: backend.clone(),
            iam: backend.clone(),
            cfn: backend.clone(),
            eks: backend.clone(),
            ec2: backend.clone(),
            asg: backend.clone(),
            elb: backend.clone(),
            s3: backend,
        }
    }
}

impl std::fmt::Debug for CloudClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClients").finish_non_exhaustive()
    }
}
