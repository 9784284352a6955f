//! Provider backend over the `aws` command-line client
//!
//! Every call is `aws <service> <operation> ... --region <r> --output json`
//! through a [`CommandRunner`]. Failures are classified from the
//! `An error occurred (<Code>) when calling the <Op> operation: <message>`
//! line the client prints.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ekstest_common::exec::{CommandRunner, CommandSpec};
use ekstest_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::api::*;

/// Per-call budget for provider requests
const AWS_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Budget for object uploads
const AWS_UPLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// `aws` CLI backend
#[derive(Clone)]
pub struct AwsCli {
    runner: Arc<dyn CommandRunner>,
    region: String,
    binary: String,
}

impl std::fmt::Debug for AwsCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCli")
            .field("region", &self.region)
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

impl AwsCli {
    /// Backend for `region` using `aws` from `PATH`
    pub fn new(runner: Arc<dyn CommandRunner>, region: impl Into<String>) -> Self {
        Self {
            runner,
            region: region.into(),
            binary: "aws".to_string(),
        }
    }

    /// Use a specific `aws` binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn spec(&self, service: &str, operation: &str, args: Vec<String>) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .arg(service)
            .arg(operation)
            .args(args)
            .args(["--region", self.region.as_str(), "--output", "json"])
            .timeout(AWS_CALL_TIMEOUT)
    }

    async fn call_raw(
        &self,
        spec: CommandSpec,
        service: &str,
        resource: &str,
    ) -> Result<String> {
        let out = self.runner.run(spec.clone()).await?;
        if out.success() {
            return Ok(out.stdout);
        }
        let combined = out.combined();
        let (code, message) = parse_cli_error(&combined);
        debug!(command = %spec, code = %code, "provider call failed");
        Err(Error::from_provider(service, resource, code, message))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        resource: &str,
        args: Vec<String>,
    ) -> Result<T> {
        let stdout = self
            .call_raw(self.spec(service, operation, args), service, resource)
            .await?;
        let body = if stdout.trim().is_empty() { "{}" } else { stdout.as_str() };
        serde_json::from_str(body).map_err(|e| {
            Error::serialization(format!("{} {} reply: {}", service, operation, e))
        })
    }

    async fn call_unit(
        &self,
        service: &str,
        operation: &str,
        resource: &str,
        args: Vec<String>,
    ) -> Result<()> {
        self.call_raw(self.spec(service, operation, args), service, resource)
            .await
            .map(|_| ())
    }
}

/// Split `An error occurred (Code) when calling ...: message` into its parts
///
/// Output without that shape yields an empty code, which classifies as
/// transient.
pub fn parse_cli_error(output: &str) -> (String, String) {
    for line in output.lines() {
        let Some(rest) = line.split("An error occurred (").nth(1) else {
            continue;
        };
        let Some((code, tail)) = rest.split_once(')') else {
            continue;
        };
        let message = tail
            .split_once(": ")
            .map(|(_, m)| m)
            .unwrap_or(tail)
            .trim()
            .to_string();
        return (code.to_string(), message);
    }
    (String::new(), output.trim().to_string())
}

fn s(v: &str) -> String {
    v.to_string()
}

// =============================================================================
// Reply shapes
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentityReply {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    account: String,
    #[serde(default)]
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleReply {
    role: RoleBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleBody {
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackIdReply {
    stack_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StacksReply {
    #[serde(default)]
    stacks: Vec<StackBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackBody {
    #[serde(default)]
    stack_id: String,
    #[serde(default)]
    stack_name: String,
    #[serde(default)]
    stack_status: String,
    #[serde(default)]
    stack_status_reason: String,
    #[serde(default)]
    outputs: Vec<StackOutput>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackOutput {
    output_key: String,
    #[serde(default)]
    output_value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackResourcesReply {
    #[serde(default)]
    stack_resource_summaries: Vec<StackResourceBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackResourceBody {
    logical_resource_id: String,
    #[serde(default)]
    physical_resource_id: String,
    resource_type: String,
}

#[derive(Deserialize)]
struct ClusterReply {
    cluster: ClusterBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterBody {
    name: String,
    #[serde(default)]
    arn: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    certificate_authority: Option<CaBody>,
    #[serde(default)]
    platform_version: Option<String>,
    #[serde(default)]
    created_at: Option<Value>,
}

#[derive(Deserialize)]
struct CaBody {
    #[serde(default)]
    data: Option<String>,
}

impl From<ClusterBody> for ClusterDescription {
    fn from(c: ClusterBody) -> Self {
        Self {
            name: c.name,
            arn: c.arn,
            status: c.status,
            endpoint: c.endpoint.unwrap_or_default(),
            certificate_authority: c
                .certificate_authority
                .and_then(|ca| ca.data)
                .unwrap_or_default(),
            platform_version: c.platform_version.unwrap_or_default(),
            created_at: c.created_at.and_then(parse_timestamp),
        }
    }
}

/// The CLI prints timestamps either as RFC 3339 or as epoch seconds
fn parse_timestamp(v: Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_f64()
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyPairReply {
    key_name: String,
    #[serde(default)]
    key_fingerprint: String,
    key_material: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyPairsReply {
    #[serde(default)]
    key_pairs: Vec<KeyPairBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyPairBody {
    key_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupIdReply {
    group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReservationsReply {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<InstanceBody>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InstanceBody {
    instance_id: String,
    instance_type: String,
    subnet_id: String,
    public_ip_address: String,
    private_ip_address: String,
    public_dns_name: String,
    private_dns_name: String,
    state: InstanceStateBody,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InstanceStateBody {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AsgReply {
    #[serde(default)]
    auto_scaling_groups: Vec<AsgBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AsgBody {
    auto_scaling_group_name: String,
    min_size: u32,
    max_size: u32,
    #[serde(default)]
    desired_capacity: u32,
    #[serde(default)]
    instances: Vec<AsgInstanceBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AsgInstanceBody {
    instance_id: String,
    #[serde(default)]
    health_status: String,
    #[serde(default)]
    lifecycle_state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadBalancersReply {
    #[serde(default)]
    load_balancers: Vec<LoadBalancerBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadBalancerBody {
    load_balancer_arn: String,
    load_balancer_name: String,
    #[serde(default, rename = "DNSName")]
    dns_name: String,
    #[serde(default)]
    vpc_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListenersReply {
    #[serde(default)]
    listeners: Vec<ListenerBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListenerBody {
    listener_arn: String,
    #[serde(default)]
    load_balancer_arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetGroupsReply {
    #[serde(default)]
    target_groups: Vec<TargetGroupBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetGroupBody {
    target_group_arn: String,
    #[serde(default)]
    target_group_name: String,
    #[serde(default)]
    vpc_id: String,
    #[serde(default)]
    load_balancer_arns: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetHealthReply {
    #[serde(default)]
    target_health_descriptions: Vec<TargetHealthBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetHealthBody {
    target: TargetBody,
    target_health: TargetStateBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetBody {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetStateBody {
    #[serde(default)]
    state: String,
}

fn ip_permissions(p: &IngressPermission) -> String {
    format!(
        "IpProtocol={},FromPort={},ToPort={},IpRanges=[{{CidrIp={}}}]",
        p.protocol, p.from_port, p.to_port, p.cidr
    )
}

// =============================================================================
// Service implementations
// =============================================================================

#[async_trait]
impl Sts for AwsCli {
    async fn get_caller_identity(&self) -> Result<CallerIdentity> {
        let r: CallerIdentityReply = self
            .call("sts", "get-caller-identity", "caller", Vec::new())
            .await?;
        Ok(CallerIdentity {
            account: r.account,
            arn: r.arn,
            user_id: r.user_id,
        })
    }
}

#[async_trait]
impl Iam for AwsCli {
    async fn create_role(&self, name: &str, trust_policy: &str) -> Result<String> {
        let r: RoleReply = self
            .call(
                "iam",
                "create-role",
                name,
                vec![
                    s("--role-name"),
                    s(name),
                    s("--assume-role-policy-document"),
                    s(trust_policy),
                ],
            )
            .await?;
        Ok(r.role.arn)
    }

    async fn get_role(&self, name: &str) -> Result<String> {
        let r: RoleReply = self
            .call("iam", "get-role", name, vec![s("--role-name"), s(name)])
            .await?;
        Ok(r.role.arn)
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()> {
        self.call_unit(
            "iam",
            "attach-role-policy",
            role,
            vec![s("--role-name"), s(role), s("--policy-arn"), s(policy_arn)],
        )
        .await
    }

    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()> {
        self.call_unit(
            "iam",
            "detach-role-policy",
            role,
            vec![s("--role-name"), s(role), s("--policy-arn"), s(policy_arn)],
        )
        .await
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        self.call_unit("iam", "delete-role", name, vec![s("--role-name"), s(name)])
            .await
    }
}

#[async_trait]
impl CloudFormation for AwsCli {
    async fn create_stack(&self, name: &str, template: &str) -> Result<String> {
        let r: StackIdReply = self
            .call(
                "cloudformation",
                "create-stack",
                name,
                vec![
                    s("--stack-name"),
                    s(name),
                    s("--template-body"),
                    s(template),
                    s("--capabilities"),
                    s("CAPABILITY_IAM"),
                    s("--tags"),
                    format!("Key=Name,Value={}", name),
                ],
            )
            .await?;
        Ok(r.stack_id)
    }

    async fn describe_stack(&self, name: &str) -> Result<StackDescription> {
        let r: StacksReply = self
            .call(
                "cloudformation",
                "describe-stacks",
                name,
                vec![s("--stack-name"), s(name)],
            )
            .await?;
        let stack = r
            .stacks
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(name, "describe-stacks returned no stacks"))?;
        Ok(StackDescription {
            id: stack.stack_id,
            name: stack.stack_name,
            status: stack.stack_status,
            status_reason: stack.stack_status_reason,
            outputs: stack
                .outputs
                .into_iter()
                .map(|o| (o.output_key, o.output_value))
                .collect::<BTreeMap<_, _>>(),
        })
    }

    async fn list_stack_resources(&self, name: &str) -> Result<Vec<StackResource>> {
        let r: StackResourcesReply = self
            .call(
                "cloudformation",
                "list-stack-resources",
                name,
                vec![s("--stack-name"), s(name)],
            )
            .await?;
        Ok(r.stack_resource_summaries
            .into_iter()
            .map(|r| StackResource {
                logical_id: r.logical_resource_id,
                physical_id: r.physical_resource_id,
                resource_type: r.resource_type,
            })
            .collect())
    }

    async fn delete_stack(&self, name: &str) -> Result<()> {
        self.call_unit(
            "cloudformation",
            "delete-stack",
            name,
            vec![s("--stack-name"), s(name)],
        )
        .await
    }
}

#[async_trait]
impl Eks for AwsCli {
    async fn create_cluster(&self, request: &ClusterRequest) -> Result<ClusterDescription> {
        let vpc_config = format!(
            "subnetIds={},securityGroupIds={}",
            request.subnet_ids.join(","),
            request.security_group_ids.join(",")
        );
        let r: ClusterReply = self
            .call(
                "eks",
                "create-cluster",
                &request.name,
                vec![
                    s("--name"),
                    request.name.clone(),
                    s("--role-arn"),
                    request.role_arn.clone(),
                    s("--resources-vpc-config"),
                    vpc_config,
                    s("--kubernetes-version"),
                    request.version.clone(),
                ],
            )
            .await?;
        Ok(r.cluster.into())
    }

    async fn describe_cluster(&self, name: &str) -> Result<ClusterDescription> {
        let r: ClusterReply = self
            .call("eks", "describe-cluster", name, vec![s("--name"), s(name)])
            .await?;
        Ok(r.cluster.into())
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        self.call_unit("eks", "delete-cluster", name, vec![s("--name"), s(name)])
            .await
    }
}

#[async_trait]
impl Ec2 for AwsCli {
    async fn create_key_pair(&self, name: &str) -> Result<KeyPairMaterial> {
        let r: KeyPairReply = self
            .call("ec2", "create-key-pair", name, vec![s("--key-name"), s(name)])
            .await?;
        Ok(KeyPairMaterial {
            name: r.key_name,
            fingerprint: r.key_fingerprint,
            private_key: r.key_material,
        })
    }

    async fn describe_key_pairs(&self, names: &[String]) -> Result<Vec<String>> {
        let mut args = vec![s("--key-names")];
        args.extend(names.iter().cloned());
        match self
            .call::<KeyPairsReply>("ec2", "describe-key-pairs", "key-pair", args)
            .await
        {
            Ok(r) => Ok(r.key_pairs.into_iter().map(|k| k.key_name).collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn delete_key_pair(&self, name: &str) -> Result<()> {
        self.call_unit("ec2", "delete-key-pair", name, vec![s("--key-name"), s(name)])
            .await
    }

    async fn create_security_group(&self, name: &str, description: &str, vpc_id: &str) -> Result<String> {
        let r: GroupIdReply = self
            .call(
                "ec2",
                "create-security-group",
                name,
                vec![
                    s("--group-name"),
                    s(name),
                    s("--description"),
                    s(description),
                    s("--vpc-id"),
                    s(vpc_id),
                ],
            )
            .await?;
        Ok(r.group_id)
    }

    async fn authorize_ingress(&self, group_id: &str, permission: &IngressPermission) -> Result<()> {
        self.call_unit(
            "ec2",
            "authorize-security-group-ingress",
            group_id,
            vec![s("--group-id"), s(group_id), s("--ip-permissions"), ip_permissions(permission)],
        )
        .await
    }

    async fn revoke_ingress(&self, group_id: &str, permission: &IngressPermission) -> Result<()> {
        self.call_unit(
            "ec2",
            "revoke-security-group-ingress",
            group_id,
            vec![s("--group-id"), s(group_id), s("--ip-permissions"), ip_permissions(permission)],
        )
        .await
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        self.call_unit("ec2", "delete-security-group", group_id, vec![s("--group-id"), s(group_id)])
            .await
    }

    async fn describe_instances(&self, ids: &[String]) -> Result<Vec<InstanceDescription>> {
        let mut args = vec![s("--instance-ids")];
        args.extend(ids.iter().cloned());
        let r: ReservationsReply = self.call("ec2", "describe-instances", "instances", args).await?;
        Ok(r.reservations
            .into_iter()
            .flat_map(|res| res.instances)
            .map(|i| InstanceDescription {
                id: i.instance_id,
                state: i.state.name,
                instance_type: i.instance_type,
                subnet_id: i.subnet_id,
                public_ip: i.public_ip_address,
                private_ip: i.private_ip_address,
                public_dns: i.public_dns_name,
                private_dns: i.private_dns_name,
            })
            .collect())
    }
}

#[async_trait]
impl AutoScaling for AwsCli {
    async fn describe_auto_scaling_group(&self, name: &str) -> Result<AsgDescription> {
        let r: AsgReply = self
            .call(
                "autoscaling",
                "describe-auto-scaling-groups",
                name,
                vec![s("--auto-scaling-group-names"), s(name)],
            )
            .await?;
        let group = r
            .auto_scaling_groups
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(name, "auto-scaling group not found"))?;
        Ok(AsgDescription {
            name: group.auto_scaling_group_name,
            min_size: group.min_size,
            max_size: group.max_size,
            desired_capacity: group.desired_capacity,
            instances: group
                .instances
                .into_iter()
                .map(|i| AsgInstance {
                    id: i.instance_id,
                    health_status: i.health_status,
                    lifecycle_state: i.lifecycle_state,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl Elbv2 for AwsCli {
    async fn describe_load_balancers(&self) -> Result<Vec<LoadBalancer>> {
        let r: LoadBalancersReply = self
            .call("elbv2", "describe-load-balancers", "load-balancers", Vec::new())
            .await?;
        Ok(r.load_balancers
            .into_iter()
            .map(|lb| LoadBalancer {
                arn: lb.load_balancer_arn,
                name: lb.load_balancer_name,
                dns_name: lb.dns_name,
                vpc_id: lb.vpc_id,
            })
            .collect())
    }

    async fn describe_listeners(&self, load_balancer_arn: &str) -> Result<Vec<Listener>> {
        let r: ListenersReply = self
            .call(
                "elbv2",
                "describe-listeners",
                load_balancer_arn,
                vec![s("--load-balancer-arn"), s(load_balancer_arn)],
            )
            .await?;
        Ok(r.listeners
            .into_iter()
            .map(|l| Listener {
                arn: l.listener_arn,
                load_balancer_arn: l.load_balancer_arn,
            })
            .collect())
    }

    async fn delete_listener(&self, arn: &str) -> Result<()> {
        self.call_unit("elbv2", "delete-listener", arn, vec![s("--listener-arn"), s(arn)])
            .await
    }

    async fn delete_load_balancer(&self, arn: &str) -> Result<()> {
        self.call_unit(
            "elbv2",
            "delete-load-balancer",
            arn,
            vec![s("--load-balancer-arn"), s(arn)],
        )
        .await
    }

    async fn describe_target_groups(&self) -> Result<Vec<TargetGroup>> {
        let r: TargetGroupsReply = self
            .call("elbv2", "describe-target-groups", "target-groups", Vec::new())
            .await?;
        Ok(r.target_groups
            .into_iter()
            .map(|tg| TargetGroup {
                arn: tg.target_group_arn,
                name: tg.target_group_name,
                vpc_id: tg.vpc_id,
                load_balancer_arns: tg.load_balancer_arns,
            })
            .collect())
    }

    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>> {
        let r: TargetHealthReply = self
            .call(
                "elbv2",
                "describe-target-health",
                target_group_arn,
                vec![s("--target-group-arn"), s(target_group_arn)],
            )
            .await?;
        Ok(r.target_health_descriptions
            .into_iter()
            .map(|t| TargetHealth {
                target_id: t.target.id,
                state: t.target_health.state,
            })
            .collect())
    }

    async fn delete_target_group(&self, arn: &str) -> Result<()> {
        self.call_unit(
            "elbv2",
            "delete-target-group",
            arn,
            vec![s("--target-group-arn"), s(arn)],
        )
        .await
    }
}

#[async_trait]
impl ObjectStore for AwsCli {
    async fn create_bucket(&self, name: &str) -> Result<()> {
        let mut args = vec![s("--bucket"), s(name)];
        if self.region != "us-east-1" {
            args.push(s("--create-bucket-configuration"));
            args.push(format!("LocationConstraint={}", self.region));
        }
        self.call_unit("s3api", "create-bucket", name, args).await
    }

    async fn put_bucket_policy(&self, name: &str, policy: &str) -> Result<()> {
        self.call_unit(
            "s3api",
            "put-bucket-policy",
            name,
            vec![s("--bucket"), s(name), s("--policy"), s(policy)],
        )
        .await
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.call_unit("s3", "rb", name, vec![format!("s3://{}", name), s("--force")])
            .await
    }

    async fn put_object(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let spec = self
            .spec(
                "s3",
                "cp",
                vec![path.display().to_string(), format!("s3://{}/{}", bucket, key)],
            )
            .timeout(AWS_UPLOAD_TIMEOUT);
        self.call_raw(spec, "s3", bucket).await.map(|_| ())
    }
}
