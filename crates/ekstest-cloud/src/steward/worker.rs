//! Worker node group stack
//!
//! After the stack completes, the auto-scaling group inside it is checked
//! against the configured size, every member must be healthy, and every
//! instance must be running. The instances are then recorded in the worker
//! map that log collection walks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::{Error, Result};
use ekstest_config::{ClusterState, ResourceHandle, WorkerNode};
use tracing::{debug, info};

use super::{delete_stack, wait_stack_created, Resource, StewardContext};
use crate::api::{is_already_exists, AsgDescription, IngressPermission};
use crate::templates::{render_worker, worker_outputs, WorkerParams, ASG_RESOURCE_TYPE};

/// Instances described per request
const DESCRIBE_BATCH: usize = 10;

/// Auto-scaling worker node group with its instance role and security group
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStack;

impl WorkerStack {
    fn params(ctx: &StewardContext, state: &ClusterState) -> WorkerParams {
        let cfg = ctx.store.config();
        WorkerParams {
            cluster_name: cfg.cluster_name.clone(),
            key_name: state.key_pair.handle.name.clone(),
            ami: cfg.worker_node_ami.clone(),
            kubernetes_version: cfg.kubernetes_version.clone(),
            instance_type: cfg.worker_node_instance_type.clone(),
            asg_min: cfg.worker_node_asg_min,
            asg_max: cfg.worker_node_asg_max,
            volume_size_gb: cfg.worker_node_volume_size_gb,
            vpc_id: state.network.vpc_id.clone(),
            subnet_ids: state.network.subnet_ids.clone(),
            control_plane_sg: state.network.security_group_id.clone(),
            enable_ssh: cfg.enable_worker_node_ssh,
            enable_privileged: cfg.enable_worker_node_privileged_port_access,
        }
    }

    async fn authorize_ssh(ctx: &StewardContext, group_id: &str) -> Result<()> {
        match ctx
            .cloud
            .ec2
            .authorize_ingress(group_id, &IngressPermission::tcp_anywhere(22))
            .await
        {
            Ok(()) => info!(security_group = %group_id, "authorized SSH ingress"),
            Err(e) if is_already_exists(&e) => {
                debug!(security_group = %group_id, "SSH ingress already authorized")
            }
            Err(e) => return Err(e),
        }
        ctx.record(|s| s.worker.ssh_authorized = true)
    }

    async fn find_asg(ctx: &StewardContext, stack: &str) -> Result<String> {
        ctx.cloud
            .cfn
            .list_stack_resources(stack)
            .await?
            .into_iter()
            .find(|r| r.resource_type == ASG_RESOURCE_TYPE)
            .map(|r| r.physical_id)
            .ok_or_else(|| {
                Error::cloud_terminal(stack, "CREATE_COMPLETE", "stack has no auto-scaling group")
            })
    }

    /// Wait for the group to report every member healthy; sizes must match
    async fn verify_asg(ctx: &StewardContext, asg_name: &str) -> Result<AsgDescription> {
        let cfg = ctx.store.config();
        let (min, max) = (cfg.worker_node_asg_min, cfg.worker_node_asg_max);
        let spec = PollSpec::new(
            format!("wait-asg-healthy/{}", asg_name),
            ctx.timeouts.stack_interval,
            ctx.timeouts.stack,
        );
        poll(&spec, &ctx.cancel, || async {
            let asg = ctx.cloud.asg.describe_auto_scaling_group(asg_name).await?;
            if asg.min_size != min || asg.max_size != max {
                return Err(Error::cloud_terminal(
                    asg_name,
                    "SIZE_MISMATCH",
                    format!(
                        "expected min {} max {}, got min {} max {}",
                        min, max, asg.min_size, asg.max_size
                    ),
                ));
            }
            let healthy = asg
                .instances
                .iter()
                .filter(|i| i.health_status == "Healthy")
                .count();
            if asg.instances.len() >= min as usize && healthy == asg.instances.len() {
                Ok(Attempt::Done(asg))
            } else {
                Ok(Attempt::Retry(format!(
                    "{} of {} instances healthy",
                    healthy,
                    asg.instances.len()
                )))
            }
        })
        .await
    }

    /// Wait until every instance is running and return the worker map
    async fn describe_workers(
        ctx: &StewardContext,
        ids: &[String],
    ) -> Result<BTreeMap<String, WorkerNode>> {
        let spec = PollSpec::new(
            "wait-instances-running",
            ctx.timeouts.stack_interval,
            ctx.timeouts.stack,
        );
        poll(&spec, &ctx.cancel, || async {
            let mut nodes = BTreeMap::new();
            for batch in ids.chunks(DESCRIBE_BATCH) {
                for inst in ctx.cloud.ec2.describe_instances(batch).await? {
                    nodes.insert(
                        inst.id.clone(),
                        WorkerNode {
                            public_ip: inst.public_ip,
                            private_ip: inst.private_ip,
                            public_dns: inst.public_dns,
                            private_dns: inst.private_dns,
                            instance_type: inst.instance_type,
                            subnet_id: inst.subnet_id,
                            status: inst.state,
                            ready: false,
                        },
                    );
                }
            }
            let running = nodes.values().filter(|n| n.status == "running").count();
            if running == ids.len() {
                Ok(Attempt::Done(nodes))
            } else {
                Ok(Attempt::Retry(format!("{} of {} instances running", running, ids.len())))
            }
        })
        .await
    }
}

#[async_trait]
impl Resource for WorkerStack {
    fn name(&self) -> &'static str {
        "worker-stack"
    }

    fn handle<'a>(&self, state: &'a ClusterState) -> &'a ResourceHandle {
        &state.worker.stack
    }

    fn handle_mut<'a>(&self, state: &'a mut ClusterState) -> &'a mut ResourceHandle {
        &mut state.worker.stack
    }

    fn settled_status(&self) -> &'static str {
        "CREATE_COMPLETE"
    }

    async fn create(&self, ctx: &StewardContext) -> Result<String> {
        let state = ctx.store.state();
        let template = render_worker(&Self::params(ctx, &state))?;
        let name = &state.worker.stack.name;

        let id = match ctx.cloud.cfn.create_stack(name, &template).await {
            Ok(id) => id,
            Err(e) if is_already_exists(&e) => ctx.cloud.cfn.describe_stack(name).await?.id,
            Err(e) => return Err(e),
        };
        ctx.record(|s| s.worker.stack.mark_created(&id, "CREATE_IN_PROGRESS"))?;
        info!(stack = %name, asg_max = ctx.store.config().worker_node_asg_max, "worker stack submitted");
        Ok(id)
    }

    async fn wait(&self, ctx: &StewardContext) -> Result<String> {
        let name = ctx.store.state().worker.stack.name;
        let desc = wait_stack_created(ctx, self, &name).await?;

        let output = |key: &str| {
            desc.outputs.get(key).cloned().ok_or_else(|| {
                Error::cloud_terminal(&name, &desc.status, format!("stack has no output {}", key))
            })
        };
        let role_arn = output(worker_outputs::NODE_INSTANCE_ROLE)?;
        let group_id = output(worker_outputs::NODE_SECURITY_GROUP)?;
        ctx.record(|s| {
            s.worker.instance_role_arn = role_arn.clone();
            s.worker.security_group_id = group_id.clone();
        })?;

        if ctx.store.config().enable_worker_node_ssh {
            Self::authorize_ssh(ctx, &group_id).await?;
        }

        let asg_name = Self::find_asg(ctx, &name).await?;
        ctx.record(|s| s.worker.asg_name = asg_name.clone())?;
        let asg = Self::verify_asg(ctx, &asg_name).await?;
        let ids: Vec<String> = asg.instances.into_iter().map(|i| i.id).collect();
        let nodes = Self::describe_workers(ctx, &ids).await?;

        info!(asg = %asg_name, workers = nodes.len(), role = %role_arn, "worker node group ready");
        ctx.record(|s| {
            s.worker.nodes = nodes;
            s.worker.stack.mark_created(&desc.id, &desc.status);
        })?;
        Ok(desc.id)
    }

    async fn delete(&self, ctx: &StewardContext) -> Result<()> {
        let name = ctx.store.state().worker.stack.name;
        delete_stack(ctx, &name).await?;
        ctx.record(|s| {
            s.worker.stack.mark_deleted("DELETE_COMPLETE");
            s.worker.ssh_authorized = false;
            s.worker.nodes.clear();
        })?;
        Ok(())
    }
}
