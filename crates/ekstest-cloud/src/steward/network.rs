//! Virtual network stack

use async_trait::async_trait;
use ekstest_common::{Error, Result};
use ekstest_config::{ClusterState, ResourceHandle};
use tracing::info;

use super::{delete_stack, wait_stack_created, Resource, StewardContext};
use crate::api::is_already_exists;
use crate::templates::{network_outputs, render_vpc};

/// VPC, subnets, routing and the control-plane security group
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkStack;

#[async_trait]
impl Resource for NetworkStack {
    fn name(&self) -> &'static str {
        "network-stack"
    }

    fn handle<'a>(&self, state: &'a ClusterState) -> &'a ResourceHandle {
        &state.network.handle
    }

    fn handle_mut<'a>(&self, state: &'a mut ClusterState) -> &'a mut ResourceHandle {
        &mut state.network.handle
    }

    fn settled_status(&self) -> &'static str {
        "CREATE_COMPLETE"
    }

    async fn create(&self, ctx: &StewardContext) -> Result<String> {
        let name = ctx.store.state().network.handle.name;
        let template = render_vpc(ctx.store.cluster_name(), ctx.store.config().enable_ha)?;

        let id = match ctx.cloud.cfn.create_stack(&name, &template).await {
            Ok(id) => id,
            Err(e) if is_already_exists(&e) => ctx.cloud.cfn.describe_stack(&name).await?.id,
            Err(e) => return Err(e),
        };
        ctx.record(|s| s.network.handle.mark_created(&id, "CREATE_IN_PROGRESS"))?;
        info!(stack = %name, id = %id, "network stack submitted");
        Ok(id)
    }

    async fn wait(&self, ctx: &StewardContext) -> Result<String> {
        let name = ctx.store.state().network.handle.name;
        let desc = wait_stack_created(ctx, self, &name).await?;

        let output = |key: &str| {
            desc.outputs.get(key).cloned().ok_or_else(|| {
                Error::cloud_terminal(&name, &desc.status, format!("stack has no output {}", key))
            })
        };
        let vpc_id = output(network_outputs::VPC_ID)?;
        let subnet_ids: Vec<String> = output(network_outputs::SUBNET_IDS)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let security_group_id = output(network_outputs::SECURITY_GROUPS)?;

        info!(vpc = %vpc_id, subnets = ?subnet_ids, security_group = %security_group_id, "network ready");
        ctx.record(|s| {
            s.network.vpc_id = vpc_id;
            s.network.subnet_ids = subnet_ids;
            s.network.security_group_id = security_group_id;
            s.network.handle.mark_created(&desc.id, &desc.status);
        })?;
        Ok(desc.id)
    }

    async fn delete(&self, ctx: &StewardContext) -> Result<()> {
        let name = ctx.store.state().network.handle.name;
        delete_stack(ctx, &name).await?;
        ctx.record(|s| s.network.handle.mark_deleted("DELETE_COMPLETE"))?;
        Ok(())
    }
}
