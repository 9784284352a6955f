//! Security group for the load-balancer controller
//!
//! The controller attaches this group to the load balancers it creates, so
//! deleting it races the controller's own cleanup. A dependency violation
//! is retried for a while and then left for a later teardown; the created
//! flag stays set in that case.

use async_trait::async_trait;
use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::{ErrorKind, Result};
use ekstest_config::{ClusterState, ResourceHandle};
use tracing::{info, warn};

use super::{tolerate_not_found, Resource, StewardContext};
use crate::api::{is_already_exists, IngressPermission};

/// Ports open to the world on the controller group
pub const CONTROLLER_PORTS: [u16; 2] = [80, 443];

/// Auxiliary security group in the cluster VPC
#[derive(Debug, Default, Clone, Copy)]
pub struct ControllerSecurityGroup;

#[async_trait]
impl Resource for ControllerSecurityGroup {
    fn name(&self) -> &'static str {
        "controller-security-group"
    }

    fn handle<'a>(&self, state: &'a ClusterState) -> &'a ResourceHandle {
        &state.addon.security_group
    }

    fn handle_mut<'a>(&self, state: &'a mut ClusterState) -> &'a mut ResourceHandle {
        &mut state.addon.security_group
    }

    fn settled_status(&self) -> &'static str {
        "AUTHORIZED"
    }

    async fn create(&self, ctx: &StewardContext) -> Result<String> {
        let state = ctx.store.state();
        let name = &state.addon.security_group.name;
        let id = ctx
            .cloud
            .ec2
            .create_security_group(
                name,
                "Load-balancer controller ingress",
                &state.network.vpc_id,
            )
            .await?;
        ctx.record(|s| s.addon.security_group.mark_created(&id, "CREATED"))?;
        info!(security_group = %name, id = %id, vpc = %state.network.vpc_id, "controller security group created");
        Ok(id)
    }

    async fn wait(&self, ctx: &StewardContext) -> Result<String> {
        let id = ctx.store.state().addon.security_group.id;
        for port in CONTROLLER_PORTS {
            match ctx
                .cloud
                .ec2
                .authorize_ingress(&id, &IngressPermission::tcp_anywhere(port))
                .await
            {
                Ok(()) => {}
                Err(e) if is_already_exists(&e) => {}
                Err(e) => return Err(e),
            }
        }
        ctx.record(|s| s.addon.security_group.observe("AUTHORIZED"))?;
        Ok(id)
    }

    async fn delete(&self, ctx: &StewardContext) -> Result<()> {
        let id = ctx.store.state().addon.security_group.id;
        for port in CONTROLLER_PORTS {
            tolerate_not_found(
                ctx.cloud
                    .ec2
                    .revoke_ingress(&id, &IngressPermission::tcp_anywhere(port))
                    .await,
            )?;
        }

        let spec = PollSpec::new(
            format!("delete-security-group/{}", id),
            ctx.timeouts.short_interval,
            ctx.timeouts.dependency_retry,
        );
        let outcome = poll(&spec, &ctx.cancel, || async {
            match ctx.cloud.ec2.delete_security_group(&id).await {
                Ok(()) => Ok(Attempt::Done(())),
                Err(e) if e.is_not_found() => Ok(Attempt::Done(())),
                Err(e) if e.is_dependency_violation() => Ok(Attempt::Retry(e.to_string())),
                Err(e) => Err(e),
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                ctx.record(|s| s.addon.security_group.mark_deleted("DELETED"))?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::Timeout => {
                warn!(security_group = %id, error = %e, "still in use, leaving it for a later teardown");
                ctx.record(|s| s.addon.security_group.fail(&e))?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
