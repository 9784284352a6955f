//! Control-plane service role

use async_trait::async_trait;
use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::Result;
use ekstest_config::{ClusterState, ResourceHandle};
use tracing::info;

use super::{tolerate_not_found, Resource, StewardContext};
use crate::api::is_already_exists;

/// Trust policy letting the managed control plane assume the role
pub const TRUST_POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Principal": {
        "Service": "eks.amazonaws.com"
      },
      "Action": "sts:AssumeRole"
    }
  ]
}"#;

/// IAM role the control plane runs under, with its managed policies
#[derive(Debug, Default, Clone, Copy)]
pub struct ServiceRole;

#[async_trait]
impl Resource for ServiceRole {
    fn name(&self) -> &'static str {
        "service-role"
    }

    fn handle<'a>(&self, state: &'a ClusterState) -> &'a ResourceHandle {
        &state.role.handle
    }

    fn handle_mut<'a>(&self, state: &'a mut ClusterState) -> &'a mut ResourceHandle {
        &mut state.role.handle
    }

    fn settled_status(&self) -> &'static str {
        "ACTIVE"
    }

    async fn create(&self, ctx: &StewardContext) -> Result<String> {
        let state = ctx.store.state();
        let name = &state.role.handle.name;

        let arn = match ctx.cloud.iam.create_role(name, TRUST_POLICY).await {
            Ok(arn) => arn,
            Err(e) if is_already_exists(&e) => {
                info!(role = %name, "role already exists, adopting it");
                ctx.cloud.iam.get_role(name).await?
            }
            Err(e) => return Err(e),
        };
        ctx.record(|s| s.role.handle.mark_created(&arn, "CREATED"))?;

        for policy in &state.role.policies {
            ctx.cloud.iam.attach_role_policy(name, policy).await?;
            ctx.record(|s| s.role.policies_attached = true)?;
            info!(role = %name, policy = %policy, "attached policy");
        }
        Ok(arn)
    }

    async fn wait(&self, ctx: &StewardContext) -> Result<String> {
        let name = ctx.store.state().role.handle.name;
        let spec = PollSpec::new(
            format!("wait-role/{}", name),
            ctx.timeouts.short_interval,
            ctx.timeouts.key_pair,
        );
        let arn = poll(&spec, &ctx.cancel, || async {
            ctx.cloud.iam.get_role(&name).await.map(Attempt::Done)
        })
        .await?;
        ctx.record(|s| s.role.handle.mark_created(&arn, "ACTIVE"))?;
        Ok(arn)
    }

    async fn delete(&self, ctx: &StewardContext) -> Result<()> {
        let state = ctx.store.state();
        let name = &state.role.handle.name;

        if state.role.policies_attached {
            for policy in &state.role.policies {
                tolerate_not_found(ctx.cloud.iam.detach_role_policy(name, policy).await)?;
                info!(role = %name, policy = %policy, "detached policy");
            }
            ctx.record(|s| s.role.policies_attached = false)?;
        }

        tolerate_not_found(ctx.cloud.iam.delete_role(name).await)?;
        ctx.record(|s| s.role.handle.mark_deleted("DELETED"))?;
        Ok(())
    }
}
