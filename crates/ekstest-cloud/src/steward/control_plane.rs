//! Managed control plane
//!
//! Creation takes a long time and the provider reports nothing useful for
//! the first few minutes, so the wait starts with a fixed, cancellable
//! pre-wait before polling every 30 seconds for up to 20 minutes. Deletion
//! mirrors that with a shorter pre-wait.

use async_trait::async_trait;
use ekstest_common::poll::{self, poll, Attempt, PollSpec};
use ekstest_common::{Error, Result};
use ekstest_config::{
    ClusterState, ResourceHandle, STATUS_ACTIVE, STATUS_CREATING, STATUS_DELETE_COMPLETE,
    STATUS_DELETING, STATUS_FAILED,
};
use tracing::info;

use super::{Resource, StewardContext};
use crate::api::{is_already_exists, ClusterRequest};

/// The cluster itself
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlPlane;

#[async_trait]
impl Resource for ControlPlane {
    fn name(&self) -> &'static str {
        "control-plane"
    }

    fn handle<'a>(&self, state: &'a ClusterState) -> &'a ResourceHandle {
        &state.control_plane
    }

    fn handle_mut<'a>(&self, state: &'a mut ClusterState) -> &'a mut ResourceHandle {
        &mut state.control_plane
    }

    fn settled_status(&self) -> &'static str {
        STATUS_ACTIVE
    }

    async fn create(&self, ctx: &StewardContext) -> Result<String> {
        let state = ctx.store.state();
        if state.network.subnet_ids.is_empty() {
            return Err(Error::invalid_config(
                "subnet-ids",
                "control plane needs at least one subnet",
            ));
        }
        if state.role.handle.id.is_empty() {
            return Err(Error::invalid_config(
                "role-arn",
                "control plane needs the service role ARN",
            ));
        }

        let request = ClusterRequest {
            name: state.control_plane.name.clone(),
            role_arn: state.role.handle.id.clone(),
            subnet_ids: state.network.subnet_ids.clone(),
            security_group_ids: vec![state.network.security_group_id.clone()],
            version: ctx.store.config().kubernetes_version.clone(),
        };
        let desc = match ctx.cloud.eks.create_cluster(&request).await {
            Ok(desc) => desc,
            Err(e) if is_already_exists(&e) => {
                info!(cluster = %request.name, "control plane already exists, adopting it");
                ctx.cloud.eks.describe_cluster(&request.name).await?
            }
            Err(e) => return Err(e),
        };

        ctx.record(|s| {
            s.control_plane.mark_created(&desc.arn, &desc.status);
            s.status = STATUS_CREATING.to_string();
            s.created_at = desc.created_at;
        })?;
        info!(cluster = %request.name, version = %request.version, "control plane requested");
        Ok(desc.arn)
    }

    async fn wait(&self, ctx: &StewardContext) -> Result<String> {
        let name = ctx.store.state().control_plane.name;
        poll::sleep(
            "control-plane-pre-wait",
            ctx.timeouts.control_plane_pre_wait,
            &ctx.cancel,
        )
        .await?;

        let spec = PollSpec::new(
            format!("wait-control-plane/{}", name),
            ctx.timeouts.control_plane_interval,
            ctx.timeouts.control_plane,
        );
        let desc = poll(&spec, &ctx.cancel, || async {
            let desc = ctx.cloud.eks.describe_cluster(&name).await?;
            ctx.record(|s| {
                s.control_plane.observe(&desc.status);
                s.status = desc.status.clone();
            })?;
            match desc.status.as_str() {
                STATUS_ACTIVE => Ok(Attempt::Done(desc)),
                STATUS_FAILED => Err(Error::cloud_terminal(
                    &name,
                    &desc.status,
                    "control plane creation failed",
                )),
                other => Ok(Attempt::Retry(format!("control plane status {}", other))),
            }
        })
        .await?;

        ctx.record(|s| {
            s.control_plane.mark_created(&desc.arn, &desc.status);
            s.status = desc.status.clone();
            s.endpoint = desc.endpoint.clone();
            s.certificate_authority = desc.certificate_authority.clone();
            s.platform_version = desc.platform_version.clone();
            if desc.created_at.is_some() {
                s.created_at = desc.created_at;
            }
        })?;
        info!(
            cluster = %name,
            endpoint = %desc.endpoint,
            platform_version = %desc.platform_version,
            "control plane active"
        );
        Ok(desc.arn)
    }

    async fn delete(&self, ctx: &StewardContext) -> Result<()> {
        let name = ctx.store.state().control_plane.name;
        match ctx.cloud.eks.delete_cluster(&name).await {
            Ok(()) => {
                ctx.record(|s| {
                    s.control_plane.observe(STATUS_DELETING);
                    s.status = STATUS_DELETING.to_string();
                })?;
                poll::sleep(
                    "control-plane-delete-pre-wait",
                    ctx.timeouts.cluster_delete_pre_wait,
                    &ctx.cancel,
                )
                .await?;

                let spec = PollSpec::new(
                    format!("wait-control-plane-deleted/{}", name),
                    ctx.timeouts.control_plane_interval,
                    ctx.timeouts.cluster_delete,
                );
                poll(&spec, &ctx.cancel, || async {
                    match ctx.cloud.eks.describe_cluster(&name).await {
                        Err(e) if e.is_not_found() => Ok(Attempt::Done(())),
                        Err(e) => Err(e),
                        Ok(desc) => Ok(Attempt::Retry(format!("control plane status {}", desc.status))),
                    }
                })
                .await?;
            }
            Err(e) if e.is_not_found() => {
                info!(cluster = %name, "control plane already gone");
            }
            Err(e) => return Err(e),
        }
        ctx.record(|s| {
            s.control_plane.mark_deleted(STATUS_DELETE_COMPLETE);
            s.status = STATUS_DELETE_COMPLETE.to_string();
        })?;
        Ok(())
    }
}
