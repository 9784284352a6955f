//! Startup reconciliation
//!
//! Read-only describes of everything the record names. The provider's
//! answer only ever adds to the record: a resource that turns up is marked
//! created with its outputs, while a not-found leaves the record alone
//! because an in-flight create may not be visible yet.

use ekstest_common::{Error, Result};
use ekstest_config::STATUS_ACTIVE;
use tracing::{debug, info, warn};

use super::StewardContext;
use crate::templates::{network_outputs, worker_outputs};

fn skip(what: &str, err: Error) {
    if err.is_not_found() {
        debug!(resource = what, "not present at the provider");
    } else {
        warn!(resource = what, error = %err, "describe failed during reconciliation");
    }
}

/// Fill the record from what the provider already knows
///
/// Only record persistence errors are returned; every provider failure is
/// logged and skipped.
pub async fn reconcile(ctx: &StewardContext) -> Result<()> {
    let state = ctx.store.state();

    match ctx.cloud.sts.get_caller_identity().await {
        Ok(identity) => {
            info!(account = %identity.account, arn = %identity.arn, "caller identity");
            ctx.record(|s| {
                s.aws_account_id = identity.account.clone();
                s.caller_arn = identity.arn.clone();
            })?;
        }
        Err(e) => skip("caller-identity", e),
    }

    match ctx.cloud.iam.get_role(&state.role.handle.name).await {
        Ok(arn) => ctx.record(|s| {
            if !s.role.handle.created {
                s.role.handle.mark_created(&arn, "ACTIVE");
            }
            s.role.handle.id = arn.clone();
        })?,
        Err(e) => skip("service-role", e),
    }

    match ctx.cloud.cfn.describe_stack(&state.network.handle.name).await {
        Ok(desc) if desc.status == "CREATE_COMPLETE" => ctx.record(|s| {
            s.network.handle.mark_created(&desc.id, &desc.status);
            if let Some(vpc) = desc.outputs.get(network_outputs::VPC_ID) {
                s.network.vpc_id = vpc.clone();
            }
            if let Some(subnets) = desc.outputs.get(network_outputs::SUBNET_IDS) {
                s.network.subnet_ids = subnets
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect();
            }
            if let Some(sg) = desc.outputs.get(network_outputs::SECURITY_GROUPS) {
                s.network.security_group_id = sg.clone();
            }
        })?,
        Ok(desc) => debug!(stack = %desc.name, status = %desc.status, "network stack not complete"),
        Err(e) => skip("network-stack", e),
    }

    match ctx.cloud.eks.describe_cluster(&state.control_plane.name).await {
        Ok(desc) => ctx.record(|s| {
            s.control_plane.mark_created(&desc.arn, &desc.status);
            s.status = desc.status.clone();
            if desc.status == STATUS_ACTIVE {
                s.endpoint = desc.endpoint.clone();
                s.certificate_authority = desc.certificate_authority.clone();
                s.platform_version = desc.platform_version.clone();
                s.created_at = desc.created_at.or(s.created_at);
            }
        })?,
        Err(e) => skip("control-plane", e),
    }

    let key = state.key_pair.handle.name.clone();
    match ctx.cloud.ec2.describe_key_pairs(std::slice::from_ref(&key)).await {
        Ok(names) if names.contains(&key) => ctx.record(|s| {
            if !s.key_pair.handle.created {
                s.key_pair.handle.mark_created("", "AVAILABLE");
            }
        })?,
        Ok(_) => debug!(key_pair = %key, "key pair not present"),
        Err(e) => skip("key-pair", e),
    }

    match ctx.cloud.cfn.describe_stack(&state.worker.stack.name).await {
        Ok(desc) if desc.status == "CREATE_COMPLETE" => ctx.record(|s| {
            s.worker.stack.mark_created(&desc.id, &desc.status);
            if let Some(arn) = desc.outputs.get(worker_outputs::NODE_INSTANCE_ROLE) {
                s.worker.instance_role_arn = arn.clone();
            }
            if let Some(sg) = desc.outputs.get(worker_outputs::NODE_SECURITY_GROUP) {
                s.worker.security_group_id = sg.clone();
            }
        })?,
        Ok(desc) => debug!(stack = %desc.name, status = %desc.status, "worker stack not complete"),
        Err(e) => skip("worker-stack", e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FAKE_ACCOUNT;
    use crate::steward::testutil::context;
    use crate::steward::{ensure, NetworkStack, ServiceRole};

    #[tokio::test]
    async fn test_empty_provider_only_fills_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _cloud) = context(dir.path());

        reconcile(&ctx).await.unwrap();
        let state = ctx.store.state();
        assert_eq!(state.aws_account_id, FAKE_ACCOUNT);
        assert!(!state.any_created());
    }

    /// Story: a previous process created the role and the network stack and
    /// then died before persisting anything. A fresh record picks both up.
    #[tokio::test(start_paused = true)]
    async fn story_lost_record_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let (first, cloud) = context(dir.path());
        ensure(&ServiceRole, &first).await.unwrap();
        ensure(&NetworkStack, &first).await.unwrap();
        let expected = first.store.state().network;

        let other = tempfile::tempdir().unwrap();
        let (fresh, _) = context(other.path());
        let fresh = crate::steward::StewardContext {
            cloud: first.cloud.clone(),
            ..fresh
        };
        assert!(!fresh.store.state().any_created());

        reconcile(&fresh).await.unwrap();
        let state = fresh.store.state();
        assert!(state.role.handle.created);
        assert!(state.role.handle.id.starts_with("arn:aws:iam::"));
        assert!(state.network.handle.created);
        assert_eq!(state.network.vpc_id, expected.vpc_id);
        assert_eq!(state.network.subnet_ids, expected.subnet_ids);
        assert!(!state.control_plane.created);
        assert!(!cloud.live_resources().is_empty());
    }
}
