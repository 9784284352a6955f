//! Resource stewards
//!
//! Each provider resource the harness owns is a [`Resource`]: it knows its
//! handle in the state record, how to request a create, how to wait for the
//! create to settle, and how to delete. [`ensure`] is the create path every
//! caller uses; it skips the provider entirely when the record already
//! shows a settled create, and writes any failure into the handle before
//! returning it.
//!
//! Deletes are idempotent. A handle whose `created` flag is clear is never
//! touched, and a not-found reply from the provider counts as deleted.

mod bucket;
mod control_plane;
mod join;
mod key_pair;
mod load_balancer;
mod network;
mod reconcile;
mod role;
mod security_group;
mod worker;

pub use bucket::AccessLogBucket;
pub use control_plane::ControlPlane;
pub use join::{aws_auth_config_map, join_workers, remove_node_role_mapping};
pub use key_pair::KeyPair;
pub use load_balancer::{find_load_balancer, gc_load_balancers, verify_target_health};
pub use network::NetworkStack;
pub use reconcile::reconcile;
pub use role::ServiceRole;
pub use security_group::ControllerSecurityGroup;
pub use worker::WorkerStack;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::{CancellationToken, Error, Result};
use ekstest_config::{ClusterState, ResourceHandle, Store};
use tracing::{debug, info, warn};

use crate::api::{CloudClients, StackDescription};

/// Deadlines and intervals of every steward wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Fixed wait after requesting a control plane, before the first describe
    pub control_plane_pre_wait: Duration,
    /// Budget for the control plane to turn active
    pub control_plane: Duration,
    /// Describe interval while the control plane settles
    pub control_plane_interval: Duration,
    /// Fixed wait after requesting control-plane deletion
    pub cluster_delete_pre_wait: Duration,
    /// Budget for the control plane to disappear
    pub cluster_delete: Duration,
    /// Budget for a stack to reach a terminal status
    pub stack: Duration,
    /// Describe interval for stacks, groups and instances
    pub stack_interval: Duration,
    /// Budget for a key-pair create or delete to become visible
    pub key_pair: Duration,
    /// Budget for worker nodes to register and turn ready
    pub join: Duration,
    /// How long a security-group delete keeps retrying a dependency violation
    pub dependency_retry: Duration,
    /// Interval of short provider waits
    pub short_interval: Duration,
}

impl Timeouts {
    /// Production deadlines; stack budgets scale with the group size
    pub fn for_asg_max(asg_max: u32) -> Self {
        let stack = Duration::from_secs(60 * (5 + 2 * u64::from(asg_max)));
        Self {
            control_plane_pre_wait: Duration::from_secs(7 * 60),
            control_plane: Duration::from_secs(20 * 60),
            control_plane_interval: Duration::from_secs(30),
            cluster_delete_pre_wait: Duration::from_secs(4 * 60),
            cluster_delete: Duration::from_secs(15 * 60),
            stack,
            stack_interval: Duration::from_secs(10),
            key_pair: Duration::from_secs(60),
            join: stack,
            dependency_retry: Duration::from_secs(5 * 60),
            short_interval: Duration::from_secs(5),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::for_asg_max(1)
    }
}

/// Everything a steward needs: the record, the provider and a stop signal
#[derive(Debug, Clone)]
pub struct StewardContext {
    /// State record and frozen parameters
    pub store: Arc<Store>,
    /// Provider services
    pub cloud: CloudClients,
    /// Stop signal observed by every wait
    pub cancel: CancellationToken,
    /// Wait budgets
    pub timeouts: Timeouts,
}

impl StewardContext {
    /// Context with production timeouts derived from the config
    pub fn new(store: Arc<Store>, cloud: CloudClients, cancel: CancellationToken) -> Self {
        let timeouts = Timeouts::for_asg_max(store.config().worker_node_asg_max);
        Self {
            store,
            cloud,
            cancel,
            timeouts,
        }
    }

    /// Same context observing another stop signal
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Replace the wait budgets
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Mutate and persist the state record
    pub fn record<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> Result<R> {
        self.store.update(f)
    }
}

/// A provider resource with an entry in the state record
#[async_trait]
pub trait Resource: Send + Sync {
    /// Step name for logs and errors
    fn name(&self) -> &'static str;

    /// The resource's handle in the record
    fn handle<'a>(&self, state: &'a ClusterState) -> &'a ResourceHandle;

    /// Mutable access to the resource's handle
    fn handle_mut<'a>(&self, state: &'a mut ClusterState) -> &'a mut ResourceHandle;

    /// Status the handle carries once the create has fully settled
    fn settled_status(&self) -> &'static str;

    /// Request the create and mark the handle created; returns the provider id
    async fn create(&self, ctx: &StewardContext) -> Result<String>;

    /// Wait for the create to settle and record its outputs
    async fn wait(&self, ctx: &StewardContext) -> Result<String>;

    /// Delete the resource and clear the handle
    async fn delete(&self, ctx: &StewardContext) -> Result<()>;
}

/// Create if the record says it is missing, then wait for it to settle
pub async fn ensure(resource: &dyn Resource, ctx: &StewardContext) -> Result<String> {
    let state = ctx.store.state();
    let handle = resource.handle(&state);

    if handle.created && handle.status == resource.settled_status() {
        info!(step = resource.name(), id = %handle.id, "already created, skipping");
        return Ok(handle.id.clone());
    }

    let outcome = if handle.created {
        info!(step = resource.name(), status = %handle.status, "resuming wait on existing resource");
        resource.wait(ctx).await
    } else {
        info!(step = resource.name(), "creating");
        match resource.create(ctx).await {
            Ok(_) => resource.wait(ctx).await,
            Err(e) => Err(e),
        }
    };

    match outcome {
        Ok(id) => {
            info!(step = resource.name(), id = %id, "created");
            Ok(id)
        }
        Err(e) => {
            warn!(step = resource.name(), error = %e, "create failed");
            ctx.record(|s| resource.handle_mut(s).fail(&e))?;
            Err(e)
        }
    }
}

/// Delete when the record says the resource exists
pub async fn remove(resource: &dyn Resource, ctx: &StewardContext) -> Result<()> {
    if !resource.handle(&ctx.store.state()).created {
        debug!(step = resource.name(), "not created, nothing to delete");
        return Ok(());
    }
    info!(step = resource.name(), "deleting");
    match resource.delete(ctx).await {
        Ok(()) => {
            info!(step = resource.name(), "deleted");
            Ok(())
        }
        Err(e) => {
            warn!(step = resource.name(), error = %e, "delete failed");
            ctx.record(|s| resource.handle_mut(s).fail(&e))?;
            Err(e)
        }
    }
}

/// Provider stack statuses that end a create unsuccessfully
pub fn is_failed_stack_status(status: &str) -> bool {
    let status = status.to_ascii_uppercase();
    status.contains("ROLLBACK") || status.ends_with("_FAILED")
}

/// Poll a stack until `CREATE_COMPLETE`, recording every observed status
///
/// A failed terminal status ends the wait at once with a terminal error.
pub(crate) async fn wait_stack_created(
    ctx: &StewardContext,
    resource: &dyn Resource,
    stack: &str,
) -> Result<StackDescription> {
    let spec = PollSpec::new(
        format!("wait-stack/{}", stack),
        ctx.timeouts.stack_interval,
        ctx.timeouts.stack,
    );
    poll(&spec, &ctx.cancel, || async {
        let desc = ctx.cloud.cfn.describe_stack(stack).await?;
        ctx.record(|s| resource.handle_mut(s).observe(&desc.status))?;
        if desc.status == "CREATE_COMPLETE" {
            Ok(Attempt::Done(desc))
        } else if is_failed_stack_status(&desc.status) {
            Err(Error::cloud_terminal(
                stack,
                &desc.status,
                desc.status_reason.clone(),
            ))
        } else {
            Ok(Attempt::Retry(format!("stack status {}", desc.status)))
        }
    })
    .await
}

/// Request a stack delete and poll until the provider no longer knows it
pub(crate) async fn delete_stack(ctx: &StewardContext, stack: &str) -> Result<()> {
    match ctx.cloud.cfn.delete_stack(stack).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    }
    let spec = PollSpec::new(
        format!("wait-stack-deleted/{}", stack),
        ctx.timeouts.stack_interval,
        ctx.timeouts.stack,
    );
    poll(&spec, &ctx.cancel, || async {
        match ctx.cloud.cfn.describe_stack(stack).await {
            Err(e) if e.is_not_found() => Ok(Attempt::Done(())),
            Err(e) => Err(e),
            Ok(desc) if desc.status == "DELETE_COMPLETE" => Ok(Attempt::Done(())),
            Ok(desc) if desc.status == "DELETE_FAILED" => Err(Error::cloud_terminal(
                stack,
                &desc.status,
                desc.status_reason,
            )),
            Ok(desc) => Ok(Attempt::Retry(format!("stack status {}", desc.status))),
        }
    })
    .await
}

/// Treat not-found as success on delete paths
pub(crate) fn tolerate_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
