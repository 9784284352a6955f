//! Forward steps of `Up` paired with their undos
//!
//! `Up` walks [`UpStep::ALL`] in order. A failed walk undoes the steps it
//! attempted in reverse, and `Down` undoes every step. Undos only touch
//! resources whose created flag is set, so undoing a step that never ran
//! or already ran is harmless.

use std::time::Duration;

use ekstest_addon::AddOnPipeline;
use ekstest_cloud::steward::{
    ensure, join_workers, remove, remove_node_role_mapping, AccessLogBucket, ControlPlane,
    KeyPair, NetworkStack, ServiceRole, WorkerStack,
};
use ekstest_cloud::StewardContext;
use ekstest_common::fs::remove_if_exists;
use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::Result;
use ekstest_config::Config;
use tracing::{info, warn};

use super::Tester;

/// Budget for the API server to answer once the control plane is active
pub const CONTROL_PLANE_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Budget for applying the CNI manifest
pub const CNI_APPLY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const CNI_APPLY_INTERVAL: Duration = Duration::from_secs(10);

/// One unit of `Up`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpStep {
    /// Load-balancer access-log bucket
    AccessLogBucket,
    /// Control-plane service role
    ServiceRole,
    /// Virtual-network stack
    Network,
    /// Managed control plane
    ControlPlane,
    /// Credential file and API readiness
    Credentials,
    /// CNI manifest upgrade
    Cni,
    /// Worker SSH key pair
    KeyPair,
    /// Worker node group stack
    Workers,
    /// Node role mapping and node readiness
    Join,
    /// Load-balancer add-on
    AddOn,
}

impl UpStep {
    /// Every step in forward order
    pub const ALL: [UpStep; 10] = [
        UpStep::AccessLogBucket,
        UpStep::ServiceRole,
        UpStep::Network,
        UpStep::ControlPlane,
        UpStep::Credentials,
        UpStep::Cni,
        UpStep::KeyPair,
        UpStep::Workers,
        UpStep::Join,
        UpStep::AddOn,
    ];

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::AccessLogBucket => "access-log-bucket",
            Self::ServiceRole => "service-role",
            Self::Network => "network",
            Self::ControlPlane => "control-plane",
            Self::Credentials => "credentials",
            Self::Cni => "cni",
            Self::KeyPair => "key-pair",
            Self::Workers => "workers",
            Self::Join => "join",
            Self::AddOn => "add-on",
        }
    }

    /// Whether `cfg` asks for this step at all
    pub fn enabled(&self, cfg: &Config) -> bool {
        match self {
            Self::AccessLogBucket => cfg.log_access,
            Self::Cni => !cfg.cni_manifest_url.is_empty(),
            Self::AddOn => cfg.alb_ingress_controller.enable,
            _ => true,
        }
    }

    /// Enabled steps of `cfg`, in forward order
    pub fn plan(cfg: &Config) -> Vec<UpStep> {
        Self::ALL.into_iter().filter(|s| s.enabled(cfg)).collect()
    }
}

impl Tester {
    pub(crate) async fn forward(&self, step: UpStep, ctx: &StewardContext) -> Result<()> {
        match step {
            UpStep::AccessLogBucket => ensure(&AccessLogBucket, ctx).await.map(drop),
            UpStep::ServiceRole => ensure(&ServiceRole, ctx).await.map(drop),
            UpStep::Network => ensure(&NetworkStack, ctx).await.map(drop),
            UpStep::ControlPlane => ensure(&ControlPlane, ctx).await.map(drop),
            UpStep::Credentials => {
                self.write_kubeconfig()?;
                self.kubectl
                    .wait_control_plane_ready(CONTROL_PLANE_READY_TIMEOUT, &ctx.cancel)
                    .await
            }
            UpStep::Cni => self.apply_cni(ctx).await,
            UpStep::KeyPair => ensure(&KeyPair, ctx).await.map(drop),
            UpStep::Workers => ensure(&WorkerStack, ctx).await.map(drop),
            UpStep::Join => join_workers(ctx, &self.kubectl).await.map(drop),
            UpStep::AddOn => self.addon(ctx).create().await,
        }
    }

    pub(crate) async fn undo(&self, step: UpStep, ctx: &StewardContext) -> Result<()> {
        match step {
            UpStep::AccessLogBucket => remove(&AccessLogBucket, ctx).await,
            UpStep::ServiceRole => remove(&ServiceRole, ctx).await,
            UpStep::Network => remove(&NetworkStack, ctx).await,
            UpStep::ControlPlane => remove(&ControlPlane, ctx).await,
            UpStep::Credentials => remove_if_exists(&self.store.config().kubeconfig_path),
            // the CNI manifest goes with the control plane
            UpStep::Cni => Ok(()),
            UpStep::Join => self.remove_role_mapping(ctx).await,
            UpStep::KeyPair => remove(&KeyPair, ctx).await,
            UpStep::Workers => remove(&WorkerStack, ctx).await,
            UpStep::AddOn => self.addon(ctx).delete().await,
        }
    }

    /// Drop `aws-auth` while the API server is still reachable
    async fn remove_role_mapping(&self, ctx: &StewardContext) -> Result<()> {
        let state = ctx.store.state();
        if !state.control_plane.created || !self.store.config().kubeconfig_path.exists() {
            return Ok(());
        }
        if let Err(e) = remove_node_role_mapping(&self.kubectl).await {
            warn!(error = %e, "node role mapping left in place");
        }
        Ok(())
    }

    pub(crate) fn addon(&self, ctx: &StewardContext) -> AddOnPipeline {
        AddOnPipeline::new(ctx.clone(), self.kubectl.clone()).with_timeouts(self.addon_timeouts.clone())
    }

    async fn apply_cni(&self, ctx: &StewardContext) -> Result<()> {
        let url = &self.store.config().cni_manifest_url;
        let spec = PollSpec::new("apply-cni", CNI_APPLY_INTERVAL, CNI_APPLY_TIMEOUT);
        poll(&spec, &ctx.cancel, || async {
            match self.kubectl.apply_url(url).await {
                Ok(()) => Ok(Attempt::Done(())),
                Err(e) if e.is_retryable() => Ok(Attempt::Retry(e.to_string())),
                Err(e) => Err(e),
            }
        })
        .await?;
        info!(url = %url, "applied CNI manifest");
        Ok(())
    }
}
