//! Pipeline root
//!
//! A [`Tester`] owns one cluster's lifecycle. `Up` walks the steps of
//! [`steps::UpStep`] one at a time and persists the state record at every
//! boundary; a failed walk tears down whatever it attempted before the
//! original error is returned. `Down` tears everything down, attempting
//! every delete and joining the failures.
//!
//! Long waits observe the tester's cancellation token, which [`Tester::stop`]
//! (and the binary's signal handler) trips. Teardown runs on a token of its
//! own so a stopped run still cleans up.

mod artifacts;
mod probes;
pub mod steps;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ekstest_addon::AddOnTimeouts;
use ekstest_cloud::steward::reconcile;
use ekstest_cloud::{CloudClients, StewardContext, Timeouts};
use ekstest_common::exec::CommandRunner;
use ekstest_common::poll;
use ekstest_common::{CancellationToken, Error, Result};
use ekstest_config::{
    Config, Store, STATUS_ACTIVE, STATUS_DELETE_COMPLETE, STATUS_DELETING, STATUS_FAILED,
};
use ekstest_kube::kubeconfig::{self, CredentialParams};
use ekstest_kube::provisioner::{Toolchain, AUTHENTICATOR, KUBECTL};
use ekstest_kube::Kubectl;
use ekstest_probe::Uploader;
use tracing::{error, info, warn};

pub use steps::UpStep;

/// Drives `Up`, the probes and `Down` for one cluster
pub struct Tester {
    store: Arc<Store>,
    cloud: CloudClients,
    kubectl: Kubectl,
    host_runner: Arc<dyn CommandRunner>,
    authenticator: PathBuf,
    http: reqwest::Client,
    uploader: Option<Arc<dyn Uploader>>,
    cancel: CancellationToken,
    timeouts: Timeouts,
    addon_timeouts: AddOnTimeouts,
    correctness_schedule: Option<(u32, Duration)>,
}

impl std::fmt::Debug for Tester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tester")
            .field("cluster", &self.store.cluster_name())
            .field("kubectl", &self.kubectl)
            .finish_non_exhaustive()
    }
}

impl Tester {
    /// Build a tester and reconcile its record against the provider
    ///
    /// `runner` executes `kubectl` and every host-side command (`ssh`,
    /// `wrk`) unless [`Tester::with_host_runner`] splits them. When the
    /// reconciled control plane is active the credential file is
    /// regenerated.
    pub async fn new(
        store: Arc<Store>,
        cloud: CloudClients,
        runner: Arc<dyn CommandRunner>,
        toolchain: &Toolchain,
    ) -> Result<Self> {
        let cfg = store.config();
        let kubectl = Kubectl::new(runner.clone(), toolchain.require(KUBECTL)?, &cfg.kubeconfig_path)
            .with_env(toolchain.child_env())
            .with_debug(cfg.log_debug);
        let authenticator = toolchain
            .get(AUTHENTICATOR)
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| cfg.aws_iam_authenticator_path.clone());

        let tester = Self {
            timeouts: Timeouts::for_asg_max(cfg.worker_node_asg_max),
            store,
            cloud,
            kubectl,
            host_runner: runner,
            authenticator,
            http: reqwest::Client::new(),
            uploader: None,
            cancel: CancellationToken::new(),
            addon_timeouts: AddOnTimeouts::default(),
            correctness_schedule: None,
        };

        reconcile(&tester.context(tester.cancel.clone())).await?;
        let state = tester.store.state();
        if state.status == STATUS_ACTIVE && !state.endpoint.is_empty() {
            tester.write_kubeconfig()?;
        }
        Ok(tester)
    }

    /// Run `ssh` and `wrk` through a different runner than `kubectl`
    pub fn with_host_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.host_runner = runner;
        self
    }

    /// Override the steward deadlines
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Override the add-on deadlines
    pub fn with_addon_timeouts(mut self, timeouts: AddOnTimeouts) -> Self {
        self.addon_timeouts = timeouts;
        self
    }

    /// HTTP client used by the probes
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Artifact destination; defaults to the configured bucket
    ///
    /// Whatever is supplied is still wrapped in the private-key guard.
    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Correctness probe attempts and spacing
    pub fn with_correctness_schedule(mut self, attempts: u32, every: Duration) -> Self {
        self.correctness_schedule = Some((attempts, every));
        self
    }

    /// Shared state store
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Frozen run parameters
    pub fn config(&self) -> &Config {
        self.store.config()
    }

    /// Token tripped by [`Tester::stop`]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort every in-flight wait; the running step surfaces `cancelled`
    pub fn stop(&self) {
        info!(cluster = %self.store.cluster_name(), "stop requested");
        self.cancel.cancel();
    }

    fn context(&self, cancel: CancellationToken) -> StewardContext {
        StewardContext::new(self.store.clone(), self.cloud.clone(), cancel)
            .with_timeouts(self.timeouts.clone())
    }

    fn write_kubeconfig(&self) -> Result<()> {
        let state = self.store.state();
        let cfg = self.store.config();
        kubeconfig::write(
            &cfg.kubeconfig_path,
            &CredentialParams {
                endpoint: state.endpoint,
                certificate_authority: state.certificate_authority,
                cluster_name: cfg.cluster_name.clone(),
                authenticator_path: self.authenticator.clone(),
            },
        )?;
        info!(path = %cfg.kubeconfig_path.display(), "wrote credential file");
        Ok(())
    }

    // =========================================================================
    // Up
    // =========================================================================

    /// Create every enabled resource in order
    ///
    /// Refuses an already active cluster. On failure the attempted steps
    /// are torn down and the original error is returned.
    pub async fn up(&self) -> Result<()> {
        let status = self.store.state().status;
        if status == STATUS_ACTIVE {
            return Err(Error::invalid_config(
                "cluster-state.status",
                format!(
                    "cluster {} is already {}; run down first",
                    self.store.cluster_name(),
                    status
                ),
            ));
        }

        let started = Instant::now();
        let ctx = self.context(self.cancel.clone());
        let mut attempted = Vec::new();
        for step in UpStep::plan(self.config()) {
            attempted.push(step);
            info!(step = step.name(), "starting");
            if let Err(e) = self.forward(step, &ctx).await {
                warn!(step = step.name(), error = %e, "step failed, rolling back");
                if let Err(rollback) = self.teardown(&attempted, CancellationToken::new()).await {
                    error!(error = %rollback, "rollback left resources behind");
                }
                self.record_error(&e);
                return Err(e);
            }
            if step == UpStep::Join {
                let took = format!("{:?}", started.elapsed());
                self.store.update(|s| s.cluster_up_took = took)?;
            }
        }

        info!(
            cluster = %self.store.cluster_name(),
            took = ?started.elapsed(),
            "cluster is up"
        );
        Ok(())
    }

    // =========================================================================
    // Down
    // =========================================================================

    /// Delete everything the record says was created
    ///
    /// Every delete is attempted; failures are joined into one error.
    pub async fn down(&self) -> Result<()> {
        let status = self.store.state().status;
        if status == STATUS_DELETING || status == STATUS_FAILED {
            return Err(Error::invalid_config(
                "cluster-state.status",
                format!(
                    "cluster {} is {}; refusing to tear it down again",
                    self.store.cluster_name(),
                    status
                ),
            ));
        }

        let wait = Duration::from_secs(self.config().wait_before_down_seconds);
        if let Err(e) = poll::sleep("wait-before-down", wait, &self.cancel).await {
            warn!(error = %e, "wait before down interrupted, tearing down now");
        }

        let result = self.teardown(&UpStep::ALL, CancellationToken::new()).await;
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    /// Collect and upload artifacts, then undo `steps` in reverse
    async fn teardown(&self, steps: &[UpStep], cancel: CancellationToken) -> Result<()> {
        let ctx = self.context(cancel.clone());
        let mut errors = Vec::new();

        if self.config().upload_worker_node_logs {
            match self.collect_worker_logs(&cancel).await {
                Ok(collection) => {
                    if let Some(e) = collection.first_error() {
                        warn!(error = %e, "some worker logs were not collected");
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        if let Err(e) = self.upload_artifacts().await {
            errors.push(e);
        }

        for step in steps.iter().rev() {
            if let Err(e) = self.undo(*step, &ctx).await {
                error!(step = step.name(), error = %e, "teardown step failed");
                errors.push(e);
            }
            // worker instances can hold the controller group until they are gone
            if *step == UpStep::Workers {
                if let Err(e) = self.addon(&ctx).retry_security_group().await {
                    error!(error = %e, "controller security group left behind");
                    errors.push(e);
                }
            }
        }

        if let Some(e) = Error::teardown(errors) {
            return Err(e);
        }
        let left = self.store.update(|s| {
            if !s.control_plane.created {
                s.status = STATUS_DELETE_COMPLETE.to_string();
            }
            s.still_created()
        })?;
        if left.is_empty() {
            info!(cluster = %self.store.cluster_name(), "every resource deleted");
        } else {
            warn!(flags = ?left, "resources remain after teardown");
        }
        Ok(())
    }

    fn record_error(&self, e: &Error) {
        let msg = e.to_string();
        if let Err(sync) = self.store.update(|s| s.last_error = msg) {
            warn!(error = %sync, "could not persist the last error");
        }
    }

    // =========================================================================
    // Check and full run
    // =========================================================================

    /// Fails unless the provider reports the control plane active
    pub async fn is_up(&self) -> Result<()> {
        let mut name = self.store.state().control_plane.name;
        if name.is_empty() {
            name = self.store.cluster_name().to_string();
        }
        let desc = self.cloud.eks.describe_cluster(&name).await?;
        if desc.status != STATUS_ACTIVE {
            return Err(Error::cloud_terminal(
                &name,
                &desc.status,
                "control plane is not active",
            ));
        }
        info!(cluster = %name, endpoint = %desc.endpoint, "control plane is active");
        Ok(())
    }

    /// `Up`, every enabled probe, then `Down` when configured
    ///
    /// A probe failure does not skip `Down`. The first error is returned.
    pub async fn run(&self) -> Result<()> {
        self.up().await?;

        let mut errors = Vec::new();
        if self.config().alb_ingress_controller.enable {
            if let Err(e) = self.test_correctness().await {
                errors.push(e);
            }
            if let Err(e) = self.test_throughput().await {
                errors.push(e);
            }
            if let Err(e) = self.test_metrics().await {
                errors.push(e);
            }
        }
        if self.config().down {
            if let Err(e) = self.down().await {
                errors.push(e);
            }
        } else {
            info!(config = %self.store.path().display(), "leaving the cluster up");
        }

        for e in errors.iter().skip(1) {
            warn!(error = %e, "additional failure");
        }
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
