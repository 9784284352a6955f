//! Staged add-on deployment
//!
//! Five stages run strictly in order, each persisting its [`StageState`]
//! before and after it runs. A stage already `ready` in the record is
//! skipped, so a second `create` resumes where a failed one stopped.
//! Teardown walks the stages in reverse; after the ingress objects are gone
//! it removes whatever load balancers the controller leaked in the cluster
//! VPC, before the controller security group is deleted.

use std::collections::BTreeMap;
use std::time::Duration;

use ekstest_cloud::steward::{
    ensure, find_load_balancer, gc_load_balancers, remove, ControllerSecurityGroup,
};
use ekstest_cloud::StewardContext;
use ekstest_common::fs::{write_atomic, MODE_PRIVATE};
use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::{Error, Result};
use ekstest_config::{AddOnState, StageState};
use ekstest_kube::{views::load_balancer_name, Kubectl};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::manifests::{self, BackendParams, ControllerParams, IngressParams};

/// Wait budgets of the add-on stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOnTimeouts {
    /// Retrying a rejected apply or delete
    pub apply: Duration,
    /// Controller and backend pods turning ready
    pub pods: Duration,
    /// Ingress hostname assignment, per ingress
    pub ingress_host: Duration,
    /// Load balancer showing up in the provider catalogue
    pub load_balancer: Duration,
    /// Interval of the load-balancer lookup
    pub interval: Duration,
}

impl Default for AddOnTimeouts {
    fn default() -> Self {
        Self {
            apply: Duration::from_secs(5 * 60),
            pods: Duration::from_secs(10 * 60),
            ingress_host: Duration::from_secs(10 * 60),
            load_balancer: Duration::from_secs(3 * 60),
            interval: Duration::from_secs(10),
        }
    }
}

/// One step of the add-on deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Controller cluster-role, service account and binding
    Rbac,
    /// Controller deployment and metrics service
    Controller,
    /// Controller security group in the cluster VPC
    SecurityGroup,
    /// nginx or ingress test server
    Backend,
    /// Metrics and load-test ingress objects
    Ingress,
}

impl Stage {
    /// Creation order
    pub const ALL: [Stage; 5] = [
        Stage::Rbac,
        Stage::Controller,
        Stage::SecurityGroup,
        Stage::Backend,
        Stage::Ingress,
    ];

    /// Stage name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Rbac => "addon-rbac",
            Stage::Controller => "addon-controller",
            Stage::SecurityGroup => "addon-security-group",
            Stage::Backend => "addon-backend",
            Stage::Ingress => "addon-ingress",
        }
    }

    /// The stage's progress in the record
    pub fn state(&self, addon: &AddOnState) -> StageState {
        match self {
            Stage::Rbac => addon.rbac,
            Stage::Controller => addon.controller,
            Stage::SecurityGroup => addon.security_group_stage,
            Stage::Backend => addon.backend,
            Stage::Ingress => addon.ingress,
        }
    }

    fn slot<'a>(&self, addon: &'a mut AddOnState) -> &'a mut StageState {
        match self {
            Stage::Rbac => &mut addon.rbac,
            Stage::Controller => &mut addon.controller,
            Stage::SecurityGroup => &mut addon.security_group_stage,
            Stage::Backend => &mut addon.backend,
            Stage::Ingress => &mut addon.ingress,
        }
    }
}

/// Deploys and removes the load-balancer add-on
#[derive(Debug, Clone)]
pub struct AddOnPipeline {
    ctx: StewardContext,
    kubectl: Kubectl,
    timeouts: AddOnTimeouts,
}

impl AddOnPipeline {
    /// Pipeline over the cluster reached through `kubectl`
    pub fn new(ctx: StewardContext, kubectl: Kubectl) -> Self {
        Self {
            ctx,
            kubectl,
            timeouts: AddOnTimeouts::default(),
        }
    }

    /// Replace the wait budgets
    pub fn with_timeouts(mut self, timeouts: AddOnTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn mark(&self, stage: Stage, to: StageState) -> Result<()> {
        self.ctx.record(|s| *stage.slot(&mut s.addon) = to)
    }

    /// Run every stage not yet ready
    pub async fn create(&self) -> Result<()> {
        for stage in Stage::ALL {
            let current = stage.state(&self.ctx.store.state().addon);
            if current == StageState::Ready {
                info!(stage = stage.name(), "already ready, skipping");
                continue;
            }

            info!(stage = stage.name(), from = %current, "starting");
            self.ctx.record(|s| {
                s.addon.created = true;
                *stage.slot(&mut s.addon) = StageState::Creating;
            })?;

            if let Err(e) = self.create_stage(stage).await {
                warn!(stage = stage.name(), error = %e, "stage failed");
                self.ctx.record(|s| {
                    *stage.slot(&mut s.addon) = StageState::Failed;
                    s.addon.last_error = e.to_string();
                })?;
                return Err(e);
            }
            self.mark(stage, StageState::Ready)?;
            info!(stage = stage.name(), "ready");
        }
        Ok(())
    }

    /// Tear every stage down in reverse; all stages are attempted
    ///
    /// A security group still in use after its retry budget leaves its
    /// stage `Failed` and the add-on marked created. The call still succeeds
    /// so the worker stack can go first; [`Self::retry_security_group`]
    /// finishes the job afterwards.
    pub async fn delete(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut deferred = false;

        for stage in Stage::ALL.iter().rev().copied() {
            let current = stage.state(&self.ctx.store.state().addon);
            if !current.needs_teardown() {
                continue;
            }
            info!(stage = stage.name(), from = %current, "deleting");
            self.mark(stage, StageState::Deleting)?;

            match self.delete_stage(stage).await {
                Ok(()) if stage == Stage::SecurityGroup && self.security_group_left() => {
                    self.mark(stage, StageState::Failed)?;
                    deferred = true;
                }
                Ok(()) => self.mark(stage, StageState::DeleteComplete)?,
                Err(e) => {
                    warn!(stage = stage.name(), error = %e, "stage teardown failed");
                    self.ctx.record(|s| {
                        *stage.slot(&mut s.addon) = StageState::Failed;
                        s.addon.last_error = e.to_string();
                    })?;
                    errors.push(e);
                }
            }
        }

        match Error::teardown(errors) {
            Some(e) => Err(e),
            None if deferred => {
                warn!("controller security group still in use, retrying after the workers");
                Ok(())
            }
            None => {
                self.ctx.record(|s| s.addon.created = false)?;
                info!("add-on removed");
                Ok(())
            }
        }
    }

    /// Delete a controller security group an earlier teardown left behind
    ///
    /// Errors while the group is still referenced, keeping its flag set so
    /// a later teardown tries again.
    pub async fn retry_security_group(&self) -> Result<()> {
        if !self.security_group_left() {
            return Ok(());
        }
        info!("retrying controller security group delete");
        remove(&ControllerSecurityGroup, &self.ctx).await?;
        if self.security_group_left() {
            let state = self.ctx.store.state();
            return Err(Error::dependency_violation(
                state.addon.security_group.name,
                format!(
                    "still in use after the worker stack was deleted: {}",
                    state.addon.security_group.error
                ),
            ));
        }

        self.ctx.record(|s| {
            s.addon.security_group_stage = StageState::DeleteComplete;
            if !Stage::ALL.iter().any(|st| st.state(&s.addon).needs_teardown()) {
                s.addon.created = false;
            }
        })?;
        info!("controller security group deleted");
        Ok(())
    }

    fn security_group_left(&self) -> bool {
        self.ctx.store.state().addon.security_group.created
    }

    /// Apply `yaml`, retrying rejections until the apply budget runs out
    async fn apply(&self, what: &str, yaml: &str) -> Result<()> {
        let spec = PollSpec::new(
            format!("apply/{}", what),
            ekstest_kube::KUBECTL_POLL_INTERVAL,
            self.timeouts.apply,
        );
        poll(&spec, &self.ctx.cancel, || async {
            self.kubectl.apply(yaml).await.map(Attempt::Done)
        })
        .await
    }

    async fn delete_objects(&self, what: &str, refs: &[manifests::ObjectRef]) -> Result<()> {
        let yaml = manifests::delete_stream(refs)?;
        let spec = PollSpec::new(
            format!("delete/{}", what),
            ekstest_kube::KUBECTL_POLL_INTERVAL,
            self.timeouts.apply,
        );
        poll(&spec, &self.ctx.cancel, || async {
            self.kubectl.delete(&yaml).await.map(Attempt::Done)
        })
        .await
    }

    async fn create_stage(&self, stage: Stage) -> Result<()> {
        let cfg = self.ctx.store.config();
        let alb = &cfg.alb_ingress_controller;
        match stage {
            Stage::Rbac => {
                self.apply("rbac", &manifests::rbac()?).await?;
                Ok(())
            }
            Stage::Controller => {
                let yaml = manifests::controller(&ControllerParams {
                    region: &cfg.region,
                    cluster_name: &cfg.cluster_name,
                    image: &alb.controller_image,
                })?;
                write_atomic(&alb.ingress_controller_spec_path, yaml.as_bytes(), MODE_PRIVATE)?;
                self.apply("controller", &yaml).await?;
                self.mark(stage, StageState::Applied)?;
                self.kubectl
                    .wait_pods_ready(
                        manifests::CONTROLLER_NAMESPACE,
                        &format!("{}-", manifests::CONTROLLER_NAME),
                        1,
                        self.timeouts.pods,
                        &self.ctx.cancel,
                    )
                    .await?;
                Ok(())
            }
            Stage::SecurityGroup => {
                ensure(&ControllerSecurityGroup, &self.ctx).await?;
                Ok(())
            }
            Stage::Backend => {
                let replicas = i32::try_from(alb.test_server_replicas).map_err(|_| {
                    Error::invalid_config(
                        "alb-ingress-controller.test-server-replicas",
                        "out of range",
                    )
                })?;
                let yaml = manifests::backend(&BackendParams {
                    mode: alb.test_mode,
                    image: &alb.test_server_image,
                    replicas,
                    routes: alb.test_server_routes.max(0) as usize,
                    response_size: alb.test_response_size.max(0) as usize,
                })?;
                write_atomic(&alb.ingress_test_server_spec_path, yaml.as_bytes(), MODE_PRIVATE)?;
                self.apply("backend", &yaml).await?;
                self.mark(stage, StageState::Applied)?;

                let (name, _) = manifests::backend_names(alb.test_mode);
                self.kubectl
                    .wait_pods_ready(
                        manifests::BACKEND_NAMESPACE,
                        &format!("{}-", name),
                        replicas as usize,
                        self.timeouts.pods,
                        &self.ctx.cancel,
                    )
                    .await?;
                Ok(())
            }
            Stage::Ingress => self.create_ingress().await,
        }
    }

    fn ingress_params(&self) -> Result<Vec<IngressParams>> {
        let cfg = self.ctx.store.config();
        let alb = &cfg.alb_ingress_controller;
        let state = self.ctx.store.state();

        if state.network.vpc_id.is_empty() || state.network.security_group_id.is_empty() {
            return Err(Error::invalid_config(
                "vpc-id",
                "ingress objects need the network stack outputs",
            ));
        }
        let controller_group = state.addon.security_group.id.clone();
        if controller_group.is_empty() {
            return Err(Error::invalid_config(
                "alb-security-group-id",
                "ingress objects need the controller security group",
            ));
        }

        let tag = if cfg.tag.is_empty() { "ekstest" } else { cfg.tag.as_str() };
        let tags = BTreeMap::from([(tag.to_string(), cfg.cluster_name.clone())]);
        let groups = vec![state.network.security_group_id.clone(), controller_group];
        let access_logs = |namespace: &str| {
            cfg.log_access.then(|| {
                manifests::access_log_attributes(
                    &state.access_log_bucket.name,
                    &cfg.cluster_name,
                    namespace,
                )
            })
        };

        Ok(vec![
            IngressParams {
                name: manifests::METRICS_INGRESS.to_string(),
                namespace: manifests::CONTROLLER_NAMESPACE.to_string(),
                target_type: alb.target_type.clone(),
                subnet_ids: state.network.subnet_ids.clone(),
                // ip targets let the controller manage its own group
                security_group_ids: if alb.target_type == "instance" {
                    groups.clone()
                } else {
                    Vec::new()
                },
                tags: tags.clone(),
                access_logs: access_logs(manifests::CONTROLLER_NAMESPACE),
                paths: vec![(
                    manifests::METRICS_PATH.to_string(),
                    manifests::CONTROLLER_SERVICE.to_string(),
                )],
            },
            IngressParams {
                name: manifests::BACKEND_INGRESS.to_string(),
                namespace: manifests::BACKEND_NAMESPACE.to_string(),
                target_type: alb.target_type.clone(),
                subnet_ids: state.network.subnet_ids.clone(),
                security_group_ids: groups,
                tags,
                access_logs: access_logs(manifests::BACKEND_NAMESPACE),
                paths: manifests::backend_routes(
                    alb.test_mode,
                    alb.test_server_routes.max(0) as usize,
                ),
            },
        ])
    }

    async fn create_ingress(&self) -> Result<()> {
        let started = Instant::now();
        let cfg = self.ctx.store.config();

        let objects = self
            .ingress_params()?
            .iter()
            .map(manifests::ingress)
            .collect::<Result<Vec<_>>>()?;
        let yaml = manifests::ingress_stream(&objects)?;
        write_atomic(
            &cfg.alb_ingress_controller.ingress_object_spec_path,
            yaml.as_bytes(),
            MODE_PRIVATE,
        )?;
        self.apply("ingress", &yaml).await?;
        self.mark(Stage::Ingress, StageState::Applied)?;

        let (_, backend_service) = manifests::backend_names(cfg.alb_ingress_controller.test_mode);
        for (namespace, service) in [
            (manifests::CONTROLLER_NAMESPACE, manifests::CONTROLLER_SERVICE),
            (manifests::BACKEND_NAMESPACE, backend_service),
        ] {
            let host = self
                .kubectl
                .wait_host_ready(namespace, service, self.timeouts.ingress_host, &self.ctx.cancel)
                .await?;
            self.ctx
                .record(|s| s.addon.dns_names.insert(namespace.to_string(), host.clone()))?;

            let (name, arn) = self.resolve_load_balancer(&host).await?;
            info!(namespace, load_balancer = %name, arn = %arn, "ingress load balancer found");
            self.ctx
                .record(|s| s.addon.load_balancer_arns.insert(name, arn))?;
        }

        let took = started.elapsed();
        self.ctx
            .record(|s| s.ingress_up_took = format!("{:?}", took))?;
        info!(took = ?took, "ingress objects ready");
        Ok(())
    }

    /// Look up the balancer named by `host` and check it serves that host
    async fn resolve_load_balancer(&self, host: &str) -> Result<(String, String)> {
        let name = load_balancer_name(host).ok_or_else(|| {
            Error::cloud_terminal(host, "UNRECOGNISED_HOST", "cannot derive a load-balancer name")
        })?;
        let spec = PollSpec::new(
            format!("find-load-balancer/{}", name),
            self.timeouts.interval,
            self.timeouts.load_balancer,
        );
        let lb = poll(&spec, &self.ctx.cancel, || async {
            find_load_balancer(self.ctx.cloud.elb.as_ref(), &name)
                .await
                .map(Attempt::Done)
        })
        .await?;

        if lb.dns_name != host {
            return Err(Error::cloud_terminal(
                &name,
                "DNS_MISMATCH",
                format!("load balancer serves {} but the ingress reports {}", lb.dns_name, host),
            ));
        }
        Ok((name, lb.arn))
    }

    async fn delete_stage(&self, stage: Stage) -> Result<()> {
        let mode = self.ctx.store.config().alb_ingress_controller.test_mode;
        match stage {
            Stage::Rbac => self.delete_objects("rbac", &manifests::rbac_refs()).await,
            Stage::Controller => {
                self.delete_objects("controller", &manifests::controller_refs())
                    .await
            }
            Stage::SecurityGroup => remove(&ControllerSecurityGroup, &self.ctx).await,
            Stage::Backend => {
                self.delete_objects("backend", &manifests::backend_refs(mode))
                    .await
            }
            Stage::Ingress => {
                self.delete_objects("ingress", &manifests::ingress_refs())
                    .await?;
                let vpc = self.ctx.store.state().network.vpc_id;
                gc_load_balancers(self.ctx.cloud.elb.as_ref(), &vpc).await?;
                self.ctx.record(|s| {
                    s.addon.dns_names.clear();
                    s.addon.load_balancer_arns.clear();
                })?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekstest_cloud::fake::FakeCloud;
    use ekstest_cloud::steward::NetworkStack;
    use ekstest_cloud::CloudClients;
    use ekstest_common::{CancellationToken, ErrorKind};
    use ekstest_config::validate::{validate_and_set_defaults, NameSeed};
    use ekstest_config::{Config, Store, TestMode};
    use ekstest_kube::fake::FakeKubectl;
    use std::path::Path;
    use std::sync::Arc;

    const METRICS_HOST: &str = "k8s-kubesyst-ingressf-0a1b2c3d-1111.us-west-2.elb.amazonaws.com";
    const BACKEND_HOST: &str = "k8s-default-ingressf-4e5f6a7b-2222.us-west-2.elb.amazonaws.com";

    struct Harness {
        pipeline: AddOnPipeline,
        ctx: StewardContext,
        cloud: Arc<FakeCloud>,
        kube: Arc<FakeKubectl>,
        _dir: tempfile::TempDir,
    }

    async fn harness(mode: TestMode) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config {
            config_path: dir.path().join("test-ci.yaml"),
            cluster_name: "test-ci".to_string(),
            ..Default::default()
        };
        cfg.alb_ingress_controller.enable = true;
        cfg.alb_ingress_controller.test_mode = mode;
        cfg.alb_ingress_controller.test_server_routes = 2;
        let seed = NameSeed {
            user_id: "ci".to_string(),
            hostname: "runner".to_string(),
            now: chrono::Utc::now(),
        };
        validate_and_set_defaults(&mut cfg, &seed).unwrap();

        let cloud = Arc::new(FakeCloud::new());
        let ctx = StewardContext::new(
            Arc::new(Store::new(cfg)),
            CloudClients::from_backend(cloud.clone()),
            CancellationToken::new(),
        );
        ensure(&NetworkStack, &ctx).await.unwrap();

        let kube = Arc::new(FakeKubectl::new());
        kube.set_ingress_host("kube-system", METRICS_HOST);
        kube.set_ingress_host("default", BACKEND_HOST);
        cloud.expect_load_balancer("k8s-kubesyst-ingressf-0a1b2c3d", METRICS_HOST);
        cloud.expect_load_balancer("k8s-default-ingressf-4e5f6a7b", BACKEND_HOST);

        let kubectl = Kubectl::new(kube.clone(), Path::new("kubectl"), &dir.path().join("kc"));
        Harness {
            pipeline: AddOnPipeline::new(ctx.clone(), kubectl),
            ctx,
            cloud,
            kube,
            _dir: dir,
        }
    }

    fn kinds(keys: &[(String, String, String)]) -> Vec<String> {
        keys.iter().map(|(k, _, n)| format!("{}/{}", k, n)).collect()
    }

    // =========================================================================
    // Create
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_all_stages_reach_ready() {
        let h = harness(TestMode::Nginx).await;
        h.pipeline.create().await.unwrap();

        let addon = h.ctx.store.state().addon;
        for stage in Stage::ALL {
            assert_eq!(stage.state(&addon), StageState::Ready, "{}", stage.name());
        }
        assert!(addon.created);
        assert_eq!(addon.dns_names["default"], BACKEND_HOST);
        assert_eq!(addon.dns_names["kube-system"], METRICS_HOST);
        assert_eq!(addon.load_balancer_arns.len(), 2);
        assert!(addon.security_group.created);
        assert!(!h.ctx.store.state().ingress_up_took.is_empty());

        let applied = kinds(&h.kube.applied());
        assert_eq!(applied.first().map(String::as_str), Some("ClusterRole/alb-ingress-controller"));
        assert!(applied.contains(&"ConfigMap/nginx-config".to_string()));
        assert!(applied.last().unwrap().starts_with("Ingress/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_test_server_routes_reach_the_ingress() {
        let h = harness(TestMode::IngressTestServer).await;
        h.pipeline.create().await.unwrap();

        let spec = std::fs::read_to_string(
            &h.ctx.store.config().alb_ingress_controller.ingress_object_spec_path,
        )
        .unwrap();
        assert!(spec.contains("/ingress-test-00001"));
        assert!(spec.contains("/ingress-test-server"));
        assert!(!spec.contains("nginx-service"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_stages_are_skipped() {
        let h = harness(TestMode::Nginx).await;
        h.ctx
            .record(|s| {
                s.addon.rbac = StageState::Ready;
                s.addon.controller = StageState::Ready;
            })
            .unwrap();

        h.pipeline.create().await.unwrap();
        let applied = kinds(&h.kube.applied());
        assert!(!applied.iter().any(|k| k.starts_with("ClusterRole/")));
        assert!(!applied.iter().any(|k| k == "Deployment/alb-ingress-controller"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pods_never_ready_fails_stage() {
        let h = harness(TestMode::Nginx).await;
        h.kube.set_pods_ready(false);

        let err = h.pipeline.create().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let addon = h.ctx.store.state().addon;
        assert_eq!(addon.rbac, StageState::Ready);
        assert_eq!(addon.controller, StageState::Failed);
        assert_eq!(addon.backend, StageState::Init);
        assert!(!addon.last_error.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_mismatch_is_terminal() {
        let h = harness(TestMode::Nginx).await;
        h.kube.set_ingress_host(
            "default",
            "k8s-kubesyst-ingressf-0a1b2c3d-9999.us-west-2.elb.amazonaws.com",
        );

        let err = h.pipeline.create().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CloudTerminal);
        assert_eq!(h.ctx.store.state().addon.ingress, StageState::Failed);
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Story: a full deployment is torn down. Ingress objects go first, the
    /// leaked balancers in the cluster VPC are collected, and the controller
    /// security group is deleted only after them.
    #[tokio::test(start_paused = true)]
    async fn story_teardown_runs_in_reverse() {
        let h = harness(TestMode::Nginx).await;
        h.pipeline.create().await.unwrap();
        h.cloud.add_load_balancer("elsewhere", "elsewhere.elb.amazonaws.com", "vpc-other");

        h.pipeline.delete().await.unwrap();

        let deleted = kinds(&h.kube.deleted());
        assert!(deleted.first().unwrap().starts_with("Ingress/"));
        assert_eq!(deleted.last().map(String::as_str), Some("ClusterRoleBinding/alb-ingress-controller"));
        assert!(h.kube.live_objects().is_empty());
        assert_eq!(h.cloud.elb_counts(), (1, 1, 1));

        let state = h.ctx.store.state();
        assert!(!state.addon.created);
        assert!(!state.addon.security_group.created);
        assert!(state.addon.load_balancer_arns.is_empty());
        for stage in Stage::ALL {
            assert_eq!(stage.state(&state.addon), StageState::DeleteComplete);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_after_partial_create() {
        let h = harness(TestMode::Nginx).await;
        h.kube.set_pods_ready(false);
        h.pipeline.create().await.unwrap_err();

        h.pipeline.delete().await.unwrap();
        let state = h.ctx.store.state();
        assert!(!state.addon.created);
        assert_eq!(state.addon.controller, StageState::DeleteComplete);
        assert_eq!(state.addon.backend, StageState::Init);
        assert!(h.kube.live_objects().is_empty());
    }

    /// Story: the controller security group is still referenced when the
    /// add-on goes away. Its stage stays failed and the add-on stays marked
    /// created; once the reference is gone the retry deletes it and clears
    /// both.
    #[tokio::test(start_paused = true)]
    async fn story_security_group_in_use_is_retried_later() {
        let h = harness(TestMode::Nginx).await;
        h.pipeline.create().await.unwrap();
        h.cloud.set_sg_dependency_violations(u32::MAX);

        h.pipeline.delete().await.unwrap();
        let state = h.ctx.store.state();
        assert!(state.addon.security_group.created);
        assert!(state.addon.created);
        assert_eq!(state.addon.security_group_stage, StageState::Failed);
        assert_eq!(state.addon.ingress, StageState::DeleteComplete);

        let err = h.pipeline.retry_security_group().await.unwrap_err();
        assert!(err.is_dependency_violation());
        assert!(h.ctx.store.state().addon.security_group.created);

        h.cloud.set_sg_dependency_violations(0);
        h.pipeline.retry_security_group().await.unwrap();
        let state = h.ctx.store.state();
        assert!(!state.addon.security_group.created);
        assert!(!state.addon.created);
        assert_eq!(state.addon.security_group_stage, StageState::DeleteComplete);
        assert!(!h
            .cloud
            .live_resources()
            .contains(&"security-group:test-ci-alb-sg".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_security_group_left_by_one_teardown_goes_in_the_next() {
        let h = harness(TestMode::Nginx).await;
        h.pipeline.create().await.unwrap();
        h.cloud.set_sg_dependency_violations(u32::MAX);
        h.pipeline.delete().await.unwrap();

        h.cloud.set_sg_dependency_violations(0);
        h.pipeline.delete().await.unwrap();
        let state = h.ctx.store.state();
        assert!(!state.addon.security_group.created);
        assert!(!state.addon.created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_created_is_a_no_op() {
        let h = harness(TestMode::Nginx).await;
        h.pipeline.delete().await.unwrap();
        assert!(h.kube.deleted().is_empty());
    }
}
