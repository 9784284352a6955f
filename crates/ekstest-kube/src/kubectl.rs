//! `kubectl` driver
//!
//! Every call is `kubectl --kubeconfig=<credential-file> <args...>` through a
//! [`CommandRunner`], so tests can swap in a scripted cluster. Waits use the
//! shared poll kernel at a 5 second interval.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ekstest_common::exec::{CommandOutput, CommandRunner, CommandSpec};
use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::{CancellationToken, Result};
use tracing::{debug, info};

use crate::views::{self, NodeView, PodView};
use crate::KUBECTL_POLL_INTERVAL;

/// Reply fragment that marks the control plane as serving
const RUNNING_MARKER: &str = "is running";

/// Runs `kubectl` against one cluster
#[derive(Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
    kubeconfig: PathBuf,
    env: Vec<(String, String)>,
    debug: bool,
    interval: Duration,
}

impl std::fmt::Debug for Kubectl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kubectl")
            .field("binary", &self.binary)
            .field("kubeconfig", &self.kubeconfig)
            .finish_non_exhaustive()
    }
}

impl Kubectl {
    /// Create a driver for the given binary and credential file
    pub fn new(runner: Arc<dyn CommandRunner>, binary: &Path, kubeconfig: &Path) -> Self {
        Self {
            runner,
            binary: binary.to_path_buf(),
            kubeconfig: kubeconfig.to_path_buf(),
            env: Vec::new(),
            debug: false,
            interval: KUBECTL_POLL_INTERVAL,
        }
    }

    /// Extra environment for every invocation (the staged `PATH`)
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Surface full command output in errors
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Credential file passed to every call
    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.binary.display().to_string())
            .arg(format!("--kubeconfig={}", self.kubeconfig.display()))
            .args(args)
            .envs(self.env.clone())
    }

    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let out = self.runner.run(spec.clone()).await?;
        out.check(&spec, self.debug)
    }

    /// Run an arbitrary subcommand and return stdout
    pub async fn exec<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.run(self.spec(args)).await?.stdout)
    }

    /// `kubectl apply -f -`
    pub async fn apply(&self, yaml: &str) -> Result<()> {
        let out = self.run(self.spec(["apply", "-f", "-"]).stdin(yaml)).await?;
        debug!(output = %out.stdout.trim(), "applied");
        Ok(())
    }

    /// `kubectl apply -f <url>`
    pub async fn apply_url(&self, url: &str) -> Result<()> {
        self.run(self.spec(["apply", "-f", url])).await?;
        info!(url, "applied remote manifest");
        Ok(())
    }

    /// `kubectl delete --ignore-not-found -f -`
    pub async fn delete(&self, yaml: &str) -> Result<()> {
        self.run(
            self.spec(["delete", "--ignore-not-found=true", "-f", "-"])
                .stdin(yaml),
        )
        .await?;
        Ok(())
    }

    /// All nodes; an unrecognised reply is an empty list
    pub async fn get_nodes(&self) -> Result<Vec<NodeView>> {
        let out = self.exec(["get", "nodes", "-o", "json"]).await?;
        Ok(views::parse_nodes(&out))
    }

    /// Pods of a namespace
    pub async fn get_pods(&self, namespace: &str) -> Result<Vec<PodView>> {
        let out = self
            .exec(["get", "pods", "--namespace", namespace, "-o", "json"])
            .await?;
        Ok(views::parse_pods(&out))
    }

    /// Load-balancer hostname of the ingress routing to `service`
    pub async fn get_ingress_host(&self, namespace: &str, service: &str) -> Result<Option<String>> {
        let out = self
            .exec(["get", "ingress", "--namespace", namespace, "-o", "json"])
            .await?;
        Ok(views::parse_ingress_host(&out, service))
    }

    /// `kubectl version`
    pub async fn version(&self) -> Result<String> {
        self.exec(["version"]).await
    }

    /// `kubectl cluster-info`
    pub async fn cluster_info(&self) -> Result<String> {
        self.exec(["cluster-info"]).await
    }

    /// Poll until the ingress routing to `service` has a real hostname
    pub async fn wait_host_ready(
        &self,
        namespace: &str,
        service: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let spec = PollSpec::new(
            format!("wait-ingress-host/{}/{}", namespace, service),
            self.interval,
            deadline,
        );
        let host = poll(&spec, cancel, || async {
            match self.get_ingress_host(namespace, service).await? {
                Some(host) => Ok(Attempt::Done(host)),
                None => Ok(Attempt::Retry("ingress hostname not assigned".to_string())),
            }
        })
        .await?;
        info!(namespace, service, host = %host, "ingress host ready");
        Ok(host)
    }

    /// Poll until `expected` nodes report `Ready=True`
    pub async fn wait_nodes_ready(
        &self,
        expected: usize,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<NodeView>> {
        let spec = PollSpec::new("wait-nodes-ready", self.interval, deadline);
        let nodes = poll(&spec, cancel, || async {
            let nodes = self.get_nodes().await?;
            let ready = nodes.iter().filter(|n| n.ready).count();
            if ready >= expected {
                Ok(Attempt::Done(nodes))
            } else {
                Ok(Attempt::Retry(format!(
                    "{} of {} nodes ready ({} registered)",
                    ready,
                    expected,
                    nodes.len()
                )))
            }
        })
        .await?;
        info!(expected, "worker nodes ready");
        Ok(nodes)
    }

    /// Poll until at least `min` pods named `<prefix>...` are ready
    pub async fn wait_pods_ready(
        &self,
        namespace: &str,
        prefix: &str,
        min: usize,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<PodView>> {
        let spec = PollSpec::new(
            format!("wait-pods/{}/{}", namespace, prefix),
            self.interval,
            deadline,
        );
        poll(&spec, cancel, || async {
            let pods: Vec<PodView> = self
                .get_pods(namespace)
                .await?
                .into_iter()
                .filter(|p| p.name.starts_with(prefix))
                .collect();
            let ready = pods.iter().filter(|p| p.ready).count();
            if ready >= min.max(1) {
                Ok(Attempt::Done(pods))
            } else {
                Ok(Attempt::Retry(format!(
                    "{} of {} pods with prefix {} ready",
                    ready, min, prefix
                )))
            }
        })
        .await
    }

    /// Poll `version` and `cluster-info` until the control plane reports it
    /// is running
    pub async fn wait_control_plane_ready(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = PollSpec::new("wait-control-plane-api", self.interval, deadline);
        poll(&spec, cancel, || async {
            let version = self.version().await?;
            debug!(version = %version.trim(), "kubectl version");
            let info = self.cluster_info().await?;
            if info.contains(RUNNING_MARKER) {
                Ok(Attempt::Done(()))
            } else {
                Ok(Attempt::Retry("cluster-info does not report running".to_string()))
            }
        })
        .await?;
        info!("control plane API is serving");
        Ok(())
    }
}
