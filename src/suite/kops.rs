//! Self-managed clusters through `kops`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ekstest_common::exec::CommandSpec;
use ekstest_common::fs::is_executable;
use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::{CancellationToken, Error, Result};
use ekstest_kube::provisioner::{BinarySpec, Provisioner};
use futures::FutureExt;
use serde_yaml::{Mapping, Value};
use tracing::info;

use super::config::KopsConfig;
use super::{ClusterCreator, FnStep, Step, SuiteContext};

const KOPS_DOWNLOAD_URL: &str =
    "https://github.com/kubernetes/kops/releases/download/v1.28.4/kops-linux-amd64";

/// Budget for `validate cluster` to pass
pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const VALIDATE_INTERVAL: Duration = Duration::from_secs(30);
const KOPS_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Merge feature gates and node IAM policies into a `kops get cluster -o yaml`
/// document
///
/// Gates land on both the kubelet and the API server. Each policy is a JSON
/// statement, or an array of statements; all of them end up in one array
/// under `spec.additionalPolicies.node`.
pub fn patch_cluster_spec(
    doc: &str,
    feature_gates: &std::collections::BTreeMap<String, String>,
    iam_policies: &[String],
) -> Result<String> {
    let mut cluster: Value = serde_yaml::from_str(doc)?;
    let spec = child(&mut cluster, "spec")?;

    if !feature_gates.is_empty() {
        for component in ["kubelet", "kubeAPIServer"] {
            let gates = child(child(spec, component)?, "featureGates")?;
            let Value::Mapping(gates) = gates else {
                return Err(Error::serialization(format!("{}.featureGates is not a map", component)));
            };
            for (gate, value) in feature_gates {
                gates.insert(Value::from(gate.as_str()), Value::from(value.as_str()));
            }
        }
    }

    if !iam_policies.is_empty() {
        let mut statements = Vec::new();
        for policy in iam_policies {
            match serde_json::from_str::<serde_json::Value>(policy)? {
                serde_json::Value::Array(items) => statements.extend(items),
                statement => statements.push(statement),
            }
        }
        let policies = child(spec, "additionalPolicies")?;
        let Value::Mapping(policies) = policies else {
            return Err(Error::serialization("additionalPolicies is not a map"));
        };
        policies.insert(
            Value::from("node"),
            Value::from(serde_json::to_string(&statements)?),
        );
    }

    Ok(serde_yaml::to_string(&cluster)?)
}

/// Mapping entry `key` of `value`, created empty when absent
fn child<'a>(value: &'a mut Value, key: &str) -> Result<&'a mut Value> {
    let Value::Mapping(map) = value else {
        return Err(Error::serialization(format!("expected a map around {}", key)));
    };
    Ok(map
        .entry(Value::from(key))
        .or_insert_with(|| Value::Mapping(Mapping::new())))
}

struct Kops {
    cfg: KopsConfig,
    region: String,
    ctx: SuiteContext,
    name: String,
    binary: PathBuf,
    ssh_key: PathBuf,
}

impl Kops {
    fn command(&self) -> CommandSpec {
        CommandSpec::new(self.binary.display().to_string())
            .env("AWS_REGION", &self.region)
            .env("KUBECONFIG", self.ctx.kubeconfig().display().to_string())
            .timeout(KOPS_TIMEOUT)
    }

    fn cluster_command(&self, verb: &[&str]) -> CommandSpec {
        self.command()
            .args(verb.iter().copied())
            .arg("--name")
            .arg(&self.name)
            .arg("--state")
            .arg(&self.cfg.state_file)
    }

    async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        if !is_executable(&self.binary) {
            let spec = BinarySpec {
                name: "kops".to_string(),
                path: self.binary.clone(),
                download_url: KOPS_DOWNLOAD_URL.to_string(),
                sha256: String::new(),
            };
            Provisioner::new()?.ensure(&spec).await?;
        }

        if !self.ssh_key.exists() {
            let keygen = CommandSpec::new("ssh-keygen")
                .args(["-t", "rsa", "-b", "4096", "-N", "", "-q", "-f"])
                .arg(self.ssh_key.display().to_string());
            self.ctx.exec(keygen, cancel).await?;
            info!(path = %self.ssh_key.display(), "generated SSH key");
        }
        Ok(())
    }

    async fn up(&self, cancel: &CancellationToken) -> Result<()> {
        let public_key = self.ssh_key.with_extension("pub");
        let create = self
            .cluster_command(&["create", "cluster"])
            .arg("--zones")
            .arg(self.cfg.zones.join(","))
            .arg("--node-count")
            .arg(self.cfg.node_count.to_string())
            .arg("--node-size")
            .arg(&self.cfg.node_size)
            .arg("--ssh-public-key")
            .arg(public_key.display().to_string());
        let create = if self.cfg.kubernetes_version.is_empty() {
            create
        } else {
            create
                .arg("--kubernetes-version")
                .arg(&self.cfg.kubernetes_version)
        };
        self.ctx.exec(create, cancel).await?;

        if !self.cfg.feature_gates.is_empty() || !self.cfg.iam_policies.is_empty() {
            let current = self
                .ctx
                .exec(self.cluster_command(&["get", "cluster"]).args(["-o", "yaml"]), cancel)
                .await?;
            let patched = patch_cluster_spec(&current, &self.cfg.feature_gates, &self.cfg.iam_policies)?;
            let replace = self
                .command()
                .args(["replace", "--state"])
                .arg(&self.cfg.state_file)
                .args(["-f", "-"])
                .stdin(patched);
            self.ctx.exec(replace, cancel).await?;
        }

        self.ctx
            .exec(self.cluster_command(&["update", "cluster"]).arg("--yes"), cancel)
            .await?;
        self.ctx
            .exec(self.cluster_command(&["export", "kubecfg"]).arg("--admin"), cancel)
            .await?;

        let spec = PollSpec::new(
            format!("kops-validate/{}", self.name),
            VALIDATE_INTERVAL,
            VALIDATE_TIMEOUT,
        );
        poll(&spec, cancel, || async {
            let validate = self.cluster_command(&["validate", "cluster"]);
            let out = self.ctx.runner.run(validate).await?;
            if out.success() {
                Ok(Attempt::Done(()))
            } else {
                Ok(Attempt::Retry(out.combined().lines().last().unwrap_or("").to_string()))
            }
        })
        .await?;
        info!(cluster = %self.name, "kops cluster validated");
        Ok(())
    }

    async fn tear_down(&self, cancel: &CancellationToken) -> Result<()> {
        self.ctx
            .exec(self.cluster_command(&["delete", "cluster"]).arg("--yes"), cancel)
            .await?;
        Ok(())
    }
}

/// Creator running `kops` against an `s3://` state store
#[derive(Clone)]
pub struct KopsCreator {
    inner: Arc<Kops>,
}

impl std::fmt::Debug for KopsCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KopsCreator")
            .field("name", &self.inner.name)
            .field("state", &self.inner.cfg.state_file)
            .finish()
    }
}

impl KopsCreator {
    /// Creator for a cluster named `<test-id>.k8s.local`
    pub fn new(cfg: KopsConfig, region: String, ctx: SuiteContext) -> Self {
        let name = format!("{}.k8s.local", ctx.test_id);
        let binary = ctx.bin("kops");
        let ssh_key = ctx.workdir.join("id_rsa");
        Self {
            inner: Arc::new(Kops {
                cfg,
                region,
                ctx,
                name,
                binary,
                ssh_key,
            }),
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn step<F, Fut>(&self, name: &'static str, f: F) -> Box<dyn Step>
    where
        F: Fn(Arc<Kops>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let inner = self.inner.clone();
        Box::new(FnStep::new(name, move |cancel| f(inner.clone(), cancel).boxed()))
    }
}

impl ClusterCreator for KopsCreator {
    fn init(&self) -> Box<dyn Step> {
        self.step("kops-init", |k, cancel| async move { k.init(&cancel).await })
    }

    fn up(&self) -> Box<dyn Step> {
        self.step("kops-up", |k, cancel| async move { k.up(&cancel).await })
    }

    fn tear_down(&self) -> Box<dyn Step> {
        self.step("kops-tear-down", |k, cancel| async move { k.tear_down(&cancel).await })
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![
            (
                "KUBECONFIG".to_string(),
                self.inner.ctx.kubeconfig().display().to_string(),
            ),
            ("AWS_REGION".to_string(), self.inner.region.clone()),
            ("CLUSTER_NAME".to_string(), self.inner.name.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekstest_common::exec::{CommandOutput, MockCommandRunner};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const CLUSTER: &str = r#"apiVersion: kops.k8s.io/v1alpha2
kind: Cluster
metadata:
  name: abc123xy.k8s.local
spec:
  kubelet:
    anonymousAuth: false
  kubernetesVersion: 1.29.3
"#;

    #[test]
    fn test_patch_adds_gates_and_policies() {
        let gates = BTreeMap::from([("EphemeralContainers".to_string(), "true".to_string())]);
        let policies = vec![
            r#"{"Effect":"Allow","Action":["s3:GetObject"],"Resource":["*"]}"#.to_string(),
            r#"[{"Effect":"Allow","Action":["ec2:Describe*"],"Resource":["*"]}]"#.to_string(),
        ];
        let patched = patch_cluster_spec(CLUSTER, &gates, &policies).unwrap();
        let doc: Value = serde_yaml::from_str(&patched).unwrap();

        let spec = &doc["spec"];
        assert_eq!(spec["kubelet"]["anonymousAuth"], Value::from(false));
        assert_eq!(spec["kubelet"]["featureGates"]["EphemeralContainers"], Value::from("true"));
        assert_eq!(spec["kubeAPIServer"]["featureGates"]["EphemeralContainers"], Value::from("true"));

        let node = spec["additionalPolicies"]["node"].as_str().unwrap();
        let statements: Vec<serde_json::Value> = serde_json::from_str(node).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1]["Action"][0], "ec2:Describe*");
    }

    #[test]
    fn test_patch_without_changes_keeps_document() {
        let patched = patch_cluster_spec(CLUSTER, &BTreeMap::new(), &[]).unwrap();
        let before: Value = serde_yaml::from_str(CLUSTER).unwrap();
        let after: Value = serde_yaml::from_str(&patched).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_bad_policy_is_rejected() {
        assert!(patch_cluster_spec(CLUSTER, &BTreeMap::new(), &["not json".to_string()]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn story_up_creates_patches_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let calls: Arc<Mutex<Vec<String>>> = Arc::default();
        let validations = Arc::new(Mutex::new(0u32));

        let mut runner = MockCommandRunner::new();
        let journal = calls.clone();
        let counter = validations.clone();
        runner.expect_run().returning(move |spec| {
            let verb = spec.args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
            journal.lock().unwrap().push(verb.clone());
            match verb.as_str() {
                "get cluster" => Ok(CommandOutput::ok(CLUSTER)),
                "replace --state" => {
                    assert!(spec.stdin.as_deref().unwrap().contains("featureGates"));
                    Ok(CommandOutput::ok(""))
                }
                "validate cluster" => {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    if *n < 3 {
                        Ok(CommandOutput::failed(2, "Validation Failed\nnodes not ready"))
                    } else {
                        Ok(CommandOutput::ok("Your cluster abc123xy.k8s.local is ready\n"))
                    }
                }
                _ => Ok(CommandOutput::ok("")),
            }
        });

        let ctx = SuiteContext {
            runner: Arc::new(runner),
            http: reqwest::Client::new(),
            workdir: dir.path().to_path_buf(),
            test_id: "abc123xy".to_string(),
        };
        let cfg = KopsConfig {
            state_file: "s3://kops-state".to_string(),
            zones: vec!["us-west-2a".to_string()],
            feature_gates: BTreeMap::from([("EphemeralContainers".to_string(), "true".to_string())]),
            ..Default::default()
        };
        let creator = KopsCreator::new(cfg, "us-west-2".to_string(), ctx);
        assert_eq!(creator.name(), "abc123xy.k8s.local");

        creator.up().run(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "create cluster",
                "get cluster",
                "replace --state",
                "update cluster",
                "export kubecfg",
                "validate cluster",
                "validate cluster",
                "validate cluster",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_never_passing_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            if spec.has_arg("validate") {
                Ok(CommandOutput::failed(2, "Validation Failed"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });
        let ctx = SuiteContext {
            runner: Arc::new(runner),
            http: reqwest::Client::new(),
            workdir: dir.path().to_path_buf(),
            test_id: "abc123xy".to_string(),
        };
        let cfg = KopsConfig {
            state_file: "s3://kops-state".to_string(),
            zones: vec!["us-west-2a".to_string()],
            ..Default::default()
        };
        let err = KopsCreator::new(cfg, "us-west-2".to_string(), ctx)
            .up()
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ekstest_common::ErrorKind::Timeout);
    }
}
