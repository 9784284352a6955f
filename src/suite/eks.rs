//! Managed clusters through `eksctl`

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ekstest_common::exec::CommandSpec;
use ekstest_common::fs::{is_executable, write_atomic, MODE_EXECUTABLE};
use ekstest_common::poll::until_cancelled;
use ekstest_common::{CancellationToken, Error, Result};
use flate2::read::GzDecoder;
use futures::FutureExt;
use tracing::info;

use super::config::EksConfig;
use super::{ClusterCreator, FnStep, Step, SuiteContext};

const EKSCTL_DOWNLOAD_URL: &str =
    "https://github.com/eksctl-io/eksctl/releases/latest/download/eksctl_Linux_amd64.tar.gz";

const EKSCTL_TIMEOUT: Duration = Duration::from_secs(40 * 60);

/// Write the entry named `name` of a gzipped tarball to `dest`, executable
pub fn extract_binary(archive: &[u8], name: &str, dest: &Path) -> Result<()> {
    let io = |e: std::io::Error| Error::io(format!("unpack {}", name), e);
    let mut tarball = tar::Archive::new(GzDecoder::new(archive));
    for entry in tarball.entries().map_err(io)? {
        let mut entry = entry.map_err(io)?;
        let matches = entry
            .path()
            .map_err(io)?
            .file_name()
            .is_some_and(|f| f == name);
        if !matches {
            continue;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(io)?;
        write_atomic(dest, &contents, MODE_EXECUTABLE)?;
        info!(binary = name, path = %dest.display(), bytes = contents.len(), "unpacked");
        return Ok(());
    }
    Err(Error::missing_binary(name, "not found in the downloaded archive"))
}

struct Eksctl {
    cfg: EksConfig,
    ctx: SuiteContext,
    name: String,
    binary: PathBuf,
}

impl Eksctl {
    fn command(&self, verb: &[&str]) -> CommandSpec {
        CommandSpec::new(self.binary.display().to_string())
            .args(verb.iter().copied())
            .arg("--name")
            .arg(&self.name)
            .arg("--region")
            .arg(&self.cfg.region)
            .timeout(EKSCTL_TIMEOUT)
    }

    async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        if is_executable(&self.binary) {
            info!(path = %self.binary.display(), "using existing eksctl");
            return Ok(());
        }
        info!(url = EKSCTL_DOWNLOAD_URL, "downloading eksctl");
        let fail = |e: reqwest::Error| Error::missing_binary("eksctl", format!("download failed: {}", e));
        let body = until_cancelled("download-eksctl", cancel, async {
            let resp = self
                .ctx
                .http
                .get(EKSCTL_DOWNLOAD_URL)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(fail)?;
            resp.bytes().await.map_err(fail)
        })
        .await?;
        extract_binary(&body, "eksctl", &self.binary)
    }

    async fn up(&self, cancel: &CancellationToken) -> Result<()> {
        let mut create = self
            .command(&["create", "cluster"])
            .arg("--nodes")
            .arg(self.cfg.node_count.to_string())
            .arg("--node-type")
            .arg(&self.cfg.node_size)
            .arg("--kubeconfig")
            .arg(self.ctx.kubeconfig().display().to_string());
        if !self.cfg.kubernetes_version.is_empty() {
            create = create.arg("--version").arg(&self.cfg.kubernetes_version);
        }
        self.ctx.exec(create, cancel).await?;
        info!(cluster = %self.name, "eksctl cluster created");
        Ok(())
    }

    async fn tear_down(&self, cancel: &CancellationToken) -> Result<()> {
        self.ctx
            .exec(self.command(&["delete", "cluster"]).arg("--wait"), cancel)
            .await?;
        Ok(())
    }
}

/// Creator running `eksctl`
#[derive(Clone)]
pub struct EksctlCreator {
    inner: Arc<Eksctl>,
}

impl std::fmt::Debug for EksctlCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EksctlCreator")
            .field("name", &self.inner.name)
            .field("region", &self.inner.cfg.region)
            .finish()
    }
}

impl EksctlCreator {
    /// Creator for a cluster named `ekstest-<test-id>`
    pub fn new(cfg: EksConfig, ctx: SuiteContext) -> Self {
        let name = format!("ekstest-{}", ctx.test_id);
        let binary = ctx.bin("eksctl");
        Self {
            inner: Arc::new(Eksctl {
                cfg,
                ctx,
                name,
                binary,
            }),
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn step<F, Fut>(&self, name: &'static str, f: F) -> Box<dyn Step>
    where
        F: Fn(Arc<Eksctl>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let inner = self.inner.clone();
        Box::new(FnStep::new(name, move |cancel| f(inner.clone(), cancel).boxed()))
    }
}

impl ClusterCreator for EksctlCreator {
    fn init(&self) -> Box<dyn Step> {
        self.step("eksctl-init", |e, cancel| async move { e.init(&cancel).await })
    }

    fn up(&self) -> Box<dyn Step> {
        self.step("eksctl-up", |e, cancel| async move { e.up(&cancel).await })
    }

    fn tear_down(&self) -> Box<dyn Step> {
        self.step("eksctl-tear-down", |e, cancel| async move { e.tear_down(&cancel).await })
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![
            (
                "KUBECONFIG".to_string(),
                self.inner.ctx.kubeconfig().display().to_string(),
            ),
            ("AWS_REGION".to_string(), self.inner.cfg.region.clone()),
            ("CLUSTER_NAME".to_string(), self.inner.name.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekstest_common::exec::{CommandOutput, MockCommandRunner};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::os::unix::fs::PermissionsExt;

    fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_extracts_named_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(&[("LICENSE", b"license"), ("eksctl", b"#!/bin/sh\necho eksctl\n")]);
        let dest = dir.path().join("bin/eksctl");

        extract_binary(&archive, "eksctl", &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"#!/bin/sh\necho eksctl\n");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, MODE_EXECUTABLE);
    }

    #[test]
    fn test_missing_entry_is_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(&[("README.md", b"readme")]);
        let err = extract_binary(&archive, "eksctl", &dir.path().join("eksctl")).unwrap_err();
        assert_eq!(err.kind(), ekstest_common::ErrorKind::MissingBinary);
    }

    #[tokio::test]
    async fn test_up_and_tear_down_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.has_arg("create"))
            .times(1)
            .returning(|spec| {
                let args = spec.args.join(" ");
                assert!(args.contains("--name ekstest-abc123xy --region us-east-1"));
                assert!(args.contains("--nodes 2 --node-type m5.xlarge"));
                assert!(args.contains("--version 1.29"));
                Ok(CommandOutput::ok(""))
            });
        runner
            .expect_run()
            .withf(|spec| spec.has_arg("delete"))
            .times(1)
            .returning(|spec| {
                assert!(spec.has_arg("--wait"));
                Ok(CommandOutput::ok(""))
            });

        let ctx = SuiteContext {
            runner: Arc::new(runner),
            http: reqwest::Client::new(),
            workdir: dir.path().to_path_buf(),
            test_id: "abc123xy".to_string(),
        };
        let cfg = EksConfig {
            region: "us-east-1".to_string(),
            node_count: 2,
            node_size: "m5.xlarge".to_string(),
            kubernetes_version: "1.29".to_string(),
        };
        let creator = EksctlCreator::new(cfg, ctx);
        let cancel = CancellationToken::new();
        creator.up().run(&cancel).await.unwrap();
        creator.tear_down().run(&cancel).await.unwrap();
        assert!(creator
            .env()
            .iter()
            .any(|(k, v)| k == "CLUSTER_NAME" && v == "ekstest-abc123xy"));
    }
}
