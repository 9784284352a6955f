use std::path::{Path, PathBuf};
use std::sync::Arc;

use ekstest_common::{CancellationToken, Error, Result};
use ekstest_probe::upload::{artifact_key, upload_all};
use ekstest_probe::{GuardedUploader, LogCollection, LogCollector, S3Uploader, Uploader};
use tracing::{debug, info, warn};

use super::Tester;

impl Tester {
    /// Capture logs from every recorded worker into the logs directory
    ///
    /// The resulting file-to-key map replaces the one in the record.
    /// Only cancellation is an error; unreachable workers end up in the
    /// collection's error list.
    pub async fn collect_worker_logs(&self, cancel: &CancellationToken) -> Result<LogCollection> {
        let state = self.store.state();
        let cfg = self.config();
        let collector = LogCollector::new(
            self.host_runner.clone(),
            &state.key_pair.private_key_path,
            &cfg.worker_node_logs_dir,
            cfg.cluster_name.clone(),
        );
        let collection = collector.collect(&state.worker.nodes, cancel).await?;
        let files = collection.files.clone();
        self.store.update(|s| s.worker_logs = files)?;
        info!(
            files = collection.files.len(),
            errors = collection.errors.len(),
            "worker logs collected"
        );
        Ok(collection)
    }

    /// Uploader in front of the artifact destination, if there is one
    ///
    /// The key-pair private key is always refused.
    pub fn uploader(&self) -> Option<GuardedUploader> {
        let cfg = self.config();
        let inner: Arc<dyn Uploader> = match &self.uploader {
            Some(u) => u.clone(),
            None if !cfg.artifact_bucket.is_empty() => Arc::new(S3Uploader::new(
                self.cloud.s3.clone(),
                cfg.artifact_bucket.clone(),
                cfg.region.clone(),
            )),
            None => return None,
        };
        let key = self.store.state().key_pair.private_key_path;
        Some(GuardedUploader::new(inner, vec![key]))
    }

    /// Upload the artifacts whose upload flags are set
    pub async fn upload_artifacts(&self) -> Result<()> {
        let Some(uploader) = self.uploader() else {
            debug!("no artifact destination configured");
            return Ok(());
        };
        let cfg = self.config();
        let mut errors = Vec::new();

        if cfg.upload_worker_node_logs {
            let logs = self.store.state().worker_logs;
            match upload_all(&uploader, &logs).await {
                Ok(n) => info!(files = n, "uploaded worker logs"),
                Err(e) => errors.push(e),
            }
        }

        let mut files: Vec<PathBuf> = Vec::new();
        if cfg.upload_tester_logs {
            if let Err(e) = self.store.sync() {
                errors.push(e);
            }
            files.push(cfg.config_path.clone());
            files.push(cfg.alb_ingress_controller.scalability_output_path.clone());
            files.push(cfg.alb_ingress_controller.metrics_output_path.clone());
        }
        if cfg.upload_kubeconfig {
            files.push(cfg.kubeconfig_path.clone());
        }
        for path in files.iter().filter(|p| p.is_file()) {
            let key = artifact_key(&cfg.cluster_name, path);
            if let Err(e) = uploader.upload(path, &key).await {
                warn!(path = %path.display(), error = %e, "artifact upload failed");
                errors.push(e);
            }
        }

        match Error::teardown(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Collect worker logs and copy them, plus the config document, into `dir`
    pub async fn dump_cluster_logs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let collection = self.collect_worker_logs(&self.cancel).await?;
        if let Some(e) = collection.first_error() {
            warn!(error = %e, "some worker logs were not collected");
        }
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;

        self.store.sync()?;
        let sources = collection
            .files
            .keys()
            .map(PathBuf::from)
            .chain(std::iter::once(self.store.path().clone()));

        let mut copied = Vec::new();
        for src in sources {
            let Some(name) = src.file_name() else {
                continue;
            };
            let dst = dir.join(name);
            std::fs::copy(&src, &dst).map_err(|e| {
                Error::io(format!("copy {} to {}", src.display(), dst.display()), e)
            })?;
            copied.push(dst);
        }
        info!(dir = %dir.display(), files = copied.len(), "dumped cluster logs");
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{config, harness};
    use ekstest_common::exec::{CommandOutput, MockCommandRunner};
    use ekstest_config::WorkerNode;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn worker(ip: &str) -> WorkerNode {
        WorkerNode {
            public_ip: ip.to_string(),
            ..Default::default()
        }
    }

    /// Same line for every command; listings then yield no extra captures
    fn ssh_runner() -> MockCommandRunner {
        let mut ssh = MockCommandRunner::new();
        ssh.expect_run()
            .returning(|_| Ok(CommandOutput::ok("log line\n")));
        ssh
    }

    #[tokio::test]
    async fn test_dump_copies_logs_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(config(dir.path())).await;
        h.tester
            .store()
            .update(|s| {
                s.worker.nodes.insert("i-0abc".to_string(), worker("54.0.0.10"));
            })
            .unwrap();
        let tester = h.tester.with_host_runner(Arc::new(ssh_runner()));

        let out = dir.path().join("artifacts");
        let copied = tester.dump_cluster_logs(&out).await.unwrap();

        assert!(copied.contains(&out.join("test-ci.yaml")));
        assert!(copied.iter().any(|p| p
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("i-0abc-54.0.0.10.")));
        assert!(!tester.store().state().worker_logs.is_empty());
    }

    #[tokio::test]
    async fn test_private_key_is_never_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.upload_worker_node_logs = true;
        cfg.upload_tester_logs = true;
        cfg.artifact_bucket = "artifacts".to_string();
        let h = harness(cfg).await;

        let key = h.tester.store().state().key_pair.private_key_path;
        std::fs::write(&key, "PRIVATE").unwrap();
        let log = dir.path().join("i-0abc-54.0.0.10.journal.log");
        std::fs::write(&log, "log").unwrap();
        h.tester
            .store()
            .update(|s| {
                s.worker_logs.insert(
                    log.to_string_lossy().into_owned(),
                    "test-ci/i-0abc-54.0.0.10/journal.log".to_string(),
                );
                s.worker_logs.insert(
                    key.to_string_lossy().into_owned(),
                    "test-ci/test-ci.pem".to_string(),
                );
            })
            .unwrap();

        assert!(h.tester.upload_artifacts().await.is_err());
        let uploaded: Vec<PathBuf> = h.cloud.uploads().into_iter().map(|(_, _, p)| p).collect();
        assert!(uploaded.contains(&log));
        assert!(uploaded.contains(&h.tester.config().config_path));
        assert!(!uploaded.contains(&key));
    }

    #[tokio::test]
    async fn test_no_destination_uploads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.upload_tester_logs = true;
        let h = harness(cfg).await;
        assert!(h.tester.uploader().is_none());
        h.tester.upload_artifacts().await.unwrap();
        assert!(h.cloud.uploads().is_empty());
    }
}
