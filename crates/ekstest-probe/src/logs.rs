//! Worker-node log collection over SSH
//!
//! Each worker is first asked which systemd services are active and which
//! files live under `/var/log`; every artifact is then captured by its own
//! `ssh` invocation. All invocations share one semaphore so at most
//! `width` sessions are open at a time. A failing capture never stops the
//! others: its error is kept in the [`LogCollection`] and the rest of the
//! files are still written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ekstest_common::exec::{CommandRunner, CommandSpec};
use ekstest_common::fs::{write_atomic, MODE_PRIVATE};
use ekstest_common::poll::until_cancelled;
use ekstest_common::{CancellationToken, Error, Result};
use ekstest_config::WorkerNode;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Concurrent SSH sessions
pub const DEFAULT_WIDTH: usize = 200;

/// Per-session timeout
pub const SSH_TIMEOUT: Duration = Duration::from_secs(30);

const LIST_SERVICES: &str = "sudo systemctl list-units -t service --no-pager --no-legend --all";
const LIST_VAR_LOG: &str = "sudo find /var/log -type f";

/// What was collected: `{local path → object key}` plus every failure
#[derive(Debug, Default)]
pub struct LogCollection {
    /// Written files and their upload keys
    pub files: BTreeMap<String, String>,
    /// Failures, in completion order
    pub errors: Vec<Error>,
}

impl LogCollection {
    /// The first failure, if any
    pub fn first_error(&self) -> Option<&Error> {
        self.errors.first()
    }
}

/// One artifact to capture from one worker
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Short name used in file names and keys
    pub source: String,
    /// Remote shell command printing the artifact
    pub command: String,
}

/// The fixed captures every worker gets
pub fn base_captures() -> Vec<Capture> {
    let capture = |source: &str, command: &str| Capture {
        source: source.to_string(),
        command: command.to_string(),
    };
    vec![
        capture("kube-proxy", "sudo cat /var/log/kube-proxy.log"),
        capture("kernel", "sudo journalctl --no-pager --output=short-precise -k"),
        capture("journal", "sudo journalctl --no-pager --output=short-precise"),
    ]
}

/// Journal captures for active services in `systemctl list-units` output
///
/// Rows look like `kubelet.service loaded active running Kubernetes Kubelet`;
/// units that are not found or inactive are skipped.
pub fn service_captures(list_units: &str) -> Vec<Capture> {
    list_units
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line
                .split_whitespace()
                .filter(|f| *f != "●" && *f != "*")
                .collect();
            match fields.as_slice() {
                [unit, load, active, _, _, ..] if *load != "not-found" && *active != "inactive" => {
                    Some(Capture {
                        source: unit.to_string(),
                        command: format!("sudo journalctl --no-pager --output=cat -u {}", unit),
                    })
                }
                _ => None,
            }
        })
        .collect()
}

/// File captures for `find /var/log -type f` output
pub fn file_captures(listing: &str) -> Vec<Capture> {
    listing
        .lines()
        .map(str::trim)
        .filter(|p| p.starts_with("/var/log/") && *p != "/var/log/kube-proxy.log")
        .map(|path| Capture {
            source: source_name(path),
            command: format!("sudo cat '{}'", path.replace('\'', r"'\''")),
        })
        .collect()
}

fn source_name(path: &str) -> String {
    path.trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '-' })
        .collect()
}

/// Fans SSH captures out over every worker
#[derive(Clone)]
pub struct LogCollector {
    runner: Arc<dyn CommandRunner>,
    key_path: PathBuf,
    user: String,
    out_dir: PathBuf,
    cluster_name: String,
    width: usize,
}

impl std::fmt::Debug for LogCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCollector")
            .field("key_path", &self.key_path)
            .field("user", &self.user)
            .field("out_dir", &self.out_dir)
            .field("width", &self.width)
            .finish()
    }
}

impl LogCollector {
    /// Collector writing into `out_dir`, authenticating with `key_path`
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        key_path: &Path,
        out_dir: &Path,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            key_path: key_path.to_path_buf(),
            user: "ec2-user".to_string(),
            out_dir: out_dir.to_path_buf(),
            cluster_name: cluster_name.into(),
            width: DEFAULT_WIDTH,
        }
    }

    /// Limit concurrent sessions
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width.max(1);
        self
    }

    /// `ssh` invocation running `command` on `ip`
    pub fn ssh(&self, ip: &str, command: &str) -> CommandSpec {
        CommandSpec::new("ssh")
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "BatchMode=yes",
                "-i",
            ])
            .arg(self.key_path.display().to_string())
            .arg(format!("{}@{}", self.user, ip))
            .arg(command)
            .timeout(SSH_TIMEOUT)
    }

    /// Local file for one capture
    pub fn local_path(&self, id: &str, ip: &str, source: &str) -> PathBuf {
        self.out_dir.join(format!("{}-{}.{}.log", id, ip, source))
    }

    /// Upload key for one capture
    pub fn object_key(&self, id: &str, ip: &str, source: &str) -> String {
        format!("{}/{}-{}/{}.log", self.cluster_name, id, ip, source)
    }

    async fn remote(&self, ip: &str, command: &str) -> Result<String> {
        let spec = self.ssh(ip, command);
        let out = self.runner.run(spec.clone()).await?.check(&spec, false)?;
        Ok(out.stdout)
    }

    /// Everything to capture from one worker
    async fn plan(&self, ip: &str) -> (Vec<Capture>, Vec<Error>) {
        let mut captures = base_captures();
        let mut errors = Vec::new();
        match self.remote(ip, LIST_SERVICES).await {
            Ok(out) => captures.extend(service_captures(&out)),
            Err(e) => errors.push(e),
        }
        match self.remote(ip, LIST_VAR_LOG).await {
            Ok(out) => captures.extend(file_captures(&out)),
            Err(e) => errors.push(e),
        }
        (captures, errors)
    }

    async fn capture(&self, id: &str, ip: &str, capture: &Capture) -> Result<(String, String)> {
        let out = self.remote(ip, &capture.command).await?;
        let path = self.local_path(id, ip, &capture.source);
        write_atomic(&path, out.as_bytes(), MODE_PRIVATE)?;
        debug!(instance = id, source = %capture.source, path = %path.display(), "captured");
        Ok((
            path.display().to_string(),
            self.object_key(id, ip, &capture.source),
        ))
    }

    /// Capture every artifact from every worker
    ///
    /// Only cancellation is returned as an error; per-capture failures are
    /// reported in the collection.
    pub async fn collect(
        &self,
        workers: &BTreeMap<String, WorkerNode>,
        cancel: &CancellationToken,
    ) -> Result<LogCollection> {
        let mut collection = LogCollection::default();
        if workers.is_empty() {
            info!("no workers recorded; nothing to collect");
            return Ok(collection);
        }

        let gate = Arc::new(Semaphore::new(self.width));
        let mut planned = JoinSet::new();
        for (id, node) in workers {
            if node.public_ip.is_empty() {
                collection.errors.push(Error::internal_with_context(
                    "collect-logs",
                    format!("worker {} has no public IP", id),
                ));
                continue;
            }
            let this = self.clone();
            let gate = gate.clone();
            let id = id.clone();
            let ip = node.public_ip.clone();
            planned.spawn(async move {
                let _permit = gate.acquire_owned().await;
                let (captures, errors) = this.plan(&ip).await;
                (id, ip, captures, errors)
            });
        }

        let mut captures = JoinSet::new();
        let drained = until_cancelled("collect-logs", cancel, async {
            while let Some(joined) = planned.join_next().await {
                let (id, ip, list, errors) = joined
                    .map_err(|e| Error::internal_with_context("collect-logs", e.to_string()))?;
                collection.errors.extend(errors);
                info!(instance = %id, ip = %ip, captures = list.len(), "collecting worker logs");
                for capture in list {
                    let this = self.clone();
                    let gate = gate.clone();
                    let id = id.clone();
                    let ip = ip.clone();
                    captures.spawn(async move {
                        let _permit = gate.acquire_owned().await;
                        this.capture(&id, &ip, &capture).await
                    });
                }
            }
            while let Some(joined) = captures.join_next().await {
                match joined {
                    Ok(Ok((path, key))) => {
                        collection.files.insert(path, key);
                    }
                    Ok(Err(e)) => collection.errors.push(e),
                    Err(e) => collection
                        .errors
                        .push(Error::internal_with_context("collect-logs", e.to_string())),
                }
            }
            Ok::<(), Error>(())
        })
        .await;

        if let Err(e) = drained {
            planned.abort_all();
            captures.abort_all();
            return Err(e);
        }

        if !collection.errors.is_empty() {
            warn!(
                failures = collection.errors.len(),
                first = %collection.errors[0],
                "some worker logs could not be collected"
            );
        }
        info!(files = collection.files.len(), workers = workers.len(), "worker logs collected");
        Ok(collection)
    }
}
