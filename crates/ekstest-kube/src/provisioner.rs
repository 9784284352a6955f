//! Binary provisioner
//!
//! Installs `kubectl` and the identity-exchange helper. With a download URL
//! the binary is streamed to its configured path, optionally checked against
//! a SHA-256 digest, and made executable. Without one, the configured path or
//! the first executable match on `PATH` is used. The directories of every
//! resolved binary are staged in front of `PATH` for child processes only;
//! the harness never mutates its own environment.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ekstest_common::fs::{ensure_parent, is_executable, set_mode, MODE_EXECUTABLE};
use ekstest_common::{Error, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Name of the cluster-API client
pub const KUBECTL: &str = "kubectl";

/// Name of the identity-exchange helper
pub const AUTHENTICATOR: &str = "aws-iam-authenticator";

/// Overall budget for one download
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Log a progress line every this many bytes when the size is unknown
const PROGRESS_STEP: u64 = 8 * 1024 * 1024;

/// Where a binary comes from and where it should end up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinarySpec {
    /// Executable name searched on `PATH`
    pub name: String,
    /// Install path; also checked before searching `PATH`
    pub path: PathBuf,
    /// Download URL; empty means use a pre-installed copy
    pub download_url: String,
    /// Expected hex SHA-256 of the download; empty skips the check
    pub sha256: String,
}

impl BinarySpec {
    /// Spec for `name` with no download
    pub fn preinstalled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Resolved absolute paths of the provisioned binaries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toolchain {
    binaries: BTreeMap<String, PathBuf>,
}

impl Toolchain {
    /// Resolved path of `name`
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.binaries.get(name).map(PathBuf::as_path)
    }

    /// Resolved path of `name` or a missing-binary error
    pub fn require(&self, name: &str) -> Result<&Path> {
        self.get(name)
            .ok_or_else(|| Error::missing_binary(name, "not provisioned"))
    }

    /// Record a resolved binary
    pub fn insert(&mut self, name: impl Into<String>, path: PathBuf) {
        self.binaries.insert(name.into(), path);
    }

    /// `PATH` value with every binary directory in front of `base`
    pub fn path_env(&self, base: &OsStr) -> OsString {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for path in self.binaries.values() {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                if !dirs.iter().any(|d| d == dir) {
                    dirs.push(dir.to_path_buf());
                }
            }
        }
        dirs.extend(std::env::split_paths(base));
        std::env::join_paths(dirs).unwrap_or_else(|_| base.to_os_string())
    }

    /// Environment pair staging the binaries for child processes
    pub fn child_env(&self) -> Vec<(String, String)> {
        let base = std::env::var_os("PATH").unwrap_or_default();
        vec![(
            "PATH".to_string(),
            self.path_env(&base).to_string_lossy().into_owned(),
        )]
    }
}

/// Downloads or locates required binaries
#[derive(Debug, Clone)]
pub struct Provisioner {
    client: reqwest::Client,
    search_path: OsString,
}

impl Provisioner {
    /// Provisioner searching the process `PATH`
    pub fn new() -> Result<Self> {
        Self::with_search_path(std::env::var_os("PATH").unwrap_or_default())
    }

    /// Provisioner searching an explicit `PATH` value
    pub fn with_search_path(search_path: OsString) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("provisioner", e.to_string()))?;
        Ok(Self {
            client,
            search_path,
        })
    }

    /// Resolve every spec, failing on the first unusable binary
    pub async fn provision(&self, specs: &[BinarySpec]) -> Result<Toolchain> {
        let mut toolchain = Toolchain::default();
        for spec in specs {
            let path = self.ensure(spec).await?;
            toolchain.insert(spec.name.clone(), path);
        }
        Ok(toolchain)
    }

    /// Resolve one binary
    pub async fn ensure(&self, spec: &BinarySpec) -> Result<PathBuf> {
        if !spec.download_url.is_empty() {
            if spec.path.as_os_str().is_empty() {
                return Err(Error::missing_binary(
                    &spec.name,
                    "download URL set without an install path",
                ));
            }
            self.download(spec).await?;
            if !is_executable(&spec.path) {
                return Err(Error::missing_binary(
                    &spec.name,
                    format!("{} is not executable after install", spec.path.display()),
                ));
            }
            return Ok(spec.path.clone());
        }

        if !spec.path.as_os_str().is_empty() && is_executable(&spec.path) {
            debug!(binary = %spec.name, path = %spec.path.display(), "using configured binary");
            return Ok(spec.path.clone());
        }

        match search_path(&spec.name, &self.search_path) {
            Some(found) => {
                info!(binary = %spec.name, path = %found.display(), "found binary on PATH");
                Ok(found)
            }
            None => Err(Error::missing_binary(
                &spec.name,
                "no download URL configured and not found on PATH",
            )),
        }
    }

    async fn download(&self, spec: &BinarySpec) -> Result<()> {
        info!(binary = %spec.name, url = %spec.download_url, path = %spec.path.display(), "downloading");
        let fail = |msg: String| Error::missing_binary(&spec.name, msg);

        let response = self
            .client
            .get(&spec.download_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fail(format!("download failed: {}", e)))?;
        let total = response.content_length();

        ensure_parent(&spec.path)?;
        let tmp = spec.path.with_extension("download");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::io(format!("create {}", tmp.display()), e))?;

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut next_report = PROGRESS_STEP;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fail(format!("download interrupted: {}", e)))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io(format!("write {}", tmp.display()), e))?;
            written += chunk.len() as u64;

            if written >= next_report {
                match total {
                    Some(total) if total > 0 => info!(
                        binary = %spec.name,
                        percent = written * 100 / total,
                        bytes = written,
                        "download progress"
                    ),
                    _ => info!(binary = %spec.name, bytes = written, "download progress"),
                }
                next_report += PROGRESS_STEP;
            }
        }
        file.sync_all()
            .await
            .map_err(|e| Error::io(format!("sync {}", tmp.display()), e))?;
        drop(file);

        let digest = hex::encode(hasher.finalize());
        if !spec.sha256.is_empty() && !digest.eq_ignore_ascii_case(spec.sha256.trim()) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(fail(format!(
                "checksum mismatch: expected {}, got {}",
                spec.sha256, digest
            )));
        }

        set_mode(&tmp, MODE_EXECUTABLE)?;
        tokio::fs::rename(&tmp, &spec.path)
            .await
            .map_err(|e| Error::io(format!("install {}", spec.path.display()), e))?;
        info!(binary = %spec.name, bytes = written, sha256 = %digest, "installed");
        Ok(())
    }
}

/// First executable named `name` in a `PATH`-style list
pub fn search_path(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}
