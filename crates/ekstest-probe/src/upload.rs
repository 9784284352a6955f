//! Artifact upload
//!
//! Everything leaves the machine through an [`Uploader`]. The harness always
//! wraps the object-store uploader in a [`GuardedUploader`] that knows the
//! key-pair private key path and refuses it, whatever key it is asked to
//! store it under.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ekstest_cloud::api::ObjectStore;
use ekstest_common::{Error, Result};
use tracing::{info, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

/// Object-store URL of an uploaded artifact
pub fn gen_s3_url(region: &str, bucket: &str, key: &str) -> String {
    format!("https://s3-{}.amazonaws.com/{}/{}", region, bucket, key)
}

/// Default key for a top-level artifact: `<cluster-name>/<basename>`
pub fn artifact_key(cluster_name: &str, path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}/{}", cluster_name, base)
}

/// Stores a local file under a key
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `path` as `key`
    async fn upload(&self, path: &Path, key: &str) -> Result<()>;
}

/// Uploads into one bucket of the provider's object store
#[derive(Clone)]
pub struct S3Uploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    region: String,
}

impl std::fmt::Debug for S3Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Uploader")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish()
    }
}

impl S3Uploader {
    /// Uploader for `bucket` in `region`
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            region: region.into(),
        }
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    async fn upload(&self, path: &Path, key: &str) -> Result<()> {
        self.store.put_object(&self.bucket, key, path).await?;
        info!(
            path = %path.display(),
            url = %gen_s3_url(&self.region, &self.bucket, key),
            "uploaded"
        );
        Ok(())
    }
}

/// Refuses to upload any of a fixed set of secret files
pub struct GuardedUploader {
    inner: Arc<dyn Uploader>,
    forbidden: Vec<PathBuf>,
}

impl std::fmt::Debug for GuardedUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedUploader")
            .field("forbidden", &self.forbidden)
            .finish()
    }
}

fn normalise(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl GuardedUploader {
    /// Wrap `inner`, refusing every path in `forbidden`
    pub fn new(inner: Arc<dyn Uploader>, forbidden: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            inner,
            forbidden: forbidden
                .into_iter()
                .filter(|p| !p.as_os_str().is_empty())
                .collect(),
        }
    }

    /// True when `path` names a forbidden file
    pub fn is_forbidden(&self, path: &Path) -> bool {
        let candidate = normalise(path);
        self.forbidden
            .iter()
            .any(|f| f == path || normalise(f) == candidate)
    }
}

#[async_trait]
impl Uploader for GuardedUploader {
    async fn upload(&self, path: &Path, key: &str) -> Result<()> {
        if self.is_forbidden(path) {
            warn!(path = %path.display(), "refusing to upload secret file");
            return Err(Error::internal_with_context(
                "upload",
                format!("{} is a private key and is never uploaded", path.display()),
            ));
        }
        self.inner.upload(path, key).await
    }
}

/// Upload every `{local path → key}` pair; all are attempted
pub async fn upload_all<'a, I>(uploader: &dyn Uploader, files: I) -> Result<usize>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut errors = Vec::new();
    let mut uploaded = 0;
    for (path, key) in files {
        match uploader.upload(Path::new(path), key).await {
            Ok(()) => uploaded += 1,
            Err(e) => errors.push(e),
        }
    }
    match Error::teardown(errors) {
        Some(e) => Err(e),
        None => Ok(uploaded),
    }
}
