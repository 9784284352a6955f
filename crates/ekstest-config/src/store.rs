//! Layered load and atomic persistence
//!
//! [`Store`] owns the frozen [`Config`] and the live [`ClusterState`]. Every
//! mutation goes through [`Store::update`], which applies the change and
//! rewrites the whole document while holding the lock, so there is exactly
//! one writer and the file on disk never lags a completed step.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use ekstest_common::fs::{write_atomic, MODE_PRIVATE};
use ekstest_common::{Error, Result};
use tracing::{debug, warn};

use crate::config::Config;
use crate::env::update_from_environment;
use crate::state::ClusterState;
use crate::validate::{validate_and_set_defaults, NameSeed};

/// Read a config document from disk
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("read {}", path.display()), e))?;
    let mut cfg: Config = serde_yaml::from_str(&raw)
        .map_err(|e| Error::invalid_config("document", format!("{}: {}", path.display(), e)))?;
    cfg.config_path = path.to_path_buf();
    Ok(cfg)
}

/// Frozen run parameters plus the mutex-guarded state record
#[derive(Debug)]
pub struct Store {
    config: Config,
    state: Mutex<ClusterState>,
}

impl Store {
    /// Load, apply environment overrides, validate and persist
    pub fn open(path: &Path, seed: &NameSeed) -> Result<Self> {
        let mut cfg = load(path)?;
        update_from_environment(&mut cfg)?;
        validate_and_set_defaults(&mut cfg, seed)?;
        let store = Self::new(cfg);
        store.sync()?;
        Ok(store)
    }

    /// Wrap an already validated config
    pub fn new(mut config: Config) -> Self {
        let state = std::mem::take(&mut config.cluster_state);
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Frozen run parameters
    ///
    /// The embedded `cluster_state` is empty; read the record through
    /// [`Store::state`].
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cluster name
    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    /// Where the document is persisted
    pub fn path(&self) -> &PathBuf {
        &self.config.config_path
    }

    /// Snapshot of the state record
    pub fn state(&self) -> ClusterState {
        self.lock().clone()
    }

    /// Mutate the state record and persist it before releasing the lock
    pub fn update<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> Result<R> {
        let mut state = self.lock();
        let out = f(&mut state);
        self.write(&state)?;
        Ok(out)
    }

    /// Persist the current record
    pub fn sync(&self) -> Result<()> {
        let state = self.lock();
        self.write(&state)
    }

    /// Full document as YAML
    pub fn to_yaml(&self) -> Result<String> {
        let state = self.lock();
        self.render(&state)
    }

    fn render(&self, state: &ClusterState) -> Result<String> {
        let mut doc = self.config.clone();
        doc.cluster_state = state.clone();
        Ok(serde_yaml::to_string(&doc)?)
    }

    fn write(&self, state: &ClusterState) -> Result<()> {
        if self.config.config_path.as_os_str().is_empty() {
            debug!("no config path, skipping sync");
            return Ok(());
        }
        let yaml = self.render(state)?;
        write_atomic(&self.config.config_path, yaml.as_bytes(), MODE_PRIVATE)
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("state lock poisoned, continuing with inner value");
            poisoned.into_inner()
        })
    }
}

/// Write a default document (with derived names) to `path`
pub fn create_config(path: &Path, seed: &NameSeed) -> Result<Config> {
    let mut cfg = Config {
        config_path: path.to_path_buf(),
        ..Default::default()
    };
    validate_and_set_defaults(&mut cfg, seed)?;
    let store = Store::new(cfg.clone());
    store.sync()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn seed() -> NameSeed {
        NameSeed {
            user_id: "ci".to_string(),
            hostname: "builder".to_string(),
            now: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_update_persists_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-ci.yaml");
        std::fs::write(&path, "cluster-name: test-ci\n").unwrap();

        let store = Store::open(&path, &seed()).unwrap();
        store
            .update(|s| s.role.handle.mark_created("arn:aws:iam::1:role/x", "CREATED"))
            .unwrap();

        let reloaded = load(&path).unwrap();
        assert!(reloaded.cluster_state.role.handle.created);
        assert_eq!(reloaded.cluster_state.role.handle.name, "test-ci-SERVICE-ROLE");
        assert!(store.config().cluster_state.role.handle.name.is_empty());
    }

    #[test]
    fn test_state_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.yaml");
        create_config(&path, &seed()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load(Path::new("/nonexistent/ekstest.yaml")).unwrap_err();
        assert_eq!(err.kind(), ekstest_common::ErrorKind::Io);
    }

    #[test]
    fn test_malformed_document_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "worker-node-asg-max: [1, 2\n").unwrap();
        let err = load(&path).unwrap_err();
        assert_eq!(err.kind(), ekstest_common::ErrorKind::InvalidConfig);
    }

    /// Story: concurrent sub-steps update disjoint regions; no update is
    /// lost and the document on disk always parses.
    #[test]
    fn story_concurrent_updates_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-ci.yaml");
        let cfg = create_config(&path, &seed()).unwrap();
        let store = Arc::new(Store::new(cfg));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..10 {
                        store
                            .update(|s| {
                                s.worker_logs
                                    .insert(format!("/tmp/{}-{}.log", i, j), format!("k/{}-{}", i, j));
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.state().worker_logs.len(), 80);
        assert_eq!(load(&path).unwrap().cluster_state.worker_logs.len(), 80);
    }
}
