//! `test.yaml` document

use std::collections::BTreeMap;
use std::path::Path;

use ekstest_common::{Error, Result};
use serde::Deserialize;

/// Per-run placeholder substituted in every snippet
pub const TEST_ID_PLACEHOLDER: &str = "{{TEST_ID}}";

/// A suite: the cluster to bring up plus the shell snippets run against it
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    /// Exactly one creator block
    pub cluster: ClusterSpec,
    /// Region used when the creator block does not name one
    pub region: String,
    /// Runs before the cluster exists
    pub build: String,
    /// Runs once the cluster is up
    pub install: String,
    /// Runs after `test`, even when it failed
    pub uninstall: String,
    /// The test itself
    pub test: String,
}

/// Creator selection
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpec {
    /// Self-managed cluster built with `kops`
    pub kops: Option<KopsConfig>,
    /// Managed cluster built with `eksctl`
    pub eks: Option<EksConfig>,
}

/// `cluster.kops`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KopsConfig {
    /// `s3://` state store
    pub state_file: String,
    /// Availability zones
    pub zones: Vec<String>,
    /// Worker count
    pub node_count: u32,
    /// Worker instance type
    pub node_size: String,
    /// Kubernetes version
    pub kubernetes_version: String,
    /// Feature gates set on the kubelet and the API server
    pub feature_gates: BTreeMap<String, String>,
    /// Extra node IAM policy statements, as JSON
    pub iam_policies: Vec<String>,
}

impl Default for KopsConfig {
    fn default() -> Self {
        Self {
            state_file: String::new(),
            zones: Vec::new(),
            node_count: 1,
            node_size: "c5.large".to_string(),
            kubernetes_version: String::new(),
            feature_gates: BTreeMap::new(),
            iam_policies: Vec::new(),
        }
    }
}

/// `cluster.eks`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EksConfig {
    /// Region; falls back to the top-level region
    pub region: String,
    /// Worker count
    pub node_count: u32,
    /// Worker instance type
    pub node_size: String,
    /// Kubernetes version
    pub kubernetes_version: String,
}

impl Default for EksConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            node_count: 1,
            node_size: "m5.large".to_string(),
            kubernetes_version: String::new(),
        }
    }
}

impl TestConfig {
    /// Read and validate a `test.yaml`
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read {}", path.display()), e))?;
        Self::parse(&raw)
    }

    /// Parse and validate a document
    pub fn parse(raw: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(raw)
            .map_err(|e| Error::invalid_config("test-config", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        match (&self.cluster.kops, &self.cluster.eks) {
            (Some(_), Some(_)) => Err(Error::invalid_config(
                "cluster",
                "set exactly one of kops and eks, not both",
            )),
            (None, None) => Err(Error::invalid_config("cluster", "set one of kops or eks")),
            (Some(kops), None) => {
                if kops.state_file.is_empty() {
                    return Err(Error::invalid_config("cluster.kops.stateFile", "must not be empty"));
                }
                if kops.zones.is_empty() {
                    return Err(Error::invalid_config("cluster.kops.zones", "must not be empty"));
                }
                if self.region.is_empty() {
                    return Err(Error::invalid_config("region", "required with kops"));
                }
                Ok(())
            }
            (None, Some(eks)) => {
                if eks.region.is_empty() && self.region.is_empty() {
                    return Err(Error::invalid_config(
                        "cluster.eks.region",
                        "set it or the top-level region",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Replace every `{{TEST_ID}}` in `script`
pub fn substitute_test_id(script: &str, test_id: &str) -> String {
    script.replace(TEST_ID_PLACEHOLDER, test_id)
}
