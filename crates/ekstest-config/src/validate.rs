//! Validation and derived defaults
//!
//! Runs once after loading. Rejects documents the pipeline cannot act on and
//! fills every name and path later steps rely on, so the rest of the harness
//! never has to guess.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ekstest_common::{Error, Result, MAX_CLUSTER_NAME_LEN};
use tracing::info;

use crate::config::{Config, DEFAULT_SERVICE_ROLE_POLICIES};

/// Inputs of cluster-name generation
#[derive(Debug, Clone, PartialEq)]
pub struct NameSeed {
    /// Caller identity (local user or provider user id)
    pub user_id: String,
    /// Local host name
    pub hostname: String,
    /// Generation time
    pub now: DateTime<Utc>,
}

impl NameSeed {
    /// Seed from the local user, host and clock
    pub fn local() -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            user_id: whoami::username(),
            hostname,
            now: Utc::now(),
        }
    }

    /// Generate a cluster name: `<tag|eks>-YYYYMMDDHH-<user><host>`
    ///
    /// The host is appended only when it still has more than five characters
    /// after stripping separators. The result is lowercase, limited to
    /// alphanumerics and `-`, at most 42 characters, and never ends in `-`.
    pub fn generate(&self, tag: &str) -> String {
        let prefix = if tag.is_empty() { "eks" } else { tag };
        let host: String = self
            .hostname
            .chars()
            .filter(|c| !matches!(c, '.' | '-' | '_'))
            .collect();

        let mut suffix = self.user_id.clone();
        if host.len() > 5 {
            suffix.push_str(&host);
        }

        let raw = format!("{}-{}-{}", prefix, self.now.format("%Y%m%d%H"), suffix);
        let mut name: String = raw
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .take(MAX_CLUSTER_NAME_LEN)
            .collect();
        while name.ends_with('-') {
            name.pop();
        }
        name
    }
}

/// Validate `cfg` and fill derived names and paths
pub fn validate_and_set_defaults(cfg: &mut Config, seed: &NameSeed) -> Result<()> {
    if cfg.region.trim().is_empty() {
        return Err(Error::invalid_config("region", "must not be empty"));
    }
    if cfg.kubernetes_version.trim().is_empty() {
        return Err(Error::invalid_config("kubernetes-version", "must not be empty"));
    }
    if cfg.worker_node_instance_type.trim().is_empty() {
        return Err(Error::invalid_config("worker-node-instance-type", "must not be empty"));
    }
    if cfg.worker_node_asg_max == 0 {
        return Err(Error::invalid_config("worker-node-asg-max", "must be at least 1"));
    }
    if cfg.worker_node_asg_min > cfg.worker_node_asg_max {
        return Err(Error::invalid_config(
            "worker-node-asg-min",
            format!(
                "{} exceeds worker-node-asg-max {}",
                cfg.worker_node_asg_min, cfg.worker_node_asg_max
            ),
        ));
    }
    if cfg.worker_node_volume_size_gb == 0 {
        return Err(Error::invalid_config("worker-node-volume-size-gb", "must be at least 1"));
    }
    validate_alb(cfg)?;

    if cfg.cluster_name.is_empty() {
        cfg.cluster_name = seed.generate(&cfg.tag);
        info!(cluster = %cfg.cluster_name, "generated cluster name");
    }
    validate_cluster_name(&cfg.cluster_name)?;

    set_default_paths(cfg);
    set_default_names(cfg);
    Ok(())
}

/// Names must be lowercase alphanumerics and hyphens, at most 42 characters
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(Error::invalid_config(
            "cluster-name",
            format!("{:?} is longer than {} characters", name, MAX_CLUSTER_NAME_LEN),
        ));
    }
    if name.starts_with('-')
        || name.ends_with('-')
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::invalid_config(
            "cluster-name",
            format!("{:?} must be lowercase alphanumerics and '-'", name),
        ));
    }
    Ok(())
}

fn validate_alb(cfg: &Config) -> Result<()> {
    let alb = &cfg.alb_ingress_controller;
    let numerics = [
        ("test-server-replicas", alb.test_server_replicas),
        ("test-server-routes", alb.test_server_routes),
        ("test-clients", alb.test_clients),
        ("test-client-requests", alb.test_client_requests),
        ("test-response-size", alb.test_response_size),
        ("test-client-error-threshold", alb.test_client_error_threshold),
        ("test-scalability-minutes", alb.test_scalability_minutes),
    ];
    for (field, value) in numerics {
        if value < 0 {
            return Err(Error::invalid_config(
                format!("alb-ingress-controller.{}", field),
                format!("must not be negative, got {}", value),
            ));
        }
    }
    if alb.test_expect_qps < 0.0 || !alb.test_expect_qps.is_finite() {
        return Err(Error::invalid_config(
            "alb-ingress-controller.test-expect-qps",
            format!("must be a non-negative number, got {}", alb.test_expect_qps),
        ));
    }
    if !matches!(alb.target_type.as_str(), "instance" | "ip") {
        return Err(Error::invalid_config(
            "alb-ingress-controller.target-type",
            format!("{:?} is neither \"instance\" nor \"ip\"", alb.target_type),
        ));
    }
    Ok(())
}

fn set_default_paths(cfg: &mut Config) {
    let name = cfg.cluster_name.clone();
    if cfg.config_path.as_os_str().is_empty() {
        cfg.config_path = std::env::temp_dir().join(format!("{}.yaml", name));
    }
    let base = cfg.base_dir();
    let or_default = |path: &mut PathBuf, file: String| {
        if path.as_os_str().is_empty() {
            *path = base.join(file);
        }
    };

    or_default(&mut cfg.kubeconfig_path, format!("{}.kubeconfig", name));
    or_default(&mut cfg.worker_node_logs_dir, format!("{}-logs", name));
    if !cfg.kubectl_download_url.is_empty() {
        or_default(&mut cfg.kubectl_path, format!("{}-bin/kubectl", name));
    }
    if !cfg.aws_iam_authenticator_download_url.is_empty() {
        or_default(
            &mut cfg.aws_iam_authenticator_path,
            format!("{}-bin/aws-iam-authenticator", name),
        );
    }
    or_default(
        &mut cfg.cluster_state.key_pair.private_key_path,
        format!("{}.pem", name),
    );

    let alb = &mut cfg.alb_ingress_controller;
    or_default(
        &mut alb.ingress_controller_spec_path,
        format!("{}-alb-controller.yaml", name),
    );
    or_default(
        &mut alb.ingress_test_server_spec_path,
        format!("{}-alb-backend.yaml", name),
    );
    or_default(
        &mut alb.ingress_object_spec_path,
        format!("{}-alb-ingress.yaml", name),
    );
    or_default(
        &mut alb.scalability_output_path,
        format!("{}-alb-scalability.txt", name),
    );
    or_default(&mut alb.metrics_output_path, format!("{}-alb-metrics.txt", name));
}

fn set_default_names(cfg: &mut Config) {
    let name = cfg.cluster_name.clone();
    let state = &mut cfg.cluster_state;
    let or_default = |field: &mut String, value: String| {
        if field.is_empty() {
            *field = value;
        }
    };

    or_default(&mut state.role.handle.name, format!("{}-SERVICE-ROLE", name));
    if state.role.policies.is_empty() {
        state.role.policies = DEFAULT_SERVICE_ROLE_POLICIES
            .iter()
            .map(|p| p.to_string())
            .collect();
    }
    or_default(&mut state.network.handle.name, format!("{}-VPC-STACK", name));
    or_default(&mut state.control_plane.name, name.clone());
    or_default(&mut state.key_pair.handle.name, format!("{}-KEY-PAIR", name));
    or_default(&mut state.worker.stack.name, format!("{}-NODE-GROUP-STACK", name));
    or_default(&mut state.addon.security_group.name, format!("{}-alb-sg", name));
    or_default(&mut state.access_log_bucket.name, format!("{}-access-logs", name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ekstest_common::ErrorKind;
    use rstest::rstest;

    fn seed() -> NameSeed {
        NameSeed {
            user_id: "Leegyuho".to_string(),
            hostname: "ip-10-0-1-5.us-west-2.compute.internal".to_string(),
            now: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
        }
    }

    fn valid() -> Config {
        Config {
            cluster_name: "test-ci".to_string(),
            config_path: PathBuf::from("/var/run/ekstest/test-ci.yaml"),
            ..Default::default()
        }
    }

    // ==========================================================================
    // Name generation
    // ==========================================================================

    #[test]
    fn test_generated_name_is_truncated_and_clean() {
        let name = seed().generate("");
        assert!(name.starts_with("eks-2026031409-leegyuho"));
        assert!(name.len() <= MAX_CLUSTER_NAME_LEN);
        assert!(!name.ends_with('-'));
        validate_cluster_name(&name).unwrap();
    }

    #[test]
    fn test_short_hostname_is_not_appended() {
        let seed = NameSeed {
            hostname: "ci-1".to_string(),
            ..seed()
        };
        assert_eq!(seed.generate("nightly"), "nightly-2026031409-leegyuho");
    }

    #[test]
    fn story_truncation_never_leaves_trailing_hyphen() {
        let seed = NameSeed {
            user_id: "x".repeat(28),
            hostname: String::new(),
            ..seed()
        };
        // the 42nd character is the separator after the tag
        let name = seed.generate("abcdefghijklmnopqrstuvwxyz-0123456789-abc");
        assert!(name.len() <= MAX_CLUSTER_NAME_LEN);
        assert!(!name.ends_with('-'));
    }

    // ==========================================================================
    // Rejections
    // ==========================================================================

    #[rstest]
    #[case::empty_region(|c: &mut Config| c.region.clear(), "region")]
    #[case::empty_instance_type(|c: &mut Config| c.worker_node_instance_type.clear(), "worker-node-instance-type")]
    #[case::zero_asg_max(|c: &mut Config| c.worker_node_asg_max = 0, "worker-node-asg-max")]
    #[case::min_above_max(|c: &mut Config| { c.worker_node_asg_min = 3; c.worker_node_asg_max = 2; }, "worker-node-asg-min")]
    #[case::negative_clients(|c: &mut Config| c.alb_ingress_controller.test_clients = -1, "alb-ingress-controller.test-clients")]
    #[case::negative_threshold(|c: &mut Config| c.alb_ingress_controller.test_client_error_threshold = -5, "alb-ingress-controller.test-client-error-threshold")]
    #[case::negative_qps(|c: &mut Config| c.alb_ingress_controller.test_expect_qps = -1.0, "alb-ingress-controller.test-expect-qps")]
    #[case::uppercase_name(|c: &mut Config| c.cluster_name = "Test-CI".to_string(), "cluster-name")]
    #[case::long_name(|c: &mut Config| c.cluster_name = "a".repeat(43), "cluster-name")]
    fn test_invalid_documents(#[case] mutate: fn(&mut Config), #[case] expected_field: &str) {
        let mut cfg = valid();
        mutate(&mut cfg);
        let err = validate_and_set_defaults(&mut cfg, &seed()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        match err {
            Error::InvalidConfig { field, .. } => assert_eq!(field, expected_field),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_asg_max_one_is_accepted() {
        let mut cfg = valid();
        cfg.worker_node_asg_min = 1;
        cfg.worker_node_asg_max = 1;
        validate_and_set_defaults(&mut cfg, &seed()).unwrap();
    }

    // ==========================================================================
    // Derived defaults
    // ==========================================================================

    #[test]
    fn test_derived_names_and_paths() {
        let mut cfg = valid();
        validate_and_set_defaults(&mut cfg, &seed()).unwrap();
        let state = &cfg.cluster_state;

        assert_eq!(state.role.handle.name, "test-ci-SERVICE-ROLE");
        assert_eq!(state.network.handle.name, "test-ci-VPC-STACK");
        assert_eq!(state.worker.stack.name, "test-ci-NODE-GROUP-STACK");
        assert_eq!(state.key_pair.handle.name, "test-ci-KEY-PAIR");
        assert_eq!(state.addon.security_group.name, "test-ci-alb-sg");
        assert_eq!(state.access_log_bucket.name, "test-ci-access-logs");
        assert_eq!(state.control_plane.name, "test-ci");
        assert_eq!(state.role.policies.len(), 2);

        assert_eq!(
            cfg.kubeconfig_path,
            PathBuf::from("/var/run/ekstest/test-ci.kubeconfig")
        );
        assert_eq!(
            state.key_pair.private_key_path,
            PathBuf::from("/var/run/ekstest/test-ci.pem")
        );
        assert!(cfg.kubectl_path.as_os_str().is_empty());
    }

    #[test]
    fn test_download_url_sets_binary_path() {
        let mut cfg = valid();
        cfg.kubectl_download_url = "https://example.invalid/kubectl".to_string();
        validate_and_set_defaults(&mut cfg, &seed()).unwrap();
        assert_eq!(
            cfg.kubectl_path,
            PathBuf::from("/var/run/ekstest/test-ci-bin/kubectl")
        );
    }

    #[test]
    fn test_empty_name_is_generated() {
        let mut cfg = Config {
            config_path: PathBuf::from("/tmp/x.yaml"),
            ..Default::default()
        };
        validate_and_set_defaults(&mut cfg, &seed()).unwrap();
        assert!(cfg.cluster_name.starts_with("eks-2026031409-"));
    }
}
