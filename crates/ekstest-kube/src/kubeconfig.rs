//! Cluster credential file
//!
//! The file is a pure function of the control-plane endpoint, its CA data,
//! the cluster name and the identity-exchange helper path. It is regenerated
//! whenever those change and written with mode 0600.

use std::path::{Path, PathBuf};

use ekstest_common::fs::{write_atomic, MODE_PRIVATE};
use ekstest_common::{Error, Result};
use kube::config::Kubeconfig;
use minijinja::{context, Environment};
use tracing::info;

/// API version of the exec credential plugin
pub const EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1alpha1";

const TEMPLATE: &str = r#"apiVersion: v1
kind: Config
preferences: {}
clusters:
- name: "{{ cluster_name }}"
  cluster:
    server: "{{ endpoint }}"
    certificate-authority-data: "{{ certificate_authority }}"
contexts:
- name: aws
  context:
    cluster: "{{ cluster_name }}"
    user: aws
current-context: aws
users:
- name: aws
  user:
    exec:
      apiVersion: {{ api_version }}
      command: "{{ authenticator }}"
      args:
      - token
      - -i
      - "{{ cluster_name }}"
"#;

/// Inputs the credential file is derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialParams {
    /// API server URL
    pub endpoint: String,
    /// Base64 certificate-authority data
    pub certificate_authority: String,
    /// Cluster name passed to the token helper
    pub cluster_name: String,
    /// Identity-exchange helper binary
    pub authenticator_path: PathBuf,
}

/// Render the credential document
pub fn render(params: &CredentialParams) -> Result<String> {
    if params.endpoint.is_empty() || params.certificate_authority.is_empty() {
        return Err(Error::internal_with_context(
            "kubeconfig",
            "control plane endpoint and CA data are required",
        ));
    }
    let env = Environment::new();
    env.render_str(
        TEMPLATE,
        context! {
            cluster_name => &params.cluster_name,
            endpoint => &params.endpoint,
            certificate_authority => &params.certificate_authority,
            api_version => EXEC_API_VERSION,
            authenticator => params.authenticator_path.display().to_string(),
        },
    )
    .map_err(|e| Error::internal_with_context("kubeconfig", e.to_string()))
}

/// Recover the inputs from a credential document
pub fn parse(doc: &str) -> Result<CredentialParams> {
    let kc = Kubeconfig::from_yaml(doc).map_err(|e| Error::serialization(e.to_string()))?;

    let named = kc
        .clusters
        .first()
        .ok_or_else(|| Error::serialization("kubeconfig has no clusters"))?;
    let cluster = named
        .cluster
        .as_ref()
        .ok_or_else(|| Error::serialization("kubeconfig cluster entry is empty"))?;
    let exec = kc
        .auth_infos
        .first()
        .and_then(|a| a.auth_info.as_ref())
        .and_then(|a| a.exec.as_ref())
        .ok_or_else(|| Error::serialization("kubeconfig user has no exec block"))?;

    let args = exec.args.clone().unwrap_or_default();
    let cluster_name = match args.as_slice() {
        [token, flag, name] if token == "token" && flag == "-i" => name.clone(),
        _ => {
            return Err(Error::serialization(format!(
                "unexpected exec args {:?}",
                args
            )))
        }
    };

    Ok(CredentialParams {
        endpoint: cluster.server.clone().unwrap_or_default(),
        certificate_authority: cluster.certificate_authority_data.clone().unwrap_or_default(),
        cluster_name,
        authenticator_path: PathBuf::from(exec.command.clone().unwrap_or_default()),
    })
}

/// Render and atomically write the credential file
pub fn write(path: &Path, params: &CredentialParams) -> Result<()> {
    let doc = render(params)?;
    write_atomic(path, doc.as_bytes(), MODE_PRIVATE)?;
    info!(path = %path.display(), cluster = %params.cluster_name, "wrote kubeconfig");
    Ok(())
}
