//! Simplified views over `kubectl get -o json` replies
//!
//! Parsers never fail: an unrecognised document or item yields an empty or
//! partial view and the caller's poll loop simply tries again.

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::networking::v1::Ingress;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// One cluster node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeView {
    /// Node name
    pub name: String,
    /// `Ready` condition is `True`
    pub ready: bool,
    /// `InternalIP` address
    pub internal_ip: String,
    /// `ExternalIP` address
    pub external_ip: String,
}

/// One pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodView {
    /// Pod name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Pod phase (`Running`, `Pending`, ...)
    pub phase: String,
    /// `Ready` condition is `True`
    pub ready: bool,
}

/// Typed items of a list reply, skipping anything that does not decode
fn items<T: DeserializeOwned>(doc: &str) -> Vec<T> {
    let value: Value = match serde_json::from_str(doc) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "unparsable kubectl reply");
            return Vec::new();
        }
    };
    let list = match value.get("items") {
        Some(Value::Array(items)) => items.clone(),
        _ if value.get("kind").is_some() => vec![value],
        _ => return Vec::new(),
    };
    list.into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

/// Parse `kubectl get nodes -o json`
pub fn parse_nodes(doc: &str) -> Vec<NodeView> {
    items::<Node>(doc)
        .into_iter()
        .map(|node| {
            let status = node.status.unwrap_or_default();
            let ready = status
                .conditions
                .unwrap_or_default()
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True");
            let addresses = status.addresses.unwrap_or_default();
            let address = |kind: &str| {
                addresses
                    .iter()
                    .find(|a| a.type_ == kind)
                    .map(|a| a.address.clone())
                    .unwrap_or_default()
            };
            NodeView {
                name: node.metadata.name.clone().unwrap_or_default(),
                ready,
                internal_ip: address("InternalIP"),
                external_ip: address("ExternalIP"),
            }
        })
        .collect()
}

/// Parse `kubectl get pods -o json`
pub fn parse_pods(doc: &str) -> Vec<PodView> {
    items::<Pod>(doc)
        .into_iter()
        .map(|pod| {
            let status = pod.status.unwrap_or_default();
            let ready = status
                .conditions
                .unwrap_or_default()
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True");
            PodView {
                name: pod.metadata.name.unwrap_or_default(),
                namespace: pod.metadata.namespace.unwrap_or_default(),
                phase: status.phase.unwrap_or_default(),
                ready,
            }
        })
        .collect()
}

/// Hostname of the ingress routing to `service`, if assigned
///
/// An empty or wildcard hostname means the load balancer is not there yet.
pub fn parse_ingress_host(doc: &str, service: &str) -> Option<String> {
    items::<Ingress>(doc).into_iter().find_map(|ingress| {
        if !routes_to(&ingress, service) {
            return None;
        }
        let host = ingress
            .status?
            .load_balancer?
            .ingress?
            .into_iter()
            .next()?
            .hostname?;
        (!host.is_empty() && host != "*").then_some(host)
    })
}

fn routes_to(ingress: &Ingress, service: &str) -> bool {
    let Some(spec) = ingress.spec.as_ref() else {
        return false;
    };
    let default_backend = spec
        .default_backend
        .as_ref()
        .and_then(|b| b.service.as_ref())
        .is_some_and(|s| s.name == service);
    let rule_backend = spec.rules.iter().flatten().any(|rule| {
        rule.http.iter().any(|http| {
            http.paths
                .iter()
                .any(|p| p.backend.service.as_ref().is_some_and(|s| s.name == service))
        })
    });
    default_backend || rule_backend
}

/// Load-balancer name encoded in an ingress hostname
///
/// `a1b2-default-ingressf-39ce-1234.us-west-2.elb.amazonaws.com` names the
/// balancer `a1b2-default-ingressf-39ce`: the first four `-`-separated parts.
pub fn load_balancer_name(host: &str) -> Option<String> {
    let parts: Vec<&str> = host.split('-').collect();
    if parts.len() < 5 {
        return None;
    }
    Some(parts[..4].join("-"))
}
