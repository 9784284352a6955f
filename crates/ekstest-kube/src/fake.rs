//! In-memory `kubectl` double
//!
//! Interprets the subcommands the driver issues against a small object
//! store: `apply`/`delete` record documents, `get nodes|pods|ingress` render
//! k8s-openapi objects from that store, `version` and `cluster-info` answer
//! as a healthy control plane. Knobs let tests stall nodes, pods and ingress
//! hostnames.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ekstest_common::exec::{CommandOutput, CommandRunner, CommandSpec};
use ekstest_common::Result;
use k8s_openapi::api::core::v1::{
    Node, NodeAddress, NodeCondition, NodeStatus, Pod, PodCondition, PodStatus,
};
use k8s_openapi::api::networking::v1::{
    Ingress, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::{json, Value};

/// Key of a stored object
pub type ObjectKey = (String, String, String);

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    applied: Vec<ObjectKey>,
    deleted: Vec<ObjectKey>,
    applied_urls: Vec<String>,
    node_count: usize,
    nodes_ready: bool,
    pods_ready: bool,
    ingress_hosts: BTreeMap<String, String>,
    calls: Vec<CommandSpec>,
}

/// Scripted cluster answering `kubectl` invocations
#[derive(Debug)]
pub struct FakeKubectl {
    state: Mutex<State>,
}

impl Default for FakeKubectl {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKubectl {
    /// Healthy cluster with no nodes and pods that become ready at once
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                nodes_ready: true,
                pods_ready: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of registered nodes and whether they report `Ready=True`
    pub fn set_nodes(&self, count: usize, ready: bool) {
        let mut s = self.lock();
        s.node_count = count;
        s.nodes_ready = ready;
    }

    /// Whether pods of applied deployments report `Ready=True`
    pub fn set_pods_ready(&self, ready: bool) {
        self.lock().pods_ready = ready;
    }

    /// Hostname reported by every ingress in `namespace`
    pub fn set_ingress_host(&self, namespace: &str, host: &str) {
        self.lock()
            .ingress_hosts
            .insert(namespace.to_string(), host.to_string());
    }

    /// `(kind, namespace, name)` of every applied object, in order
    pub fn applied(&self) -> Vec<ObjectKey> {
        self.lock().applied.clone()
    }

    /// `(kind, namespace, name)` of every deleted object, in order
    pub fn deleted(&self) -> Vec<ObjectKey> {
        self.lock().deleted.clone()
    }

    /// Remote manifests applied by URL
    pub fn applied_urls(&self) -> Vec<String> {
        self.lock().applied_urls.clone()
    }

    /// Objects still present
    pub fn live_objects(&self) -> Vec<ObjectKey> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Every invocation seen
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.lock().calls.clone()
    }

    fn handle(&self, spec: &CommandSpec) -> CommandOutput {
        let mut s = self.lock();
        s.calls.push(spec.clone());

        let args: Vec<&str> = spec
            .args
            .iter()
            .map(String::as_str)
            .filter(|a| !a.starts_with("--kubeconfig="))
            .collect();
        let namespace = flag_value(&args, "--namespace").unwrap_or("default");

        match args.as_slice() {
            ["apply", "-f", "-", ..] => {
                let docs = documents(spec.stdin.as_deref().unwrap_or_default());
                for (key, doc) in docs {
                    s.applied.push(key.clone());
                    s.objects.insert(key, doc);
                }
                CommandOutput::ok("configured\n")
            }
            ["apply", "-f", url, ..] => {
                s.applied_urls.push(url.to_string());
                CommandOutput::ok("configured\n")
            }
            ["delete", ..] => {
                let docs = documents(spec.stdin.as_deref().unwrap_or_default());
                for (key, _) in docs {
                    s.objects.remove(&key);
                    s.deleted.push(key);
                }
                CommandOutput::ok("deleted\n")
            }
            ["get", "nodes", ..] => list(nodes(&s)),
            ["get", "pods", ..] => list(pods(&s, namespace)),
            ["get", "ingress", ..] => list(ingresses(&s, namespace)),
            ["version", ..] => CommandOutput::ok("Client Version: v1.29.0\nServer Version: v1.29.3-eks\n"),
            ["cluster-info", ..] => CommandOutput::ok(
                "Kubernetes control plane is running at https://fake.eks.amazonaws.com\nCoreDNS is running at https://fake.eks.amazonaws.com/api/v1/namespaces/kube-system/services/kube-dns:dns/proxy\n",
            ),
            _ => CommandOutput::failed(1, format!("fake kubectl: unsupported {:?}", args)),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeKubectl {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        Ok(self.handle(&spec))
    }
}

fn flag_value<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == flag)
        .and_then(|i| args.get(i + 1).copied())
}

fn documents(stream: &str) -> Vec<(ObjectKey, Value)> {
    serde_yaml::Deserializer::from_str(stream)
        .filter_map(|doc| Value::deserialize(doc).ok())
        .filter(|v| v.is_object())
        .map(|v| {
            let kind = v["kind"].as_str().unwrap_or_default().to_string();
            let ns = v["metadata"]["namespace"]
                .as_str()
                .unwrap_or("default")
                .to_string();
            let name = v["metadata"]["name"].as_str().unwrap_or_default().to_string();
            ((kind, ns, name), v)
        })
        .collect()
}

fn list(items: Vec<Value>) -> CommandOutput {
    CommandOutput::ok(json!({"apiVersion": "v1", "kind": "List", "items": items}).to_string())
}

fn condition_status(ready: bool) -> String {
    if ready { "True" } else { "False" }.to_string()
}

fn nodes(s: &State) -> Vec<Value> {
    (0..s.node_count)
        .map(|i| {
            let node = Node {
                metadata: ObjectMeta {
                    name: Some(format!("ip-192-168-1-{}.us-west-2.compute.internal", 10 + i)),
                    ..Default::default()
                },
                status: Some(NodeStatus {
                    conditions: Some(vec![NodeCondition {
                        type_: "Ready".to_string(),
                        status: condition_status(s.nodes_ready),
                        ..Default::default()
                    }]),
                    addresses: Some(vec![NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: format!("192.168.1.{}", 10 + i),
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            };
            serde_json::to_value(node).unwrap_or_default()
        })
        .collect()
}

fn pods(s: &State, namespace: &str) -> Vec<Value> {
    s.objects
        .iter()
        .filter(|((kind, ns, _), _)| kind == "Deployment" && ns == namespace)
        .flat_map(|((_, ns, name), doc)| {
            let replicas = doc["spec"]["replicas"].as_u64().unwrap_or(1);
            (0..replicas).map(move |i| {
                let pod = Pod {
                    metadata: ObjectMeta {
                        name: Some(format!("{}-5d9c7b-{:05}", name, i)),
                        namespace: Some(ns.clone()),
                        ..Default::default()
                    },
                    status: Some(PodStatus {
                        phase: Some(if s.pods_ready { "Running" } else { "Pending" }.to_string()),
                        conditions: Some(vec![PodCondition {
                            type_: "Ready".to_string(),
                            status: condition_status(s.pods_ready),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                serde_json::to_value(pod).unwrap_or_default()
            })
        })
        .collect()
}

fn ingresses(s: &State, namespace: &str) -> Vec<Value> {
    s.objects
        .iter()
        .filter(|((kind, ns, _), _)| kind == "Ingress" && ns == namespace)
        .filter_map(|(_, doc)| {
            let mut ingress: Ingress = serde_json::from_value(doc.clone()).ok()?;
            let host = s.ingress_hosts.get(namespace).cloned().unwrap_or_default();
            ingress.status = Some(IngressStatus {
                load_balancer: Some(IngressLoadBalancerStatus {
                    ingress: Some(vec![IngressLoadBalancerIngress {
                        hostname: Some(host),
                        ..Default::default()
                    }]),
                }),
            });
            serde_json::to_value(ingress).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kubectl(args: &[&str]) -> CommandSpec {
        CommandSpec::new("kubectl")
            .arg("--kubeconfig=/tmp/kc")
            .args(args.iter().copied())
    }

    #[tokio::test]
    async fn test_apply_then_delete_tracks_objects() {
        let fake = FakeKubectl::new();
        let yaml = "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: alb-ingress\n  namespace: kube-system\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: nginx\nspec:\n  replicas: 2\n";
        fake.run(kubectl(&["apply", "-f", "-"]).stdin(yaml)).await.unwrap();
        assert_eq!(fake.live_objects().len(), 2);

        let out = fake.run(kubectl(&["get", "pods", "--namespace", "default", "-o", "json"])).await.unwrap();
        assert_eq!(crate::views::parse_pods(&out.stdout).len(), 2);

        fake.run(kubectl(&["delete", "--ignore-not-found=true", "-f", "-"]).stdin(yaml))
            .await
            .unwrap();
        assert!(fake.live_objects().is_empty());
        assert_eq!(fake.deleted().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_subcommand_fails() {
        let fake = FakeKubectl::new();
        let out = fake.run(kubectl(&["drain", "node-1"])).await.unwrap();
        assert!(!out.success());
    }
}
