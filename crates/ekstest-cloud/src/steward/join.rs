//! Worker join
//!
//! Nodes only register once the cluster maps their instance role to the
//! node groups. The mapping lives in the `aws-auth` config map in
//! `kube-system`; after applying it we wait for every worker to report
//! `Ready=True`.

use std::collections::BTreeMap;

use ekstest_common::{Error, Result};
use ekstest_config::WorkerNode;
use ekstest_kube::{Kubectl, NodeView};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use tracing::info;

use super::StewardContext;

#[derive(Serialize)]
struct RoleMapping<'a> {
    rolearn: &'a str,
    username: &'a str,
    groups: [&'a str; 2],
}

/// `aws-auth` config map granting `role_arn` node membership
pub fn aws_auth_config_map(role_arn: &str) -> Result<String> {
    let roles = serde_yaml::to_string(&[RoleMapping {
        rolearn: role_arn,
        username: "system:node:{{EC2PrivateDNSName}}",
        groups: ["system:bootstrappers", "system:nodes"],
    }])?;
    aws_auth(Some(BTreeMap::from([("mapRoles".to_string(), roles)])))
}

fn aws_auth(data: Option<BTreeMap<String, String>>) -> Result<String> {
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some("aws-auth".to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        data,
        ..Default::default()
    };
    let mut doc = serde_yaml::to_value(&cm)?;
    if let Some(map) = doc.as_mapping_mut() {
        map.insert("apiVersion".into(), "v1".into());
        map.insert("kind".into(), "ConfigMap".into());
    }
    Ok(serde_yaml::to_string(&doc)?)
}

/// Apply the role mapping and wait for `asg-max` ready nodes
pub async fn join_workers(ctx: &StewardContext, kubectl: &Kubectl) -> Result<Vec<NodeView>> {
    let role_arn = ctx.store.state().worker.instance_role_arn;
    if role_arn.is_empty() {
        return Err(Error::internal_with_context(
            "join-workers",
            "worker instance role is unknown; the worker stack has not completed",
        ));
    }

    kubectl.apply(&aws_auth_config_map(&role_arn)?).await?;
    info!(role = %role_arn, "applied node role mapping");

    let expected = ctx.store.config().worker_node_asg_max as usize;
    let nodes = kubectl
        .wait_nodes_ready(expected, ctx.timeouts.join, &ctx.cancel)
        .await?;
    ctx.record(|s| mark_ready(&mut s.worker.nodes, &nodes))?;
    info!(nodes = nodes.len(), "workers joined");
    Ok(nodes)
}

/// Delete the node role mapping; a missing map is not an error
pub async fn remove_node_role_mapping(kubectl: &Kubectl) -> Result<()> {
    kubectl.delete(&aws_auth(None)?).await?;
    info!("removed node role mapping");
    Ok(())
}

/// Set each worker's ready flag from the node it registered as
fn mark_ready(workers: &mut BTreeMap<String, WorkerNode>, nodes: &[NodeView]) {
    for worker in workers.values_mut() {
        worker.ready = nodes.iter().any(|n| {
            n.ready
                && ((!worker.private_ip.is_empty() && n.internal_ip == worker.private_ip)
                    || (!worker.private_dns.is_empty() && n.name == worker.private_dns))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steward::testutil::context;
    use ekstest_common::ErrorKind;
    use ekstest_kube::fake::FakeKubectl;
    use std::path::Path;
    use std::sync::Arc;

    fn kubectl(fake: Arc<FakeKubectl>) -> Kubectl {
        Kubectl::new(fake, Path::new("kubectl"), Path::new("/tmp/kc"))
    }

    #[test]
    fn test_config_map_maps_role_to_node_groups() {
        let yaml = aws_auth_config_map("arn:aws:iam::1:role/node").unwrap();
        let cm: ConfigMap = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cm.metadata.namespace.as_deref(), Some("kube-system"));

        let roles = &cm.data.unwrap()["mapRoles"];
        let parsed: serde_yaml::Value = serde_yaml::from_str(roles).unwrap();
        assert_eq!(parsed[0]["rolearn"].as_str(), Some("arn:aws:iam::1:role/node"));
        assert_eq!(parsed[0]["groups"][1].as_str(), Some("system:nodes"));
        assert!(yaml.contains("kind: ConfigMap"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_waits_for_every_node() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _cloud) = context(dir.path());
        ctx.record(|s| s.worker.instance_role_arn = "arn:aws:iam::1:role/node".to_string())
            .unwrap();
        let fake = Arc::new(FakeKubectl::new());
        fake.set_nodes(1, true);

        let nodes = join_workers(&ctx, &kubectl(fake.clone())).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(fake.applied()[0].2, "aws-auth");
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_records_worker_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _cloud) = context(dir.path());
        ctx.record(|s| {
            s.worker.instance_role_arn = "arn:aws:iam::1:role/node".to_string();
            for (id, ip) in [("i-0a", "192.168.1.10"), ("i-0b", "192.168.1.99")] {
                s.worker.nodes.insert(
                    id.to_string(),
                    WorkerNode {
                        private_ip: ip.to_string(),
                        status: "running".to_string(),
                        ..Default::default()
                    },
                );
            }
        })
        .unwrap();
        let fake = Arc::new(FakeKubectl::new());
        fake.set_nodes(1, true);

        join_workers(&ctx, &kubectl(fake)).await.unwrap();
        let workers = ctx.store.state().worker.nodes;
        assert!(workers["i-0a"].ready);
        assert!(!workers["i-0b"].ready);
    }

    #[tokio::test]
    async fn test_role_mapping_removed() {
        let fake = Arc::new(FakeKubectl::new());
        let kubectl = kubectl(fake.clone());
        kubectl
            .apply(&aws_auth_config_map("arn:aws:iam::1:role/node").unwrap())
            .await
            .unwrap();

        remove_node_role_mapping(&kubectl).await.unwrap();
        assert!(fake.live_objects().is_empty());
        let deleted = fake.deleted();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].0, "ConfigMap");
        assert_eq!(deleted[0].1, "kube-system");
        assert_eq!(deleted[0].2, "aws-auth");
    }

    #[tokio::test(start_paused = true)]
    async fn test_nodes_never_ready_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _cloud) = context(dir.path());
        ctx.record(|s| s.worker.instance_role_arn = "arn:aws:iam::1:role/node".to_string())
            .unwrap();
        let fake = Arc::new(FakeKubectl::new());
        fake.set_nodes(1, false);

        let err = join_workers(&ctx, &kubectl(fake)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
