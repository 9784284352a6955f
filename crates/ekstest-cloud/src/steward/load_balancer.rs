//! Load balancers created by the in-cluster controller
//!
//! The harness never creates these itself. It looks them up by the name
//! embedded in the ingress hostname, checks their targets, and after the
//! ingress objects are gone it removes whatever the controller leaked in
//! the cluster VPC.

use std::collections::BTreeSet;
use std::time::Duration;

use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::{CancellationToken, Error, Result};
use tracing::{info, warn};

use crate::api::{Elbv2, LoadBalancer};

/// Find a load balancer by name
pub async fn find_load_balancer(elb: &dyn Elbv2, name: &str) -> Result<LoadBalancer> {
    elb.describe_load_balancers()
        .await?
        .into_iter()
        .find(|lb| lb.name == name)
        .ok_or_else(|| Error::not_found(name, "no load balancer with that name"))
}

/// Poll until every target group routed from `load_balancer_arn` has only
/// healthy targets
pub async fn verify_target_health(
    elb: &dyn Elbv2,
    load_balancer_arn: &str,
    every: Duration,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let spec = PollSpec::new("verify-target-health", every, deadline);
    poll(&spec, cancel, || async {
        let groups: Vec<_> = elb
            .describe_target_groups()
            .await?
            .into_iter()
            .filter(|tg| tg.load_balancer_arns.iter().any(|a| a == load_balancer_arn))
            .collect();
        if groups.is_empty() {
            return Ok(Attempt::Retry("no target groups attached yet".to_string()));
        }
        for tg in &groups {
            let health = elb.describe_target_health(&tg.arn).await?;
            if health.is_empty() {
                return Ok(Attempt::Retry(format!("target group {} has no targets", tg.name)));
            }
            if let Some(bad) = health.iter().find(|t| t.state != "healthy") {
                return Ok(Attempt::Retry(format!(
                    "target {} in {} is {}",
                    bad.target_id, tg.name, bad.state
                )));
            }
        }
        info!(target_groups = groups.len(), "all targets healthy");
        Ok(Attempt::Done(()))
    })
    .await
}

/// Delete listeners, load balancers and target groups left in `vpc_id`
///
/// Every deletion is attempted; failures other than not-found are
/// collected and returned together.
pub async fn gc_load_balancers(elb: &dyn Elbv2, vpc_id: &str) -> Result<()> {
    if vpc_id.is_empty() {
        return Ok(());
    }
    let mut errors = Vec::new();
    let mut keep = |r: Result<()>| match r {
        Err(e) if !e.is_not_found() => errors.push(e),
        _ => {}
    };

    let leaked: Vec<LoadBalancer> = elb
        .describe_load_balancers()
        .await?
        .into_iter()
        .filter(|lb| lb.vpc_id == vpc_id)
        .collect();
    let arns: BTreeSet<&str> = leaked.iter().map(|lb| lb.arn.as_str()).collect();

    for lb in &leaked {
        match elb.describe_listeners(&lb.arn).await {
            Ok(listeners) => {
                for l in listeners {
                    keep(elb.delete_listener(&l.arn).await);
                }
            }
            Err(e) => keep(Err(e)),
        }
        warn!(load_balancer = %lb.name, vpc = %vpc_id, "deleting leaked load balancer");
        keep(elb.delete_load_balancer(&lb.arn).await);
    }

    for tg in elb.describe_target_groups().await? {
        let attached = tg.load_balancer_arns.iter().any(|a| arns.contains(a.as_str()));
        if tg.vpc_id == vpc_id || attached {
            info!(target_group = %tg.name, "deleting target group");
            keep(elb.delete_target_group(&tg.arn).await);
        }
    }

    match Error::teardown(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCloud;

    #[tokio::test]
    async fn test_find_by_name() {
        let cloud = FakeCloud::new();
        cloud.add_load_balancer("a1b2c3-default-ingressf-1234", "a1b2c3-default-ingressf-1234-99.us-west-2.elb.amazonaws.com", "vpc-1");
        let lb = find_load_balancer(&cloud, "a1b2c3-default-ingressf-1234").await.unwrap();
        assert_eq!(lb.vpc_id, "vpc-1");
        assert!(find_load_balancer(&cloud, "other").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_health_gate() {
        let cloud = FakeCloud::new();
        let arn = cloud.add_load_balancer("lb", "lb.elb.amazonaws.com", "vpc-1");
        let every = Duration::from_secs(5);
        let deadline = Duration::from_secs(30);
        verify_target_health(&cloud, &arn, every, deadline, &CancellationToken::new())
            .await
            .unwrap();

        cloud.set_targets_healthy(false);
        let err = verify_target_health(
            &cloud,
            &arn,
            Duration::from_secs(5),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ekstest_common::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_gc_removes_only_cluster_vpc() {
        let cloud = FakeCloud::new();
        cloud.add_load_balancer("mine", "mine.elb.amazonaws.com", "vpc-mine");
        cloud.add_load_balancer("theirs", "theirs.elb.amazonaws.com", "vpc-other");

        gc_load_balancers(&cloud, "vpc-mine").await.unwrap();
        assert_eq!(cloud.elb_counts(), (1, 1, 1));
        let left = cloud.describe_load_balancers().await.unwrap();
        assert_eq!(left[0].name, "theirs");
    }
}
