//! Access-log bucket for the load balancers

use async_trait::async_trait;
use ekstest_common::Result;
use ekstest_config::{ClusterState, ResourceHandle};
use serde_json::json;
use tracing::info;

use super::{tolerate_not_found, Resource, StewardContext};
use crate::api::is_already_exists;

/// Regional load-balancer log-delivery accounts
const ELB_LOG_ACCOUNTS: &[(&str, &str)] = &[
    ("us-east-1", "127311923021"),
    ("us-east-2", "033677994240"),
    ("us-west-1", "027434742980"),
    ("us-west-2", "797873946194"),
    ("ca-central-1", "985666609251"),
    ("eu-central-1", "054676820928"),
    ("eu-west-1", "156460612806"),
    ("eu-west-2", "652711504416"),
    ("ap-northeast-1", "582318560864"),
    ("ap-southeast-1", "114774131450"),
    ("ap-southeast-2", "783225319266"),
];

/// Bucket policy letting load balancers in `region` write access logs
pub fn access_log_policy(bucket: &str, region: &str) -> String {
    let principal = match ELB_LOG_ACCOUNTS.iter().find(|(r, _)| *r == region) {
        Some((_, account)) => json!({ "AWS": format!("arn:aws:iam::{}:root", account) }),
        None => json!({ "Service": "logdelivery.elasticloadbalancing.amazonaws.com" }),
    };
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": principal,
            "Action": "s3:PutObject",
            "Resource": format!("arn:aws:s3:::{}/*", bucket),
        }],
    })
    .to_string()
}

/// Object-store bucket the controller's load balancers log into
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessLogBucket;

#[async_trait]
impl Resource for AccessLogBucket {
    fn name(&self) -> &'static str {
        "access-log-bucket"
    }

    fn handle<'a>(&self, state: &'a ClusterState) -> &'a ResourceHandle {
        &state.access_log_bucket
    }

    fn handle_mut<'a>(&self, state: &'a mut ClusterState) -> &'a mut ResourceHandle {
        &mut state.access_log_bucket
    }

    fn settled_status(&self) -> &'static str {
        "POLICY_APPLIED"
    }

    async fn create(&self, ctx: &StewardContext) -> Result<String> {
        let name = ctx.store.state().access_log_bucket.name;
        match ctx.cloud.s3.create_bucket(&name).await {
            Ok(()) => {}
            Err(e) if is_already_exists(&e) => info!(bucket = %name, "bucket already owned, reusing it"),
            Err(e) => return Err(e),
        }
        ctx.record(|s| s.access_log_bucket.mark_created(&name, "CREATED"))?;
        Ok(name)
    }

    async fn wait(&self, ctx: &StewardContext) -> Result<String> {
        let name = ctx.store.state().access_log_bucket.name;
        let policy = access_log_policy(&name, &ctx.store.config().region);
        ctx.cloud.s3.put_bucket_policy(&name, &policy).await?;
        ctx.record(|s| s.access_log_bucket.observe("POLICY_APPLIED"))?;
        info!(bucket = %name, "access-log bucket ready");
        Ok(name)
    }

    async fn delete(&self, ctx: &StewardContext) -> Result<()> {
        let name = ctx.store.state().access_log_bucket.name;
        tolerate_not_found(ctx.cloud.s3.delete_bucket(&name).await)?;
        ctx.record(|s| s.access_log_bucket.mark_deleted("DELETED"))?;
        Ok(())
    }
}
