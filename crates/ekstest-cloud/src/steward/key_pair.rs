//! SSH key pair for the worker nodes
//!
//! The provider returns the private key exactly once, at creation. It is
//! written read-only next to the config and never leaves the machine.

use async_trait::async_trait;
use ekstest_common::fs::{remove_if_exists, write_atomic, MODE_READ_ONLY};
use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::Result;
use ekstest_config::{ClusterState, ResourceHandle};
use tracing::{info, warn};

use super::{tolerate_not_found, Resource, StewardContext};
use crate::api::is_already_exists;

/// Worker SSH key pair plus its on-disk private key
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyPair;

#[async_trait]
impl Resource for KeyPair {
    fn name(&self) -> &'static str {
        "key-pair"
    }

    fn handle<'a>(&self, state: &'a ClusterState) -> &'a ResourceHandle {
        &state.key_pair.handle
    }

    fn handle_mut<'a>(&self, state: &'a mut ClusterState) -> &'a mut ResourceHandle {
        &mut state.key_pair.handle
    }

    fn settled_status(&self) -> &'static str {
        "AVAILABLE"
    }

    async fn create(&self, ctx: &StewardContext) -> Result<String> {
        let state = ctx.store.state();
        let name = &state.key_pair.handle.name;
        let path = &state.key_pair.private_key_path;

        let material = match ctx.cloud.ec2.create_key_pair(name).await {
            Ok(m) => m,
            Err(e) if is_already_exists(&e) => {
                // The private half of a leftover key is unrecoverable; replace it.
                warn!(key_pair = %name, "key pair exists without local material, recreating");
                ctx.cloud.ec2.delete_key_pair(name).await?;
                ctx.cloud.ec2.create_key_pair(name).await?
            }
            Err(e) => return Err(e),
        };
        ctx.record(|s| s.key_pair.handle.mark_created(&material.fingerprint, "CREATED"))?;

        write_atomic(path, material.private_key.as_bytes(), MODE_READ_ONLY)?;
        info!(key_pair = %name, path = %path.display(), "private key written");
        Ok(material.fingerprint)
    }

    async fn wait(&self, ctx: &StewardContext) -> Result<String> {
        let state = ctx.store.state();
        let name = state.key_pair.handle.name.clone();
        let spec = PollSpec::new(
            format!("wait-key-pair/{}", name),
            ctx.timeouts.short_interval,
            ctx.timeouts.key_pair,
        );
        let names = [name.clone()];
        poll(&spec, &ctx.cancel, || async {
            if ctx.cloud.ec2.describe_key_pairs(&names).await?.contains(&name) {
                Ok(Attempt::Done(()))
            } else {
                Ok(Attempt::Retry("key pair not visible yet".to_string()))
            }
        })
        .await?;

        let id = state.key_pair.handle.id;
        ctx.record(|s| s.key_pair.handle.mark_created(&id, "AVAILABLE"))?;
        Ok(id)
    }

    async fn delete(&self, ctx: &StewardContext) -> Result<()> {
        let state = ctx.store.state();
        let name = state.key_pair.handle.name.clone();

        remove_if_exists(&state.key_pair.private_key_path)?;
        tolerate_not_found(ctx.cloud.ec2.delete_key_pair(&name).await)?;

        let spec = PollSpec::new(
            format!("wait-key-pair-deleted/{}", name),
            ctx.timeouts.short_interval,
            ctx.timeouts.key_pair,
        );
        let names = [name.clone()];
        poll(&spec, &ctx.cancel, || async {
            if ctx.cloud.ec2.describe_key_pairs(&names).await?.is_empty() {
                Ok(Attempt::Done(()))
            } else {
                Ok(Attempt::Retry("key pair still listed".to_string()))
            }
        })
        .await?;

        ctx.record(|s| s.key_pair.handle.mark_deleted("DELETED"))?;
        Ok(())
    }
}
