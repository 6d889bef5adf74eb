//! Drives one node through cordon, drain, decommission, recreate and validate.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::state::{NodeState, UpgradeTarget};
use crate::cloud::{
    CloudResourceClient, CreateResourceSpec, TAG_BUILD, TAG_NAME_SUFFIX, TAG_ORCHESTRATOR,
    TAG_POOL_NAME, orchestrator_tag,
};
use crate::error::{KruError, Result};
use crate::k8s::NodeScheduler;

/// Default bound for decommission, recreate and validate.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Default bound for cordon and drain.
pub const DEFAULT_CORDON_DRAIN_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Default cordon/drain bound on Azure Stack, where evictions are slower.
pub const AZURE_STACK_CORDON_DRAIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub step: Duration,
    pub cordon_drain: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            step: DEFAULT_STEP_TIMEOUT,
            cordon_drain: DEFAULT_CORDON_DRAIN_TIMEOUT,
        }
    }
}

/// What to do when a drain does not finish within the cordon/drain timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DrainTimeoutPolicy {
    /// Fail the node with a step timeout.
    Fail,
    /// Log a warning and decommission the node anyway.
    Proceed,
}

impl DrainTimeoutPolicy {
    /// Forced runs proceed past slow drains unless told otherwise.
    pub const fn default_for(force: bool) -> Self {
        if force { Self::Proceed } else { Self::Fail }
    }
}

/// Per-run settings every node step needs.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub resource_group: String,
    pub location: String,
    pub name_suffix: String,
    pub build_tag: String,
    pub timeouts: Timeouts,
    pub drain_timeout_policy: DrainTimeoutPolicy,
}

/// Run `fut`, turning an elapsed deadline into a [`KruError::StepTimeout`].
async fn bounded<T>(
    target: &UpgradeTarget,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(KruError::StepTimeout {
            node: target.node.clone(),
            pool: target.pool.clone(),
            state: target.state,
            timeout: limit,
        }),
    }
}

pub struct NodeUpgrader {
    cloud: Arc<dyn CloudResourceClient>,
    scheduler: Arc<dyn NodeScheduler>,
    context: NodeContext,
}

impl NodeUpgrader {
    pub fn new(
        cloud: Arc<dyn CloudResourceClient>,
        scheduler: Arc<dyn NodeScheduler>,
        context: NodeContext,
    ) -> Self {
        Self {
            cloud,
            scheduler,
            context,
        }
    }

    /// Advance `target` until it is `Completed`.
    ///
    /// On error the target is left `Failed` and the returned error names the
    /// node, pool and the state the failing step started from.
    pub async fn run(&self, target: &mut UpgradeTarget) -> Result<()> {
        while let Some(next) = target.state.next() {
            let from = target.state;

            if let Err(e) = self.step(target).await {
                target.fail();
                return Err(e.at_node(&target.node, &target.pool, from));
            }

            target.advance(next)?;
            info!(
                "Node {} in pool {}: {} -> {}",
                target.node, target.pool, from, next
            );
        }
        Ok(())
    }

    async fn step(&self, target: &mut UpgradeTarget) -> Result<()> {
        match target.state {
            NodeState::Pending => self.cordon(target).await,
            NodeState::Cordoned => self.drain(target).await,
            NodeState::Drained => self.decommission(target).await,
            NodeState::Decommissioned => self.recreate(target).await,
            NodeState::Recreated => self.validate(target).await,
            NodeState::Validated | NodeState::Completed | NodeState::Failed => Ok(()),
        }
    }

    async fn cordon(&self, target: &UpgradeTarget) -> Result<()> {
        let limit = self.context.timeouts.cordon_drain;
        bounded(target, limit, self.scheduler.cordon(&target.node)).await
    }

    async fn drain(&self, target: &UpgradeTarget) -> Result<()> {
        let limit = self.context.timeouts.cordon_drain;
        match bounded(target, limit, self.scheduler.drain(&target.node)).await {
            Err(KruError::StepTimeout { .. })
                if self.context.drain_timeout_policy == DrainTimeoutPolicy::Proceed =>
            {
                warn!(
                    "Drain of node {} did not finish within {}s, proceeding anyway",
                    target.node,
                    limit.as_secs()
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn decommission(&self, target: &UpgradeTarget) -> Result<()> {
        let limit = self.context.timeouts.step;
        if let Some(descriptor) = &target.descriptor {
            bounded(target, limit, self.cloud.delete_compute_resource(descriptor)).await?;
            info!("Deleted compute resource {}", descriptor.id);
        }

        // The old Node object would linger NotReady until the controller GCs it.
        match bounded(target, limit, self.scheduler.delete_node(&target.node)).await {
            Ok(()) => {}
            Err(e) => warn!("Failed to remove node object {}: {}", target.node, e),
        }
        Ok(())
    }

    fn create_spec(&self, target: &UpgradeTarget) -> CreateResourceSpec {
        let old = target.descriptor.as_ref();

        let mut tags: BTreeMap<String, String> =
            old.map(|d| d.tags.clone()).unwrap_or_default();
        tags.insert(
            TAG_ORCHESTRATOR.to_string(),
            orchestrator_tag(&target.desired.version),
        );
        tags.insert(TAG_POOL_NAME.to_string(), target.pool.clone());
        tags.insert(
            TAG_NAME_SUFFIX.to_string(),
            self.context.name_suffix.clone(),
        );
        tags.insert(TAG_BUILD.to_string(), self.context.build_tag.clone());

        CreateResourceSpec {
            resource_group: self.context.resource_group.clone(),
            location: old
                .map(|d| d.location.clone())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| self.context.location.clone()),
            name: target.node.clone(),
            pool: target.pool.clone(),
            role: target.role,
            index: target.index,
            os_type: target.os_type,
            scale_set: old.and_then(|d| d.scale_set.clone()),
            image: target
                .desired
                .image
                .clone()
                .or_else(|| old.and_then(|d| d.image.clone())),
            vm_size: target
                .desired
                .vm_size
                .clone()
                .or_else(|| old.and_then(|d| d.vm_size.clone())),
            tags,
        }
    }

    async fn recreate(&self, target: &mut UpgradeTarget) -> Result<()> {
        let limit = self.context.timeouts.step;
        let spec = self.create_spec(target);
        let created = bounded(target, limit, self.cloud.create_compute_resource(&spec)).await?;

        info!(
            "Created {} in pool {} at index {} for version {}",
            created.name, target.pool, target.index, target.desired.version
        );
        if created.name != target.node {
            target.replacement = Some(created.name.clone());
        }
        target.descriptor = Some(created);
        Ok(())
    }

    async fn validate(&self, target: &UpgradeTarget) -> Result<()> {
        let limit = self.context.timeouts.step;
        let name = target.current_name();
        bounded(
            target,
            limit,
            self.scheduler.wait_ready(name, &target.desired.version),
        )
        .await
    }
}
