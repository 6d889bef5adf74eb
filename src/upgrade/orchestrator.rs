//! Top-level sequencing: control plane first, then worker pools in order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::node::{DrainTimeoutPolicy, NodeContext, NodeUpgrader, Timeouts};
use super::plan::{PoolPlan, PoolSelection, UpgradePlan, build_plan};
use super::state::NodeState;
use crate::cloud::CloudResourceClient;
use crate::error::{KruError, Result};
use crate::k8s::NodeScheduler;
use crate::model::{ClusterModel, WindowsImage};
use crate::topology::discover_topology;
use crate::version::is_upgrade_allowed;

/// Bound on each base image availability check.
const IMAGE_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable inputs of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub resource_group: String,
    pub location: String,
    pub target_version: String,
    /// Versions the current version may move to without `force`.
    pub supported_upgrades: Vec<String>,
    pub force: bool,
    pub selection: PoolSelection,
    pub timeouts: Timeouts,
    pub drain_timeout_policy: DrainTimeoutPolicy,
    /// Worker nodes of one pool that may be mid-upgrade at once.
    pub max_unavailable: usize,
    pub windows_image: WindowsImage,
    /// Recorded on every VM this run creates.
    pub build_tag: String,
    pub dry_run: bool,
}

/// Mutable state of one run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub plan: UpgradePlan,
    pub started_at: DateTime<Utc>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub from_version: String,
    pub target_version: String,
    pub dry_run: bool,
    /// Nodes replaced by this run.
    pub upgraded: usize,
    /// Nodes already at the target configuration.
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan: UpgradePlan,
}

impl RunReport {
    fn from_state(state: RunState, from_version: String, dry_run: bool) -> Self {
        let upgraded = state
            .plan
            .nodes()
            .filter(|n| n.state == NodeState::Completed && !n.already_current)
            .count();
        let skipped = state.plan.nodes().filter(|n| n.already_current).count();

        Self {
            from_version,
            target_version: state.plan.target_version.clone(),
            dry_run,
            upgraded,
            skipped,
            started_at: state.started_at,
            finished_at: Utc::now(),
            plan: state.plan,
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        self.finished_at
            .signed_duration_since(self.started_at)
            .num_minutes()
    }
}

pub struct Orchestrator {
    config: RunConfig,
    cloud: Arc<dyn CloudResourceClient>,
    scheduler: Arc<dyn NodeScheduler>,
}

impl Orchestrator {
    pub fn new(
        config: RunConfig,
        cloud: Arc<dyn CloudResourceClient>,
        scheduler: Arc<dyn NodeScheduler>,
    ) -> Self {
        Self {
            config,
            cloud,
            scheduler,
        }
    }

    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Checks that need nothing but the model and the run configuration.
    pub fn preflight(&self, model: &mut ClusterModel) -> Result<()> {
        let config = &self.config;

        model.require_name_suffix()?;
        model.reconcile_location(&config.location)?;

        if model.control_plane_availability().is_scale_set() {
            return Err(KruError::Configuration(
                "upgrading a control plane on VirtualMachineScaleSets is not supported"
                    .to_string(),
            ));
        }

        if config.max_unavailable == 0 {
            return Err(KruError::Configuration(
                "max unavailable must be at least 1".to_string(),
            ));
        }

        is_upgrade_allowed(
            model.orchestrator_version(),
            &config.target_version,
            &config.supported_upgrades,
            config.force,
        )?;

        config.selection.validate(&model.pool_profiles())
    }

    /// Check that every image the selected pools boot from exists in the
    /// target cloud. Only Azure Stack clouds can lack a marketplace image.
    pub async fn validate_os_images(&self, model: &ClusterModel) -> Result<()> {
        if !model.is_azure_stack() {
            return Ok(());
        }
        let config = &self.config;
        let location = model.location();

        let mut images = Vec::new();
        for pool in model
            .pool_profiles()
            .iter()
            .filter(|p| config.selection.includes(p))
        {
            if let Some(image) = model.desired_image(&pool.name, &config.windows_image)
                && !images.contains(&image)
            {
                images.push(image);
            }
        }

        for image in images {
            let urn = image.urn();
            let available = tokio::time::timeout(
                IMAGE_CHECK_TIMEOUT,
                self.cloud.image_available(location, &image),
            )
            .await
            .map_err(|_| {
                KruError::CloudApi(
                    "image check".to_string(),
                    format!(
                        "no answer within {}s for image {}",
                        IMAGE_CHECK_TIMEOUT.as_secs(),
                        urn
                    ),
                )
            })??;

            if !available {
                return Err(KruError::ImageUnavailable {
                    image: urn,
                    location: location.to_string(),
                });
            }
            info!("Image {} is available in {}", urn, location);
        }
        Ok(())
    }

    /// Discover the topology and build the plan without touching anything.
    pub async fn plan(&self, model: &ClusterModel) -> Result<UpgradePlan> {
        let config = &self.config;
        let suffix = model.name_suffix();
        let pools = model.pool_profiles();

        let topology =
            discover_topology(self.cloud.as_ref(), &config.resource_group, suffix, &pools)
                .await?;

        Ok(build_plan(
            model,
            &topology,
            &config.selection,
            &config.target_version,
            &config.windows_image,
        ))
    }

    /// Upgrade every selected node to the target version.
    ///
    /// Only the in-memory model is changed: each pool is marked upgraded once
    /// all its nodes complete, and the cluster version is bumped when the whole
    /// run succeeds. Persisting it is the caller's job, on failure too.
    pub async fn upgrade_cluster(&self, model: &mut ClusterModel) -> Result<RunReport> {
        let config = &self.config;
        let started_at = Utc::now();

        self.preflight(model)?;
        self.validate_os_images(model).await?;
        let from_version = model.orchestrator_version().to_string();

        info!(
            "Upgrading cluster {} in {} from {} to {}",
            model.name_suffix(),
            config.resource_group,
            from_version,
            config.target_version
        );

        let mut state = RunState {
            plan: self.plan(model).await?,
            started_at,
        };
        log_plan(&state.plan);

        if config.dry_run {
            info!("Dry run, no node will be touched");
            return Ok(RunReport::from_state(state, from_version, true));
        }

        let upgrader = NodeUpgrader::new(
            Arc::clone(&self.cloud),
            Arc::clone(&self.scheduler),
            NodeContext {
                resource_group: config.resource_group.clone(),
                location: model.location().to_string(),
                name_suffix: model.name_suffix().to_string(),
                build_tag: config.build_tag.clone(),
                timeouts: config.timeouts,
                drain_timeout_policy: config.drain_timeout_policy,
            },
        );

        for pool in &mut state.plan.pools {
            let result = if pool.is_control_plane() {
                info!("Upgrading control plane, one node at a time");
                run_sequential(&upgrader, pool).await
            } else {
                info!(
                    "Upgrading pool {} ({} at a time)",
                    pool.pool, config.max_unavailable
                );
                run_parallel(&upgrader, pool, config.max_unavailable).await
            };

            if let Err(e) = result {
                match pool.failed() {
                    Some(node) => error!("Pool {} halted at node {}: {}", pool.pool, node.node, e),
                    None => error!("Pool {} halted: {}", pool.pool, e),
                }
                return Err(e);
            }

            if pool.all_completed() {
                let image = pool.nodes.first().and_then(|n| n.desired.image.clone());
                model.mark_pool_upgraded(&pool.pool, &config.target_version, image.as_ref());
                info!("Pool {} is at {}", pool.pool, config.target_version);
            }
        }

        model.set_orchestrator_version(&config.target_version);

        let report = RunReport::from_state(state, from_version, false);
        info!(
            "Cluster upgraded to {}: {} nodes replaced, {} already current",
            report.target_version, report.upgraded, report.skipped
        );
        Ok(report)
    }
}

fn log_plan(plan: &UpgradePlan) {
    for pool in &plan.pools {
        let current = pool.nodes.iter().filter(|n| n.already_current).count();
        info!(
            "Plan: pool {} has {} nodes, {} already at {}",
            pool.pool,
            pool.nodes.len(),
            current,
            plan.target_version
        );
        for node in pool.nodes.iter().filter(|n| n.is_missing_slot()) {
            warn!("Plan: {} is missing and will be recreated", node.node);
        }
    }
}

async fn run_sequential(upgrader: &NodeUpgrader, pool: &mut PoolPlan) -> Result<()> {
    for target in pool.nodes.iter_mut().filter(|n| !n.state.is_terminal()) {
        upgrader.run(target).await?;
    }
    Ok(())
}

/// Upgrade a worker pool with at most `max_unavailable` nodes in flight.
///
/// After the first failure no further node is started. Nodes already in
/// flight run to the end of their current step sequence.
async fn run_parallel(
    upgrader: &NodeUpgrader,
    pool: &mut PoolPlan,
    max_unavailable: usize,
) -> Result<()> {
    if max_unavailable <= 1 {
        return run_sequential(upgrader, pool).await;
    }

    let semaphore = Semaphore::new(max_unavailable);
    let halted = AtomicBool::new(false);
    let mut first_error: Option<KruError> = None;

    let mut tasks: FuturesUnordered<_> = pool
        .nodes
        .iter_mut()
        .filter(|n| !n.state.is_terminal())
        .map(|target| {
            let semaphore = &semaphore;
            let halted = &halted;
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return Ok(());
                };
                if halted.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let result = upgrader.run(target).await;
                if result.is_err() {
                    halted.store(true, Ordering::SeqCst);
                }
                result
            }
        })
        .collect();

    while let Some(result) = tasks.next().await {
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    first_error.map_or(Ok(()), Err)
}
