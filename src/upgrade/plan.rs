//! The upgrade plan: which nodes of which pools get replaced, in what order.

use std::collections::BTreeSet;

use serde::Serialize;

use super::state::{DesiredConfig, NodeState, UpgradeTarget};
use crate::error::{KruError, Result};
use crate::model::{ClusterModel, WindowsImage};
use crate::naming::{self, PoolProfile, PoolRole};
use crate::topology::Topology;

/// Pools taking part in a run. The control plane is always in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSelection {
    pub control_plane_only: bool,
    /// Worker pools to upgrade. `None` means all of them.
    pub pools: Option<BTreeSet<String>>,
}

impl PoolSelection {
    pub fn control_plane_only() -> Self {
        Self {
            control_plane_only: true,
            pools: None,
        }
    }

    pub fn only<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            control_plane_only: false,
            pools: Some(pools.into_iter().map(Into::into).collect()),
        }
    }

    /// Reject contradictory flags and pool names the model does not declare.
    pub fn validate(&self, pools: &[PoolProfile]) -> Result<()> {
        let Some(selected) = &self.pools else {
            return Ok(());
        };

        if self.control_plane_only {
            return Err(KruError::Configuration(
                "--control-plane-only cannot be combined with --pool".to_string(),
            ));
        }

        let unknown: Vec<&str> = selected
            .iter()
            .filter(|name| !pools.iter().any(|p| &p.name == *name))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(KruError::Configuration(format!(
                "unknown agent pool(s): {}",
                unknown.join(", ")
            )));
        }
        Ok(())
    }

    pub fn includes(&self, pool: &PoolProfile) -> bool {
        if pool.is_control_plane() {
            return true;
        }
        if self.control_plane_only {
            return false;
        }
        self.pools
            .as_ref()
            .is_none_or(|selected| selected.contains(&pool.name))
    }
}

/// Nodes of one pool, in the order they are replaced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolPlan {
    pub pool: String,
    pub role: PoolRole,
    pub nodes: Vec<UpgradeTarget>,
}

impl PoolPlan {
    pub fn is_control_plane(&self) -> bool {
        self.role == PoolRole::ControlPlane
    }

    pub fn all_completed(&self) -> bool {
        self.nodes.iter().all(|n| n.state == NodeState::Completed)
    }

    pub fn failed(&self) -> Option<&UpgradeTarget> {
        self.nodes.iter().find(|n| n.state == NodeState::Failed)
    }
}

/// Pools in upgrade order: control plane first, then workers as declared.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePlan {
    pub target_version: String,
    pub pools: Vec<PoolPlan>,
}

impl UpgradePlan {
    pub fn nodes(&self) -> impl Iterator<Item = &UpgradeTarget> {
        self.pools.iter().flat_map(|p| p.nodes.iter())
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    /// Nodes that still need work.
    pub fn remaining_count(&self) -> usize {
        self.nodes().filter(|n| !n.already_current).count()
    }

    pub fn count_in(&self, state: NodeState) -> usize {
        self.nodes().filter(|n| n.state == state).count()
    }

    pub fn pool(&self, name: &str) -> Option<&PoolPlan> {
        self.pools.iter().find(|p| p.pool == name)
    }
}

/// Build the plan from the model and a fresh topology.
///
/// Nodes already tagged with the target version (and image, when one is
/// configured) start `Completed`. Missing slots start `Decommissioned` so the
/// node machine only recreates them.
pub fn build_plan(
    model: &ClusterModel,
    topology: &Topology,
    selection: &PoolSelection,
    target_version: &str,
    windows_image: &WindowsImage,
) -> UpgradePlan {
    let pools = model
        .pool_profiles()
        .into_iter()
        .filter(|profile| selection.includes(profile))
        .map(|profile| {
            let desired = DesiredConfig {
                version: target_version.to_string(),
                image: model.desired_image(&profile.name, windows_image),
                vm_size: model.desired_vm_size(&profile.name),
            };

            let mut nodes: Vec<UpgradeTarget> = topology
                .nodes(&profile.name)
                .iter()
                .enumerate()
                .map(|(position, descriptor)| {
                    let current = descriptor.is_at(target_version, desired.image.as_ref());
                    let index = naming::node_index(&descriptor.name, &profile)
                        .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX));
                    UpgradeTarget {
                        node: descriptor.name.clone(),
                        pool: profile.name.clone(),
                        role: profile.role,
                        os_type: descriptor.os_type,
                        index,
                        descriptor: Some(descriptor.clone()),
                        desired: desired.clone(),
                        replacement: None,
                        state: if current {
                            NodeState::Completed
                        } else {
                            NodeState::Pending
                        },
                        failed_at: None,
                        already_current: current,
                        started_at: None,
                        completed_at: None,
                    }
                })
                .collect();

            nodes.extend(topology.missing(&profile.name).iter().map(|index| {
                UpgradeTarget {
                    node: profile.vm_name(*index),
                    pool: profile.name.clone(),
                    role: profile.role,
                    os_type: profile.os_type,
                    index: *index,
                    descriptor: None,
                    desired: desired.clone(),
                    replacement: None,
                    state: NodeState::Decommissioned,
                    failed_at: None,
                    already_current: false,
                    started_at: None,
                    completed_at: None,
                }
            }));
            nodes.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.node.cmp(&b.node)));

            PoolPlan {
                pool: profile.name.clone(),
                role: profile.role,
                nodes,
            }
        })
        .collect();

    UpgradePlan {
        target_version: target_version.to_string(),
        pools,
    }
}
