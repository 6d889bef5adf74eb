//! Per-node upgrade state and progress records.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cloud::{ImageReference, ResourceDescriptor};
use crate::error::{KruError, Result};
use crate::naming::{OsType, PoolRole};

/// Lifecycle of a single node during a run.
///
/// Transitions only move forward, or into `Failed` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeState {
    Pending,
    Cordoned,
    Drained,
    Decommissioned,
    Recreated,
    Validated,
    Completed,
    Failed,
}

impl NodeState {
    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Cordoned => 1,
            Self::Drained => 2,
            Self::Decommissioned => 3,
            Self::Recreated => 4,
            Self::Validated => 5,
            Self::Completed => 6,
            Self::Failed => 7,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The state the next step moves a node into.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Cordoned),
            Self::Cordoned => Some(Self::Drained),
            Self::Drained => Some(Self::Decommissioned),
            Self::Decommissioned => Some(Self::Recreated),
            Self::Recreated => Some(Self::Validated),
            Self::Validated => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Name of the step that starts from this state.
    pub const fn step_name(self) -> &'static str {
        match self {
            Self::Pending => "cordoning",
            Self::Cordoned => "draining",
            Self::Drained => "decommissioning",
            Self::Decommissioned => "recreating",
            Self::Recreated => "validating",
            Self::Validated => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether `to` is a legal transition from this state.
    pub const fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(to, Self::Failed) || to.rank() > self.rank()
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Cordoned => "Cordoned",
            Self::Drained => "Drained",
            Self::Decommissioned => "Decommissioned",
            Self::Recreated => "Recreated",
            Self::Validated => "Validated",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Configuration a recreated node must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredConfig {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,
}

/// One node of one pool, with its desired configuration and progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeTarget {
    pub node: String,
    pub pool: String,
    pub role: PoolRole,
    pub os_type: OsType,
    pub index: u32,
    /// Absent when the slot is declared by the model but has no cloud resource.
    #[serde(skip)]
    pub descriptor: Option<ResourceDescriptor>,
    pub desired: DesiredConfig,
    /// Name of the resource created in place of `node`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    pub state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<NodeState>,
    /// Node was already at the target configuration when the plan was built.
    pub already_current: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UpgradeTarget {
    /// Move to `next`, rejecting anything that is not strictly forward.
    pub fn advance(&mut self, next: NodeState) -> Result<()> {
        if next == NodeState::Failed || !self.state.can_transition_to(next) {
            return Err(KruError::InvalidTransition {
                node: self.node.clone(),
                from: self.state,
                to: next,
            });
        }

        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next == NodeState::Completed {
            self.completed_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Record a failure, remembering the state it happened in.
    pub fn fail(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.failed_at = Some(self.state);
        self.state = NodeState::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub const fn is_missing_slot(&self) -> bool {
        self.descriptor.is_none()
    }

    /// Name the node registers under once replaced.
    pub fn current_name(&self) -> &str {
        self.replacement.as_deref().unwrap_or(&self.node)
    }
}
