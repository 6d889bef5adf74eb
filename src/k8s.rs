//! Cluster scheduling operations used while replacing a node.

pub mod client;
pub mod scheduler;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Interval between readiness and eviction polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Scheduling API addressed by node name.
///
/// Every method may block for a long time. Callers bound them with a timeout;
/// implementations keep polling until they succeed or hit a hard error.
#[async_trait]
pub trait NodeScheduler: Send + Sync {
    /// Mark the node unschedulable.
    async fn cordon(&self, node: &str) -> Result<()>;

    /// Evict every evictable pod and wait for them to be gone.
    async fn drain(&self, node: &str) -> Result<()>;

    /// Wait until the node is Ready and its kubelet reports `version`.
    async fn wait_ready(&self, node: &str, version: &str) -> Result<()>;

    /// Remove the Node object. A node that is already gone is not an error.
    async fn delete_node(&self, node: &str) -> Result<()>;
}
