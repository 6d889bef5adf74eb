//! Rolling node replacement.
//!
//! [`plan`] turns the model and a discovered topology into an ordered list of
//! nodes, [`node`] drives a single node through its states and
//! [`orchestrator`] sequences pools and aggregates the outcome.

pub mod node;
pub mod orchestrator;
pub mod plan;
pub mod state;

pub use node::{DrainTimeoutPolicy, Timeouts};
pub use orchestrator::{Orchestrator, RunConfig, RunReport, RunState};
pub use plan::{PoolSelection, UpgradePlan};
pub use state::{NodeState, UpgradeTarget};
