//! kru - rolling VM upgrade orchestrator for self-managed Kubernetes clusters.
//!
//! Reads a cluster's api model, discovers the VMs that back it and replaces
//! them one node at a time: control plane first, then worker pools in the
//! order the model declares them.

pub mod cloud;
pub mod config;
pub mod error;
pub mod k8s;
pub mod model;
pub mod naming;
pub mod notify;
pub mod topology;
pub mod upgrade;
pub mod version;

pub use error::{KruError, Result};
