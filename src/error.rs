//! Custom error types for kru.

use std::time::Duration;

use thiserror::Error;

use crate::upgrade::NodeState;

/// Errors that can occur while upgrading a cluster.
#[derive(Error, Debug)]
pub enum KruError {
    /// Missing or contradictory inputs. Never retried.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid version format: '{0}' is not a semver string")]
    InvalidVersionFormat(String),

    #[error(
        "Upgrading from version {current} to version {target} is not supported. \
         Consider using --force if you really want to proceed"
    )]
    UnsupportedUpgradePath { current: String, target: String },

    #[error("--location {flag} does not match api model location {model}")]
    LocationMismatch { flag: String, model: String },

    #[error("OS base image {image} is not available in {location}")]
    ImageUnavailable { image: String, location: String },

    #[error("Topology incomplete: {0}")]
    TopologyIncomplete(String),

    #[error(
        "Node {node} in pool {pool} timed out after {}s while {} (last state: {state})",
        .timeout.as_secs(),
        .state.step_name()
    )]
    StepTimeout {
        node: String,
        pool: String,
        state: NodeState,
        timeout: Duration,
    },

    #[error("[{0}] {1}")]
    CloudApi(String, String),

    #[error("[{0}] cloud credentials error: {1}")]
    CloudCredentials(String, String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error(
        "Node {node} in pool {pool} failed while {} (last state: {state}): {source}",
        .state.step_name()
    )]
    NodeFailed {
        node: String,
        pool: String,
        state: NodeState,
        #[source]
        source: Box<KruError>,
    },

    #[error("Invalid node state transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: NodeState,
        to: NodeState,
    },
}

impl KruError {
    /// Create a cloud API error from any error type.
    /// Analyzes the error message to separate credential problems from the rest.
    pub fn cloud<E: std::fmt::Display>(component: &str, err: E) -> Self {
        let message = first_meaningful_line(&err.to_string());
        let lower = message.to_lowercase();
        let component = component.to_string();

        if lower.contains("az login")
            || lower.contains("please run 'az login'")
            || lower.contains("no subscription found")
            || lower.contains("authorizationfailed")
            || lower.contains("invalidauthenticationtoken")
            || lower.contains("expiredauthenticationtoken")
            || lower.contains("does not have authorization")
            || lower.contains("aadsts")
        {
            return Self::CloudCredentials(component, message);
        }

        Self::CloudApi(component, message)
    }

    /// Wrap a step failure with the node and state it happened in.
    /// Timeouts already carry that information and are returned unchanged.
    pub fn at_node(self, node: &str, pool: &str, state: NodeState) -> Self {
        match self {
            Self::StepTimeout { .. } | Self::NodeFailed { .. } => self,
            other => Self::NodeFailed {
                node: node.to_string(),
                pool: pool.to_string(),
                state,
                source: Box::new(other),
            },
        }
    }

    /// Returns the node and state a node-level failure is attributed to.
    pub fn failed_node(&self) -> Option<(&str, NodeState)> {
        match self {
            Self::StepTimeout { node, state, .. } | Self::NodeFailed { node, state, .. } => {
                Some((node.as_str(), *state))
            }
            _ => None,
        }
    }

    /// Returns true for errors raised before any node was touched.
    pub const fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::InvalidVersionFormat(_)
                | Self::UnsupportedUpgradePath { .. }
                | Self::LocationMismatch { .. }
                | Self::ImageUnavailable { .. }
                | Self::TopologyIncomplete(_)
                | Self::CloudCredentials(_, _)
        )
    }

    /// Returns true if re-invoking the same run may succeed without operator changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StepTimeout { .. } | Self::CloudApi(_, _) | Self::KubernetesApi(_) => true,
            Self::NodeFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// `az` prints multi-line diagnostics; the first non-empty line after an
/// `ERROR:` marker is the useful part.
fn first_meaningful_line(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("cloud API request failed");

    line.strip_prefix("ERROR:")
        .map_or(line, str::trim)
        .to_string()
}

/// Result alias for the orchestrator core.
pub type Result<T, E = KruError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_version() {
        let err = KruError::InvalidVersionFormat("1.24".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid version format: '1.24' is not a semver string"
        );
    }

    #[test]
    fn test_error_display_unsupported_path() {
        let err = KruError::UnsupportedUpgradePath {
            current: "1.23.5".to_string(),
            target: "1.22.0".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("1.23.5"));
        assert!(msg.contains("1.22.0"));
        assert!(msg.contains("--force"));
    }

    #[test]
    fn test_error_display_step_timeout() {
        let err = KruError::StepTimeout {
            node: "k8s-master-12345678-0".to_string(),
            pool: "master".to_string(),
            state: NodeState::Drained,
            timeout: Duration::from_secs(600),
        };
        assert_eq!(
            err.to_string(),
            "Node k8s-master-12345678-0 in pool master timed out after 600s \
             while decommissioning (last state: Drained)"
        );
    }

    #[test]
    fn test_error_cloud_generic() {
        let err = KruError::cloud("cloud::az", "ERROR: (ResourceNotFound) VM not found");
        assert!(matches!(err, KruError::CloudApi(_, _)));
        assert_eq!(err.to_string(), "[cloud::az] (ResourceNotFound) VM not found");
    }

    #[test]
    fn test_error_cloud_credentials_login() {
        let err = KruError::cloud("cloud::az", "ERROR: Please run 'az login' to setup account.");
        assert!(matches!(err, KruError::CloudCredentials(_, _)));
        assert!(err.to_string().contains("cloud credentials error"));
    }

    #[test]
    fn test_error_cloud_credentials_authorization() {
        let err = KruError::cloud(
            "cloud::az",
            "\n\nERROR: (AuthorizationFailed) The client does not have authorization",
        );
        assert!(matches!(err, KruError::CloudCredentials(_, _)));
    }

    #[test]
    fn test_first_meaningful_line_empty() {
        assert_eq!(first_meaningful_line("   \n"), "cloud API request failed");
    }

    #[test]
    fn test_at_node_wraps_and_keeps_timeouts() {
        let wrapped = KruError::CloudApi("c".into(), "boom".into()).at_node(
            "vm-0",
            "pool1",
            NodeState::Drained,
        );
        assert_eq!(wrapped.failed_node(), Some(("vm-0", NodeState::Drained)));
        assert!(wrapped.to_string().contains("boom"));

        let timeout = KruError::StepTimeout {
            node: "vm-1".into(),
            pool: "pool1".into(),
            state: NodeState::Recreated,
            timeout: Duration::from_secs(1),
        };
        let same = timeout.at_node("other", "other", NodeState::Pending);
        assert_eq!(same.failed_node(), Some(("vm-1", NodeState::Recreated)));
    }

    #[test]
    fn test_is_retryable() {
        assert!(KruError::KubernetesApi("x".into()).is_retryable());
        assert!(KruError::CloudApi("x".into(), "y".into()).is_retryable());
        assert!(!KruError::Configuration("x".into()).is_retryable());
        assert!(!KruError::CloudCredentials("x".into(), "y".into()).is_retryable());
        assert!(!KruError::InvalidVersionFormat("x".into()).is_retryable());
    }

    #[test]
    fn test_is_fatal_for_run() {
        assert!(KruError::Configuration("x".into()).is_fatal_for_run());
        assert!(KruError::TopologyIncomplete("x".into()).is_fatal_for_run());
        let image = KruError::ImageUnavailable {
            image: "microsoft-aks:aks:sku:1.0.0".into(),
            location: "local".into(),
        };
        assert!(image.is_fatal_for_run());
        assert!(!image.is_retryable());
        assert!(!KruError::CloudApi("x".into(), "y".into()).is_fatal_for_run());
        let failed = KruError::KubernetesApi("x".into()).at_node("vm-0", "pool1", NodeState::Pending);
        assert!(!failed.is_fatal_for_run());
    }
}
