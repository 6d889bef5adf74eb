//! Kubernetes client builder.

use std::path::Path;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

/// Build a client from an explicit kubeconfig file, or infer one from the
/// environment (`KUBECONFIG`, `~/.kube/config`, in-cluster).
pub async fn build_kube_client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            debug!("Loading kubeconfig from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    debug!("Kubernetes API server: {}", config.cluster_url);

    let client = kube::Client::try_from(config).context("Failed to build Kubernetes client")?;
    Ok(client)
}
