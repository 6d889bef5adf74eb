//! `kube` backed node scheduler.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Api;
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{NodeScheduler, POLL_INTERVAL};
use crate::error::{KruError, Result};

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Pods that a drain has to move off the node.
///
/// DaemonSet pods are recreated on the node anyway, mirror pods cannot be
/// evicted through the API, and finished pods hold no workload.
pub fn is_evictable(pod: &Pod) -> bool {
    let daemonset_owned = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    if daemonset_owned {
        return false;
    }

    let mirror = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
    if mirror {
        return false;
    }

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded" | "Failed"))
}

/// Node is Ready and its kubelet runs `version` (with or without a `v` prefix).
pub fn is_ready_at(node: &Node, version: &str) -> bool {
    let Some(status) = node.status.as_ref() else {
        return false;
    };

    let ready = status
        .conditions
        .as_ref()
        .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"));

    let kubelet = status
        .node_info
        .as_ref()
        .map(|i| i.kubelet_version.trim_start_matches('v'));

    ready && kubelet == Some(version.trim_start_matches('v'))
}

fn pod_ref(pod: &Pod) -> (String, String) {
    (
        pod.metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

pub struct KubeNodeScheduler {
    client: kube::Client,
    poll_interval: Duration,
}

impl KubeNodeScheduler {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            poll_interval: POLL_INTERVAL,
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn pods_on(&self, node: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
        let list = pods.list(&params).await.map_err(|e| {
            KruError::KubernetesApi(format!("Failed to list pods on node {}: {}", node, e))
        })?;
        Ok(list.items)
    }
}

#[async_trait]
impl NodeScheduler for KubeNodeScheduler {
    async fn cordon(&self, node: &str) -> Result<()> {
        let patch = json!({ "spec": { "unschedulable": true } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| KruError::KubernetesApi(format!("Failed to cordon node {}: {}", node, e)))?;
        info!("Cordoned node {}", node);
        Ok(())
    }

    async fn drain(&self, node: &str) -> Result<()> {
        loop {
            let remaining: Vec<Pod> = self
                .pods_on(node)
                .await?
                .into_iter()
                .filter(is_evictable)
                .collect();

            if remaining.is_empty() {
                info!("Drained node {}", node);
                return Ok(());
            }

            debug!("{} pods left on node {}", remaining.len(), node);

            for pod in &remaining {
                let (namespace, name) = pod_ref(pod);
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
                match pods.evict(&name, &EvictParams::default()).await {
                    Ok(_) => debug!("Evicted pod {}/{}", namespace, name),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(kube::Error::Api(ae)) if ae.code == 429 => {
                        debug!(
                            "Eviction of {}/{} blocked by a disruption budget, retrying",
                            namespace, name
                        );
                    }
                    Err(e) => {
                        return Err(KruError::KubernetesApi(format!(
                            "Failed to evict pod {}/{} from node {}: {}",
                            namespace, name, node, e
                        )));
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_ready(&self, node: &str, version: &str) -> Result<()> {
        loop {
            match self.nodes().get_opt(node).await {
                Ok(Some(n)) if is_ready_at(&n, version) => {
                    info!("Node {} is Ready at {}", node, version);
                    return Ok(());
                }
                Ok(Some(_)) => debug!("Node {} registered but not ready at {}", node, version),
                Ok(None) => debug!("Node {} has not registered yet", node),
                Err(e) => warn!("Failed to get node {}: {}", node, e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        match self.nodes().delete(node, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted node object {}", node);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(KruError::KubernetesApi(format!(
                "Failed to delete node {}: {}",
                node, e
            ))),
        }
    }
}
