//! Topology discovery: which cloud resources make up which pool.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::cloud::{CloudResourceClient, ResourceDescriptor};
use crate::error::{KruError, Result};
use crate::naming::{self, MASTER_POOL_NAME, PoolProfile};

/// Snapshot of the cluster's compute resources, grouped by pool.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Pool name to its nodes, ordered by node index then name.
    pub pools: BTreeMap<String, Vec<ResourceDescriptor>>,
    /// Cluster resources that match no pool.
    pub unmatched: Vec<String>,
    /// Indices a discrete pool declares but the cloud no longer has.
    pub missing_slots: BTreeMap<String, Vec<u32>>,
}

impl Topology {
    pub fn nodes(&self, pool: &str) -> &[ResourceDescriptor] {
        self.pools.get(pool).map_or(&[], Vec::as_slice)
    }

    pub fn missing(&self, pool: &str) -> &[u32] {
        self.missing_slots.get(pool).map_or(&[], Vec::as_slice)
    }
}

fn looks_like_control_plane(resource: &ResourceDescriptor) -> bool {
    resource.pool_tag() == Some(MASTER_POOL_NAME)
        || resource.name.contains(&format!("-{}-", MASTER_POOL_NAME))
}

/// Pick the pool for one resource.
///
/// Pools are tried in order, control plane first. When several match (two
/// Windows scale-set pools, for instance) the `poolName` tag decides.
fn resolve_pool<'a>(resource: &ResourceDescriptor, pools: &'a [PoolProfile]) -> Option<&'a PoolProfile> {
    let mut candidates = pools
        .iter()
        .filter(|p| naming::matches_pool(&resource.name, p))
        .peekable();

    let first = candidates.next()?;
    if candidates.peek().is_none() {
        return Some(first);
    }

    let tagged = resource.pool_tag();
    std::iter::once(first)
        .chain(candidates)
        .find(|p| Some(p.name.as_str()) == tagged)
        .or(Some(first))
}

/// Group `resources` into pools. Pure; used by [`discover_topology`].
pub fn build_topology(
    resources: Vec<ResourceDescriptor>,
    name_suffix: &str,
    pools: &[PoolProfile],
) -> Result<Topology> {
    let mut topology = Topology::default();
    for pool in pools {
        topology.pools.insert(pool.name.clone(), Vec::new());
    }

    for resource in resources {
        if !naming::belongs_to_cluster(&resource.name, name_suffix) {
            debug!("Skipping {}: not part of cluster {}", resource.name, name_suffix);
            continue;
        }

        match resolve_pool(&resource, pools) {
            Some(pool) => {
                if looks_like_control_plane(&resource) && !pool.is_control_plane() {
                    return Err(KruError::TopologyIncomplete(format!(
                        "control plane node {} resolved to worker pool {}",
                        resource.name, pool.name
                    )));
                }
                debug!("Resource {} belongs to pool {}", resource.name, pool.name);
                topology
                    .pools
                    .entry(pool.name.clone())
                    .or_default()
                    .push(resource);
            }
            None if looks_like_control_plane(&resource) => {
                return Err(KruError::TopologyIncomplete(format!(
                    "control plane node {} does not match the control plane pool",
                    resource.name
                )));
            }
            None => {
                warn!(
                    "Resource {} matches no pool of cluster {}, leaving it alone",
                    resource.name, name_suffix
                );
                topology.unmatched.push(resource.name);
            }
        }
    }

    for pool in pools {
        let Some(nodes) = topology.pools.get_mut(&pool.name) else {
            continue;
        };
        nodes.sort_by(|a, b| {
            naming::node_index(&a.name, pool)
                .cmp(&naming::node_index(&b.name, pool))
                .then_with(|| a.name.cmp(&b.name))
        });

        if !pool.availability.is_scale_set() {
            let missing: Vec<u32> = (0..pool.count)
                .filter(|i| {
                    !nodes
                        .iter()
                        .any(|n| naming::node_index(&n.name, pool) == Some(*i))
                })
                .collect();
            if !missing.is_empty() {
                warn!("Pool {} is missing nodes at indices {:?}", pool.name, missing);
                topology.missing_slots.insert(pool.name.clone(), missing);
            }
        }
    }

    if topology.nodes(MASTER_POOL_NAME).is_empty() {
        return Err(KruError::TopologyIncomplete(format!(
            "no control plane node found for cluster {}",
            name_suffix
        )));
    }

    Ok(topology)
}

/// List the resource group and group its resources into pools.
pub async fn discover_topology(
    cloud: &dyn CloudResourceClient,
    resource_group: &str,
    name_suffix: &str,
    pools: &[PoolProfile],
) -> Result<Topology> {
    let resources = cloud.list_compute_resources(resource_group).await?;
    debug!(
        "Discovered {} resources in resource group {}",
        resources.len(),
        resource_group
    );
    build_topology(resources, name_suffix, pools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{Availability, OsType};

    const SUFFIX: &str = "38912981";

    fn resource(name: &str, tags: &[(&str, &str)]) -> ResourceDescriptor {
        ResourceDescriptor {
            id: format!("/subscriptions/s/resourceGroups/rg/vm/{}", name),
            name: name.to_string(),
            location: "westus2".to_string(),
            scale_set: None,
            instance_id: None,
            tags: tags
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            image: None,
            vm_size: None,
            os_type: OsType::Linux,
        }
    }

    fn pools() -> Vec<PoolProfile> {
        vec![
            PoolProfile::control_plane(3, Availability::AvailabilitySet, SUFFIX),
            PoolProfile::worker(
                "pool1",
                0,
                2,
                OsType::Linux,
                Availability::VirtualMachineScaleSets,
                SUFFIX,
            ),
            PoolProfile::worker(
                "agent",
                1,
                2,
                OsType::Linux,
                Availability::AvailabilitySet,
                SUFFIX,
            ),
        ]
    }

    fn masters() -> Vec<ResourceDescriptor> {
        vec![
            resource("k8s-master-38912981-2", &[]),
            resource("k8s-master-38912981-0", &[]),
            resource("k8s-master-38912981-1", &[]),
        ]
    }

    #[test]
    fn test_groups_and_orders_nodes() {
        let mut resources = masters();
        resources.push(resource("k8s-pool1-38912981-vmss000002", &[]));
        resources.push(resource("k8s-pool1-38912981-vmss000000", &[]));
        resources.push(resource("k8s-agent-38912981-1", &[]));
        resources.push(resource("k8s-agent-38912981-0", &[]));

        let topology = build_topology(resources, SUFFIX, &pools()).unwrap();
        let names = |pool: &str| -> Vec<String> {
            topology.nodes(pool).iter().map(|n| n.name.clone()).collect()
        };
        assert_eq!(
            names("master"),
            vec![
                "k8s-master-38912981-0",
                "k8s-master-38912981-1",
                "k8s-master-38912981-2"
            ]
        );
        assert_eq!(
            names("pool1"),
            vec!["k8s-pool1-38912981-vmss000000", "k8s-pool1-38912981-vmss000002"]
        );
        assert_eq!(names("agent"), vec!["k8s-agent-38912981-0", "k8s-agent-38912981-1"]);
        assert!(topology.missing_slots.is_empty());
    }

    #[test]
    fn test_foreign_suffix_excluded() {
        let mut resources = masters();
        resources.push(resource("k8s-pool1-11111111-vmss000000", &[]));
        resources.push(resource("k8s-master-11111111-0", &[]));

        let topology = build_topology(resources, SUFFIX, &pools()).unwrap();
        assert!(topology.nodes("pool1").is_empty());
        assert_eq!(topology.nodes("master").len(), 3);
        assert!(topology.unmatched.is_empty());
    }

    #[test]
    fn test_unmatched_worker_is_warning() {
        let mut resources = masters();
        resources.push(resource("k8s-oldpool-38912981-vmss000000", &[]));

        let topology = build_topology(resources, SUFFIX, &pools()).unwrap();
        assert_eq!(topology.unmatched, vec!["k8s-oldpool-38912981-vmss000000"]);
    }

    #[test]
    fn test_no_control_plane_is_incomplete() {
        let resources = vec![resource("k8s-pool1-38912981-vmss000000", &[])];
        let err = build_topology(resources, SUFFIX, &pools()).unwrap_err();
        assert!(matches!(err, KruError::TopologyIncomplete(_)));
    }

    #[test]
    fn test_unresolvable_control_plane_is_incomplete() {
        let mut resources = masters();
        resources.push(resource("k8s-master-38912981-vmss000000", &[]));
        let err = build_topology(resources, SUFFIX, &pools()).unwrap_err();
        assert!(matches!(err, KruError::TopologyIncomplete(_)));

        let mut resources = masters();
        resources.push(resource("38912981-cp-extra", &[("poolName", "master")]));
        let err = build_topology(resources, SUFFIX, &pools()).unwrap_err();
        assert!(matches!(err, KruError::TopologyIncomplete(_)));
    }

    #[test]
    fn test_missing_slots_reported_for_discrete_pools() {
        let mut resources = masters();
        resources.retain(|r| r.name != "k8s-master-38912981-1");
        resources.push(resource("k8s-agent-38912981-0", &[]));

        let topology = build_topology(resources, SUFFIX, &pools()).unwrap();
        assert_eq!(topology.missing("master"), &[1]);
        assert_eq!(topology.missing("agent"), &[1]);
        assert!(topology.missing("pool1").is_empty());
    }

    #[test]
    fn test_pool_tag_breaks_ties() {
        let pools = vec![
            PoolProfile::control_plane(1, Availability::AvailabilitySet, SUFFIX),
            PoolProfile::worker(
                "win1",
                0,
                1,
                OsType::Windows,
                Availability::VirtualMachineScaleSets,
                SUFFIX,
            ),
            PoolProfile::worker(
                "win2",
                1,
                1,
                OsType::Windows,
                Availability::VirtualMachineScaleSets,
                SUFFIX,
            ),
        ];
        let resources = vec![
            resource("k8s-master-38912981-0", &[]),
            resource("3891k8s001000", &[("poolName", "win2")]),
            resource("3891k8s000000", &[]),
        ];

        let topology = build_topology(resources, SUFFIX, &pools).unwrap();
        assert_eq!(topology.nodes("win2")[0].name, "3891k8s001000");
        assert_eq!(topology.nodes("win1")[0].name, "3891k8s000000");
    }

    #[test]
    fn test_windows_scale_set_names_need_cluster_prefix() {
        let mut pools = pools();
        pools.push(PoolProfile::worker(
            "win",
            2,
            2,
            OsType::Windows,
            Availability::VirtualMachineScaleSets,
            SUFFIX,
        ));
        let mut resources = masters();
        resources.push(resource("0123k8s009000", &[]));
        resources.push(resource("3891k8s009000", &[]));

        let topology = build_topology(resources, SUFFIX, &pools).unwrap();
        let win: Vec<&str> = topology.nodes("win").iter().map(|n| n.name.as_str()).collect();
        assert_eq!(win, vec!["3891k8s009000"]);
        assert!(topology.nodes("pool1").is_empty());
        assert!(topology.nodes("agent").is_empty());
        assert_eq!(topology.nodes("master").len(), 3);
        assert!(topology.unmatched.is_empty());
    }

    struct ListOnly(Vec<ResourceDescriptor>);

    #[async_trait::async_trait]
    impl CloudResourceClient for ListOnly {
        async fn list_compute_resources(&self, _: &str) -> Result<Vec<ResourceDescriptor>> {
            Ok(self.0.clone())
        }
        async fn delete_compute_resource(&self, _: &ResourceDescriptor) -> Result<()> {
            unreachable!()
        }
        async fn create_compute_resource(
            &self,
            _: &crate::cloud::CreateResourceSpec,
        ) -> Result<ResourceDescriptor> {
            unreachable!()
        }
        async fn image_available(&self, _: &str, _: &crate::cloud::ImageReference) -> Result<bool> {
            unreachable!()
        }
        async fn ensure_resource_group(&self, _: &str, _: &str) -> Result<()> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_discover_topology_lists_resource_group() {
        let cloud = ListOnly(masters());
        let topology = discover_topology(&cloud, "rg", SUFFIX, &pools()).await.unwrap();
        assert_eq!(topology.nodes("master").len(), 3);
    }
}
