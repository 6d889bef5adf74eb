//! In-memory cloud and scheduler used by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use kru::cloud::{
    CloudResourceClient, CreateResourceSpec, ImageReference, ResourceDescriptor, TAG_ORCHESTRATOR,
    TAG_POOL_NAME, orchestrator_tag,
};
use kru::error::{KruError, Result};
use kru::k8s::NodeScheduler;
use kru::model::{ClusterModel, WindowsImage};
use kru::naming::OsType;
use kru::upgrade::{DrainTimeoutPolicy, PoolSelection, RunConfig, Timeouts};

pub const SUFFIX: &str = "38912981";
pub const FROM: &str = "1.23.5";
pub const TARGET: &str = "1.24.0";

/// Calls made against either fake, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Cordon(String),
    Drain(String),
    Delete(String),
    Create(String),
    WaitReady(String),
    DeleteNode(String),
}

impl Event {
    pub fn node(&self) -> &str {
        match self {
            Self::Cordon(n)
            | Self::Drain(n)
            | Self::Delete(n)
            | Self::Create(n)
            | Self::WaitReady(n)
            | Self::DeleteNode(n) => n,
        }
    }
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// Pool a test node name belongs to: `k8s-<pool>-<suffix>-...`.
pub fn pool_of(node: &str) -> &str {
    node.split('-').nth(1).unwrap_or_default()
}

pub fn node_name(pool: &str, index: u32) -> String {
    format!("k8s-{pool}-{SUFFIX}-{index}")
}

pub fn descriptor(name: &str, version: &str) -> ResourceDescriptor {
    ResourceDescriptor {
        id: format!("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/{name}"),
        name: name.to_string(),
        location: "westus2".to_string(),
        scale_set: None,
        instance_id: None,
        tags: BTreeMap::from([
            (TAG_ORCHESTRATOR.to_string(), orchestrator_tag(version)),
            (TAG_POOL_NAME.to_string(), pool_of(name).to_string()),
        ]),
        image: None,
        vm_size: Some("Standard_D2s_v3".to_string()),
        os_type: OsType::Linux,
    }
}

/// Discrete VMs for every declared slot of `pools`, all at `version`.
pub fn fleet(pools: &[(&str, u32)], version: &str) -> Vec<ResourceDescriptor> {
    pools
        .iter()
        .flat_map(|(pool, count)| (0..*count).map(move |i| descriptor(&node_name(pool, i), version)))
        .collect()
}

/// Model with three control plane nodes and two discrete worker pools.
pub fn model() -> ClusterModel {
    serde_json::from_str(&format!(
        r#"{{
            "location": "westus2",
            "properties": {{
                "clusterID": "{SUFFIX}",
                "orchestratorProfile": {{"orchestratorType": "Kubernetes", "orchestratorVersion": "{FROM}"}},
                "masterProfile": {{"count": 3, "dnsPrefix": "demo", "vmSize": "Standard_D2s_v3"}},
                "agentPoolProfiles": [
                    {{"name": "pool1", "count": 4, "vmSize": "Standard_D4s_v3", "availabilityProfile": "AvailabilitySet"}},
                    {{"name": "pool2", "count": 2, "vmSize": "Standard_D4s_v3", "availabilityProfile": "AvailabilitySet"}}
                ]
            }}
        }}"#
    ))
    .expect("valid test model")
}

pub fn default_fleet() -> Vec<ResourceDescriptor> {
    fleet(&[("master", 3), ("pool1", 4), ("pool2", 2)], FROM)
}

pub fn run_config() -> RunConfig {
    RunConfig {
        resource_group: "rg".to_string(),
        location: "westus2".to_string(),
        target_version: TARGET.to_string(),
        supported_upgrades: vec![TARGET.to_string()],
        force: false,
        selection: PoolSelection::default(),
        timeouts: Timeouts {
            step: Duration::from_secs(600),
            cordon_drain: Duration::from_secs(300),
        },
        drain_timeout_policy: DrainTimeoutPolicy::Fail,
        max_unavailable: 1,
        windows_image: WindowsImage::default(),
        build_tag: "test".to_string(),
        dry_run: false,
    }
}

/// Compute resources held in memory. Deleting and creating mutate the fleet.
pub struct FakeCloud {
    pub resources: Mutex<Vec<ResourceDescriptor>>,
    pub events: EventLog,
    /// Deletes of these nodes never return.
    pub hang_delete: HashSet<String>,
    /// Creates of these nodes fail.
    pub fail_create: HashSet<String>,
    /// Image URNs the cloud does not carry.
    pub missing_images: HashSet<String>,
    /// Image URNs checked, in order.
    pub image_checks: Mutex<Vec<String>>,
    next_instance: Mutex<u32>,
}

impl FakeCloud {
    pub fn new(resources: Vec<ResourceDescriptor>, events: EventLog) -> Self {
        Self {
            resources: Mutex::new(resources),
            events,
            hang_delete: HashSet::new(),
            fail_create: HashSet::new(),
            missing_images: HashSet::new(),
            image_checks: Mutex::new(Vec::new()),
            next_instance: Mutex::new(10),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.resources
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<ResourceDescriptor> {
        self.resources
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl CloudResourceClient for FakeCloud {
    async fn list_compute_resources(&self, _resource_group: &str) -> Result<Vec<ResourceDescriptor>> {
        Ok(self.resources.lock().unwrap().clone())
    }

    async fn delete_compute_resource(&self, resource: &ResourceDescriptor) -> Result<()> {
        self.record(Event::Delete(resource.name.clone()));
        if self.hang_delete.contains(&resource.name) {
            std::future::pending::<()>().await;
        }
        self.resources
            .lock()
            .unwrap()
            .retain(|r| r.id != resource.id);
        Ok(())
    }

    async fn create_compute_resource(&self, spec: &CreateResourceSpec) -> Result<ResourceDescriptor> {
        self.record(Event::Create(spec.name.clone()));
        if self.fail_create.contains(&spec.name) {
            return Err(KruError::CloudApi(
                "vm create".to_string(),
                format!("quota exceeded creating {}", spec.name),
            ));
        }

        let (name, instance_id) = match &spec.scale_set {
            Some(scale_set) => {
                let mut next = self.next_instance.lock().unwrap();
                *next += 1;
                (format!("{scale_set}{:06}", *next), Some(next.to_string()))
            }
            None => (spec.name.clone(), None),
        };

        let created = ResourceDescriptor {
            id: format!("/subscriptions/sub/resourceGroups/{}/vm/{name}", spec.resource_group),
            name,
            location: spec.location.clone(),
            scale_set: spec.scale_set.clone(),
            instance_id,
            tags: spec.tags.clone(),
            image: spec.image.clone(),
            vm_size: spec.vm_size.clone(),
            os_type: spec.os_type,
        };
        self.resources.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn image_available(&self, _location: &str, image: &ImageReference) -> Result<bool> {
        let urn = image.urn();
        self.image_checks.lock().unwrap().push(urn.clone());
        Ok(!self.missing_images.contains(&urn))
    }

    async fn ensure_resource_group(&self, _name: &str, _location: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InFlight {
    pub current: usize,
    pub max: usize,
}

/// Scheduler that records calls and tracks how many nodes of each pool are
/// between cordon and readiness at once.
pub struct FakeScheduler {
    pub events: EventLog,
    /// Drains of these nodes never return.
    pub hang_drain: HashSet<String>,
    /// Simulated time each drain takes.
    pub drain_time: Duration,
    pub in_flight: Mutex<HashMap<String, InFlight>>,
}

impl FakeScheduler {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            hang_drain: HashSet::new(),
            drain_time: Duration::ZERO,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_in_flight(&self, pool: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap()
            .get(pool)
            .map_or(0, |f| f.max)
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl NodeScheduler for FakeScheduler {
    async fn cordon(&self, node: &str) -> Result<()> {
        self.record(Event::Cordon(node.to_string()));
        let mut in_flight = self.in_flight.lock().unwrap();
        let entry = in_flight.entry(pool_of(node).to_string()).or_default();
        entry.current += 1;
        entry.max = entry.max.max(entry.current);
        Ok(())
    }

    async fn drain(&self, node: &str) -> Result<()> {
        self.record(Event::Drain(node.to_string()));
        if self.hang_drain.contains(node) {
            std::future::pending::<()>().await;
        }
        if !self.drain_time.is_zero() {
            tokio::time::sleep(self.drain_time).await;
        }
        Ok(())
    }

    async fn wait_ready(&self, node: &str, _version: &str) -> Result<()> {
        self.record(Event::WaitReady(node.to_string()));
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(entry) = in_flight.get_mut(pool_of(node)) {
            entry.current = entry.current.saturating_sub(1);
        }
        Ok(())
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        self.record(Event::DeleteNode(node.to_string()));
        Ok(())
    }
}

pub fn events_for(log: &EventLog, pool: &str) -> Vec<Event> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|e| pool_of(e.node()) == pool)
        .cloned()
        .collect()
}

pub fn position(log: &EventLog, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
    log.lock().unwrap().iter().position(predicate)
}

pub fn rposition(log: &EventLog, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
    log.lock().unwrap().iter().rposition(predicate)
}
