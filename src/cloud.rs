//! Cloud compute resources as seen by the orchestrator.

pub mod az;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::naming::{OsType, PoolRole};

/// Tag recording the orchestrator version a VM was built for.
pub const TAG_ORCHESTRATOR: &str = "orchestrator";
pub const TAG_POOL_NAME: &str = "poolName";
pub const TAG_NAME_SUFFIX: &str = "resourceNameSuffix";
pub const TAG_BUILD: &str = "buildTag";

/// Value of the orchestrator tag for `version`.
pub fn orchestrator_tag(version: &str) -> String {
    format!("Kubernetes:{}", version)
}

/// Marketplace image a VM boots from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

impl ImageReference {
    /// `publisher:offer:sku:version`, the form `az vm create --image` accepts.
    pub fn urn(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.publisher, self.offer, self.sku, self.version
        )
    }
}

/// A compute resource found in, or created into, a resource group.
///
/// Scale-set instances carry the scale set name and instance id; `name` is
/// always the computer name the node registers under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub id: String,
    pub name: String,
    pub location: String,
    pub scale_set: Option<String>,
    pub instance_id: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub image: Option<ImageReference>,
    pub vm_size: Option<String>,
    pub os_type: OsType,
}

impl ResourceDescriptor {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Orchestrator version from the `orchestrator` tag, if well formed.
    pub fn orchestrator_version(&self) -> Option<&str> {
        self.tag(TAG_ORCHESTRATOR)?.strip_prefix("Kubernetes:")
    }

    pub fn pool_tag(&self) -> Option<&str> {
        self.tag(TAG_POOL_NAME)
    }

    /// Whether the resource was already built for `version` and, when given, `image`.
    pub fn is_at(&self, version: &str, image: Option<&ImageReference>) -> bool {
        if self.orchestrator_version() != Some(version) {
            return false;
        }
        match image {
            Some(image) => self.image.as_ref() == Some(image),
            None => true,
        }
    }
}

/// Everything needed to create a replacement node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResourceSpec {
    pub resource_group: String,
    pub location: String,
    /// Computer name for discrete VMs. Scale sets pick their own instance names.
    pub name: String,
    pub pool: String,
    pub role: PoolRole,
    pub index: u32,
    pub os_type: OsType,
    pub scale_set: Option<String>,
    /// `None` reuses the image of the resource being replaced.
    pub image: Option<ImageReference>,
    pub vm_size: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Low-level compute operations. Implementations do not retry.
#[async_trait]
pub trait CloudResourceClient: Send + Sync {
    async fn list_compute_resources(&self, resource_group: &str)
    -> Result<Vec<ResourceDescriptor>>;

    async fn delete_compute_resource(&self, resource: &ResourceDescriptor) -> Result<()>;

    async fn create_compute_resource(&self, spec: &CreateResourceSpec)
    -> Result<ResourceDescriptor>;

    /// Whether `image` can be deployed in `location`.
    async fn image_available(&self, location: &str, image: &ImageReference) -> Result<bool>;

    async fn ensure_resource_group(&self, name: &str, location: &str) -> Result<()>;
}
