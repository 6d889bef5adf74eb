//! Declarative cluster description (the "api model").
//!
//! Only the fields the upgrade reads or writes are typed. Everything else is
//! kept in `extra` maps so a load/save cycle does not lose data.

pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cloud::ImageReference;
use crate::error::{KruError, Result};
use crate::naming::{Availability, MASTER_POOL_NAME, OsType, PoolProfile};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    pub properties: Properties,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    pub orchestrator_profile: OrchestratorProfile,

    pub master_profile: MasterProfile,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_pool_profiles: Option<Vec<AgentPoolProfile>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows_profile: Option<WindowsProfile>,

    /// Cluster identity written at deployment time.
    #[serde(default, rename = "clusterID", skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Present only for Azure Stack style custom clouds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_cloud_profile: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorProfile {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub orchestrator_version: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MasterProfile {
    pub count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_profile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<ImageReference>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentPoolProfile {
    pub name: String,

    pub count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_profile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<ImageReference>,

    /// Version the pool's nodes were last upgraded to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_version: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentPoolProfile {
    pub fn os(&self) -> OsType {
        OsType::from_model(self.os_type.as_deref())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowsProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows_publisher: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows_offer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows_sku: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_version: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WindowsProfile {
    /// Marketplace image for Windows nodes, when fully specified.
    pub fn image(&self, version_override: Option<&str>) -> Option<ImageReference> {
        Some(ImageReference {
            publisher: self.windows_publisher.clone()?,
            offer: self.windows_offer.clone()?,
            sku: self.windows_sku.clone()?,
            version: version_override
                .map(str::to_string)
                .or_else(|| self.image_version.clone())?,
        })
    }
}

/// Which image replacement Windows nodes boot from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowsImage {
    /// The `windowsProfile` image, optionally at another version.
    Upgrade { version: Option<String> },
    /// Whatever image the node being replaced runs.
    Keep,
}

impl Default for WindowsImage {
    fn default() -> Self {
        Self::Upgrade { version: None }
    }
}

/// Lowercase a region name and drop its spaces ("West US 2" is "westus2").
pub fn normalize_location(location: &str) -> String {
    location
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

impl ClusterModel {
    pub fn orchestrator_version(&self) -> &str {
        &self.properties.orchestrator_profile.orchestrator_version
    }

    pub fn set_orchestrator_version(&mut self, version: &str) {
        self.properties.orchestrator_profile.orchestrator_version = version.to_string();
    }

    /// Cluster identity embedded in every resource name. Empty when the
    /// model carries no `clusterID`.
    pub fn name_suffix(&self) -> &str {
        self.properties.cluster_id.as_deref().unwrap_or_default()
    }

    /// The stored `clusterID`. Resource names cannot be matched without it.
    pub fn require_name_suffix(&self) -> Result<&str> {
        let suffix = self.name_suffix().trim();
        if suffix.is_empty() {
            return Err(KruError::Configuration(
                "api model has no properties.clusterID; it is written when the cluster \
                 is deployed and is needed to find the cluster's VMs"
                    .to_string(),
            ));
        }
        Ok(suffix)
    }

    pub fn location(&self) -> &str {
        self.location.as_deref().unwrap_or_default()
    }

    pub fn agent_pools(&self) -> &[AgentPoolProfile] {
        self.properties.agent_pool_profiles.as_deref().unwrap_or_default()
    }

    pub fn is_azure_stack(&self) -> bool {
        self.properties.custom_cloud_profile.is_some()
    }

    pub fn control_plane_availability(&self) -> Availability {
        Availability::from_model(
            self.properties
                .master_profile
                .availability_profile
                .as_deref(),
        )
    }

    /// Check the location given on the command line against the model.
    ///
    /// Both sides are compared normalized. An empty model location adopts the
    /// normalized flag value.
    pub fn reconcile_location(&mut self, location: &str) -> Result<()> {
        let flag = normalize_location(location);
        if flag.is_empty() {
            return Ok(());
        }
        if self.location().trim().is_empty() {
            self.location = Some(flag);
            return Ok(());
        }
        if normalize_location(self.location()) != flag {
            return Err(KruError::LocationMismatch {
                flag: location.to_string(),
                model: self.location().to_string(),
            });
        }
        Ok(())
    }

    /// Control plane first, then worker pools in declared order.
    pub fn pool_profiles(&self) -> Vec<PoolProfile> {
        let suffix = self.name_suffix();
        let master = &self.properties.master_profile;

        let mut pools = vec![PoolProfile::control_plane(
            master.count,
            self.control_plane_availability(),
            suffix,
        )];
        pools.extend(
            self.agent_pools()
                .iter()
                .enumerate()
                .map(|(index, pool)| {
                    PoolProfile::worker(
                        &pool.name,
                        index,
                        pool.count,
                        pool.os(),
                        Availability::from_model(pool.availability_profile.as_deref()),
                        suffix,
                    )
                }),
        );
        pools
    }

    pub fn agent_pool(&self, name: &str) -> Option<&AgentPoolProfile> {
        self.agent_pools().iter().find(|p| p.name == name)
    }

    /// Image new nodes of `pool` should be built with. `None` reuses the
    /// image of the node being replaced.
    pub fn desired_image(&self, pool: &str, windows: &WindowsImage) -> Option<ImageReference> {
        if pool == MASTER_POOL_NAME {
            return self.properties.master_profile.image_reference.clone();
        }
        let profile = self.agent_pool(pool)?;
        if profile.os() == OsType::Windows {
            let WindowsImage::Upgrade { version } = windows else {
                return None;
            };
            let image = self
                .properties
                .windows_profile
                .as_ref()
                .and_then(|w| w.image(version.as_deref()));
            if image.is_some() {
                return image;
            }
        }
        profile.image_reference.clone()
    }

    pub fn desired_vm_size(&self, pool: &str) -> Option<String> {
        if pool == MASTER_POOL_NAME {
            return self.properties.master_profile.vm_size.clone();
        }
        self.agent_pool(pool).and_then(|p| p.vm_size.clone())
    }

    /// Record that every node of `pool` now runs `version` with `image`.
    pub fn mark_pool_upgraded(&mut self, pool: &str, version: &str, image: Option<&ImageReference>) {
        if pool == MASTER_POOL_NAME {
            if let Some(image) = image {
                self.properties.master_profile.image_reference = Some(image.clone());
            }
            return;
        }

        let mut windows_version = None;
        if let Some(profile) = self
            .properties
            .agent_pool_profiles
            .iter_mut()
            .flatten()
            .find(|p| p.name == pool)
        {
            profile.orchestrator_version = Some(version.to_string());
            if let Some(image) = image {
                if profile.os() == OsType::Windows && self.properties.windows_profile.is_some() {
                    windows_version = Some(image.version.clone());
                } else {
                    profile.image_reference = Some(image.clone());
                }
            }
        }

        if let (Some(version), Some(windows)) =
            (windows_version, self.properties.windows_profile.as_mut())
        {
            windows.image_version = Some(version);
        }
    }
}
