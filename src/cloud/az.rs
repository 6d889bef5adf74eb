//! Cloud resource client backed by the Azure CLI.
//!
//! Shells out to `az` with `--output json` and parses the result. Discrete
//! VMs map to `az vm`, scale-set instances to `az vmss`.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{
    CloudResourceClient, CreateResourceSpec, ImageReference, ResourceDescriptor, TAG_ORCHESTRATOR,
};
use crate::error::{KruError, Result};
use crate::naming::OsType;

const COMPONENT: &str = "cloud::az";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzVm {
    id: String,
    name: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    hardware_profile: Option<AzHardwareProfile>,
    #[serde(default)]
    storage_profile: Option<AzStorageProfile>,
    #[serde(default)]
    os_profile: Option<AzOsProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzVmss {
    name: String,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    sku: Option<AzSku>,
    #[serde(default)]
    virtual_machine_profile: Option<AzVmssProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzVmssInstance {
    id: String,
    instance_id: String,
    name: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    latest_model_applied: Option<bool>,
    #[serde(default)]
    storage_profile: Option<AzStorageProfile>,
    #[serde(default)]
    os_profile: Option<AzOsProfile>,
    #[serde(default)]
    sku: Option<AzSku>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzVmssProfile {
    #[serde(default)]
    storage_profile: Option<AzStorageProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzHardwareProfile {
    #[serde(default)]
    vm_size: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzStorageProfile {
    #[serde(default)]
    image_reference: Option<AzImageReference>,
    #[serde(default)]
    os_disk: Option<AzOsDisk>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzImageReference {
    publisher: Option<String>,
    offer: Option<String>,
    sku: Option<String>,
    version: Option<String>,
}

impl AzImageReference {
    fn into_image(self) -> Option<ImageReference> {
        Some(ImageReference {
            publisher: self.publisher?,
            offer: self.offer?,
            sku: self.sku?,
            version: self.version?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzOsDisk {
    #[serde(default)]
    os_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzOsProfile {
    #[serde(default)]
    computer_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AzSku {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AzCreated {
    id: String,
    #[serde(default)]
    location: Option<String>,
}

fn image_of(storage: Option<&AzStorageProfile>) -> Option<ImageReference> {
    storage
        .and_then(|s| s.image_reference.clone())
        .and_then(AzImageReference::into_image)
}

fn os_of(storage: Option<&AzStorageProfile>) -> OsType {
    OsType::from_model(
        storage
            .and_then(|s| s.os_disk.as_ref())
            .and_then(|d| d.os_type.as_deref()),
    )
}

/// Resource group segment of an ARM resource id.
fn resource_group_of(id: &str) -> Option<&str> {
    let mut parts = id.split('/');
    while let Some(part) = parts.next() {
        if part.eq_ignore_ascii_case("resourceGroups") {
            return parts.next();
        }
    }
    None
}

fn vm_descriptor(vm: AzVm) -> ResourceDescriptor {
    let os_type = os_of(vm.storage_profile.as_ref());
    let image = image_of(vm.storage_profile.as_ref());
    let name = vm
        .os_profile
        .and_then(|p| p.computer_name)
        .unwrap_or(vm.name);

    ResourceDescriptor {
        id: vm.id,
        name,
        location: vm.location,
        scale_set: None,
        instance_id: None,
        tags: vm.tags.unwrap_or_default(),
        image,
        vm_size: vm.hardware_profile.and_then(|h| h.vm_size),
        os_type,
    }
}

/// Instances inherit the scale set's tags. An instance that has not picked up
/// the latest scale-set model is not reported with the scale set's
/// orchestrator tag, since that tag describes the model and not the instance.
fn instance_descriptor(vmss: &AzVmss, instance: AzVmssInstance) -> ResourceDescriptor {
    let mut tags = vmss.tags.clone().unwrap_or_default();
    if instance.latest_model_applied == Some(false) {
        tags.remove(TAG_ORCHESTRATOR);
    }
    tags.extend(instance.tags.unwrap_or_default());

    let vmss_storage = vmss
        .virtual_machine_profile
        .as_ref()
        .and_then(|p| p.storage_profile.as_ref());
    let storage = instance.storage_profile.as_ref().or(vmss_storage);

    let name = instance
        .os_profile
        .and_then(|p| p.computer_name)
        .unwrap_or(instance.name);

    let vm_size = instance
        .sku
        .and_then(|s| s.name)
        .or_else(|| vmss.sku.as_ref().and_then(|s| s.name.clone()));

    ResourceDescriptor {
        id: instance.id,
        name,
        location: instance.location,
        scale_set: Some(vmss.name.clone()),
        instance_id: Some(instance.instance_id),
        tags,
        image: image_of(storage),
        vm_size,
        os_type: os_of(storage),
    }
}

fn tag_args(tags: &BTreeMap<String, String>) -> Vec<String> {
    tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

/// Azure CLI backed [`CloudResourceClient`].
#[derive(Debug, Clone)]
pub struct AzCliClient {
    binary: String,
    subscription: Option<String>,
}

impl Default for AzCliClient {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AzCliClient {
    pub fn new(subscription: Option<String>) -> Self {
        Self {
            binary: "az".to_string(),
            subscription,
        }
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args).args(["--output", "json"]);
        if let Some(subscription) = &self.subscription {
            cmd.args(["--subscription", subscription]);
        }

        debug!("Running: {} {}", self.binary, args.join(" "));

        let output = cmd.output().await.map_err(|e| {
            KruError::cloud(
                COMPONENT,
                format!("Failed to execute '{}': {}. Is the Azure CLI installed?", self.binary, e),
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KruError::cloud(COMPONENT, stderr.trim()));
        }

        Ok(output.stdout)
    }

    async fn run_json<T: DeserializeOwned>(&self, args: &[String]) -> Result<T> {
        let stdout = self.run(args).await?;
        serde_json::from_slice(&stdout).map_err(|e| {
            KruError::cloud(
                COMPONENT,
                format!("Failed to parse output of 'az {}': {}", args.join(" "), e),
            )
        })
    }

    async fn list_scale_sets(&self, resource_group: &str) -> Result<Vec<AzVmss>> {
        self.run_json(&args(&["vmss", "list", "--resource-group", resource_group]))
            .await
    }

    async fn list_instances(
        &self,
        resource_group: &str,
        scale_set: &str,
    ) -> Result<Vec<AzVmssInstance>> {
        self.run_json(&args(&[
            "vmss",
            "list-instances",
            "--resource-group",
            resource_group,
            "--name",
            scale_set,
        ]))
        .await
    }

    async fn create_vm(&self, spec: &CreateResourceSpec) -> Result<ResourceDescriptor> {
        let image = spec.image.as_ref().ok_or_else(|| {
            KruError::Configuration(format!("no image known for replacement VM {}", spec.name))
        })?;

        let mut cmd = args(&[
            "vm",
            "create",
            "--resource-group",
            &spec.resource_group,
            "--name",
            &spec.name,
            "--computer-name",
            &spec.name,
            "--location",
            &spec.location,
            "--image",
            &image.urn(),
        ]);
        if let Some(size) = &spec.vm_size {
            cmd.extend(args(&["--size", size]));
        }
        if !spec.tags.is_empty() {
            cmd.push("--tags".to_string());
            cmd.extend(tag_args(&spec.tags));
        }

        info!("Creating VM {} in pool {}", spec.name, spec.pool);
        let created: AzCreated = self.run_json(&cmd).await?;

        Ok(ResourceDescriptor {
            id: created.id,
            name: spec.name.clone(),
            location: created.location.unwrap_or_else(|| spec.location.clone()),
            scale_set: None,
            instance_id: None,
            tags: spec.tags.clone(),
            image: spec.image.clone(),
            vm_size: spec.vm_size.clone(),
            os_type: spec.os_type,
        })
    }

    /// Point the scale-set model at the new configuration, then add one
    /// instance and return it.
    async fn create_instance(
        &self,
        spec: &CreateResourceSpec,
        scale_set: &str,
    ) -> Result<ResourceDescriptor> {
        let before: BTreeSet<String> = self
            .list_instances(&spec.resource_group, scale_set)
            .await?
            .into_iter()
            .map(|i| i.instance_id)
            .collect();

        let mut update = args(&[
            "vmss",
            "update",
            "--resource-group",
            &spec.resource_group,
            "--name",
            scale_set,
            "--set",
        ]);
        update.extend(spec.tags.iter().map(|(k, v)| format!("tags.{}={}", k, v)));
        if let Some(image) = &spec.image {
            let prefix = "virtualMachineProfile.storageProfile.imageReference";
            update.push(format!("{}.publisher={}", prefix, image.publisher));
            update.push(format!("{}.offer={}", prefix, image.offer));
            update.push(format!("{}.sku={}", prefix, image.sku));
            update.push(format!("{}.version={}", prefix, image.version));
        }
        self.run(&update).await?;

        let capacity = u32::try_from(before.len()).unwrap_or(u32::MAX).saturating_add(1);
        info!(
            "Scaling {} to {} instances to replace index {} of pool {}",
            scale_set, capacity, spec.index, spec.pool
        );
        self.run(&args(&[
            "vmss",
            "scale",
            "--resource-group",
            &spec.resource_group,
            "--name",
            scale_set,
            "--new-capacity",
            &capacity.to_string(),
        ]))
        .await?;

        let scale_sets = self.list_scale_sets(&spec.resource_group).await?;
        let vmss = scale_sets
            .into_iter()
            .find(|s| s.name == scale_set)
            .ok_or_else(|| {
                KruError::cloud(COMPONENT, format!("Scale set {} disappeared", scale_set))
            })?;

        self.list_instances(&spec.resource_group, scale_set)
            .await?
            .into_iter()
            .find(|i| !before.contains(&i.instance_id))
            .map(|i| instance_descriptor(&vmss, i))
            .ok_or_else(|| {
                KruError::cloud(
                    COMPONENT,
                    format!("No new instance appeared in scale set {}", scale_set),
                )
            })
    }
}

/// `az` reports a missing image or resource as a plain error.
fn is_not_found(err: &KruError) -> bool {
    let KruError::CloudApi(_, message) = err else {
        return false;
    };
    let lower = message.to_lowercase();
    lower.contains("notfound") || lower.contains("not found") || lower.contains("could not find")
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

#[async_trait]
impl CloudResourceClient for AzCliClient {
    async fn list_compute_resources(
        &self,
        resource_group: &str,
    ) -> Result<Vec<ResourceDescriptor>> {
        let vms: Vec<AzVm> = self
            .run_json(&args(&["vm", "list", "--resource-group", resource_group]))
            .await?;
        let mut resources: Vec<ResourceDescriptor> = vms.into_iter().map(vm_descriptor).collect();

        for vmss in self.list_scale_sets(resource_group).await? {
            let instances = self.list_instances(resource_group, &vmss.name).await?;
            debug!("Scale set {} has {} instances", vmss.name, instances.len());
            resources.extend(instances.into_iter().map(|i| instance_descriptor(&vmss, i)));
        }

        debug!(
            "Found {} compute resources in resource group {}",
            resources.len(),
            resource_group
        );
        Ok(resources)
    }

    async fn delete_compute_resource(&self, resource: &ResourceDescriptor) -> Result<()> {
        match (&resource.scale_set, &resource.instance_id) {
            (Some(scale_set), Some(instance_id)) => {
                let resource_group = resource_group_of(&resource.id).ok_or_else(|| {
                    KruError::cloud(
                        COMPONENT,
                        format!("Cannot find resource group in id {}", resource.id),
                    )
                })?;
                info!(
                    "Deleting instance {} ({}) of scale set {}",
                    instance_id, resource.name, scale_set
                );
                self.run(&args(&[
                    "vmss",
                    "delete-instances",
                    "--resource-group",
                    resource_group,
                    "--name",
                    scale_set,
                    "--instance-ids",
                    instance_id,
                ]))
                .await?;
            }
            _ => {
                info!("Deleting VM {}", resource.name);
                self.run(&args(&["vm", "delete", "--ids", &resource.id, "--yes"]))
                    .await?;
            }
        }
        Ok(())
    }

    async fn create_compute_resource(
        &self,
        spec: &CreateResourceSpec,
    ) -> Result<ResourceDescriptor> {
        match &spec.scale_set {
            Some(scale_set) => self.create_instance(spec, scale_set).await,
            None => self.create_vm(spec).await,
        }
    }

    async fn image_available(&self, location: &str, image: &ImageReference) -> Result<bool> {
        let urn = image.urn();
        debug!("Checking image {} in {}", urn, location);
        match self
            .run(&args(&["vm", "image", "show", "--location", location, "--urn", &urn]))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ensure_resource_group(&self, name: &str, location: &str) -> Result<()> {
        debug!("Ensuring resource group {} in {}", name, location);
        self.run(&args(&[
            "group",
            "create",
            "--name",
            name,
            "--location",
            location,
        ]))
        .await?;
        Ok(())
    }
}
