//! Resource naming conventions.
//!
//! Every rule that maps a cloud resource name to a pool lives here so the
//! convention can be changed in one place. All functions are pure.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Pool name the control plane is always provisioned under.
pub const MASTER_POOL_NAME: &str = "master";

/// Windows scale-set instances: four suffix digits, the platform marker and zero padding.
static WINDOWS_VMSS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{4}k8s0+").expect("valid windows vmss regex"));

/// Linux scale-set instances: `k8s-<pool>-<suffix>-vmss<instance>`.
static VMSS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^k8s-(.+)-([0-9]+)-vmss.*$").expect("valid vmss regex"));

/// Width of the base-36 instance suffix appended to scale-set computer names.
const VMSS_INSTANCE_SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PoolRole {
    ControlPlane,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OsType {
    Linux,
    Windows,
}

impl OsType {
    /// Parse the model's `osType` field. Anything that is not Windows is Linux.
    pub fn from_model(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("windows") => Self::Windows,
            _ => Self::Linux,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Availability {
    AvailabilitySet,
    VirtualMachineScaleSets,
}

impl Availability {
    /// Parse the model's `availabilityProfile`. Unset means discrete VMs.
    pub fn from_model(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("VirtualMachineScaleSets") => {
                Self::VirtualMachineScaleSets
            }
            _ => Self::AvailabilitySet,
        }
    }

    pub const fn is_scale_set(self) -> bool {
        matches!(self, Self::VirtualMachineScaleSets)
    }
}

/// What the matcher needs to know about one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolProfile {
    pub name: String,
    pub role: PoolRole,
    pub os_type: OsType,
    pub availability: Availability,
    /// Position among the worker pools; zero for the control plane.
    pub index: usize,
    /// Number of nodes the model declares for this pool.
    pub count: u32,
    /// Name prefix of discrete VMs in this pool, followed by the node index.
    pub vm_name_prefix: String,
}

impl PoolProfile {
    pub fn control_plane(count: u32, availability: Availability, suffix: &str) -> Self {
        Self {
            name: MASTER_POOL_NAME.to_string(),
            role: PoolRole::ControlPlane,
            os_type: OsType::Linux,
            availability,
            index: 0,
            count,
            vm_name_prefix: vm_name_prefix(MASTER_POOL_NAME, OsType::Linux, 0, suffix),
        }
    }

    pub fn worker(
        name: &str,
        index: usize,
        count: u32,
        os_type: OsType,
        availability: Availability,
        suffix: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            role: PoolRole::Worker,
            os_type,
            availability,
            index,
            count,
            vm_name_prefix: vm_name_prefix(name, os_type, index, suffix),
        }
    }

    pub fn is_control_plane(&self) -> bool {
        self.role == PoolRole::ControlPlane
    }

    /// Name of the discrete VM at `index`.
    pub fn vm_name(&self, index: u32) -> String {
        format!("{}{}", self.vm_name_prefix, index)
    }
}

/// Prefix of discrete VM names for a pool.
pub fn vm_name_prefix(pool: &str, os_type: OsType, pool_index: usize, suffix: &str) -> String {
    match os_type {
        OsType::Windows => format!("{}k8s{:02}", short_suffix(suffix), pool_index),
        OsType::Linux => format!("k8s-{}-{}-", pool, suffix),
    }
}

/// First four characters of the suffix, as used by Windows computer names.
fn short_suffix(suffix: &str) -> &str {
    suffix.get(..4).unwrap_or(suffix)
}

/// Split a Linux scale-set name into `(pool, suffix)`.
pub fn vmss_name_parts(name: &str) -> Option<(String, String)> {
    let caps = VMSS_RE.captures(name)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

pub fn is_windows_vmss_name(name: &str) -> bool {
    WINDOWS_VMSS_RE.is_match(name)
}

/// Whether a resource name carries this cluster's identity.
///
/// Windows computer names are too short for the full suffix and only keep its
/// first four characters in front of `k8s`.
pub fn belongs_to_cluster(name: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return false;
    }
    if name.contains(suffix) {
        return true;
    }
    suffix.len() >= 4 && name.starts_with(&format!("{}k8s", short_suffix(suffix)))
}

/// Whether `name` is a node of `pool`.
pub fn matches_pool(name: &str, pool: &PoolProfile) -> bool {
    if pool.availability.is_scale_set() {
        return match pool.os_type {
            OsType::Windows => is_windows_vmss_name(name),
            OsType::Linux => vmss_name_parts(name).is_some_and(|(p, _)| p == pool.name),
        };
    }

    name.strip_prefix(&pool.vm_name_prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Recover the node index from a name already known to match `pool`.
///
/// Discrete VMs end in a decimal index; scale-set computer names end in a
/// six character base-36 instance id.
pub fn node_index(name: &str, pool: &PoolProfile) -> Option<u32> {
    if pool.availability.is_scale_set() {
        let start = name.len().checked_sub(VMSS_INSTANCE_SUFFIX_LEN)?;
        let tail = name.get(start..)?;
        return u32::from_str_radix(tail, 36).ok();
    }

    name.strip_prefix(&pool.vm_name_prefix)?.parse().ok()
}
