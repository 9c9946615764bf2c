//! Configured device catalog
//!
//! Types describing which remote devices this node should track: the
//! selector that picks a device out of a target's export list, the stable
//! key that identifies a configured device across restarts, and the device
//! nodes handed to a workload on allocation.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use protocol::{Target, UsbDevice};

/// Stable identity of one configured device.
///
/// Derived from the resource name and a content hash of the device spec, so
/// the same configuration always yields the same key and any edit to a spec
/// retires the old key. Keys are plain strings on the wire; the cluster
/// reports them back verbatim when asked which devices workloads hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Wrap a key string received from an external source.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A host device node exposed to the allocated workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default = "default_permissions")]
    pub permissions: String,
}

fn default_permissions() -> String {
    "mrw".to_owned()
}

/// Selector matching a device within a target's export list.
///
/// Every field is optional; an omitted field matches anything. Bus ids are
/// wildcarded from both sides: an empty bus id on either the selector or
/// the candidate matches, since a target may renumber its bus after a
/// replug while vendor and product stay fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    #[serde(default, with = "hex_id", skip_serializing_if = "Option::is_none")]
    pub vendor: Option<u16>,
    #[serde(default, with = "hex_id", skip_serializing_if = "Option::is_none")]
    pub product: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_id: Option<String>,
}

impl DeviceFilter {
    pub fn matches(&self, candidate: &UsbDevice) -> bool {
        let bus_id_matches = match self.bus_id.as_deref() {
            None | Some("") => true,
            Some(bus_id) => candidate.bus_id.is_empty() || bus_id == candidate.bus_id,
        };
        bus_id_matches
            && self.vendor.is_none_or(|vendor| vendor == candidate.vendor)
            && self.product.is_none_or(|product| product == candidate.product)
    }
}

/// Vendor and product ids read and written as four-digit hex strings, the
/// form `lsusb` and sysfs use.
mod hex_id {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<u16>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(id) => serializer.serialize_some(&format!("{id:04x}")),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|text| u16::from_str_radix(&text, 16).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// One configured device: where to look for it, how to recognise it, and
/// which extra device nodes ride along on allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub target: Target,
    #[serde(rename = "match", default)]
    pub filter: DeviceFilter,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_devices: Vec<MountSpec>,
}

impl DeviceSpec {
    /// Content-addressed key for this spec under a resource name.
    pub fn key(&self, resource: &str) -> Result<DeviceKey, serde_json::Error> {
        let canonical = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&canonical);
        Ok(DeviceKey(format!("{resource}_{}", hex::encode(digest))))
    }
}

/// Tracked state of a configured device.
#[derive(Debug, Clone)]
pub struct KnownDevice {
    pub spec: DeviceSpec,
    /// Last listing entry that matched the filter, if any.
    pub observed: Option<UsbDevice>,
    /// Whether the device showed up in the most recent listing.
    pub available: bool,
}

impl KnownDevice {
    pub fn new(spec: DeviceSpec) -> Self {
        Self {
            spec,
            observed: None,
            available: false,
        }
    }

    pub fn target(&self) -> &Target {
        &self.spec.target
    }
}

/// A device currently attached to a local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub device: UsbDevice,
    pub target: Target,
    pub port: u8,
    pub dev_mount_path: PathBuf,
}
