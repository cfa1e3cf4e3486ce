//! Device descriptors and the driver model.
//!
//! A device is a named flat config map whose `type` key selects the driver.
//! [`Devices`] holds the set for one instance and knows the deterministic
//! start order and how to diff two sets.

mod disk;
mod driver;
mod nic;
mod none;
mod registry;
mod unix_hotplug;

pub use driver::{
    DeviceContext, DeviceDriver, MountEntry, NetworkAttachment, PostHook, RootFs, RunConfig,
    UsbDevice, VolatileAccessor,
};
pub use nic::{random_mac, HostCommands, HostNetwork};
pub use registry::{DriverConstructor, DriverRegistry, LoadError};
pub use unix_hotplug::UsbFilter;

use crate::error::{CoreError, Result};
use crate::instance::ConfigMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Config map of a single device.
pub type DeviceConfig = ConfigMap;

/// Value of the `type` key, or "" when missing.
pub fn device_type(config: &DeviceConfig) -> &str {
    config.get("type").map(String::as_str).unwrap_or("")
}

fn nic_type(config: &DeviceConfig) -> &str {
    config.get("nictype").map(String::as_str).unwrap_or("")
}

/// True when two configs describe the same kind of device.
pub fn same_kind(a: &DeviceConfig, b: &DeviceConfig) -> bool {
    device_type(a) == device_type(b) && nic_type(a) == nic_type(b)
}

/// True for the root disk: a disk mounted at `/` with no external source.
pub fn is_root_disk(config: &DeviceConfig) -> bool {
    device_type(config) == "disk"
        && config.get("path").map(String::as_str) == Some("/")
        && config.get("source").map_or(true, String::is_empty)
}

/// Named devices of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Devices(BTreeMap<String, DeviceConfig>);

/// Result of comparing two device sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    /// Present only in the old set (old config).
    pub removed: Devices,
    /// Present only in the new set (new config).
    pub added: Devices,
    /// Same name, differing only in hot-updatable fields (new config).
    pub updated: Devices,
    /// Union of keys that differ between same-named devices.
    pub changed_fields: BTreeSet<String>,
}

impl DeviceDiff {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.updated.is_empty()
    }
}

impl Devices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&DeviceConfig> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, config: DeviceConfig) -> Option<DeviceConfig> {
        self.0.insert(name.into(), config)
    }

    pub fn remove(&mut self, name: &str) -> Option<DeviceConfig> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DeviceConfig)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// True when a device with this name and exactly this config exists.
    pub fn contains(&self, name: &str, config: &DeviceConfig) -> bool {
        self.0.get(name) == Some(config)
    }

    /// Devices in start order.
    ///
    /// NICs come first so guest interface names stay stable, then disks with
    /// the root disk first and parent paths before their children, then the
    /// remaining types grouped by type. Ties break on name.
    pub fn sorted(&self) -> Vec<(String, DeviceConfig)> {
        let mut devices: Vec<(String, DeviceConfig)> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        devices.sort_by(|(a_name, a), (b_name, b)| {
            sort_key(a_name, a).cmp(&sort_key(b_name, b))
        });
        devices
    }

    /// Devices in stop order: the exact reverse of [`Devices::sorted`].
    pub fn reversed(&self) -> Vec<(String, DeviceConfig)> {
        let mut devices = self.sorted();
        devices.reverse();
        devices
    }

    /// The single root disk.
    pub fn root_disk(&self) -> Result<(&str, &DeviceConfig)> {
        let mut roots = self.0.iter().filter(|(_, c)| is_root_disk(c));
        match (roots.next(), roots.next()) {
            (Some((name, config)), None) => Ok((name.as_str(), config)),
            (None, _) => Err(CoreError::Validation("no root disk device found".into())),
            (Some(_), Some(_)) => Err(CoreError::Validation(
                "more than one root disk device found".into(),
            )),
        }
    }

    /// Compare against `new`.
    ///
    /// `hot_fields(old, new)` returns the fields that may differ while the
    /// pair still counts as an in-place update. It is only consulted for
    /// same-named devices whose configs differ.
    pub fn diff<F>(&self, new: &Devices, hot_fields: F) -> DeviceDiff
    where
        F: Fn(&DeviceConfig, &DeviceConfig) -> Vec<String>,
    {
        let mut removed = Devices::new();
        let mut added = Devices::new();
        let mut updated = Devices::new();
        let mut changed_fields = BTreeSet::new();

        for (name, config) in &self.0 {
            if !new.contains(name, config) {
                removed.insert(name.clone(), config.clone());
            }
        }
        for (name, config) in &new.0 {
            if !self.contains(name, config) {
                added.insert(name.clone(), config.clone());
            }
        }

        let pairs: Vec<String> = added
            .names()
            .filter(|name| removed.get(name).is_some())
            .cloned()
            .collect();

        for name in pairs {
            let (Some(old), Some(new_config)) = (removed.get(&name), added.get(&name)) else {
                continue;
            };

            let differing = differing_keys(old, new_config);
            changed_fields.extend(differing.iter().cloned());

            let allowed = hot_fields(old, new_config);
            if differing.iter().all(|k| allowed.iter().any(|a| a == k)) {
                let config = new_config.clone();
                removed.remove(&name);
                added.remove(&name);
                updated.insert(name, config);
            }
        }

        DeviceDiff {
            removed,
            added,
            updated,
            changed_fields,
        }
    }
}

fn differing_keys(a: &DeviceConfig, b: &DeviceConfig) -> BTreeSet<String> {
    a.keys()
        .chain(b.keys())
        .filter(|k| a.get(*k) != b.get(*k))
        .cloned()
        .collect()
}

fn sort_key<'a>(name: &'a str, config: &'a DeviceConfig) -> (u8, &'a str, u8, &'a str, &'a str) {
    let kind = device_type(config);
    let class = match kind {
        "nic" => 0,
        "disk" => 1,
        _ => 2,
    };

    let (root_rank, path) = if kind == "disk" {
        let path = config.get("path").map(String::as_str).unwrap_or("");
        (if path == "/" { 0 } else { 1 }, path)
    } else {
        (0, "")
    };

    (class, kind, root_rank, path, name)
}

impl FromIterator<(String, DeviceConfig)> for Devices {
    fn from_iter<T: IntoIterator<Item = (String, DeviceConfig)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Devices {
    type Item = (String, DeviceConfig);
    type IntoIter = std::collections::btree_map::IntoIter<String, DeviceConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Devices {
    type Item = (&'a String, &'a DeviceConfig);
    type IntoIter = std::collections::btree_map::Iter<'a, String, DeviceConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
pub(crate) fn dev(pairs: &[(&str, &str)]) -> DeviceConfig {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
