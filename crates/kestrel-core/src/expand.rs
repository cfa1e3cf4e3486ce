//! Profile expansion.
//!
//! The expanded view of an instance is its profiles applied in order with
//! the instance's local settings on top. Devices are replaced whole by name.

use crate::device::Devices;
use crate::instance::ConfigMap;
use serde::{Deserialize, Serialize};

/// Reusable bundle of config and devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub description: String,
    pub config: ConfigMap,
    pub devices: Devices,
}

/// Merge profile config under the local config.
pub fn expand_config(local: &ConfigMap, profiles: &[Profile]) -> ConfigMap {
    let mut expanded = ConfigMap::new();
    for profile in profiles {
        expanded.extend(profile.config.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    expanded.extend(local.iter().map(|(k, v)| (k.clone(), v.clone())));
    expanded
}

/// Merge profile devices under the local devices.
pub fn expand_devices(local: &Devices, profiles: &[Profile]) -> Devices {
    let mut expanded = Devices::new();
    for profile in profiles {
        for (name, config) in &profile.devices {
            expanded.insert(name.clone(), config.clone());
        }
    }
    for (name, config) in local {
        expanded.insert(name.clone(), config.clone());
    }
    expanded
}

/// Keys whose value differs between two config maps (added, removed or altered).
pub fn changed_keys(old: &ConfigMap, new: &ConfigMap) -> Vec<String> {
    let mut keys: Vec<String> = old
        .keys()
        .chain(new.keys())
        .filter(|k| old.get(*k) != new.get(*k))
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();
    keys
}
