//! Instance config and device validation.

use crate::device::{device_type, DeviceContext, Devices, DriverRegistry};
use crate::error::{CoreError, Result};
use crate::instance::ConfigMap;
use kestrel_vm::{parse_byte_size, parse_cpu_count, Architecture};

/// Typed value checks for known keys.
#[derive(Debug, Clone, Copy)]
enum KeyKind {
    Bool,
    Int,
    ByteSize,
    CpuCount,
    Any,
}

const KNOWN_KEYS: &[(&str, KeyKind)] = &[
    ("boot.autostart", KeyKind::Bool),
    ("boot.autostart.delay", KeyKind::Int),
    ("boot.autostart.priority", KeyKind::Int),
    ("boot.host_shutdown_timeout", KeyKind::Int),
    ("boot.stop.priority", KeyKind::Int),
    ("limits.cpu", KeyKind::CpuCount),
    ("limits.memory", KeyKind::ByteSize),
    ("limits.memory.hugepages", KeyKind::Bool),
    ("migration.stateful", KeyKind::Bool),
    ("security.protection.delete", KeyKind::Bool),
    ("security.secureboot", KeyKind::Bool),
    ("snapshots.schedule", KeyKind::Any),
    ("snapshots.pattern", KeyKind::Any),
    ("snapshots.expiry", KeyKind::Any),
    ("cloud-init.user-data", KeyKind::Any),
    ("cloud-init.vendor-data", KeyKind::Any),
    ("cloud-init.network-config", KeyKind::Any),
    ("raw.qemu", KeyKind::Any),
];

/// Namespaces whose keys are free-form.
const OPEN_NAMESPACES: &[&str] = &["user.", "environment.", "image."];

/// Namespaces users may not change directly.
pub const RESERVED_NAMESPACES: &[&str] = &["volatile.", "image."];

/// Parse a config boolean. Empty counts as false.
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(CoreError::Validation(format!("invalid boolean: {value:?}"))),
    }
}

/// Boolean config lookup, false when unset or malformed.
pub fn config_flag(config: &ConfigMap, key: &str) -> bool {
    config
        .get(key)
        .and_then(|v| parse_bool(v).ok())
        .unwrap_or(false)
}

fn check_value(key: &str, kind: KeyKind, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    let invalid = |e: String| CoreError::Validation(format!("invalid value for {key}: {e}"));
    match kind {
        KeyKind::Bool => parse_bool(value).map(|_| ()).map_err(|e| invalid(e.to_string())),
        KeyKind::Int => value
            .parse::<i64>()
            .map(|_| ())
            .map_err(|_| invalid(format!("{value:?} is not an integer"))),
        KeyKind::ByteSize => parse_byte_size(value)
            .map(|_| ())
            .map_err(|e| invalid(e.to_string())),
        KeyKind::CpuCount => parse_cpu_count(value)
            .map(|_| ())
            .map_err(|e| invalid(e.to_string())),
        KeyKind::Any => Ok(()),
    }
}

/// Validate a config map. Profiles may not carry volatile keys.
pub fn validate_config(config: &ConfigMap, profile: bool) -> Result<()> {
    for (key, value) in config {
        if key.starts_with("volatile.") {
            if profile {
                return Err(CoreError::Validation(format!(
                    "volatile keys can only be set on instances: {key}"
                )));
            }
            continue;
        }
        if OPEN_NAMESPACES.iter().any(|ns| key.starts_with(ns)) {
            continue;
        }
        match KNOWN_KEYS.iter().find(|(k, _)| k == key) {
            Some((_, kind)) => check_value(key, *kind, value)?,
            None => {
                return Err(CoreError::Validation(format!(
                    "unknown configuration key: {key}"
                )))
            }
        }
    }
    Ok(())
}

/// Validate an architecture name.
pub fn validate_architecture(name: &str) -> Result<Architecture> {
    name.parse::<Architecture>()
        .map_err(|e| CoreError::Validation(format!("invalid architecture: {e}")))
}

/// Device name rules.
pub fn validate_device_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::Validation("device name cannot be empty".into()));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(CoreError::Validation(format!(
            "device name contains invalid characters: {name:?}"
        )));
    }
    Ok(())
}

/// Validate a device set.
///
/// With `expanded` the set must contain exactly one root disk and unsupported
/// device types are fatal. Otherwise unsupported types are skipped.
pub fn validate_devices(
    registry: &DriverRegistry,
    ctx: &DeviceContext,
    devices: &Devices,
    expanded: bool,
) -> Result<()> {
    for (name, config) in devices {
        validate_device_name(name)?;
        if device_type(config).is_empty() {
            return Err(CoreError::Validation(format!(
                "device {name:?} has no type"
            )));
        }

        match registry.create(ctx.clone(), name, config) {
            Ok(_) => {}
            Err(e) if e.error.is_unsupported_device() && !expanded => {
                tracing::debug!(device = %name, error = %e.error, "Skipping unsupported device");
            }
            Err(e) => {
                return Err(match e.error {
                    CoreError::Validation(msg) => {
                        CoreError::Validation(format!("device {name:?}: {msg}"))
                    }
                    other => other,
                })
            }
        }
    }

    if expanded {
        devices.root_disk()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dev;
    use crate::test_support::detached_context;

    #[test]
    fn test_validate_config_keys() {
        assert!(validate_config(&dev(&[("limits.cpu", "2"), ("limits.memory", "2GiB")]), false).is_ok());
        assert!(validate_config(&dev(&[("user.anything", "x"), ("raw.qemu", "-S")]), false).is_ok());
        assert!(validate_config(&dev(&[("limits.cpu", "0")]), false).is_err());
        assert!(validate_config(&dev(&[("limits.memory", "lots")]), false).is_err());
        assert!(validate_config(&dev(&[("security.secureboot", "maybe")]), false).is_err());
        assert!(validate_config(&dev(&[("nonsense.key", "1")]), false).is_err());
    }

    #[test]
    fn test_volatile_only_on_instances() {
        let config = dev(&[("volatile.eth0.hwaddr", "00:16:3e:00:00:01")]);
        assert!(validate_config(&config, false).is_ok());
        assert!(validate_config(&config, true).is_err());
    }

    #[test]
    fn test_device_names() {
        assert!(validate_device_name("eth0").is_ok());
        assert!(validate_device_name("").is_err());
        assert!(validate_device_name("a/b").is_err());
        assert!(validate_device_name("a\0b").is_err());
    }

    #[test]
    fn test_unsupported_is_fatal_only_when_expanded() {
        let registry = DriverRegistry::with_defaults();
        let ctx = detached_context();
        let mut devices = Devices::new();
        devices.insert("root", dev(&[("type", "disk"), ("path", "/"), ("pool", "p")]));
        devices.insert("ib0", dev(&[("type", "infiniband"), ("nictype", "physical")]));

        assert!(validate_devices(&registry, &ctx, &devices, false).is_ok());
        let err = validate_devices(&registry, &ctx, &devices, true).unwrap_err();
        assert!(err.is_unsupported_device());
    }

    #[test]
    fn test_expanded_requires_root_disk() {
        let registry = DriverRegistry::with_defaults();
        let ctx = detached_context();
        let mut devices = Devices::new();
        devices.insert("eth0", dev(&[("type", "nic"), ("nictype", "p2p")]));

        assert!(validate_devices(&registry, &ctx, &devices, false).is_ok());
        assert!(validate_devices(&registry, &ctx, &devices, true).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("").unwrap());
        assert!(parse_bool("sometimes").is_err());
    }
}
