//! Driver trait, run configurations and per-device volatile state.

use crate::device::{DeviceConfig, Devices, HostNetwork};
use crate::error::{CoreError, Result};
use crate::hotplug::HotplugRegistry;
use crate::instance::{ConfigMap, InstanceRef};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Deferred action run after the hypervisor side of a start/stop completed.
pub type PostHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Root filesystem provided by the root disk. The backing path is resolved
/// from the storage pool when the machine description is rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootFs {
    pub read_only: bool,
}

/// Supplementary disk attached to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Device name, used as the drive id
    pub dev_name: String,
    /// Host path of the image or block device
    pub dev_path: PathBuf,
    pub read_only: bool,
}

/// Host side of a guest network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    /// Device name, used as the interface id
    pub name: String,
    /// Host TAP device
    pub host_name: String,
    /// Guest MAC address
    pub hwaddr: Option<String>,
    pub mtu: Option<u32>,
}

/// A host USB device passed through to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// Control channel device id
    pub id: String,
    pub vendor: String,
    pub product: String,
    pub bus: u32,
    pub device: u32,
}

impl UsbDevice {
    /// Build the control channel id for a USB device owned by `device_name`.
    pub fn id_for(device_name: &str, bus: u32, device: u32) -> String {
        format!("kestrel_{device_name}_{bus:03}_{device:03}")
    }
}

/// Side effects a device start or stop asks the controller to apply.
/// Never persisted.
#[derive(Default)]
pub struct RunConfig {
    pub root_fs: Option<RootFs>,
    pub mounts: Vec<MountEntry>,
    pub network: Option<NetworkAttachment>,
    pub usb_attach: Vec<UsbDevice>,
    pub usb_detach: Vec<UsbDevice>,
    /// Raw uevent fragments from hotplug events
    pub uevents: Vec<Vec<String>>,
    pub post_hooks: Vec<PostHook>,
}

impl RunConfig {
    /// Queue a post hook.
    pub fn post_hook<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.post_hooks.push(Box::new(move || Box::pin(f())));
    }

    /// Run and drain all post hooks in order, stopping at the first error.
    pub async fn run_post_hooks(&mut self) -> Result<()> {
        for hook in self.post_hooks.drain(..) {
            hook().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("root_fs", &self.root_fs)
            .field("mounts", &self.mounts)
            .field("network", &self.network)
            .field("usb_attach", &self.usb_attach)
            .field("usb_detach", &self.usb_detach)
            .field("uevents", &self.uevents.len())
            .field("post_hooks", &self.post_hooks.len())
            .finish()
    }
}

/// Read/write access to one device's `volatile.<device>.*` keys.
///
/// Reads see the keys as they were when the driver was loaded plus any
/// writes made since. Writes are buffered and applied by the controller,
/// all-or-nothing, after the driver call returns.
#[derive(Clone)]
pub struct VolatileAccessor {
    device: String,
    loaded: ConfigMap,
    pending: Arc<Mutex<ConfigMap>>,
}

impl VolatileAccessor {
    /// Build from the instance's local config.
    pub fn new(device: &str, local_config: &ConfigMap) -> Self {
        let prefix = volatile_prefix(device);
        let loaded = local_config
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|f| (f.to_string(), v.clone())))
            .collect();
        Self {
            device: device.to_string(),
            loaded,
            pending: Arc::new(Mutex::new(ConfigMap::new())),
        }
    }

    /// Current volatile fields, keyed without the `volatile.<device>.` prefix.
    pub fn get(&self) -> ConfigMap {
        let mut current = self.loaded.clone();
        for (k, v) in self.lock().iter() {
            if v.is_empty() {
                current.remove(k);
            } else {
                current.insert(k.clone(), v.clone());
            }
        }
        current
    }

    /// Record changes. An empty value clears the field.
    pub fn set(&self, changes: ConfigMap) {
        self.lock().extend(changes);
    }

    /// Drain buffered writes as fully-qualified config keys.
    pub fn take_pending(&self) -> ConfigMap {
        let prefix = volatile_prefix(&self.device);
        std::mem::take(&mut *self.lock())
            .into_iter()
            .map(|(k, v)| (format!("{prefix}{k}"), v))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConfigMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `volatile.<device>.`
pub fn volatile_prefix(device: &str) -> String {
    format!("volatile.{device}.")
}

/// Everything a driver may use besides its own config.
#[derive(Clone)]
pub struct DeviceContext {
    pub instance: InstanceRef,
    pub expanded_config: ConfigMap,
    pub hotplug: Arc<HotplugRegistry>,
    pub host_network: Arc<dyn HostNetwork>,
    pub usb_sysfs_path: PathBuf,
    volatile: Option<VolatileAccessor>,
}

impl DeviceContext {
    /// Context without volatile access. Drivers built from it can be
    /// validated and queried for capabilities but cannot persist anything.
    pub fn detached(
        instance: InstanceRef,
        expanded_config: ConfigMap,
        hotplug: Arc<HotplugRegistry>,
        host_network: Arc<dyn HostNetwork>,
        usb_sysfs_path: PathBuf,
    ) -> Self {
        Self {
            instance,
            expanded_config,
            hotplug,
            host_network,
            usb_sysfs_path,
            volatile: None,
        }
    }

    /// Attach volatile accessors.
    pub fn with_volatile(mut self, volatile: VolatileAccessor) -> Self {
        self.volatile = Some(volatile);
        self
    }

    /// Volatile accessors, unavailable on detached contexts.
    pub fn volatile(&self) -> Result<&VolatileAccessor> {
        self.volatile.as_ref().ok_or_else(|| {
            CoreError::Validation("volatile state is not available to this driver".into())
        })
    }
}

/// A device driver instance bound to one named device config.
///
/// Construction must be free of side effects; all host changes happen in
/// the async hooks.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Device name.
    fn name(&self) -> &str;

    /// Check the config. Called by the registry right after construction.
    fn validate(&self) -> Result<()>;

    /// Whether the device can be started/stopped on a running instance, and
    /// which fields may change in place.
    fn can_hot_plug(&self) -> (bool, Vec<String>);

    /// Called once when the device is added to an instance definition.
    async fn add(&self) -> Result<()> {
        Ok(())
    }

    /// Set up host resources and describe what the hypervisor needs.
    async fn start(&self) -> Result<RunConfig>;

    /// Tear down host resources.
    async fn stop(&self) -> Result<RunConfig>;

    /// Apply a change to hot-updatable fields.
    async fn update(&self, _old_devices: &Devices, _running: bool) -> Result<()> {
        Ok(())
    }

    /// Re-arm host side listeners for an already running instance.
    async fn register(&self) -> Result<()> {
        Ok(())
    }

    /// Called once when the device is removed from an instance definition.
    async fn remove(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared accessors for driver implementations.
pub(crate) fn config_bool(config: &DeviceConfig, key: &str) -> bool {
    matches!(
        config.get(key).map(String::as_str),
        Some("true" | "1" | "yes" | "on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_accessor_scoping() {
        let local: ConfigMap = [
            ("volatile.eth0.hwaddr", "00:16:3e:00:00:01"),
            ("volatile.eth1.hwaddr", "00:16:3e:00:00:02"),
            ("limits.cpu", "2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let acc = VolatileAccessor::new("eth0", &local);
        assert_eq!(acc.get().len(), 1);
        assert_eq!(acc.get()["hwaddr"], "00:16:3e:00:00:01");

        acc.set([("host_name".to_string(), "tap1".to_string())].into());
        acc.set([("hwaddr".to_string(), String::new())].into());
        let current = acc.get();
        assert_eq!(current.get("host_name").map(String::as_str), Some("tap1"));
        assert!(!current.contains_key("hwaddr"));

        let pending = acc.take_pending();
        assert_eq!(pending["volatile.eth0.host_name"], "tap1");
        assert_eq!(pending["volatile.eth0.hwaddr"], "");
        assert!(acc.take_pending().is_empty());
    }

    #[tokio::test]
    async fn test_post_hooks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rc = RunConfig::default();
        for i in 0..3 {
            let log = log.clone();
            rc.post_hook(move || async move {
                log.lock().unwrap().push(i);
                Ok(())
            });
        }
        rc.run_post_hooks().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert!(rc.post_hooks.is_empty());
    }

    #[test]
    fn test_config_bool() {
        let config: DeviceConfig = [("required".to_string(), "true".to_string())].into();
        assert!(config_bool(&config, "required"));
        assert!(!config_bool(&config, "missing"));
    }
}
