//! Device orchestration: load, start, stop, update and diff application.

use super::VirtualMachine;
use crate::device::{
    device_type, random_mac, same_kind, DeviceConfig, DeviceDiff, DeviceDriver, Devices,
    RunConfig, VolatileAccessor,
};
use crate::error::{CoreError, Result};
use crate::instance::ConfigMap;
use kestrel_vm::qemu_config::USB_BUS;
use kestrel_vm::Monitor;

/// Network types whose MAC address is generated and persisted.
const MAC_TYPES: &[&str] = &["nic", "infiniband"];

/// NIC types that use the host device's own MAC address.
const FIXED_MAC_NIC_TYPES: &[&str] = &["physical", "ipvlan", "sriov"];

/// A constructed driver together with its volatile accessor.
///
/// `invalid` holds the validation failure when the driver was constructed
/// but rejected its config; such drivers are only used for teardown.
pub(crate) struct LoadedDevice {
    pub driver: Box<dyn DeviceDriver>,
    pub volatile: VolatileAccessor,
    pub invalid: Option<CoreError>,
}

impl LoadedDevice {
    fn require_valid(self) -> Result<Self> {
        match self.invalid {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

impl VirtualMachine {
    /// Hot-updatable fields for a same-named device pair.
    ///
    /// Queries a throwaway driver built without volatile access, so nothing
    /// it does can be persisted.
    pub(crate) fn hot_fields(&self, old: &DeviceConfig, new: &DeviceConfig) -> Vec<String> {
        if !same_kind(old, new) {
            return Vec::new();
        }
        match self
            .services
            .drivers
            .create(self.scratch_context(), "scratch", new)
        {
            Ok(driver) => driver.can_hot_plug().1,
            Err(_) => Vec::new(),
        }
    }

    /// Compare two device sets using the drivers' hot-updatable fields.
    pub fn device_diff(&self, old: &Devices, new: &Devices) -> DeviceDiff {
        old.diff(new, |a, b| self.hot_fields(a, b))
    }

    /// Fill in a persisted or generated MAC address for network devices.
    async fn fill_network_device(&mut self, name: &str, raw: &DeviceConfig) -> Result<DeviceConfig> {
        let mut config = raw.clone();
        let kind = device_type(raw);
        let nic_type = raw.get("nictype").map(String::as_str).unwrap_or("");
        let has_hwaddr = raw.get("hwaddr").is_some_and(|v| !v.is_empty());

        if !MAC_TYPES.contains(&kind) || FIXED_MAC_NIC_TYPES.contains(&nic_type) || has_hwaddr {
            return Ok(config);
        }

        let key = format!("volatile.{name}.hwaddr");
        let hwaddr = match self.args.config.get(&key) {
            Some(existing) if !existing.is_empty() => existing.clone(),
            _ => {
                let generated = random_mac();
                let changes: ConfigMap = [(key.clone(), generated.clone())].into();
                match self.persist_config("fill_network_device", &changes).await {
                    Ok(()) => generated,
                    Err(e) => {
                        // Another writer may have won; use its value.
                        let stored = self.services.database.config_get(self.args.id).await?;
                        match stored.get(&key) {
                            Some(v) if !v.is_empty() => v.clone(),
                            _ => return Err(e),
                        }
                    }
                }
            }
        };

        self.args.config.insert(key.clone(), hwaddr.clone());
        self.expanded_config.insert(key, hwaddr.clone());
        config.insert("hwaddr".into(), hwaddr);
        Ok(config)
    }

    /// Construct the driver for a device.
    ///
    /// Fails when the driver cannot be constructed at all (unknown type,
    /// missing type, enrichment failure). Validation failures are carried in
    /// [`LoadedDevice::invalid`].
    pub(crate) async fn device_load(&mut self, name: &str, raw: &DeviceConfig) -> Result<LoadedDevice> {
        let config = self.fill_network_device(name, raw).await?;
        let volatile = VolatileAccessor::new(name, &self.args.config);
        let ctx = self.scratch_context().with_volatile(volatile.clone());

        match self.services.drivers.create(ctx, name, &config) {
            Ok(driver) => Ok(LoadedDevice {
                driver,
                volatile,
                invalid: None,
            }),
            Err(e) => match e.driver {
                Some(driver) => Ok(LoadedDevice {
                    driver,
                    volatile,
                    invalid: Some(e.error),
                }),
                None => Err(e.error),
            },
        }
    }

    /// Persist whatever the driver wrote to its volatile accessor.
    async fn persist_volatile(&mut self, volatile: &VolatileAccessor) -> Result<()> {
        let pending = volatile.take_pending();
        self.volatile_set(pending).await
    }

    /// Run a device's add hook.
    pub(crate) async fn device_add(&mut self, name: &str, raw: &DeviceConfig) -> Result<()> {
        let loaded = self.device_load(name, raw).await?.require_valid()?;
        loaded.driver.add().await?;
        self.persist_volatile(&loaded.volatile).await
    }

    /// Start a device. On a running instance the device must be hot-pluggable
    /// and its run config is applied live before returning.
    pub(crate) async fn device_start(
        &mut self,
        name: &str,
        raw: &DeviceConfig,
        running: bool,
    ) -> Result<RunConfig> {
        let loaded = self.device_load(name, raw).await?.require_valid()?;

        if running && !loaded.driver.can_hot_plug().0 {
            return Err(CoreError::Validation(format!(
                "device {name:?} cannot be started while the instance is running"
            )));
        }

        let mut run_conf = loaded.driver.start().await?;
        self.persist_volatile(&loaded.volatile).await?;

        if running {
            self.apply_run_config_live(&mut run_conf).await?;
        }
        Ok(run_conf)
    }

    /// Stop a device. Validation failures are logged and teardown proceeds;
    /// post-stop hooks always run.
    pub(crate) async fn device_stop(&mut self, name: &str, raw: &DeviceConfig, live: bool) -> Result<()> {
        let loaded = self.device_load(name, raw).await?;
        if let Some(e) = &loaded.invalid {
            tracing::warn!(instance = %self.args.name, device = %name, error = %e, "Stopping device with invalid config");
        }

        let stopped = loaded.driver.stop().await;
        self.persist_volatile(&loaded.volatile).await?;
        let mut run_conf = stopped?;

        if live {
            self.apply_run_config_live(&mut run_conf).await
        } else {
            run_conf.run_post_hooks().await
        }
    }

    /// Reconfigure a device in place.
    pub(crate) async fn device_update(
        &mut self,
        name: &str,
        raw: &DeviceConfig,
        old_devices: &Devices,
        running: bool,
    ) -> Result<()> {
        let loaded = self.device_load(name, raw).await?.require_valid()?;
        loaded.driver.update(old_devices, running).await?;
        self.persist_volatile(&loaded.volatile).await
    }

    /// Run a device's remove hook. Validation failures are logged.
    pub(crate) async fn device_remove(&mut self, name: &str, raw: &DeviceConfig) -> Result<()> {
        let loaded = self.device_load(name, raw).await?;
        if let Some(e) = &loaded.invalid {
            tracing::warn!(instance = %self.args.name, device = %name, error = %e, "Removing device with invalid config");
        }
        loaded.driver.remove().await?;
        self.persist_volatile(&loaded.volatile).await
    }

    /// Clear volatile keys of a device that is removed or replaced.
    ///
    /// Removal or a type change clears every `volatile.<name>.*` key.
    /// Otherwise only keys the new config now sets explicitly are cleared.
    pub(crate) async fn device_reset_volatile(
        &mut self,
        name: &str,
        old: &DeviceConfig,
        new: Option<&DeviceConfig>,
    ) -> Result<()> {
        let prefix = format!("volatile.{name}.");
        let clear_all = new.map_or(true, |new| !same_kind(old, new));

        let changes: ConfigMap = self
            .args
            .config
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(|field| (k, field)))
            .filter(|(_, field)| clear_all || new.is_some_and(|n| n.contains_key(*field)))
            .map(|(k, _)| (k.clone(), String::new()))
            .collect();

        self.volatile_set(changes).await
    }

    /// Apply a device diff: removals newest first, then additions in start
    /// order, then in-place updates.
    pub(crate) async fn apply_device_diff(
        &mut self,
        diff: &DeviceDiff,
        old_devices: &Devices,
        running: bool,
    ) -> Result<()> {
        for (name, config) in diff.removed.reversed() {
            if running {
                match self.device_stop(&name, &config, true).await {
                    Err(e) if e.is_unsupported_device() => {}
                    other => other?,
                }
            }
            match self.device_remove(&name, &config).await {
                Err(e) if e.is_unsupported_device() => {}
                other => other?,
            }
            self.device_reset_volatile(&name, &config, diff.added.get(&name))
                .await?;
        }

        for (name, config) in diff.added.sorted() {
            match self.device_add(&name, &config).await {
                Err(e) if e.is_unsupported_device() => {
                    tracing::warn!(instance = %self.args.name, device = %name, "Skipping unsupported device");
                    continue;
                }
                other => other?,
            }
            if running {
                self.device_start(&name, &config, true).await?;
            }
        }

        for (name, config) in diff.updated.sorted() {
            self.device_update(&name, &config, old_devices, running)
                .await?;
        }

        Ok(())
    }

    /// Apply a run config to the running hypervisor, then run its post hooks.
    pub(crate) async fn apply_run_config_live(&mut self, run_conf: &mut RunConfig) -> Result<()> {
        let needs_monitor = !run_conf.usb_attach.is_empty()
            || !run_conf.usb_detach.is_empty()
            || run_conf.network.is_some();

        if needs_monitor {
            let mut monitor =
                Monitor::connect(&self.monitor_path(), self.services.config.monitor_timeout).await?;

            for usb in &run_conf.usb_detach {
                tracing::debug!(instance = %self.args.name, id = %usb.id, "Detaching USB device");
                monitor.device_del(&usb.id).await?;
            }

            for usb in &run_conf.usb_attach {
                tracing::debug!(instance = %self.args.name, id = %usb.id, "Attaching USB device");
                monitor
                    .device_add(serde_json::json!({
                        "driver": "usb-host",
                        "bus": USB_BUS,
                        "hostbus": usb.bus,
                        "hostaddr": usb.device,
                        "id": usb.id,
                    }))
                    .await?;
            }

            if let Some(net) = &run_conf.network {
                let netdev_id = format!("kestrel_{}", net.name);
                let _: serde_json::Value = monitor
                    .execute(
                        "netdev_add",
                        Some(serde_json::json!({
                            "type": "tap",
                            "id": netdev_id,
                            "ifname": net.host_name,
                            "script": "no",
                            "downscript": "no",
                        })),
                    )
                    .await?;
                let mut device = serde_json::json!({
                    "driver": "virtio-net-pci",
                    "netdev": netdev_id,
                    "id": format!("dev-kestrel_{}", net.name),
                });
                if let Some(mac) = &net.hwaddr {
                    device["mac"] = serde_json::Value::from(mac.as_str());
                }
                monitor.device_add(device).await?;
            }
        }

        run_conf.run_post_hooks().await
    }

    /// Entry point for hotplug run configs targeting this instance.
    pub async fn device_event_handler(&mut self, mut run_conf: RunConfig) -> Result<()> {
        if !self.is_running().await {
            tracing::debug!(instance = %self.args.name, "Ignoring hotplug event for stopped instance");
            return Ok(());
        }
        self.apply_run_config_live(&mut run_conf).await
    }

    /// Re-arm host side listeners of a running instance, e.g. after a
    /// controller restart.
    pub async fn register_devices(&mut self) -> Result<()> {
        if !self.is_running().await {
            return Ok(());
        }
        for (name, config) in self.expanded_devices.sorted() {
            let loaded = match self.device_load(&name, &config).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!(instance = %self.args.name, device = %name, error = %e, "Failed to load device");
                    continue;
                }
            };
            if let Some(e) = loaded.invalid {
                tracing::warn!(instance = %self.args.name, device = %name, error = %e, "Skipping invalid device");
                continue;
            }
            if let Err(e) = loaded.driver.register().await {
                tracing::warn!(instance = %self.args.name, device = %name, error = %e, "Failed to register device");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::device::dev;
    use crate::device::Devices;
    use crate::test_support::TestEnv;

    fn nic(parent: &str) -> crate::device::DeviceConfig {
        dev(&[("type", "nic"), ("nictype", "bridged"), ("parent", parent)])
    }

    #[tokio::test]
    async fn test_load_persists_generated_mac() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;

        vm.device_load("eth0", &nic("br0")).await.unwrap();
        let mac = vm.volatile_get("volatile.eth0.hwaddr").unwrap().to_string();
        assert!(mac.starts_with("00:16:3e:"));
        assert_eq!(env.db.config_of(vm.id())["volatile.eth0.hwaddr"], mac);

        // Second load reuses it.
        vm.device_load("eth0", &nic("br0")).await.unwrap();
        assert_eq!(vm.volatile_get("volatile.eth0.hwaddr"), Some(mac.as_str()));
    }

    #[tokio::test]
    async fn test_load_keeps_driver_on_validation_failure() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;
        let loaded = vm
            .device_load("data", &dev(&[("type", "disk"), ("path", "/srv")]))
            .await
            .unwrap();
        assert!(loaded.invalid.is_some());

        let err = vm
            .device_load("gpu0", &dev(&[("type", "gpu")]))
            .await
            .err()
            .unwrap();
        assert!(err.is_unsupported_device());
    }

    #[tokio::test]
    async fn test_hot_fields_scratch_driver_has_no_side_effects() {
        let env = TestEnv::new();
        let vm = env.vm("vm1").await;
        let fields = vm.hot_fields(&nic("br0"), &nic("br1"));
        assert!(fields.contains(&"limits.ingress".to_string()));
        assert!(vm.volatile_get("volatile.scratch.hwaddr").is_none());
        assert!(env.db.config_of(vm.id()).is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_cold_only_device_when_running() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;
        let data = env.disk_image("data.img");
        let err = vm
            .device_start(
                "data",
                &dev(&[("type", "disk"), ("path", "/srv"), ("source", data.to_str().unwrap())]),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_stop_tolerates_invalid_config() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;
        // Missing parent fails validation but the tap recorded in volatile
        // state is still torn down.
        vm.volatile_set([("volatile.eth0.host_name".to_string(), "tapold".to_string())].into())
            .await
            .unwrap();
        vm.device_stop("eth0", &dev(&[("type", "nic"), ("nictype", "bridged")]), false)
            .await
            .unwrap();
        assert_eq!(env.network.calls(), vec!["delete_link tapold".to_string()]);
        assert!(vm.volatile_get("volatile.eth0.host_name").is_none());
    }

    #[tokio::test]
    async fn test_reset_volatile_scoped_to_device() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;
        vm.volatile_set(
            [
                ("volatile.eth0.hwaddr".to_string(), "00:16:3e:00:00:01".to_string()),
                ("volatile.eth0.host_name".to_string(), "tap0".to_string()),
                ("volatile.eth1.hwaddr".to_string(), "00:16:3e:00:00:02".to_string()),
            ]
            .into(),
        )
        .await
        .unwrap();

        // Same kind, new config sets hwaddr explicitly: only hwaddr cleared.
        let mut replacement = nic("br0");
        replacement.insert("hwaddr".into(), "00:16:3e:aa:bb:cc".into());
        vm.device_reset_volatile("eth0", &nic("br0"), Some(&replacement))
            .await
            .unwrap();
        assert!(vm.volatile_get("volatile.eth0.hwaddr").is_none());
        assert_eq!(vm.volatile_get("volatile.eth0.host_name"), Some("tap0"));

        // Type change clears the rest, eth1 untouched.
        vm.device_reset_volatile("eth0", &nic("br0"), Some(&dev(&[("type", "none")])))
            .await
            .unwrap();
        assert!(vm.volatile_get("volatile.eth0.host_name").is_none());
        assert_eq!(vm.volatile_get("volatile.eth1.hwaddr"), Some("00:16:3e:00:00:02"));
    }

    #[tokio::test]
    async fn test_apply_diff_order_and_volatile() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;
        vm.volatile_set(
            [("volatile.old.hwaddr".to_string(), "00:16:3e:00:00:09".to_string())].into(),
        )
        .await
        .unwrap();

        let mut old = Devices::new();
        old.insert("old", nic("br0"));
        old.insert("keep", nic("br0"));
        let mut new = Devices::new();
        let mut keep = nic("br0");
        keep.insert("limits.ingress".into(), "10Mbit".into());
        new.insert("keep", keep);
        new.insert("fresh", dev(&[("type", "none")]));
        new.insert("gpu0", dev(&[("type", "gpu")]));

        let diff = vm.device_diff(&old, &new);
        assert_eq!(diff.removed.names().collect::<Vec<_>>(), ["old"]);
        assert_eq!(diff.updated.names().collect::<Vec<_>>(), ["keep"]);

        vm.apply_device_diff(&diff, &old, false).await.unwrap();
        assert!(vm.volatile_get("volatile.old.hwaddr").is_none());
    }
}
