//! USB passthrough that follows host hotplug events.

use crate::device::driver::config_bool;
use crate::device::{DeviceConfig, DeviceContext, DeviceDriver, RunConfig, UsbDevice};
use crate::error::{CoreError, Result};
use crate::hotplug::{HotplugEvent, HotplugHandler, HotplugKey};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Vendor/product filter. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbFilter {
    pub vendor: String,
    pub product: String,
}

impl UsbFilter {
    pub fn new(vendor: &str, product: &str) -> Self {
        Self {
            vendor: vendor.to_ascii_lowercase(),
            product: product.to_ascii_lowercase(),
        }
    }

    pub fn matches(&self, vendor: &str, product: &str) -> bool {
        (self.vendor.is_empty() || self.vendor.eq_ignore_ascii_case(vendor))
            && (self.product.is_empty() || self.product.eq_ignore_ascii_case(product))
    }
}

pub struct UnixHotplugDevice {
    ctx: DeviceContext,
    name: String,
    config: DeviceConfig,
}

impl UnixHotplugDevice {
    pub fn new(ctx: DeviceContext, name: &str, config: &DeviceConfig) -> Self {
        Self {
            ctx,
            name: name.to_string(),
            config: config.clone(),
        }
    }

    fn get(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }

    fn filter(&self) -> UsbFilter {
        UsbFilter::new(self.get("vendorid"), self.get("productid"))
    }

    fn key(&self) -> Result<HotplugKey> {
        HotplugKey::new(&self.ctx.instance.project, &self.ctx.instance.name, &self.name)
    }

    /// Build the event handler for this device.
    fn handler(&self) -> HotplugHandler {
        let filter = self.filter();
        let name = self.name.clone();
        Arc::new(move |event: &HotplugEvent| {
            if !filter.matches(&event.vendor, &event.product) {
                return Ok(None);
            }

            let usb = UsbDevice {
                id: UsbDevice::id_for(&name, event.busnum, event.devnum),
                vendor: event.vendor.clone(),
                product: event.product.clone(),
                bus: event.busnum,
                device: event.devnum,
            };

            let mut run_conf = RunConfig::default();
            match event.action.as_str() {
                "add" => run_conf.usb_attach.push(usb),
                "remove" => run_conf.usb_detach.push(usb),
                _ => return Ok(None),
            }
            run_conf.uevents.push(event.uevent_parts.clone());
            Ok(Some(run_conf))
        })
    }

    /// USB devices currently present on the host that match the filter.
    async fn present_devices(&self) -> Result<Vec<UsbDevice>> {
        let filter = self.filter();
        let mut found = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.ctx.usb_sysfs_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            let (Some(vendor), Some(product)) = (
                read_attr(&dir, "idVendor").await,
                read_attr(&dir, "idProduct").await,
            ) else {
                continue;
            };
            if !filter.matches(&vendor, &product) {
                continue;
            }

            let bus = read_attr(&dir, "busnum").await.and_then(|v| v.parse().ok());
            let device = read_attr(&dir, "devnum").await.and_then(|v| v.parse().ok());
            let (Some(bus), Some(device)) = (bus, device) else {
                continue;
            };

            found.push(UsbDevice {
                id: UsbDevice::id_for(&self.name, bus, device),
                vendor,
                product,
                bus,
                device,
            });
        }

        found.sort_by_key(|d| (d.bus, d.device));
        Ok(found)
    }
}

async fn read_attr(dir: &Path, attr: &str) -> Option<String> {
    tokio::fs::read_to_string(dir.join(attr))
        .await
        .ok()
        .map(|v| v.trim().to_string())
}

fn valid_usb_id(value: &str) -> bool {
    value.is_empty() || (value.len() == 4 && value.chars().all(|c| c.is_ascii_hexdigit()))
}

#[async_trait]
impl DeviceDriver for UnixHotplugDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        for key in ["vendorid", "productid"] {
            if !valid_usb_id(self.get(key)) {
                return Err(CoreError::Validation(format!(
                    "device {:?}: invalid {key} {:?}",
                    self.name,
                    self.get(key)
                )));
            }
        }
        if self.get("vendorid").is_empty() && self.get("productid").is_empty() {
            return Err(CoreError::Validation(format!(
                "device {:?}: vendorid or productid is required",
                self.name
            )));
        }
        for key in ["uid", "gid"] {
            let value = self.get(key);
            if !value.is_empty() && value.parse::<u32>().is_err() {
                return Err(CoreError::Validation(format!(
                    "device {:?}: invalid {key} {value:?}",
                    self.name
                )));
            }
        }
        let mode = self.get("mode");
        if !mode.is_empty() && u32::from_str_radix(mode, 8).is_err() {
            return Err(CoreError::Validation(format!(
                "device {:?}: invalid mode {mode:?}",
                self.name
            )));
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> (bool, Vec<String>) {
        (true, Vec::new())
    }

    async fn start(&self) -> Result<RunConfig> {
        let present = self.present_devices().await?;
        if present.is_empty() && config_bool(&self.config, "required") {
            return Err(CoreError::NotFound(format!(
                "no USB device matching {:?} for required device {:?}",
                self.filter(),
                self.name
            )));
        }

        let mut run_conf = RunConfig {
            usb_attach: present,
            ..Default::default()
        };

        let registry = self.ctx.hotplug.clone();
        let key = self.key()?;
        let handler = self.handler();
        run_conf.post_hook(move || async move {
            registry.register(key, handler);
            Ok(())
        });
        Ok(run_conf)
    }

    async fn stop(&self) -> Result<RunConfig> {
        self.ctx.hotplug.unregister(&self.key()?);
        Ok(RunConfig {
            usb_detach: self.present_devices().await?,
            ..Default::default()
        })
    }

    async fn register(&self) -> Result<()> {
        self.ctx.hotplug.register(self.key()?, self.handler());
        Ok(())
    }
}
