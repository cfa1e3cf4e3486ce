//! Builder pattern for ergonomic machine description assembly.

use crate::arch::Architecture;
use crate::config::{DriveConfig, MachineConfig, NetworkConfig, UsbHostConfig, VsockConfig};
use crate::error::Result;
use crate::qemu_config;
use std::path::{Path, PathBuf};

/// Fluent builder for [`MachineConfig`].
///
/// # Example
///
/// ```no_run
/// use kestrel_vm::{Architecture, MachineBuilder};
///
/// # async fn example() -> kestrel_vm::Result<()> {
/// MachineBuilder::new(Architecture::X86_64)
///     .memory("2GiB")
///     .cpus("2")
///     .monitor("/var/log/kestrel/vm1/qemu.monitor")
///     .root_drive("/dev/zvol/default/vm1")
///     .with_network("eth0", "tap7f3a", Some("00:16:3e:12:34:56"))
///     .write("/var/log/kestrel/vm1/qemu.conf")
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MachineBuilder {
    config: MachineConfig,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new(Architecture::X86_64)
    }
}

impl MachineBuilder {
    /// Create a new builder with default configuration for `arch`.
    pub fn new(arch: Architecture) -> Self {
        Self {
            config: MachineConfig {
                architecture: arch,
                ..Default::default()
            },
        }
    }

    /// Set the memory size (e.g. `1GB`, `512MiB`).
    pub fn memory(mut self, size: impl Into<String>) -> Self {
        self.config.memory = size.into();
        self
    }

    /// Set the number of virtual CPUs.
    pub fn cpus(mut self, count: impl Into<String>) -> Self {
        self.config.cpus = count.into();
        self
    }

    /// Set the firmware code image and per-instance NVRAM store.
    pub fn firmware(mut self, code: impl Into<PathBuf>, nvram: impl Into<PathBuf>) -> Self {
        self.config.firmware.code_path = code.into();
        self.config.firmware.nvram_path = nvram.into();
        self
    }

    /// Set the control socket path.
    pub fn monitor(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.monitor_path = path.into();
        self
    }

    /// Configure vsock with the given guest CID.
    pub fn with_vsock(mut self, cid: u32) -> Self {
        self.config.vsock = VsockConfig { guest_cid: cid };
        self
    }

    /// Export a host directory to the guest as the config share.
    pub fn config_share(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.config_share = Some(path.into());
        self
    }

    /// Set the root disk.
    pub fn root_drive(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_drive = Some(DriveConfig {
            drive_id: "root".into(),
            path_on_host: path.into(),
            is_read_only: false,
        });
        self
    }

    /// Add a supplementary drive.
    pub fn with_drive(mut self, drive_id: &str, path: impl Into<PathBuf>, read_only: bool) -> Self {
        self.config.extra_drives.push(DriveConfig {
            drive_id: drive_id.to_string(),
            path_on_host: path.into(),
            is_read_only: read_only,
        });
        self
    }

    /// Add a network interface backed by a host TAP device.
    pub fn with_network(mut self, iface_id: &str, host_dev: &str, mac: Option<&str>) -> Self {
        self.config.networks.push(NetworkConfig {
            iface_id: iface_id.to_string(),
            host_dev_name: host_dev.to_string(),
            guest_mac: mac.map(str::to_string),
        });
        self
    }

    /// Pass a host USB device through to the guest.
    pub fn with_usb_host(mut self, id: &str, host_bus: u32, host_addr: u32) -> Self {
        self.config.usb_devices.push(UsbHostConfig {
            id: id.to_string(),
            host_bus,
            host_addr,
        });
        self
    }

    /// Build and return the configuration.
    pub fn build_config(self) -> MachineConfig {
        self.config
    }

    /// Render the machine description text.
    pub fn render(&self) -> Result<String> {
        qemu_config::render(&self.config)
    }

    /// Render and write the machine description to `path`.
    pub async fn write(self, path: impl AsRef<Path>) -> Result<MachineConfig> {
        qemu_config::write_config(&self.config, path.as_ref()).await?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MachineBuilder::default().build_config();
        assert_eq!(config.memory, "1GB");
        assert_eq!(config.cpus, "1");
        assert!(config.root_drive.is_none());
        assert!(config.networks.is_empty());
    }

    #[test]
    fn test_builder_memory_cpus() {
        let config = MachineBuilder::default().cpus("4").memory("8GiB").build_config();
        assert_eq!(config.cpu_count().unwrap(), 4);
        assert_eq!(config.memory_bytes().unwrap(), 8 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_builder_drives_in_order() {
        let config = MachineBuilder::default()
            .root_drive("/dev/pool/vm1")
            .with_drive("data", "/srv/data.img", false)
            .with_drive("seed", "/srv/seed.iso", true)
            .build_config();

        assert_eq!(config.root_drive.unwrap().drive_id, "root");
        let ids: Vec<_> = config.extra_drives.iter().map(|d| d.drive_id.as_str()).collect();
        assert_eq!(ids, ["data", "seed"]);
        assert!(config.extra_drives[1].is_read_only);
    }

    #[test]
    fn test_builder_with_network() {
        let config = MachineBuilder::default()
            .with_network("eth0", "tap0", None)
            .build_config();
        assert_eq!(config.networks.len(), 1);
        assert_eq!(config.networks[0].host_dev_name, "tap0");
        assert!(config.networks[0].guest_mac.is_none());
    }

    #[test]
    fn test_builder_with_usb_host() {
        let config = MachineBuilder::default()
            .with_usb_host("kestrel_usb_001_002", 1, 2)
            .build_config();
        assert_eq!(config.usb_devices.len(), 1);
        assert_eq!(config.usb_devices[0].host_addr, 2);
    }

    #[test]
    fn test_builder_with_vsock() {
        let config = MachineBuilder::default().with_vsock(45).build_config();
        assert_eq!(config.vsock.guest_cid, 45);
    }

    #[test]
    fn test_builder_render() {
        let text = MachineBuilder::new(Architecture::Aarch64)
            .config_share("/var/lib/kestrel/vm1/config")
            .render()
            .unwrap();
        assert!(text.contains("type = \"virt\""));
        assert!(text.contains("virtio-9p-pci"));
    }
}
