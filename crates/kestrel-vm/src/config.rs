//! Machine description types consumed by the config generator.

use crate::arch::Architecture;
use crate::error::{Result, VmError};
use crate::units::{parse_byte_size, parse_cpu_count};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Offset between an instance database id and its vsock guest CID.
/// CIDs 0, 1 and 2 are reserved.
pub const VSOCK_CID_OFFSET: u32 = 3;

/// Full description of a QEMU machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Guest architecture, selects machine type and base options
    pub architecture: Architecture,
    /// Memory size as a human-readable string (e.g. `1GB`)
    pub memory: String,
    /// Number of virtual CPUs as a string (e.g. `2`)
    pub cpus: String,
    /// UEFI firmware code and per-instance variable store
    pub firmware: FirmwareConfig,
    /// Path of the control channel socket
    pub monitor_path: PathBuf,
    /// vsock transport for the guest agent
    pub vsock: VsockConfig,
    /// Directory exported read-only to the guest as the `config` 9p share
    pub config_share: Option<PathBuf>,
    /// Root disk, booted first
    pub root_drive: Option<DriveConfig>,
    /// Supplementary disks, attached in order
    pub extra_drives: Vec<DriveConfig>,
    /// Network interfaces, one section each
    pub networks: Vec<NetworkConfig>,
    /// Host USB devices passed through at boot
    pub usb_devices: Vec<UsbHostConfig>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::X86_64,
            memory: "1GB".into(),
            cpus: "1".into(),
            firmware: FirmwareConfig::default(),
            monitor_path: PathBuf::from("/var/log/kestrel/qemu.monitor"),
            vsock: VsockConfig::default(),
            config_share: None,
            root_drive: None,
            extra_drives: Vec::new(),
            networks: Vec::new(),
            usb_devices: Vec::new(),
        }
    }
}

impl MachineConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        self.memory_bytes()?;
        self.cpu_count()?;

        // 0, 1, 2 are reserved CIDs
        if self.vsock.guest_cid < VSOCK_CID_OFFSET {
            return Err(VmError::Config(format!(
                "vsock guest_cid must be > 2, got {}",
                self.vsock.guest_cid
            )));
        }

        let mut drive_ids = HashSet::new();
        for drive in self.root_drive.iter().chain(self.extra_drives.iter()) {
            if !drive_ids.insert(drive.drive_id.as_str()) {
                return Err(VmError::Config(format!(
                    "duplicate drive_id: {}",
                    drive.drive_id
                )));
            }
        }

        let mut iface_ids = HashSet::new();
        for net in &self.networks {
            if !iface_ids.insert(net.iface_id.as_str()) {
                return Err(VmError::Config(format!("duplicate iface_id: {}", net.iface_id)));
            }
        }

        let mut usb_ids = HashSet::new();
        for usb in &self.usb_devices {
            if !usb_ids.insert(usb.id.as_str()) {
                return Err(VmError::Config(format!("duplicate usb device id: {}", usb.id)));
            }
        }

        Ok(())
    }

    /// Memory size in bytes.
    pub fn memory_bytes(&self) -> Result<u64> {
        let bytes = parse_byte_size(&self.memory)?;
        if bytes == 0 {
            return Err(VmError::Config("memory size must be greater than zero".into()));
        }
        Ok(bytes)
    }

    /// Number of vCPUs.
    pub fn cpu_count(&self) -> Result<u32> {
        parse_cpu_count(&self.cpus)
    }
}

/// UEFI firmware configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Read-only firmware code image
    pub code_path: PathBuf,
    /// Writable per-instance variable store
    pub nvram_path: PathBuf,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            code_path: PathBuf::from("/usr/share/OVMF/OVMF_CODE.fd"),
            nvram_path: PathBuf::from("qemu.nvram"),
        }
    }
}

/// Configuration for a block device (drive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier, usually the device name
    pub drive_id: String,
    /// Path to the disk image or block device on the host
    pub path_on_host: PathBuf,
    /// Read-only flag
    pub is_read_only: bool,
}

/// Network interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface identifier, usually the device name
    pub iface_id: String,
    /// Host TAP device name
    pub host_dev_name: String,
    /// Guest MAC address (QEMU picks one when None)
    pub guest_mac: Option<String>,
}

/// A host USB device attached to the guest USB controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbHostConfig {
    /// Device id, also used to detach it later over the control channel
    pub id: String,
    pub host_bus: u32,
    pub host_addr: u32,
}

/// vsock configuration for guest-host communication.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VsockConfig {
    /// Guest CID (Context ID), must be > 2
    pub guest_cid: u32,
}

impl Default for VsockConfig {
    fn default() -> Self {
        Self {
            guest_cid: VSOCK_CID_OFFSET,
        }
    }
}

impl VsockConfig {
    /// vsock config for the instance with the given database id.
    pub fn for_instance(instance_id: i64) -> Result<Self> {
        let cid = u32::try_from(instance_id)
            .ok()
            .and_then(|id| id.checked_add(VSOCK_CID_OFFSET))
            .ok_or_else(|| VmError::Config(format!("instance id {instance_id} has no vsock CID")))?;
        Ok(Self { guest_cid: cid })
    }
}
