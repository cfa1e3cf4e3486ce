//! Rendering of the QEMU `-readconfig` machine description.
//!
//! The output is a fixed skeleton (agent serial port, PCIe root ports, SCSI
//! controller, balloon, entropy source, USB controller, console backend)
//! followed by sections in a fixed order: memory, CPU, firmware, control
//! socket, vsock, config share, drives (root first), one section group per
//! network interface and finally host USB devices.

use crate::config::MachineConfig;
use crate::error::Result;
use std::fmt::Write as _;
use std::path::Path;

/// SCSI id reserved for the root disk.
const ROOT_SCSI_ID: u32 = 0;

/// Root port chassis numbers used by the fixed skeleton.
const CHASSIS_SCSI: u32 = 1;
const CHASSIS_BALLOON: u32 = 2;
const CHASSIS_RNG: u32 = 3;
const CHASSIS_USB: u32 = 4;
const CHASSIS_VSOCK: u32 = 5;
const CHASSIS_CONFIG: u32 = 6;
const FIRST_NIC_CHASSIS: u32 = 7;

/// Label of the console chardev; queried over the control channel.
pub const CONSOLE_CHARDEV: &str = "console";

/// Id of the USB controller hotplugged host devices attach to.
pub const USB_BUS: &str = "qemu_usb.0";

/// Name of the virtio serial port the guest agent units wait for. Shows up
/// in the guest as `/dev/virtio-ports/<name>`.
pub const AGENT_SERIAL_PORT: &str = "org.kestrel.agent";

/// Render the machine description.
///
/// Fails fast if memory or CPU values cannot be parsed.
pub fn render(config: &MachineConfig) -> Result<String> {
    config.validate()?;

    let mut out = Config::default();

    // Skeleton
    out.comment("Machine");
    out.section(
        "machine",
        &[
            ("graphics", "off"),
            ("type", config.architecture.machine_type()),
            ("accel", "kvm"),
            ("usb", "off"),
        ],
    );
    let base = config.architecture.base_options();
    if !base.is_empty() {
        for line in base {
            out.line(&line);
        }
        out.line("");
    }
    out.section("boot-opts", &[("strict", "on")]);

    out.comment("Agent serial identifier");
    out.section("device \"qemu_serial\"", &[("driver", "virtio-serial")]);
    out.section(
        "device \"qemu_serial_agent\"",
        &[("driver", "virtserialport"), ("name", AGENT_SERIAL_PORT)],
    );

    out.comment("SCSI controller");
    out.root_port(CHASSIS_SCSI);
    out.section(
        "device \"qemu_scsi\"",
        &[
            ("driver", "virtio-scsi-pci"),
            ("bus", &port_id(CHASSIS_SCSI)),
            ("addr", "0x0"),
        ],
    );

    out.comment("Balloon driver");
    out.root_port(CHASSIS_BALLOON);
    out.section(
        "device \"qemu_balloon\"",
        &[
            ("driver", "virtio-balloon-pci"),
            ("bus", &port_id(CHASSIS_BALLOON)),
            ("addr", "0x0"),
        ],
    );

    out.comment("Random number generator");
    out.section(
        "object \"qemu_rng\"",
        &[("qom-type", "rng-random"), ("filename", "/dev/urandom")],
    );
    out.root_port(CHASSIS_RNG);
    out.section(
        "device \"dev-qemu_rng\"",
        &[
            ("driver", "virtio-rng-pci"),
            ("rng", "qemu_rng"),
            ("bus", &port_id(CHASSIS_RNG)),
            ("addr", "0x0"),
        ],
    );

    out.comment("USB controller");
    out.root_port(CHASSIS_USB);
    out.section(
        "device \"qemu_usb\"",
        &[
            ("driver", "qemu-xhci"),
            ("bus", &port_id(CHASSIS_USB)),
            ("addr", "0x0"),
        ],
    );

    out.comment("Console");
    out.section(&format!("chardev \"{CONSOLE_CHARDEV}\""), &[("backend", "pty")]);

    // Memory
    let memory = config.memory_bytes()?;
    out.comment("Memory");
    out.section("memory", &[("size", &format!("{memory}B"))]);

    // CPU
    let cpus = config.cpu_count()?.to_string();
    out.comment("CPU");
    out.section(
        "smp-opts",
        &[("cpus", &cpus), ("sockets", "1"), ("cores", &cpus), ("threads", "1")],
    );

    // Firmware
    out.comment("Firmware (read only)");
    out.section(
        "drive",
        &[
            ("file", &path_str(&config.firmware.code_path)),
            ("if", "pflash"),
            ("format", "raw"),
            ("unit", "0"),
            ("readonly", "on"),
        ],
    );
    out.comment("Firmware settings (writable)");
    out.section(
        "drive",
        &[
            ("file", &path_str(&config.firmware.nvram_path)),
            ("if", "pflash"),
            ("format", "raw"),
            ("unit", "1"),
        ],
    );

    // Control socket
    out.comment("Control socket");
    out.section(
        "chardev \"monitor\"",
        &[
            ("backend", "socket"),
            ("path", &path_str(&config.monitor_path)),
            ("server", "on"),
            ("wait", "off"),
        ],
    );
    out.section("mon", &[("chardev", "monitor"), ("mode", "control")]);

    // vsock
    out.comment("Agent vsock");
    out.root_port(CHASSIS_VSOCK);
    out.section(
        "device \"qemu_vsock\"",
        &[
            ("driver", "vhost-vsock-pci"),
            ("guest-cid", &config.vsock.guest_cid.to_string()),
            ("bus", &port_id(CHASSIS_VSOCK)),
            ("addr", "0x0"),
        ],
    );

    // Config share
    if let Some(share) = &config.config_share {
        out.comment("Config share");
        out.section(
            "fsdev \"qemu_config\"",
            &[
                ("fsdriver", "local"),
                ("security_model", "none"),
                ("readonly", "on"),
                ("path", &path_str(share)),
            ],
        );
        out.root_port(CHASSIS_CONFIG);
        out.section(
            "device \"dev-qemu_config\"",
            &[
                ("driver", "virtio-9p-pci"),
                ("fsdev", "qemu_config"),
                ("mount_tag", "config"),
                ("bus", &port_id(CHASSIS_CONFIG)),
                ("addr", "0x0"),
            ],
        );
    }

    // Drives
    if let Some(root) = &config.root_drive {
        out.drive(&root.drive_id, &root.path_on_host, root.is_read_only, ROOT_SCSI_ID, true);
    }
    for (i, drive) in config.extra_drives.iter().enumerate() {
        let scsi_id = ROOT_SCSI_ID + 1 + i as u32;
        out.drive(&drive.drive_id, &drive.path_on_host, drive.is_read_only, scsi_id, false);
    }

    // Network
    for (i, net) in config.networks.iter().enumerate() {
        let chassis = FIRST_NIC_CHASSIS + i as u32;
        let netdev = format!("kestrel_{}", net.iface_id);
        out.comment(&format!("Network card (\"{}\" device)", net.iface_id));
        out.section(
            &format!("netdev \"{netdev}\""),
            &[
                ("type", "tap"),
                ("ifname", &net.host_dev_name),
                ("script", "no"),
                ("downscript", "no"),
            ],
        );
        out.root_port(chassis);
        let mut fields: Vec<(&str, String)> = vec![
            ("driver", "virtio-net-pci".into()),
            ("netdev", netdev.clone()),
        ];
        if let Some(mac) = &net.guest_mac {
            fields.push(("mac", mac.clone()));
        }
        fields.push(("bus", port_id(chassis)));
        fields.push(("addr", "0x0".into()));
        let borrowed: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        out.section(&format!("device \"dev-{netdev}\""), &borrowed);
    }

    // USB passthrough
    for usb in &config.usb_devices {
        out.comment(&format!("USB host device (\"{}\")", usb.id));
        out.section(
            &format!("device \"{}\"", usb.id),
            &[
                ("driver", "usb-host"),
                ("bus", USB_BUS),
                ("hostbus", &usb.host_bus.to_string()),
                ("hostaddr", &usb.host_addr.to_string()),
            ],
        );
    }

    Ok(out.finish())
}

/// Render the machine description and write it to `path` with mode 0640.
pub async fn write_config(config: &MachineConfig, path: &Path) -> Result<()> {
    let text = render(config)?;
    tracing::debug!(path = %path.display(), bytes = text.len(), "Writing machine description");

    tokio::fs::write(path, text.as_bytes()).await?;
    set_mode(path, 0o640).await?;
    Ok(())
}

async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

fn port_id(chassis: u32) -> String {
    format!("qemu_pcie{chassis}")
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Accumulates the rendered text.
#[derive(Default)]
struct Config {
    buf: String,
}

impl Config {
    fn line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
    }

    fn comment(&mut self, text: &str) {
        self.line(&format!("# {text}"));
    }

    fn section(&mut self, header: &str, fields: &[(&str, &str)]) {
        // Writing into a String never fails.
        let _ = writeln!(self.buf, "[{header}]");
        for (key, value) in fields {
            let _ = writeln!(self.buf, "{key} = \"{value}\"");
        }
        self.buf.push('\n');
    }

    /// PCIe root port. Eight functions share a slot, starting at slot 2.
    fn root_port(&mut self, chassis: u32) {
        let index = chassis - 1;
        let slot = 2 + index / 8;
        let function = index % 8;
        let addr = if function == 0 {
            format!("{slot:#x}")
        } else {
            format!("{slot:#x}.{function:#x}")
        };

        let port = format!("{:#x}", 0x10 + index);
        let chassis_str = chassis.to_string();
        let mut fields = vec![
            ("driver", "pcie-root-port"),
            ("port", port.as_str()),
            ("chassis", chassis_str.as_str()),
            ("bus", "pcie.0"),
        ];
        if function == 0 {
            fields.push(("multifunction", "on"));
        }
        fields.push(("addr", addr.as_str()));
        self.section(&format!("device \"{}\"", port_id(chassis)), &fields);
    }

    fn drive(&mut self, id: &str, path: &Path, read_only: bool, scsi_id: u32, boot: bool) {
        let drive = format!("kestrel_{id}");
        self.comment(&format!("Drive (\"{id}\" device)"));

        let file = path_str(path);
        let mut fields = vec![
            ("file", file.as_str()),
            ("format", "raw"),
            ("if", "none"),
            ("cache", "none"),
            ("aio", "native"),
        ];
        if read_only {
            fields.push(("readonly", "on"));
        }
        self.section(&format!("drive \"{drive}\""), &fields);

        let scsi = scsi_id.to_string();
        let mut fields = vec![
            ("driver", "scsi-hd"),
            ("bus", "qemu_scsi.0"),
            ("channel", "0"),
            ("scsi-id", scsi.as_str()),
            ("lun", "1"),
            ("drive", drive.as_str()),
        ];
        if boot {
            fields.push(("bootindex", "1"));
        }
        self.section(&format!("device \"dev-{drive}\""), &fields);
    }

    fn finish(self) -> String {
        self.buf
    }
}
