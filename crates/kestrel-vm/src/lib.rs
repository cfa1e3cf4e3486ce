//! # kestrel-vm
//!
//! Hypervisor layer for the kestrel VM controller.
//! Describes QEMU machines, launches them and talks to them over the
//! control channel.
//!
//! ## Quick Start
//!
//! ```no_run
//! use kestrel_vm::{monitor, Architecture, MachineBuilder};
//! use std::time::Duration;
//!
//! # async fn example() -> kestrel_vm::Result<()> {
//! // Render the machine description
//! MachineBuilder::new(Architecture::host()?)
//!     .memory("1GB")
//!     .cpus("2")
//!     .monitor("/var/log/kestrel/vm1/qemu.monitor")
//!     .root_drive("/dev/zvol/default/vm1")
//!     .write("/var/log/kestrel/vm1/qemu.conf")
//!     .await?;
//!
//! // ... launch, then query the run state
//! let state = monitor::query_state(
//!     "/var/log/kestrel/vm1/qemu.monitor".as_ref(),
//!     Duration::from_secs(1),
//! )
//! .await?;
//! println!("vm1 is {state}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Machine Description**: Deterministic `-readconfig` rendering with a fixed section order
//! - **Control Channel**: QMP status, power-down, quit, console path and USB hotplug
//! - **Process Management**: Daemonized launch, PID files, exit polling
//! - **vsock Support**: Guest CID allocation and `vhost_vsock` module loading
//! - **Builder Pattern**: Ergonomic configuration with `MachineBuilder`

mod arch;
mod builder;
mod config;
mod error;
pub mod monitor;
pub mod process;
pub mod qemu_config;
mod units;
mod vsock;

pub use arch::Architecture;
pub use builder::MachineBuilder;
pub use config::{
    DriveConfig, FirmwareConfig, MachineConfig, NetworkConfig, UsbHostConfig, VsockConfig,
    VSOCK_CID_OFFSET,
};
pub use error::{Result, VmError};
pub use monitor::{Monitor, VmState};
pub use units::{parse_byte_size, parse_cpu_count};
pub use vsock::ensure_kernel_module;
