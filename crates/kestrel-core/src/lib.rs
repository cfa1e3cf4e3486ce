//! # kestrel-core
//!
//! Host-side lifecycle controller for QEMU virtual machines.
//!
//! This crate turns instance records (config, profiles, devices) into
//! running QEMU processes and keeps the two in sync: it creates, starts,
//! stops, updates and deletes instances, attaches devices at start and at
//! runtime, and reaches into the guest through the vsock agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   kestrel-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │    Services     │────▶│ Database / Storage /     │   │
//! │  │  - config       │     │ Events / AssetTracker    │   │
//! │  │  - drivers      │     └──────────────────────────┘   │
//! │  │  - hotplug      │                                    │
//! │  └─────────────────┘                                    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ VirtualMachine  │────▶│  DeviceDriver            │   │
//! │  │  - create()     │     │  (disk, nic, unix-hotplug│   │
//! │  │  - start()      │     │   none)                  │   │
//! │  │  - update()     │     └──────────────────────────┘   │
//! │  │  - delete()     │                                    │
//! │  └─────────────────┘                                    │
//! │      │         │                                         │
//! │      │ QMP     │ vsock                                   │
//! │      ▼         ▼                                         │
//! │  ┌────────┐ ┌──────────────────────────┐                │
//! │  │ qemu   │ │ guest agent (JSON-RPC)   │                │
//! │  └────────┘ └──────────────────────────┘                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use kestrel_core::{ControllerConfig, InstanceArgs, Services, VirtualMachine};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(
//! #     database: Arc<dyn kestrel_core::backend::Database>,
//! #     storage: Arc<dyn kestrel_core::backend::StorageBackend>,
//! #     events: Arc<dyn kestrel_core::backend::LifecycleEvents>,
//! #     args: InstanceArgs,
//! # ) -> kestrel_core::Result<()> {
//! let config = ControllerConfig::from_env();
//! let services = Arc::new(Services::new(config, database, storage, events));
//!
//! let mut vm = VirtualMachine::create(services.clone(), args).await?;
//! vm.start().await?;
//!
//! println!("{} is {}", vm.name(), vm.status().await);
//!
//! vm.shutdown(Duration::from_secs(30)).await?;
//! vm.delete().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Instance Lifecycle**: Create, start, stop, shutdown, update and delete with rollback
//! - **Device Drivers**: Pluggable per-type drivers with a hot-pluggable field contract
//! - **Hotplug**: Host uevent subscriptions routed to running instances
//! - **Guest Access**: Console, exec, file transfer and state over the vsock agent
//! - **Config Share**: Agent, certificates and cloud-init data exported to the guest

pub mod agent;
pub mod backend;
mod certs;
mod config;
mod console;
pub mod device;
mod error;
mod expand;
pub mod hotplug;
mod instance;
mod revert;
mod services;
mod validate;
mod vm;

#[cfg(test)]
mod test_support;

pub use certs::{ensure_certificate_pair, generate_certificate, CertificatePair};
pub use config::{ConfigError, ControllerConfig, DEFAULT_AGENT_PORT};
pub use console::{ConsoleLease, ConsoleRegistry};
pub use error::{CoreError, Result};
pub use expand::{changed_keys, expand_config, expand_devices, Profile};
pub use instance::{
    project_prefix, ConfigMap, InstanceArgs, InstanceRef, InstanceStatus, DEFAULT_PROJECT,
};
pub use revert::Reverter;
pub use services::Services;
pub use validate::{
    config_flag, parse_bool, validate_architecture, validate_config, validate_device_name,
    validate_devices, RESERVED_NAMESPACES,
};
pub use vm::{Console, ExecCommand, ExecStdio, InstanceState, VirtualMachine};
