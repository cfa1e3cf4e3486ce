//! Virtual machine instances.
//!
//! A [`VirtualMachine`] is one loaded instance record plus its expanded
//! config and devices. Values are cheap to rebuild and are not shared
//! between tasks; the resolved storage pool and agent client are memoized
//! for the lifetime of one value.

mod config_share;
mod console;
mod devices;
mod lifecycle;
mod update;

pub use console::{Console, ExecCommand, ExecStdio, InstanceState};

use crate::agent::{AgentClient, AgentCredentials};
use crate::backend::{retry, StoragePool};
use crate::certs::ensure_certificate_pair;
use crate::device::{DeviceContext, Devices};
use crate::error::{CoreError, Result};
use crate::expand::{expand_config, expand_devices, Profile};
use crate::instance::{ConfigMap, InstanceArgs, InstanceRef, InstanceStatus, DEFAULT_PROJECT};
use crate::services::Services;
use crate::validate::config_flag;
use kestrel_vm::{monitor, process, Architecture, VmState, VsockConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Control channel socket file name inside the log directory.
const MONITOR_FILE: &str = "qemu.monitor";
/// PID file name inside the log directory.
const PID_FILE: &str = "qemu.pid";
/// Machine description file name inside the log directory.
const CONF_FILE: &str = "qemu.conf";
/// NVRAM store inside the instance directory.
const NVRAM_FILE: &str = "qemu.nvram";

pub struct VirtualMachine {
    services: Arc<Services>,
    args: InstanceArgs,
    profiles: Vec<Profile>,
    expanded_config: ConfigMap,
    expanded_devices: Devices,
    pool: OnceCell<Arc<dyn StoragePool>>,
    agent: OnceCell<Arc<dyn AgentClient>>,
}

impl VirtualMachine {
    /// Build from a record and its already-resolved profiles.
    pub fn instantiate(services: Arc<Services>, mut args: InstanceArgs, profiles: Vec<Profile>) -> Self {
        if args.project.is_empty() {
            args.project = DEFAULT_PROJECT.to_string();
        }
        let expanded_config = expand_config(&args.config, &profiles);
        let expanded_devices = expand_devices(&args.devices, &profiles);
        Self {
            services,
            args,
            profiles,
            expanded_config,
            expanded_devices,
            pool: OnceCell::new(),
            agent: OnceCell::new(),
        }
    }

    /// Build from a record, fetching its profiles.
    pub async fn load(services: Arc<Services>, args: InstanceArgs) -> Result<Self> {
        let project = if args.project.is_empty() {
            DEFAULT_PROJECT
        } else {
            args.project.as_str()
        };
        let profiles = services.database.profiles(project, &args.profiles).await?;
        Ok(Self::instantiate(services, args, profiles))
    }

    pub fn id(&self) -> i64 {
        self.args.id
    }

    pub fn project(&self) -> &str {
        &self.args.project
    }

    pub fn name(&self) -> &str {
        &self.args.name
    }

    pub fn description(&self) -> &str {
        &self.args.description
    }

    pub fn is_snapshot(&self) -> bool {
        self.args.snapshot
    }

    pub fn is_ephemeral(&self) -> bool {
        self.args.ephemeral
    }

    pub fn profiles(&self) -> &[String] {
        &self.args.profiles
    }

    pub fn local_config(&self) -> &ConfigMap {
        &self.args.config
    }

    pub fn local_devices(&self) -> &Devices {
        &self.args.devices
    }

    pub fn expanded_config(&self) -> &ConfigMap {
        &self.expanded_config
    }

    pub fn expanded_devices(&self) -> &Devices {
        &self.expanded_devices
    }

    pub fn args(&self) -> &InstanceArgs {
        &self.args
    }

    pub fn instance_ref(&self) -> InstanceRef {
        InstanceRef {
            id: self.args.id,
            project: self.args.project.clone(),
            name: self.args.name.clone(),
            snapshot: self.args.snapshot,
        }
    }

    pub fn architecture(&self) -> Result<Architecture> {
        self.args
            .architecture
            .parse()
            .map_err(|e: kestrel_vm::VmError| CoreError::Validation(e.to_string()))
    }

    /// Instance directory.
    pub fn path(&self) -> PathBuf {
        self.instance_ref().path(&self.services.config)
    }

    pub fn log_path(&self) -> PathBuf {
        self.instance_ref().log_path(&self.services.config)
    }

    pub fn devices_path(&self) -> PathBuf {
        self.instance_ref().devices_path(&self.services.config)
    }

    pub fn shmounts_path(&self) -> PathBuf {
        self.instance_ref().shmounts_path(&self.services.config)
    }

    pub fn monitor_path(&self) -> PathBuf {
        self.log_path().join(MONITOR_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.log_path().join(PID_FILE)
    }

    pub fn conf_path(&self) -> PathBuf {
        self.log_path().join(CONF_FILE)
    }

    pub fn nvram_path(&self) -> PathBuf {
        self.path().join(NVRAM_FILE)
    }

    /// Derive the run status from the control channel.
    ///
    /// Every call opens and closes its own connection. An unreachable socket
    /// means Stopped unless the recorded process is still alive, which is
    /// Broken. A protocol failure after connecting is Error.
    pub async fn status(&self) -> InstanceStatus {
        match monitor::query_state(&self.monitor_path(), self.services.config.monitor_timeout).await
        {
            Ok(VmState::Running) => InstanceStatus::Running,
            Ok(VmState::Paused | VmState::Stopped) => InstanceStatus::Stopped,
            Err(e) if e.is_unavailable() => {
                let alive = matches!(
                    process::read_pid(&self.pid_path()).await,
                    Ok(Some(pid)) if process::process_alive(pid)
                );
                if alive {
                    InstanceStatus::Broken
                } else {
                    InstanceStatus::Stopped
                }
            }
            Err(e) => {
                tracing::debug!(instance = %self.args.name, error = %e, "Control channel error");
                InstanceStatus::Error
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.status().await == InstanceStatus::Running
    }

    /// Set or clear (empty value) volatile keys, persisting first.
    ///
    /// Every key must be in the `volatile.` namespace. The write is
    /// all-or-nothing: memory is only touched once persistence succeeded.
    pub async fn volatile_set(&mut self, changes: ConfigMap) -> Result<()> {
        if let Some(bad) = changes.keys().find(|k| !k.starts_with("volatile.")) {
            return Err(CoreError::Validation(format!(
                "volatile_set can only modify volatile keys: {bad}"
            )));
        }
        if changes.is_empty() {
            return Ok(());
        }

        self.persist_config("volatile_set", &changes).await?;

        for (key, value) in changes {
            if value.is_empty() {
                self.args.config.remove(&key);
                self.expanded_config.remove(&key);
            } else {
                self.args.config.insert(key.clone(), value.clone());
                self.expanded_config.insert(key, value);
            }
        }
        Ok(())
    }

    /// Write config changes to the instance or snapshot record, retrying
    /// transient conflicts.
    pub(crate) async fn persist_config(&self, label: &str, changes: &ConfigMap) -> Result<()> {
        let database = self.services.database.clone();
        let id = self.args.id;
        if self.args.snapshot {
            retry(label, || database.snapshot_config_update(id, changes)).await
        } else {
            retry(label, || database.config_update(id, changes)).await
        }
    }

    /// Value of a volatile key.
    pub fn volatile_get(&self, key: &str) -> Option<&str> {
        self.args.config.get(key).map(String::as_str)
    }

    /// Recompute expanded config and devices from local state and profiles.
    fn recompute_expanded(&mut self) {
        self.expanded_config = expand_config(&self.args.config, &self.profiles);
        self.expanded_devices = expand_devices(&self.args.devices, &self.profiles);
    }

    /// Storage pool of the instance volume, resolved once.
    pub(crate) async fn pool(&self) -> Result<Arc<dyn StoragePool>> {
        self.pool
            .get_or_try_init(|| async {
                let instance = self.instance_ref();
                let name = self
                    .services
                    .database
                    .instance_pool(&instance.project, instance.parent_name())
                    .await?;
                self.services.storage.pool(&name).await
            })
            .await
            .cloned()
    }

    /// Agent client, connected once.
    pub(crate) async fn agent(&self) -> Result<Arc<dyn AgentClient>> {
        self.agent
            .get_or_try_init(|| async {
                let path = self.path();
                tokio::fs::create_dir_all(&path).await?;
                let client =
                    ensure_certificate_pair(&path, "agent-client", &self.args.name).await?;
                let agent_cert = ensure_certificate_pair(&path, "agent", &self.args.name)
                    .await?
                    .cert;
                let cid = VsockConfig::for_instance(self.args.id)?.guest_cid;
                self.services
                    .agents
                    .connect(&self.instance_ref(), cid, AgentCredentials { client, agent_cert })
                    .await
            })
            .await
            .cloned()
    }

    /// Context with volatile access for the named device.
    fn device_context(&self, name: &str) -> DeviceContext {
        self.scratch_context()
            .with_volatile(crate::device::VolatileAccessor::new(name, &self.args.config))
    }

    /// Context without volatile access, for validation and capability queries.
    fn scratch_context(&self) -> DeviceContext {
        DeviceContext::detached(
            self.instance_ref(),
            self.expanded_config.clone(),
            self.services.hotplug.clone(),
            self.services.host_network.clone(),
            self.services.config.usb_sysfs_path.clone(),
        )
    }

    fn delete_protected(&self) -> bool {
        config_flag(&self.expanded_config, "security.protection.delete")
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("id", &self.args.id)
            .field("project", &self.args.project)
            .field("name", &self.args.name)
            .field("snapshot", &self.args.snapshot)
            .finish()
    }
}
