//! Create, start, shutdown, stop and delete.

use super::VirtualMachine;
use crate::backend::{events, StoragePool, TrackedInterface};
use crate::device::{device_type, DeviceConfig, RunConfig};
use crate::error::{CoreError, Result};
use crate::instance::{project_prefix, InstanceArgs, InstanceStatus};
use crate::revert::Reverter;
use crate::services::Services;
use crate::validate::{config_flag, validate_architecture, validate_config, validate_devices};
use kestrel_vm::{ensure_kernel_module, process, MachineBuilder, Monitor, VsockConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default guest memory when `limits.memory` is unset.
const DEFAULT_MEMORY: &str = "1GiB";
/// Default vCPU count when `limits.cpu` is unset.
const DEFAULT_CPUS: &str = "1";

/// What a start attempt has done so far, undone in reverse on failure.
#[derive(Default)]
struct StartProgress {
    mounted: bool,
    started: Vec<(String, DeviceConfig)>,
}

impl VirtualMachine {
    /// Create a new instance from a record the caller already inserted.
    ///
    /// On any failure every step completed so far is undone, the instance
    /// record included.
    pub async fn create(services: Arc<Services>, args: InstanceArgs) -> Result<Self> {
        let started_at = Instant::now();
        let mut reverter = Reverter::new();
        {
            let database = services.database.clone();
            let project = args.project.clone();
            let name = args.name.clone();
            reverter.add("remove instance record", move || async move {
                database.instance_remove(&project, &name).await
            });
        }

        let mut vm = match Self::load(services.clone(), args).await {
            Ok(vm) => vm,
            Err(e) => {
                reverter.fail().await;
                return Err(e);
            }
        };

        match vm.create_inner(&mut reverter).await {
            Ok(()) => {
                reverter.success();
                services
                    .events
                    .send(vm.project(), events::CREATED, vm.name());
                tracing::info!(
                    instance = %vm.name(),
                    project = %vm.project(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Instance created"
                );
                Ok(vm)
            }
            Err(e) => {
                tracing::warn!(instance = %vm.name(), error = %e, "Create failed, reverting");
                reverter.fail().await;
                Err(e)
            }
        }
    }

    async fn create_inner(&mut self, reverter: &mut Reverter) -> Result<()> {
        validate_architecture(&self.args.architecture)?;
        validate_config(&self.args.config, false)?;
        validate_config(&self.expanded_config, false)?;
        let ctx = self.scratch_context();
        validate_devices(&self.services.drivers, &ctx, &self.args.devices, false)?;
        validate_devices(&self.services.drivers, &ctx, &self.expanded_devices, true)?;

        // Root disk pool must exist before anything is created.
        let (_, root) = self.expanded_devices.root_disk()?;
        let pool_name = root.get("pool").cloned().unwrap_or_default();
        let pool = self.services.storage.pool(&pool_name).await?;

        let database = self.services.database.clone();
        let project = self.args.project.clone();
        let name = self.args.name.clone();
        let snapshot = self.args.snapshot;
        database
            .volume_create(&project, pool.name(), &name, snapshot)
            .await?;
        {
            let pool_name = pool.name().to_string();
            reverter.add("delete volume record", move || async move {
                database
                    .volume_delete(&project, &pool_name, &name, snapshot)
                    .await
            });
        }

        if !self.args.snapshot {
            if let Some(tracker) = self.services.network_tracker.clone() {
                let interfaces = self.tracked_interfaces();
                if !interfaces.is_empty() {
                    let asset = project_prefix(&self.args.project, &self.args.name);
                    tracker.create(&asset, &interfaces).await?;
                    reverter.add("delete network assets", move || async move {
                        tracker.delete(&asset).await
                    });
                }
            }

            for (name, config) in self.expanded_devices.sorted() {
                match self.device_add(&name, &config).await {
                    Ok(()) => {}
                    Err(e) if e.is_unsupported_device() => {
                        tracing::debug!(instance = %self.args.name, device = %name, "Skipping unsupported device");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                if let Ok(driver) =
                    self.services
                        .drivers
                        .create(self.device_context(&name), &name, &config)
                {
                    reverter.add(format!("remove device {name}"), move || async move {
                        driver.remove().await
                    });
                }
            }
        }

        Ok(())
    }

    /// Boot the instance.
    ///
    /// Device starts and the volume mount are undone when a later step
    /// fails, so a failed start leaves the instance stopped.
    pub async fn start(&mut self) -> Result<()> {
        let started_at = Instant::now();
        if self.is_running().await {
            return Err(CoreError::ResourceBusy(format!(
                "instance {} is already running",
                self.args.name
            )));
        }

        for module in &self.services.config.kernel_modules {
            ensure_kernel_module(module).await?;
        }

        let pool = self.pool().await?;
        let mut progress = StartProgress {
            mounted: pool.mount_instance(&self.instance_ref()).await?,
            ..Default::default()
        };

        match self.start_inner(&mut progress).await {
            Ok(()) => {
                self.services
                    .events
                    .send(&self.args.project, events::STARTED, &self.args.name);
                tracing::info!(
                    instance = %self.args.name,
                    project = %self.args.project,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Instance started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(instance = %self.args.name, error = %e, "Start failed, rolling back");
                self.start_rollback(progress).await;
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self, progress: &mut StartProgress) -> Result<()> {
        create_dir(&self.path(), 0o700).await?;
        create_dir(&self.devices_path(), 0o711).await?;
        create_dir(&self.log_path(), 0o700).await?;

        self.generate_config_share().await?;
        self.setup_nvram(false).await?;

        if self.volatile_get("volatile.vm.uuid").is_none() {
            let id = uuid::Uuid::new_v4().to_string();
            self.volatile_set([("volatile.vm.uuid".to_string(), id)].into())
                .await?;
        }

        let mut run_confs: Vec<RunConfig> = Vec::new();
        for (name, config) in self.expanded_devices.sorted() {
            match self.device_start(&name, &config, false).await {
                Ok(run_conf) => {
                    progress.started.push((name, config));
                    run_confs.push(run_conf);
                }
                Err(e) if e.is_unsupported_device() => {
                    tracing::debug!(instance = %self.args.name, device = %name, "Skipping unsupported device");
                }
                Err(e) => return Err(e),
            }
        }

        let pool = self.pool().await?;
        let root_disk = pool.instance_disk_path(&self.instance_ref()).await?;
        let architecture = self.architecture()?;
        let ovmf = &self.services.config.ovmf_path;

        let mut builder = MachineBuilder::new(architecture)
            .memory(self.config_or("limits.memory", DEFAULT_MEMORY))
            .cpus(self.config_or("limits.cpu", DEFAULT_CPUS))
            .firmware(ovmf.join("OVMF_CODE.fd"), self.nvram_path())
            .monitor(self.monitor_path())
            .with_vsock(VsockConfig::for_instance(self.args.id)?.guest_cid)
            .config_share(self.path().join("config"))
            .root_drive(root_disk);

        for run_conf in &run_confs {
            for mount in &run_conf.mounts {
                builder = builder.with_drive(&mount.dev_name, &mount.dev_path, mount.read_only);
            }
            if let Some(net) = &run_conf.network {
                builder = builder.with_network(&net.name, &net.host_name, net.hwaddr.as_deref());
            }
            for usb in &run_conf.usb_attach {
                builder = builder.with_usb_host(&usb.id, usb.bus, usb.device);
            }
        }

        builder.write(self.conf_path()).await?;

        let binary = match &self.services.config.qemu_binary {
            Some(binary) => process::find_binary(binary)?,
            None => process::find_binary(architecture.qemu_binary())?,
        };

        let launch = process::LaunchConfig {
            name: self.args.name.clone(),
            uuid: self.volatile_get("volatile.vm.uuid").unwrap_or_default().to_string(),
            config_path: self.conf_path(),
            pid_path: self.pid_path(),
            hugepages: config_flag(&self.expanded_config, "limits.memory.hugepages"),
            extra_args: self
                .expanded_config
                .get("raw.qemu")
                .map(|raw| process::split_raw_args(raw))
                .unwrap_or_default(),
        };
        process::launch(&binary, &launch).await?;

        // The hypervisor is up; hook failures no longer undo the start.
        for mut run_conf in run_confs {
            if let Err(e) = run_conf.run_post_hooks().await {
                tracing::warn!(instance = %self.args.name, error = %e, "Post-start hook failed");
            }
        }
        Ok(())
    }

    async fn start_rollback(&mut self, progress: StartProgress) {
        for (name, config) in progress.started.into_iter().rev() {
            if let Err(e) = self.device_stop(&name, &config, false).await {
                tracing::warn!(instance = %self.args.name, device = %name, error = %e, "Failed to stop device during rollback");
            }
        }
        if let Err(e) = process::remove_if_exists(&self.pid_path()).await {
            tracing::warn!(instance = %self.args.name, error = %e, "Failed to remove PID file");
        }
        if progress.mounted {
            match self.pool().await {
                Ok(pool) => {
                    if let Err(e) = pool.unmount_instance(&self.instance_ref()).await {
                        tracing::warn!(instance = %self.args.name, error = %e, "Failed to unmount volume during rollback");
                    }
                }
                Err(e) => {
                    tracing::warn!(instance = %self.args.name, error = %e, "Storage pool unavailable during rollback");
                }
            }
        }
    }

    /// Ask the guest to power off and wait up to `timeout` for it to go.
    ///
    /// A zero timeout waits until the guest is gone. On timeout the
    /// hypervisor is left running.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let started_at = Instant::now();
        self.require_running().await?;

        let mut monitor =
            Monitor::connect(&self.monitor_path(), self.services.config.monitor_timeout).await?;
        monitor.powerdown().await?;
        drop(monitor);

        loop {
            if self.status().await != InstanceStatus::Running {
                break;
            }
            if !timeout.is_zero() && started_at.elapsed() >= timeout {
                tracing::warn!(instance = %self.args.name, timeout_ms = timeout.as_millis() as u64, "Shutdown timed out");
                return Err(CoreError::Timeout(timeout));
            }
            tokio::time::sleep(self.services.config.poll_interval).await;
        }

        self.on_stop().await?;
        self.services
            .events
            .send(&self.args.project, events::SHUTDOWN, &self.args.name);
        tracing::info!(
            instance = %self.args.name,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Instance shut down"
        );
        Ok(())
    }

    /// Terminate the hypervisor and wait for the process to exit.
    pub async fn stop(&mut self, stateful: bool) -> Result<()> {
        let started_at = Instant::now();
        if stateful {
            return Err(CoreError::Validation(
                "stateful stop is not supported for virtual machines".into(),
            ));
        }
        self.require_running().await?;

        let pid = process::read_pid(&self.pid_path()).await?;
        let mut monitor =
            Monitor::connect(&self.monitor_path(), self.services.config.monitor_timeout).await?;
        monitor.quit().await?;
        drop(monitor);

        if let Some(pid) = pid {
            process::wait_for_exit(pid, self.services.config.poll_interval).await;
        }

        self.on_stop().await?;
        self.services
            .events
            .send(&self.args.project, events::STOPPED, &self.args.name);
        tracing::info!(
            instance = %self.args.name,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Instance stopped"
        );
        Ok(())
    }

    async fn require_running(&self) -> Result<()> {
        match self.status().await {
            InstanceStatus::Running => Ok(()),
            status => Err(CoreError::ResourceBusy(format!(
                "instance {} is {status}",
                self.args.name
            ))),
        }
    }

    /// Cleanup after the hypervisor is gone.
    async fn on_stop(&mut self) -> Result<()> {
        for (name, config) in self.expanded_devices.reversed() {
            match self.device_stop(&name, &config, false).await {
                Ok(()) => {}
                Err(e) if e.is_unsupported_device() => {}
                Err(e) => {
                    tracing::warn!(instance = %self.args.name, device = %name, error = %e, "Failed to stop device");
                }
            }
        }

        process::remove_if_exists(&self.pid_path()).await?;
        process::remove_if_exists(&self.monitor_path()).await?;

        let pool = self.pool().await?;
        pool.unmount_instance(&self.instance_ref()).await?;
        Ok(())
    }

    /// Delete the instance, or the snapshot, and everything it owns.
    pub async fn delete(&mut self) -> Result<()> {
        let started_at = Instant::now();
        if self.args.snapshot {
            return self.delete_snapshot_volume().await;
        }
        if self.delete_protected() {
            return Err(CoreError::Validation(format!(
                "instance {} is protected from deletion",
                self.args.name
            )));
        }
        if self.is_running().await {
            return Err(CoreError::ResourceBusy(format!(
                "instance {} is running",
                self.args.name
            )));
        }

        let snapshots = self
            .services
            .database
            .instance_snapshots(&self.args.project, &self.args.name)
            .await?;
        for args in snapshots.into_iter().rev() {
            let mut snapshot = VirtualMachine::load(self.services.clone(), args).await?;
            snapshot.delete_snapshot_volume().await?;
        }

        let (pool_name, pool) = self.pool_best_effort().await?;
        if let Some(pool) = &pool {
            pool.delete_instance(&self.instance_ref()).await?;
        }
        self.services
            .database
            .volume_delete(&self.args.project, &pool_name, &self.args.name, false)
            .await?;

        for backup in self
            .services
            .database
            .instance_backups(&self.args.project, &self.args.name)
            .await?
        {
            self.services.database.backup_remove(&backup).await?;
        }

        if let Some(tracker) = self.services.network_tracker.clone() {
            let asset = project_prefix(&self.args.project, &self.args.name);
            if tracker.defined(&asset).await? {
                tracker.delete(&asset).await?;
            }
        }

        for (name, config) in self.expanded_devices.reversed() {
            match self.device_remove(&name, &config).await {
                Ok(()) => {}
                Err(e) if e.is_unsupported_device() => {}
                Err(e) => return Err(e),
            }
        }

        remove_dir(&self.devices_path()).await?;
        remove_dir(&self.shmounts_path()).await?;

        self.services
            .database
            .instance_remove(&self.args.project, &self.args.name)
            .await?;
        self.services
            .events
            .send(&self.args.project, events::DELETED, &self.args.name);
        tracing::info!(
            instance = %self.args.name,
            project = %self.args.project,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Instance deleted"
        );
        Ok(())
    }

    /// Delete a snapshot's volume and record.
    async fn delete_snapshot_volume(&mut self) -> Result<()> {
        let (pool_name, pool) = self.pool_best_effort().await?;
        if let Some(pool) = &pool {
            pool.delete_instance_snapshot(&self.instance_ref()).await?;
        }
        self.services
            .database
            .volume_delete(&self.args.project, &pool_name, &self.args.name, true)
            .await?;
        self.services
            .database
            .instance_remove(&self.args.project, &self.args.name)
            .await?;
        self.services
            .events
            .send(&self.args.project, events::SNAPSHOT_DELETED, &self.args.name);
        tracing::info!(instance = %self.args.name, "Snapshot deleted");
        Ok(())
    }

    /// Pool name and pool. A pool whose driver is unknown yields `None` so
    /// that only the database records are removed.
    async fn pool_best_effort(&self) -> Result<(String, Option<Arc<dyn StoragePool>>)> {
        let instance = self.instance_ref();
        let pool_name = self
            .services
            .database
            .instance_pool(&instance.project, instance.parent_name())
            .await?;
        match self.pool().await {
            Ok(pool) => Ok((pool_name, Some(pool))),
            Err(CoreError::UnknownStorageDriver(driver)) => {
                tracing::warn!(instance = %self.args.name, driver = %driver, "Unknown storage driver, removing volume record only");
                Ok((pool_name, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Interfaces reported to the network asset tracker.
    pub(crate) fn tracked_interfaces(&self) -> Vec<TrackedInterface> {
        self.expanded_devices
            .iter()
            .filter(|(_, config)| device_type(config) == "nic")
            .filter_map(|(name, config)| {
                let subnets: Vec<String> = ["maas.subnet.ipv4", "maas.subnet.ipv6"]
                    .iter()
                    .filter_map(|key| config.get(*key).filter(|v| !v.is_empty()).cloned())
                    .collect();
                if subnets.is_empty() {
                    return None;
                }
                let mac_address = config
                    .get("hwaddr")
                    .filter(|v| !v.is_empty())
                    .cloned()
                    .or_else(|| {
                        self.args
                            .config
                            .get(&format!("volatile.{name}.hwaddr"))
                            .cloned()
                    })?;
                Some(TrackedInterface {
                    name: name.clone(),
                    mac_address,
                    subnets,
                })
            })
            .collect()
    }

    /// Bring the network asset tracker in line with the current devices.
    pub(crate) async fn sync_network_assets(&self) -> Result<()> {
        let Some(tracker) = self.services.network_tracker.clone() else {
            return Ok(());
        };
        let asset = project_prefix(&self.args.project, &self.args.name);
        let interfaces = self.tracked_interfaces();
        let defined = tracker.defined(&asset).await?;

        match (defined, interfaces.is_empty()) {
            (true, true) => tracker.delete(&asset).await,
            (true, false) => tracker.update(&asset, &interfaces).await,
            (false, false) => tracker.create(&asset, &interfaces).await,
            (false, true) => Ok(()),
        }
    }

    fn config_or(&self, key: &str, default: &str) -> String {
        self.expanded_config
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

async fn create_dir(path: &Path, mode: u32) -> Result<()> {
    tokio::fs::create_dir_all(path).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

async fn remove_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
