//! Reconfiguration of a stopped instance.

use super::VirtualMachine;
use crate::backend::{events, retry};
use crate::device::{DeviceDiff, Devices};
use crate::error::{CoreError, Result};
use crate::expand::{changed_keys, Profile};
use crate::instance::{ConfigMap, InstanceArgs};
use crate::validate::{
    validate_architecture, validate_config, validate_devices, RESERVED_NAMESPACES,
};
use std::collections::BTreeSet;
use std::time::Instant;

/// Device fields that feed the network asset tracker.
const TRACKED_FIELDS: &[&str] = &[
    "maas.subnet.ipv4",
    "maas.subnet.ipv6",
    "ipv4.address",
    "ipv6.address",
];

/// In-memory state restored when an update fails.
struct Snapshot {
    args: InstanceArgs,
    profiles: Vec<Profile>,
    expanded_config: ConfigMap,
    expanded_devices: Devices,
}

impl VirtualMachine {
    /// Replace the instance definition.
    ///
    /// The instance must be stopped. With `user_requested`, keys in the
    /// reserved namespaces must be passed through unchanged. On failure
    /// the in-memory state is restored and volatile keys written during
    /// the attempt are put back.
    pub async fn update(&mut self, mut new: InstanceArgs, user_requested: bool) -> Result<()> {
        let started_at = Instant::now();
        if self.is_running().await {
            return Err(CoreError::ResourceBusy(format!(
                "instance {} must be stopped to be updated",
                self.args.name
            )));
        }

        if new.architecture.is_empty() {
            new.architecture = self.args.architecture.clone();
        }
        validate_architecture(&new.architecture)?;
        validate_config(&new.config, false)?;
        validate_devices(
            &self.services.drivers,
            &self.scratch_context(),
            &new.devices,
            false,
        )?;

        let mut seen = BTreeSet::new();
        if let Some(dup) = new.profiles.iter().find(|p| !seen.insert(p.as_str())) {
            return Err(CoreError::Validation(format!("duplicate profile: {dup}")));
        }
        let profiles = self
            .services
            .database
            .profiles(&self.args.project, &new.profiles)
            .await?;

        if user_requested {
            check_reserved_unchanged(&self.args.config, &new.config)?;
        }

        let snapshot = Snapshot {
            args: self.args.clone(),
            profiles: self.profiles.clone(),
            expanded_config: self.expanded_config.clone(),
            expanded_devices: self.expanded_devices.clone(),
        };

        self.args.architecture = new.architecture;
        self.args.description = new.description;
        self.args.ephemeral = new.ephemeral;
        self.args.expiry_date = new.expiry_date;
        self.args.profiles = new.profiles;
        self.args.config = new.config;
        self.args.devices = new.devices;
        self.profiles = profiles;
        self.recompute_expanded();

        match self.update_inner(&snapshot).await {
            Ok(()) => {
                tracing::info!(
                    instance = %self.args.name,
                    project = %self.args.project,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Instance updated"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(instance = %self.args.name, error = %e, "Update failed, restoring");
                self.restore(snapshot).await;
                Err(e)
            }
        }
    }

    async fn update_inner(&mut self, snapshot: &Snapshot) -> Result<()> {
        let diff: DeviceDiff = self.device_diff(&snapshot.expanded_devices, &self.expanded_devices);
        let changed_config = changed_keys(&snapshot.expanded_config, &self.expanded_config);

        validate_config(&self.expanded_config, false)?;
        validate_devices(
            &self.services.drivers,
            &self.scratch_context(),
            &self.expanded_devices,
            true,
        )?;

        if self.args.snapshot {
            let database = self.services.database.clone();
            let (id, description, expiry) =
                (self.args.id, self.args.description.clone(), self.args.expiry_date);
            retry("snapshot_update", || {
                database.snapshot_update(id, &description, expiry)
            })
            .await?;
            self.services
                .events
                .send(&self.args.project, events::SNAPSHOT_UPDATED, &self.args.name);
            return Ok(());
        }

        tracing::debug!(
            instance = %self.args.name,
            removed = diff.removed.len(),
            added = diff.added.len(),
            updated = diff.updated.len(),
            changed_config = ?changed_config,
            "Applying update"
        );
        self.apply_device_diff(&diff, &snapshot.expanded_devices, false)
            .await?;

        if TRACKED_FIELDS
            .iter()
            .any(|f| diff.changed_fields.contains(*f))
        {
            self.sync_network_assets().await?;
        }

        if changed_config.iter().any(|k| k == "security.secureboot") {
            self.setup_nvram(true).await?;
        }

        let database = self.services.database.clone();
        let args = self.args.clone();
        retry("instance_update", || database.instance_update(&args)).await?;

        self.services
            .events
            .send(&self.args.project, events::UPDATED, &self.args.name);
        Ok(())
    }

    /// Put back the pre-update state, persisting the old volatile values.
    async fn restore(&mut self, snapshot: Snapshot) {
        let keys: BTreeSet<&String> = snapshot
            .args
            .config
            .keys()
            .chain(self.args.config.keys())
            .filter(|k| k.starts_with("volatile."))
            .collect();
        let changes: ConfigMap = keys
            .into_iter()
            .filter(|k| snapshot.args.config.get(*k) != self.args.config.get(*k))
            .map(|k| {
                let old = snapshot.args.config.get(k).cloned().unwrap_or_default();
                (k.clone(), old)
            })
            .collect();

        if !changes.is_empty() {
            if let Err(e) = self.persist_config("restore volatile", &changes).await {
                tracing::warn!(instance = %self.args.name, error = %e, "Failed to restore volatile keys");
            }
        }

        self.args = snapshot.args;
        self.profiles = snapshot.profiles;
        self.expanded_config = snapshot.expanded_config;
        self.expanded_devices = snapshot.expanded_devices;
    }
}

/// Reject changes to keys in the reserved namespaces.
fn check_reserved_unchanged(old: &ConfigMap, new: &ConfigMap) -> Result<()> {
    let reserved = |k: &&String| RESERVED_NAMESPACES.iter().any(|ns| k.starts_with(ns));
    for key in old.keys().chain(new.keys()).filter(reserved) {
        if old.get(key) != new.get(key) {
            return Err(CoreError::Validation(format!(
                "reserved key {key} cannot be changed"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dev;
    use crate::expand::Profile;
    use crate::test_support::{instance_args, TestEnv};

    #[test]
    fn test_reserved_keys() {
        let old: ConfigMap = [
            ("volatile.vm.uuid".to_string(), "u".to_string()),
            ("limits.cpu".to_string(), "1".to_string()),
        ]
        .into();
        let mut new = old.clone();
        new.insert("limits.cpu".into(), "4".into());
        assert!(check_reserved_unchanged(&old, &new).is_ok());

        new.insert("image.os".into(), "debian".into());
        assert!(check_reserved_unchanged(&old, &new).is_err());

        let mut dropped = old.clone();
        dropped.remove("volatile.vm.uuid");
        assert!(check_reserved_unchanged(&old, &dropped).is_err());
    }

    #[tokio::test]
    async fn test_update_cpu_keeps_nvram() {
        let env = TestEnv::new();
        let mut args = instance_args("vm1");
        args.config.insert("limits.cpu".into(), "1".into());
        let mut vm = env.vm_with(args).await;
        vm.setup_nvram(false).await.unwrap();
        std::fs::write(vm.nvram_path(), b"enrolled keys").unwrap();

        let mut new = vm.args().clone();
        new.config.insert("limits.cpu".into(), "2".into());
        vm.update(new, true).await.unwrap();

        assert_eq!(vm.expanded_config()["limits.cpu"], "2");
        assert_eq!(std::fs::read(vm.nvram_path()).unwrap(), b"enrolled keys");
        assert!(env.network.calls().is_empty());
        assert_eq!(env.db.record("vm1").config["limits.cpu"], "2");
        assert_eq!(env.events.sent(), vec![format!("{} vm1", events::UPDATED)]);
    }

    #[tokio::test]
    async fn test_update_secureboot_regenerates_nvram() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;
        vm.setup_nvram(false).await.unwrap();
        assert_eq!(std::fs::read(vm.nvram_path()).unwrap(), b"secure vars");

        let mut new = vm.args().clone();
        new.config.insert("security.secureboot".into(), "false".into());
        vm.update(new, true).await.unwrap();
        assert_eq!(std::fs::read(vm.nvram_path()).unwrap(), b"plain vars");
    }

    #[tokio::test]
    async fn test_update_rejects_running() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;
        let _server = env.fake_monitor(&vm).await;
        let new = vm.args().clone();
        let err = vm.update(new, true).await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceBusy(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_bad_profiles() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;

        let mut new = vm.args().clone();
        new.profiles = vec!["web".into(), "web".into()];
        let err = vm.update(new, true).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let mut new = vm.args().clone();
        new.profiles = vec!["missing".into()];
        assert!(vm.update(new, true).await.unwrap_err().is_not_found());
        assert!(vm.profiles().is_empty());
    }

    #[tokio::test]
    async fn test_update_applies_profile_config() {
        let env = TestEnv::new();
        env.db.add_profile(Profile {
            name: "big".into(),
            config: [("limits.memory".to_string(), "4GiB".to_string())].into(),
            ..Default::default()
        });
        let mut vm = env.vm("vm1").await;

        let mut new = vm.args().clone();
        new.profiles = vec!["big".into()];
        vm.update(new, true).await.unwrap();
        assert_eq!(vm.expanded_config()["limits.memory"], "4GiB");
        assert!(vm.local_config().get("limits.memory").is_none());
    }

    #[tokio::test]
    async fn test_update_adds_and_removes_devices() {
        let env = TestEnv::new();
        let mut args = instance_args("vm1");
        args.devices.insert("mask", dev(&[("type", "none")]));
        let mut vm = env.vm_with(args).await;

        let mut new = vm.args().clone();
        new.devices.remove("mask");
        new.devices.insert(
            "eth0",
            dev(&[("type", "nic"), ("nictype", "bridged"), ("parent", "br0")]),
        );
        vm.update(new, true).await.unwrap();

        assert!(vm.expanded_devices().get("mask").is_none());
        let mac = vm.volatile_get("volatile.eth0.hwaddr").unwrap().to_string();
        assert_eq!(env.db.record("vm1").config["volatile.eth0.hwaddr"], mac);
        // Cold update: nothing is started.
        assert!(env.network.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_restores_state() {
        let env = TestEnv::new();
        let mut vm = env.vm("vm1").await;
        let before = vm.args().clone();

        let mut new = vm.args().clone();
        new.devices.insert(
            "eth0",
            dev(&[("type", "nic"), ("nictype", "bridged"), ("parent", "br0")]),
        );
        env.db.fail_instance_update(true);
        let err = vm.update(new, false).await.unwrap_err();
        assert!(matches!(err, CoreError::Database(_)), "{err}");

        assert_eq!(vm.args(), &before);
        assert!(vm.expanded_devices().get("eth0").is_none());
        assert!(!env.db.config_of(vm.id()).contains_key("volatile.eth0.hwaddr"));
        assert!(env.events.sent().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_update_persists_description_only() {
        let env = TestEnv::new();
        env.vm("vm1").await;
        let snap = env.insert_snapshot("vm1", "snap0");
        let mut vm = crate::vm::VirtualMachine::load(env.services.clone(), snap)
            .await
            .unwrap();

        let mut new = vm.args().clone();
        new.description = "before upgrade".into();
        vm.update(new, true).await.unwrap();
        assert_eq!(env.db.record("vm1/snap0").description, "before upgrade");
        assert_eq!(
            env.events.sent(),
            vec![format!("{} vm1/snap0", events::SNAPSHOT_UPDATED)]
        );
    }
}
