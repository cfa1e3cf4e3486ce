//! Collaborators the controller drives but does not implement.
//!
//! The database, storage pools, network asset inventory and lifecycle
//! notification sink are provided by the embedding daemon.

use crate::error::Result;
use crate::expand::Profile;
use crate::instance::{ConfigMap, InstanceArgs, InstanceRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Attempts made by [`retry`].
pub const RETRY_ATTEMPTS: u32 = 5;

/// Pause between [`retry`] attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle notification actions.
pub mod events {
    pub const CREATED: &str = "virtual-machine-created";
    pub const STARTED: &str = "virtual-machine-started";
    pub const STOPPED: &str = "virtual-machine-stopped";
    pub const SHUTDOWN: &str = "virtual-machine-shutdown";
    pub const UPDATED: &str = "virtual-machine-updated";
    pub const DELETED: &str = "virtual-machine-deleted";
    pub const SNAPSHOT_UPDATED: &str = "virtual-machine-snapshot-updated";
    pub const SNAPSHOT_DELETED: &str = "virtual-machine-snapshot-deleted";
}

/// Instance, profile, volume and backup records.
///
/// Write methods are individually transactional. Implementations report
/// write-write conflicts as `CoreError::TransientConflict`.
#[async_trait]
pub trait Database: Send + Sync {
    async fn instance_get(&self, project: &str, name: &str) -> Result<InstanceArgs>;

    /// Snapshots of an instance, oldest first.
    async fn instance_snapshots(&self, project: &str, name: &str) -> Result<Vec<InstanceArgs>>;

    /// Profiles by name, in the order given. Missing profiles are `NotFound`.
    async fn profiles(&self, project: &str, names: &[String]) -> Result<Vec<Profile>>;

    /// Name of the storage pool holding the instance volume.
    async fn instance_pool(&self, project: &str, name: &str) -> Result<String>;

    async fn volume_create(&self, project: &str, pool: &str, name: &str, snapshot: bool) -> Result<()>;

    async fn volume_delete(&self, project: &str, pool: &str, name: &str, snapshot: bool) -> Result<()>;

    async fn instance_backups(&self, project: &str, name: &str) -> Result<Vec<String>>;

    async fn backup_remove(&self, name: &str) -> Result<()>;

    async fn instance_remove(&self, project: &str, name: &str) -> Result<()>;

    /// Apply config changes atomically. An empty value deletes the key.
    async fn config_update(&self, id: i64, changes: &ConfigMap) -> Result<()>;

    /// Same as [`Database::config_update`], for a snapshot record.
    async fn snapshot_config_update(&self, id: i64, changes: &ConfigMap) -> Result<()>;

    async fn config_get(&self, id: i64) -> Result<ConfigMap>;

    /// Replace config, profiles, devices and core fields of an instance in
    /// one transaction.
    async fn instance_update(&self, args: &InstanceArgs) -> Result<()>;

    /// Update the mutable fields of a snapshot.
    async fn snapshot_update(
        &self,
        id: i64,
        description: &str,
        expiry_date: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Resolves storage pools by name.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fails with `UnknownStorageDriver` when the pool exists but its driver
    /// is not available on this host.
    async fn pool(&self, name: &str) -> Result<Arc<dyn StoragePool>>;
}

/// One storage pool.
#[async_trait]
pub trait StoragePool: Send + Sync {
    fn name(&self) -> &str;

    /// Mount the instance volume. Returns true when this call did the mount.
    async fn mount_instance(&self, instance: &InstanceRef) -> Result<bool>;

    /// Returns true when this call did the unmount.
    async fn unmount_instance(&self, instance: &InstanceRef) -> Result<bool>;

    /// Block device or image backing the instance volume.
    async fn instance_disk_path(&self, instance: &InstanceRef) -> Result<PathBuf>;

    async fn delete_instance(&self, instance: &InstanceRef) -> Result<()>;

    async fn delete_instance_snapshot(&self, instance: &InstanceRef) -> Result<()>;
}

/// Interface as reported to the network asset inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedInterface {
    pub name: String,
    pub mac_address: String,
    pub subnets: Vec<String>,
}

/// External inventory of machine network assets.
#[async_trait]
pub trait NetworkAssetTracker: Send + Sync {
    async fn defined(&self, name: &str) -> Result<bool>;
    async fn create(&self, name: &str, interfaces: &[TrackedInterface]) -> Result<()>;
    async fn update(&self, name: &str, interfaces: &[TrackedInterface]) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Sink for lifecycle notifications.
pub trait LifecycleEvents: Send + Sync {
    fn send(&self, project: &str, action: &str, source: &str);
}

/// Run a database operation, retrying transient conflicts.
pub async fn retry<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                tracing::debug!(operation = %label, attempt, error = %e, "Retrying after conflict");
                attempt += 1;
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            result => return result,
        }
    }
}
