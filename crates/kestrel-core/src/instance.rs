//! Instance records, identity and on-disk layout.

use crate::config::ControllerConfig;
use crate::device::Devices;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Flat key/value configuration map.
pub type ConfigMap = BTreeMap<String, String>;

/// Project every instance belongs to unless told otherwise.
pub const DEFAULT_PROJECT: &str = "default";

/// Persisted definition of an instance or snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceArgs {
    pub id: i64,
    pub project: String,
    /// Snapshots are named `<parent>/<snapshot>`.
    pub name: String,
    pub description: String,
    pub architecture: String,
    pub ephemeral: bool,
    pub stateful: bool,
    pub snapshot: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Snapshots only.
    pub expiry_date: Option<DateTime<Utc>>,
    /// Applied in order, later profiles override earlier ones.
    pub profiles: Vec<String>,
    pub config: ConfigMap,
    pub devices: Devices,
}

/// Derived run status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Stopped,
    Running,
    /// Declared for API compatibility; virtual machines never report it.
    Frozen,
    Broken,
    /// The control channel answered but could not be understood.
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
            Self::Frozen => write!(f, "Frozen"),
            Self::Broken => write!(f, "Broken"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Lightweight identity handed to collaborators and device drivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceRef {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub snapshot: bool,
}

impl InstanceRef {
    /// Project-qualified name used for on-disk paths.
    pub fn storage_name(&self) -> String {
        project_prefix(&self.project, &self.name)
    }

    /// Instance directory (mount point of the instance volume).
    pub fn path(&self, config: &ControllerConfig) -> PathBuf {
        let dir = if self.snapshot {
            "virtual-machines-snapshots"
        } else {
            "virtual-machines"
        };
        config.var_dir.join(dir).join(self.storage_name())
    }

    /// Per-instance log directory.
    pub fn log_path(&self, config: &ControllerConfig) -> PathBuf {
        config.log_dir.join(self.storage_name())
    }

    /// Per-instance device state directory.
    pub fn devices_path(&self, config: &ControllerConfig) -> PathBuf {
        config.var_dir.join("devices").join(self.storage_name())
    }

    /// Per-instance shared mounts directory.
    pub fn shmounts_path(&self, config: &ControllerConfig) -> PathBuf {
        config.var_dir.join("shmounts").join(self.storage_name())
    }

    /// Parent instance name for snapshots.
    pub fn parent_name(&self) -> &str {
        self.name.split('/').next().unwrap_or(&self.name)
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.name)
    }
}

/// Prefix a name with its project unless it lives in the default project.
pub fn project_prefix(project: &str, name: &str) -> String {
    if project.is_empty() || project == DEFAULT_PROJECT {
        name.to_string()
    } else {
        format!("{project}_{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(project: &str, name: &str, snapshot: bool) -> InstanceRef {
        InstanceRef {
            id: 1,
            project: project.into(),
            name: name.into(),
            snapshot,
        }
    }

    #[test]
    fn test_project_prefix() {
        assert_eq!(project_prefix("default", "vm1"), "vm1");
        assert_eq!(project_prefix("", "vm1"), "vm1");
        assert_eq!(project_prefix("dev", "vm1"), "dev_vm1");
    }

    #[test]
    fn test_paths() {
        let config = ControllerConfig::default();
        assert_eq!(
            vm("default", "vm1", false).path(&config),
            PathBuf::from("/var/lib/kestrel/virtual-machines/vm1")
        );
        assert_eq!(
            vm("dev", "vm1/snap0", true).path(&config),
            PathBuf::from("/var/lib/kestrel/virtual-machines-snapshots/dev_vm1/snap0")
        );
        assert_eq!(
            vm("dev", "vm1", false).log_path(&config),
            PathBuf::from("/var/log/kestrel/dev_vm1")
        );
    }

    #[test]
    fn test_parent_name() {
        assert_eq!(vm("default", "vm1/snap0", true).parent_name(), "vm1");
        assert_eq!(vm("default", "vm1", false).parent_name(), "vm1");
    }
}
