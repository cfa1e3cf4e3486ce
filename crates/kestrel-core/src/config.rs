//! Controller configuration.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Default vsock port the guest agent listens on.
pub const DEFAULT_AGENT_PORT: u32 = 8443;

/// Process-wide settings for the VM controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Root for instance, snapshot, device and shmount directories.
    pub var_dir: PathBuf,

    /// Root for per-instance log directories (conf, PID file, monitor socket).
    pub log_dir: PathBuf,

    /// Directory holding `OVMF_CODE.fd` and the NVRAM templates.
    pub ovmf_path: PathBuf,

    /// Agent binary name (or path) copied into the config share.
    pub agent_binary: String,

    /// Interval for shutdown and process-exit polling (default: 500ms).
    pub poll_interval: Duration,

    /// Control channel connect + handshake timeout (default: 1s).
    pub monitor_timeout: Duration,

    /// Kernel modules loaded before every start.
    pub kernel_modules: Vec<String>,

    /// Hypervisor binary override. Per-architecture default when None.
    pub qemu_binary: Option<String>,

    /// sysfs directory scanned for present USB devices.
    pub usb_sysfs_path: PathBuf,

    /// vsock port of the guest agent.
    pub agent_port: u32,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("OVMF firmware not found: {0}")]
    MissingFirmware(PathBuf),

    #[error("var directory parent not found: {0}")]
    InvalidVarDir(PathBuf),

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            var_dir: PathBuf::from("/var/lib/kestrel"),
            log_dir: PathBuf::from("/var/log/kestrel"),
            ovmf_path: PathBuf::from("/usr/share/OVMF"),
            agent_binary: "kestrel-agent".into(),
            poll_interval: Duration::from_millis(500),
            monitor_timeout: Duration::from_secs(1),
            kernel_modules: vec!["vhost_vsock".into()],
            qemu_binary: None,
            usb_sysfs_path: PathBuf::from("/sys/bus/usb/devices"),
            agent_port: DEFAULT_AGENT_PORT,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KESTREL_VAR_DIR` | `/var/lib/kestrel` |
    /// | `KESTREL_LOG_DIR` | `/var/log/kestrel` |
    /// | `KESTREL_OVMF_PATH` | `/usr/share/OVMF` |
    /// | `KESTREL_AGENT_BINARY` | `kestrel-agent` |
    /// | `KESTREL_POLL_INTERVAL_MS` | `500` |
    /// | `KESTREL_MONITOR_TIMEOUT_MS` | `1000` |
    /// | `KESTREL_KERNEL_MODULES` | `vhost_vsock` (comma separated, empty for none) |
    /// | `KESTREL_QEMU_BINARY` | per architecture |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            var_dir: std::env::var("KESTREL_VAR_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.var_dir),
            log_dir: std::env::var("KESTREL_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.log_dir),
            ovmf_path: std::env::var("KESTREL_OVMF_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.ovmf_path),
            agent_binary: std::env::var("KESTREL_AGENT_BINARY").unwrap_or(default.agent_binary),
            poll_interval: std::env::var("KESTREL_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.poll_interval),
            monitor_timeout: std::env::var("KESTREL_MONITOR_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.monitor_timeout),
            kernel_modules: std::env::var("KESTREL_KERNEL_MODULES")
                .map(|v| parse_list(&v))
                .unwrap_or(default.kernel_modules),
            qemu_binary: std::env::var("KESTREL_QEMU_BINARY").ok().or(default.qemu_binary),
            usb_sysfs_path: default.usb_sysfs_path,
            agent_port: default.agent_port,
        }
    }

    /// Validate that required host paths exist.
    ///
    /// Call this at startup to get clear error messages about missing files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let code = self.ovmf_path.join("OVMF_CODE.fd");
        if !code.exists() {
            return Err(ConfigError::MissingFirmware(code));
        }

        // var dir is created on demand, so just check parent exists
        if let Some(parent) = self.var_dir.parent() {
            if !parent.exists() {
                return Err(ConfigError::InvalidVarDir(self.var_dir.clone()));
            }
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }

        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where paths may not exist yet.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Controller configuration problem");
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
