//! Launching the hypervisor and tracking its process.

use crate::error::{Result, VmError};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Locate a binary by name on PATH, or accept an explicit path.
pub fn find_binary(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|e| VmError::BinaryNotFound(format!("{name}: {e}")))
}

/// Arguments for a daemonized QEMU launch.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Instance name passed as `-name`
    pub name: String,
    /// Stable machine UUID passed as `-uuid`
    pub uuid: String,
    /// Machine description passed to `-readconfig`
    pub config_path: PathBuf,
    /// PID file written by QEMU once daemonized
    pub pid_path: PathBuf,
    /// Back memory with preallocated hugepages
    pub hugepages: bool,
    /// Extra raw arguments appended verbatim
    pub extra_args: Vec<String>,
}

impl LaunchConfig {
    /// Full argument vector, excluding the binary.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-name".into(),
            self.name.clone(),
            "-uuid".into(),
            self.uuid.clone(),
            "-daemonize".into(),
            "-cpu".into(),
            "host".into(),
            "-nographic".into(),
            "-serial".into(),
            "chardev:console".into(),
            "-nodefaults".into(),
            "-readconfig".into(),
            self.config_path.to_string_lossy().into_owned(),
            "-pidfile".into(),
            self.pid_path.to_string_lossy().into_owned(),
        ];

        if self.hugepages {
            args.extend(["-mem-path".into(), "/dev/hugepages/".into(), "-mem-prealloc".into()]);
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Split a free-form raw argument string on whitespace.
pub fn split_raw_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Launch the hypervisor and wait for it to daemonize.
///
/// With `-daemonize` the foreground process exits once the VM is set up, so a
/// non-zero exit status means the launch failed.
pub async fn launch(binary: &Path, config: &LaunchConfig) -> Result<()> {
    let start = std::time::Instant::now();
    let args = config.args();
    tracing::debug!(binary = %binary.display(), args = ?args, "Launching hypervisor");

    let output = Command::new(binary)
        .args(&args)
        .output()
        .await
        .map_err(|e| VmError::Launch(format!("{}: {e}", binary.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!(
            binary = %binary.display(),
            status = %output.status,
            stderr = %stderr.trim(),
            "Hypervisor launch failed"
        );
        return Err(VmError::Launch(format!(
            "{} exited with {}: {}",
            binary.display(),
            output.status,
            stderr.trim()
        )));
    }

    tracing::info!(
        name = %config.name,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Hypervisor launched"
    );
    Ok(())
}

/// Read a PID file. A missing file yields `None`.
pub async fn read_pid(path: &Path) -> Result<Option<i32>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    text.trim()
        .parse::<i32>()
        .map(Some)
        .map_err(|_| VmError::Config(format!("invalid PID file {}: {:?}", path.display(), text.trim())))
}

/// Whether a process with this PID exists.
pub fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Poll until the process exits. There is no upper bound.
pub async fn wait_for_exit(pid: i32, interval: Duration) {
    let start = std::time::Instant::now();
    while process_alive(pid) {
        tokio::time::sleep(interval).await;
    }
    tracing::debug!(pid, elapsed_ms = start.elapsed().as_millis() as u64, "Process exited");
}

/// Remove a file, ignoring a missing one.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
