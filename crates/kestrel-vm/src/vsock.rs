//! Host-side vsock prerequisites.
//!
//! QEMU's `vhost-vsock-pci` device needs the `vhost_vsock` kernel module.

use crate::error::{Result, VmError};
use std::path::Path;
use tokio::process::Command;

/// Ensure a kernel module is loaded, running `modprobe` if it is not.
pub async fn ensure_kernel_module(name: &str) -> Result<()> {
    ensure_kernel_module_in(Path::new("/sys/module"), name).await
}

async fn ensure_kernel_module_in(sysfs: &Path, name: &str) -> Result<()> {
    // sysfs uses underscores even when the module is requested with dashes
    if sysfs.join(name.replace('-', "_")).exists() {
        tracing::trace!(module = %name, "Kernel module already loaded");
        return Ok(());
    }

    tracing::debug!(module = %name, "Loading kernel module");
    let output = Command::new("modprobe")
        .arg("-b")
        .arg(name)
        .output()
        .await
        .map_err(|e| VmError::Launch(format!("modprobe {name}: {e}")))?;

    if !output.status.success() {
        return Err(VmError::Launch(format!(
            "failed to load kernel module {name}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    tracing::info!(module = %name, "Kernel module loaded");
    Ok(())
}
