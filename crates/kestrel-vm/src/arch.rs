//! Per-architecture hypervisor settings.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Guest architectures the controller knows how to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86_64,
    Aarch64,
}

impl Architecture {
    /// Architecture of the host this binary was built for.
    pub fn host() -> Result<Self> {
        std::env::consts::ARCH.parse()
    }

    /// Name of the QEMU system emulator for this architecture.
    pub fn qemu_binary(&self) -> &'static str {
        match self {
            Self::X86_64 => "qemu-system-x86_64",
            Self::Aarch64 => "qemu-system-aarch64",
        }
    }

    /// QEMU machine type.
    pub fn machine_type(&self) -> &'static str {
        match self {
            Self::X86_64 => "q35",
            Self::Aarch64 => "virt",
        }
    }

    /// Extra lines inserted into the machine description right after the
    /// `[machine]` section.
    pub fn base_options(&self) -> Vec<String> {
        match self {
            Self::X86_64 => vec![
                "[global]".into(),
                "driver = \"ICH9-LPC\"".into(),
                "property = \"disable_s3\"".into(),
                "value = \"1\"".into(),
                String::new(),
                "[global]".into(),
                "driver = \"ICH9-LPC\"".into(),
                "property = \"disable_s4\"".into(),
                "value = \"1\"".into(),
            ],
            Self::Aarch64 => Vec::new(),
        }
    }
}

impl FromStr for Architecture {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            other => Err(VmError::Config(format!("unsupported architecture: {other}"))),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Aarch64 => write!(f, "aarch64"),
        }
    }
}
