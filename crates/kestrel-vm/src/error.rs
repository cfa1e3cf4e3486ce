//! Error types for kestrel-vm.

use thiserror::Error;

/// Result type alias for kestrel-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while describing, launching or talking to a VM.
#[derive(Debug, Error)]
pub enum VmError {
    /// Invalid machine description or malformed numeric field
    #[error("configuration error: {0}")]
    Config(String),

    /// Hypervisor binary could not be located
    #[error("hypervisor binary not found: {0}")]
    BinaryNotFound(String),

    /// Hypervisor process failed to launch or exited with an error
    #[error("failed to launch hypervisor: {0}")]
    Launch(String),

    /// Control socket could not be reached
    #[error("control channel unavailable: {0}")]
    MonitorUnavailable(String),

    /// Control channel handshake or command failure
    #[error("control channel error: {0}")]
    Monitor(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmError {
    /// True when the control socket itself was unreachable, as opposed to a
    /// protocol failure after connecting.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::MonitorUnavailable(_))
    }
}
