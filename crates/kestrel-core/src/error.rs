//! Error types for kestrel-core.

use kestrel_vm::VmError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for kestrel-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during instance and device operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad config, device or profile. Never partially applied.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No driver for this device type on virtual machines
    #[error("unsupported device type: {0}")]
    UnsupportedDeviceType(String),

    /// Concurrent write conflict, retried by the persistence wrapper
    #[error("transient conflict: {0}")]
    TransientConflict(String),

    /// Instance is not in the state the operation requires
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// Hypervisor missing, failed to launch or failed the handshake
    #[error("external process failure: {0}")]
    ExternalProcess(String),

    /// Graceful shutdown did not complete in time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Object not found in the database or on disk
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage pool uses a driver this host does not know
    #[error("unknown storage driver: {0}")]
    UnknownStorageDriver(String),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Database failure other than a transient conflict
    #[error("database error: {0}")]
    Database(String),

    /// Failed to connect to guest agent
    #[error("agent connection failed: {0}")]
    Connection(String),

    /// Agent did not respond in time
    #[error("agent timeout after {0:?}")]
    AgentTimeout(Duration),

    /// JSON-RPC error from agent
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code from the agent
        code: i32,
        /// Error message from the agent
        message: String,
    },

    /// TLS material generation or verification failed
    #[error("certificate error: {0}")]
    Certificate(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True for [`CoreError::UnsupportedDeviceType`].
    pub fn is_unsupported_device(&self) -> bool {
        matches!(self, Self::UnsupportedDeviceType(_))
    }

    /// True for errors the persistence wrapper retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConflict(_))
    }

    /// True for [`CoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<VmError> for CoreError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::Config(msg) => Self::Validation(msg),
            VmError::Io(e) => Self::Io(e),
            VmError::Json(e) => Self::Json(e),
            e @ (VmError::BinaryNotFound(_)
            | VmError::Launch(_)
            | VmError::MonitorUnavailable(_)
            | VmError::Monitor(_)) => Self::ExternalProcess(e.to_string()),
        }
    }
}
