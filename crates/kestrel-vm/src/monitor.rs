//! Control channel client for a running QEMU process.
//!
//! Speaks the QMP JSON protocol over the monitor Unix socket. Connections are
//! short-lived: open, negotiate, issue one or two commands, drop.

use crate::error::{Result, VmError};
use crate::qemu_config::CONSOLE_CHARDEV;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Run state of the hypervisor as reported by `query-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Guest CPUs are executing
    Running,
    /// Guest is paused
    Paused,
    /// Any other reported state (shutdown, prelaunch, internal-error, ...)
    Stopped,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A connected, negotiated control channel session.
pub struct Monitor {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    path: PathBuf,
}

impl Monitor {
    /// Connect to the monitor socket and complete capability negotiation.
    ///
    /// # Errors
    ///
    /// `VmError::MonitorUnavailable` if the socket cannot be reached, and
    /// `VmError::Monitor` if the greeting or negotiation fails.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Connecting to control socket");

        let stream = match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(VmError::MonitorUnavailable(format!(
                    "{}: {e}",
                    path.display()
                )))
            }
            Err(_) => {
                return Err(VmError::MonitorUnavailable(format!(
                    "{}: connect timed out",
                    path.display()
                )))
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut monitor = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            path: path.to_path_buf(),
        };

        match tokio::time::timeout(timeout, monitor.handshake()).await {
            Ok(result) => result?,
            Err(_) => return Err(VmError::Monitor("handshake timed out".into())),
        }

        Ok(monitor)
    }

    async fn handshake(&mut self) -> Result<()> {
        let greeting = self.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(VmError::Monitor(format!("unexpected greeting: {greeting}")));
        }

        let _: Value = self.execute("qmp_capabilities", None).await?;
        tracing::trace!(path = %self.path.display(), "Control channel negotiated");
        Ok(())
    }

    /// Read the next reply, skipping asynchronous events.
    async fn read_message(&mut self) -> Result<Value> {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(VmError::Monitor("connection closed".into()));
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let message: Value = serde_json::from_str(line)
                .map_err(|e| VmError::Monitor(format!("malformed message: {e}")))?;
            if let Some(event) = message.get("event") {
                tracing::trace!(event = %event, "Skipping control channel event");
                continue;
            }
            return Ok(message);
        }
    }

    /// Execute a command and decode its `return` payload.
    pub async fn execute<R: DeserializeOwned>(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<R> {
        let mut request = serde_json::json!({ "execute": command });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }

        let body = serde_json::to_string(&request)?;
        tracing::trace!(request = %body, "Control channel request");
        self.writer.write_all(body.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let response = self.read_message().await?;
        if let Some(error) = response.get("error") {
            let desc = error
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(VmError::Monitor(format!("{command}: {desc}")));
        }

        let ret = response
            .get("return")
            .cloned()
            .ok_or_else(|| VmError::Monitor(format!("{command}: missing return")))?;
        serde_json::from_value(ret).map_err(VmError::from)
    }

    /// Query the current run state.
    pub async fn status(&mut self) -> Result<VmState> {
        #[derive(Deserialize)]
        struct StatusInfo {
            status: String,
        }

        let info: StatusInfo = self.execute("query-status", None).await?;
        Ok(match info.status.as_str() {
            "running" => VmState::Running,
            "paused" => VmState::Paused,
            _ => VmState::Stopped,
        })
    }

    /// Ask the guest to power down gracefully (ACPI).
    pub async fn powerdown(&mut self) -> Result<()> {
        let _: Value = self.execute("system_powerdown", None).await?;
        Ok(())
    }

    /// Terminate the hypervisor immediately.
    ///
    /// The process may close the socket before replying, which is treated
    /// as success.
    pub async fn quit(&mut self) -> Result<()> {
        match self.execute::<Value>("quit", None).await {
            Ok(_) => Ok(()),
            Err(VmError::Monitor(msg)) if msg == "connection closed" => Ok(()),
            Err(VmError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Host path of the pty allocated for the console chardev.
    pub async fn console_path(&mut self) -> Result<PathBuf> {
        #[derive(Deserialize)]
        struct ChardevInfo {
            label: String,
            filename: String,
        }

        let chardevs: Vec<ChardevInfo> = self.execute("query-chardev", None).await?;
        chardevs
            .into_iter()
            .find(|c| c.label == CONSOLE_CHARDEV)
            .map(|c| PathBuf::from(c.filename.trim_start_matches("pty:")))
            .ok_or_else(|| VmError::Monitor("console chardev not found".into()))
    }

    /// Hot-add a device described by QMP `device_add` arguments.
    pub async fn device_add(&mut self, arguments: Value) -> Result<()> {
        let _: Value = self.execute("device_add", Some(arguments)).await?;
        Ok(())
    }

    /// Hot-remove the device with the given id.
    pub async fn device_del(&mut self, id: &str) -> Result<()> {
        let _: Value = self
            .execute("device_del", Some(serde_json::json!({ "id": id })))
            .await?;
        Ok(())
    }
}

/// Open a short-lived connection, query the run state and disconnect.
pub async fn query_state(path: &Path, timeout: Duration) -> Result<VmState> {
    let mut monitor = Monitor::connect(path, timeout).await?;
    monitor.status().await
}
