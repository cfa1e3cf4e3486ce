//! Client for the in-guest agent.
//!
//! The agent listens on a vsock port inside the guest and speaks
//! newline-delimited JSON-RPC 2.0. Each session starts with a `hello`
//! exchange in which the host presents its client certificate and checks
//! the certificate the agent answers with against the one generated for
//! this instance.

use crate::certs::CertificatePair;
use crate::error::{CoreError, Result};
use crate::instance::InstanceRef;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_vsock::{VsockAddr, VsockStream};

/// Total timeout for connecting to the agent (includes retry time).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between connection retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for individual RPC calls.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// File metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// `file`, `directory` or `symlink`
    #[serde(rename = "type")]
    pub file_type: String,
}

/// File content plus metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    #[serde(flatten)]
    pub info: FileInfo,
}

/// Parameters of a file push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePush {
    pub content: String,
    #[serde(flatten)]
    pub info: FileInfo,
    /// `overwrite` or `append`
    pub write_mode: String,
}

/// Command to run in the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    /// stdin and stdout share one terminal
    pub interactive: bool,
    pub width: u16,
    pub height: u16,
}

/// Per-interface traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCounters {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
}

/// Guest side state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestState {
    pub processes: i64,
    pub network: BTreeMap<String, NetworkCounters>,
}

/// Message on the exec control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Host to guest: deliver a signal to the process
    Signal { signal: i32 },
    /// Host to guest: terminal resized
    Resize { width: u16, height: u16 },
    /// Guest to host: the process exited
    Exit {
        #[serde(rename = "return")]
        code: i32,
    },
}

/// Streams of a running guest command.
pub struct ExecSession {
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub control: ControlStream,
}

/// Bidirectional exec control stream.
pub struct ControlStream {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
}

impl ControlStream {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Split into a sender and a receiver so signals can be forwarded while
    /// waiting for exit.
    pub fn split(self) -> (ControlSender, ControlReceiver) {
        (
            ControlSender {
                writer: self.writer,
            },
            ControlReceiver {
                reader: self.reader,
            },
        )
    }
}

/// Sending half of the control stream.
pub struct ControlSender {
    writer: BoxedWriter,
}

impl ControlSender {
    pub async fn send(&mut self, message: &ControlMessage) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Receiving half of the control stream.
pub struct ControlReceiver {
    reader: BufReader<BoxedReader>,
}

impl ControlReceiver {
    /// Wait for the exit message. A closed stream is an error.
    pub async fn wait_exit(&mut self) -> Result<i32> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(CoreError::Connection(
                    "control stream closed before exit".into(),
                ));
            }
            match serde_json::from_str::<ControlMessage>(line.trim()) {
                Ok(ControlMessage::Exit { code }) => return Ok(code),
                Ok(other) => tracing::trace!(message = ?other, "Ignoring control message"),
                Err(e) => tracing::debug!(error = %e, "Malformed control message"),
            }
        }
    }
}

/// Management RPC surface of the agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn file_pull(&self, path: &str) -> Result<FileContent>;
    async fn file_push(&self, path: &str, file: &FilePush) -> Result<()>;
    async fn file_stat(&self, path: &str) -> Result<FileInfo>;
    async fn exec(&self, request: &ExecRequest) -> Result<ExecSession>;
    async fn state(&self) -> Result<GuestState>;
}

/// TLS material pinned for one instance.
#[derive(Debug, Clone)]
pub struct AgentCredentials {
    /// Host side client pair presented in `hello`
    pub client: CertificatePair,
    /// Certificate the agent must answer with
    pub agent_cert: String,
}

/// Opens agent clients.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(
        &self,
        instance: &InstanceRef,
        cid: u32,
        credentials: AgentCredentials,
    ) -> Result<Arc<dyn AgentClient>>;
}

/// One JSON-RPC session over any byte stream.
pub struct RpcConnection<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: BufWriter<tokio::io::WriteHalf<S>>,
    next_id: u64,
}

impl<S: AsyncRead + AsyncWrite> RpcConnection<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            next_id: 1,
        }
    }

    /// Send a JSON-RPC request and wait for response.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
    ) -> Result<R> {
        let id = self.next_id;
        self.next_id += 1;

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let request_str = serde_json::to_string(&request)?;
        tracing::debug!(method = %method, id, "Sending RPC request");
        tracing::trace!(request = %request_str, "RPC request body");

        self.writer.write_all(request_str.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut response_str = String::new();
        match timeout(RPC_TIMEOUT, self.reader.read_line(&mut response_str)).await {
            Ok(Ok(0)) => {
                return Err(CoreError::Connection("agent closed the connection".into()));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(method = %method, id, error = %e, "RPC read error");
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(method = %method, id, timeout_secs = RPC_TIMEOUT.as_secs(), "RPC response timeout");
                return Err(CoreError::AgentTimeout(RPC_TIMEOUT));
            }
        }

        tracing::trace!(response = %response_str.trim(), "RPC response body");
        let response: serde_json::Value = serde_json::from_str(&response_str)?;

        if let Some(error) = response.get("error") {
            let code = error.get("code").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            tracing::debug!(method = %method, id, code, message = %message, "RPC error response");
            return Err(CoreError::Rpc { code, message });
        }

        let result = response
            .get("result")
            .cloned()
            .ok_or_else(|| CoreError::Rpc {
                code: -1,
                message: "missing result in response".into(),
            })?;

        serde_json::from_value(result).map_err(CoreError::from)
    }

    /// Exchange certificates and verify the agent's against the pinned one.
    pub async fn hello(&mut self, credentials: &AgentCredentials) -> Result<()> {
        #[derive(Deserialize)]
        struct Hello {
            certificate: String,
        }

        let reply: Hello = self
            .call(
                "hello",
                serde_json::json!({ "certificate": credentials.client.cert }),
            )
            .await?;

        if reply.certificate.trim() != credentials.agent_cert.trim() {
            return Err(CoreError::Certificate(
                "agent presented an unexpected certificate".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ExecPorts {
    ports: BTreeMap<String, u32>,
}

/// Agent client over vsock.
pub struct VsockAgent {
    cid: u32,
    port: u32,
    credentials: AgentCredentials,
    conn: Mutex<RpcConnection<VsockStream>>,
}

impl VsockAgent {
    /// Connect to the agent, retrying while the guest boots.
    pub async fn connect(cid: u32, port: u32, credentials: AgentCredentials) -> Result<Self> {
        let start = std::time::Instant::now();
        tracing::debug!(cid, port, "Connecting to agent");

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match Self::try_connect(cid, port, &credentials).await {
                Ok(conn) => {
                    tracing::info!(
                        cid,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "Connected to agent"
                    );
                    return Ok(Self {
                        cid,
                        port,
                        credentials,
                        conn: Mutex::new(conn),
                    });
                }
                // A pinning failure will not fix itself.
                Err(e @ CoreError::Certificate(_)) => return Err(e),
                Err(e) => {
                    if start.elapsed() >= CONNECT_TIMEOUT {
                        tracing::warn!(
                            cid,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            attempts,
                            "Agent connection timeout"
                        );
                        return Err(CoreError::AgentTimeout(CONNECT_TIMEOUT));
                    }
                    tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying...");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn try_connect(
        cid: u32,
        port: u32,
        credentials: &AgentCredentials,
    ) -> Result<RpcConnection<VsockStream>> {
        let stream = VsockStream::connect(VsockAddr::new(cid, port))
            .await
            .map_err(|e| CoreError::Connection(format!("vsock connect failed: {e}")))?;
        let mut conn = RpcConnection::new(stream);
        conn.hello(credentials).await?;
        Ok(conn)
    }

    async fn open_port(&self, port: u32) -> Result<VsockStream> {
        VsockStream::connect(VsockAddr::new(self.cid, port))
            .await
            .map_err(|e| CoreError::Connection(format!("vsock port {port}: {e}")))
    }

    async fn call<P: Serialize + Send, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        self.conn.lock().await.call(method, params).await
    }
}

#[async_trait]
impl AgentClient for VsockAgent {
    async fn file_pull(&self, path: &str) -> Result<FileContent> {
        tracing::debug!(path = %path, "Pulling file from guest");
        self.call("file_pull", serde_json::json!({ "path": path })).await
    }

    async fn file_push(&self, path: &str, file: &FilePush) -> Result<()> {
        tracing::debug!(path = %path, content_len = file.content.len(), "Pushing file to guest");
        let mut params = serde_json::to_value(file)?;
        params["path"] = serde_json::Value::from(path);
        let _: serde_json::Value = self.call("file_push", params).await?;
        Ok(())
    }

    async fn file_stat(&self, path: &str) -> Result<FileInfo> {
        self.call("file_stat", serde_json::json!({ "path": path })).await
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecSession> {
        tracing::debug!(command = ?request.command, interactive = request.interactive, "Executing command via agent");
        let ports: ExecPorts = self.call("exec", request).await?;
        let port = |name: &str| {
            ports.ports.get(name).copied().ok_or_else(|| CoreError::Rpc {
                code: -1,
                message: format!("exec reply is missing port {name:?}"),
            })
        };

        let (control_rx, control_tx) = tokio::io::split(self.open_port(port("control")?).await?);
        let control = ControlStream::new(Box::new(control_rx), Box::new(control_tx));

        if request.interactive {
            let (out, inp) = tokio::io::split(self.open_port(port("0")?).await?);
            return Ok(ExecSession {
                stdin: Some(Box::new(inp)),
                stdout: Some(Box::new(out)),
                stderr: None,
                control,
            });
        }

        let stdin = self.open_port(port("0")?).await?;
        let stdout = self.open_port(port("1")?).await?;
        let stderr = self.open_port(port("2")?).await?;
        Ok(ExecSession {
            stdin: Some(Box::new(stdin)),
            stdout: Some(Box::new(stdout)),
            stderr: Some(Box::new(stderr)),
            control,
        })
    }

    async fn state(&self) -> Result<GuestState> {
        self.call("state", serde_json::json!({})).await
    }
}

impl std::fmt::Debug for VsockAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsockAgent")
            .field("cid", &self.cid)
            .field("port", &self.port)
            .field("pinned", &!self.credentials.agent_cert.is_empty())
            .finish()
    }
}

/// Connector producing [`VsockAgent`] clients.
#[derive(Debug, Clone)]
pub struct VsockConnector {
    pub port: u32,
}

#[async_trait]
impl AgentConnector for VsockConnector {
    async fn connect(
        &self,
        instance: &InstanceRef,
        cid: u32,
        credentials: AgentCredentials,
    ) -> Result<Arc<dyn AgentClient>> {
        tracing::debug!(instance = %instance, cid, port = self.port, "Opening agent session");
        let agent = VsockAgent::connect(cid, self.port, credentials).await?;
        Ok(Arc::new(agent))
    }
}
