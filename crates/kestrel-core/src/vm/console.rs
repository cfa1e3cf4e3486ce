//! Console, exec and file access into a running guest.

use super::VirtualMachine;
use crate::agent::{
    BoxedReader, BoxedWriter, ControlMessage, ControlSender, ExecRequest, FileContent, FileInfo,
    FilePush, NetworkCounters,
};
use crate::console::ConsoleLease;
use crate::error::{CoreError, Result};
use crate::instance::InstanceStatus;
use kestrel_vm::{process, Monitor};
use nix::sys::signal::Signal;
use nix::sys::termios::{self, SetArg, Termios};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

/// An open guest console.
///
/// The console stays claimed for this instance until the value is dropped
/// or [`Console::finish`] is called.
#[derive(Debug)]
pub struct Console {
    pub file: tokio::fs::File,
    lease: ConsoleLease,
}

impl Console {
    /// Release the console.
    pub fn finish(self) {
        drop(self.lease);
    }
}

/// A command to run in the guest.
#[derive(Debug, Clone, Default)]
pub struct ExecCommand {
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub width: u16,
    pub height: u16,
}

/// Where an exec's stdio goes.
pub enum ExecStdio {
    /// One terminal for stdin and stdout; switched to raw mode for the
    /// duration of the command.
    Interactive(std::fs::File),
    Pipes {
        stdin: BoxedReader,
        stdout: BoxedWriter,
        stderr: BoxedWriter,
    },
}

/// Host and guest view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceState {
    pub status: InstanceStatus,
    pub pid: Option<i32>,
    /// -1 when the agent is unreachable.
    pub processes: i64,
    pub network: BTreeMap<String, NetworkCounters>,
}

/// Restores the saved terminal attributes when dropped.
struct RawModeGuard {
    file: std::fs::File,
    original: Termios,
}

impl RawModeGuard {
    /// Switch the terminal to raw mode. Non-terminals yield `None`.
    fn enter(file: &std::fs::File) -> Result<Option<Self>> {
        let original = match termios::tcgetattr(file) {
            Ok(t) => t,
            Err(nix::errno::Errno::ENOTTY) => return Ok(None),
            Err(e) => return Err(std::io::Error::from(e).into()),
        };
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(file, SetArg::TCSANOW, &raw).map_err(std::io::Error::from)?;
        Ok(Some(Self {
            file: file.try_clone()?,
            original,
        }))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(&self.file, SetArg::TCSANOW, &self.original) {
            tracing::warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Relay SIGINT, SIGTERM and SIGHUP to the guest process.
fn forward_signals(mut control: ControlSender) -> Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                Some(()) = interrupt.recv() => Signal::SIGINT,
                Some(()) = terminate.recv() => Signal::SIGTERM,
                Some(()) = hangup.recv() => Signal::SIGHUP,
                else => break,
            };
            tracing::debug!(signal = ?sig, "Forwarding signal to guest");
            if let Err(e) = control
                .send(&ControlMessage::Signal { signal: sig as i32 })
                .await
            {
                tracing::warn!(error = %e, "Failed to forward signal");
                break;
            }
        }
    }))
}

fn relay<R, W>(mut from: R, mut to: W) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut from, &mut to).await {
            tracing::debug!(error = %e, "Stream relay ended");
        }
        let _ = to.shutdown().await;
    })
}

impl VirtualMachine {
    /// Attach to the guest console.
    ///
    /// Only one console may be open per instance; a second call fails with
    /// [`CoreError::ResourceBusy`] until the first is released.
    pub async fn console(&self) -> Result<Console> {
        let lease = self.services.consoles.acquire(self.args.id)?;
        if !self.is_running().await {
            return Err(CoreError::ResourceBusy(format!(
                "instance {} is not running",
                self.args.name
            )));
        }

        let mut monitor =
            Monitor::connect(&self.monitor_path(), self.services.config.monitor_timeout).await?;
        let path = monitor.console_path().await?;
        drop(monitor);

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        tracing::debug!(instance = %self.args.name, path = %path.display(), "Console attached");
        Ok(Console { file, lease })
    }

    /// Run a command in the guest and return its exit code.
    pub async fn exec(&self, command: ExecCommand, stdio: ExecStdio) -> Result<i32> {
        let agent = self.agent().await?;
        let interactive = matches!(stdio, ExecStdio::Interactive(_));
        let request = ExecRequest {
            command: command.command,
            environment: command.environment,
            cwd: command.cwd,
            uid: command.uid,
            gid: command.gid,
            interactive,
            width: command.width,
            height: command.height,
        };
        tracing::debug!(instance = %self.args.name, command = ?request.command, interactive, "Executing in guest");

        let session = agent.exec(&request).await?;
        let (sender, mut receiver) = session.control.split();

        let mut outputs = Vec::new();
        let mut inputs = Vec::new();
        let _raw_mode = match stdio {
            ExecStdio::Interactive(terminal) => {
                let guard = RawModeGuard::enter(&terminal)?;
                let reader = tokio::fs::File::from_std(terminal.try_clone()?);
                let writer = tokio::fs::File::from_std(terminal);
                if let Some(stdin) = session.stdin {
                    inputs.push(relay(reader, stdin));
                }
                if let Some(stdout) = session.stdout {
                    outputs.push(relay(stdout, writer));
                }
                guard
            }
            ExecStdio::Pipes {
                stdin,
                stdout,
                stderr,
            } => {
                if let Some(guest_stdin) = session.stdin {
                    inputs.push(relay(stdin, guest_stdin));
                }
                if let Some(guest_stdout) = session.stdout {
                    outputs.push(relay(guest_stdout, stdout));
                }
                if let Some(guest_stderr) = session.stderr {
                    outputs.push(relay(guest_stderr, stderr));
                }
                None
            }
        };

        let signals = forward_signals(sender)?;
        let exit = receiver.wait_exit().await;
        signals.abort();

        for output in outputs {
            let _ = output.await;
        }
        for input in inputs {
            input.abort();
        }

        let code = exit?;
        tracing::debug!(instance = %self.args.name, code, "Guest command exited");
        Ok(code)
    }

    pub async fn file_pull(&self, path: &str) -> Result<FileContent> {
        self.agent().await?.file_pull(path).await
    }

    pub async fn file_push(&self, path: &str, file: &FilePush) -> Result<()> {
        self.agent().await?.file_push(path, file).await
    }

    pub async fn file_stat(&self, path: &str) -> Result<FileInfo> {
        self.agent().await?.file_stat(path).await
    }

    /// Status, hypervisor PID and, when the agent answers, guest counters.
    pub async fn render_state(&self) -> InstanceState {
        let status = self.status().await;
        let mut state = InstanceState {
            status,
            pid: None,
            processes: -1,
            network: BTreeMap::new(),
        };
        if status != InstanceStatus::Running {
            return state;
        }

        state.pid = process::read_pid(&self.pid_path()).await.ok().flatten();
        let guest = match self.agent().await {
            Ok(agent) => agent.state().await,
            Err(e) => Err(e),
        };
        match guest {
            Ok(guest) => {
                state.processes = guest.processes;
                state.network = guest.network;
            }
            Err(e) => {
                tracing::debug!(instance = %self.args.name, error = %e, "Agent state unavailable");
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[tokio::test]
    async fn test_second_console_is_busy() {
        let env = TestEnv::new();
        let vm = env.vm("vm1").await;
        let _server = env.fake_monitor(&vm).await;

        let first = vm.console().await.unwrap();
        let err = vm.console().await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceBusy(_)));

        // First handle still usable until released.
        first.file.metadata().await.unwrap();
        first.finish();
        let again = vm.console().await.unwrap();
        drop(again);
        assert!(!env.services.consoles.is_active(vm.id()));
    }

    #[tokio::test]
    async fn test_console_requires_running() {
        let env = TestEnv::new();
        let vm = env.vm("vm1").await;
        let err = vm.console().await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceBusy(_)));
        assert!(!env.services.consoles.is_active(vm.id()));
    }

    #[tokio::test]
    async fn test_exec_relays_output_and_exit_code() {
        let env = TestEnv::new();
        let vm = env.vm("vm1").await;
        env.agent.script_exec(b"hello\n", b"oops\n", 3);

        let (stdout_writer, mut stdout_reader) = tokio::io::duplex(64);
        let (stderr_writer, mut stderr_reader) = tokio::io::duplex(64);
        let code = vm
            .exec(
                ExecCommand {
                    command: vec!["echo".into(), "hello".into()],
                    ..Default::default()
                },
                ExecStdio::Pipes {
                    stdin: Box::new(tokio::io::empty()),
                    stdout: Box::new(stdout_writer),
                    stderr: Box::new(stderr_writer),
                },
            )
            .await
            .unwrap();
        assert_eq!(code, 3);

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stdout_reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
        let mut err = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stderr_reader, &mut err)
            .await
            .unwrap();
        assert_eq!(err, "oops\n");
        assert_eq!(env.agent.last_exec().unwrap().command, vec!["echo", "hello"]);
    }

    #[tokio::test]
    async fn test_file_operations_delegate_to_agent() {
        let env = TestEnv::new();
        let vm = env.vm("vm1").await;
        vm.file_push(
            "/etc/motd",
            &FilePush {
                content: "hi".into(),
                write_mode: "overwrite".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(vm.file_pull("/etc/motd").await.unwrap().content, "hi");
        assert!(vm.file_stat("/missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_render_state_degrades_without_agent() {
        let env = TestEnv::new();
        let vm = env.vm("vm1").await;
        let _server = env.fake_monitor(&vm).await;
        env.agent.set_unreachable(true);

        let state = vm.render_state().await;
        assert_eq!(state.status, InstanceStatus::Running);
        assert_eq!(state.processes, -1);

        env.agent.set_unreachable(false);
        let state = vm.render_state().await;
        assert_eq!(state.processes, 7);
    }
}
