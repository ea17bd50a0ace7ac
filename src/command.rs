//! External command execution and daemon supervision
//!
//! Every interaction with the host (ip, iw, iptables, sysctl, hostapd,
//! dnsmasq) goes through [`CommandRunner`]. The system implementation uses
//! `tokio::process`; `crate::simulate::SimulatedHost` implements the same
//! trait in memory.

use crate::error::{ApctlError, ApctlResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Upper bound for a single non-daemon command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Bytes of daemon stderr kept for error reports
const STDERR_TAIL_LEN: usize = 4096;

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A supervised long-running child process
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    /// OS process id, if known
    fn pid(&self) -> Option<u32>;

    /// Whether the process has not exited yet
    fn is_running(&mut self) -> bool;

    /// SIGTERM, wait up to `grace`, then SIGKILL
    async fn terminate(&mut self, grace: Duration) -> ApctlResult<()>;

    /// Last captured stderr output
    fn stderr_tail(&self) -> String;
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output; a non-zero exit is not an error here
    async fn run(&self, program: &str, args: &[&str]) -> ApctlResult<CommandOutput>;

    /// Launch a long-running daemon in the foreground as our child
    async fn spawn(&self, program: &str, args: &[&str]) -> ApctlResult<Box<dyn ManagedProcess>>;

    /// Run and turn a non-zero exit into `CommandFailed`, returning stdout
    async fn output(&self, program: &str, args: &[&str]) -> ApctlResult<String> {
        let out = self.run(program, args).await?;
        if !out.success() {
            return Err(ApctlError::CommandFailed {
                cmd: format_command(program, args),
                code: out.code,
                stderr: out.stderr,
            });
        }
        Ok(out.stdout)
    }
}

pub fn format_command(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Host implementation backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> ApctlResult<CommandOutput> {
        debug!("exec: {}", format_command(program, args));

        let fut = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(COMMAND_TIMEOUT, fut)
            .await
            .map_err(|_| ApctlError::CommandFailed {
                cmd: format_command(program, args),
                code: None,
                stderr: format!("timed out after {}s", COMMAND_TIMEOUT.as_secs()),
            })?
            .map_err(|e| ApctlError::CommandFailed {
                cmd: format_command(program, args),
                code: None,
                stderr: e.to_string(),
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code(),
        })
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> ApctlResult<Box<dyn ManagedProcess>> {
        debug!("spawn: {}", format_command(program, args));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ApctlError::DaemonStartFailed {
                daemon: program.to_string(),
                detail: e.to_string(),
            })?;

        let tail = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_tail(&tail, &line);
                }
            });
        }

        Ok(Box::new(ChildProcess { child, tail }))
    }
}

fn push_tail(tail: &Mutex<String>, line: &str) {
    let mut buf = tail.lock().unwrap_or_else(|e| e.into_inner());
    buf.push_str(line);
    buf.push('\n');
    if buf.len() > STDERR_TAIL_LEN {
        let mut cut = buf.len() - STDERR_TAIL_LEN;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

/// A daemon launched by [`SystemRunner`]
struct ChildProcess {
    child: Child,
    tail: Arc<Mutex<String>>,
}

#[async_trait]
impl ManagedProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) -> ApctlResult<()> {
        if !self.is_running() {
            return Ok(());
        }

        if let Some(pid) = self.child.id() {
            // SAFETY: plain kill(2) on a pid we own and have not reaped yet
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                warn!("SIGTERM to pid {} failed: {}", pid, std::io::Error::last_os_error());
            }
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ApctlError::Io(e)),
            Err(_) => {
                warn!("pid {:?} ignored SIGTERM for {:?}, sending SIGKILL", self.child.id(), grace);
                self.child.kill().await?;
                Ok(())
            }
        }
    }

    fn stderr_tail(&self) -> String {
        self.tail.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Timing knobs for daemon launch and stop
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    /// Polls before a daemon counts as failed
    pub attempts: u32,
    pub interval: Duration,
    /// Wait after SIGTERM before SIGKILL
    pub stop_grace: Duration,
}

/// Scoped ownership of one supervised daemon
///
/// Consumed by [`DaemonHandle::shutdown`]. Processes from [`SystemRunner`]
/// are spawned with `kill_on_drop`, so a handle dropped on an unexpected
/// path still takes its daemon down.
pub struct DaemonHandle {
    name: &'static str,
    interface: String,
    process: Box<dyn ManagedProcess>,
}

impl DaemonHandle {
    pub fn new(name: &'static str, interface: &str, process: Box<dyn ManagedProcess>) -> Self {
        Self {
            name,
            interface: interface.to_string(),
            process,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    pub fn stderr_tail(&self) -> String {
        self.process.stderr_tail()
    }

    /// Terminate and confirm the daemon is gone
    pub async fn shutdown(mut self, grace: Duration) -> ApctlResult<()> {
        debug!("stopping {} on {} (pid {:?})", self.name, self.interface, self.pid());
        self.process.terminate(grace).await?;
        if self.process.is_running() {
            return Err(ApctlError::CommandFailed {
                cmd: format!("kill {}", self.name),
                code: None,
                stderr: format!("{} on {} still running after SIGKILL", self.name, self.interface),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("name", &self.name)
            .field("interface", &self.interface)
            .field("pid", &self.process.pid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_command() {
        assert_eq!(format_command("ip", &["link", "show"]), "ip link show");
        assert_eq!(format_command("true", &[]), "true");
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let tail = Mutex::new(String::new());
        let line = "x".repeat(1000);
        for _ in 0..10 {
            push_tail(&tail, &line);
        }
        assert!(tail.lock().unwrap().len() <= STDERR_TAIL_LEN);
    }

    #[tokio::test]
    async fn test_system_runner_captures_exit_code() {
        let runner = SystemRunner::new();
        let out = runner.run("sh", &["-c", "echo out; echo err >&2; exit 3"]).await.unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");

        let err = runner.output("sh", &["-c", "exit 1"]).await.unwrap_err();
        assert_eq!(err.condition(), "CommandFailed");
    }

    #[tokio::test]
    async fn test_daemon_handle_terminates_child() {
        let runner = SystemRunner::new();
        let process = runner.spawn("sleep", &["30"]).await.unwrap();
        let mut handle = DaemonHandle::new("sleep", "lo", process);
        assert!(handle.is_running());
        handle.shutdown(Duration::from_secs(2)).await.unwrap();
    }
}
