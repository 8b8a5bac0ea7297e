//! Helper process launching
//!
//! Every external program (charon, swanctl, xl2tpd, wg) is started through a
//! [`ProcessLauncher`]. Long-lived daemons are started with
//! [`ProcessLauncher::start`] and report their exit through a watch channel;
//! one-shot commands go through [`ProcessLauncher::run`].

use crate::config::SandboxSettings;
use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::validation;
use async_trait::async_trait;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Capability bits, numbered as in `linux/capability.h`
pub const CAP_NET_BIND_SERVICE: u64 = 1 << 10;
pub const CAP_NET_ADMIN: u64 = 1 << 12;
pub const CAP_NET_RAW: u64 = 1 << 13;

/// Description of a program to launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Capabilities the program keeps inside the sandbox
    pub capabilities: u64,
    /// Bytes written to the program's stdin, which is then closed
    pub stdin: Option<Vec<u8>>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn capabilities(mut self, mask: u64) -> Self {
        self.capabilities = mask;
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program name followed by its arguments, for logs and errors
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Result of a one-shot command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into a `ProcessExitedNonZero` failure
    pub fn check(self, what: &str) -> VpnctlResult<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(VpnctlError::failure(
            ConnectFailure::ProcessExitedNonZero,
            format!(
                "{} exited with {}: {}",
                what,
                self.code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                validation::sanitize_error_message(&self.stderr)
            ),
        ))
    }
}

/// Handle to a started daemon
#[derive(Debug, Clone)]
pub struct RunningProcess {
    pub pid: u32,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl RunningProcess {
    /// Build a handle around an exit channel; the sender publishes `Some` once
    pub fn new(pid: u32, exit: watch::Receiver<Option<ProcessExit>>) -> Self {
        Self { pid, exit }
    }

    /// Exit status if the process has already ended
    pub fn has_exited(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Wait for the process to end
    pub async fn wait(&mut self) -> ProcessExit {
        loop {
            if let Some(exit) = *self.exit.borrow_and_update() {
                return exit;
            }
            if self.exit.changed().await.is_err() {
                // Reaper went away without reporting
                return (*self.exit.borrow()).unwrap_or(ProcessExit { code: None });
            }
        }
    }
}

/// Starts helper programs inside the VPN sandbox
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start a daemon; fails with `ProcessStartFailure`
    fn start(&self, spec: ProcessSpec) -> VpnctlResult<RunningProcess>;

    /// Run a command to completion, capturing stdout and stderr
    async fn run(&self, spec: ProcessSpec) -> VpnctlResult<ProcessOutput>;

    /// Whether the PID file names a process that is still alive
    fn is_pid_file_alive(&self, pid_file: &Path) -> bool;

    /// Ask a process to terminate
    fn stop(&self, pid: u32);
}

/// Launcher backed by `tokio::process`
pub struct CommandLauncher {
    sandbox: SandboxSettings,
}

impl CommandLauncher {
    pub fn new(sandbox: SandboxSettings) -> Self {
        Self { sandbox }
    }

    fn command(&self, spec: &ProcessSpec) -> VpnctlResult<Command> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        if self.sandbox.switch_identity && unsafe { libc::getuid() } == 0 {
            let uid = lookup_uid(&self.sandbox.user)?;
            let gid = lookup_gid(&self.sandbox.group)?;
            cmd.uid(uid).gid(gid);
        }

        debug!(
            "Launching {} (capabilities {:#x})",
            spec.command_line(),
            spec.capabilities
        );
        Ok(cmd)
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    fn start(&self, spec: ProcessSpec) -> VpnctlResult<RunningProcess> {
        let mut cmd = self.command(&spec)?;
        cmd.stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd.spawn().map_err(|e| {
            VpnctlError::failure(
                ConnectFailure::ProcessStartFailure,
                format!("Failed to start {}: {}", spec.program.display(), e),
            )
        })?;

        let pid = child.id().ok_or_else(|| {
            VpnctlError::failure(
                ConnectFailure::ProcessStartFailure,
                format!("{} exited before reporting a pid", spec.program.display()),
            )
        })?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let program = spec.program.display().to_string();
        let input = spec.stdin;

        tokio::spawn(async move {
            if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
                if let Err(e) = stdin.write_all(&input).await {
                    warn!("Failed to feed stdin of {}: {}", program, e);
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for {}: {}", program, e);
                    None
                }
            };
            debug!("{} (pid {}) exited with {:?}", program, pid, code);
            let _ = exit_tx.send(Some(ProcessExit { code }));
        });

        Ok(RunningProcess::new(pid, exit_rx))
    }

    async fn run(&self, spec: ProcessSpec) -> VpnctlResult<ProcessOutput> {
        let mut cmd = self.command(&spec)?;
        // A cancelled step must not leave its command behind
        cmd.kill_on_drop(true)
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            VpnctlError::failure(
                ConnectFailure::ProcessStartFailure,
                format!("Failed to start {}: {}", spec.command_line(), e),
            )
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
            stdin.write_all(input).await?;
        }

        let output = child.wait_with_output().await?;
        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn is_pid_file_alive(&self, pid_file: &Path) -> bool {
        let Some(pid) = read_pid_file(pid_file) else {
            return false;
        };
        // Signal 0 only checks for existence
        unsafe { libc::kill(pid, 0) == 0 }
    }

    fn stop(&self, pid: u32) {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            warn!(
                "Failed to terminate process {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        } else {
            debug!("Sent SIGTERM to {}", pid);
        }
    }
}

/// Parse the first line of a PID file
pub fn read_pid_file(path: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(path).ok()?;
    content
        .lines()
        .next()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
}

fn lookup_uid(user: &str) -> VpnctlResult<u32> {
    let name = CString::new(user)
        .map_err(|_| VpnctlError::InvalidParameter(format!("Invalid user name: {}", user)))?;
    let entry = unsafe { libc::getpwnam(name.as_ptr()) };
    if entry.is_null() {
        return Err(VpnctlError::NotFound(format!("User '{}'", user)));
    }
    Ok(unsafe { (*entry).pw_uid })
}

fn lookup_gid(group: &str) -> VpnctlResult<u32> {
    let name = CString::new(group)
        .map_err(|_| VpnctlError::InvalidParameter(format!("Invalid group name: {}", group)))?;
    let entry = unsafe { libc::getgrnam(name.as_ptr()) };
    if entry.is_null() {
        return Err(VpnctlError::NotFound(format!("Group '{}'", group)));
    }
    Ok(unsafe { (*entry).gr_gid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_spec_builder() {
        let spec = ProcessSpec::new("/usr/sbin/swanctl")
            .args(["--load-all", "--file"])
            .arg("/tmp/swanctl.conf")
            .env("STRONGSWAN_CONF", "/tmp/strongswan.conf")
            .capabilities(CAP_NET_ADMIN | CAP_NET_RAW);

        assert_eq!(spec.command_line(), "/usr/sbin/swanctl --load-all --file /tmp/swanctl.conf");
        assert_eq!(spec.capabilities, 0x3000);
        assert_eq!(spec.env.len(), 1);
    }

    #[test]
    fn test_output_check() {
        let ok = ProcessOutput { code: Some(0), ..Default::default() };
        assert!(ok.check("swanctl").is_ok());

        let failed = ProcessOutput {
            code: Some(3),
            stderr: "no such connection".to_string(),
            ..Default::default()
        };
        let err = failed.check("swanctl --initiate").unwrap_err();
        assert_eq!(err.connect_failure(), ConnectFailure::ProcessExitedNonZero);
        assert!(err.detail().contains("no such connection"));
    }

    #[test]
    fn test_read_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("charon.pid");

        assert_eq!(read_pid_file(&path), None);
        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));
        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[tokio::test]
    async fn test_running_process_wait() {
        let (tx, rx) = watch::channel(None);
        let mut process = RunningProcess::new(7, rx);
        assert_eq!(process.has_exited(), None);

        tx.send(Some(ProcessExit { code: Some(1) })).unwrap();
        assert_eq!(process.wait().await, ProcessExit { code: Some(1) });

        let (tx, rx) = watch::channel(None);
        let mut process = RunningProcess::new(8, rx);
        drop(tx);
        assert_eq!(process.wait().await, ProcessExit { code: None });
    }

    #[tokio::test]
    async fn test_command_launcher_run() {
        let launcher = CommandLauncher::new(SandboxSettings::default());
        let output = launcher
            .run(ProcessSpec::new("/bin/cat").stdin("private-key\n"))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "private-key\n");

        let err = launcher
            .run(ProcessSpec::new("/nonexistent/wg"))
            .await
            .unwrap_err();
        assert_eq!(err.connect_failure(), ConnectFailure::ProcessStartFailure);
    }

    /// Alive and not yet a zombie
    fn process_running(pid: i32) -> bool {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat.rsplit(')').next().unwrap_or_default().trim_start().starts_with('Z'),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleep.pid");
        let launcher = CommandLauncher::new(SandboxSettings::default());
        let spec = ProcessSpec::new("/bin/sh")
            .arg("-c")
            .arg(format!("echo $$ > {}; exec sleep 30", pid_file.display()));

        let result = tokio::time::timeout(Duration::from_millis(300), launcher.run(spec)).await;
        assert!(result.is_err());
        let pid = read_pid_file(&pid_file).expect("command wrote its pid");

        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            while process_running(pid) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "pid {} survived cancellation", pid);
    }
}
