//! Fakes shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use libvpnctl::device::{DeviceFactory, LinkInfo};
use libvpnctl::error::{ConnectFailure, VpnctlResult};
use libvpnctl::metrics::{CipherSuite, VpnMetrics, WireGuardReport};
use libvpnctl::network_config::{NetworkConfigSink, NetworkResult};
use libvpnctl::process::{ProcessExit, ProcessLauncher, ProcessOutput, ProcessSpec, RunningProcess};
use libvpnctl::vpn::driver::{DriverContext, VpnType};
use libvpnctl::VpnctlConfig;
use mockall::mock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;

/// Launcher that records every spec and answers from a script
///
/// One-shot commands are matched by the first scripted argument they contain;
/// anything unscripted succeeds with empty output. Daemons run until stopped.
/// PID files name a dead process unless [`FakeLauncher::pid_alive_for`] says
/// otherwise.
#[derive(Default)]
pub struct FakeLauncher {
    pub specs: Mutex<Vec<ProcessSpec>>,
    outputs: Mutex<HashMap<String, ProcessOutput>>,
    daemons: Mutex<HashMap<u32, watch::Sender<Option<ProcessExit>>>>,
    pub stopped: Mutex<Vec<u32>>,
    next_pid: AtomicU32,
    pid_alive: AtomicU32,
    /// When each PID file liveness check happened
    pub pid_checks: Mutex<Vec<Instant>>,
    /// Program and time of every daemon start
    pub started: Mutex<Vec<(PathBuf, Instant)>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(100),
            ..Default::default()
        })
    }

    /// Answer commands carrying `arg` with `stdout`
    pub fn script(&self, arg: &str, stdout: &str) {
        self.outputs.lock().unwrap().insert(
            arg.to_string(),
            ProcessOutput {
                code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn script_failure(&self, arg: &str, code: i32, stderr: &str) {
        self.outputs.lock().unwrap().insert(
            arg.to_string(),
            ProcessOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// Report the PID file as alive for the next `checks` checks
    pub fn pid_alive_for(&self, checks: u32) {
        self.pid_alive.store(checks, Ordering::SeqCst);
    }

    /// Time at which `program` was started
    pub fn started_at(&self, program: &str) -> Option<Instant> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .find(|(path, _)| path.ends_with(program))
            .map(|(_, at)| *at)
    }

    /// Command lines of everything launched so far
    pub fn command_lines(&self) -> Vec<String> {
        self.specs.lock().unwrap().iter().map(|s| s.command_line()).collect()
    }

    pub fn find(&self, program: &str) -> Option<ProcessSpec> {
        self.specs
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.program.ends_with(program))
            .cloned()
    }

    /// Make a running daemon exit
    pub fn exit(&self, pid: u32, code: Option<i32>) {
        if let Some(tx) = self.daemons.lock().unwrap().get(&pid) {
            let _ = tx.send(Some(ProcessExit { code }));
        }
    }

    pub fn running(&self) -> Vec<u32> {
        self.daemons
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, tx)| tx.borrow().is_none())
            .map(|(pid, _)| *pid)
            .collect()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    fn start(&self, spec: ProcessSpec) -> VpnctlResult<RunningProcess> {
        self.started.lock().unwrap().push((spec.program.clone(), Instant::now()));
        self.specs.lock().unwrap().push(spec);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(None);
        self.daemons.lock().unwrap().insert(pid, tx);
        Ok(RunningProcess::new(pid, rx))
    }

    async fn run(&self, spec: ProcessSpec) -> VpnctlResult<ProcessOutput> {
        let output = {
            let outputs = self.outputs.lock().unwrap();
            spec.args
                .iter()
                .find_map(|arg| outputs.get(arg).cloned())
                .unwrap_or(ProcessOutput {
                    code: Some(0),
                    ..Default::default()
                })
        };
        self.specs.lock().unwrap().push(spec);
        Ok(output)
    }

    fn is_pid_file_alive(&self, _pid_file: &Path) -> bool {
        self.pid_checks.lock().unwrap().push(Instant::now());
        self.pid_alive
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn stop(&self, pid: u32) {
        self.stopped.lock().unwrap().push(pid);
        self.exit(pid, None);
    }
}

/// Device factory handing out sequential link indexes
#[derive(Default)]
pub struct FakeDevices {
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub existing: Mutex<HashMap<String, u32>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn create(&self, name: &str) -> LinkInfo {
        let mut created = self.created.lock().unwrap();
        created.push(name.to_string());
        LinkInfo {
            name: name.to_string(),
            index: 10 + created.len() as u32,
        }
    }
}

#[async_trait]
impl DeviceFactory for FakeDevices {
    async fn create_xfrm_interface(&self, name: &str, _if_id: u32) -> VpnctlResult<LinkInfo> {
        Ok(self.create(name))
    }

    async fn create_wireguard_interface(&self, name: &str) -> VpnctlResult<LinkInfo> {
        Ok(self.create(name))
    }

    async fn create_tun_interface(&self, name: &str) -> VpnctlResult<LinkInfo> {
        Ok(self.create(name))
    }

    async fn link_index(&self, name: &str) -> Option<u32> {
        self.existing.lock().unwrap().get(name).copied()
    }

    async fn delete_interface(&self, name: &str) -> VpnctlResult<()> {
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub connecting: Mutex<Vec<VpnType>>,
    pub connected: Mutex<Vec<VpnType>>,
    pub failures: Mutex<Vec<(VpnType, ConnectFailure)>>,
    pub ciphers: Mutex<Vec<(CipherSuite, CipherSuite)>>,
    pub wireguard: Mutex<Vec<WireGuardReport>>,
}

impl VpnMetrics for RecordingMetrics {
    fn driver_connecting(&self, vpn_type: VpnType) {
        self.connecting.lock().unwrap().push(vpn_type);
    }

    fn driver_connected(&self, vpn_type: VpnType) {
        self.connected.lock().unwrap().push(vpn_type);
    }

    fn connect_failed(&self, vpn_type: VpnType, reason: ConnectFailure) {
        self.failures.lock().unwrap().push((vpn_type, reason));
    }

    fn ipsec_ciphers(&self, ike: &CipherSuite, esp: &CipherSuite) {
        self.ciphers.lock().unwrap().push((ike.clone(), esp.clone()));
    }

    fn wireguard_report(&self, report: &WireGuardReport) {
        self.wireguard.lock().unwrap().push(report.clone());
    }
}

/// Sink remembering what was applied per link
#[derive(Default)]
pub struct RecordingSink {
    pub applied: Mutex<Vec<(String, NetworkResult)>>,
    pub withdrawn: Mutex<Vec<String>>,
}

#[async_trait]
impl NetworkConfigSink for RecordingSink {
    async fn apply(&self, link: &str, result: &NetworkResult) -> VpnctlResult<()> {
        self.applied.lock().unwrap().push((link.to_string(), result.clone()));
        Ok(())
    }

    async fn withdraw(&self, link: &str) -> VpnctlResult<()> {
        self.withdrawn.lock().unwrap().push(link.to_string());
        Ok(())
    }
}

mock! {
    pub Sink {}

    #[async_trait]
    impl NetworkConfigSink for Sink {
        async fn apply(&self, link: &str, result: &NetworkResult) -> VpnctlResult<()>;
        async fn withdraw(&self, link: &str) -> VpnctlResult<()>;
    }
}

/// Everything a driver needs, backed by fakes and a private directory
pub struct TestBed {
    pub dir: tempfile::TempDir,
    pub launcher: Arc<FakeLauncher>,
    pub devices: Arc<FakeDevices>,
    pub metrics: Arc<RecordingMetrics>,
    pub config: VpnctlConfig,
}

impl TestBed {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let mut config = VpnctlConfig::default();
        config.paths.config_dir = root.join("profiles");
        config.paths.state_dir = root.join("state");
        config.paths.run_dir = root.join("run");
        config.ipsec.charon_pid_file = root.join("charon.pid");
        config.ipsec.vici_socket = root.join("charon.vici");
        config.ipsec.proc_net_unix = root.join("proc_net_unix");
        config.ipsec.socket_poll_interval_ms = 10;
        config.timeouts.link_ready_secs = 2;

        Self {
            dir,
            launcher: FakeLauncher::new(),
            devices: FakeDevices::new(),
            metrics: Arc::new(RecordingMetrics::default()),
            config,
        }
    }

    /// Pretend charon created and listens on its vici socket
    pub fn vici_listening(&self) {
        let socket = &self.config.ipsec.vici_socket;
        std::fs::write(socket, "").unwrap();
        let table = format!(
            "Num       RefCount Protocol Flags    Type St Inode Path\n\
             0000000000000000: 00000002 00000000 00010000 0001 01 21877 {}\n",
            socket.display()
        );
        std::fs::write(&self.config.ipsec.proc_net_unix, table).unwrap();
    }

    pub fn run_dir(&self) -> PathBuf {
        self.config.paths.run_dir.clone()
    }

    pub fn context(&self) -> DriverContext {
        DriverContext {
            config: Arc::new(self.config.clone()),
            launcher: self.launcher.clone(),
            devices: self.devices.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// First file called `name` inside any attempt directory under `run_dir`
pub fn find_attempt_file(run_dir: &Path, name: &str) -> Option<PathBuf> {
    std::fs::read_dir(run_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().join(name))
        .find(|path| path.exists())
}
