//! IPsec connection driving charon and swanctl
//!
//! After the SAs are up the connection either hands off to a nested
//! [`L2tpConnection`] (L2TP/IPsec, transport mode) or requests an XFRM
//! interface for the tunnel-mode child (IKEv2).

pub mod status;
pub mod strongswan;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::await_link_ready;
use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::network_config::{default_routes, NetworkResult};
use crate::process::{ProcessExit, ProcessSpec, RunningProcess, CAP_NET_ADMIN, CAP_NET_BIND_SERVICE, CAP_NET_RAW};
use super::common::{create_attempt_dir, write_secure_config};
use super::connection::{AsyncConnection, ConnectStep, ConnectionEvent, ConnectionSteps, StepOutcome};
use super::driver::DriverContext;
use super::l2tp::{L2tpConfig, L2tpConnection};
use status::SaStatus;
use strongswan::SwanctlParams;

pub const ENV_STRONGSWAN_CONF: &str = "STRONGSWAN_CONF";
pub const ENV_OPENSSL_CONF: &str = "OPENSSL_CONF";

/// Extra time granted on top of swanctl's own initiate timeout
const INITIATE_GRACE: Duration = Duration::from_secs(5);

/// Flag of a listening socket in `/proc/net/unix`
const SOCKET_LISTENING: &str = "00010000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IpsecStep {
    Start,
    StrongSwanConfigWritten,
    CharonStarted,
    SwanctlConfigWritten,
    SwanctlConfigLoaded,
    IpsecConnected,
    IpsecStatusRead,
}

impl ConnectStep for IpsecStep {
    const INITIAL: Self = IpsecStep::Start;
}

/// What carries traffic once the SAs are established
#[derive(Debug, Clone)]
pub enum IpsecTunnel {
    L2tp(L2tpConfig),
    Xfrm { if_id: u32, interface_name: String },
}

/// Whether `/proc/net/unix` lists `path` as a listening socket
///
/// ```text
/// Num       RefCount Protocol Flags    Type St Inode Path
/// 0000000000000000: 00000002 00000000 00010000 0001 01 21877 /run/ipsec/charon.vici
/// ```
pub fn socket_is_listening(table: &str, path: &Path) -> bool {
    let Some(path) = path.to_str() else {
        return false;
    };
    table.lines().skip(1).any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        fields.len() >= 8 && fields[3] == SOCKET_LISTENING && fields[7] == path
    })
}

struct IpsecPaths {
    strongswan_conf: PathBuf,
    swanctl_conf: PathBuf,
    resolv_conf: PathBuf,
}

/// Steps of an IPsec connection
pub struct IpsecConnection {
    ctx: DriverContext,
    params: SwanctlParams,
    tunnel: IpsecTunnel,
    /// Removed when the connection drops
    #[allow(dead_code)]
    temp_dir: Option<TempDir>,
    paths: Option<IpsecPaths>,
    charon: Option<RunningProcess>,
    status: SaStatus,
    dns_servers: Vec<IpAddr>,
    l2tp: Option<AsyncConnection>,
    l2tp_events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    xfrm_link: Option<String>,
}

fn unavailable(what: &str) -> VpnctlError {
    VpnctlError::failure(ConnectFailure::InternalFailure, format!("{} not available", what))
}

impl IpsecConnection {
    pub fn new(ctx: DriverContext, params: SwanctlParams, tunnel: IpsecTunnel) -> Self {
        Self {
            ctx,
            params,
            tunnel,
            temp_dir: None,
            paths: None,
            charon: None,
            status: SaStatus::default(),
            dns_servers: Vec::new(),
            l2tp: None,
            l2tp_events: None,
            xfrm_link: None,
        }
    }

    fn paths(&self) -> VpnctlResult<&IpsecPaths> {
        self.paths.as_ref().ok_or_else(|| unavailable("IPsec configuration"))
    }

    async fn write_strongswan_conf(&mut self) -> VpnctlResult<()> {
        let dir = create_attempt_dir(&self.ctx.config.paths.run_dir, "ipsec-")?;
        let paths = IpsecPaths {
            strongswan_conf: dir.path().join("strongswan.conf"),
            swanctl_conf: dir.path().join("swanctl.conf"),
            resolv_conf: dir.path().join("resolv.conf"),
        };

        let conf = strongswan::render_strongswan_conf(&self.ctx.config.ipsec.crypto_module, &paths.resolv_conf);
        write_secure_config(&paths.strongswan_conf, &conf, 0o644).await?;

        self.paths = Some(paths);
        self.temp_dir = Some(dir);
        Ok(())
    }

    /// Give a terminating charon from an earlier attempt time to exit
    async fn wait_for_previous_charon(&self) {
        let settings = &self.ctx.config.ipsec;
        let mut delay = Duration::from_millis(settings.pid_poll_initial_ms);

        for attempt in 0..settings.pid_poll_attempts {
            if !self.ctx.launcher.is_pid_file_alive(&settings.charon_pid_file) {
                return;
            }
            debug!("Previous charon still running, retry {} in {:?}", attempt + 1, delay);
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        if self.ctx.launcher.is_pid_file_alive(&settings.charon_pid_file) {
            warn!("Previous charon did not exit, starting a new one anyway");
        }
    }

    fn swanctl(&self) -> VpnctlResult<ProcessSpec> {
        let paths = self.paths()?;
        Ok(ProcessSpec::new(&self.ctx.config.programs.swanctl)
            .env(ENV_STRONGSWAN_CONF, paths.strongswan_conf.display().to_string()))
    }

    async fn start_charon(&mut self) -> VpnctlResult<()> {
        self.wait_for_previous_charon().await;

        let settings = &self.ctx.config.ipsec;
        let spec = ProcessSpec::new(&self.ctx.config.programs.charon)
            .env(ENV_STRONGSWAN_CONF, self.paths()?.strongswan_conf.display().to_string())
            .env(ENV_OPENSSL_CONF, settings.openssl_conf.display().to_string())
            .capabilities(CAP_NET_ADMIN | CAP_NET_BIND_SERVICE | CAP_NET_RAW);

        let process = self.ctx.launcher.start(spec).map_err(|e| {
            VpnctlError::failure(ConnectFailure::ProcessStartFailure, e.detail())
        })?;
        info!("Started charon (pid {})", process.pid);
        self.charon = Some(process);

        let charon = self.charon.as_mut().ok_or_else(|| unavailable("charon"))?;
        tokio::select! {
            exit = charon.wait() => Err(VpnctlError::failure(
                ConnectFailure::SocketNotReady,
                format!("charon exited with {:?} before its control socket was ready", exit.code),
            )),
            ready = wait_for_vici(&self.ctx.config.ipsec) => ready,
        }
    }

    async fn write_swanctl_conf(&self) -> VpnctlResult<()> {
        let conf = strongswan::render_swanctl_conf(&self.params)?;
        write_secure_config(&self.paths()?.swanctl_conf, &conf, 0o600).await
    }

    async fn load_swanctl_conf(&self) -> VpnctlResult<()> {
        let spec = self
            .swanctl()?
            .arg("--load-all")
            .arg("--file")
            .arg(self.paths()?.swanctl_conf.display().to_string());
        self.ctx.launcher.run(spec).await?.check("swanctl --load-all")?;
        Ok(())
    }

    async fn initiate(&self) -> VpnctlResult<()> {
        let secs = self.ctx.config.ipsec.initiate_timeout_secs;
        let spec = self
            .swanctl()?
            .arg("--initiate")
            .arg("-c")
            .arg(strongswan::CHILD_NAME)
            .arg("--timeout")
            .arg(secs.to_string());

        let bound = Duration::from_secs(secs) + INITIATE_GRACE;
        let output = tokio::time::timeout(bound, self.ctx.launcher.run(spec))
            .await
            .map_err(|_| {
                VpnctlError::failure(
                    ConnectFailure::ConnectTimeout,
                    format!("swanctl --initiate did not finish within {:?}", bound),
                )
            })??;
        output.check("swanctl --initiate")?;
        Ok(())
    }

    async fn read_status(&mut self) -> VpnctlResult<()> {
        let output = self
            .ctx
            .launcher
            .run(self.swanctl()?.arg("--list-sas"))
            .await?
            .check("swanctl --list-sas")?;
        self.status = status::parse_list_sas(&output.stdout);

        let resolv_conf = &self.paths()?.resolv_conf;
        self.dns_servers = match tokio::fs::read_to_string(resolv_conf).await {
            Ok(content) => status::parse_resolv_conf(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("Failed to read {:?}: {}", resolv_conf, e);
                Vec::new()
            }
        };

        self.ctx.metrics.ipsec_ciphers(&self.status.ike, &self.status.esp);
        debug!(
            "IPsec SA: ike {} esp {}, {} DNS servers",
            self.status.ike,
            self.status.esp,
            self.dns_servers.len()
        );
        Ok(())
    }

    /// Run L2TP inside the transport SA and report what it reports
    async fn start_l2tp(&mut self, config: L2tpConfig) -> VpnctlResult<StepOutcome<IpsecStep>> {
        let steps = L2tpConnection::new(self.ctx.clone(), config, self.params.remote.clone());
        let (connection, events) = AsyncConnection::connect(steps);
        self.l2tp = Some(connection);
        self.l2tp_events = Some(events);

        tokio::select! {
            exit = wait_charon(&mut self.charon) => Err(charon_exited(exit.code)),
            event = next_event(&mut self.l2tp_events) => match event {
                Some(ConnectionEvent::Connected { link, network }) => Ok(StepOutcome::Connected { link, network }),
                Some(ConnectionEvent::Failure { reason, detail }) => Err(VpnctlError::failure(reason, detail)),
                Some(ConnectionEvent::Stopped) | None => {
                    Err(VpnctlError::failure(ConnectFailure::Disconnect, "L2TP connection stopped"))
                }
            },
        }
    }

    async fn start_xfrm(&mut self, if_id: u32, interface_name: String) -> VpnctlResult<StepOutcome<IpsecStep>> {
        let network = xfrm_network(&self.status, &self.dns_servers, &self.params.remote)?;

        let devices = self.ctx.devices.clone();
        self.xfrm_link = Some(interface_name.clone());
        let link = await_link_ready(
            devices.create_xfrm_interface(&interface_name, if_id),
            self.ctx.config.timeouts.link_ready(),
        )
        .await?;

        Ok(StepOutcome::Connected { link, network })
    }
}

/// Network configuration of an IKEv2 tunnel-mode SA
fn xfrm_network(status: &SaStatus, dns_servers: &[IpAddr], remote: &str) -> VpnctlResult<NetworkResult> {
    if status.virtual_ipv4.is_none() && status.virtual_ipv6.is_none() {
        return Err(VpnctlError::failure(
            ConnectFailure::ParseFailure,
            "No usable virtual IP in the established SA",
        ));
    }

    let mut network = NetworkResult {
        ipv4_address: status.virtual_ipv4,
        ipv6_address: status.virtual_ipv6,
        dns_servers: dns_servers.to_vec(),
        ..Default::default()
    };
    network.included_routes = if status.remote_ts.is_empty() {
        default_routes(status.virtual_ipv4.is_some(), status.virtual_ipv6.is_some())
    } else {
        status.remote_ts.clone()
    };

    // The gateway itself stays on the physical network
    match remote.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => network.excluded_routes.extend(Ipv4Net::new(addr, 32).ok().map(IpNet::from)),
        Ok(IpAddr::V6(addr)) => network.excluded_routes.extend(Ipv6Net::new(addr, 128).ok().map(IpNet::from)),
        Err(_) => debug!("Remote {} is a hostname, no exclusion route", remote),
    }
    Ok(network)
}

async fn wait_for_vici(settings: &crate::config::IpsecSettings) -> VpnctlResult<()> {
    let interval = Duration::from_millis(settings.socket_poll_interval_ms);

    for _ in 0..settings.socket_poll_attempts {
        if tokio::fs::try_exists(&settings.vici_socket).await.unwrap_or(false) {
            match tokio::fs::read_to_string(&settings.proc_net_unix).await {
                Ok(table) if socket_is_listening(&table, &settings.vici_socket) => {
                    debug!("vici socket {:?} is listening", settings.vici_socket);
                    return Ok(());
                }
                Ok(_) => debug!("vici socket {:?} not listening yet", settings.vici_socket),
                Err(e) => warn!("Failed to read {:?}: {}", settings.proc_net_unix, e),
            }
        }
        tokio::time::sleep(interval).await;
    }

    Err(VpnctlError::failure(
        ConnectFailure::SocketNotReady,
        format!("vici socket {:?} not listening", settings.vici_socket),
    ))
}

async fn wait_charon(charon: &mut Option<RunningProcess>) -> ProcessExit {
    match charon {
        Some(process) => process.wait().await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<ConnectionEvent>>) -> Option<ConnectionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn charon_exited(code: Option<i32>) -> VpnctlError {
    VpnctlError::failure(
        ConnectFailure::ProcessExitedNonZero,
        format!("charon exited with {:?}", code),
    )
}

#[async_trait]
impl ConnectionSteps for IpsecConnection {
    type Step = IpsecStep;

    fn name(&self) -> &str {
        match self.tunnel {
            IpsecTunnel::L2tp(_) => "l2tp-ipsec",
            IpsecTunnel::Xfrm { .. } => "ikev2",
        }
    }

    async fn run_step(&mut self, step: IpsecStep) -> VpnctlResult<StepOutcome<IpsecStep>> {
        match step {
            IpsecStep::Start => {
                self.write_strongswan_conf().await?;
                Ok(StepOutcome::Next(IpsecStep::StrongSwanConfigWritten))
            }
            IpsecStep::StrongSwanConfigWritten => {
                self.start_charon().await?;
                Ok(StepOutcome::Next(IpsecStep::CharonStarted))
            }
            IpsecStep::CharonStarted => {
                self.write_swanctl_conf().await?;
                Ok(StepOutcome::Next(IpsecStep::SwanctlConfigWritten))
            }
            IpsecStep::SwanctlConfigWritten => {
                self.load_swanctl_conf().await?;
                Ok(StepOutcome::Next(IpsecStep::SwanctlConfigLoaded))
            }
            IpsecStep::SwanctlConfigLoaded => {
                self.initiate().await?;
                Ok(StepOutcome::Next(IpsecStep::IpsecConnected))
            }
            IpsecStep::IpsecConnected => {
                self.read_status().await?;
                Ok(StepOutcome::Next(IpsecStep::IpsecStatusRead))
            }
            IpsecStep::IpsecStatusRead => match self.tunnel.clone() {
                IpsecTunnel::L2tp(config) => self.start_l2tp(config).await,
                IpsecTunnel::Xfrm { if_id, interface_name } => self.start_xfrm(if_id, interface_name).await,
            },
        }
    }

    async fn supervise(&mut self) -> VpnctlError {
        tokio::select! {
            exit = wait_charon(&mut self.charon) => charon_exited(exit.code),
            event = next_event(&mut self.l2tp_events) => match event {
                Some(ConnectionEvent::Failure { reason, detail }) => VpnctlError::failure(reason, detail),
                _ => VpnctlError::failure(ConnectFailure::Disconnect, "L2TP connection stopped"),
            },
        }
    }

    async fn cleanup(&mut self) {
        if let Some(mut l2tp) = self.l2tp.take() {
            l2tp.disconnect().await;
        }
        self.l2tp_events = None;

        if let Some(charon) = self.charon.take() {
            if charon.has_exited().is_none() {
                info!("Stopping charon (pid {})", charon.pid);
                self.ctx.launcher.stop(charon.pid);
            }
        }

        if let Some(name) = self.xfrm_link.take() {
            if let Err(e) = self.ctx.devices.delete_interface(&name).await {
                warn!("Failed to delete {}: {}", name, e);
            }
        }
    }
}
