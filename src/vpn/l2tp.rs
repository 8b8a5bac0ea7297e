//! L2TP connection driving xl2tpd and pppd
//!
//! Runs inside an established IPsec transport SA. pppd reports back through
//! the plugin RPC in [`super::ppp`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::device::LinkInfo;
use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::process::{ProcessSpec, RunningProcess, CAP_NET_ADMIN, CAP_NET_BIND_SERVICE, CAP_NET_RAW};
use crate::validation;
use super::common::{create_attempt_dir, write_secure_config};
use super::connection::{ConnectStep, ConnectionSteps, StepOutcome};
use super::driver::DriverContext;
use super::ppp::{self, PppLogin, PppNotification, PppReason};

fn default_true() -> bool {
    true
}

/// PPP settings of an L2TP tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2tpConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub lcp_echo_disabled: bool,
    #[serde(default = "default_true")]
    pub require_chap: bool,
    #[serde(default = "default_true")]
    pub refuse_pap: bool,
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default = "default_true")]
    pub length_bit: bool,
}

impl L2tpConfig {
    pub fn validate(&self) -> VpnctlResult<()> {
        if self.username.is_empty() {
            return Err(VpnctlError::InvalidParameter("L2TP username is required".to_string()));
        }
        validation::sanitize_config_value(&self.username)?;
        validation::sanitize_config_value(&self.password)?;
        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Render xl2tpd.conf with a single autodialled LAC
pub fn render_xl2tpd_conf(config: &L2tpConfig, lns: &str, pppd_options: &Path) -> String {
    format!(
        "[lac managed]\n\
         lns = {lns}\n\
         require chap = {chap}\n\
         refuse pap = {pap}\n\
         require authentication = {auth}\n\
         length bit = {length_bit}\n\
         ppp debug = yes\n\
         pppoptfile = {options}\n\
         redial = no\n\
         autodial = yes\n",
        lns = lns,
        chap = yes_no(config.require_chap),
        pap = yes_no(config.refuse_pap),
        auth = yes_no(config.require_auth),
        length_bit = yes_no(config.length_bit),
        options = pppd_options.display(),
    )
}

/// Render the pppd options file
pub fn render_pppd_options(config: &L2tpConfig, plugin: &Path, mtu: u32) -> String {
    let mut options = vec![
        "ipcp-accept-local".to_string(),
        "ipcp-accept-remote".to_string(),
        "refuse-eap".to_string(),
        "noccp".to_string(),
        "noauth".to_string(),
        "crtscts".to_string(),
        format!("mtu {}", mtu),
        format!("mru {}", mtu),
        "lock".to_string(),
        "connect-delay 5000".to_string(),
        "nodefaultroute".to_string(),
        "nosystemconfig".to_string(),
        "usepeerdns".to_string(),
    ];
    if !config.lcp_echo_disabled {
        options.push("lcp-echo-failure 4".to_string());
        options.push("lcp-echo-interval 30".to_string());
    }
    options.push("logfd 2".to_string());
    options.push(format!("plugin {}", plugin.display()));

    let mut out = options.join("\n");
    out.push('\n');
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum L2tpStep {
    Start,
    ConfigWritten,
    L2tpdStarted,
}

impl ConnectStep for L2tpStep {
    const INITIAL: Self = L2tpStep::Start;
}

struct L2tpPaths {
    xl2tpd_conf: PathBuf,
    control: PathBuf,
    pid: PathBuf,
    socket: PathBuf,
}

/// Steps of an L2TP connection to `lns`
pub struct L2tpConnection {
    ctx: DriverContext,
    config: L2tpConfig,
    lns: String,
    token: String,
    /// Removed when the connection drops
    #[allow(dead_code)]
    temp_dir: Option<TempDir>,
    paths: Option<L2tpPaths>,
    rpc: Option<JoinHandle<()>>,
    notifications: Option<mpsc::UnboundedReceiver<PppNotification>>,
    xl2tpd: Option<RunningProcess>,
}

fn unavailable(what: &str) -> VpnctlError {
    VpnctlError::failure(ConnectFailure::InternalFailure, format!("{} not available", what))
}

impl L2tpConnection {
    pub fn new(ctx: DriverContext, config: L2tpConfig, lns: impl Into<String>) -> Self {
        Self {
            ctx,
            config,
            lns: lns.into(),
            token: uuid::Uuid::new_v4().to_string(),
            temp_dir: None,
            paths: None,
            rpc: None,
            notifications: None,
            xl2tpd: None,
        }
    }

    async fn write_config(&mut self) -> VpnctlResult<()> {
        let dir = create_attempt_dir(&self.ctx.config.paths.run_dir, "l2tp-")?;
        let base = dir.path();
        let pppd_options = base.join("pppd.options");
        let paths = L2tpPaths {
            xl2tpd_conf: base.join("xl2tpd.conf"),
            control: base.join("xl2tpd.control"),
            pid: base.join("xl2tpd.pid"),
            socket: base.join("ppp.sock"),
        };

        let xl2tpd_conf = render_xl2tpd_conf(&self.config, &self.lns, &pppd_options);
        write_secure_config(&paths.xl2tpd_conf, &xl2tpd_conf, 0o600).await?;

        let l2tp = &self.ctx.config.l2tp;
        let options = render_pppd_options(&self.config, &l2tp.ppp_plugin, l2tp.mtu);
        write_secure_config(&pppd_options, &options, 0o600).await?;

        let listener = UnixListener::bind(&paths.socket).map_err(|e| {
            VpnctlError::failure(
                ConnectFailure::InternalFailure,
                format!("Failed to bind PPP RPC socket {:?}: {}", paths.socket, e),
            )
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let login = PppLogin {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };
        self.rpc = Some(tokio::spawn(ppp::serve(listener, self.token.clone(), login, tx)));
        self.notifications = Some(rx);
        self.paths = Some(paths);
        self.temp_dir = Some(dir);
        Ok(())
    }

    fn start_xl2tpd(&mut self) -> VpnctlResult<()> {
        let paths = self.paths.as_ref().ok_or_else(|| unavailable("xl2tpd configuration"))?;
        let spec = ProcessSpec::new(&self.ctx.config.programs.xl2tpd)
            .arg("-c")
            .arg(paths.xl2tpd_conf.display().to_string())
            .arg("-C")
            .arg(paths.control.display().to_string())
            .arg("-p")
            .arg(paths.pid.display().to_string())
            .arg("-D")
            .env(ppp::ENV_PPP_SOCKET, paths.socket.display().to_string())
            .env(ppp::ENV_PPP_TOKEN, self.token.as_str())
            .capabilities(CAP_NET_ADMIN | CAP_NET_BIND_SERVICE | CAP_NET_RAW);

        let process = self.ctx.launcher.start(spec).map_err(|e| {
            VpnctlError::failure(ConnectFailure::ProcessStartFailure, e.detail())
        })?;
        info!("Started xl2tpd (pid {})", process.pid);
        self.xl2tpd = Some(process);
        Ok(())
    }

    /// Wait until pppd reports the link up
    async fn wait_for_ppp(&mut self) -> VpnctlResult<PppNotification> {
        let xl2tpd = self.xl2tpd.as_mut().ok_or_else(|| unavailable("xl2tpd"))?;
        let notifications = self.notifications.as_mut().ok_or_else(|| unavailable("PPP RPC"))?;

        loop {
            tokio::select! {
                exit = xl2tpd.wait() => {
                    return Err(VpnctlError::failure(
                        ConnectFailure::ProcessExitedNonZero,
                        format!("xl2tpd exited with {:?} before PPP came up", exit.code),
                    ));
                }
                notification = notifications.recv() => {
                    let Some(notification) = notification else {
                        return Err(unavailable("PPP RPC"));
                    };
                    match notification.reason {
                        PppReason::Connect => return Ok(notification),
                        PppReason::Authenticating | PppReason::Authenticated => {
                            debug!("PPP {:?}", notification.reason);
                        }
                        _ => return Err(ppp_ended(&notification)),
                    }
                }
            }
        }
    }
}

/// Failure for a PPP `disconnect` or `exit` notification
fn ppp_ended(notification: &PppNotification) -> VpnctlError {
    if notification.is_auth_failure() {
        return VpnctlError::failure(ConnectFailure::Authentication, "PPP authentication failed");
    }
    match notification.reason {
        PppReason::Exit => VpnctlError::failure(
            ConnectFailure::ProcessExitedNonZero,
            format!("pppd exited with {:?}", notification.exit_code()),
        ),
        _ => VpnctlError::failure(ConnectFailure::Disconnect, "PPP link disconnected"),
    }
}

#[async_trait]
impl ConnectionSteps for L2tpConnection {
    type Step = L2tpStep;

    fn name(&self) -> &str {
        "l2tp"
    }

    async fn run_step(&mut self, step: L2tpStep) -> VpnctlResult<StepOutcome<L2tpStep>> {
        match step {
            L2tpStep::Start => {
                self.write_config().await?;
                Ok(StepOutcome::Next(L2tpStep::ConfigWritten))
            }
            L2tpStep::ConfigWritten => {
                self.start_xl2tpd()?;
                Ok(StepOutcome::Next(L2tpStep::L2tpdStarted))
            }
            L2tpStep::L2tpdStarted => {
                let notification = self.wait_for_ppp().await?;

                let name = notification.interface_name().ok_or_else(|| {
                    VpnctlError::failure(ConnectFailure::ParseFailure, "PPP did not report an interface")
                })?;
                validation::validate_interface_name(name)?;
                let index = self.ctx.devices.link_index(name).await.ok_or_else(|| {
                    VpnctlError::failure(ConnectFailure::InternalFailure, format!("PPP link {} not found", name))
                })?;

                let mut network = ppp::network_from_ppp(&notification.dict);
                if network.ipv4_address.is_none() {
                    return Err(VpnctlError::failure(
                        ConnectFailure::ParseFailure,
                        "PPP did not report a local address",
                    ));
                }
                network.mtu.get_or_insert(self.ctx.config.l2tp.mtu);

                Ok(StepOutcome::Connected {
                    link: LinkInfo {
                        name: name.to_string(),
                        index,
                    },
                    network,
                })
            }
        }
    }

    async fn supervise(&mut self) -> VpnctlError {
        let (Some(xl2tpd), Some(notifications)) = (self.xl2tpd.as_mut(), self.notifications.as_mut()) else {
            return unavailable("xl2tpd");
        };

        loop {
            tokio::select! {
                exit = xl2tpd.wait() => {
                    return VpnctlError::failure(
                        ConnectFailure::ProcessExitedNonZero,
                        format!("xl2tpd exited with {:?}", exit.code),
                    );
                }
                notification = notifications.recv() => match notification {
                    Some(n) if matches!(n.reason, PppReason::Disconnect | PppReason::Exit) => {
                        return ppp_ended(&n);
                    }
                    Some(n) => debug!("Ignoring PPP {:?} while connected", n.reason),
                    None => return unavailable("PPP RPC"),
                },
            }
        }
    }

    async fn cleanup(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            rpc.abort();
        }
        if let Some(xl2tpd) = self.xl2tpd.take() {
            if xl2tpd.has_exited().is_none() {
                info!("Stopping xl2tpd (pid {})", xl2tpd.pid);
                self.ctx.launcher.stop(xl2tpd.pid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> L2tpConfig {
        L2tpConfig {
            username: "alice".to_string(),
            password: "secret".to_string(),
            lcp_echo_disabled: false,
            require_chap: true,
            refuse_pap: true,
            require_auth: false,
            length_bit: true,
        }
    }

    #[test]
    fn test_render_xl2tpd_conf() {
        let conf = render_xl2tpd_conf(&config(), "203.0.113.1", Path::new("/run/l2tp-x/pppd.options"));
        assert_eq!(
            conf,
            "[lac managed]\nlns = 203.0.113.1\nrequire chap = yes\nrefuse pap = yes\n\
             require authentication = no\nlength bit = yes\nppp debug = yes\n\
             pppoptfile = /run/l2tp-x/pppd.options\nredial = no\nautodial = yes\n"
        );
    }

    #[test]
    fn test_render_pppd_options() {
        let mut cfg = config();
        let options = render_pppd_options(&cfg, Path::new("/usr/lib/ppp.so"), 1410);
        assert!(options.contains("mtu 1410\nmru 1410\n"));
        assert!(options.contains("lcp-echo-interval 30\n"));
        assert!(options.ends_with("plugin /usr/lib/ppp.so\n"));

        cfg.lcp_echo_disabled = true;
        let options = render_pppd_options(&cfg, Path::new("/usr/lib/ppp.so"), 1410);
        assert!(!options.contains("lcp-echo"));
    }

    #[test]
    fn test_ppp_ended_classification() {
        let exit = |code: &str| PppNotification {
            reason: PppReason::Exit,
            dict: [(ppp::KEY_EXIT_CODE.to_string(), code.to_string())].into_iter().collect(),
        };
        assert_eq!(ppp_ended(&exit("19")).connect_failure(), ConnectFailure::Authentication);
        assert_eq!(ppp_ended(&exit("11")).connect_failure(), ConnectFailure::Authentication);
        assert_eq!(ppp_ended(&exit("16")).connect_failure(), ConnectFailure::ProcessExitedNonZero);

        let disconnect = PppNotification {
            reason: PppReason::Disconnect,
            dict: Default::default(),
        };
        assert_eq!(ppp_ended(&disconnect).connect_failure(), ConnectFailure::Disconnect);
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());
        let mut cfg = config();
        cfg.username.clear();
        assert!(cfg.validate().is_err());
    }
}
