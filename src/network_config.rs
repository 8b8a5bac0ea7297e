//! Network configuration produced by a VPN connection and the sink that
//! publishes it

use crate::error::{VpnctlError, VpnctlResult};
use crate::validation;
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Addresses, routes and DNS settings of a connected tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResult {
    pub ipv4_address: Option<Ipv4Net>,
    pub ipv4_gateway: Option<Ipv4Addr>,
    pub ipv6_address: Option<Ipv6Net>,
    pub dns_servers: Vec<IpAddr>,
    pub dns_search: Vec<String>,
    pub included_routes: Vec<IpNet>,
    pub excluded_routes: Vec<IpNet>,
    pub mtu: Option<u32>,
}

impl NetworkResult {
    /// Whether all traffic of at least one family goes through the tunnel
    pub fn has_default_route(&self) -> bool {
        self.included_routes.iter().any(|net| net.prefix_len() == 0)
    }

    /// Contents of the per-link resolver file
    pub fn resolv_conf(&self) -> String {
        let mut out = String::new();
        for server in &self.dns_servers {
            out.push_str(&format!("nameserver {}\n", server));
        }
        if !self.dns_search.is_empty() {
            out.push_str(&format!("search {}\n", self.dns_search.join(" ")));
        }
        out
    }
}

/// `0.0.0.0/0` and/or `::/0`
pub fn default_routes(ipv4: bool, ipv6: bool) -> Vec<IpNet> {
    let mut routes = Vec::new();
    if ipv4 {
        routes.extend("0.0.0.0/0".parse::<IpNet>().ok());
    }
    if ipv6 {
        routes.extend("::/0".parse::<IpNet>().ok());
    }
    routes
}

/// Receives the configuration of a connected tunnel
#[async_trait]
pub trait NetworkConfigSink: Send + Sync {
    /// Apply addresses, MTU, routes and DNS to `link`
    async fn apply(&self, link: &str, result: &NetworkResult) -> VpnctlResult<()>;

    /// Undo whatever `apply` did for `link`
    async fn withdraw(&self, link: &str) -> VpnctlResult<()>;
}

/// Sink backed by `ip` and per-link resolver files under the state dir
pub struct IpCommandSink {
    state_dir: PathBuf,
    applied: Mutex<HashMap<String, NetworkResult>>,
}

impl IpCommandSink {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            applied: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolv_path(&self, link: &str) -> PathBuf {
        self.state_dir.join(format!("resolv.{}.conf", link))
    }

    async fn run_ip(&self, args: &[String]) -> VpnctlResult<()> {
        let cmd_str = format!("ip {}", args.join(" "));
        debug!("Running {}", cmd_str);
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| VpnctlError::CommandFailed {
                cmd: cmd_str.clone(),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(VpnctlError::CommandFailed {
                cmd: cmd_str,
                code: output.status.code(),
                stderr: validation::sanitize_error_message(&String::from_utf8_lossy(&output.stderr)),
            });
        }
        Ok(())
    }
}

/// `ip` invocations that publish `result` on `link`
pub fn apply_commands(link: &str, result: &NetworkResult) -> Vec<Vec<String>> {
    let mut cmds = Vec::new();
    let argv = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();

    if let Some(addr) = result.ipv4_address {
        let mut cmd = argv(&["addr", "replace", &addr.to_string(), "dev", link]);
        if let Some(peer) = result.ipv4_gateway {
            cmd.extend(argv(&["peer", &peer.to_string()]));
        }
        cmds.push(cmd);
    }
    if let Some(addr) = result.ipv6_address {
        cmds.push(argv(&["-6", "addr", "replace", &addr.to_string(), "dev", link]));
    }
    if let Some(mtu) = result.mtu {
        cmds.push(argv(&["link", "set", "dev", link, "mtu", &mtu.to_string()]));
    }
    cmds.push(argv(&["link", "set", "dev", link, "up"]));

    for route in &result.included_routes {
        cmds.push(argv(&["route", "replace", &route.to_string(), "dev", link]));
    }
    for route in &result.excluded_routes {
        cmds.push(argv(&["route", "replace", "throw", &route.to_string()]));
    }
    cmds
}

#[async_trait]
impl NetworkConfigSink for IpCommandSink {
    async fn apply(&self, link: &str, result: &NetworkResult) -> VpnctlResult<()> {
        validation::validate_interface_name(link)?;

        for cmd in apply_commands(link, result) {
            self.run_ip(&cmd).await?;
        }

        if !result.dns_servers.is_empty() {
            tokio::fs::create_dir_all(&self.state_dir).await?;
            tokio::fs::write(self.resolv_path(link), result.resolv_conf()).await?;
        }

        self.applied.lock().await.insert(link.to_string(), result.clone());
        info!(
            "Applied network configuration to {} ({} routes, {} DNS servers)",
            link,
            result.included_routes.len(),
            result.dns_servers.len()
        );
        Ok(())
    }

    async fn withdraw(&self, link: &str) -> VpnctlResult<()> {
        let Some(result) = self.applied.lock().await.remove(link) else {
            return Ok(());
        };

        // Routes through the link vanish with it; throw routes do not
        for route in &result.excluded_routes {
            let cmd = vec![
                "route".to_string(),
                "del".to_string(),
                "throw".to_string(),
                route.to_string(),
            ];
            if let Err(e) = self.run_ip(&cmd).await {
                warn!("Failed to remove throw route {}: {}", route, e);
            }
        }

        let path = self.resolv_path(link);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        info!("Withdrew network configuration from {}", link);
        Ok(())
    }
}
