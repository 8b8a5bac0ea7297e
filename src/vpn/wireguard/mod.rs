//! Kernel WireGuard driver
//!
//! The interface is created through the device factory and configured with
//! `wg setconf` reading from an anonymous memfd, so the private key never
//! touches the filesystem.

pub mod keys;
pub mod link_status;
pub mod peers;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::device::{await_link_ready, LinkInfo};
use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::metrics::{AddressType, AllowedIpsType, KeyPairSource, WireGuardReport};
use crate::network_config::NetworkResult;
use crate::network_monitor::PhysicalServiceEvent;
use crate::process::ProcessSpec;
use crate::profile::DriverConfig;
use crate::validation;
use super::common::{ActiveAttempt, AttemptState};
use super::connection::{ConnectStep, ConnectionSteps, StepOutcome};
use super::driver::{DriverContext, DriverEventHandler, VpnDriver, VpnType};
use keys::KeyPair;
use link_status::{PeerStatus, PeerStatusMap};
use peers::{PeerEntry, PeerSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardConfig {
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    /// Local addresses, one per family at most
    pub addresses: Vec<String>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub dns_search: Vec<String>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

impl WireGuardConfig {
    pub fn validate(&self) -> VpnctlResult<()> {
        if let Some(key) = &self.private_key {
            if !key.is_empty() {
                validation::validate_wireguard_key(key)?;
            }
        }
        if self.addresses.is_empty() {
            return Err(VpnctlError::InvalidParameter("WireGuard needs a local address".to_string()));
        }
        if self.peers.is_empty() {
            return Err(VpnctlError::InvalidParameter("WireGuard needs at least one peer".to_string()));
        }
        peers::validate_peers(&self.peers)?;
        for peer in &self.peers {
            peer.validate()?;
        }
        for domain in &self.dns_search {
            validation::sanitize_config_value(domain)?;
        }
        if let Some(mtu) = self.mtu {
            validation::validate_mtu(mtu)?;
        }
        Ok(())
    }
}

/// Local addresses as host routes; more than one per family or a malformed
/// entry is an error
pub fn parse_addresses(addresses: &[String]) -> VpnctlResult<(Option<Ipv4Net>, Option<Ipv6Net>)> {
    let mut v4 = None;
    let mut v6 = None;

    for entry in addresses {
        let entry = entry.trim();
        let malformed =
            || VpnctlError::failure(ConnectFailure::ParseFailure, format!("Malformed address '{}'", entry));
        // The prefix is validated but the local address is installed as a host route
        let addr = if entry.contains('/') {
            entry.parse::<IpNet>().map_err(|_| malformed())?.addr()
        } else {
            entry.parse::<IpAddr>().map_err(|_| malformed())?
        };
        match addr {
            IpAddr::V4(a) if v4.is_none() => v4 = Ipv4Net::new(a, 32).ok(),
            IpAddr::V6(a) if v6.is_none() => v6 = Ipv6Net::new(a, 128).ok(),
            _ => {
                return Err(VpnctlError::failure(
                    ConnectFailure::ParseFailure,
                    format!("More than one address of the family of {}", addr),
                ));
            }
        }
    }
    Ok((v4, v6))
}

/// Anonymous file without close-on-exec, readable by a child as
/// `/proc/self/fd/<n>`
fn config_memfd(content: &str) -> VpnctlResult<File> {
    let write_failure = |e: std::io::Error| {
        VpnctlError::failure(ConnectFailure::ConfigWriteFailure, format!("WireGuard config memfd: {}", e))
    };

    let fd = unsafe { libc::memfd_create(b"wg-config\0".as_ptr() as *const libc::c_char, 0) };
    if fd < 0 {
        return Err(write_failure(std::io::Error::last_os_error()));
    }
    let mut file = unsafe { File::from_raw_fd(fd) };
    file.write_all(content.as_bytes()).map_err(write_failure)?;
    Ok(file)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WireGuardStep {
    Start,
    LinkReady,
    InterfaceConfigured,
}

impl ConnectStep for WireGuardStep {
    const INITIAL: Self = WireGuardStep::Start;
}

struct WireGuardConnection {
    ctx: DriverContext,
    interface_name: String,
    private_key: String,
    key_source: KeyPairSource,
    config: WireGuardConfig,
    peers: PeerSet,
    link: Option<LinkInfo>,
    created: bool,
    statuses: PeerStatusMap,
}

impl WireGuardConnection {
    async fn set_config(&self) -> VpnctlResult<()> {
        let content = peers::render_config(&self.private_key, self.ctx.config.wireguard.fwmark, self.peers.peers());
        let memfd = config_memfd(&content)?;

        let spec = ProcessSpec::new(&self.ctx.config.programs.wg)
            .arg("setconf")
            .arg(self.interface_name.as_str())
            .arg(format!("/proc/self/fd/{}", memfd.as_raw_fd()));
        let output = self.ctx.launcher.run(spec).await;
        drop(memfd);
        output?.check("wg setconf")?;
        Ok(())
    }

    fn network(&self) -> VpnctlResult<NetworkResult> {
        let (ipv4_address, ipv6_address) = parse_addresses(&self.config.addresses)?;
        let address_type = match (ipv4_address.is_some(), ipv6_address.is_some()) {
            (true, true) => AddressType::DualStack,
            (false, true) => AddressType::Ipv6Only,
            (true, false) => AddressType::Ipv4Only,
            (false, false) => {
                return Err(VpnctlError::failure(ConnectFailure::ParseFailure, "No local address"));
            }
        };

        self.ctx.metrics.wireguard_report(&WireGuardReport {
            allowed_ips: if self.peers.has_default_route() {
                AllowedIpsType::HasDefaultRoute
            } else {
                AllowedIpsType::NoDefaultRoute
            },
            peer_count: self.peers.len(),
            address_type,
            key_source: self.key_source,
        });

        Ok(NetworkResult {
            ipv4_address,
            ipv6_address,
            dns_servers: self.config.dns_servers.clone(),
            dns_search: self.config.dns_search.clone(),
            included_routes: self.peers.allowed_ips(),
            mtu: Some(self.config.mtu.unwrap_or(self.ctx.config.wireguard.mtu)),
            ..Default::default()
        })
    }

    async fn poll_status(&self) {
        let spec = ProcessSpec::new(&self.ctx.config.programs.wg)
            .arg("show")
            .arg(self.interface_name.as_str())
            .arg("dump");
        match self.ctx.launcher.run(spec).await.and_then(|o| o.check("wg show dump")) {
            Ok(output) => link_status::store(&self.statuses, link_status::parse_dump(&output.stdout)).await,
            Err(e) => warn!("Failed to read WireGuard link status: {}", e),
        }
    }
}

#[async_trait]
impl ConnectionSteps for WireGuardConnection {
    type Step = WireGuardStep;

    fn name(&self) -> &str {
        "wireguard"
    }

    async fn run_step(&mut self, step: WireGuardStep) -> VpnctlResult<StepOutcome<WireGuardStep>> {
        match step {
            WireGuardStep::Start => {
                self.created = true;
                let devices = self.ctx.devices.clone();
                let link = await_link_ready(
                    devices.create_wireguard_interface(&self.interface_name),
                    self.ctx.config.timeouts.link_ready(),
                )
                .await?;
                self.link = Some(link);
                Ok(StepOutcome::Next(WireGuardStep::LinkReady))
            }
            WireGuardStep::LinkReady => {
                self.set_config().await?;
                Ok(StepOutcome::Next(WireGuardStep::InterfaceConfigured))
            }
            WireGuardStep::InterfaceConfigured => {
                let network = self.network()?;
                let link = self.link.clone().ok_or_else(|| {
                    VpnctlError::failure(ConnectFailure::InternalFailure, "WireGuard link missing")
                })?;
                Ok(StepOutcome::Connected { link, network })
            }
        }
    }

    async fn supervise(&mut self) -> VpnctlError {
        let interval = Duration::from_secs(self.ctx.config.wireguard.link_status_interval_secs.max(1));
        loop {
            self.poll_status().await;
            tokio::time::sleep(interval).await;
        }
    }

    async fn cleanup(&mut self) {
        self.statuses.write().await.clear();
        if std::mem::take(&mut self.created) {
            if let Err(e) = self.ctx.devices.delete_interface(&self.interface_name).await {
                warn!("Failed to delete {}: {}", self.interface_name, e);
            }
        }
    }
}

pub struct WireGuardDriver {
    ctx: DriverContext,
    config: WireGuardConfig,
    keys: KeyPair,
    peers: PeerSet,
    attempt: Option<ActiveAttempt>,
    handler: Option<DriverEventHandler>,
    state: AttemptState,
    statuses: PeerStatusMap,
    physical_down: bool,
}

impl WireGuardDriver {
    pub fn new(ctx: DriverContext, config: WireGuardConfig) -> VpnctlResult<Self> {
        let peers = PeerSet::new(config.peers.clone())?;
        let keys = KeyPair::new(config.private_key.clone(), config.public_key.clone());
        Ok(Self {
            ctx,
            config,
            keys,
            peers,
            attempt: None,
            handler: None,
            state: AttemptState::default(),
            statuses: PeerStatusMap::default(),
            physical_down: false,
        })
    }

    pub fn peers(&self) -> &[PeerEntry] {
        self.peers.peers()
    }

    /// Replace the peers used by the next connect attempt
    pub fn set_peers(&mut self, peers: Vec<PeerEntry>) -> VpnctlResult<()> {
        for peer in &peers {
            peer.validate()?;
        }
        self.peers.set_peers(peers)?;
        self.config.peers = self.peers.peers().to_vec();
        Ok(())
    }

    /// Replace the private key; the public key is derived again on the next save
    pub fn set_private_key(&mut self, key: impl Into<String>) -> VpnctlResult<()> {
        let key = key.into();
        self.keys.set_private_key(key.clone())?;
        self.config.private_key = Some(key);
        Ok(())
    }

    /// Generate and derive keys as needed; returns whether they changed
    pub async fn save(&mut self) -> VpnctlResult<bool> {
        let changed = self
            .keys
            .save(self.ctx.launcher.as_ref(), &self.ctx.config.programs.wg)
            .await?;
        if changed {
            self.config.private_key = self.keys.private_key().map(str::to_string);
            self.config.public_key = self.keys.public_key().map(str::to_string);
            info!("WireGuard public key: {}", self.keys.public_key().unwrap_or("-"));
        }
        Ok(changed)
    }

    pub fn public_key(&self) -> Option<&str> {
        self.keys.public_key()
    }

    /// Profile settings including generated keys
    pub fn config(&self) -> &WireGuardConfig {
        &self.config
    }

    /// Last polled status of every peer
    pub async fn peer_status(&self) -> HashMap<String, PeerStatus> {
        self.statuses.read().await.clone()
    }
}

/// Factory registered for [`VpnType::WireGuard`]
pub fn create_driver(ctx: &DriverContext, config: &DriverConfig) -> VpnctlResult<Box<dyn VpnDriver>> {
    match config {
        DriverConfig::WireGuard(config) => Ok(Box::new(WireGuardDriver::new(ctx.clone(), config.clone())?)),
        other => Err(VpnctlError::InvalidParameter(format!(
            "WireGuard driver cannot use a {} profile",
            other.vpn_type()
        ))),
    }
}

#[async_trait]
impl VpnDriver for WireGuardDriver {
    fn vpn_type(&self) -> VpnType {
        VpnType::WireGuard
    }

    async fn connect_async(&mut self, handler: DriverEventHandler) -> VpnctlResult<Option<Duration>> {
        self.disconnect().await;
        self.config
            .validate()
            .map_err(|e| VpnctlError::failure(ConnectFailure::InvalidConfig, e.detail()))?;
        self.save().await?;

        let private_key = self.keys.private_key().map(str::to_string).ok_or_else(|| {
            VpnctlError::failure(ConnectFailure::InternalFailure, "WireGuard private key missing")
        })?;

        self.ctx.metrics.driver_connecting(VpnType::WireGuard);
        let steps = WireGuardConnection {
            ctx: self.ctx.clone(),
            interface_name: self.ctx.config.wireguard.interface_name.clone(),
            private_key,
            key_source: self.keys.source(),
            config: self.config.clone(),
            peers: self.peers.clone(),
            link: None,
            created: false,
            statuses: self.statuses.clone(),
        };
        info!("WireGuard: connecting with {} peers", self.peers.len());
        self.attempt = Some(ActiveAttempt::start(steps, handler.clone(), self.state.clone()));
        self.handler = Some(handler);
        Ok(Some(Duration::from_secs(self.ctx.config.timeouts.wireguard_connect_secs)))
    }

    async fn disconnect(&mut self) {
        self.handler = None;
        self.physical_down = false;
        if let Some(attempt) = self.attempt.take() {
            attempt.stop().await;
        }
        self.state.clear().await;
    }

    async fn get_network_config(&self) -> Option<NetworkResult> {
        self.state.network().await
    }

    async fn on_default_physical_service_event(&mut self, event: PhysicalServiceEvent) {
        let Some(handler) = self.handler.clone() else {
            return;
        };
        match event {
            PhysicalServiceEvent::Down => {
                if self.state.link().await.is_some() && !self.physical_down {
                    info!("WireGuard: physical network down, waiting");
                    self.physical_down = true;
                    handler.on_reconnecting(None);
                }
            }
            PhysicalServiceEvent::Up => {
                if !std::mem::take(&mut self.physical_down) {
                    return;
                }
                if let Some(link) = self.state.link().await {
                    info!("WireGuard: physical network back, resuming on {}", link.name);
                    handler.on_connected(link);
                }
            }
            PhysicalServiceEvent::Changed => debug!("WireGuard: ignoring physical network change"),
        }
    }
}
