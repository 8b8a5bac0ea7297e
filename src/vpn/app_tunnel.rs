//! App tunnel driver
//!
//! An application owns the tunnel: the driver creates a TUN interface and
//! waits for the app to deliver the IP parameters through an
//! [`AppTunnelHandle`]. The handle only accepts requests while an attempt
//! is active.

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::device::{await_link_ready, LinkInfo};
use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::network_config::NetworkResult;
use crate::network_monitor::PhysicalServiceEvent;
use crate::validation;
use super::common::{ActiveAttempt, AttemptState};
use super::connection::{ConnectStep, ConnectionSteps, StepOutcome};
use super::driver::{DriverContext, DriverEventHandler, VpnDriver, VpnType};

pub const PARAM_ADDRESS: &str = "address";
pub const PARAM_SUBNET_PREFIX: &str = "subnet_prefix";
pub const PARAM_DNS_SERVERS: &str = "dns_servers";
pub const PARAM_INCLUSION_LIST: &str = "inclusion_list";
pub const PARAM_EXCLUSION_LIST: &str = "exclusion_list";
pub const PARAM_MTU: &str = "mtu";
pub const PARAM_DOMAIN_SEARCH: &str = "domain_search";

fn default_tun() -> String {
    "arc_tun0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTunnelConfig {
    #[serde(default = "default_tun")]
    pub interface_name: String,
}

impl Default for AppTunnelConfig {
    fn default() -> Self {
        Self {
            interface_name: default_tun(),
        }
    }
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
}

fn parse_list<T: std::str::FromStr>(key: &str, value: &str, errors: &mut Vec<String>) -> Vec<T> {
    let mut parsed = Vec::new();
    for item in list(value) {
        match item.parse() {
            Ok(v) => parsed.push(v),
            Err(_) => errors.push(format!("{}: invalid entry '{}'", key, item)),
        }
    }
    parsed
}

/// Build the network configuration from app supplied parameters
///
/// `address`, `subnet_prefix` and `inclusion_list` are mandatory. All
/// problems are collected into one error.
pub fn parse_parameters(params: &HashMap<String, String>) -> VpnctlResult<NetworkResult> {
    let mut errors = Vec::new();
    let mut result = NetworkResult::default();

    let address = match params.get(PARAM_ADDRESS).map(|v| v.parse::<Ipv4Addr>()) {
        Some(Ok(address)) => Some(address),
        Some(Err(_)) => {
            errors.push(format!("{}: not an IPv4 address", PARAM_ADDRESS));
            None
        }
        None => {
            errors.push(format!("{}: missing", PARAM_ADDRESS));
            None
        }
    };
    let prefix = match params.get(PARAM_SUBNET_PREFIX).map(|v| v.parse::<u8>()) {
        Some(Ok(prefix)) if prefix <= 32 => Some(prefix),
        Some(_) => {
            errors.push(format!("{}: must be 0-32", PARAM_SUBNET_PREFIX));
            None
        }
        None => {
            errors.push(format!("{}: missing", PARAM_SUBNET_PREFIX));
            None
        }
    };
    if let (Some(address), Some(prefix)) = (address, prefix) {
        result.ipv4_address = Ipv4Net::new(address, prefix).ok();
    }

    match params.get(PARAM_INCLUSION_LIST) {
        Some(value) => result.included_routes = parse_list::<IpNet>(PARAM_INCLUSION_LIST, value, &mut errors),
        None => errors.push(format!("{}: missing", PARAM_INCLUSION_LIST)),
    }
    if let Some(value) = params.get(PARAM_EXCLUSION_LIST) {
        result.excluded_routes = parse_list::<IpNet>(PARAM_EXCLUSION_LIST, value, &mut errors);
    }
    if let Some(value) = params.get(PARAM_DNS_SERVERS) {
        result.dns_servers = parse_list::<IpAddr>(PARAM_DNS_SERVERS, value, &mut errors);
    }
    if let Some(value) = params.get(PARAM_DOMAIN_SEARCH) {
        for domain in list(value) {
            match validation::validate_hostname(domain) {
                Ok(()) => result.dns_search.push(domain.to_string()),
                Err(_) => errors.push(format!("{}: invalid domain '{}'", PARAM_DOMAIN_SEARCH, domain)),
            }
        }
    }
    if let Some(value) = params.get(PARAM_MTU) {
        match value.parse::<u32>().ok().filter(|mtu| validation::validate_mtu(*mtu).is_ok()) {
            Some(mtu) => result.mtu = Some(mtu),
            None => errors.push(format!("{}: invalid value '{}'", PARAM_MTU, value)),
        }
    }

    if errors.is_empty() {
        Ok(result)
    } else {
        Err(VpnctlError::ParseError(errors.join("; ")))
    }
}

#[derive(Debug)]
enum AppMessage {
    Parameters(NetworkResult),
    Failure(String),
}

struct ActiveSlot {
    attempt: u64,
    tx: mpsc::UnboundedSender<AppMessage>,
}

/// The app's side of an app tunnel service
#[derive(Clone)]
pub struct AppTunnelHandle {
    slot: Arc<Mutex<Option<ActiveSlot>>>,
    events: broadcast::Sender<PhysicalServiceEvent>,
}

impl AppTunnelHandle {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            slot: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Deliver tunnel parameters; malformed ones are reported back without
    /// failing the attempt
    pub fn set_parameters(&self, params: &HashMap<String, String>) -> VpnctlResult<()> {
        let network = parse_parameters(params)?;
        self.send(AppMessage::Parameters(network))
    }

    /// The app gave up on the tunnel
    pub fn report_failure(&self, detail: impl Into<String>) -> VpnctlResult<()> {
        self.send(AppMessage::Failure(detail.into()))
    }

    /// Physical network changes seen by the service
    pub fn subscribe(&self) -> broadcast::Receiver<PhysicalServiceEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveSlot>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, message: AppMessage) -> VpnctlResult<()> {
        let slot = self.lock();
        let Some(active) = slot.as_ref() else {
            return Err(VpnctlError::InvalidState("No app tunnel attempt is active".to_string()));
        };
        active
            .tx
            .send(message)
            .map_err(|_| VpnctlError::InvalidState("App tunnel attempt has ended".to_string()))
    }

    fn attach(&self, attempt: u64) -> mpsc::UnboundedReceiver<AppMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.lock() = Some(ActiveSlot { attempt, tx });
        rx
    }

    /// Release the slot if it still belongs to `attempt`
    fn detach(&self, attempt: u64) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|active| active.attempt == attempt) {
            *slot = None;
        }
    }

    fn notify(&self, event: PhysicalServiceEvent) {
        if self.events.send(event).is_err() {
            debug!("No app listening for physical network events");
        }
    }
}

impl Default for AppTunnelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AppTunnelStep {
    Start,
    LinkReady,
}

impl ConnectStep for AppTunnelStep {
    const INITIAL: Self = AppTunnelStep::Start;
}

struct AppTunnelConnection {
    ctx: DriverContext,
    interface_name: String,
    handle: AppTunnelHandle,
    attempt: u64,
    messages: mpsc::UnboundedReceiver<AppMessage>,
    link: Option<LinkInfo>,
    created: bool,
}

fn app_failed(detail: String) -> VpnctlError {
    VpnctlError::failure(ConnectFailure::Disconnect, format!("App reported failure: {}", detail))
}

fn app_gone() -> VpnctlError {
    VpnctlError::failure(ConnectFailure::InternalFailure, "App tunnel handle released")
}

#[async_trait]
impl ConnectionSteps for AppTunnelConnection {
    type Step = AppTunnelStep;

    fn name(&self) -> &str {
        "app-tunnel"
    }

    async fn run_step(&mut self, step: AppTunnelStep) -> VpnctlResult<StepOutcome<AppTunnelStep>> {
        match step {
            AppTunnelStep::Start => {
                self.created = true;
                let devices = self.ctx.devices.clone();
                let link = await_link_ready(
                    devices.create_tun_interface(&self.interface_name),
                    self.ctx.config.timeouts.link_ready(),
                )
                .await?;
                self.link = Some(link);
                Ok(StepOutcome::Next(AppTunnelStep::LinkReady))
            }
            AppTunnelStep::LinkReady => {
                debug!("Waiting for app parameters on {}", self.interface_name);
                match self.messages.recv().await {
                    Some(AppMessage::Parameters(network)) => {
                        let link = self.link.clone().ok_or_else(app_gone)?;
                        Ok(StepOutcome::Connected { link, network })
                    }
                    Some(AppMessage::Failure(detail)) => Err(app_failed(detail)),
                    None => Err(app_gone()),
                }
            }
        }
    }

    async fn supervise(&mut self) -> VpnctlError {
        loop {
            match self.messages.recv().await {
                Some(AppMessage::Failure(detail)) => return app_failed(detail),
                Some(AppMessage::Parameters(_)) => warn!("Ignoring app parameters while connected"),
                None => return app_gone(),
            }
        }
    }

    async fn cleanup(&mut self) {
        self.handle.detach(self.attempt);
        if std::mem::take(&mut self.created) {
            if let Err(e) = self.ctx.devices.delete_interface(&self.interface_name).await {
                warn!("Failed to delete {}: {}", self.interface_name, e);
            }
        }
    }
}

pub struct AppTunnelDriver {
    ctx: DriverContext,
    config: AppTunnelConfig,
    handle: AppTunnelHandle,
    attempt: Option<ActiveAttempt>,
    state: AttemptState,
}

impl AppTunnelDriver {
    pub fn new(ctx: DriverContext, config: AppTunnelConfig, handle: AppTunnelHandle) -> Self {
        Self {
            ctx,
            config,
            handle,
            attempt: None,
            state: AttemptState::default(),
        }
    }
}

#[async_trait]
impl VpnDriver for AppTunnelDriver {
    fn vpn_type(&self) -> VpnType {
        VpnType::AppTunnel
    }

    async fn connect_async(&mut self, handler: DriverEventHandler) -> VpnctlResult<Option<Duration>> {
        self.disconnect().await;
        validation::validate_interface_name(&self.config.interface_name)
            .map_err(|e| VpnctlError::failure(ConnectFailure::InvalidConfig, e.detail()))?;

        self.ctx.metrics.driver_connecting(VpnType::AppTunnel);
        let attempt = handler.generation();
        let steps = AppTunnelConnection {
            ctx: self.ctx.clone(),
            interface_name: self.config.interface_name.clone(),
            handle: self.handle.clone(),
            attempt,
            messages: self.handle.attach(attempt),
            link: None,
            created: false,
        };
        info!("App tunnel: waiting for the app on {}", self.config.interface_name);
        self.attempt = Some(ActiveAttempt::start(steps, handler, self.state.clone()));
        Ok(Some(Duration::from_secs(self.ctx.config.timeouts.app_tunnel_connect_secs)))
    }

    async fn disconnect(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.stop().await;
        }
        self.state.clear().await;
    }

    async fn get_network_config(&self) -> Option<NetworkResult> {
        self.state.network().await
    }

    async fn on_default_physical_service_event(&mut self, event: PhysicalServiceEvent) {
        if self.attempt.is_some() {
            self.handle.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_parameters() {
        let network = parse_parameters(&params(&[
            (PARAM_ADDRESS, "100.115.92.6"),
            (PARAM_SUBNET_PREFIX, "30"),
            (PARAM_INCLUSION_LIST, "0.0.0.0/0"),
            (PARAM_EXCLUSION_LIST, "192.168.1.0/24, 10.0.0.0/8"),
            (PARAM_DNS_SERVERS, "8.8.8.8,8.8.4.4"),
            (PARAM_DOMAIN_SEARCH, "corp.example.com"),
            (PARAM_MTU, "1400"),
        ]))
        .unwrap();

        assert_eq!(network.ipv4_address, Some("100.115.92.6/30".parse().unwrap()));
        assert!(network.has_default_route());
        assert_eq!(network.excluded_routes.len(), 2);
        assert_eq!(network.dns_servers.len(), 2);
        assert_eq!(network.dns_search, vec!["corp.example.com".to_string()]);
        assert_eq!(network.mtu, Some(1400));
    }

    #[test]
    fn test_parse_parameters_collects_errors() {
        let err = parse_parameters(&params(&[
            (PARAM_ADDRESS, "not-an-ip"),
            (PARAM_SUBNET_PREFIX, "40"),
            (PARAM_MTU, "10"),
        ]))
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("address"));
        assert!(message.contains("subnet_prefix"));
        assert!(message.contains("inclusion_list: missing"));
        assert!(message.contains("mtu"));
    }

    #[test]
    fn test_handle_rejects_requests_outside_attempt() {
        let handle = AppTunnelHandle::new();
        let err = handle.report_failure("boom").unwrap_err();
        assert!(matches!(err, VpnctlError::InvalidState(_)));

        let mut rx = handle.attach(3);
        handle.report_failure("boom").unwrap();
        assert!(matches!(rx.try_recv(), Ok(AppMessage::Failure(_))));

        // A stale attempt does not release a newer one
        handle.detach(2);
        assert!(handle.is_active());
        handle.detach(3);
        assert!(!handle.is_active());
    }
}
