use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::VpnctlConfig;
use crate::device::{DeviceFactory, LinkInfo};
use crate::error::{ConnectFailure, VpnctlResult};
use crate::metrics::VpnMetrics;
use crate::network_config::NetworkResult;
use crate::network_monitor::PhysicalServiceEvent;
use crate::process::ProcessLauncher;

/// VPN protocols a profile can select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VpnType {
    #[serde(rename = "ikev2")]
    Ikev2,
    #[serde(rename = "l2tp-ipsec")]
    L2tpIpsec,
    #[serde(rename = "wireguard")]
    WireGuard,
    #[serde(rename = "bridge")]
    Bridge,
    #[serde(rename = "app-tunnel")]
    AppTunnel,
}

impl fmt::Display for VpnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VpnType::Ikev2 => "ikev2",
            VpnType::L2tpIpsec => "l2tp-ipsec",
            VpnType::WireGuard => "wireguard",
            VpnType::Bridge => "bridge",
            VpnType::AppTunnel => "app-tunnel",
        };
        f.write_str(name)
    }
}

/// Event a driver reports to its service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Tunnel is up on `link`; the configuration is in `get_network_config`
    Connected { link: LinkInfo },
    Failure { reason: ConnectFailure, detail: String },
    /// Tunnel is temporarily unusable; `None` disables the connect timeout
    Reconnecting { timeout: Option<Duration> },
}

/// Per-attempt event sink handed to a driver
///
/// Events are tagged with the attempt's generation so the service can drop
/// those from superseded attempts.
#[derive(Debug, Clone)]
pub struct DriverEventHandler {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, DriverEvent)>,
}

impl DriverEventHandler {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, DriverEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn on_connected(&self, link: LinkInfo) {
        self.send(DriverEvent::Connected { link });
    }

    pub fn on_failure(&self, reason: ConnectFailure, detail: impl Into<String>) {
        self.send(DriverEvent::Failure {
            reason,
            detail: detail.into(),
        });
    }

    pub fn on_reconnecting(&self, timeout: Option<Duration>) {
        self.send(DriverEvent::Reconnecting { timeout });
    }

    fn send(&self, event: DriverEvent) {
        if self.tx.send((self.generation, event)).is_err() {
            debug!("Service gone, dropping driver event");
        }
    }
}

/// Shared collaborators every driver is built with
#[derive(Clone)]
pub struct DriverContext {
    pub config: Arc<VpnctlConfig>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub devices: Arc<dyn DeviceFactory>,
    pub metrics: Arc<dyn VpnMetrics>,
}

/// Common interface of all VPN drivers
#[async_trait]
pub trait VpnDriver: Send {
    fn vpn_type(&self) -> VpnType;

    /// Start a connect attempt; returns the connect timeout to arm
    async fn connect_async(&mut self, handler: DriverEventHandler) -> VpnctlResult<Option<Duration>>;

    /// Tear down the current attempt; safe to call at any time
    async fn disconnect(&mut self);

    /// Configuration of the connected tunnel
    async fn get_network_config(&self) -> Option<NetworkResult>;

    async fn on_default_physical_service_event(&mut self, event: PhysicalServiceEvent);

    /// Called when the connect timeout expires, before the service fails
    async fn on_connect_timeout(&mut self) {
        self.disconnect().await;
    }
}

/// Factory function type for creating VPN drivers from a profile
pub type VpnDriverFactory = fn(&DriverContext, &crate::profile::DriverConfig) -> VpnctlResult<Box<dyn VpnDriver>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpn_type_names() {
        assert_eq!(VpnType::WireGuard.to_string(), "wireguard");
        assert_eq!(VpnType::L2tpIpsec.to_string(), "l2tp-ipsec");
        assert_eq!(serde_json::to_string(&VpnType::AppTunnel).unwrap(), "\"app-tunnel\"");
    }

    #[tokio::test]
    async fn test_handler_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = DriverEventHandler::new(4, tx);
        handler.on_failure(ConnectFailure::NetworkChange, "default route moved");

        let (generation, event) = rx.recv().await.unwrap();
        assert_eq!(generation, 4);
        assert_eq!(
            event,
            DriverEvent::Failure {
                reason: ConnectFailure::NetworkChange,
                detail: "default route moved".to_string()
            }
        );
    }
}
