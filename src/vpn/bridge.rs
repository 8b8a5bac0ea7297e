//! Bridge driver: traffic leaves through an existing bridge, no daemon

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::info;

use crate::device::LinkInfo;
use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::network_config::NetworkResult;
use crate::network_monitor::PhysicalServiceEvent;
use crate::profile::DriverConfig;
use crate::validation;
use super::common::AttemptState;
use super::driver::{DriverContext, DriverEventHandler, VpnDriver, VpnType};

fn default_bridge() -> String {
    "arcbr0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default)]
    pub routes: Vec<IpNet>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge: default_bridge(),
            routes: Vec::new(),
            dns_servers: Vec::new(),
        }
    }
}

pub struct BridgeDriver {
    ctx: DriverContext,
    config: BridgeConfig,
    state: AttemptState,
}

impl BridgeDriver {
    pub fn new(ctx: DriverContext, config: BridgeConfig) -> Self {
        Self {
            ctx,
            config,
            state: AttemptState::default(),
        }
    }
}

/// Factory registered for [`VpnType::Bridge`]
pub fn create_driver(ctx: &DriverContext, config: &DriverConfig) -> VpnctlResult<Box<dyn VpnDriver>> {
    match config {
        DriverConfig::Bridge(config) => Ok(Box::new(BridgeDriver::new(ctx.clone(), config.clone()))),
        other => Err(VpnctlError::InvalidParameter(format!(
            "Bridge driver cannot use a {} profile",
            other.vpn_type()
        ))),
    }
}

#[async_trait]
impl VpnDriver for BridgeDriver {
    fn vpn_type(&self) -> VpnType {
        VpnType::Bridge
    }

    async fn connect_async(&mut self, handler: DriverEventHandler) -> VpnctlResult<Option<Duration>> {
        validation::validate_interface_name(&self.config.bridge)
            .map_err(|e| VpnctlError::failure(ConnectFailure::InvalidConfig, e.detail()))?;
        self.ctx.metrics.driver_connecting(VpnType::Bridge);

        let index = self.ctx.devices.link_index(&self.config.bridge).await.ok_or_else(|| {
            VpnctlError::failure(
                ConnectFailure::InvalidConfig,
                format!("Bridge {} does not exist", self.config.bridge),
            )
        })?;
        let link = LinkInfo {
            name: self.config.bridge.clone(),
            index,
        };

        let network = NetworkResult {
            dns_servers: self.config.dns_servers.clone(),
            included_routes: self.config.routes.clone(),
            ..Default::default()
        };
        self.state.set_connected(link.clone(), network).await;

        info!("Bridge: using {} (index {})", link.name, link.index);
        handler.on_connected(link);
        Ok(None)
    }

    async fn disconnect(&mut self) {
        self.state.clear().await;
    }

    async fn get_network_config(&self) -> Option<NetworkResult> {
        self.state.network().await
    }

    async fn on_default_physical_service_event(&mut self, _event: PhysicalServiceEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: BridgeConfig = toml::from_str("routes = [\"100.115.92.0/24\"]").unwrap();
        assert_eq!(config.bridge, "arcbr0");
        assert_eq!(config.routes.len(), 1);
        assert_eq!(BridgeConfig::default().bridge, "arcbr0");
    }
}
