//! VPN profiles stored as TOML
//!
//! ```toml
//! name = "office"
//!
//! [vpn]
//! type = "ikev2"
//! remote = "vpn.example.com"
//!
//! [vpn.auth]
//! method = "eap"
//! username = "alice"
//! password = "secret"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{VpnctlError, VpnctlResult};
use crate::validation;
use crate::vpn::app_tunnel::AppTunnelConfig;
use crate::vpn::bridge::BridgeConfig;
use crate::vpn::driver::VpnType;
use crate::vpn::ikev2::Ikev2Config;
use crate::vpn::l2tp_ipsec::L2tpIpsecConfig;
use crate::vpn::wireguard::WireGuardConfig;

/// Protocol specific settings of a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DriverConfig {
    #[serde(rename = "ikev2")]
    Ikev2(Ikev2Config),
    #[serde(rename = "l2tp-ipsec")]
    L2tpIpsec(L2tpIpsecConfig),
    #[serde(rename = "wireguard")]
    WireGuard(WireGuardConfig),
    #[serde(rename = "bridge")]
    Bridge(BridgeConfig),
    #[serde(rename = "app-tunnel")]
    AppTunnel(AppTunnelConfig),
}

impl DriverConfig {
    pub fn vpn_type(&self) -> VpnType {
        match self {
            DriverConfig::Ikev2(_) => VpnType::Ikev2,
            DriverConfig::L2tpIpsec(_) => VpnType::L2tpIpsec,
            DriverConfig::WireGuard(_) => VpnType::WireGuard,
            DriverConfig::Bridge(_) => VpnType::Bridge,
            DriverConfig::AppTunnel(_) => VpnType::AppTunnel,
        }
    }

    pub fn validate(&self) -> VpnctlResult<()> {
        match self {
            DriverConfig::Ikev2(config) => config.validate(),
            DriverConfig::L2tpIpsec(config) => config.validate(),
            DriverConfig::WireGuard(config) => config.validate(),
            DriverConfig::Bridge(config) => validation::validate_interface_name(&config.bridge),
            DriverConfig::AppTunnel(config) => validation::validate_interface_name(&config.interface_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnProfile {
    pub name: String,
    #[serde(rename = "vpn")]
    pub driver: DriverConfig,
}

impl VpnProfile {
    pub fn vpn_type(&self) -> VpnType {
        self.driver.vpn_type()
    }

    pub fn validate(&self) -> VpnctlResult<()> {
        if self.name.trim().is_empty() {
            return Err(VpnctlError::InvalidParameter("Profile name is required".to_string()));
        }
        self.driver.validate()
    }

    pub fn from_toml(content: &str) -> VpnctlResult<Self> {
        toml::from_str(content).map_err(|e| VpnctlError::ConfigError(format!("Invalid profile: {}", e)))
    }

    /// Load and validate a profile
    pub async fn load(path: &Path) -> VpnctlResult<Self> {
        debug!("Loading profile from {:?}", path);
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            VpnctlError::NotFound(format!("Profile {:?}: {}", path, e))
        })?;
        let profile = Self::from_toml(&content)?;
        profile.validate()?;
        info!("Loaded {} profile '{}'", profile.vpn_type(), profile.name);
        Ok(profile)
    }

    /// Write the profile, e.g. after keys were generated
    pub async fn save(&self, path: &Path) -> VpnctlResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let content = toml::to_string_pretty(self)
            .map_err(|e| VpnctlError::ConfigError(format!("Failed to serialize profile: {}", e)))?;
        tokio::fs::write(path, content).await?;
        // Profiles carry secrets
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        debug!("Saved profile '{}' to {:?}", self.name, path);
        Ok(())
    }
}
