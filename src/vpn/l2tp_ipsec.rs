//! L2TP/IPsec driver: IKEv1 transport SA carrying xl2tpd/pppd

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::network_config::NetworkResult;
use crate::network_monitor::PhysicalServiceEvent;
use crate::profile::DriverConfig;
use crate::validation;
use super::common::{ActiveAttempt, AttemptState};
use super::driver::{DriverContext, DriverEventHandler, VpnDriver, VpnType};
use super::ipsec::strongswan::{IkeVersion, LocalAuth, SecondRound, SwanctlParams, TokenCert};
use super::ipsec::{IpsecConnection, IpsecTunnel};
use super::l2tp::L2tpConfig;

/// Machine authentication of the IPsec layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum IpsecAuth {
    Psk { psk: String },
    Cert(TokenCert),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XauthCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2tpIpsecConfig {
    pub remote: String,
    pub auth: IpsecAuth,
    #[serde(default)]
    pub local_id: Option<String>,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub ca_certs: Vec<String>,
    #[serde(default)]
    pub xauth: Option<XauthCredentials>,
    pub l2tp: L2tpConfig,
}

impl L2tpIpsecConfig {
    pub fn validate(&self) -> VpnctlResult<()> {
        validation::validate_hostname(&self.remote)?;
        match &self.auth {
            IpsecAuth::Psk { psk } if psk.is_empty() => {
                return Err(VpnctlError::InvalidParameter("IPsec PSK must not be empty".to_string()));
            }
            IpsecAuth::Cert(cert) if cert.cert_id.is_empty() => {
                return Err(VpnctlError::InvalidParameter("IPsec certificate id is required".to_string()));
            }
            _ => {}
        }
        if let Some(xauth) = &self.xauth {
            if xauth.username.is_empty() {
                return Err(VpnctlError::InvalidParameter("XAUTH username is required".to_string()));
            }
        }
        self.l2tp.validate()
    }

    pub fn swanctl_params(&self) -> SwanctlParams {
        SwanctlParams {
            ike_version: IkeVersion::V1,
            remote: self.remote.clone(),
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
            local_auth: match &self.auth {
                IpsecAuth::Psk { psk } => LocalAuth::Psk(psk.clone()),
                IpsecAuth::Cert(cert) => LocalAuth::Cert(cert.clone()),
            },
            second_round: self.xauth.as_ref().map(|x| SecondRound {
                username: x.username.clone(),
                password: x.password.clone(),
            }),
            ca_certs: self.ca_certs.clone(),
            if_id: None,
            l2tp_transport: true,
        }
    }
}

pub struct L2tpIpsecDriver {
    ctx: DriverContext,
    config: L2tpIpsecConfig,
    attempt: Option<ActiveAttempt>,
    handler: Option<DriverEventHandler>,
    state: AttemptState,
}

impl L2tpIpsecDriver {
    pub fn new(ctx: DriverContext, config: L2tpIpsecConfig) -> Self {
        Self {
            ctx,
            config,
            attempt: None,
            handler: None,
            state: AttemptState::default(),
        }
    }
}

/// Factory registered for [`VpnType::L2tpIpsec`]
pub fn create_driver(ctx: &DriverContext, config: &DriverConfig) -> VpnctlResult<Box<dyn VpnDriver>> {
    match config {
        DriverConfig::L2tpIpsec(config) => Ok(Box::new(L2tpIpsecDriver::new(ctx.clone(), config.clone()))),
        other => Err(VpnctlError::InvalidParameter(format!(
            "L2TP/IPsec driver cannot use a {} profile",
            other.vpn_type()
        ))),
    }
}

#[async_trait]
impl VpnDriver for L2tpIpsecDriver {
    fn vpn_type(&self) -> VpnType {
        VpnType::L2tpIpsec
    }

    async fn connect_async(&mut self, handler: DriverEventHandler) -> VpnctlResult<Option<Duration>> {
        self.disconnect().await;
        self.config
            .validate()
            .map_err(|e| VpnctlError::failure(ConnectFailure::InvalidConfig, e.detail()))?;

        self.ctx.metrics.driver_connecting(VpnType::L2tpIpsec);
        let steps = IpsecConnection::new(
            self.ctx.clone(),
            self.config.swanctl_params(),
            IpsecTunnel::L2tp(self.config.l2tp.clone()),
        );
        info!("L2TP/IPsec: connecting to {}", self.config.remote);
        self.attempt = Some(ActiveAttempt::start(steps, handler.clone(), self.state.clone()));
        self.handler = Some(handler);
        Ok(Some(Duration::from_secs(self.ctx.config.timeouts.ipsec_connect_secs)))
    }

    async fn disconnect(&mut self) {
        self.handler = None;
        if let Some(attempt) = self.attempt.take() {
            attempt.stop().await;
        }
        self.state.clear().await;
    }

    async fn get_network_config(&self) -> Option<NetworkResult> {
        self.state.network().await
    }

    async fn on_default_physical_service_event(&mut self, event: PhysicalServiceEvent) {
        if event == PhysicalServiceEvent::Up || self.attempt.is_none() {
            return;
        }
        let Some(handler) = self.handler.clone() else {
            return;
        };
        warn!("L2TP/IPsec: physical network {:?}, dropping the tunnel", event);
        self.disconnect().await;
        handler.on_failure(ConnectFailure::NetworkChange, format!("Default physical network {:?}", event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
        remote = "203.0.113.1"
        [auth]
        method = "psk"
        psk = "secret"
        [xauth]
        username = "bob"
        password = "pw"
        [l2tp]
        username = "alice"
        password = "secret"
    "#;

    #[test]
    fn test_profile_parses_with_l2tp_defaults() {
        let config: L2tpIpsecConfig = toml::from_str(PROFILE).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.l2tp.require_chap);
        assert!(config.l2tp.length_bit);
        assert!(!config.l2tp.lcp_echo_disabled);
    }

    #[test]
    fn test_swanctl_params() {
        let config: L2tpIpsecConfig = toml::from_str(PROFILE).unwrap();
        let params = config.swanctl_params();
        assert_eq!(params.ike_version, IkeVersion::V1);
        assert_eq!(params.local_auth, LocalAuth::Psk("secret".to_string()));
        assert_eq!(params.second_round.map(|r| r.username), Some("bob".to_string()));
        assert!(params.l2tp_transport);
        assert_eq!(params.if_id, None);
    }

    #[test]
    fn test_validate_rejects_missing_l2tp_user() {
        let mut config: L2tpIpsecConfig = toml::from_str(PROFILE).unwrap();
        config.l2tp.username.clear();
        assert!(config.validate().is_err());
    }
}
