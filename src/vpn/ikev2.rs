//! IKEv2 driver: charon with a route-based XFRM interface

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

/// How the client authenticates to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum Ikev2Auth {
    Psk { psk: String },
    Cert(TokenCert),
    /// EAP-MSCHAPv2; the server proves itself with a certificate
    Eap { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ikev2Config {
    pub remote: String,
    #[serde(default)]
    pub local_id: Option<String>,
    #[serde(default)]
    pub remote_id: Option<String>,
    pub auth: Ikev2Auth,
    #[serde(default)]
    pub ca_certs: Vec<String>,
}

impl Ikev2Config {
    pub fn validate(&self) -> VpnctlResult<()> {
        validation::validate_hostname(&self.remote)?;
        match &self.auth {
            Ikev2Auth::Psk { psk } if psk.is_empty() => {
                Err(VpnctlError::InvalidParameter("IKEv2 PSK must not be empty".to_string()))
            }
            Ikev2Auth::Cert(cert) if cert.cert_id.is_empty() => {
                Err(VpnctlError::InvalidParameter("IKEv2 certificate id is required".to_string()))
            }
            Ikev2Auth::Eap { username, .. } if username.is_empty() => {
                Err(VpnctlError::InvalidParameter("EAP identity is required".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// swanctl parameters for a tunnel on XFRM interface `if_id`
    pub fn swanctl_params(&self, if_id: u32) -> SwanctlParams {
        let (local_auth, second_round) = match &self.auth {
            Ikev2Auth::Psk { psk } => (LocalAuth::Psk(psk.clone()), None),
            Ikev2Auth::Cert(cert) => (LocalAuth::Cert(cert.clone()), None),
            Ikev2Auth::Eap { username, password } => (
                LocalAuth::None,
                Some(SecondRound {
                    username: username.clone(),
                    password: password.clone(),
                }),
            ),
        };

        SwanctlParams {
            ike_version: IkeVersion::V2,
            remote: self.remote.clone(),
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
            local_auth,
            second_round,
            ca_certs: self.ca_certs.clone(),
            if_id: Some(if_id),
            l2tp_transport: false,
        }
    }
}

pub struct Ikev2Driver {
    ctx: DriverContext,
    config: Ikev2Config,
    attempt: Option<ActiveAttempt>,
    handler: Option<DriverEventHandler>,
    state: AttemptState,
}

impl Ikev2Driver {
    pub fn new(ctx: DriverContext, config: Ikev2Config) -> Self {
        Self {
            ctx,
            config,
            attempt: None,
            handler: None,
            state: AttemptState::default(),
        }
    }
}

/// Factory registered for [`VpnType::Ikev2`]
pub fn create_driver(ctx: &DriverContext, config: &DriverConfig) -> VpnctlResult<Box<dyn VpnDriver>> {
    match config {
        DriverConfig::Ikev2(config) => Ok(Box::new(Ikev2Driver::new(ctx.clone(), config.clone()))),
        other => Err(VpnctlError::InvalidParameter(format!(
            "IKEv2 driver cannot use a {} profile",
            other.vpn_type()
        ))),
    }
}

#[async_trait]
impl VpnDriver for Ikev2Driver {
    fn vpn_type(&self) -> VpnType {
        VpnType::Ikev2
    }

    async fn connect_async(&mut self, handler: DriverEventHandler) -> VpnctlResult<Option<Duration>> {
        self.disconnect().await;
        self.config
            .validate()
            .map_err(|e| VpnctlError::failure(ConnectFailure::InvalidConfig, e.detail()))?;

        self.ctx.metrics.driver_connecting(VpnType::Ikev2);
        let ipsec = &self.ctx.config.ipsec;
        let steps = IpsecConnection::new(
            self.ctx.clone(),
            self.config.swanctl_params(ipsec.xfrm_if_id),
            IpsecTunnel::Xfrm {
                if_id: ipsec.xfrm_if_id,
                interface_name: ipsec.xfrm_interface.clone(),
            },
        );
        info!("IKEv2: connecting to {}", self.config.remote);
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
        warn!("IKEv2: physical network {:?}, dropping the tunnel", event);
        self.disconnect().await;
        handler.on_failure(ConnectFailure::NetworkChange, format!("Default physical network {:?}", event));
    }
}
