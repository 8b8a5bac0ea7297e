//! Connection metrics call sites
//!
//! Drivers report what they negotiated through [`VpnMetrics`]. The daemon
//! uses [`TracingMetrics`], which emits structured events under the
//! `vpnctl::metrics` target.

use crate::error::ConnectFailure;
use crate::vpn::driver::VpnType;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Cipher suite negotiated for an IKE or ESP security association
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherSuite {
    pub encryption: Option<String>,
    pub integrity: Option<String>,
    pub dh_group: Option<String>,
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |p: &Option<String>| p.clone().unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{}/{}/{}",
            part(&self.encryption),
            part(&self.integrity),
            part(&self.dh_group)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllowedIpsType {
    HasDefaultRoute,
    NoDefaultRoute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    Ipv4Only,
    Ipv6Only,
    DualStack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPairSource {
    /// Generated by the manager
    Generated,
    /// Supplied with the profile
    UserInput,
}

/// What a WireGuard connect attempt looked like
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardReport {
    pub allowed_ips: AllowedIpsType,
    pub peer_count: usize,
    pub address_type: AddressType,
    pub key_source: KeyPairSource,
}

pub trait VpnMetrics: Send + Sync {
    fn driver_connecting(&self, vpn_type: VpnType);
    fn driver_connected(&self, vpn_type: VpnType);
    fn connect_failed(&self, vpn_type: VpnType, reason: ConnectFailure);
    fn ipsec_ciphers(&self, ike: &CipherSuite, esp: &CipherSuite);
    fn wireguard_report(&self, report: &WireGuardReport);
}

/// Metrics sink writing structured tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl VpnMetrics for TracingMetrics {
    fn driver_connecting(&self, vpn_type: VpnType) {
        info!(target: "vpnctl::metrics", vpn_type = %vpn_type, "connecting");
    }

    fn driver_connected(&self, vpn_type: VpnType) {
        info!(target: "vpnctl::metrics", vpn_type = %vpn_type, "connected");
    }

    fn connect_failed(&self, vpn_type: VpnType, reason: ConnectFailure) {
        info!(target: "vpnctl::metrics", vpn_type = %vpn_type, reason = %reason, "connect failed");
    }

    fn ipsec_ciphers(&self, ike: &CipherSuite, esp: &CipherSuite) {
        info!(target: "vpnctl::metrics", ike = %ike, esp = %esp, "ipsec ciphers");
    }

    fn wireguard_report(&self, report: &WireGuardReport) {
        info!(
            target: "vpnctl::metrics",
            allowed_ips = ?report.allowed_ips,
            peers = report.peer_count,
            address_type = ?report.address_type,
            key_source = ?report.key_source,
            "wireguard"
        );
    }
}
