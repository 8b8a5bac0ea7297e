//! WireGuard peers and the `wg setconf` configuration format

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{VpnctlError, VpnctlResult};
use crate::validation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
}

impl PeerEntry {
    /// Key and endpoint syntax
    pub fn validate(&self) -> VpnctlResult<()> {
        validation::validate_wireguard_key(&self.public_key)?;
        if let Some(psk) = &self.preshared_key {
            validation::validate_wireguard_key(psk)?;
        }
        if let Some(endpoint) = &self.endpoint {
            validation::validate_endpoint(endpoint)?;
        }
        Ok(())
    }
}

/// Every peer has a public key and no key appears twice
pub fn validate_peers(peers: &[PeerEntry]) -> VpnctlResult<()> {
    let mut seen = HashSet::new();
    for peer in peers {
        if peer.public_key.is_empty() {
            return Err(VpnctlError::InvalidParameter("Peer public key is empty".to_string()));
        }
        if !seen.insert(peer.public_key.as_str()) {
            return Err(VpnctlError::InvalidParameter(format!(
                "Duplicate peer public key {}",
                peer.public_key
            )));
        }
    }
    Ok(())
}

/// Peers of a WireGuard profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSet {
    peers: Vec<PeerEntry>,
}

impl PeerSet {
    pub fn new(peers: Vec<PeerEntry>) -> VpnctlResult<Self> {
        validate_peers(&peers)?;
        Ok(Self { peers })
    }

    /// Replace all peers; an invalid set leaves the current one untouched
    pub fn set_peers(&mut self, peers: Vec<PeerEntry>) -> VpnctlResult<()> {
        validate_peers(&peers)?;
        self.peers = peers;
        Ok(())
    }

    pub fn peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Union of all allowed IPs in peer order
    pub fn allowed_ips(&self) -> Vec<IpNet> {
        let mut union: Vec<IpNet> = Vec::new();
        for net in self.peers.iter().flat_map(|p| p.allowed_ips.iter()) {
            if !union.contains(net) {
                union.push(*net);
            }
        }
        union
    }

    pub fn has_default_route(&self) -> bool {
        self.allowed_ips().iter().any(|net| net.prefix_len() == 0)
    }
}

/// Render the configuration consumed by `wg setconf`
pub fn render_config(private_key: &str, fwmark: u32, peers: &[PeerEntry]) -> String {
    let mut out = String::from("[Interface]\n");
    out.push_str(&format!("PrivateKey={}\n", private_key));
    out.push_str(&format!("FwMark=0x{:x}\n", fwmark));

    for peer in peers {
        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey={}\n", peer.public_key));
        if let Some(psk) = &peer.preshared_key {
            out.push_str(&format!("PresharedKey={}\n", psk));
        }
        if let Some(endpoint) = &peer.endpoint {
            out.push_str(&format!("Endpoint={}\n", endpoint));
        }
        if !peer.allowed_ips.is_empty() {
            let ips: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();
            out.push_str(&format!("AllowedIPs={}\n", ips.join(",")));
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            out.push_str(&format!("PersistentKeepalive={}\n", keepalive));
        }
    }
    out
}
