//! Peer status from `wg show <if> dump`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub public_key: String,
    /// `None` until the first handshake
    pub latest_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub type PeerStatusMap = Arc<RwLock<HashMap<String, PeerStatus>>>;

/// Number of tab separated fields of a peer line
const PEER_FIELDS: usize = 8;

/// Parse the dump; the first line describes the interface and is skipped
///
/// Peer lines carry public key, preshared key, endpoint, allowed ips,
/// latest handshake, rx, tx and keepalive.
pub fn parse_dump(output: &str) -> Vec<PeerStatus> {
    let mut peers = Vec::new();
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != PEER_FIELDS {
            warn!("Unexpected wg dump line with {} fields", fields.len());
            continue;
        }

        let (Ok(handshake), Ok(rx_bytes), Ok(tx_bytes)) =
            (fields[4].parse::<i64>(), fields[5].parse::<u64>(), fields[6].parse::<u64>())
        else {
            warn!("Malformed wg dump line for peer {}", fields[0]);
            continue;
        };

        peers.push(PeerStatus {
            public_key: fields[0].to_string(),
            latest_handshake: match handshake {
                0 => None,
                secs => DateTime::<Utc>::from_timestamp(secs, 0),
            },
            rx_bytes,
            tx_bytes,
        });
    }
    peers
}

/// Replace the shared map with a fresh dump
pub async fn store(statuses: &PeerStatusMap, peers: Vec<PeerStatus>) {
    let mut map = statuses.write().await;
    map.clear();
    map.extend(peers.into_iter().map(|p| (p.public_key.clone(), p)));
}
