//! RPC between the pppd plugin and the L2TP connection
//!
//! The plugin connects to the unix socket named in `VPNCTL_PPP_SOCKET` and
//! exchanges one JSON object per line. Every request carries the
//! `VPNCTL_PPP_TOKEN` of the attempt that launched xl2tpd; requests with any
//! other token are ignored.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::network_config::{default_routes, NetworkResult};

pub const ENV_PPP_SOCKET: &str = "VPNCTL_PPP_SOCKET";
pub const ENV_PPP_TOKEN: &str = "VPNCTL_PPP_TOKEN";

/// pppd exit codes for failed authentication
pub const EXIT_PEER_AUTH_FAILED: i32 = 11;
pub const EXIT_AUTH_TOPEER_FAILED: i32 = 19;

/// Dictionary keys sent with the `connect` notification
pub const KEY_INTERNAL_IP4_ADDRESS: &str = "INTERNAL_IP4_ADDRESS";
pub const KEY_EXTERNAL_IP4_ADDRESS: &str = "EXTERNAL_IP4_ADDRESS";
pub const KEY_GATEWAY_ADDRESS: &str = "GATEWAY_ADDRESS";
pub const KEY_DNS1: &str = "DNS1";
pub const KEY_DNS2: &str = "DNS2";
pub const KEY_INTERFACE_NAME: &str = "INTERFACE_NAME";
pub const KEY_LNS_ADDRESS: &str = "LNS_ADDRESS";
pub const KEY_MRU: &str = "MRU";
pub const KEY_EXIT_CODE: &str = "EXIT_CODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PppReason {
    Authenticating,
    Authenticated,
    Connect,
    Disconnect,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PppRequest {
    GetLogin {
        token: String,
    },
    Notify {
        token: String,
        reason: PppReason,
        #[serde(default)]
        dict: HashMap<String, String>,
    },
}

impl PppRequest {
    fn token(&self) -> &str {
        match self {
            PppRequest::GetLogin { token } | PppRequest::Notify { token, .. } => token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PppLogin {
    pub username: String,
    pub password: String,
}

/// Notification forwarded to the L2TP connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PppNotification {
    pub reason: PppReason,
    pub dict: HashMap<String, String>,
}

impl PppNotification {
    /// pppd exit status carried by an `exit` notification
    pub fn exit_code(&self) -> Option<i32> {
        self.dict.get(KEY_EXIT_CODE)?.parse().ok()
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.exit_code(),
            Some(EXIT_PEER_AUTH_FAILED) | Some(EXIT_AUTH_TOPEER_FAILED)
        )
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.dict.get(KEY_INTERFACE_NAME).map(String::as_str)
    }
}

/// Build the network configuration from a `connect` dictionary
pub fn network_from_ppp(dict: &HashMap<String, String>) -> NetworkResult {
    let ipv4 = |key: &str| dict.get(key).and_then(|v| v.parse::<Ipv4Addr>().ok());

    let mut result = NetworkResult {
        ipv4_address: ipv4(KEY_INTERNAL_IP4_ADDRESS).and_then(|a| Ipv4Net::new(a, 32).ok()),
        ipv4_gateway: ipv4(KEY_EXTERNAL_IP4_ADDRESS).or_else(|| ipv4(KEY_GATEWAY_ADDRESS)),
        mtu: dict.get(KEY_MRU).and_then(|v| v.parse().ok()),
        ..Default::default()
    };

    for key in [KEY_DNS1, KEY_DNS2] {
        if let Some(value) = dict.get(key) {
            match value.parse::<IpAddr>() {
                Ok(addr) if !result.dns_servers.contains(&addr) => result.dns_servers.push(addr),
                Ok(_) => {}
                Err(_) => warn!("Ignoring malformed {} '{}'", key, value),
            }
        }
    }

    result.included_routes = default_routes(true, false);
    // Keep the L2TP server reachable outside the tunnel
    if let Some(lns) = ipv4(KEY_LNS_ADDRESS).and_then(|a| Ipv4Net::new(a, 32).ok()) {
        result.excluded_routes.push(lns.into());
    }
    result
}

/// Serve plugin requests until the task is aborted
///
/// Each client gets its own task; client tasks end with this one.
pub async fn serve(
    listener: UnixListener,
    token: String,
    login: PppLogin,
    notifications: mpsc::UnboundedSender<PppNotification>,
) {
    let mut clients = JoinSet::new();
    loop {
        // Reap finished clients
        while clients.try_join_next().is_some() {}

        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("PPP RPC accept failed: {}", e);
                continue;
            }
        };
        let token = token.clone();
        let login = login.clone();
        let notifications = notifications.clone();
        clients.spawn(async move {
            if let Err(e) = handle_client(stream, &token, &login, &notifications).await {
                debug!("PPP RPC client ended: {}", e);
            }
        });
    }
}

async fn handle_client(
    stream: UnixStream,
    token: &str,
    login: &PppLogin,
    notifications: &mpsc::UnboundedSender<PppNotification>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let request: PppRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed PPP RPC request: {}", e);
                continue;
            }
        };

        if request.token() != token {
            debug!("Ignoring PPP RPC request with stale token");
            continue;
        }

        let reply = match request {
            PppRequest::GetLogin { .. } => serde_json::to_string(login)?,
            PppRequest::Notify { reason, dict, .. } => {
                debug!("PPP notification: {:?}", reason);
                if notifications.send(PppNotification { reason, dict }).is_err() {
                    debug!("Dropping PPP {:?} notification, connection is gone", reason);
                }
                "{}".to_string()
            }
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}
