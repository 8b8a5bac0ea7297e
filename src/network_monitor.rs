//! Default physical network monitoring
//!
//! Watches rtnetlink link and route notifications and re-evaluates which
//! physical interface carries the IPv4 default route. Transitions are
//! published as [`PhysicalServiceEvent`]s for the active VPN service.

use crate::error::{VpnctlError, VpnctlResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Change of the default physical service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhysicalServiceEvent {
    /// A default physical service appeared
    Up,
    /// The default physical service went away
    Down,
    /// The default moved to a different physical service
    Changed,
}

/// Interface prefixes that belong to tunnels rather than physical services
const VPN_LINK_PREFIXES: &[&str] = &["wg", "xfrm", "ppp", "tun", "arc_"];

/// Interface carrying the IPv4 default route in a `/proc/net/route` table
///
/// The lowest metric wins. Tunnel links are skipped.
pub fn parse_default_route_interface(table: &str) -> Option<String> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            if fields[1] != "00000000" || fields[7] != "00000000" {
                return None;
            }
            let iface = fields[0];
            if VPN_LINK_PREFIXES.iter().any(|p| iface.starts_with(p)) {
                return None;
            }
            let metric = fields[6].parse::<u32>().ok()?;
            Some((metric, iface.to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}

/// Event for a change of the default interface, if any
pub fn classify_transition(previous: Option<&str>, next: Option<&str>) -> Option<PhysicalServiceEvent> {
    match (previous, next) {
        (None, Some(_)) => Some(PhysicalServiceEvent::Up),
        (Some(_), None) => Some(PhysicalServiceEvent::Down),
        (Some(a), Some(b)) if a != b => Some(PhysicalServiceEvent::Changed),
        _ => None,
    }
}

/// Network monitor that tracks the default physical interface
pub struct NetworkMonitor {
    event_tx: broadcast::Sender<PhysicalServiceEvent>,
    running: Arc<RwLock<bool>>,
    route_table: PathBuf,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::with_route_table("/proc/net/route")
    }

    /// Monitor reading the route table from another location
    pub fn with_route_table(route_table: impl Into<PathBuf>) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            event_tx,
            running: Arc::new(RwLock::new(false)),
            route_table: route_table.into(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhysicalServiceEvent> {
        self.event_tx.subscribe()
    }

    /// Start monitoring in a background task
    pub async fn start(&self) -> VpnctlResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(VpnctlError::InvalidState("Network monitor already running".to_string()));
        }
        *running = true;
        drop(running);

        let tracker = DefaultRouteTracker {
            event_tx: self.event_tx.clone(),
            route_table: self.route_table.clone(),
            current: read_default_interface(&self.route_table).await,
        };
        info!("Starting network monitor (default interface: {:?})", tracker.current);

        let running = self.running.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::monitor_loop(tracker, running).await {
                error!("Network monitor error: {}", e);
            }
        });

        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("Stopped network monitor");
    }

    async fn monitor_loop(mut tracker: DefaultRouteTracker, running: Arc<RwLock<bool>>) -> VpnctlResult<()> {
        #[cfg(target_os = "linux")]
        {
            if let Err(e) = Self::monitor_with_netlink(&mut tracker, running.clone()).await {
                warn!("Netlink monitoring failed: {}, falling back to polling", e);
                Self::monitor_with_polling(&mut tracker, running).await;
            }
        }

        #[cfg(not(target_os = "linux"))]
        Self::monitor_with_polling(&mut tracker, running).await;

        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn monitor_with_netlink(tracker: &mut DefaultRouteTracker, running: Arc<RwLock<bool>>) -> VpnctlResult<()> {
        use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

        let netlink_err = |what: &str, e: std::io::Error| {
            VpnctlError::NotSupported(format!("{}: {}", what, e))
        };

        let mut socket = Socket::new(NETLINK_ROUTE).map_err(|e| netlink_err("Failed to create netlink socket", e))?;
        socket
            .bind(&SocketAddr::new(0, 0))
            .map_err(|e| netlink_err("Failed to bind netlink socket", e))?;

        const RTNLGRP_LINK: u32 = 1;
        const RTNLGRP_IPV4_ROUTE: u32 = 7;
        socket
            .add_membership(RTNLGRP_LINK)
            .map_err(|e| netlink_err("Failed to join RTNLGRP_LINK", e))?;
        socket
            .add_membership(RTNLGRP_IPV4_ROUTE)
            .map_err(|e| netlink_err("Failed to join RTNLGRP_IPV4_ROUTE", e))?;
        socket
            .set_non_blocking(true)
            .map_err(|e| netlink_err("Failed to set non-blocking", e))?;

        #[allow(deprecated)]
        let async_fd = tokio::io::unix::AsyncFd::new(socket)?;
        let mut buf = vec![0u8; 16384];
        debug!("Listening for link and route notifications");

        while *running.read().await {
            let mut guard = match tokio::time::timeout(Duration::from_secs(1), async_fd.readable()).await {
                Ok(Ok(guard)) => guard,
                Ok(Err(e)) => {
                    error!("AsyncFd error: {}", e);
                    continue;
                }
                // Re-check the running flag
                Err(_) => continue,
            };

            match guard.get_inner().recv(&mut buf, 0) {
                Ok(len) if len > 0 => {
                    if carries_topology_change(&buf[..len]) {
                        tracker.reevaluate().await;
                    }
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("Error receiving netlink message: {}", e),
            }

            guard.clear_ready();
        }

        Ok(())
    }

    async fn monitor_with_polling(tracker: &mut DefaultRouteTracker, running: Arc<RwLock<bool>>) {
        info!("Polling {:?} for default route changes", tracker.route_table);
        while *running.read().await {
            tokio::time::sleep(Duration::from_secs(2)).await;
            tracker.reevaluate().await;
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

struct DefaultRouteTracker {
    event_tx: broadcast::Sender<PhysicalServiceEvent>,
    route_table: PathBuf,
    current: Option<String>,
}

impl DefaultRouteTracker {
    async fn reevaluate(&mut self) {
        let next = read_default_interface(&self.route_table).await;
        if let Some(event) = classify_transition(self.current.as_deref(), next.as_deref()) {
            info!("Default physical interface {:?} -> {:?} ({:?})", self.current, next, event);
            // No subscribers is fine
            let _ = self.event_tx.send(event);
        }
        self.current = next;
    }
}

async fn read_default_interface(route_table: &Path) -> Option<String> {
    match tokio::fs::read_to_string(route_table).await {
        Ok(table) => parse_default_route_interface(&table),
        Err(e) => {
            debug!("Failed to read {:?}: {}", route_table, e);
            None
        }
    }
}

/// Whether a netlink datagram contains link or route updates
#[cfg(target_os = "linux")]
fn carries_topology_change(data: &[u8]) -> bool {
    use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
    use netlink_packet_route::RouteNetlinkMessage;

    let mut offset = 0;
    let mut relevant = false;
    while offset < data.len() {
        let msg: NetlinkMessage<RouteNetlinkMessage> = match NetlinkMessage::deserialize(&data[offset..]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Failed to parse netlink message: {}", e);
                break;
            }
        };

        let msg_len = msg.header.length as usize;
        if msg_len == 0 {
            break;
        }

        if let NetlinkPayload::InnerMessage(inner) = &msg.payload {
            relevant |= matches!(
                inner,
                RouteNetlinkMessage::NewLink(_)
                    | RouteNetlinkMessage::DelLink(_)
                    | RouteNetlinkMessage::NewRoute(_)
                    | RouteNetlinkMessage::DelRoute(_)
            );
        }

        offset += msg_len;
    }
    relevant
}
