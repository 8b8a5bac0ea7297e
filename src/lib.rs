//! vpnctl - VPN Connection Library
//!
//! Async VPN connection management providing:
//! - Multi-step asynchronous connections with cancellation and cleanup
//! - IKEv2 and L2TP/IPsec tunnels driven through strongSwan and xl2tpd
//! - Kernel WireGuard tunnels
//! - Bridge and app-owned tunnels
//! - A service state machine with connect timeouts and reconnects
//!
//! Addresses, routes and DNS servers of an established tunnel are handed to a
//! [`NetworkConfigSink`]; physical network changes come from the
//! [`NetworkMonitor`].

pub mod error;
pub mod validation;
pub mod config;
pub mod process;
pub mod device;
pub mod network_config;
pub mod network_monitor;
pub mod metrics;
pub mod profile;
pub mod vpn;

// Re-export commonly used types
pub use error::{ConnectFailure, VpnctlError, VpnctlResult};
pub use config::VpnctlConfig;
pub use process::{CommandLauncher, ProcessLauncher, ProcessSpec};
pub use device::{DeviceFactory, IpLinkFactory, LinkInfo};
pub use network_config::{IpCommandSink, NetworkConfigSink, NetworkResult};
pub use network_monitor::{NetworkMonitor, PhysicalServiceEvent};
pub use metrics::{TracingMetrics, VpnMetrics};
pub use profile::{DriverConfig, VpnProfile};
pub use vpn::{
    AppTunnelHandle, DriverContext, ServiceState, VpnDriver, VpnDriverFactory,
    VpnManager, VpnService, VpnType,
};
