//! VPN Module for vpnctl
//!
//! Drivers establish tunnels through ordered connection steps and report to a
//! service that owns their lifecycle:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │     VpnManager  ->  VpnService (FSM)     │
//! └────────────────────┬─────────────────────┘
//!                      │ VpnDriver
//!    ┌─────────┬───────┴───┬──────────┬────────────┐
//!    ▼         ▼           ▼          ▼            ▼
//! ┌───────┐ ┌────────┐ ┌───────┐ ┌────────┐ ┌────────────┐
//! │ IKEv2 │ │L2TP/IPs│ │  WG   │ │ Bridge │ │ App tunnel │
//! └───┬───┘ └───┬────┘ └───┬───┘ └────────┘ └─────┬──────┘
//!     └─────────┴──────────┴─────────────────────┘
//!                AsyncConnection (steps)
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn example(ctx: libvpnctl::DriverContext, profile: libvpnctl::VpnProfile)
//! #     -> libvpnctl::VpnctlResult<()> {
//! use std::sync::Arc;
//! use libvpnctl::{IpCommandSink, VpnManager};
//!
//! let sink = Arc::new(IpCommandSink::new("/run/crrouter/vpnctl"));
//! let manager = VpnManager::with_default_drivers(ctx, sink);
//! let mut service = manager.create_service(&profile)?;
//! service.connect().await?;
//! while service.process_next_event().await {}
//! # Ok(())
//! # }
//! ```

pub mod app_tunnel;
pub mod bridge;
pub mod common;
pub mod connection;
pub mod driver;
pub mod ikev2;
pub mod ipsec;
pub mod l2tp;
pub mod l2tp_ipsec;
pub mod manager;
pub mod ppp;
pub mod service;
pub mod wireguard;

pub use app_tunnel::AppTunnelHandle;
pub use connection::{AsyncConnection, ConnectionEvent, ConnectionState};
pub use driver::{DriverContext, DriverEvent, DriverEventHandler, VpnDriver, VpnDriverFactory, VpnType};
pub use manager::VpnManager;
pub use service::{ServiceState, VpnService};
