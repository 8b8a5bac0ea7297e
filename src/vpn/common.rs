use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::device::LinkInfo;
use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::network_config::NetworkResult;
use super::connection::{AsyncConnection, ConnectionEvent, ConnectionState, ConnectionSteps};
use super::driver::DriverEventHandler;

/// Common VPN utility functions shared across all drivers

/// Create a private directory for one connect attempt
///
/// The directory and everything in it is removed when the `TempDir` drops.
pub fn create_attempt_dir(run_dir: &Path, prefix: &str) -> VpnctlResult<TempDir> {
    std::fs::create_dir_all(run_dir).map_err(|e| {
        VpnctlError::failure(
            ConnectFailure::ConfigWriteFailure,
            format!("Failed to create {:?}: {}", run_dir, e),
        )
    })?;

    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(run_dir)
        .map_err(|e| {
            VpnctlError::failure(
                ConnectFailure::ConfigWriteFailure,
                format!("Failed to create temp dir in {:?}: {}", run_dir, e),
            )
        })
}

/// Write configuration to a file with the given permissions
pub async fn write_secure_config(path: &Path, content: &str, permissions: u32) -> VpnctlResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let write_failure = |e: std::io::Error| {
        VpnctlError::failure(
            ConnectFailure::ConfigWriteFailure,
            format!("Failed to write {:?}: {}", path, e),
        )
    };

    tokio::fs::write(path, content).await.map_err(write_failure)?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(permissions))
        .await
        .map_err(write_failure)?;

    debug!("Wrote config to {:?} with permissions {:o}", path, permissions);
    Ok(())
}

/// Link and network configuration of the current attempt, shared between a
/// driver and its event forwarder
#[derive(Debug, Clone, Default)]
pub struct AttemptState {
    network: Arc<RwLock<Option<NetworkResult>>>,
    link: Arc<RwLock<Option<LinkInfo>>>,
}

impl AttemptState {
    pub async fn network(&self) -> Option<NetworkResult> {
        self.network.read().await.clone()
    }

    pub async fn link(&self) -> Option<LinkInfo> {
        self.link.read().await.clone()
    }

    pub async fn set_connected(&self, link: LinkInfo, network: NetworkResult) {
        *self.network.write().await = Some(network);
        *self.link.write().await = Some(link);
    }

    pub async fn clear(&self) {
        *self.network.write().await = None;
        *self.link.write().await = None;
    }
}

/// Relay connection events to the service as driver events
///
/// The network configuration is stored before `Connected` is reported so
/// that `get_network_config` is ready when the service asks for it.
pub fn forward_connection_events(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    handler: DriverEventHandler,
    state: AttemptState,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected { link, network } => {
                    state.set_connected(link.clone(), network).await;
                    handler.on_connected(link);
                }
                ConnectionEvent::Failure { reason, detail } => {
                    state.clear().await;
                    handler.on_failure(reason, detail);
                }
                ConnectionEvent::Stopped => state.clear().await,
            }
        }
    })
}

/// A running connection and the task relaying its events
pub struct ActiveAttempt {
    connection: AsyncConnection,
    forwarder: JoinHandle<()>,
}

impl ActiveAttempt {
    pub fn start<S: ConnectionSteps>(steps: S, handler: DriverEventHandler, state: AttemptState) -> Self {
        let (connection, events) = AsyncConnection::connect(steps);
        let forwarder = forward_connection_events(events, handler, state);
        Self { connection, forwarder }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Disconnect and wait until the final event has been relayed
    pub async fn stop(mut self) {
        self.connection.disconnect().await;
        if let Err(e) = self.forwarder.await {
            debug!("Event forwarder for {} ended abnormally: {}", self.connection.name(), e);
        }
    }
}
