//! VPN service state machine
//!
//! A service owns one driver. It turns driver events into service states,
//! publishes the tunnel's network configuration through a
//! [`NetworkConfigSink`] and enforces the driver's connect timeout.
//!
//! ```text
//! Idle -> Associating -> Configuring -> Connected -> Online
//!              ^                                       |
//!              +------------ Reconnecting -------------+
//! any active state -> Failure(reason)
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::metrics::VpnMetrics;
use crate::network_config::NetworkConfigSink;
use crate::network_monitor::PhysicalServiceEvent;
use super::driver::{DriverEvent, DriverEventHandler, VpnDriver, VpnType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Associating,
    Configuring,
    Connected,
    Online,
    Failure(ConnectFailure),
}

impl ServiceState {
    /// Whether an attempt is in progress or established
    pub fn is_active(&self) -> bool {
        !matches!(self, ServiceState::Idle | ServiceState::Failure(_))
    }
}

/// Something the service has to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Driver { generation: u64, event: DriverEvent },
    ConnectTimeout,
}

pub struct VpnService {
    name: String,
    driver: Box<dyn VpnDriver>,
    sink: Arc<dyn NetworkConfigSink>,
    metrics: Arc<dyn VpnMetrics>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<(u64, DriverEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, DriverEvent)>,
    deadline: Option<Instant>,
    state: watch::Sender<ServiceState>,
    /// Link the network configuration was applied to
    applied_link: Option<String>,
}

impl VpnService {
    pub fn new(
        name: impl Into<String>,
        driver: Box<dyn VpnDriver>,
        sink: Arc<dyn NetworkConfigSink>,
        metrics: Arc<dyn VpnMetrics>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ServiceState::Idle);
        Self {
            name: name.into(),
            driver,
            sink,
            metrics,
            generation: 0,
            events_tx,
            events_rx,
            deadline: None,
            state,
            applied_link: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vpn_type(&self) -> VpnType {
        self.driver.vpn_type()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Whether a connect timeout is armed
    pub fn timeout_armed(&self) -> bool {
        self.deadline.is_some()
    }

    fn set_state(&self, state: ServiceState) {
        debug!("{}: {:?} -> {:?}", self.name, self.state(), state);
        self.state.send_replace(state);
    }

    fn arm_timeout(&mut self, timeout: Option<Duration>) {
        self.deadline = timeout.map(|t| Instant::now() + t);
        if let Some(t) = timeout {
            debug!("{}: connect timeout armed for {:?}", self.name, t);
        }
    }

    /// Start a new attempt from Idle or Failure
    pub async fn connect(&mut self) -> VpnctlResult<()> {
        if self.state().is_active() {
            return Err(VpnctlError::InvalidState(format!(
                "{} is already {:?}",
                self.name,
                self.state()
            )));
        }

        self.generation += 1;
        info!("{}: connecting ({})", self.name, self.driver.vpn_type());
        self.set_state(ServiceState::Associating);

        let handler = DriverEventHandler::new(self.generation, self.events_tx.clone());
        match self.driver.connect_async(handler).await {
            Ok(timeout) => {
                self.arm_timeout(timeout);
                Ok(())
            }
            Err(e) => {
                self.fail(e.connect_failure(), e.detail()).await;
                Err(e)
            }
        }
    }

    /// Tear down the current attempt and return to Idle
    pub async fn disconnect(&mut self) {
        self.generation += 1;
        self.deadline = None;
        if self.state().is_active() {
            info!("{}: disconnecting", self.name);
        }
        self.driver.disconnect().await;
        self.withdraw().await;
        self.set_state(ServiceState::Idle);
    }

    /// Forward a default physical network change to the driver
    pub async fn on_physical_event(&mut self, event: PhysicalServiceEvent) {
        if !self.state().is_active() {
            return;
        }
        debug!("{}: physical network {:?}", self.name, event);
        self.driver.on_default_physical_service_event(event).await;
    }

    /// Wait for the next driver event or the connect timeout
    ///
    /// Cancel safe; pair with [`handle_event`](Self::handle_event).
    pub async fn next_event(&mut self) -> ServiceEvent {
        let received = match self.deadline {
            Some(deadline) => tokio::select! {
                received = self.events_rx.recv() => received,
                _ = tokio::time::sleep_until(deadline) => return ServiceEvent::ConnectTimeout,
            },
            None => self.events_rx.recv().await,
        };
        match received {
            Some((generation, event)) => ServiceEvent::Driver { generation, event },
            // The service holds a sender, so the channel never closes
            None => std::future::pending().await,
        }
    }

    pub async fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::ConnectTimeout => self.on_connect_timeout().await,
            ServiceEvent::Driver { generation, .. } if generation != self.generation => {
                debug!("{}: dropping event of superseded attempt {}", self.name, generation);
            }
            ServiceEvent::Driver { event, .. } => match event {
                DriverEvent::Connected { link } => self.on_connected(link.name).await,
                DriverEvent::Failure { reason, detail } => {
                    if self.state().is_active() {
                        self.fail(reason, detail).await;
                    }
                }
                DriverEvent::Reconnecting { timeout } => {
                    if self.state().is_active() {
                        info!("{}: reconnecting", self.name);
                        self.set_state(ServiceState::Associating);
                        self.arm_timeout(timeout);
                    }
                }
            },
        }
    }

    /// Handle one event; returns false right away when no attempt is active
    pub async fn process_next_event(&mut self) -> bool {
        if !self.state().is_active() {
            return false;
        }
        let event = self.next_event().await;
        self.handle_event(event).await;
        true
    }

    async fn on_connected(&mut self, link: String) {
        if self.state() != ServiceState::Associating {
            debug!("{}: ignoring Connected in {:?}", self.name, self.state());
            return;
        }
        self.deadline = None;
        self.set_state(ServiceState::Configuring);

        let Some(network) = self.driver.get_network_config().await else {
            self.fail(ConnectFailure::InternalFailure, "Driver reported no network configuration")
                .await;
            return;
        };

        if let Err(e) = self.sink.apply(&link, &network).await {
            self.fail(e.connect_failure(), format!("Failed to configure {}: {}", link, e.detail()))
                .await;
            return;
        }
        self.applied_link = Some(link.clone());
        self.set_state(ServiceState::Connected);

        self.set_state(ServiceState::Online);
        self.metrics.driver_connected(self.driver.vpn_type());
        info!("{}: online on {}", self.name, link);
    }

    async fn on_connect_timeout(&mut self) {
        if self.deadline.take().is_none() {
            return;
        }
        warn!("{}: connect timeout", self.name);
        self.driver.on_connect_timeout().await;
        self.fail(ConnectFailure::ConnectTimeout, "Connect timeout expired").await;
    }

    async fn fail(&mut self, reason: ConnectFailure, detail: impl Into<String>) {
        let detail = detail.into();
        error!("{}: failed ({}): {}", self.name, reason, detail);

        // Late events of this attempt are dropped from here on
        self.generation += 1;
        self.deadline = None;
        self.driver.disconnect().await;
        self.withdraw().await;
        self.set_state(ServiceState::Failure(reason));
        self.metrics.connect_failed(self.driver.vpn_type(), reason);
    }

    async fn withdraw(&mut self) {
        if let Some(link) = self.applied_link.take() {
            if let Err(e) = self.sink.withdraw(&link).await {
                warn!("{}: failed to withdraw configuration of {}: {}", self.name, link, e);
            }
        }
    }
}
