//! Service state machine driven by a scripted driver

mod common;

use async_trait::async_trait;
use common::{MockSink, RecordingMetrics, RecordingSink};
use libvpnctl::device::LinkInfo;
use libvpnctl::network_config::NetworkResult;
use libvpnctl::vpn::driver::DriverEventHandler;
use libvpnctl::vpn::service::ServiceEvent;
use libvpnctl::{
    ConnectFailure, NetworkConfigSink, PhysicalServiceEvent, ServiceState, VpnDriver, VpnService, VpnType,
    VpnctlError, VpnctlResult,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Script {
    handler: Option<DriverEventHandler>,
    connects: usize,
    disconnects: usize,
    timeouts: usize,
    physical: Vec<PhysicalServiceEvent>,
    reject_with: Option<ConnectFailure>,
}

/// Driver whose events are fired by the test through the captured handler
struct ScriptedDriver {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl VpnDriver for ScriptedDriver {
    fn vpn_type(&self) -> VpnType {
        VpnType::Ikev2
    }

    async fn connect_async(&mut self, handler: DriverEventHandler) -> VpnctlResult<Option<Duration>> {
        let mut script = self.script.lock().unwrap();
        script.connects += 1;
        if let Some(reason) = script.reject_with {
            return Err(VpnctlError::failure(reason, "rejected"));
        }
        script.handler = Some(handler);
        Ok(Some(TIMEOUT))
    }

    async fn disconnect(&mut self) {
        let mut script = self.script.lock().unwrap();
        script.disconnects += 1;
        script.handler = None;
    }

    async fn get_network_config(&self) -> Option<NetworkResult> {
        Some(NetworkResult {
            ipv4_address: Some("10.10.10.2/32".parse().unwrap()),
            ..Default::default()
        })
    }

    async fn on_default_physical_service_event(&mut self, event: PhysicalServiceEvent) {
        self.script.lock().unwrap().physical.push(event);
    }

    async fn on_connect_timeout(&mut self) {
        self.script.lock().unwrap().timeouts += 1;
        self.disconnect().await;
    }
}

fn link() -> LinkInfo {
    LinkInfo {
        name: "xfrm-vpn".to_string(),
        index: 7,
    }
}

fn setup(sink: Arc<dyn NetworkConfigSink>) -> (VpnService, Arc<Mutex<Script>>, Arc<RecordingMetrics>) {
    let script = Arc::new(Mutex::new(Script::default()));
    let metrics = Arc::new(RecordingMetrics::default());
    let driver = ScriptedDriver { script: script.clone() };
    let service = VpnService::new("office", Box::new(driver), sink, metrics.clone());
    (service, script, metrics)
}

fn handler(script: &Arc<Mutex<Script>>) -> DriverEventHandler {
    script.lock().unwrap().handler.clone().expect("driver is connecting")
}

#[tokio::test(start_paused = true)]
async fn test_connect_to_online() {
    let mut sink = MockSink::new();
    sink.expect_apply().times(1).returning(|_, _| Ok(()));
    sink.expect_withdraw().times(1).returning(|_| Ok(()));
    let (mut service, script, metrics) = setup(Arc::new(sink));
    let mut states = service.subscribe();

    assert_ok!(service.connect().await);
    assert_eq!(service.state(), ServiceState::Associating);
    assert!(service.timeout_armed());

    handler(&script).on_connected(link());
    assert!(service.process_next_event().await);
    assert_eq!(service.state(), ServiceState::Online);
    assert!(!service.timeout_armed());
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ServiceState::Online);
    assert_eq!(*metrics.connected.lock().unwrap(), vec![VpnType::Ikev2]);

    service.disconnect().await;
    assert_eq!(service.state(), ServiceState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_fires_once() {
    let sink = Arc::new(RecordingSink::default());
    let (mut service, script, metrics) = setup(sink.clone());

    assert_ok!(service.connect().await);
    let started = tokio::time::Instant::now();
    assert!(service.process_next_event().await);

    assert!(started.elapsed() >= TIMEOUT);
    assert_eq!(service.state(), ServiceState::Failure(ConnectFailure::ConnectTimeout));
    assert!(!service.timeout_armed());
    assert_eq!(script.lock().unwrap().timeouts, 1);
    assert_eq!(
        *metrics.failures.lock().unwrap(),
        vec![(VpnType::Ikev2, ConnectFailure::ConnectTimeout)]
    );

    // Nothing left to wait for
    assert!(!service.process_next_event().await);
    service.handle_event(ServiceEvent::ConnectTimeout).await;
    assert_eq!(script.lock().unwrap().timeouts, 1);
    assert!(sink.applied.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_events_of_superseded_attempt_are_dropped() {
    let sink = Arc::new(RecordingSink::default());
    let (mut service, script, _) = setup(sink.clone());

    assert_ok!(service.connect().await);
    let stale = handler(&script);
    service.disconnect().await;
    assert_ok!(service.connect().await);

    stale.on_connected(link());
    let event = service.next_event().await;
    assert!(matches!(event, ServiceEvent::Driver { .. }));
    service.handle_event(event).await;
    assert_eq!(service.state(), ServiceState::Associating);
    assert!(sink.applied.lock().unwrap().is_empty());

    handler(&script).on_connected(link());
    assert!(service.process_next_event().await);
    assert_eq!(service.state(), ServiceState::Online);
}

#[tokio::test(start_paused = true)]
async fn test_reconnecting_rearms_timeout() {
    let sink = Arc::new(RecordingSink::default());
    let (mut service, script, _) = setup(sink.clone());

    assert_ok!(service.connect().await);
    handler(&script).on_connected(link());
    service.process_next_event().await;
    assert_eq!(service.state(), ServiceState::Online);

    handler(&script).on_reconnecting(Some(Duration::from_secs(5)));
    service.process_next_event().await;
    assert_eq!(service.state(), ServiceState::Associating);
    assert!(service.timeout_armed());

    handler(&script).on_connected(link());
    service.process_next_event().await;
    assert_eq!(service.state(), ServiceState::Online);
    assert_eq!(sink.applied.lock().unwrap().len(), 2);

    handler(&script).on_reconnecting(None);
    service.process_next_event().await;
    assert_eq!(service.state(), ServiceState::Associating);
    assert!(!service.timeout_armed());
}

#[tokio::test(start_paused = true)]
async fn test_driver_failure_withdraws_configuration() {
    let sink = Arc::new(RecordingSink::default());
    let (mut service, script, metrics) = setup(sink.clone());

    assert_ok!(service.connect().await);
    let driver = handler(&script);
    driver.on_connected(link());
    service.process_next_event().await;

    driver.on_failure(ConnectFailure::NetworkChange, "default route moved");
    service.process_next_event().await;
    assert_eq!(service.state(), ServiceState::Failure(ConnectFailure::NetworkChange));
    assert_eq!(*sink.withdrawn.lock().unwrap(), vec!["xfrm-vpn".to_string()]);
    assert_eq!(
        *metrics.failures.lock().unwrap(),
        vec![(VpnType::Ikev2, ConnectFailure::NetworkChange)]
    );

    // A late event from the failed attempt changes nothing
    driver.on_connected(link());
    let event = service.next_event().await;
    service.handle_event(event).await;
    assert_eq!(service.state(), ServiceState::Failure(ConnectFailure::NetworkChange));

    // Failure is terminal for the attempt but not for the service
    assert_ok!(service.connect().await);
    assert_eq!(service.state(), ServiceState::Associating);
}

#[tokio::test(start_paused = true)]
async fn test_connect_rejected_by_driver() {
    let sink = Arc::new(RecordingSink::default());
    let (mut service, script, metrics) = setup(sink);
    script.lock().unwrap().reject_with = Some(ConnectFailure::InvalidConfig);

    let err = assert_err!(service.connect().await);
    assert_eq!(err.connect_failure(), ConnectFailure::InvalidConfig);
    assert_eq!(service.state(), ServiceState::Failure(ConnectFailure::InvalidConfig));
    assert!(!service.timeout_armed());
    assert_eq!(metrics.failures.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_active_is_rejected() {
    let sink = Arc::new(RecordingSink::default());
    let (mut service, script, _) = setup(sink);

    assert_ok!(service.connect().await);
    let err = assert_err!(service.connect().await);
    assert!(matches!(err, VpnctlError::InvalidState(_)));
    assert_eq!(script.lock().unwrap().connects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_twice() {
    let mut sink = MockSink::new();
    sink.expect_apply().times(1).returning(|_, _| Ok(()));
    sink.expect_withdraw().times(1).returning(|_| Ok(()));
    let (mut service, script, _) = setup(Arc::new(sink));

    assert_ok!(service.connect().await);
    handler(&script).on_connected(link());
    service.process_next_event().await;

    service.disconnect().await;
    service.disconnect().await;
    assert_eq!(service.state(), ServiceState::Idle);
    assert_eq!(script.lock().unwrap().disconnects, 2);
}

#[tokio::test(start_paused = true)]
async fn test_physical_events_only_reach_active_driver() {
    let sink = Arc::new(RecordingSink::default());
    let (mut service, script, _) = setup(sink);

    service.on_physical_event(PhysicalServiceEvent::Down).await;
    assert_ok!(service.connect().await);
    service.on_physical_event(PhysicalServiceEvent::Changed).await;

    assert_eq!(script.lock().unwrap().physical, vec![PhysicalServiceEvent::Changed]);
}

#[tokio::test(start_paused = true)]
async fn test_sink_failure_fails_service() {
    let mut sink = MockSink::new();
    sink.expect_apply()
        .times(1)
        .returning(|_, _| Err(VpnctlError::failure(ConnectFailure::InternalFailure, "ip failed")));
    sink.expect_withdraw().never();
    let (mut service, script, _) = setup(Arc::new(sink));

    assert_ok!(service.connect().await);
    handler(&script).on_connected(link());
    service.process_next_event().await;

    assert_eq!(service.state(), ServiceState::Failure(ConnectFailure::InternalFailure));
}

#[tokio::test(start_paused = true)]
async fn test_no_timeout_after_disconnect() {
    let sink = Arc::new(RecordingSink::default());
    let (mut service, script, metrics) = setup(sink);

    assert_ok!(service.connect().await);
    service.disconnect().await;
    assert!(!service.timeout_armed());

    tokio::time::sleep(TIMEOUT * 2).await;
    assert!(!service.process_next_event().await);
    assert_eq!(service.state(), ServiceState::Idle);
    assert_eq!(script.lock().unwrap().timeouts, 0);
    assert!(metrics.failures.lock().unwrap().is_empty());
}
