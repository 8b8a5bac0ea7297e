//! Bridge and app tunnel services

mod common;

use common::{RecordingSink, TestBed};
use libvpnctl::{ConnectFailure, PhysicalServiceEvent, ServiceState, VpnManager, VpnProfile, VpnService, VpnctlError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

async fn settle(service: &mut VpnService) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while service.state() == ServiceState::Associating {
            service.process_next_event().await;
        }
    })
    .await
    .expect("service did not settle");
}

fn parameters(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[tokio::test]
async fn test_bridge_goes_online_without_timeout() {
    let bed = TestBed::new();
    bed.devices.existing.lock().unwrap().insert("arcbr0".to_string(), 4);
    let sink = Arc::new(RecordingSink::default());
    let manager = VpnManager::with_default_drivers(bed.context(), sink.clone());
    let profile = VpnProfile::from_toml(
        "name = \"arc\"\n[vpn]\ntype = \"bridge\"\nroutes = [\"100.115.92.0/24\"]\ndns_servers = [\"100.115.92.1\"]\n",
    )
    .unwrap();
    let mut service = manager.create_service(&profile).unwrap();

    service.connect().await.unwrap();
    assert!(!service.timeout_armed());
    settle(&mut service).await;

    assert_eq!(service.state(), ServiceState::Online);
    let applied = sink.applied.lock().unwrap().clone();
    assert_eq!(applied[0].0, "arcbr0");
    assert_eq!(applied[0].1.included_routes, vec!["100.115.92.0/24".parse().unwrap()]);
    assert!(bed.launcher.command_lines().is_empty());
}

#[tokio::test]
async fn test_missing_bridge_is_invalid_config() {
    let bed = TestBed::new();
    let sink = Arc::new(RecordingSink::default());
    let manager = VpnManager::with_default_drivers(bed.context(), sink);
    let profile = VpnProfile::from_toml("name = \"arc\"\n[vpn]\ntype = \"bridge\"\n").unwrap();
    let mut service = manager.create_service(&profile).unwrap();

    let err = service.connect().await.unwrap_err();
    assert_eq!(err.connect_failure(), ConnectFailure::InvalidConfig);
    assert_eq!(service.state(), ServiceState::Failure(ConnectFailure::InvalidConfig));
}

fn app_tunnel(bed: &TestBed, sink: Arc<RecordingSink>) -> (VpnService, libvpnctl::AppTunnelHandle) {
    let manager = VpnManager::with_default_drivers(bed.context(), sink);
    let profile = VpnProfile::from_toml("name = \"arc\"\n[vpn]\ntype = \"app-tunnel\"\n").unwrap();
    manager.create_app_tunnel_service(&profile).unwrap()
}

#[tokio::test]
async fn test_app_tunnel_parameters() {
    let bed = TestBed::new();
    let sink = Arc::new(RecordingSink::default());
    let (mut service, handle) = app_tunnel(&bed, sink.clone());

    let early = handle.set_parameters(&parameters(&[("address", "10.0.0.2")]));
    assert!(matches!(early, Err(VpnctlError::ParseError(_))));
    assert!(!handle.is_active());

    service.connect().await.unwrap();
    assert!(handle.is_active());

    // Rejected parameters leave the attempt running
    let err = handle
        .set_parameters(&parameters(&[("address", "10.0.0.2"), ("subnet_prefix", "40")]))
        .unwrap_err();
    assert!(err.to_string().contains("subnet_prefix"));
    assert_eq!(service.state(), ServiceState::Associating);

    handle
        .set_parameters(&parameters(&[
            ("address", "100.115.92.6"),
            ("subnet_prefix", "30"),
            ("inclusion_list", "0.0.0.0/0"),
            ("exclusion_list", "100.115.92.0/24"),
            ("dns_servers", "8.8.8.8,8.8.4.4"),
        ]))
        .unwrap();
    settle(&mut service).await;
    assert_eq!(service.state(), ServiceState::Online);

    let applied = sink.applied.lock().unwrap().clone();
    assert_eq!(applied[0].0, "arc_tun0");
    assert_eq!(applied[0].1.ipv4_address, Some("100.115.92.6/30".parse().unwrap()));
    assert_eq!(applied[0].1.dns_servers.len(), 2);

    let mut notifications = handle.subscribe();
    service.on_physical_event(PhysicalServiceEvent::Changed).await;
    assert_eq!(notifications.recv().await.unwrap(), PhysicalServiceEvent::Changed);

    service.disconnect().await;
    assert!(!handle.is_active());
    assert_eq!(*bed.devices.deleted.lock().unwrap(), vec!["arc_tun0".to_string()]);
    assert!(matches!(handle.report_failure("late"), Err(VpnctlError::InvalidState(_))));
}

#[tokio::test]
async fn test_app_reported_failure() {
    let bed = TestBed::new();
    let sink = Arc::new(RecordingSink::default());
    let (mut service, handle) = app_tunnel(&bed, sink);

    service.connect().await.unwrap();
    handle.report_failure("vpn app crashed").unwrap();
    settle(&mut service).await;

    assert_eq!(service.state(), ServiceState::Failure(ConnectFailure::Disconnect));
    assert!(!handle.is_active());
    assert_eq!(*bed.devices.deleted.lock().unwrap(), vec!["arc_tun0".to_string()]);
}
