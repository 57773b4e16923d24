mod common;

use std::sync::atomic::Ordering;

use common::*;
use thermal_printer_link::core::bluetooth::UUID_SERIAL_PORT_PROFILE;
use thermal_printer_link::core::bluetooth::backend::ConnectStrategy;
use thermal_printer_link::core::bluetooth::backend::mock::{GattLayout, Handshake, MockBackend};
use thermal_printer_link::{Capability, DeviceDescriptor, PrinterError, PrinterEvent, SessionState};
use tokio_test::{assert_err, assert_ok};

const SPP: ConnectStrategy = ConnectStrategy::ServiceRecord(UUID_SERIAL_PORT_PROFILE);

fn classic_with_a() -> MockBackend {
    MockBackend::address_book().with_bonded(bonded(PRINTER_A, "PT-210"))
}

#[tokio::test]
async fn test_missing_address_is_rejected_before_touching_hardware() {
    let backend = classic_with_a();
    let manager = manager(&backend, fast_config());

    let err = manager.connect(None).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");
    let err = manager.connect(Some("")).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");

    assert_eq!(backend.counters().capability_queries.load(Ordering::SeqCst), 0);
    assert_eq!(backend.counters().establish_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unavailable_adapter_never_attempts_a_connection() {
    let backend = classic_with_a().with_capability(Capability::PoweredOff);
    let manager = manager(&backend, fast_config());

    let err = manager.connect(Some(PRINTER_A)).await.unwrap_err();
    assert_eq!(err, PrinterError::BluetoothUnavailable(Capability::PoweredOff));
    assert_eq!(err.code(), "BLUETOOTH_UNAVAILABLE");
    assert_eq!(backend.counters().establish_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_permission_denied() {
    let backend = classic_with_a().with_permission(false);
    let manager = manager(&backend, fast_config());

    let err = manager.connect(Some(PRINTER_A)).await.unwrap_err();
    assert_eq!(err.code(), "PERMISSION_DENIED");
    assert_eq!(backend.counters().establish_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connect_and_disconnect() {
    let backend = classic_with_a();
    let manager = manager(&backend, fast_config());

    assert_eq!(assert_ok!(manager.connect(Some(PRINTER_A)).await), true);
    assert!(manager.is_connected().await);
    assert_eq!(manager.state(), SessionState::Open);

    assert!(manager.disconnect().await);
    assert!(!manager.is_connected().await);
    assert_eq!(manager.state(), SessionState::Idle);
    assert_eq!(backend.open_links(), 0);

    // Nothing left to tear down.
    assert!(!manager.disconnect().await);
}

#[tokio::test]
async fn test_connect_emits_state_transitions() {
    let backend = classic_with_a();
    let manager = manager(&backend, fast_config());
    let mut events = manager.subscribe();

    assert_ok!(manager.connect(Some(PRINTER_A)).await);

    let mut states = Vec::new();
    while let Ok(PrinterEvent::StateChanged { state }) = events.try_recv() {
        states.push(state);
    }
    assert_eq!(
        states,
        vec![SessionState::Resolving, SessionState::Connecting, SessionState::Open]
    );
}

#[tokio::test]
async fn test_write_requires_open_channel() {
    let backend = classic_with_a();
    let manager = manager(&backend, fast_config());

    assert_eq!(
        manager.write(b"\x1b@").await.unwrap_err(),
        PrinterError::NotConnected
    );

    assert_ok!(manager.connect(Some(PRINTER_A)).await);
    assert_ok!(manager.write(b"\x1b@Hello\n").await);
    assert_eq!(backend.written(), b"\x1b@Hello\n".to_vec());
}

#[tokio::test]
async fn test_superseding_connect_cancels_the_previous_attempt() {
    let backend = MockBackend::address_book()
        .with_bonded(bonded(PRINTER_A, "Kitchen"))
        .with_bonded(bonded(PRINTER_B, "Counter"))
        .with_device_handshake(PRINTER_A, Handshake::Hang);
    let config = fast_config().with_connect_timeout(ms(5_000));
    let manager = manager(&backend, config);

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(Some(PRINTER_A)).await })
    };
    wait_for_state(&manager, SessionState::Connecting).await;

    assert_ok!(manager.connect(Some(PRINTER_B)).await);

    let first = first.await.unwrap();
    assert_eq!(first.unwrap_err(), PrinterError::Cancelled);
    assert!(manager.is_connected().await);

    let targets: Vec<String> = backend.attempts().into_iter().map(|(id, _)| id).collect();
    assert_eq!(targets, vec![PRINTER_A.to_string(), PRINTER_B.to_string()]);
}

#[tokio::test]
async fn test_reconnect_to_same_device_replaces_session() {
    let backend = classic_with_a();
    let manager = manager(&backend, fast_config());

    assert_ok!(manager.connect(Some(PRINTER_A)).await);
    assert_ok!(manager.connect(Some(PRINTER_A)).await);

    assert!(manager.is_connected().await);
    assert_eq!(backend.counters().links_opened.load(Ordering::SeqCst), 2);
    assert_eq!(backend.open_links(), 1);
}

#[tokio::test]
async fn test_disconnect_during_pending_connect() {
    let backend = classic_with_a().with_device_handshake(PRINTER_A, Handshake::Hang);
    let manager = manager(&backend, fast_config().with_connect_timeout(ms(5_000)));

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(Some(PRINTER_A)).await })
    };
    wait_for_state(&manager, SessionState::Connecting).await;

    assert!(manager.disconnect().await);
    assert_eq!(pending.await.unwrap().unwrap_err(), PrinterError::Cancelled);
    assert_eq!(manager.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_late_handshake_after_timeout_is_closed() {
    let backend = classic_with_a().with_handshake(SPP, Handshake::Succeed(ms(200)));
    let config = fast_config()
        .with_connect_timeout(ms(50))
        .with_fallback_strategies(false);
    let manager = manager(&backend, config);

    let err = manager.connect(Some(PRINTER_A)).await.unwrap_err();
    assert_eq!(err.code(), "CONNECTION_TIMEOUT");
    assert!(err.to_string().contains(PRINTER_A));

    tokio::time::sleep(ms(300)).await;
    assert_eq!(backend.counters().links_opened.load(Ordering::SeqCst), 1);
    assert_eq!(backend.open_links(), 0);
    assert!(!manager.is_connected().await);
}

#[tokio::test]
async fn test_handshake_within_timeout_succeeds() {
    let backend = classic_with_a().with_handshake(SPP, Handshake::Succeed(ms(10)));
    let manager = manager(&backend, fast_config().with_connect_timeout(ms(500)));

    assert_ok!(manager.connect(Some(PRINTER_A)).await);
    assert!(manager.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_just_before_timeout_wins() {
    let backend = classic_with_a().with_handshake(SPP, Handshake::Succeed(ms(99)));
    let config = fast_config()
        .with_connect_timeout(ms(100))
        .with_fallback_strategies(false);
    let manager = manager(&backend, config);

    assert_ok!(manager.connect(Some(PRINTER_A)).await);
    assert!(manager.is_connected().await);
    assert_eq!(backend.open_links(), 1);
}

#[tokio::test]
async fn test_fallback_strategy_after_primary_failure() {
    let backend = classic_with_a().with_handshake(
        SPP,
        Handshake::Fail(ms(0), "read failed, socket might closed or timeout".to_string()),
    );
    let manager = manager(&backend, fast_config());

    assert_ok!(manager.connect(Some(PRINTER_A)).await);

    let strategies: Vec<ConnectStrategy> =
        backend.attempts().into_iter().map(|(_, strategy)| strategy).collect();
    assert_eq!(strategies, vec![SPP, ConnectStrategy::DirectChannel(1)]);
}

#[tokio::test]
async fn test_all_strategies_failing_reports_hint() {
    let backend = classic_with_a()
        .with_handshake(SPP, Handshake::Fail(ms(0), "service discovery failed".to_string()))
        .with_handshake(
            ConnectStrategy::DirectChannel(1),
            Handshake::Fail(ms(0), "connection refused".to_string()),
        );
    let manager = manager(&backend, fast_config());

    let err = manager.connect(Some(PRINTER_A)).await.unwrap_err();
    assert_eq!(err.code(), "CONNECTION_FAILED");
    let message = err.to_string();
    assert!(message.contains("connection refused"));
    assert!(message.contains("(Device: PT-210, ID: AA:BB:CC:DD:EE:01)"));
    assert!(message.contains("The printer is powered on"));
    assert_eq!(manager.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_disabled_fallback_tries_primary_only() {
    let backend = classic_with_a().with_handshake(SPP, Handshake::Fail(ms(0), "refused".to_string()));
    let manager = manager(&backend, fast_config().with_fallback_strategies(false));

    let err = manager.connect(Some(PRINTER_A)).await.unwrap_err();
    assert_eq!(err.code(), "CONNECTION_FAILED");
    assert_eq!(backend.attempts().len(), 1);
}

#[tokio::test]
async fn test_mixed_timeout_and_failure_is_connection_failed() {
    let backend = classic_with_a()
        .with_handshake(SPP, Handshake::Hang)
        .with_handshake(
            ConnectStrategy::DirectChannel(1),
            Handshake::Fail(ms(0), "host is down".to_string()),
        );
    let manager = manager(&backend, fast_config().with_connect_timeout(ms(50)));

    let err = manager.connect(Some(PRINTER_A)).await.unwrap_err();
    assert_eq!(err.code(), "CONNECTION_FAILED");
}

#[tokio::test]
async fn test_address_book_identifier_checks() {
    let backend = MockBackend::address_book()
        .with_known(DeviceDescriptor::new(PRINTER_B, Some("Stranger".to_string()), false));
    let manager = manager(&backend, fast_config());

    let err = manager.connect(Some("printer-one")).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ADDRESS");

    let err = manager.connect(Some(PRINTER_B)).await.unwrap_err();
    assert_eq!(err.code(), "DEVICE_NOT_PAIRED");

    let err = manager.connect(Some("AA:BB:CC:00:00:00")).await.unwrap_err();
    assert_eq!(err.code(), "DEVICE_NOT_FOUND");

    assert_eq!(backend.counters().establish_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_broadcast_connect_scans_for_unknown_device() {
    let backend = MockBackend::broadcast().with_advertisement(advertised("printer-1"), ms(20));
    let manager = manager(&backend, fast_config().with_lookup_scan_timeout(ms(2_000)));

    let started = tokio::time::Instant::now();
    assert_ok!(manager.connect(Some("printer-1")).await);

    // The lookup ends as soon as the target shows up.
    assert!(started.elapsed() < ms(1_000));
    assert!(manager.is_connected().await);
    assert!(manager.directory().contains("printer-1"));
    assert_eq!(backend.counters().scans_started.load(Ordering::SeqCst), 1);
    assert_eq!(backend.counters().active_scans.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_broadcast_connect_to_absent_device() {
    let backend = MockBackend::broadcast().with_advertisement(advertised("printer-2"), ms(10));
    let manager = manager(&backend, fast_config());

    let err = manager.connect(Some("printer-1")).await.unwrap_err();
    assert_eq!(err.code(), "DEVICE_NOT_FOUND");
    assert_eq!(backend.counters().establish_calls.load(Ordering::SeqCst), 0);
    assert_eq!(backend.counters().active_scans.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_broadcast_enumeration_failures() {
    for (layout, code) in [
        (GattLayout::NoServices, "NO_SERVICES_FOUND"),
        (GattLayout::ReadOnly, "NO_WRITABLE_CHARACTERISTIC"),
        (GattLayout::DiscoveryError, "SERVICE_DISCOVERY_FAILED"),
        (GattLayout::Stalled, "CONNECTION_TIMEOUT"),
    ] {
        let backend = MockBackend::broadcast()
            .with_advertisement(advertised("printer-1"), ms(5))
            .with_gatt_layout(layout);
        let manager = manager(&backend, fast_config());

        let err = manager.connect(Some("printer-1")).await.unwrap_err();
        assert_eq!(err.code(), code);
        assert_eq!(backend.open_links(), 0, "link left open for {:?}", layout);
        assert!(!manager.is_connected().await);
    }
}

#[tokio::test]
async fn test_service_discovery_error_is_reported() {
    let backend = MockBackend::broadcast()
        .with_advertisement(advertised("printer-1"), ms(5))
        .with_gatt_layout(GattLayout::DiscoveryError);
    let manager = manager(&backend, fast_config());

    let err = manager.connect(Some("printer-1")).await.unwrap_err();
    assert!(err.to_string().starts_with("Failed to discover services:"));
    assert_eq!(manager.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_superseding_connect_during_enumeration() {
    let backend = MockBackend::broadcast()
        .with_advertisement(advertised("printer-1"), ms(5))
        .with_advertisement(advertised("printer-2"), ms(5))
        .with_gatt_layout(GattLayout::Stalled);
    let manager = manager(&backend, fast_config().with_enumeration_timeout(ms(5_000)));

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(Some("printer-1")).await })
    };
    wait_for_state(&manager, SessionState::Enumerating).await;

    backend.set_gatt_layout(GattLayout::Writable);
    assert_ok!(manager.connect(Some("printer-2")).await);

    assert_eq!(first.await.unwrap().unwrap_err(), PrinterError::Cancelled);
    assert!(manager.is_connected().await);
    assert_eq!(backend.counters().links_opened.load(Ordering::SeqCst), 2);
    assert_eq!(backend.open_links(), 1);

    assert_ok!(manager.write(b"ok").await);
    assert_eq!(backend.written(), b"ok".to_vec());
}

#[tokio::test]
async fn test_lookup_survives_listing_started_meanwhile() {
    let backend = MockBackend::broadcast().with_advertisement(advertised("printer-1"), ms(300));
    let config = fast_config()
        .with_lookup_scan_timeout(ms(2_000))
        .with_listing_scan_timeout(ms(500));
    let manager = manager(&backend, config);

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(Some("printer-1")).await })
    };
    tokio::time::sleep(ms(50)).await;

    let listing = assert_ok!(manager.bonded_devices().await);
    assert!(listing.iter().any(|d| d.address == "printer-1"));

    assert_ok!(connecting.await.unwrap());
    assert!(manager.is_connected().await);
    assert_eq!(backend.counters().max_concurrent_scans.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stopped_lookup_waits_for_its_own_deadline() {
    let backend = MockBackend::broadcast().with_advertisement(advertised("printer-1"), ms(5_000));
    let manager = manager(&backend, fast_config().with_lookup_scan_timeout(ms(300)));

    let started = tokio::time::Instant::now();
    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(Some("printer-1")).await })
    };
    tokio::time::sleep(ms(50)).await;
    assert!(manager.stop_scan().await);

    let err = connecting.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "DEVICE_NOT_FOUND");
    assert!(started.elapsed() >= ms(300));
}

#[tokio::test]
async fn test_capability_loss_during_lookup_scan() {
    let backend = MockBackend::broadcast().with_advertisement(advertised("printer-1"), ms(5_000));
    let manager = manager(&backend, fast_config().with_lookup_scan_timeout(ms(10_000)));

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(Some("printer-1")).await })
    };
    tokio::time::sleep(ms(50)).await;
    assert!(manager.is_scanning());

    backend.set_capability(Capability::PoweredOff);
    let result = tokio::time::timeout(ms(1_000), connecting)
        .await
        .expect("connect should end")
        .unwrap();
    assert_eq!(result.unwrap_err().code(), "BLUETOOTH_UNAVAILABLE");

    wait_for_state(&manager, SessionState::Idle).await;
    tokio::time::sleep(ms(20)).await;
    assert!(!manager.is_scanning());
    assert_eq!(backend.counters().active_scans.load(Ordering::SeqCst), 0);
    assert_eq!(backend.counters().establish_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_broadcast_write_goes_through_bound_characteristic() {
    let backend = MockBackend::broadcast().with_advertisement(advertised("printer-1"), ms(5));
    let manager = manager(&backend, fast_config());

    assert_ok!(manager.connect(Some("printer-1")).await);
    assert_ok!(manager.write(b"receipt").await);
    assert_eq!(backend.written(), b"receipt".to_vec());
}

#[tokio::test]
async fn test_unsolicited_disconnect_is_reported() {
    let backend = classic_with_a();
    let manager = manager(&backend, fast_config());
    assert_ok!(manager.connect(Some(PRINTER_A)).await);

    let mut events = manager.subscribe();
    backend.disconnect_device(PRINTER_A);

    let event = next_event(&mut events, |e| matches!(e, PrinterEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        Some(PrinterEvent::Disconnected {
            address: PRINTER_A.to_string()
        })
    );
    assert!(!manager.is_connected().await);
    assert_eq!(manager.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_disconnect_of_other_device_is_ignored() {
    let backend = classic_with_a();
    let manager = manager(&backend, fast_config());
    assert_ok!(manager.connect(Some(PRINTER_A)).await);

    backend.disconnect_device(PRINTER_B);
    tokio::time::sleep(ms(20)).await;
    assert!(manager.is_connected().await);
}

#[tokio::test]
async fn test_capability_loss_closes_session_and_regain_is_announced() {
    let backend = classic_with_a();
    let manager = manager(&backend, fast_config());
    assert_ok!(manager.connect(Some(PRINTER_A)).await);
    let mut events = manager.subscribe();

    backend.set_capability(Capability::PoweredOff);
    let lost = next_event(&mut events, |e| matches!(e, PrinterEvent::Disconnected { .. })).await;
    assert!(lost.is_some());
    assert!(!manager.is_connected().await);

    backend.set_capability(Capability::Ready);
    let regained =
        next_event(&mut events, |e| matches!(e, PrinterEvent::BluetoothStateChanged { .. })).await;
    assert_eq!(
        regained,
        Some(PrinterEvent::BluetoothStateChanged {
            state: "on".to_string()
        })
    );
}

#[tokio::test]
async fn test_capability_loss_fails_pending_connect() {
    let backend = classic_with_a().with_device_handshake(PRINTER_A, Handshake::Hang);
    let manager = manager(&backend, fast_config().with_connect_timeout(ms(5_000)));

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(Some(PRINTER_A)).await })
    };
    wait_for_state(&manager, SessionState::Connecting).await;

    backend.set_capability(Capability::Unavailable);
    let result = pending.await.unwrap();
    assert_err!(&result);
    assert_eq!(result.unwrap_err().code(), "BLUETOOTH_UNAVAILABLE");
    wait_for_state(&manager, SessionState::Idle).await;
}

#[tokio::test]
async fn test_shutdown_closes_open_channel() {
    let backend = classic_with_a();
    let manager = manager(&backend, fast_config());
    assert_ok!(manager.connect(Some(PRINTER_A)).await);

    manager.shutdown().await;
    assert_eq!(backend.open_links(), 0);
    assert!(!manager.is_connected().await);
}
