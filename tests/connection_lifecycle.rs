//! Integration tests for the connection state machine against the simulated board.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edge_link::config::LinkConfig;
use edge_link::link::{
    ConnectOutcome, ConnectionManager, ConnectionState, DisconnectReason, ReconnectOutcome,
};
use edge_link::protocol::{
    Battery, Characteristic, HardwareVariant, StreamMode, DEVICE_INFO_CHAR_UUID, MODE_CHAR_UUID,
    SENSOR_CHAR_UUID,
};
use edge_link::transport::mock::{MockCentral, MockPeripheral};
use edge_link::LinkError;

struct Harness {
    device: Arc<MockPeripheral>,
    central: Arc<MockCentral>,
    manager: ConnectionManager,
}

fn harness() -> Harness {
    let device = MockPeripheral::edge_ai("SevernEdgeAI-12");
    let central = Arc::new(MockCentral::new(device.clone()));
    let manager = ConnectionManager::open(central.clone(), LinkConfig::default())
        .expect("Default config should be valid");
    Harness {
        device,
        central,
        manager,
    }
}

async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut rx = manager.subscribe_status();
    rx.wait_for(|s| s.state == state)
        .await
        .expect("Status channel closed");
}

fn counting_handler(counter: &Arc<AtomicUsize>) -> edge_link::link::NotificationHandler {
    let counter = counter.clone();
    Arc::new(move |_: Bytes| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test(start_paused = true)]
async fn test_connect_then_user_disconnect() {
    let h = harness();
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);

    let outcome = h.manager.connect().await.expect("Connect failed");
    assert_eq!(outcome, ConnectOutcome::Connected);
    assert!(h.manager.is_connected());
    assert!(h.device.is_connected());

    h.manager.disconnect().await.expect("Disconnect failed");
    let status = h.manager.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.disconnect_reason, DisconnectReason::User);
    assert!(!h.device.is_connected());
    assert!(matches!(
        h.manager.read(Characteristic::DeviceInfo).await,
        Err(LinkError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_user_cancel_restores_previous_state() {
    let h = harness();
    h.central.cancel_next_request();

    let outcome = h.manager.connect().await.expect("Cancel is not an error");
    assert_eq!(outcome, ConnectOutcome::Cancelled);
    let status = h.manager.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.last_error, None);
    assert_eq!(h.device.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_stack_error_is_verbatim() {
    let h = harness();
    h.central.set_unavailable("adapter powered off");

    let err = h.manager.connect().await.unwrap_err();
    assert!(err.to_string().contains("adapter powered off"));
    let status = h.manager.status();
    assert_eq!(status.state, ConnectionState::Error);
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("adapter powered off")));
}

#[tokio::test(start_paused = true)]
async fn test_silent_reconnect_rehydrates_stream() {
    let h = harness();
    h.manager.connect().await.expect("Connect failed");

    let frames = Arc::new(AtomicUsize::new(0));
    h.manager
        .start_stream(StreamMode::Collect, counting_handler(&frames))
        .await
        .expect("Start stream failed");

    h.device.drop_link("supervision timeout");
    wait_for_state(&h.manager, ConnectionState::Reconnecting).await;
    assert_eq!(
        h.manager.status().disconnect_reason,
        DisconnectReason::Timeout
    );
    wait_for_state(&h.manager, ConnectionState::Connected).await;

    assert_eq!(h.device.connect_count(), 2);
    assert_eq!(h.central.request_count(), 1);
    assert!(h.device.is_subscribed(SENSOR_CHAR_UUID));
    assert_eq!(h.device.writes_to(MODE_CHAR_UUID).len(), 2);
    assert_eq!(h.manager.active_stream(), Some(StreamMode::Collect));

    assert!(h.device.notify(SENSOR_CHAR_UUID, vec![0u8; 17]));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(frames.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_budget_exhausted_needs_user_action() {
    let h = harness();
    h.manager.connect().await.expect("Connect failed");
    h.device.fail_next_connects(2);

    h.device.drop_link("peer closed");
    wait_for_state(&h.manager, ConnectionState::NeedsUserAction).await;

    let status = h.manager.status();
    assert_eq!(status.reconnect_attempt, 2);
    assert_eq!(status.disconnect_reason, DisconnectReason::Transport);
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("Select the device again")));
    assert!(!h.manager.is_connected());

    let outcome = h.manager.connect().await.expect("Manual reconnect failed");
    assert_eq!(outcome, ConnectOutcome::Connected);
    assert_eq!(h.central.request_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_drop_reports_share_one_reconnect() {
    let h = harness();
    h.manager.connect().await.expect("Connect failed");

    let (a, b) = tokio::join!(
        h.manager.report_link_lost("radio reset"),
        h.manager.report_link_lost("radio reset")
    );
    assert_eq!(a, ReconnectOutcome::Reconnected { attempt: 1 });
    assert_eq!(a, b);
    assert_eq!(h.device.connect_count(), 2);
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_drop_report_without_link_is_ignored() {
    let h = harness();
    let outcome = h.manager.report_link_lost("spurious").await;
    assert_eq!(outcome, ReconnectOutcome::Ignored);
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect_during_reconnect_wins() {
    let h = harness();
    h.manager.connect().await.expect("Connect failed");

    h.device.drop_link("peer closed");
    wait_for_state(&h.manager, ConnectionState::Reconnecting).await;

    assert!(matches!(
        h.manager.connect().await,
        Err(LinkError::ConnectInProgress)
    ));

    h.manager.disconnect().await.expect("Disconnect failed");
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert!(!h.manager.is_connected());
    assert!(!h.device.is_connected());
    assert_eq!(h.device.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_stream_never_sees_late_notifications() {
    let h = harness();
    h.manager.connect().await.expect("Connect failed");

    let frames = Arc::new(AtomicUsize::new(0));
    h.manager
        .start_stream(StreamMode::Collect, counting_handler(&frames))
        .await
        .expect("Start stream failed");
    h.manager
        .stop_stream(StreamMode::Collect)
        .await
        .expect("Stop stream failed");

    assert!(!h.device.notify(SENSOR_CHAR_UUID, vec![0u8; 17]));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(frames.load(Ordering::SeqCst), 0);
    assert_eq!(h.manager.active_stream(), None);
}

#[tokio::test(start_paused = true)]
async fn test_config_round_trip_through_device() {
    let h = harness();
    h.manager.connect().await.expect("Connect failed");

    let config = edge_link::protocol::DeviceConfig {
        sample_rate_hz: 25,
        window_size: 50,
    };
    h.manager.write_config(config).await.expect("Write failed");
    assert_eq!(h.manager.read_config().await.expect("Read failed"), config);

    let invalid = edge_link::protocol::DeviceConfig {
        sample_rate_hz: 200,
        window_size: 50,
    };
    assert!(matches!(
        h.manager.write_config(invalid).await,
        Err(LinkError::Protocol(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_drop_after_manual_reconnect_starts_fresh_loop() {
    let h = harness();
    h.manager.connect().await.expect("Connect failed");

    // Leave an abandoned reconnect loop sleeping out its first delay
    h.device.drop_link("peer closed");
    wait_for_state(&h.manager, ConnectionState::Reconnecting).await;
    h.manager.disconnect().await.expect("Disconnect failed");

    let outcome = h.manager.connect().await.expect("Manual connect failed");
    assert_eq!(outcome, ConnectOutcome::Connected);
    assert_eq!(h.device.connect_count(), 2);

    let outcome = h.manager.report_link_lost("radio reset").await;
    assert_eq!(outcome, ReconnectOutcome::Reconnected { attempt: 1 });
    assert_eq!(h.manager.state(), ConnectionState::Connected);
    assert!(h.manager.is_connected());
    assert_eq!(h.device.connect_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_second_drop_after_silent_reconnect_reconnects_again() {
    let h = harness();
    h.manager.connect().await.expect("Connect failed");

    for expected_connects in [2, 3] {
        let outcome = h.manager.report_link_lost("radio reset").await;
        assert_eq!(outcome, ReconnectOutcome::Reconnected { attempt: 1 });
        assert_eq!(h.device.connect_count(), expected_connects);
    }
    assert!(h.manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_device_info_reads_what_the_board_publishes() {
    let h = harness();
    h.manager.connect().await.expect("Connect failed");

    // 20-byte layout from older firmware: fw 3.1, Rev1, 87% battery
    let mut legacy = vec![3u8, 1, 0, 87];
    legacy.extend_from_slice(&100u16.to_le_bytes());
    legacy.extend_from_slice(&25u16.to_le_bytes());
    legacy.extend_from_slice(&[0u8; 12]);
    h.device.set_value(DEVICE_INFO_CHAR_UUID, legacy);

    let info = h.manager.get_device_info().await.expect("Read failed");
    assert_eq!(info.firmware_version(), "3.1");
    assert_eq!(info.variant, HardwareVariant::Rev1Lsm9ds1);
    assert_eq!(info.battery, Battery::Percent(87));
    assert_eq!(info.window_size, 100);
    assert_eq!(info.sample_rate_hz, 25);
    assert_eq!(info.stored_model, None);

    h.device.set_value(DEVICE_INFO_CHAR_UUID, vec![3u8, 1, 0, 87]);
    assert!(matches!(
        h.manager.get_device_info().await,
        Err(LinkError::Length { actual: 4, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_nothing_is_bound_while_connecting() {
    let h = harness();
    h.device.set_connect_delay(Duration::from_secs(2));

    let manager = h.manager.clone();
    let pending = tokio::spawn(async move { manager.connect().await });
    wait_for_state(&h.manager, ConnectionState::Connecting).await;

    assert!(!h.manager.is_connected());
    assert!(matches!(
        h.manager.read(Characteristic::DeviceInfo).await,
        Err(LinkError::NotConnected)
    ));

    let outcome = pending
        .await
        .expect("Connect task panicked")
        .expect("Connect failed");
    assert_eq!(outcome, ConnectOutcome::Connected);
    assert!(h.manager.is_connected());
}
