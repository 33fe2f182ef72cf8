//! End-to-end relay scenarios over the simulated backends
//!
//! A victim (SimPeripheral) talks to the relay, the relay talks to the real
//! device (SimCentral). Run with: cargo test --test integration_relay

use blerelay_core::gatt::{GattErrorCode, GattResponse, WriteKind};
use blerelay_core::pipeline::{Direction, DropReply, Pipeline, PipelineConfig, Transform, TransformSlot};
use blerelay_core::session::{RelayConfig, RelayError, SessionController, SessionHandle, SessionState};
use blerelay_core::sim::{fixtures, SimCentral, SimPeripheral};
use blerelay_core::topology::{DeviceProfile, HostCapabilities, PeerAddress};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(2);

struct Rig {
    handle: SessionHandle,
    central: Arc<SimCentral>,
    peripheral: Arc<SimPeripheral>,
    task: JoinHandle<Result<(), RelayError>>,
}

fn victim() -> PeerAddress {
    "5A:5A:5A:00:00:01".parse().expect("victim address")
}

/// Start a relay and connect a victim that needs no pairing
async fn relaying(profile: DeviceProfile, pipeline: Pipeline, config: RelayConfig) -> Rig {
    let central = Arc::new(SimCentral::from_profile(&profile));
    relaying_to(central, profile, pipeline, config).await
}

/// Same as `relaying`, against a device prepared by the caller
async fn relaying_to(
    central: Arc<SimCentral>,
    profile: DeviceProfile,
    pipeline: Pipeline,
    config: RelayConfig,
) -> Rig {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let peripheral = Arc::new(SimPeripheral::new());
    let controller = SessionController::new(
        config.with_require_pairing(false),
        profile,
        pipeline,
        central.clone(),
        peripheral.clone(),
    )
    .expect("controller");
    let handle = controller.handle();
    let task = tokio::spawn(async move { controller.run(&fixtures::DEVICE_ADDRESS).await });

    assert!(handle.wait_for(SessionState::Advertising, TIMEOUT).await);
    peripheral.connect_victim(victim());
    assert!(handle.wait_for(SessionState::Relaying, TIMEOUT).await);

    Rig {
        handle,
        central,
        peripheral,
        task,
    }
}

async fn shutdown(rig: Rig) {
    rig.handle.shutdown();
    let result = rig.task.await.expect("session task");
    assert!(result.is_ok(), "session ended with {:?}", result);
}

#[tokio::test]
async fn test_notification_passthrough_under_identity_pipeline() {
    let rig = relaying(
        fixtures::notify_only_profile(),
        Pipeline::identity(),
        RelayConfig::default(),
    )
    .await;
    let value_handle = 0x0012;
    let cccd_handle = 0x0013;

    let ack = rig.peripheral.enable_notifications(cccd_handle);
    assert_eq!(
        rig.peripheral.wait_for_response(ack, TIMEOUT).await,
        Some(GattResponse::WriteAck)
    );

    let target = rig
        .central
        .handle_of(&fixtures::NOTIFY_CHAR)
        .expect("target handle");
    assert!(rig.central.notify(target, vec![0x01, 0x02]));

    assert!(rig.peripheral.wait_for_notifications(1, TIMEOUT).await);
    assert_eq!(
        rig.peripheral.notifications(),
        vec![(value_handle, vec![0x01, 0x02], false)]
    );
    shutdown(rig).await;
}

#[tokio::test]
async fn test_outbound_xor_reaches_device() {
    let pipeline = Pipeline::identity().with_slot(
        TransformSlot::new("xor-ff", Transform::Xor(vec![0xFF])).with_direction(Direction::Outbound),
    );
    let rig = relaying(fixtures::vendor_profile(), pipeline, RelayConfig::default()).await;

    let id = rig
        .peripheral
        .write(fixtures::WRITE_HANDLE, vec![0x10], WriteKind::Request);
    assert_eq!(
        rig.peripheral.wait_for_response(id, TIMEOUT).await,
        Some(GattResponse::WriteAck)
    );

    let target = rig.central.handle_of(&fixtures::WRITE_CHAR).expect("target");
    assert_eq!(rig.central.writes(), vec![(target, vec![0xEF], true)]);
    shutdown(rig).await;
}

#[tokio::test]
async fn test_pipeline_loaded_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(
        br#"{ "transforms": [
            { "kind": "xor", "key": "ff", "direction": "outbound",
              "characteristic": "0000fff2-0000-1000-8000-00805f9b34fb" } ] }"#,
    )
    .expect("write pipeline");

    let mut profile_file = tempfile::NamedTempFile::new().expect("tempfile");
    profile_file
        .write_all(fixtures::VENDOR_PROFILE_JSON.as_bytes())
        .expect("write profile");
    let profile =
        DeviceProfile::load(profile_file.path(), &HostCapabilities::default()).expect("profile");

    let pipeline = PipelineConfig::load(file.path())
        .expect("pipeline config")
        .build(&profile)
        .expect("pipeline");
    let rig = relaying(profile, pipeline, RelayConfig::default()).await;

    // Only the selected characteristic is transformed
    let xored = rig
        .peripheral
        .write(fixtures::WRITE_HANDLE, vec![0x10], WriteKind::Request);
    let plain = rig
        .peripheral
        .write(fixtures::COMMAND_HANDLE, vec![0x10], WriteKind::Request);
    assert!(rig.peripheral.wait_for_response(xored, TIMEOUT).await.is_some());
    assert!(rig.peripheral.wait_for_response(plain, TIMEOUT).await.is_some());

    let write_target = rig.central.handle_of(&fixtures::WRITE_CHAR).expect("target");
    let command_target = rig.central.handle_of(&fixtures::COMMAND_CHAR).expect("target");
    assert_eq!(
        rig.central.writes(),
        vec![
            (write_target, vec![0xEF], true),
            // write-without-response only: forwarded as a command, acknowledged locally
            (command_target, vec![0x10], false),
        ]
    );
    shutdown(rig).await;
}

#[tokio::test]
async fn test_read_transparency() {
    let rig = relaying(
        fixtures::vendor_profile(),
        Pipeline::identity(),
        RelayConfig::default(),
    )
    .await;
    let notify_target = rig.central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    rig.central.set_value(notify_target, vec![0xDE, 0xAD, 0xBE, 0xEF]);

    for (victim_handle, expected) in [
        (fixtures::MANUFACTURER_HANDLE, b"OAT".to_vec()),
        (fixtures::NOTIFY_HANDLE, vec![0xDE, 0xAD, 0xBE, 0xEF]),
    ] {
        let id = rig.peripheral.read(victim_handle, 0);
        assert_eq!(
            rig.peripheral.wait_for_response(id, TIMEOUT).await,
            Some(GattResponse::Value(expected))
        );
    }
    shutdown(rig).await;
}

#[tokio::test]
async fn test_inbound_drop_suppresses_notifications() {
    let pipeline = Pipeline::identity().with_slot(
        TransformSlot::new("mute", Transform::Drop(DropReply::Ack))
            .with_direction(Direction::Inbound)
            .with_handle(fixtures::NOTIFY_HANDLE),
    );
    let rig = relaying(fixtures::vendor_profile(), pipeline, RelayConfig::default()).await;

    let ack = rig
        .peripheral
        .enable_notifications(fixtures::NOTIFY_CCCD_HANDLE);
    assert!(rig.peripheral.wait_for_response(ack, TIMEOUT).await.is_some());

    let target = rig.central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    assert!(rig.central.notify(target, vec![0x01, 0x02]));
    assert!(
        !rig.peripheral
            .wait_for_notifications(1, Duration::from_millis(200))
            .await
    );
    assert!(rig.peripheral.notifications().is_empty());
    shutdown(rig).await;
}

#[tokio::test]
async fn test_device_errors_reach_victim_as_native_codes() {
    let rig = relaying(
        fixtures::vendor_profile(),
        Pipeline::identity(),
        RelayConfig::default(),
    )
    .await;
    let target = rig.central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    rig.central
        .fail_reads(target, GattErrorCode::InsufficientEncryption);

    let id = rig.peripheral.read(fixtures::NOTIFY_HANDLE, 0);
    assert_eq!(
        rig.peripheral.wait_for_response(id, TIMEOUT).await,
        Some(GattResponse::Error(GattErrorCode::InsufficientEncryption))
    );
    shutdown(rig).await;
}

#[tokio::test]
async fn test_upstream_timeout_surfaces_to_victim() {
    let rig = relaying(
        fixtures::vendor_profile(),
        Pipeline::identity(),
        RelayConfig::default().with_operation_timeout(Duration::from_millis(100)),
    )
    .await;
    let target = rig.central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    rig.central.set_read_delay(target, Duration::from_secs(5));

    let id = rig.peripheral.read(fixtures::NOTIFY_HANDLE, 0);
    let response = rig.peripheral.wait_for_response(id, TIMEOUT).await;
    assert_eq!(response, Some(GattResponse::Error(GattErrorCode::Timeout)));
    assert_eq!(GattErrorCode::Timeout.att_code(), 0x0E);
    shutdown(rig).await;
}

#[tokio::test]
async fn test_write_command_is_never_answered() {
    let rig = relaying(
        fixtures::vendor_profile(),
        Pipeline::identity(),
        RelayConfig::default(),
    )
    .await;
    let command = rig
        .peripheral
        .write(fixtures::COMMAND_HANDLE, vec![0x42], WriteKind::Command);
    // A later request proves the command was processed first
    let check = rig.peripheral.read(fixtures::MANUFACTURER_HANDLE, 0);
    assert!(rig.peripheral.wait_for_response(check, TIMEOUT).await.is_some());

    assert_eq!(rig.peripheral.response_to(command), None);
    let target = rig.central.handle_of(&fixtures::COMMAND_CHAR).expect("target");
    assert_eq!(rig.central.writes(), vec![(target, vec![0x42], false)]);
    shutdown(rig).await;
}

#[tokio::test]
async fn test_long_read_continues_from_cache() {
    let rig = relaying(
        fixtures::vendor_profile(),
        Pipeline::identity(),
        RelayConfig::default(),
    )
    .await;
    let target = rig.central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    let long: Vec<u8> = (0u8..30).collect();
    rig.central.set_value(target, long.clone());

    let first = rig.peripheral.read(fixtures::NOTIFY_HANDLE, 0);
    assert_eq!(
        rig.peripheral.wait_for_response(first, TIMEOUT).await,
        Some(GattResponse::Value(long.clone()))
    );

    // The device changing underneath must not tear the long read
    rig.central.set_value(target, vec![0xFF; 30]);
    let blob = rig.peripheral.read(fixtures::NOTIFY_HANDLE, 22);
    assert_eq!(
        rig.peripheral.wait_for_response(blob, TIMEOUT).await,
        Some(GattResponse::Value(long[22..].to_vec()))
    );
    shutdown(rig).await;
}

#[tokio::test]
async fn test_victim_cccd_drives_device_subscription_without_auto_subscribe() {
    let rig = relaying(
        fixtures::notify_only_profile(),
        Pipeline::identity(),
        RelayConfig::default().with_auto_subscribe(false),
    )
    .await;
    let target = rig.central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    assert_eq!(rig.central.subscribe_count(), 0);
    assert!(!rig.central.is_subscribed(target));

    let ack = rig.peripheral.enable_notifications(0x0013);
    assert_eq!(
        rig.peripheral.wait_for_response(ack, TIMEOUT).await,
        Some(GattResponse::WriteAck)
    );
    assert_eq!(rig.central.subscribe_count(), 1);
    assert!(rig.central.is_subscribed(target));

    assert!(rig.central.notify(target, vec![0x07]));
    assert!(rig.peripheral.wait_for_notifications(1, TIMEOUT).await);
    assert_eq!(rig.peripheral.notifications(), vec![(0x0012, vec![0x07], false)]);

    let ack = rig.peripheral.disable_notifications(0x0013);
    assert_eq!(
        rig.peripheral.wait_for_response(ack, TIMEOUT).await,
        Some(GattResponse::WriteAck)
    );
    assert_eq!(rig.central.unsubscribe_count(), 1);
    assert!(!rig.central.is_subscribed(target));

    // Re-enabling subscribes again
    let ack = rig.peripheral.enable_notifications(0x0013);
    assert!(rig.peripheral.wait_for_response(ack, TIMEOUT).await.is_some());
    assert_eq!(rig.central.subscribe_count(), 2);
    shutdown(rig).await;
}

#[tokio::test]
async fn test_refused_auto_subscribe_is_retried_on_victim_cccd() {
    let profile = fixtures::notify_only_profile();
    let central = Arc::new(SimCentral::from_profile(&profile));
    let target = central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    central.refuse_subscriptions(target, GattErrorCode::InsufficientAuthorization);

    let rig = relaying_to(central, profile, Pipeline::identity(), RelayConfig::default()).await;
    assert_eq!(rig.central.subscribe_count(), 1);
    assert!(!rig.central.is_subscribed(target));

    // Still refused: the victim sees the device's code and the CCCD stays off
    let ack = rig.peripheral.enable_notifications(0x0013);
    assert_eq!(
        rig.peripheral.wait_for_response(ack, TIMEOUT).await,
        Some(GattResponse::Error(GattErrorCode::InsufficientAuthorization))
    );
    assert_eq!(rig.central.subscribe_count(), 2);
    let cccd = rig.peripheral.read(0x0013, 0);
    assert_eq!(
        rig.peripheral.wait_for_response(cccd, TIMEOUT).await,
        Some(GattResponse::Value(vec![0x00, 0x00]))
    );

    rig.central.allow_subscriptions(target);
    let ack = rig.peripheral.enable_notifications(0x0013);
    assert_eq!(
        rig.peripheral.wait_for_response(ack, TIMEOUT).await,
        Some(GattResponse::WriteAck)
    );
    assert!(rig.central.is_subscribed(target));

    assert!(rig.central.notify(target, vec![0x09]));
    assert!(rig.peripheral.wait_for_notifications(1, TIMEOUT).await);
    assert_eq!(rig.peripheral.notifications(), vec![(0x0012, vec![0x09], false)]);
    shutdown(rig).await;
}

#[tokio::test]
async fn test_unconfirmed_indication_does_not_stall_relay() {
    let mut profile = fixtures::notify_only_profile();
    profile.services[0].characteristics[0].properties.indicate = true;
    let rig = relaying(profile, Pipeline::identity(), RelayConfig::default()).await;
    let target = rig.central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    rig.central.set_value(target, vec![0x05]);

    rig.peripheral.hold_confirmations();
    let ack = rig.peripheral.enable_indications(0x0013);
    assert_eq!(
        rig.peripheral.wait_for_response(ack, TIMEOUT).await,
        Some(GattResponse::WriteAck)
    );

    assert!(rig.central.notify(target, vec![0x01]));
    assert!(rig.peripheral.wait_for_notifications(1, TIMEOUT).await);

    // The victim has not confirmed, requests are still answered
    let read = rig.peripheral.read(0x0012, 0);
    assert_eq!(
        rig.peripheral.wait_for_response(read, TIMEOUT).await,
        Some(GattResponse::Value(vec![0x05]))
    );

    // and the device leaving still ends the session
    rig.central.drop_link();
    let result = tokio::time::timeout(TIMEOUT, rig.task)
        .await
        .expect("session ends")
        .expect("session task");
    assert!(matches!(result, Err(RelayError::UpstreamLost)));
    assert_eq!(rig.peripheral.notifications(), vec![(0x0012, vec![0x01], true)]);
}
