//! Victim-visible ordering: responses follow request order even when the
//! device answers out of order, and notifications never wait behind them.

use blerelay_core::gatt::{GattErrorCode, GattResponse, WriteKind};
use blerelay_core::pipeline::{Direction, DropReply, Pipeline, Transform, TransformSlot};
use blerelay_core::session::{RelayConfig, SessionController, SessionState};
use blerelay_core::sim::{fixtures, SimCentral, SimPeripheral};
use blerelay_core::topology::PeerAddress;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(3);

async fn start(pipeline: Pipeline) -> (Arc<SimCentral>, Arc<SimPeripheral>, blerelay_core::SessionHandle) {
    let profile = fixtures::vendor_profile();
    let central = Arc::new(SimCentral::from_profile(&profile));
    let peripheral = Arc::new(SimPeripheral::new());
    let controller = SessionController::new(
        RelayConfig::default().with_require_pairing(false),
        profile,
        pipeline,
        central.clone(),
        peripheral.clone(),
    )
    .expect("controller");
    let handle = controller.handle();
    tokio::spawn(async move { controller.run(&fixtures::DEVICE_ADDRESS).await });

    assert!(handle.wait_for(SessionState::Advertising, TIMEOUT).await);
    peripheral.connect_victim(PeerAddress([0x5A, 0x5A, 0x5A, 0x00, 0x00, 0x02]));
    assert!(handle.wait_for(SessionState::Relaying, TIMEOUT).await);
    (central, peripheral, handle)
}

#[tokio::test]
async fn test_responses_follow_request_order() {
    let (central, peripheral, handle) = start(Pipeline::identity()).await;
    let slow = central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    central.set_value(slow, vec![0x01]);
    central.set_read_delay(slow, Duration::from_millis(300));

    let first = peripheral.read(fixtures::NOTIFY_HANDLE, 0);
    let second = peripheral.read(fixtures::MANUFACTURER_HANDLE, 0);
    assert!(peripheral.wait_for_responses(2, TIMEOUT).await);

    assert_eq!(
        peripheral.responses(),
        vec![
            (first, GattResponse::Value(vec![0x01])),
            (second, GattResponse::Value(b"OAT".to_vec())),
        ]
    );
    handle.shutdown();
}

#[tokio::test]
async fn test_dropped_request_still_waits_its_turn() {
    let pipeline = Pipeline::identity().with_slot(
        TransformSlot::new("swallow", Transform::Drop(DropReply::Ack))
            .with_direction(Direction::Outbound)
            .with_handle(fixtures::WRITE_HANDLE),
    );
    let (central, peripheral, handle) = start(pipeline).await;
    let slow = central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    central.set_read_delay(slow, Duration::from_millis(200));

    let first = peripheral.read(fixtures::NOTIFY_HANDLE, 0);
    let second = peripheral.write(fixtures::WRITE_HANDLE, vec![0x10], WriteKind::Request);
    assert!(peripheral.wait_for_responses(2, TIMEOUT).await);

    let order: Vec<_> = peripheral.responses().into_iter().map(|(id, _)| id).collect();
    assert_eq!(order, vec![first, second]);
    assert_eq!(peripheral.response_to(second), Some(GattResponse::WriteAck));
    assert!(central.writes().is_empty());
    handle.shutdown();
}

#[tokio::test]
async fn test_notifications_bypass_pending_responses() {
    let (central, peripheral, handle) = start(Pipeline::identity()).await;
    let ack = peripheral.enable_notifications(fixtures::NOTIFY_CCCD_HANDLE);
    assert!(peripheral.wait_for_response(ack, TIMEOUT).await.is_some());

    let target = central.handle_of(&fixtures::NOTIFY_CHAR).expect("target");
    central.set_read_delay(target, Duration::from_secs(1));
    let blocked = peripheral.read(fixtures::NOTIFY_HANDLE, 0);

    assert!(central.notify(target, vec![0x07]));
    assert!(
        peripheral
            .wait_for_notifications(1, Duration::from_millis(500))
            .await
    );
    assert_eq!(peripheral.response_to(blocked), None);

    assert!(peripheral.wait_for_response(blocked, TIMEOUT).await.is_some());
    handle.shutdown();
}

#[tokio::test]
async fn test_reused_request_id_is_answered_after_the_original() {
    let (central, peripheral, handle) = start(Pipeline::identity()).await;
    let slow = central.handle_of(&fixtures::MANUFACTURER_CHAR).expect("target");
    central.set_read_delay(slow, Duration::from_millis(200));

    let id = peripheral.read(fixtures::MANUFACTURER_HANDLE, 0);
    peripheral.read_as(id, fixtures::NOTIFY_HANDLE, 0);
    assert!(peripheral.wait_for_responses(2, TIMEOUT).await);

    assert_eq!(
        peripheral.responses(),
        vec![
            (id, GattResponse::Value(b"OAT".to_vec())),
            (id, GattResponse::Error(GattErrorCode::UnlikelyError)),
        ]
    );
    handle.shutdown();
}
