mod support;

use intercom::call_session::{
    CallError, CallHandle, CallSessionController, CallState, Role, StateUpdate,
};
use intercom::media::AudioConstraints;
use intercom::signaling::{CallId, SignalingError, SignalingEvent, SignalingLink};
use std::sync::Arc;
use support::*;
use tokio::sync::mpsc;

type Updates = mpsc::UnboundedReceiver<StateUpdate>;

fn spawn(device: &Arc<FakeDevice>, broker: &Arc<FakeBroker>) -> (CallHandle, Updates) {
    CallSessionController::spawn(device.clone(), broker.clone(), AudioConstraints::voice())
}

async fn expect_state(updates: &mut Updates, state: CallState, status: Option<&str>) -> StateUpdate {
    let update = next_update(updates).await;
    assert_eq!(update.state, state);
    assert_eq!(update.status.as_deref(), status);
    update
}

/// Host bis Connected, liefert den Link
async fn connected_host(
    device: &Arc<FakeDevice>,
    broker: &Arc<FakeBroker>,
) -> (CallHandle, Updates, Arc<FakeLink>) {
    let (calls, mut updates) = spawn(device, broker);
    calls.start_host().await.unwrap();
    expect_state(&mut updates, CallState::Registering, Some("Registering room…")).await;
    expect_state(&mut updates, CallState::AwaitingPeer, Some("Waiting for the other party…")).await;

    let link = broker.wait_for_link().await;
    link.incoming_call("caller-1").await;
    expect_state(&mut updates, CallState::Connecting, Some("Incoming call…")).await;
    expect_state(&mut updates, CallState::Connected, Some("Connected – line open")).await;
    (calls, updates, link)
}

// ============================================================================
// HOST
// ============================================================================

#[tokio::test]
async fn test_host_registers_and_accepts_caller() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.start_host().await.unwrap();
    let registering = expect_state(&mut updates, CallState::Registering, Some("Registering room…")).await;
    let code = registering.room_code.expect("room code published");
    assert_eq!(code.as_str().len(), 6);
    assert!(code
        .as_str()
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

    let awaiting = expect_state(
        &mut updates,
        CallState::AwaitingPeer,
        Some("Waiting for the other party…"),
    )
    .await;
    assert_eq!(awaiting.room_code.as_ref(), Some(&code));

    let snapshot = calls.snapshot().await.unwrap();
    assert_eq!(snapshot.role, Role::Host);
    assert!(snapshot.local_audio.is_some());
    assert!(snapshot.remote_audio.is_none());
    assert!(snapshot.signaling_open);

    let link = broker.wait_for_link().await;
    let call = link.incoming_call("caller-1").await;
    expect_state(&mut updates, CallState::Connecting, Some("Incoming call…")).await;
    expect_state(&mut updates, CallState::Connected, Some("Connected – line open")).await;

    assert_eq!(link.answered(), vec![call]);
    let snapshot = calls.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Connected);
    assert_eq!(snapshot.local_audio, Some(device.issued()[0].id()));
    assert_eq!(snapshot.remote_audio, Some(link.remotes()[0].id()));
}

#[tokio::test]
async fn test_registration_conflict_fails_and_releases() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::registering(RegisterMode::Fail(SignalingError::IdentityTaken));
    let (calls, mut updates) = spawn(&device, &broker);

    calls.start_host().await.unwrap();
    expect_state(&mut updates, CallState::Registering, Some("Registering room…")).await;
    expect_state(
        &mut updates,
        CallState::Failed(CallError::RegistrationConflict),
        Some("Room code already in use"),
    )
    .await;
    expect_state(&mut updates, CallState::Disconnected, Some("Room code already in use")).await;

    assert!(device.all_released());
    assert!(broker.last_link().unwrap().is_closed());
}

#[tokio::test]
async fn test_second_caller_is_rejected() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates, link) = connected_host(&device, &broker).await;
    let remote_before = calls.snapshot().await.unwrap().remote_audio;

    link.incoming_call("caller-2").await;
    eventually("reject", || !link.rejected().is_empty()).await;

    assert_eq!(link.rejected()[0].as_str(), "caller-2");
    assert_eq!(link.answered().len(), 1);
    let snapshot = calls.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Connected);
    assert_eq!(snapshot.remote_audio, remote_before);
    assert_quiet(&mut updates).await;
}

// ============================================================================
// CLIENT
// ============================================================================

#[tokio::test]
async fn test_client_dials_and_connects() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.join_room(" ab12cd ").await.unwrap();
    let connecting = expect_state(&mut updates, CallState::Connecting, Some("Calling room…")).await;
    assert_eq!(connecting.room_code.unwrap().as_str(), "AB12CD");

    let link = broker.wait_for_link().await;
    let remote = link.remote_answers().await;
    expect_state(&mut updates, CallState::Connected, Some("Connected – line open")).await;

    let snapshot = calls.snapshot().await.unwrap();
    assert_eq!(snapshot.role, Role::Client);
    assert_eq!(snapshot.remote_audio, Some(remote.id()));
}

#[tokio::test]
async fn test_unreachable_room_fails_with_room_not_found() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::dial_failing(SignalingError::Unreachable);
    let (calls, mut updates) = spawn(&device, &broker);

    calls.join_room("AB12CD").await.unwrap();
    expect_state(&mut updates, CallState::Connecting, Some("Calling room…")).await;
    expect_state(
        &mut updates,
        CallState::Failed(CallError::PeerUnreachable),
        Some("Room not found"),
    )
    .await;
    let last = expect_state(&mut updates, CallState::Disconnected, Some("Room not found")).await;
    assert!(last.room_code.is_none());

    assert!(device.all_released());
    assert!(broker.last_link().unwrap().is_closed());
    assert_eq!(calls.snapshot().await.unwrap().state, CallState::Disconnected);
}

#[tokio::test]
async fn test_invalid_code_touches_nothing() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    for code in ["AB1", "AB-12C", "", "ABCDEFG"] {
        assert_eq!(calls.join_room(code).await, Err(CallError::InvalidCode));
    }

    assert_eq!(device.requests(), 0);
    assert_eq!(broker.connects(), 0);
    assert_quiet(&mut updates).await;
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_microphone_denied() {
    let device = FakeDevice::denying();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.start_host().await.unwrap();
    expect_state(
        &mut updates,
        CallState::Failed(CallError::DevicePermissionDenied),
        Some("Cannot access the microphone"),
    )
    .await;
    expect_state(&mut updates, CallState::Disconnected, Some("Cannot access the microphone")).await;
    assert_eq!(broker.connects(), 0);
}

#[tokio::test]
async fn test_remote_hangup_ends_call_gracefully() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (_calls, mut updates, link) = connected_host(&device, &broker).await;

    link.emit(SignalingEvent::Closed {
        call: "caller-1".into(),
    })
    .await;
    expect_state(&mut updates, CallState::Disconnected, Some("Call ended")).await;

    assert!(device.all_released());
    assert!(link.remotes().iter().all(|t| !t.is_live()));
    assert!(link.is_closed());
}

#[tokio::test]
async fn test_connection_lost_while_connected_drops_call() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (_calls, mut updates, link) = connected_host(&device, &broker).await;

    link.emit(SignalingEvent::Error(SignalingError::ConnectionLost)).await;
    expect_state(
        &mut updates,
        CallState::Failed(CallError::CallDropped),
        Some("Call dropped"),
    )
    .await;
    expect_state(&mut updates, CallState::Disconnected, Some("Call dropped")).await;
    assert!(device.all_released());
}

// ============================================================================
// DISCONNECT
// ============================================================================

#[tokio::test]
async fn test_disconnect_while_registering() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::registering(RegisterMode::Hold);
    let (calls, mut updates) = spawn(&device, &broker);

    calls.start_host().await.unwrap();
    expect_state(&mut updates, CallState::Registering, Some("Registering room…")).await;
    let link = broker.wait_for_link().await;

    calls.disconnect().await.unwrap();
    expect_state(&mut updates, CallState::Disconnected, None).await;
    assert!(device.all_released());
    assert!(link.is_closed());

    // die abgebrochene Registrierung darf nichts mehr melden
    assert_quiet(&mut updates).await;
    assert_eq!(calls.snapshot().await.unwrap().state, CallState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_while_awaiting_peer() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.start_host().await.unwrap();
    expect_state(&mut updates, CallState::Registering, Some("Registering room…")).await;
    expect_state(&mut updates, CallState::AwaitingPeer, Some("Waiting for the other party…")).await;

    calls.disconnect().await.unwrap();
    expect_state(&mut updates, CallState::Disconnected, None).await;
    assert!(device.all_released());
    assert!(broker.last_link().unwrap().is_closed());
}

#[tokio::test]
async fn test_disconnect_while_connecting() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.join_room("XY98ZW").await.unwrap();
    expect_state(&mut updates, CallState::Connecting, Some("Calling room…")).await;
    let link = broker.wait_for_link().await;
    eventually("dial", || link.dialed().is_some()).await;

    calls.disconnect().await.unwrap();
    expect_state(&mut updates, CallState::Disconnected, None).await;
    assert!(device.all_released());
    assert!(link.is_closed());

    // verspätete Antwort der Gegenseite wird verworfen
    let late = link.remote_answers().await;
    eventually("late remote stopped", || !late.is_live()).await;
    assert_quiet(&mut updates).await;
}

#[tokio::test]
async fn test_disconnect_while_connected_releases_everything() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates, link) = connected_host(&device, &broker).await;

    calls.disconnect().await.unwrap();
    expect_state(&mut updates, CallState::Disconnected, None).await;

    assert!(device.all_released());
    assert!(link.remotes().iter().all(|t| !t.is_live()));
    assert!(link.is_closed());

    let snapshot = calls.snapshot().await.unwrap();
    assert_eq!(snapshot.role, Role::None);
    assert!(snapshot.local_audio.is_none());
    assert!(snapshot.remote_audio.is_none());
    assert!(!snapshot.signaling_open);
}

#[tokio::test]
async fn test_disconnect_when_idle_is_noop() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.disconnect().await.unwrap();
    calls.disconnect().await.unwrap();
    assert_quiet(&mut updates).await;
}

#[tokio::test]
async fn test_late_microphone_grant_is_discarded() {
    let (device, grant) = FakeDevice::gated();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.start_host().await.unwrap();
    eventually("permission prompt", || device.requests() == 1).await;
    calls.disconnect().await.unwrap();

    grant.send(()).unwrap();
    eventually("late track issued", || device.issued().len() == 1).await;
    eventually("late track stopped", || device.all_released()).await;

    assert_eq!(broker.connects(), 0);
    assert_quiet(&mut updates).await;
    assert_eq!(calls.snapshot().await.unwrap().state, CallState::Disconnected);
}

#[tokio::test]
async fn test_new_session_after_disconnect() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates, _link) = connected_host(&device, &broker).await;

    assert_eq!(calls.start_host().await, Err(CallError::SessionActive));

    calls.disconnect().await.unwrap();
    expect_state(&mut updates, CallState::Disconnected, None).await;

    calls.join_room("AB12CD").await.unwrap();
    expect_state(&mut updates, CallState::Connecting, Some("Calling room…")).await;
    eventually("second broker connection", || broker.connects() == 2).await;
    assert_eq!(device.requests(), 2);
}

// ============================================================================
// CONTROLS
// ============================================================================

#[tokio::test]
async fn test_mute_keeps_local_stream() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, _updates, _link) = connected_host(&device, &broker).await;
    let local = device.issued()[0].clone();

    assert_eq!(calls.toggle_mute().await, Ok(true));
    assert!(!local.is_enabled());
    assert!(local.is_live());

    let snapshot = calls.snapshot().await.unwrap();
    assert!(snapshot.muted);
    assert_eq!(snapshot.local_audio, Some(local.id()));

    assert_eq!(calls.toggle_mute().await, Ok(false));
    assert!(local.is_enabled());
    assert_eq!(calls.set_muted(true).await, Ok(true));
    assert!(!local.is_enabled());
}

#[tokio::test]
async fn test_speaker_only_affects_playback() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, _updates, link) = connected_host(&device, &broker).await;
    let local = device.issued()[0].clone();
    let remote = link.remotes()[0].clone();

    assert_eq!(calls.toggle_speaker().await, Ok(false));
    assert!(!remote.is_enabled());
    assert!(local.is_enabled());

    assert_eq!(calls.set_speaker_enabled(true).await, Ok(true));
    assert!(remote.is_enabled());
}

#[tokio::test]
async fn test_controls_without_session() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, _updates) = spawn(&device, &broker);

    assert_eq!(calls.toggle_mute().await, Err(CallError::NoSession));
    assert_eq!(calls.toggle_speaker().await, Err(CallError::NoSession));
}

#[tokio::test]
async fn test_dropping_handles_shuts_down_controller() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates, link) = connected_host(&device, &broker).await;

    drop(calls);
    expect_state(&mut updates, CallState::Disconnected, None).await;
    assert!(within(updates.recv()).await.is_none());
    assert!(device.all_released());
    assert!(link.is_closed());
}

// ============================================================================
// ORDERING
// ============================================================================

#[tokio::test]
async fn test_caller_before_registration_ack_is_answered() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::registering(RegisterMode::CallerFirst("fast-caller"));
    let (calls, mut updates) = spawn(&device, &broker);

    calls.start_host().await.unwrap();
    expect_state(&mut updates, CallState::Registering, Some("Registering room…")).await;
    expect_state(&mut updates, CallState::AwaitingPeer, Some("Waiting for the other party…")).await;
    expect_state(&mut updates, CallState::Connecting, Some("Incoming call…")).await;
    expect_state(&mut updates, CallState::Connected, Some("Connected – line open")).await;

    let link = broker.last_link().unwrap();
    assert_eq!(link.answered(), vec![CallId::from("fast-caller")]);
    assert!(link.rejected().is_empty());
}

#[tokio::test]
async fn test_unexpected_caller_on_client_is_rejected() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.join_room("AB12CD").await.unwrap();
    expect_state(&mut updates, CallState::Connecting, Some("Calling room…")).await;
    let link = broker.wait_for_link().await;

    link.incoming_call("stray").await;
    eventually("reject", || !link.rejected().is_empty()).await;
    assert_eq!(link.rejected()[0].as_str(), "stray");
    assert_eq!(calls.snapshot().await.unwrap().state, CallState::Connecting);
}

#[tokio::test]
async fn test_close_while_connecting_drops_call() {
    let device = FakeDevice::granting();
    let broker = FakeBroker::new();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.join_room("AB12CD").await.unwrap();
    expect_state(&mut updates, CallState::Connecting, Some("Calling room…")).await;
    let link = broker.wait_for_link().await;
    eventually("dial", || link.dialed().is_some()).await;

    link.emit(SignalingEvent::Closed {
        call: link.dialed().unwrap(),
    })
    .await;
    expect_state(
        &mut updates,
        CallState::Failed(CallError::CallDropped),
        Some("Call dropped"),
    )
    .await;
    expect_state(&mut updates, CallState::Disconnected, Some("Call dropped")).await;

    assert!(device.all_released());
    assert!(link.is_closed());
}

#[tokio::test]
async fn test_late_broker_connection_is_closed() {
    let device = FakeDevice::granting();
    let (broker, connected) = FakeBroker::gated();
    let (calls, mut updates) = spawn(&device, &broker);

    calls.start_host().await.unwrap();
    expect_state(&mut updates, CallState::Registering, Some("Registering room…")).await;
    eventually("connect attempt", || broker.connects() == 1).await;

    calls.disconnect().await.unwrap();
    expect_state(&mut updates, CallState::Disconnected, None).await;
    assert!(device.all_released());

    connected.send(()).unwrap();
    let link = broker.wait_for_link().await;
    eventually("late link closed", || link.is_closed()).await;
    assert_quiet(&mut updates).await;
}
