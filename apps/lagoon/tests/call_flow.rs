use std::sync::Arc;
use std::time::Duration;

use lagoon::engine::mock::MockEngine;
use lagoon::media::mock::MockMediaDevices;
use lagoon::media::{CallKind, MediaAcquisitionError, MediaKind};
use lagoon::room::TransportAddress;
use lagoon::session::{CallController, CallHandle, CallSnapshot, SessionConfig, SessionState};
use lagoon::signaling::local::LocalRelayHub;
use lagoon::signaling::{CallAction, ClientEvent, ConnectionQuality};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);
const ROOM: &str = "r1";

struct Party {
    handle: CallHandle,
    address: TransportAddress,
    engine: Arc<MockEngine>,
    devices: Arc<MockMediaDevices>,
    task: JoinHandle<()>,
}

fn party(hub: &Arc<LocalRelayHub>, user: &str) -> Party {
    let (relay, relay_events) = hub.connect();
    let address = relay.address().clone();
    let engine = Arc::new(MockEngine::new());
    let devices = Arc::new(MockMediaDevices::new());
    let (handle, task) = CallController::spawn(
        SessionConfig::new(ROOM, user),
        engine.clone(),
        devices.clone(),
        Arc::new(relay),
        relay_events,
    );
    Party {
        handle,
        address,
        engine,
        devices,
        task,
    }
}

async fn join(hub: &Arc<LocalRelayHub>, user: &str) -> Party {
    let party = party(hub, user);
    wait_until(|| hub.members(ROOM).contains(&party.address)).await;
    party
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_state(party: &Party, state: SessionState) -> CallSnapshot {
    timeout(WAIT, party.handle.wait_for(|snapshot| snapshot.state == state))
        .await
        .expect("state not reached in time")
        .expect("controller running")
}

async fn connected_pair(hub: &Arc<LocalRelayHub>, kind: CallKind) -> (Party, Party) {
    let a = join(hub, "alice").await;
    let b = join(hub, "bob").await;
    match kind {
        CallKind::Video => a.handle.start_video_call().expect("start"),
        CallKind::Voice => a.handle.start_voice_call().expect("start"),
    }
    wait_state(&a, SessionState::Connected).await;
    wait_state(&b, SessionState::Connected).await;
    (a, b)
}

fn hangups(events: &[ClientEvent]) -> usize {
    events
        .iter()
        .filter(|event| {
            matches!(
                event,
                ClientEvent::CallControl(control) if control.action == CallAction::Hangup
            )
        })
        .count()
}

#[tokio::test]
async fn lone_caller_waits_then_offers_once_peer_joins() {
    let hub = LocalRelayHub::new();
    let a = join(&hub, "alice").await;

    a.handle.start_video_call().expect("start");
    wait_state(&a, SessionState::Negotiating).await;
    wait_until(|| a.engine.created() == 1).await;
    sleep(Duration::from_millis(20)).await;
    assert!(hub.sent_by(&a.address, "offer").is_empty());
    assert!(hub.sent_by(&a.address, "ice-candidate").is_empty());

    let b = join(&hub, "bob").await;
    let b_snapshot = wait_state(&b, SessionState::Connected).await;
    let a_snapshot = wait_state(&a, SessionState::Connected).await;

    let offers = hub.sent_by(&a.address, "offer");
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].target(), Some(&b.address));
    assert_eq!(hub.sent_by(&b.address, "answer").len(), 1);
    assert!(hub.sent_by(&b.address, "offer").is_empty());

    assert_eq!(b_snapshot.call_kind, Some(CallKind::Video));
    assert!(a_snapshot.has_remote_media);
    assert_eq!(a.engine.created(), 1);
    assert_eq!(b.engine.created(), 1);
    assert_eq!(
        a_snapshot.remote.map(|remote| remote.address),
        Some(b.address.clone())
    );
}

#[tokio::test]
async fn voice_offer_is_answered_as_voice() {
    let hub = LocalRelayHub::new();
    let (a, b) = connected_pair(&hub, CallKind::Voice).await;

    assert_eq!(b.handle.snapshot().call_kind, Some(CallKind::Voice));
    assert!(!b.handle.snapshot().is_video_enabled);
    let kinds: Vec<_> = b.devices.issued_tracks().iter().map(|t| t.kind()).collect();
    assert_eq!(kinds, vec![MediaKind::Audio]);
    assert_eq!(a.engine.created(), 1);
}

#[tokio::test]
async fn late_joiner_can_start_the_call() {
    let hub = LocalRelayHub::new();
    let a = join(&hub, "alice").await;
    let b = join(&hub, "bob").await;
    wait_until(|| b.handle.snapshot().remote.is_some()).await;

    b.handle.start_video_call().expect("start");
    wait_state(&a, SessionState::Connected).await;
    wait_state(&b, SessionState::Connected).await;

    let offers = hub.sent_by(&b.address, "offer");
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].target(), Some(&a.address));
    assert_eq!(hub.sent_by(&a.address, "answer").len(), 1);
}

#[tokio::test]
async fn local_hangup_closes_both_sides_once() {
    let hub = LocalRelayHub::new();
    let (a, b) = connected_pair(&hub, CallKind::Video).await;

    a.handle.hangup().expect("hangup");
    a.handle.hangup().expect("second hangup");
    wait_state(&b, SessionState::Idle).await;
    let a_snapshot = wait_state(&a, SessionState::Idle).await;
    sleep(Duration::from_millis(20)).await;

    assert_eq!(hangups(&hub.sent_by(&a.address, "call-control")), 1);
    assert_eq!(hangups(&hub.sent_by(&b.address, "call-control")), 0);
    assert_eq!(a_snapshot.call_kind, None);
    assert!(a.engine.connections().iter().all(|pc| pc.is_closed()));
    assert!(b.engine.connections().iter().all(|pc| pc.is_closed()));
    assert!(a.devices.issued_tracks().iter().all(|t| t.is_stopped()));
    assert!(b.devices.issued_tracks().iter().all(|t| t.is_stopped()));
}

#[tokio::test]
async fn peer_departure_ends_the_call_quietly() {
    let hub = LocalRelayHub::new();
    let (a, b) = connected_pair(&hub, CallKind::Voice).await;

    b.task.abort();
    let snapshot = wait_state(&a, SessionState::Idle).await;
    wait_until(|| a.handle.snapshot().remote.is_none()).await;

    assert_eq!(snapshot.call_kind, None);
    assert!(hub.sent_by(&a.address, "call-control").is_empty());
    assert_eq!(hub.members(ROOM), vec![a.address.clone()]);
}

#[tokio::test]
async fn mute_is_reported_to_the_peer() {
    let hub = LocalRelayHub::new();
    let (a, b) = connected_pair(&hub, CallKind::Video).await;

    a.handle.toggle_mute().expect("mute");
    wait_until(|| b.handle.snapshot().remote_muted).await;
    let snapshot = a.handle.snapshot();
    assert!(snapshot.is_muted);
    assert_eq!(snapshot.state, SessionState::Connected);
    for track in a.devices.issued_tracks() {
        assert_eq!(track.is_enabled(), track.kind() == MediaKind::Video);
    }

    a.handle.toggle_mute().expect("unmute");
    wait_until(|| !b.handle.snapshot().remote_muted).await;

    a.handle.toggle_video().expect("camera");
    wait_until(|| !a.handle.snapshot().is_video_enabled).await;
    assert_eq!(a.handle.snapshot().state, SessionState::Connected);
}

#[tokio::test]
async fn denied_media_resets_to_idle_without_offering() {
    let hub = LocalRelayHub::new();
    let a = join(&hub, "alice").await;
    let _b = join(&hub, "bob").await;
    wait_until(|| a.handle.snapshot().remote.is_some()).await;
    a.devices.fail_with(MediaAcquisitionError::PermissionDenied);

    a.handle.start_video_call().expect("start");
    let snapshot = timeout(
        WAIT,
        a.handle.wait_for(|snapshot| snapshot.last_error.is_some()),
    )
    .await
    .expect("failure surfaced")
    .expect("controller running");

    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.call_kind, None);
    assert!(hub.sent_by(&a.address, "offer").is_empty());
    assert_eq!(a.engine.created(), 0);

    a.devices.recover();
    a.handle.start_voice_call().expect("retry");
    wait_state(&a, SessionState::Connected).await;
}

#[tokio::test]
async fn rejoining_peer_gets_a_fresh_offer() {
    let hub = LocalRelayHub::new();
    let (a, b) = connected_pair(&hub, CallKind::Voice).await;

    b.handle.shutdown().expect("shutdown");
    timeout(WAIT, b.task).await.expect("b stops").expect("b task");
    wait_state(&a, SessionState::Idle).await;

    let c = join(&hub, "bob").await;
    a.handle.start_voice_call().expect("call again");
    wait_state(&a, SessionState::Connected).await;
    wait_state(&c, SessionState::Connected).await;

    let offers = hub.sent_by(&a.address, "offer");
    assert_eq!(offers.len(), 2);
    assert_eq!(offers[1].target(), Some(&c.address));
}

#[tokio::test]
async fn relay_quality_verdict_reaches_both_parties() {
    let hub = LocalRelayHub::new();
    let (a, b) = connected_pair(&hub, CallKind::Voice).await;

    hub.report_quality(ROOM, ConnectionQuality::Poor);
    wait_until(|| a.handle.snapshot().quality == ConnectionQuality::Poor).await;
    wait_until(|| b.handle.snapshot().quality == ConnectionQuality::Poor).await;
    assert_eq!(a.handle.snapshot().state, SessionState::Connected);
}
