use std::sync::Arc;
use std::time::Duration;

use call_proto::{ChatRelay, IceCandidate, SdpKind, SessionDescription, SignalMessage};

use super::fakes::{
    FakeDataChannel, FakeDevices, FakeDirectory, FakePeerLinkFactory, FakeSignalingConnector,
    LinkOp, call_record,
};
use crate::config::{CallConfig, ChatMode};
use crate::error::{ChatError, MediaError, SignalingError};
use crate::events::{CloseReason, LinkState, PeerEvent};
use crate::media::{CAMERA_FALLBACK_WARNING, MediaConstraints, TrackKind};
use crate::session::{
    CALL_ENDED_MESSAGE, CallHandle, CallParams, CallStatus, Collaborators, REMOTE_LEFT_MESSAGE,
    Role, start_call,
};

const CALL: &str = "call-1";
const ALICE: &str = "alice";
const BOB: &str = "bob";

struct Fakes {
    directory: Arc<FakeDirectory>,
    devices: Arc<FakeDevices>,
    signaling: Arc<FakeSignalingConnector>,
    links: Arc<FakePeerLinkFactory>,
}

impl Fakes {
    fn new() -> Self {
        Self {
            directory: Arc::new(FakeDirectory::with_call(call_record(CALL, ALICE, BOB))),
            devices: Arc::new(FakeDevices::default()),
            signaling: Arc::new(FakeSignalingConnector::default()),
            links: Arc::new(FakePeerLinkFactory::default()),
        }
    }

    fn start(&self, user: &str, config: CallConfig) -> CallHandle {
        let deps = Collaborators {
            directory: self.directory.clone(),
            devices: self.devices.clone(),
            signaling: self.signaling.clone(),
            links: self.links.clone(),
        };
        let params = CallParams {
            call_id: CALL.to_string(),
            user_id: user.to_string(),
            token: "secret".to_string(),
        };
        start_call(config, params, deps)
    }
}

fn config(chat_mode: ChatMode) -> CallConfig {
    CallConfig {
        chat_mode,
        ice_servers: Vec::new(),
        ..CallConfig::default()
    }
}

/// Lets every ready task run without moving the clock past pending timers.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn joined(fakes: &Fakes, user: &str, mode: ChatMode) -> CallHandle {
    let handle = fakes.start(user, config(mode));
    let snapshot = handle
        .wait_for(|s| s.status == CallStatus::AwaitingPeer || s.is_terminal())
        .await;
    assert_eq!(snapshot.status, CallStatus::AwaitingPeer, "{snapshot:?}");
    handle
}

fn ready(user: &str) -> SignalMessage {
    SignalMessage::ConnectionReady {
        user_id: Some(user.to_string()),
        message: None,
    }
}

fn candidate(n: u32) -> SignalMessage {
    SignalMessage::IceCandidate {
        candidate: IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host")),
        from: Some(ALICE.into()),
    }
}

fn remote_track() -> PeerEvent {
    PeerEvent::RemoteTrack {
        stream_id: "remote-stream".into(),
        track_id: "remote-video".into(),
        kind: TrackKind::Video,
    }
}

#[tokio::test(start_paused = true)]
async fn initiator_offers_once_remote_is_ready_and_connects() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    assert_eq!(handle.snapshot().role, Some(Role::Initiator));
    assert_eq!(handle.snapshot().remote_user_id.as_deref(), Some(BOB));
    assert_eq!(fakes.signaling.credentials(), vec!["secret".to_string()]);

    let channel = fakes.signaling.latest();
    assert_eq!(channel.count("offer"), 0);
    channel.deliver(ready(BOB));
    let snapshot = handle
        .wait_for(|s| s.status == CallStatus::Negotiating)
        .await;
    assert_eq!(snapshot.status, CallStatus::Negotiating);
    assert_eq!(channel.count("offer"), 1);

    channel.deliver(SignalMessage::answer(SessionDescription::answer("v=0 remote")));
    let link = fakes.links.latest();
    link.emit(PeerEvent::LocalCandidate(IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 1 typ host")));
    link.emit(PeerEvent::ConnectionState(LinkState::Connected));
    let snapshot = handle.wait_for(|s| s.status == CallStatus::Connected).await;

    assert!(snapshot.started_at.is_some());
    assert!(snapshot.error.is_none());
    assert_eq!(snapshot.connection_state, "connected");
    assert_eq!(link.count(|op| matches!(op, LinkOp::SetRemote(SdpKind::Answer))), 1);
    assert_eq!(channel.count("ice_candidate"), 1);
}

#[tokio::test(start_paused = true)]
async fn receiver_builds_link_lazily_and_answers_once() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, BOB, ChatMode::DataChannel).await;
    assert_eq!(handle.snapshot().role, Some(Role::Receiver));
    assert!(fakes.links.links().is_empty());

    let channel = fakes.signaling.latest();
    channel.deliver(SignalMessage::offer(SessionDescription::offer("v=0 remote")));
    handle
        .wait_for(|s| s.status == CallStatus::Negotiating)
        .await;

    assert_eq!(fakes.links.links().len(), 1);
    let link = fakes.links.latest();
    assert_eq!(link.count(|op| matches!(op, LinkOp::SetRemote(SdpKind::Offer))), 1);
    assert_eq!(channel.count("answer"), 1);
    assert_eq!(channel.count("offer"), 0);
    // The receiver never opens the chat channel itself.
    assert_eq!(link.count(|op| matches!(op, LinkOp::CreateDataChannel(_))), 0);

    link.emit(remote_track());
    link.emit(PeerEvent::ConnectionState(LinkState::Connected));
    let snapshot = handle.wait_for(|s| s.status == CallStatus::Connected).await;
    assert_eq!(snapshot.remote_stream_id.as_deref(), Some("remote-stream"));
    assert_eq!(channel.count("answer"), 1);
}

#[tokio::test(start_paused = true)]
async fn early_candidates_are_applied_after_the_offer_in_order() {
    let fakes = Fakes::new();
    let _handle = joined(&fakes, BOB, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    for n in 1..=3 {
        channel.deliver(candidate(n));
    }
    settle().await;
    let link = fakes.links.latest();
    assert!(link.applied_candidates().is_empty());

    channel.deliver(SignalMessage::offer(SessionDescription::offer("v=0 remote")));
    settle().await;
    let applied = link.applied_candidates();
    assert_eq!(applied.len(), 3);
    assert!(applied[0].starts_with("candidate:1"));
    assert!(applied[2].starts_with("candidate:3"));

    let ops = link.ops();
    let last_candidate = ops
        .iter()
        .rposition(|op| matches!(op, LinkOp::AddCandidate(_)))
        .unwrap();
    let answered = ops
        .iter()
        .position(|op| matches!(op, LinkOp::CreateAnswer))
        .unwrap();
    assert!(last_candidate < answered);
}

#[tokio::test(start_paused = true)]
async fn repeated_connection_ready_yields_one_offer() {
    let fakes = Fakes::new();
    let _handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    for _ in 0..3 {
        channel.deliver(ready(BOB));
    }
    settle().await;
    assert_eq!(channel.count("offer"), 1);
    assert_eq!(
        fakes
            .links
            .latest()
            .count(|op| matches!(op, LinkOp::CreateOffer { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn receiver_never_offers_and_announces_itself() {
    let fakes = Fakes::new();
    let _handle = joined(&fakes, BOB, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    channel.deliver(ready(ALICE));
    channel.deliver(ready(ALICE));
    settle().await;
    assert_eq!(channel.count("offer"), 0);
    assert_eq!(channel.count("connection_state"), 2);
}

#[tokio::test(start_paused = true)]
async fn initiator_joining_second_offers_on_connection_state() {
    let fakes = Fakes::new();
    let _handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    channel.deliver(SignalMessage::ConnectionState {
        user_id: Some(BOB.into()),
        state: Some("ready".into()),
    });
    settle().await;
    assert_eq!(channel.count("offer"), 1);
}

#[tokio::test(start_paused = true)]
async fn own_connection_ready_is_ignored() {
    let fakes = Fakes::new();
    let _handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    channel.deliver(ready(ALICE));
    channel.deliver(SignalMessage::offer(SessionDescription::offer("v=0 glare")));
    settle().await;
    assert_eq!(channel.count("offer"), 0);
    assert_eq!(channel.count("answer"), 0);
}

#[tokio::test(start_paused = true)]
async fn camera_busy_falls_back_to_audio_only() {
    let fakes = Fakes::new();
    fakes
        .devices
        .fail_next(MediaError::DeviceBusy("camera".into()));
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;

    let requests = fakes.devices.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1], MediaConstraints::audio_only());
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.error.as_deref(), Some(CAMERA_FALLBACK_WARNING));
    assert!(snapshot.local_media.has_audio);
    assert!(!snapshot.local_media.has_video);
}

#[tokio::test(start_paused = true)]
async fn media_failure_without_fallback_fails_the_call() {
    let fakes = Fakes::new();
    fakes
        .devices
        .fail_next(MediaError::DeviceBusy("camera".into()));
    fakes.devices.fail_next(MediaError::NotFound("audio".into()));
    let handle = fakes.start(ALICE, config(ChatMode::DataChannel));
    let snapshot = handle.wait_for(|s| s.is_terminal()).await;

    assert_eq!(snapshot.status, CallStatus::Failed);
    let error = snapshot.error.unwrap_or_default();
    assert!(error.starts_with("Could not access camera or microphone"), "{error}");
    assert_eq!(fakes.signaling.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_call_fails_after_every_lookup() {
    let fakes = Fakes {
        directory: Arc::new(FakeDirectory::default()),
        ..Fakes::new()
    };
    let handle = fakes.start(ALICE, config(ChatMode::DataChannel));
    let snapshot = handle.wait_for(|s| s.is_terminal()).await;
    assert_eq!(snapshot.status, CallStatus::Failed);
    assert_eq!(fakes.directory.lookups(), vec!["by-id", "active", "pending"]);
    assert!(fakes.devices.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn call_found_through_pending_listing() {
    let directory = FakeDirectory::default();
    directory.set_pending(Some(call_record(CALL, BOB, ALICE)));
    let fakes = Fakes {
        directory: Arc::new(directory),
        ..Fakes::new()
    };
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    assert_eq!(handle.snapshot().role, Some(Role::Receiver));
}

#[tokio::test(start_paused = true)]
async fn repeated_link_loss_exhausts_three_reconnects() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;

    for attempt in 1..=3u32 {
        fakes
            .links
            .latest()
            .emit(PeerEvent::ConnectionState(LinkState::Disconnected));
        let snapshot = handle
            .wait_for(|s| s.reconnect_attempt == attempt)
            .await;
        assert_eq!(snapshot.status, CallStatus::Reconnecting);
        assert_eq!(
            snapshot.error.as_deref(),
            Some(format!("Connection lost. Reconnecting... ({attempt}/3)").as_str())
        );
        // Let the backoff elapse and the reconnect complete.
        tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
        assert_eq!(fakes.signaling.attempts(), attempt as usize + 1);
    }

    fakes
        .links
        .latest()
        .emit(PeerEvent::ConnectionState(LinkState::Disconnected));
    let snapshot = handle.wait_for(|s| s.is_terminal()).await;
    assert_eq!(snapshot.status, CallStatus::Failed);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Reconnection failed. Please refresh the page.")
    );
    assert_eq!(fakes.signaling.attempts(), 4);
    assert_eq!(fakes.links.links().len(), 4);
    assert!(fakes.links.links().iter().all(|l| l.close_count() == 1));
}

#[tokio::test(start_paused = true)]
async fn connected_resets_the_reconnect_budget() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;

    fakes
        .links
        .latest()
        .emit(PeerEvent::ConnectionState(LinkState::Failed));
    handle.wait_for(|s| s.reconnect_attempt == 1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let channel = fakes.signaling.latest();
    channel.deliver(ready(BOB));
    channel.deliver(SignalMessage::answer(SessionDescription::answer("v=0 remote")));
    let link = fakes.links.latest();
    link.emit(remote_track());
    link.emit(PeerEvent::ConnectionState(LinkState::Connected));
    let snapshot = handle.wait_for(|s| s.status == CallStatus::Connected).await;
    assert_eq!(snapshot.reconnect_attempt, 0);
    assert!(snapshot.error.is_none());

    link.emit(PeerEvent::ConnectionState(LinkState::Disconnected));
    let snapshot = handle.wait_for(|s| s.status == CallStatus::Reconnecting).await;
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Connection lost. Reconnecting... (1/3)")
    );
}

#[tokio::test(start_paused = true)]
async fn broken_link_restarts_ice_before_reconnecting() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    channel.deliver(ready(BOB));
    settle().await;

    let link = fakes.links.latest();
    link.emit(PeerEvent::ConnectionState(LinkState::Failed));
    handle.wait_for(|s| s.status == CallStatus::Reconnecting).await;
    assert_eq!(
        link.count(|op| matches!(op, LinkOp::CreateOffer { ice_restart: true })),
        1
    );
    assert_eq!(channel.count("offer"), 2);
}

#[tokio::test(start_paused = true)]
async fn events_from_a_replaced_link_are_ignored() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let old = fakes.links.latest();
    old.emit(PeerEvent::ConnectionState(LinkState::Disconnected));
    handle.wait_for(|s| s.reconnect_attempt == 1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fakes.links.links().len(), 2);

    old.emit(remote_track());
    old.emit(PeerEvent::ConnectionState(LinkState::Connected));
    settle().await;
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, CallStatus::Reconnecting);
    assert!(snapshot.remote_stream_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn transient_signaling_failure_is_retried() {
    let fakes = Fakes::new();
    fakes.signaling.fail_next(SignalingError::Timeout(5000));
    let handle = fakes.start(ALICE, config(ChatMode::DataChannel));
    let snapshot = handle.wait_for(|s| s.reconnect_attempt == 1).await;
    assert_eq!(snapshot.status, CallStatus::Reconnecting);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fakes.signaling.attempts(), 2);
    assert!(!handle.snapshot().is_terminal());
    assert_eq!(fakes.links.links().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_fail_without_retry() {
    let fakes = Fakes::new();
    fakes
        .signaling
        .fail_next(SignalingError::AuthRejected("401".into()));
    let handle = fakes.start(ALICE, config(ChatMode::DataChannel));
    let snapshot = handle.wait_for(|s| s.is_terminal()).await;
    assert_eq!(snapshot.status, CallStatus::Failed);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fakes.signaling.attempts(), 1);
    assert!(snapshot.local_media.stream_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn policy_close_from_relay_fails_the_call() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    fakes
        .signaling
        .latest()
        .drop_connection(CloseReason::Rejected("Call not found".into()));
    let snapshot = handle.wait_for(|s| s.is_terminal()).await;
    assert_eq!(snapshot.status, CallStatus::Failed);
    assert_eq!(fakes.signaling.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn socket_drop_reconnects_with_fresh_link() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    fakes.signaling.latest().drop_connection(CloseReason::Remote {
        code: Some(1006),
        reason: String::new(),
    });
    handle.wait_for(|s| s.reconnect_attempt == 1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fakes.signaling.attempts(), 2);
    let links = fakes.links.links();
    assert_eq!(links.len(), 2);
    assert_eq!(links[0].close_count(), 1);
    assert_eq!(links[1].close_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_call_ended_is_a_noop() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    channel.deliver(SignalMessage::CallEnded);
    channel.deliver(SignalMessage::CallEnded);
    let snapshot = handle.wait_for(|s| s.is_terminal()).await;
    settle().await;

    assert_eq!(snapshot.status, CallStatus::Ended);
    assert_eq!(snapshot.error.as_deref(), Some(CALL_ENDED_MESSAGE));
    assert_eq!(handle.snapshot().error.as_deref(), Some(CALL_ENDED_MESSAGE));
    assert_eq!(fakes.links.latest().close_count(), 1);
    assert_eq!(channel.close_count(), 1);
    assert!(handle.snapshot().local_media.stream_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn duplicate_user_disconnected_is_a_noop() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, BOB, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    channel.deliver(SignalMessage::UserDisconnected {
        user_id: Some(ALICE.into()),
    });
    channel.deliver(SignalMessage::UserDisconnected {
        user_id: Some(ALICE.into()),
    });
    let snapshot = handle.wait_for(|s| s.is_terminal()).await;
    settle().await;
    assert_eq!(snapshot.status, CallStatus::Ended);
    assert_eq!(handle.snapshot().error.as_deref(), Some(REMOTE_LEFT_MESSAGE));
    assert_eq!(channel.close_count(), 1);
    // Ending remotely does not post to the call api.
    assert!(fakes.directory.ended().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hangup_notifies_peer_and_api_then_releases_everything() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();

    handle.hangup().await;
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, CallStatus::Ended);
    assert_eq!(channel.count("end_call"), 1);
    assert_eq!(channel.close_count(), 1);
    assert_eq!(fakes.directory.ended(), vec![CALL.to_string()]);
    assert_eq!(fakes.links.latest().close_count(), 1);
    assert!(snapshot.local_media.stream_id.is_none());

    handle.hangup().await;
    assert_eq!(channel.count("end_call"), 1);
    assert_eq!(
        handle.send_chat("anyone?").await.unwrap_err(),
        ChatError::SessionClosed
    );
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_hangs_up() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let mut observer = handle.subscribe();
    drop(handle);
    let _ = observer.wait_for(|s| s.is_terminal()).await;
    assert_eq!(fakes.directory.ended(), vec![CALL.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn data_channel_chat_needs_an_open_channel() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let link = fakes.links.latest();
    assert_eq!(
        link.count(|op| matches!(op, LinkOp::CreateDataChannel(label) if label == "chat")),
        1
    );

    assert_eq!(handle.send_chat("hi").await.unwrap_err(), ChatError::NotOpen);
    assert!(handle.snapshot().chat.is_empty());

    let chat = link.data_channels()[0].clone();
    chat.set_open(true);
    link.emit(PeerEvent::DataChannelOpen {
        label: "chat".into(),
    });
    handle.wait_for(|s| s.chat_open).await;
    handle.send_chat("hi").await.unwrap();
    assert_eq!(chat.sent().len(), 1);

    link.emit(PeerEvent::DataChannelMessage {
        label: "chat".into(),
        text: r#"{"type":"text","message":"hello back","timestamp":"2024-05-01T10:00:00Z"}"#
            .into(),
    });
    let snapshot = handle.wait_for(|s| s.chat.len() == 2).await;
    let messages = snapshot.chat.messages();
    assert!(messages[0].is_local);
    assert_eq!(messages[1].sender, BOB);
    assert_eq!(messages[1].text, "hello back");
}

#[tokio::test(start_paused = true)]
async fn receiver_adopts_the_announced_chat_channel() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, BOB, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    channel.deliver(SignalMessage::offer(SessionDescription::offer("v=0 remote")));
    settle().await;

    let announced = Arc::new(FakeDataChannel::new("chat"));
    announced.set_open(true);
    fakes
        .links
        .latest()
        .emit(PeerEvent::DataChannel(announced.clone()));
    handle.wait_for(|s| s.chat_open).await;
    handle.send_chat("hey").await.unwrap();
    assert_eq!(announced.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn relay_chat_goes_through_signaling() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::SignalingRelay).await;
    assert_eq!(
        fakes
            .links
            .latest()
            .count(|op| matches!(op, LinkOp::CreateDataChannel(_))),
        0
    );
    let channel = fakes.signaling.latest();

    handle.send_chat("over the relay").await.unwrap();
    assert_eq!(channel.count("chat_message"), 1);

    channel.deliver(SignalMessage::ChatMessage(ChatRelay {
        from: Some(ALICE.into()),
        text: Some("over the relay".into()),
        ..ChatRelay::default()
    }));
    channel.deliver(SignalMessage::ChatMessage(ChatRelay {
        from: Some(BOB.into()),
        text: Some("got it".into()),
        ..ChatRelay::default()
    }));
    let snapshot = handle.wait_for(|s| s.chat.len() >= 2).await;
    settle().await;
    assert_eq!(handle.snapshot().chat.len(), 2);
    assert_eq!(snapshot.chat.messages()[1].sender, BOB);
}

#[tokio::test(start_paused = true)]
async fn media_toggles_flip_track_state() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    assert!(handle.snapshot().local_media.audio_enabled);

    assert_eq!(handle.toggle_mute().await, Some(false));
    assert!(!handle.snapshot().local_media.audio_enabled);
    assert_eq!(handle.toggle_camera().await, Some(false));
    assert!(!handle.snapshot().local_media.video_enabled);

    handle.set_audio_enabled(true);
    let snapshot = handle.wait_for(|s| s.local_media.audio_enabled).await;
    assert!(!snapshot.local_media.video_enabled);
    // Toggling never renegotiates.
    assert_eq!(
        fakes
            .links
            .latest()
            .count(|op| matches!(op, LinkOp::CreateOffer { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn retry_after_failed_offer_sends_a_new_one() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let link = fakes.links.latest();
    link.fail_next_offer(crate::error::NegotiationError::Offer("ice gathering".into()));

    let channel = fakes.signaling.latest();
    channel.deliver(ready(BOB));
    let snapshot = handle.wait_for(|s| s.error.is_some()).await;
    assert!(!snapshot.is_terminal());
    assert_eq!(snapshot.status, CallStatus::Negotiating);
    assert_eq!(channel.count("offer"), 0);

    handle.retry_negotiation();
    settle().await;
    assert_eq!(channel.count("offer"), 1);
    assert_eq!(handle.snapshot().status, CallStatus::Negotiating);
}

#[tokio::test(start_paused = true)]
async fn failed_answer_keeps_the_receiver_negotiating() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, BOB, ChatMode::DataChannel).await;
    fakes
        .links
        .fail_next_answer(crate::error::NegotiationError::Answer("no common codec".into()));

    let channel = fakes.signaling.latest();
    channel.deliver(SignalMessage::offer(SessionDescription::offer("v=0 remote")));
    let snapshot = handle.wait_for(|s| s.error.is_some()).await;
    assert_eq!(snapshot.status, CallStatus::Negotiating);
    assert!(!snapshot.is_terminal());
    assert_eq!(channel.count("answer"), 0);
    let link = fakes.links.latest();
    assert_eq!(link.count(|op| matches!(op, LinkOp::CreateAnswer)), 1);
}

#[tokio::test(start_paused = true)]
async fn unsent_offer_is_rebuilt_on_the_next_ready() {
    let fakes = Fakes::new();
    let handle = joined(&fakes, ALICE, ChatMode::DataChannel).await;
    let channel = fakes.signaling.latest();
    let link = fakes.links.latest();

    channel.set_open(false);
    channel.deliver(ready(BOB));
    settle().await;
    assert_eq!(link.count(|op| matches!(op, LinkOp::CreateOffer { .. })), 1);
    assert_eq!(channel.count("offer"), 0);
    assert_eq!(handle.snapshot().status, CallStatus::AwaitingPeer);

    channel.set_open(true);
    channel.deliver(ready(BOB));
    handle
        .wait_for(|s| s.status == CallStatus::Negotiating)
        .await;
    assert_eq!(channel.count("offer"), 1);
    assert_eq!(link.count(|op| matches!(op, LinkOp::CreateOffer { .. })), 2);
}
