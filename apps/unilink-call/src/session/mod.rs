//! The call session state machine.
//!
//! One task owns every piece of session state and handles caller commands,
//! collaborator events and the reconnect timer strictly one at a time.

mod handle;
mod state;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use call_proto::{IceCandidate, SessionDescription, SignalMessage};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Sleep;
use tracing::Instrument;

pub use handle::CallHandle;
pub use state::{CallStatus, Lifecycle, Role, SessionSnapshot};

use handle::Command;

use crate::chat::{ChatInbound, ChatRoute, ChatStrategy, strategy_for};
use crate::config::{CallConfig, ChatMode};
use crate::directory::{CallDirectory, resolve_call};
use crate::error::{CallError, ChatError, NegotiationError, Severity, SignalingError};
use crate::events::{CloseReason, EventSink, LinkState, PeerEvent, SessionEvent, SignalingEvent};
use crate::media::{MediaControl, MediaDevices};
use crate::negotiation::{
    CandidateDisposition, DataChannel, NegotiationContext, NegotiationEngine, PeerLinkFactory,
};
use crate::signaling::{SignalingChannel, SignalingConnector, send_or_skip};

pub const REMOTE_LEFT_MESSAGE: &str = "The other user disconnected.";
pub const CALL_ENDED_MESSAGE: &str = "Call ended.";

/// Who the session is and which call it joins.
#[derive(Debug, Clone)]
pub struct CallParams {
    pub call_id: String,
    pub user_id: String,
    /// Access token; sent as `Bearer <token>`.
    pub token: String,
}

/// External collaborators a session drives.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn CallDirectory>,
    pub devices: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub links: Arc<dyn PeerLinkFactory>,
}

/// Spawns the session task and returns the handle that drives it.
pub fn start_call(config: CallConfig, params: CallParams, deps: Collaborators) -> CallHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let snapshot = SessionSnapshot::new(params.call_id.clone());
    let (publisher, observer) = watch::channel(snapshot.clone());

    let span = tracing::info_span!("call", call_id = %params.call_id);
    let session = CallSession {
        engine: NegotiationEngine::new(config.clone(), deps.devices, deps.links),
        chat: strategy_for(config.chat_mode),
        directory: deps.directory,
        connector: deps.signaling,
        config,
        params,
        snapshot,
        publisher,
        commands: command_rx,
        deferred: VecDeque::new(),
        events_tx,
        events: events_rx,
        role: None,
        media: MediaControl::new(),
        signaling: None,
        negotiation: None,
        chat_channel: None,
        remote_ready: false,
        link_state: LinkState::New,
        generation: 0,
        reconnect: ReconnectState::default(),
        torn_down: false,
        hangup_waiters: Vec::new(),
    };
    tokio::spawn(session.run().instrument(span));
    CallHandle::new(command_tx, observer)
}

#[derive(Default)]
struct ReconnectState {
    attempts: u32,
    should_reconnect: bool,
    timer: Option<Pin<Box<Sleep>>>,
}

struct CallSession {
    config: CallConfig,
    params: CallParams,
    directory: Arc<dyn CallDirectory>,
    connector: Arc<dyn SignalingConnector>,
    engine: NegotiationEngine,
    chat: Box<dyn ChatStrategy>,
    snapshot: SessionSnapshot,
    publisher: watch::Sender<SessionSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Commands that arrived while a startup step was in flight.
    deferred: VecDeque<Command>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    role: Option<Role>,
    media: MediaControl,
    signaling: Option<Arc<dyn SignalingChannel>>,
    negotiation: Option<NegotiationContext>,
    chat_channel: Option<Arc<dyn DataChannel>>,
    remote_ready: bool,
    link_state: LinkState,
    /// Connect attempt counter; events stamped with an older value are stale.
    generation: u64,
    reconnect: ReconnectState,
    torn_down: bool,
    hangup_waiters: Vec<oneshot::Sender<()>>,
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl CallSession {
    async fn run(mut self) {
        self.publish();
        if self.start().await {
            self.event_loop().await;
        }
        for done in self.hangup_waiters.drain(..) {
            let _ = done.send(());
        }
        tracing::info!(
            target = "session",
            status = ?self.snapshot.status,
            error = self.snapshot.error.as_deref().unwrap_or(""),
            "call session finished"
        );
    }

    /// Call lookup, media capture and the first signaling connect. Returns
    /// `false` when the session already ended.
    async fn start(&mut self) -> bool {
        self.reconnect.should_reconnect = true;

        self.set_status(CallStatus::FetchingCallInfo);
        let directory = Arc::clone(&self.directory);
        let call_id = self.params.call_id.clone();
        let lookup = async move { resolve_call(directory.as_ref(), &call_id).await };
        let Some(lookup) = self.guarded(lookup).await else {
            self.hangup().await;
            return false;
        };
        let record = match lookup {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(target = "session", error = %err, "call lookup failed");
                let call_id = self.params.call_id.clone();
                self.fail(CallError::CallNotFound(call_id)).await;
                return false;
            }
        };
        let role = if record.is_initiator(&self.params.user_id) {
            Role::Initiator
        } else {
            Role::Receiver
        };
        self.role = Some(role);
        self.snapshot.role = Some(role);
        self.snapshot.remote_user_id = Some(record.remote_user_id(&self.params.user_id).to_string());
        tracing::info!(
            target = "session",
            role = role.as_str(),
            status = %record.status,
            "call resolved"
        );

        self.set_status(CallStatus::AcquiringMedia);
        let engine = self.engine.clone();
        let constraints = self.config.media;
        let capture = async move { engine.acquire_local_media(constraints).await };
        let Some(capture) = self.guarded(capture).await else {
            self.hangup().await;
            return false;
        };
        match capture {
            Ok(acquired) => {
                self.media.attach(acquired.media);
                if let Some(warning) = acquired.warning {
                    self.snapshot.error = Some(warning);
                }
            }
            Err(err) => {
                self.fail(CallError::Media(err)).await;
                return false;
            }
        }

        self.set_status(CallStatus::ConnectingSignaling);
        let Some(result) = self.connect_signaling().await else {
            self.hangup().await;
            return false;
        };
        self.on_signaling_result(result).await;
        !self.snapshot.is_terminal()
    }

    async fn event_loop(&mut self) {
        loop {
            while let Some(command) = self.deferred.pop_front() {
                self.handle_command(command).await;
            }
            if self.snapshot.is_terminal() {
                break;
            }
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!(target = "session", "all call handles dropped");
                        self.hangup().await;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = reconnect_due(&mut self.reconnect.timer) => self.fire_reconnect().await,
            }
        }
    }

    /// Runs a startup step while still honouring hang-up. Other commands are
    /// queued until the step completes. `None` means hang up now.
    async fn guarded<F: Future>(&mut self, step: F) -> Option<F::Output> {
        tokio::pin!(step);
        loop {
            tokio::select! {
                output = &mut step => return Some(output),
                command = self.commands.recv() => match command {
                    Some(Command::Hangup { done }) => {
                        self.hangup_waiters.push(done);
                        return None;
                    }
                    Some(other) => self.deferred.push_back(other),
                    None => return None,
                },
            }
        }
    }

    async fn connect_signaling(
        &mut self,
    ) -> Option<Result<Arc<dyn SignalingChannel>, SignalingError>> {
        let connector = Arc::clone(&self.connector);
        let call_id = self.params.call_id.clone();
        let token = self.params.token.clone();
        let sink = self.sink();
        let connecting = async move { connector.connect(&call_id, &token, sink).await };
        self.guarded(connecting).await
    }

    async fn on_signaling_result(&mut self, result: Result<Arc<dyn SignalingChannel>, SignalingError>) {
        match result {
            Ok(channel) => {
                self.signaling = Some(channel);
                self.on_signaling_open().await;
            }
            Err(err) => {
                let err = CallError::from(err);
                if err.severity() == Severity::Fatal {
                    self.fail(err).await;
                } else {
                    tracing::warn!(target = "session", error = %err, "signaling connect failed");
                    self.schedule_reconnect(&err.to_string()).await;
                }
            }
        }
    }

    async fn on_signaling_open(&mut self) {
        tracing::info!(
            target = "session",
            generation = self.generation,
            "signaling connected"
        );
        if self.snapshot.status != CallStatus::Reconnecting {
            self.set_status(CallStatus::AwaitingPeer);
        }
        if self.role == Some(Role::Initiator) {
            if let Err(err) = self.ensure_link().await {
                self.fail(err).await;
                return;
            }
            self.offer_if_ready().await;
        }
        self.publish();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Hangup { done } => {
                self.hangup_waiters.push(done);
                self.hangup().await;
            }
            Command::SendChat { text, reply } => {
                let result = self.send_chat(&text).await;
                let _ = reply.send(result);
            }
            Command::SetAudio(enabled) => {
                self.media.set_audio_enabled(enabled);
                self.publish();
            }
            Command::SetVideo(enabled) => {
                self.media.set_video_enabled(enabled);
                self.publish();
            }
            Command::ToggleMute { reply } => {
                let state = self.media.toggle_mute();
                self.publish();
                let _ = reply.send(state);
            }
            Command::ToggleCamera { reply } => {
                let state = self.media.toggle_camera();
                self.publish();
                let _ = reply.send(state);
            }
            Command::RetryNegotiation => self.retry_negotiation().await,
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Signaling { generation, event } => {
                if generation != self.generation {
                    tracing::trace!(target = "session", generation, "stale signaling event dropped");
                    return;
                }
                match event {
                    SignalingEvent::Message(message) => self.on_signal(message).await,
                    SignalingEvent::Closed(reason) => self.on_signaling_closed(reason).await,
                }
            }
            SessionEvent::Peer { generation, event } => {
                if generation != self.generation {
                    tracing::trace!(target = "session", generation, "stale peer event dropped");
                    return;
                }
                self.on_peer(event).await;
            }
        }
    }

    async fn on_signal(&mut self, message: SignalMessage) {
        tracing::debug!(target = "session", kind = message.kind(), "signal received");
        match message {
            SignalMessage::ConnectionReady { user_id, .. } => {
                self.on_remote_ready(user_id.as_deref(), true).await;
            }
            SignalMessage::ConnectionState { user_id, state } => {
                tracing::debug!(
                    target = "session",
                    remote_state = state.as_deref().unwrap_or(""),
                    "remote connection state"
                );
                self.on_remote_ready(user_id.as_deref(), false).await;
            }
            SignalMessage::UserDisconnected { .. } => self.end_remotely(REMOTE_LEFT_MESSAGE).await,
            SignalMessage::CallEnded | SignalMessage::EndCall => {
                self.end_remotely(CALL_ENDED_MESSAGE).await;
            }
            SignalMessage::Offer { offer, .. } => self.on_remote_offer(offer).await,
            SignalMessage::Answer { answer, .. } => self.on_remote_answer(answer).await,
            SignalMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await;
            }
            SignalMessage::ChatMessage(relay) => self.on_chat(ChatInbound::Relay(&relay)),
            SignalMessage::Error { message } => {
                tracing::warn!(
                    target = "session",
                    message = message.as_deref().unwrap_or(""),
                    "signaling server reported an error"
                );
            }
            SignalMessage::Ping | SignalMessage::Pong | SignalMessage::Unknown => {}
        }
    }

    /// `connection_ready` only reaches participants already in the room, so
    /// the receiver answers it with a `connection_state` that tells a late
    /// initiator the receiver is present.
    async fn on_remote_ready(&mut self, user_id: Option<&str>, announce: bool) {
        let Some(user_id) = user_id else {
            return;
        };
        if user_id == self.params.user_id {
            return;
        }
        if !self.remote_ready {
            tracing::info!(target = "session", remote = user_id, "remote participant ready");
        }
        self.remote_ready = true;
        if announce && self.role == Some(Role::Receiver) {
            send_or_skip(
                self.signaling.as_ref(),
                SignalMessage::ConnectionState {
                    user_id: None,
                    state: Some("ready".into()),
                },
            );
        }
        self.offer_if_ready().await;
    }

    async fn on_signaling_closed(&mut self, reason: CloseReason) {
        self.signaling = None;
        match reason {
            CloseReason::Rejected(reason) => {
                self.fail(SignalingError::AuthRejected(reason).into()).await;
            }
            other => {
                tracing::warn!(
                    target = "session",
                    reason = %other.describe(),
                    "signaling connection lost"
                );
                self.schedule_reconnect(&other.describe()).await;
            }
        }
    }

    async fn on_peer(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                send_or_skip(self.signaling.as_ref(), SignalMessage::ice_candidate(candidate));
            }
            PeerEvent::RemoteTrack {
                stream_id, kind, ..
            } => {
                let Some(ctx) = self.negotiation.as_mut() else {
                    return;
                };
                if ctx.note_remote_stream(&stream_id) {
                    tracing::info!(
                        target = "session",
                        stream_id = %stream_id,
                        kind = kind.as_str(),
                        "remote stream attached"
                    );
                    self.snapshot.remote_stream_id = Some(stream_id);
                    self.maybe_connected();
                    self.publish();
                }
            }
            PeerEvent::ConnectionState(state) => self.on_link_state(state).await,
            PeerEvent::DataChannel(channel) => self.adopt_data_channel(channel),
            PeerEvent::DataChannelOpen { label } => {
                if label == self.config.chat_label {
                    self.snapshot.chat_open = true;
                    self.publish();
                }
            }
            PeerEvent::DataChannelClosed { label } => {
                if label == self.config.chat_label {
                    self.snapshot.chat_open = false;
                    self.publish();
                }
            }
            PeerEvent::DataChannelMessage { label, text } => {
                if label == self.config.chat_label {
                    self.on_chat(ChatInbound::Frame(&text));
                }
            }
        }
    }

    async fn on_link_state(&mut self, state: LinkState) {
        self.link_state = state;
        self.snapshot.connection_state = state.as_str().to_string();
        if state == LinkState::Connected {
            self.maybe_connected();
        } else if state.is_broken() {
            tracing::warn!(target = "session", state = state.as_str(), "peer link lost");
            self.schedule_reconnect(state.as_str()).await;
            if !self.snapshot.is_terminal() {
                self.restart_ice().await;
            }
        }
        self.publish();
    }

    fn adopt_data_channel(&mut self, channel: Arc<dyn DataChannel>) {
        if self.chat.mode() != ChatMode::DataChannel || channel.label() != self.config.chat_label {
            tracing::debug!(
                target = "session",
                label = channel.label(),
                "ignoring inbound data channel"
            );
            return;
        }
        self.snapshot.chat_open = channel.is_open();
        self.chat_channel = Some(channel);
        self.publish();
    }

    /// Creates the peer link for the current generation if there is none.
    async fn ensure_link(&mut self) -> Result<(), CallError> {
        if self.negotiation.is_some() {
            return Ok(());
        }
        let Some(media) = self.media.media().cloned() else {
            return Err(NegotiationError::Setup("no local media".into()).into());
        };
        let ctx = self
            .engine
            .create_peer_link(&media, self.sink())
            .await
            .map_err(|err| match err {
                NegotiationError::Setup(_) => err,
                other => NegotiationError::Setup(other.to_string()),
            })?;
        if self.role == Some(Role::Initiator) && self.chat.mode() == ChatMode::DataChannel {
            match ctx.attach_data_channel(&self.config.chat_label).await {
                Ok(channel) => {
                    self.snapshot.chat_open = channel.is_open();
                    self.chat_channel = Some(channel);
                }
                Err(err) => {
                    tracing::warn!(target = "session", error = %err, "chat channel unavailable");
                }
            }
        }
        self.negotiation = Some(ctx);
        self.link_state = LinkState::New;
        Ok(())
    }

    async fn offer_if_ready(&mut self) {
        if self.role != Some(Role::Initiator) || !self.remote_ready {
            return;
        }
        let Some(ctx) = self.negotiation.as_mut() else {
            return;
        };
        match ctx.create_offer().await {
            Ok(Some(offer)) => {
                if !send_or_skip(self.signaling.as_ref(), SignalMessage::offer(offer)) {
                    ctx.reset_offer_latch();
                    tracing::debug!(target = "session", "offer not sent; latch released");
                    return;
                }
                tracing::info!(target = "session", generation = self.generation, "offer sent");
                if self.snapshot.status != CallStatus::Connected {
                    self.set_status(CallStatus::Negotiating);
                }
            }
            Ok(None) => {
                tracing::trace!(target = "session", "offer already sent for this attempt");
            }
            Err(err) => self.report_negotiation(err).await,
        }
    }

    async fn retry_negotiation(&mut self) {
        if self.role != Some(Role::Initiator) {
            tracing::debug!(target = "session", "only the initiator can retry negotiation");
            return;
        }
        if let Some(ctx) = self.negotiation.as_mut() {
            ctx.reset_offer_latch();
        }
        self.offer_if_ready().await;
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) {
        if self.role == Some(Role::Initiator) {
            tracing::warn!(target = "session", "ignoring offer: local side is the initiator");
            return;
        }
        if let Err(err) = self.ensure_link().await {
            self.fail(err).await;
            return;
        }
        let Some(ctx) = self.negotiation.as_mut() else {
            return;
        };
        match ctx.accept_offer(offer).await {
            Ok(answer) => {
                send_or_skip(self.signaling.as_ref(), SignalMessage::answer(answer));
                tracing::info!(target = "session", generation = self.generation, "answer sent");
                if self.snapshot.status != CallStatus::Connected {
                    self.set_status(CallStatus::Negotiating);
                }
                self.maybe_connected();
            }
            Err(err) => self.report_negotiation(err).await,
        }
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        let Some(ctx) = self.negotiation.as_mut() else {
            tracing::debug!(target = "session", "answer without a peer link dropped");
            return;
        };
        match ctx.accept_answer(answer).await {
            Ok(true) => {
                tracing::info!(target = "session", "answer applied");
                self.maybe_connected();
                self.publish();
            }
            Ok(false) => {}
            Err(err) => self.report_negotiation(err).await,
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.negotiation.is_none() {
            if self.role != Some(Role::Receiver) {
                tracing::debug!(target = "session", "candidate without a peer link dropped");
                return;
            }
            if let Err(err) = self.ensure_link().await {
                self.fail(err).await;
                return;
            }
        }
        let Some(ctx) = self.negotiation.as_mut() else {
            return;
        };
        match ctx.add_remote_candidate(candidate).await {
            Ok(CandidateDisposition::Buffered) => {
                tracing::trace!(
                    target = "session",
                    pending = ctx.pending_candidates(),
                    "candidate buffered until remote description"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target = "session", error = %err, "remote candidate rejected");
            }
        }
    }

    async fn restart_ice(&mut self) {
        if self.role != Some(Role::Initiator) {
            return;
        }
        if !self.signaling.as_ref().is_some_and(|s| s.is_open()) {
            return;
        }
        let Some(ctx) = self.negotiation.as_mut() else {
            return;
        };
        match ctx.restart_ice().await {
            Ok(offer) => {
                send_or_skip(self.signaling.as_ref(), SignalMessage::offer(offer));
                tracing::info!(target = "session", "ice restart offer sent");
            }
            Err(err) => {
                tracing::warn!(target = "session", error = %err, "ice restart failed");
            }
        }
    }

    async fn report_negotiation(&mut self, err: NegotiationError) {
        let err = CallError::from(err);
        match err.severity() {
            Severity::Fatal => self.fail(err).await,
            Severity::Transient => {
                tracing::warn!(target = "session", error = %err, "negotiation step failed");
                self.snapshot.error = Some(err.to_string());
                match self.snapshot.status {
                    CallStatus::Connected | CallStatus::Reconnecting => self.publish(),
                    _ if self.snapshot.is_terminal() => self.publish(),
                    _ => self.set_status(CallStatus::Negotiating),
                }
            }
            Severity::Noop => {
                tracing::debug!(target = "session", error = %err, "negotiation step skipped");
            }
        }
    }

    fn maybe_connected(&mut self) {
        if self.snapshot.is_terminal() || self.snapshot.status == CallStatus::Connected {
            return;
        }
        if self.link_state != LinkState::Connected {
            return;
        }
        let Some(ctx) = self.negotiation.as_ref() else {
            return;
        };
        if ctx.remote_stream_id().is_none() && !ctx.exchange_complete() {
            return;
        }
        self.snapshot.error = None;
        self.reconnect.attempts = 0;
        self.reconnect.timer = None;
        self.snapshot.reconnect_attempt = 0;
        self.snapshot
            .started_at
            .get_or_insert_with(OffsetDateTime::now_utc);
        tracing::info!(target = "session", generation = self.generation, "call connected");
        self.set_status(CallStatus::Connected);
    }

    async fn schedule_reconnect(&mut self, reason: &str) {
        if !self.reconnect.should_reconnect || self.snapshot.is_terminal() {
            return;
        }
        if self.reconnect.timer.is_some() {
            tracing::debug!(target = "session", reason, "reconnect already pending");
            return;
        }
        let policy = self.config.reconnect;
        if self.reconnect.attempts >= policy.max_attempts {
            self.fail(CallError::ReconnectExhausted).await;
            return;
        }
        self.reconnect.attempts += 1;
        let attempt = self.reconnect.attempts;
        let delay = policy.delay_for(attempt);
        tracing::warn!(
            target = "session",
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "scheduling reconnect"
        );
        self.snapshot.reconnect_attempt = attempt;
        self.snapshot.error = Some(format!(
            "Connection lost. Reconnecting... ({attempt}/{})",
            policy.max_attempts
        ));
        self.reconnect.timer = Some(Box::pin(tokio::time::sleep(delay)));
        self.set_status(CallStatus::Reconnecting);
    }

    async fn fire_reconnect(&mut self) {
        self.reconnect.timer = None;
        if !self.reconnect.should_reconnect || self.snapshot.is_terminal() {
            return;
        }
        tracing::info!(
            target = "session",
            attempt = self.reconnect.attempts,
            "reconnecting"
        );
        self.reset_peer_link().await;
        if let Some(channel) = self.signaling.take() {
            channel.close();
        }
        self.generation += 1;
        self.publish();
        let Some(result) = self.connect_signaling().await else {
            self.hangup().await;
            return;
        };
        self.on_signaling_result(result).await;
    }

    async fn send_chat(&mut self, text: &str) -> Result<(), ChatError> {
        if self.snapshot.is_terminal() {
            return Err(ChatError::SessionClosed);
        }
        let sent = self.chat.send(self.chat_route(), text).await;
        match sent {
            Ok(message) => {
                self.snapshot.chat.push(message);
                self.publish();
                Ok(())
            }
            Err(err) => {
                tracing::debug!(target = "session", error = %err, "chat message not sent");
                Err(err)
            }
        }
    }

    fn on_chat(&mut self, inbound: ChatInbound<'_>) {
        let received = self.chat.receive(inbound, self.chat_route());
        if let Some(message) = received {
            self.snapshot.chat.push(message);
            self.publish();
        }
    }

    fn chat_route(&self) -> ChatRoute<'_> {
        ChatRoute {
            local_user: &self.params.user_id,
            remote_user: self.snapshot.remote_user_id.as_deref(),
            channel: self.chat_channel.as_ref(),
            signaling: self.signaling.as_ref(),
        }
    }

    async fn hangup(&mut self) {
        if self.snapshot.is_terminal() {
            return;
        }
        tracing::info!(target = "session", "hanging up");
        self.reconnect.should_reconnect = false;
        self.reconnect.timer = None;
        if let Some(channel) = self.signaling.as_ref().filter(|c| c.is_open()) {
            if let Err(err) = channel.send(SignalMessage::EndCall) {
                tracing::debug!(target = "session", error = %err, "end_call not sent");
            }
        }
        if let Err(err) = self.directory.end_call(&self.params.call_id).await {
            tracing::warn!(target = "session", error = %err, "end call request failed");
        }
        self.teardown().await;
        self.set_status(CallStatus::Ended);
    }

    async fn end_remotely(&mut self, message: &str) {
        if self.snapshot.is_terminal() {
            tracing::debug!(target = "session", message, "duplicate end signal ignored");
            return;
        }
        tracing::info!(target = "session", message, "call ended remotely");
        self.snapshot.error = Some(message.to_string());
        self.teardown().await;
        self.set_status(CallStatus::Ended);
    }

    async fn fail(&mut self, err: CallError) {
        if self.snapshot.is_terminal() {
            return;
        }
        tracing::error!(target = "session", error = %err, "call failed");
        self.snapshot.error = Some(err.to_string());
        self.teardown().await;
        self.set_status(CallStatus::Failed);
    }

    /// Discards the current negotiation context and everything hanging off it.
    async fn reset_peer_link(&mut self) {
        if let Some(mut ctx) = self.negotiation.take() {
            ctx.teardown().await;
        }
        if let Some(channel) = self.chat_channel.take() {
            channel.close().await;
        }
        self.remote_ready = false;
        self.link_state = LinkState::New;
        self.snapshot.connection_state = LinkState::New.as_str().to_string();
        self.snapshot.remote_stream_id = None;
        self.snapshot.chat_open = false;
    }

    /// Releases media, link and signaling exactly once.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.reconnect.should_reconnect = false;
        self.reconnect.timer = None;
        if self.media.release() {
            tracing::debug!(target = "session", "local media released");
        }
        self.reset_peer_link().await;
        if let Some(channel) = self.signaling.take() {
            channel.close();
        }
        self.generation += 1;
    }

    fn sink(&self) -> EventSink {
        EventSink::new(self.generation, self.events_tx.clone())
    }

    fn set_status(&mut self, status: CallStatus) {
        if self.snapshot.status != status {
            tracing::debug!(
                target = "session",
                from = ?self.snapshot.status,
                to = ?status,
                "status changed"
            );
        }
        self.snapshot.status = status;
        self.publish();
    }

    fn publish(&mut self) {
        self.snapshot.local_media = self.media.summary();
        self.publisher.send_replace(self.snapshot.clone());
    }
}
