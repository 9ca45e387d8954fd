//! Inbound events for the session actor.
//!
//! Socket readers and peer-link callbacks never touch session state; they push
//! a [`SessionEvent`] stamped with the generation (connect attempt) they were
//! created for. The actor drops anything whose generation is no longer current.

use std::sync::Arc;

use call_proto::{IceCandidate, SignalMessage};
use tokio::sync::mpsc;

use crate::media::TrackKind;
use crate::negotiation::DataChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Server or network closed the socket.
    Remote { code: Option<u16>, reason: String },
    /// Server refused the credential (policy violation close).
    Rejected(String),
    Error(String),
}

impl CloseReason {
    pub fn describe(&self) -> String {
        match self {
            CloseReason::Remote { code: Some(code), reason } if !reason.is_empty() => {
                format!("closed by server ({code}: {reason})")
            }
            CloseReason::Remote { code: Some(code), .. } => format!("closed by server ({code})"),
            CloseReason::Remote { .. } => "closed by server".to_string(),
            CloseReason::Rejected(reason) => format!("rejected: {reason}"),
            CloseReason::Error(err) => format!("error: {err}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Message(SignalMessage),
    Closed(CloseReason),
}

/// Underlying peer connection state, reduced to what the session acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        }
    }

    pub fn is_broken(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed)
    }
}

pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack {
        stream_id: String,
        track_id: String,
        kind: TrackKind,
    },
    ConnectionState(LinkState),
    /// Channel announced by the remote side.
    DataChannel(Arc<dyn DataChannel>),
    DataChannelOpen { label: String },
    DataChannelClosed { label: String },
    DataChannelMessage { label: String, text: String },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::RemoteTrack {
                stream_id, kind, ..
            } => f
                .debug_struct("RemoteTrack")
                .field("stream_id", stream_id)
                .field("kind", kind)
                .finish(),
            PeerEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            PeerEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            PeerEvent::DataChannelOpen { label } => {
                f.debug_struct("DataChannelOpen").field("label", label).finish()
            }
            PeerEvent::DataChannelClosed { label } => {
                f.debug_struct("DataChannelClosed").field("label", label).finish()
            }
            PeerEvent::DataChannelMessage { label, text } => f
                .debug_struct("DataChannelMessage")
                .field("label", label)
                .field("len", &text.len())
                .finish(),
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    Signaling {
        generation: u64,
        event: SignalingEvent,
    },
    Peer {
        generation: u64,
        event: PeerEvent,
    },
}

/// Handle given to collaborators so they can report back into the session.
#[derive(Clone, Debug)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the session is gone.
    pub fn signaling(&self, event: SignalingEvent) -> bool {
        self.tx
            .send(SessionEvent::Signaling {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn peer(&self, event: PeerEvent) -> bool {
        self.tx
            .send(SessionEvent::Peer {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}
