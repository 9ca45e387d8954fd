use serde::Serialize;
use time::OffsetDateTime;

use crate::chat::ChatLog;
use crate::media::LocalMediaSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Receiver,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Receiver => "receiver",
        }
    }
}

/// Fine-grained session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    FetchingCallInfo,
    AcquiringMedia,
    ConnectingSignaling,
    AwaitingPeer,
    Negotiating,
    Connected,
    Reconnecting,
    Ended,
    Failed,
}

/// Coarse lifecycle exposed to renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Idle,
    Connecting,
    Negotiating,
    Connected,
    Reconnecting,
    Ended,
    Failed,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Connecting => "connecting",
            Lifecycle::Negotiating => "negotiating",
            Lifecycle::Connected => "connected",
            Lifecycle::Reconnecting => "reconnecting",
            Lifecycle::Ended => "ended",
            Lifecycle::Failed => "failed",
        }
    }
}

impl CallStatus {
    pub fn lifecycle(self) -> Lifecycle {
        match self {
            CallStatus::Idle => Lifecycle::Idle,
            CallStatus::FetchingCallInfo
            | CallStatus::AcquiringMedia
            | CallStatus::ConnectingSignaling
            | CallStatus::AwaitingPeer => Lifecycle::Connecting,
            CallStatus::Negotiating => Lifecycle::Negotiating,
            CallStatus::Connected => Lifecycle::Connected,
            CallStatus::Reconnecting => Lifecycle::Reconnecting,
            CallStatus::Ended => Lifecycle::Ended,
            CallStatus::Failed => Lifecycle::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Failed)
    }
}

/// Everything an observer may render, published on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub call_id: String,
    pub status: CallStatus,
    /// Single current error or warning; cleared on (re)connection.
    pub error: Option<String>,
    pub role: Option<Role>,
    pub remote_user_id: Option<String>,
    /// Last state reported by the peer link.
    pub connection_state: String,
    pub local_media: LocalMediaSummary,
    pub remote_stream_id: Option<String>,
    pub chat_open: bool,
    pub started_at: Option<OffsetDateTime>,
    pub reconnect_attempt: u32,
    pub chat: ChatLog,
}

impl SessionSnapshot {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: CallStatus::Idle,
            error: None,
            role: None,
            remote_user_id: None,
            connection_state: "new".to_string(),
            local_media: LocalMediaSummary::default(),
            remote_stream_id: None,
            chat_open: false,
            started_at: None,
            reconnect_attempt: 0,
            chat: ChatLog::default(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.status.lifecycle()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
