//! Wire types shared by the call orchestrator and anything that speaks to the
//! signaling relay or the call-lifecycle API. Kept in a dedicated crate so the
//! JSON contract can be checked without pulling in the WebRTC stack.

use serde::{Deserialize, Serialize};

/// Kind of a session description, serialized the way browsers emit
/// `RTCSessionDescriptionInit.type`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// End-of-candidates markers carry an empty candidate line.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Chat payload relayed over signaling. Peers disagree on field names
/// (`text` vs `message`, `sender` vs `from`), so every spelling is accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRelay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl ChatRelay {
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref().or(self.message.as_deref())
    }

    pub fn author(&self) -> Option<&str> {
        self.sender.as_deref().or(self.from.as_deref())
    }
}

/// Every message exchanged over the per-call signaling socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer {
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Answer {
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    ConnectionReady {
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    UserDisconnected {
        #[serde(default)]
        user_id: Option<String>,
    },
    CallEnded,
    EndCall,
    ChatMessage(ChatRelay),
    ConnectionState {
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        state: Option<String>,
    },
    Ping,
    Pong,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn offer(offer: SessionDescription) -> Self {
        SignalMessage::Offer { offer, from: None }
    }

    pub fn answer(answer: SessionDescription) -> Self {
        SignalMessage::Answer { answer, from: None }
    }

    pub fn ice_candidate(candidate: IceCandidate) -> Self {
        SignalMessage::IceCandidate {
            candidate,
            from: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice_candidate",
            SignalMessage::ConnectionReady { .. } => "connection_ready",
            SignalMessage::UserDisconnected { .. } => "user_disconnected",
            SignalMessage::CallEnded => "call_ended",
            SignalMessage::EndCall => "end_call",
            SignalMessage::ChatMessage(_) => "chat_message",
            SignalMessage::ConnectionState { .. } => "connection_state",
            SignalMessage::Ping => "ping",
            SignalMessage::Pong => "pong",
            SignalMessage::Error { .. } => "error",
            SignalMessage::Unknown => "unknown",
        }
    }
}

/// Text frame carried on the `chat` data channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ChatFrame {
    pub fn text(message: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            message: message.into(),
            timestamp: Some(timestamp.into()),
        }
    }
}

/// Call record as returned by the call-lifecycle API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRecord {
    pub id: String,
    pub initiator_id: String,
    pub receiver_id: String,
    pub status: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
}

impl CallRecord {
    pub fn is_initiator(&self, user_id: &str) -> bool {
        self.initiator_id == user_id
    }

    /// The other participant, from the point of view of `user_id`.
    pub fn remote_user_id(&self, user_id: &str) -> &str {
        if self.is_initiator(user_id) {
            &self.receiver_id
        } else {
            &self.initiator_id
        }
    }
}
