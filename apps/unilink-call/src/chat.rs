//! Text chat alongside the call.
//!
//! Two delivery strategies sit behind [`ChatStrategy`]; one is picked when the
//! session starts and both yield the same [`ChatMessage`] stream.

use std::sync::Arc;

use async_trait::async_trait;
use call_proto::{ChatFrame, ChatRelay, SignalMessage};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::ChatMode;
use crate::error::ChatError;
use crate::negotiation::DataChannel;
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    pub timestamp: OffsetDateTime,
    pub is_local: bool,
}

/// Append-only, ordered chat history for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Where an outgoing message can go right now.
#[derive(Clone, Copy, Default)]
pub struct ChatRoute<'a> {
    pub local_user: &'a str,
    pub remote_user: Option<&'a str>,
    pub channel: Option<&'a Arc<dyn DataChannel>>,
    pub signaling: Option<&'a Arc<dyn SignalingChannel>>,
}

pub enum ChatInbound<'a> {
    /// `chat_message` received over signaling.
    Relay(&'a ChatRelay),
    /// Text frame received on the chat data channel.
    Frame(&'a str),
}

#[async_trait]
pub trait ChatStrategy: Send + Sync {
    fn mode(&self) -> ChatMode;

    /// Delivers `text` and returns the local copy to append.
    async fn send(&self, route: ChatRoute<'_>, text: &str) -> Result<ChatMessage, ChatError>;

    /// Turns an inbound payload into a message; `None` when it is not for us.
    fn receive(&self, inbound: ChatInbound<'_>, route: ChatRoute<'_>) -> Option<ChatMessage>;
}

pub fn strategy_for(mode: ChatMode) -> Box<dyn ChatStrategy> {
    match mode {
        ChatMode::DataChannel => Box::new(DataChannelChat),
        ChatMode::SignalingRelay => Box::new(RelayChat),
    }
}

#[derive(Debug, Default)]
pub struct DataChannelChat;

#[async_trait]
impl ChatStrategy for DataChannelChat {
    fn mode(&self) -> ChatMode {
        ChatMode::DataChannel
    }

    async fn send(&self, route: ChatRoute<'_>, text: &str) -> Result<ChatMessage, ChatError> {
        let text = normalize(text)?;
        let channel = route
            .channel
            .filter(|c| c.is_open())
            .ok_or(ChatError::NotOpen)?;
        let now = OffsetDateTime::now_utc();
        let frame = ChatFrame::text(text, format_timestamp(now));
        let payload =
            serde_json::to_string(&frame).map_err(|e| ChatError::Delivery(e.to_string()))?;
        channel
            .send_text(payload)
            .await
            .map_err(|e| ChatError::Delivery(e.to_string()))?;
        Ok(ChatMessage {
            sender: route.local_user.to_string(),
            text: text.to_string(),
            timestamp: now,
            is_local: true,
        })
    }

    fn receive(&self, inbound: ChatInbound<'_>, route: ChatRoute<'_>) -> Option<ChatMessage> {
        let ChatInbound::Frame(payload) = inbound else {
            return None;
        };
        let sender = route.remote_user.unwrap_or("remote").to_string();
        let message = match serde_json::from_str::<ChatFrame>(payload) {
            Ok(frame) => ChatMessage {
                sender,
                text: frame.message,
                timestamp: parse_timestamp(frame.timestamp.as_deref()),
                is_local: false,
            },
            // Peers that send bare strings still get through.
            Err(_) => ChatMessage {
                sender,
                text: payload.to_string(),
                timestamp: OffsetDateTime::now_utc(),
                is_local: false,
            },
        };
        Some(message)
    }
}

#[derive(Debug, Default)]
pub struct RelayChat;

#[async_trait]
impl ChatStrategy for RelayChat {
    fn mode(&self) -> ChatMode {
        ChatMode::SignalingRelay
    }

    async fn send(&self, route: ChatRoute<'_>, text: &str) -> Result<ChatMessage, ChatError> {
        let text = normalize(text)?;
        let signaling = route
            .signaling
            .filter(|s| s.is_open())
            .ok_or(ChatError::NotOpen)?;
        let now = OffsetDateTime::now_utc();
        let relay = ChatRelay {
            text: Some(text.to_string()),
            timestamp: Some(format_timestamp(now)),
            to: route.remote_user.map(str::to_string),
            ..ChatRelay::default()
        };
        signaling
            .send(SignalMessage::ChatMessage(relay))
            .map_err(|e| ChatError::Delivery(e.to_string()))?;
        // Echoed optimistically; the relay never acknowledges.
        Ok(ChatMessage {
            sender: route.local_user.to_string(),
            text: text.to_string(),
            timestamp: now,
            is_local: true,
        })
    }

    fn receive(&self, inbound: ChatInbound<'_>, route: ChatRoute<'_>) -> Option<ChatMessage> {
        let ChatInbound::Relay(relay) = inbound else {
            return None;
        };
        let text = relay.body()?;
        // The relay broadcasts to everyone in the call, us included.
        let sender = relay.author().unwrap_or("remote");
        if sender == route.local_user {
            return None;
        }
        Some(ChatMessage {
            sender: sender.to_string(),
            text: text.to_string(),
            timestamp: parse_timestamp(relay.timestamp.as_deref()),
            is_local: false,
        })
    }
}

fn normalize(text: &str) -> Result<&str, ChatError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(ChatError::Empty)
    } else {
        Ok(trimmed)
    }
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

fn parse_timestamp(raw: Option<&str>) -> OffsetDateTime {
    raw.and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
}
