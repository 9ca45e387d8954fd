//! Per-call signaling channel to the relay.
//!
//! A connector opens one channel per connect attempt. Inbound messages and the
//! final close are reported through the [`EventSink`] handed to `connect`; the
//! channel itself is only used to send and to close intentionally.

mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use call_proto::SignalMessage;

use crate::error::SignalingError;
use crate::events::EventSink;

pub use ws::{WsSignalingChannel, WsSignalingConnector};

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Opens the socket for `call_id`, authenticating with `credential`.
    /// Resolves once the socket is open or fails with a classified error.
    async fn connect(
        &self,
        call_id: &str,
        credential: &str,
        sink: EventSink,
    ) -> Result<Arc<dyn SignalingChannel>, SignalingError>;
}

pub trait SignalingChannel: Send + Sync {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;

    fn is_open(&self) -> bool;

    /// Intentional close. Stops the heartbeat and suppresses the `Closed`
    /// event, so no reconnect follows. Idempotent.
    fn close(&self);
}

/// Sends over `channel` if there is one and it is open; otherwise the message is
/// dropped with a warning. Returns whether the message was queued.
pub fn send_or_skip(channel: Option<&Arc<dyn SignalingChannel>>, message: SignalMessage) -> bool {
    let kind = message.kind();
    let Some(channel) = channel else {
        tracing::warn!(target = "signaling", kind, "no signaling channel; message skipped");
        return false;
    };
    match channel.send(message) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(target = "signaling", kind, error = %err, "signaling send skipped");
            false
        }
    }
}
