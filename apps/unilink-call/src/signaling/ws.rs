use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use call_proto::SignalMessage;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Error as WsError, Message,
        error::ProtocolError,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use url::Url;

use super::{SignalingChannel, SignalingConnector};
use crate::config::CallConfig;
use crate::error::SignalingError;
use crate::events::{CloseReason, EventSink, SignalingEvent};

enum Outbound {
    Message(SignalMessage),
    Close,
}

/// Opens `/ws/webrtc/<call_id>` sockets against the configured call service.
#[derive(Clone, Debug)]
pub struct WsSignalingConnector {
    config: CallConfig,
}

impl WsSignalingConnector {
    pub fn new(config: CallConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SignalingConnector for WsSignalingConnector {
    async fn connect(
        &self,
        call_id: &str,
        credential: &str,
        sink: EventSink,
    ) -> Result<Arc<dyn SignalingChannel>, SignalingError> {
        let url = self.config.signaling_url(call_id, credential)?;
        let channel = WsSignalingChannel::connect(
            &url,
            self.config.signaling_connect_timeout,
            self.config.heartbeat_interval,
            sink,
        )
        .await?;
        Ok(channel)
    }
}

pub struct WsSignalingChannel {
    send_tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsSignalingChannel {
    pub async fn connect(
        url: &Url,
        connect_timeout: Duration,
        heartbeat: Duration,
        sink: EventSink,
    ) -> Result<Arc<Self>, SignalingError> {
        let display_url = redacted(url);
        let connecting = tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await;
        let (ws_stream, _) = match connecting {
            Err(_) => {
                tracing::warn!(
                    target = "signaling",
                    url = %display_url,
                    timeout_ms = connect_timeout.as_millis() as u64,
                    "signaling connect timed out"
                );
                return Err(SignalingError::Timeout(connect_timeout.as_millis() as u64));
            }
            Ok(Err(err)) => return Err(classify_connect_error(err)),
            Ok(Ok(pair)) => pair,
        };
        tracing::debug!(
            target = "signaling",
            url = %display_url,
            generation = sink.generation(),
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Outbound>();
        let open = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let writer_handle = tokio::spawn(async move {
            while let Some(outbound) = send_rx.recv().await {
                match outbound {
                    Outbound::Message(message) => match message.to_text() {
                        Ok(text) => {
                            tracing::trace!(
                                target = "signaling",
                                event = "ws_out",
                                kind = message.kind(),
                                len = text.len()
                            );
                            if ws_write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                target = "signaling",
                                kind = message.kind(),
                                error = %err,
                                "failed to encode signaling message"
                            );
                        }
                    },
                    Outbound::Close => {
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        });

        let heartbeat_open = Arc::clone(&open);
        let heartbeat_tx = send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !heartbeat_open.load(Ordering::SeqCst) {
                    break;
                }
                if heartbeat_tx
                    .send(Outbound::Message(SignalMessage::Ping))
                    .is_err()
                {
                    break;
                }
            }
        });
        let heartbeat_abort = heartbeat_handle.abort_handle();

        let reader_open = Arc::clone(&open);
        let reader_closing = Arc::clone(&closing);
        let reader_handle = tokio::spawn(async move {
            let reason = loop {
                let Some(frame) = ws_read.next().await else {
                    break CloseReason::Remote {
                        code: None,
                        reason: String::new(),
                    };
                };
                match frame {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(
                            target = "signaling",
                            event = "ws_in",
                            kind = "text",
                            len = text.len()
                        );
                        if !deliver(&sink, &text) {
                            break CloseReason::Error("session gone".into());
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        tracing::trace!(
                            target = "signaling",
                            event = "ws_in",
                            kind = "binary",
                            len = data.len()
                        );
                        match String::from_utf8(data) {
                            Ok(text) => {
                                if !deliver(&sink, &text) {
                                    break CloseReason::Error("session gone".into());
                                }
                            }
                            Err(_) => {
                                tracing::warn!(target = "signaling", "dropping non-utf8 frame")
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => break close_reason(frame),
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "signaling",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break CloseReason::Error(err.to_string());
                    }
                }
            };
            reader_open.store(false, Ordering::SeqCst);
            heartbeat_abort.abort();
            if reader_closing.load(Ordering::SeqCst) {
                tracing::debug!(target = "signaling", "signaling closed intentionally");
                return;
            }
            tracing::info!(
                target = "signaling",
                reason = %reason.describe(),
                "signaling channel closed"
            );
            sink.signaling(SignalingEvent::Closed(reason));
        });

        Ok(Arc::new(Self {
            send_tx,
            open,
            closing,
            tasks: Mutex::new(vec![writer_handle, heartbeat_handle, reader_handle]),
        }))
    }
}

impl SignalingChannel for WsSignalingChannel {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::Closed);
        }
        self.send_tx
            .send(Outbound::Message(message))
            .map_err(|_| SignalingError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closing.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.send_tx.send(Outbound::Close);
        // Writer is left running so the close frame goes out.
        let mut tasks = self.tasks.lock();
        for handle in tasks.drain(1..) {
            handle.abort();
        }
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Parses one inbound frame and forwards it. Unparseable payloads are dropped.
/// Returns `false` once nobody is listening.
fn deliver(sink: &EventSink, text: &str) -> bool {
    match SignalMessage::parse(text) {
        Ok(SignalMessage::Pong) => {
            tracing::trace!(target = "signaling", "heartbeat acknowledged");
            true
        }
        Ok(message) => sink.signaling(SignalingEvent::Message(message)),
        Err(err) => {
            tracing::warn!(
                target = "signaling",
                error = %err,
                len = text.len(),
                "dropping unparseable signaling payload"
            );
            true
        }
    }
}

fn close_reason(frame: Option<CloseFrame<'_>>) -> CloseReason {
    match frame {
        Some(frame) if frame.code == CloseCode::Policy => {
            CloseReason::Rejected(frame.reason.into_owned())
        }
        Some(frame) => CloseReason::Remote {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.into_owned(),
        },
        None => CloseReason::Remote {
            code: None,
            reason: String::new(),
        },
    }
}

fn classify_connect_error(err: WsError) -> SignalingError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                SignalingError::AuthRejected(format!("http {}", status.as_u16()))
            } else {
                SignalingError::Connect(format!("http {}", status.as_u16()))
            }
        }
        WsError::Url(err) => SignalingError::InvalidEndpoint(err.to_string()),
        other => SignalingError::Connect(other.to_string()),
    }
}

/// URL without the query string, which carries the bearer token.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
