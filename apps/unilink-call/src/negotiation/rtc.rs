//! webrtc-rs backed [`PeerLink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use call_proto::{IceCandidate, SdpKind, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{DataChannel, PeerLink, PeerLinkFactory};
use crate::config::CallConfig;
use crate::error::NegotiationError;
use crate::events::{EventSink, LinkState, PeerEvent};
use crate::media::{LocalMedia, LocalTrack, TrackKind};

/// 20 ms Opus frame that decodes to silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME: Duration = Duration::from_millis(20);

#[derive(Debug, Default, Clone)]
pub struct RtcPeerLinkFactory;

impl RtcPeerLinkFactory {
    pub fn new() -> Self {
        Self
    }
}

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| NegotiationError::Setup(e.to_string()))?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| NegotiationError::Setup(e.to_string()))?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    async fn create(
        &self,
        config: &CallConfig,
        media: &LocalMedia,
        sink: EventSink,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| NegotiationError::Setup(e.to_string()))?,
        );

        let mut pumps = Vec::new();
        for track in media.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                media.stream_id().to_string(),
            ));
            let sender = peer_connection
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| NegotiationError::Setup(format!("failed to add track: {e}")))?;
            // RTCP has to be read for interceptors to work.
            pumps.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            }));
            if track.kind() == TrackKind::Audio {
                pumps.push(spawn_audio_pump(Arc::clone(track), local));
            }
        }

        let track_sink = sink.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    tracing::debug!(
                        target = "negotiation",
                        stream_id = %track.stream_id(),
                        kind = kind.as_str(),
                        "remote track received"
                    );
                    sink.peer(PeerEvent::RemoteTrack {
                        stream_id: track.stream_id(),
                        track_id: track.id(),
                        kind,
                    });
                    tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
                })
            },
        ));

        let candidate_sink = sink.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        sink.peer(PeerEvent::LocalCandidate(from_candidate_init(json)));
                    }
                    Err(err) => {
                        tracing::warn!(target = "negotiation", error = %err, "failed to encode local candidate");
                    }
                }
            })
        }));

        let state_sink = sink.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = state_sink.clone();
                Box::pin(async move {
                    let state = link_state(state);
                    tracing::debug!(
                        target = "negotiation",
                        state = state.as_str(),
                        "peer connection state changed"
                    );
                    sink.peer(PeerEvent::ConnectionState(state));
                })
            },
        ));

        let channel_sink = sink.clone();
        peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = channel_sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "negotiation", label = %dc.label(), "inbound data channel");
                let channel = RtcDataChannel::wire(dc, sink.clone());
                sink.peer(PeerEvent::DataChannel(channel));
            })
        }));

        Ok(Arc::new(RtcPeerLink {
            peer_connection,
            sink,
            pumps: parking_lot::Mutex::new(pumps),
        }))
    }
}

pub struct RtcPeerLink {
    peer_connection: Arc<RTCPeerConnection>,
    sink: EventSink,
    pumps: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| NegotiationError::Offer(e.to_string()))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Answer(e.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let kind = kind_name(desc.kind);
        let desc = to_rtc(desc)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|e| NegotiationError::Description {
                kind,
                reason: e.to_string(),
            })
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let kind = kind_name(desc.kind);
        let desc = to_rtc(desc)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::Description {
                kind,
                reason: e.to_string(),
            })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| NegotiationError::DataChannel(e.to_string()))?;
        Ok(RtcDataChannel::wire(dc, self.sink.clone()))
    }

    async fn close(&self) {
        for handle in self.pumps.lock().drain(..) {
            handle.abort();
        }
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target = "negotiation", error = %err, "peer connection close failed");
        }
    }
}

impl Drop for RtcPeerLink {
    fn drop(&mut self) {
        for handle in self.pumps.lock().drain(..) {
            handle.abort();
        }
    }
}

pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
}

impl RtcDataChannel {
    fn wire(dc: Arc<RTCDataChannel>, sink: EventSink) -> Arc<dyn DataChannel> {
        let label = dc.label().to_string();

        let open_sink = sink.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let sink = open_sink.clone();
            let label = open_label.clone();
            Box::pin(async move {
                tracing::debug!(target = "negotiation", label = %label, "data channel open");
                sink.peer(PeerEvent::DataChannelOpen { label });
            })
        }));

        let close_sink = sink.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let sink = close_sink.clone();
            let label = close_label.clone();
            Box::pin(async move {
                tracing::debug!(target = "negotiation", label = %label, "data channel closed");
                sink.peer(PeerEvent::DataChannelClosed { label });
            })
        }));

        let message_label = label.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            let label = message_label.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        sink.peer(PeerEvent::DataChannelMessage { label, text });
                    }
                    Err(_) => {
                        tracing::warn!(target = "negotiation", label = %label, "dropping binary data channel frame");
                    }
                }
            })
        }));

        Arc::new(Self { inner: dc, label })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), NegotiationError> {
        if !self.is_open() {
            return Err(NegotiationError::DataChannel(format!(
                "channel {} is not open",
                self.label
            )));
        }
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| NegotiationError::DataChannel(e.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            tracing::debug!(target = "negotiation", error = %err, "data channel close failed");
        }
    }
}

/// Feeds Opus silence while the local audio track is enabled. Nothing is sent
/// while muted, the way a disabled capture track goes quiet.
fn spawn_audio_pump(
    track: Arc<LocalTrack>,
    local: Arc<TrackLocalStaticSample>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OPUS_FRAME);
        loop {
            ticker.tick().await;
            if track.is_stopped() {
                break;
            }
            if !track.is_enabled() {
                continue;
            }
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: OPUS_FRAME,
                ..Default::default()
            };
            if local.write_sample(&sample).await.is_err() {
                break;
            }
        }
    })
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

fn kind_name(kind: SdpKind) -> &'static str {
    match kind {
        SdpKind::Offer => "offer",
        SdpKind::Pranswer => "pranswer",
        SdpKind::Answer => "answer",
        SdpKind::Rollback => "rollback",
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let kind = kind_name(desc.kind);
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(NegotiationError::Description {
                kind,
                reason: "rollback is not supported".into(),
            });
        }
    };
    result.map_err(|e| NegotiationError::Description {
        kind,
        reason: e.to_string(),
    })
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::Description {
                kind: "unspecified",
                reason: "description without a type".into(),
            });
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn state_mapping_covers_session_relevant_states() {
        assert_eq!(link_state(RTCPeerConnectionState::Connected), LinkState::Connected);
        assert_eq!(link_state(RTCPeerConnectionState::Failed), LinkState::Failed);
        assert_eq!(
            link_state(RTCPeerConnectionState::Disconnected),
            LinkState::Disconnected
        );
        assert_eq!(link_state(RTCPeerConnectionState::Unspecified), LinkState::New);
    }

    #[test]
    fn rollback_descriptions_are_refused() {
        let err = to_rtc(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .unwrap_err();
        assert!(matches!(err, NegotiationError::Description { kind: "rollback", .. }));
    }

    #[tokio::test]
    async fn two_links_negotiate_in_process() {
        let config = CallConfig {
            ice_servers: Vec::new(),
            ..CallConfig::default()
        };
        let media = LocalMedia::from_constraints(crate::media::MediaConstraints::audio_only());
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let factory = RtcPeerLinkFactory::new();
        let a = factory
            .create(&config, &media, EventSink::new(1, tx_a))
            .await
            .unwrap();
        let b = factory
            .create(&config, &media, EventSink::new(1, tx_b))
            .await
            .unwrap();

        a.create_data_channel("chat").await.unwrap();
        let offer = a.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        a.close().await;
        b.close().await;
    }
}
