//! Offer/answer negotiation over one peer link.
//!
//! [`PeerLink`] is the seam to the WebRTC stack (see [`rtc`] for the
//! webrtc-rs backed link). [`NegotiationContext`] holds everything that belongs
//! to one negotiation attempt and is thrown away whole on reconnect.

pub mod rtc;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use call_proto::{IceCandidate, SessionDescription};

use crate::config::CallConfig;
use crate::error::{MediaError, NegotiationError};
use crate::events::EventSink;
use crate::media::{AcquiredMedia, LocalMedia, MediaConstraints, MediaDevices};

pub use rtc::RtcPeerLinkFactory;

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), NegotiationError>;

    async fn close(&self);
}

/// One peer connection. Events (local candidates, remote tracks, state
/// changes, data channel traffic) go to the sink the link was created with.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Builds a link with every track of `media` attached and all handlers
    /// wired to `sink`.
    async fn create(
        &self,
        config: &CallConfig,
        media: &LocalMedia,
        sink: EventSink,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}

/// Remote candidates that arrived before the remote description, in arrival order.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.pending.drain(..)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
    /// End-of-candidates marker, nothing to apply.
    Skipped,
}

pub struct NegotiationContext {
    link: Arc<dyn PeerLink>,
    generation: u64,
    pending: CandidateQueue,
    remote_description_set: bool,
    offer_sent: bool,
    awaiting_answer: bool,
    exchange_complete: bool,
    remote_stream_id: Option<String>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    closed: bool,
}

impl NegotiationContext {
    pub fn new(link: Arc<dyn PeerLink>, generation: u64) -> Self {
        Self {
            link,
            generation,
            pending: CandidateQueue::default(),
            remote_description_set: false,
            offer_sent: false,
            awaiting_answer: false,
            exchange_complete: false,
            remote_stream_id: None,
            local_description: None,
            remote_description: None,
            closed: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn offer_sent(&self) -> bool {
        self.offer_sent
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// True once one full offer/answer exchange finished on this link.
    pub fn exchange_complete(&self) -> bool {
        self.exchange_complete
    }

    pub fn remote_stream_id(&self) -> Option<&str> {
        self.remote_stream_id.as_deref()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// Creates and applies the initial offer. The latch is taken before the
    /// offer is built, so a failed attempt needs [`Self::reset_offer_latch`]
    /// before another one. Returns `None` when an offer already went out.
    pub async fn create_offer(&mut self) -> Result<Option<SessionDescription>, NegotiationError> {
        self.ensure_open()?;
        if self.offer_sent {
            return Ok(None);
        }
        self.offer_sent = true;
        let offer = self.make_offer(false).await?;
        Ok(Some(offer))
    }

    pub fn reset_offer_latch(&mut self) {
        self.offer_sent = false;
    }

    /// Fresh offer with new ICE credentials on the same link.
    pub async fn restart_ice(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.offer_sent = true;
        self.make_offer(true).await
    }

    /// Applies a remote offer, flushes buffered candidates and returns the
    /// applied local answer.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.apply_remote(offer).await?;
        let answer = self.link.create_answer().await?;
        self.link.set_local_description(answer.clone()).await?;
        self.local_description = Some(answer.clone());
        self.exchange_complete = true;
        Ok(answer)
    }

    /// Applies a remote answer if one of our offers is outstanding.
    /// Returns `false` when the answer was ignored.
    pub async fn accept_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<bool, NegotiationError> {
        self.ensure_open()?;
        if !self.awaiting_answer {
            tracing::debug!(
                target = "negotiation",
                generation = self.generation,
                "ignoring answer without an outstanding offer"
            );
            return Ok(false);
        }
        self.apply_remote(answer).await?;
        self.awaiting_answer = false;
        self.exchange_complete = true;
        Ok(true)
    }

    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, NegotiationError> {
        self.ensure_open()?;
        if candidate.is_end_of_candidates() {
            return Ok(CandidateDisposition::Skipped);
        }
        if !self.remote_description_set {
            self.pending.push(candidate);
            tracing::trace!(
                target = "negotiation",
                generation = self.generation,
                buffered = self.pending.len(),
                "buffered remote candidate"
            );
            return Ok(CandidateDisposition::Buffered);
        }
        self.link.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    /// Records the first remote stream. Returns `false` for a stream that is
    /// already known.
    pub fn note_remote_stream(&mut self, stream_id: &str) -> bool {
        if self.remote_stream_id.as_deref() == Some(stream_id) {
            return false;
        }
        if self.remote_stream_id.is_some() {
            tracing::debug!(
                target = "negotiation",
                stream_id,
                "additional remote stream ignored"
            );
            return false;
        }
        self.remote_stream_id = Some(stream_id.to_string());
        true
    }

    pub async fn attach_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        self.ensure_open()?;
        self.link.create_data_channel(label).await
    }

    /// Closes the link and drops buffered state. Idempotent.
    pub async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let dropped = self.pending.drain().count();
        if dropped > 0 {
            tracing::debug!(
                target = "negotiation",
                generation = self.generation,
                dropped,
                "discarding unapplied remote candidates"
            );
        }
        self.link.close().await;
    }

    async fn make_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let offer = self.link.create_offer(ice_restart).await?;
        self.link.set_local_description(offer.clone()).await?;
        self.local_description = Some(offer.clone());
        self.awaiting_answer = true;
        Ok(offer)
    }

    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.link.set_remote_description(desc.clone()).await?;
        self.remote_description = Some(desc);
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        let buffered: Vec<IceCandidate> = self.pending.drain().collect();
        if buffered.is_empty() {
            return;
        }
        tracing::debug!(
            target = "negotiation",
            generation = self.generation,
            count = buffered.len(),
            "applying buffered remote candidates"
        );
        for candidate in buffered {
            if let Err(err) = self.link.add_ice_candidate(candidate).await {
                tracing::warn!(target = "negotiation", error = %err, "buffered candidate rejected");
            }
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Media capture plus peer-link construction for one session.
#[derive(Clone)]
pub struct NegotiationEngine {
    config: CallConfig,
    devices: Arc<dyn MediaDevices>,
    links: Arc<dyn PeerLinkFactory>,
}

impl NegotiationEngine {
    pub fn new(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        links: Arc<dyn PeerLinkFactory>,
    ) -> Self {
        Self {
            config,
            devices,
            links,
        }
    }

    pub async fn acquire_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<AcquiredMedia, MediaError> {
        crate::media::acquire_local_media(self.devices.as_ref(), constraints).await
    }

    pub async fn create_peer_link(
        &self,
        media: &LocalMedia,
        sink: EventSink,
    ) -> Result<NegotiationContext, NegotiationError> {
        let generation = sink.generation();
        let link = self.links.create(&self.config, media, sink).await?;
        tracing::debug!(
            target = "negotiation",
            generation,
            tracks = media.tracks().len(),
            "peer link created"
        );
        Ok(NegotiationContext::new(link, generation))
    }
}
