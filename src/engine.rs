//! Media engine boundary
//!
//! The session controller never touches media itself. It asks a [`MediaEngine`]
//! for descriptions and hands it remote descriptions and candidates.
//! [`Str0mEngine`] is the implementation used by the peer binary; it wraps a
//! sans-IO `str0m` [`Rtc`] that the peer runtime drives over a UDP socket.

use str0m::{
    change::{SdpAnswer, SdpOffer, SdpPendingOffer},
    channel::ChannelId,
    Candidate, Rtc, RtcError,
};
use thiserror::Error;
use tracing::debug;

use crate::model::message::{IceCandidate, SdpType, SessionDescription};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ice candidate: {0}")]
    InvalidCandidate(String),
    #[error("no local offer is pending")]
    NoPendingOffer,
    #[error("no remote offer to answer")]
    NoRemoteOffer,
    #[error("nothing to negotiate")]
    NothingToNegotiate,
    #[error("media engine is closed")]
    Closed,
    #[error(transparent)]
    Rtc(#[from] RtcError),
}

/// Operations the negotiation core needs from the local media stack.
pub trait MediaEngine {
    fn create_offer(&mut self) -> Result<SessionDescription, EngineError>;

    fn create_answer(&mut self) -> Result<SessionDescription, EngineError>;

    fn set_local_description(&mut self, desc: &SessionDescription) -> Result<(), EngineError>;

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), EngineError>;

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), EngineError>;

    /// Release the media session. Must tolerate being called more than once.
    fn close(&mut self);
}

/// `str0m` backed engine negotiating a single data channel.
///
/// `str0m` applies a remote offer and produces the answer in one step, so the
/// answer is produced when the offer is set as remote description and handed
/// out later by [`MediaEngine::create_answer`].
pub struct Str0mEngine {
    rtc: Rtc,
    channel_label: String,
    channel: Option<ChannelId>,
    pending_offer: Option<SdpPendingOffer>,
    answer: Option<SdpAnswer>,
}

impl Str0mEngine {
    pub fn new(rtc: Rtc, channel_label: impl Into<String>) -> Self {
        Self {
            rtc,
            channel_label: channel_label.into(),
            channel: None,
            pending_offer: None,
            answer: None,
        }
    }

    /// Register a host candidate with the engine and return its wire form for
    /// trickling. Returns `None` when the engine considers it redundant.
    pub fn add_local_candidate(&mut self, candidate: Candidate) -> Option<IceCandidate> {
        let sdp = candidate.to_sdp_string();
        self.rtc.add_local_candidate(candidate)?;
        Some(IceCandidate {
            candidate: sdp,
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        })
    }

    pub fn rtc(&self) -> &Rtc {
        &self.rtc
    }

    pub fn rtc_mut(&mut self) -> &mut Rtc {
        &mut self.rtc
    }

    /// The data channel this engine offered, once an offer has been created.
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }
}

impl MediaEngine for Str0mEngine {
    fn create_offer(&mut self) -> Result<SessionDescription, EngineError> {
        if !self.rtc.is_alive() {
            return Err(EngineError::Closed);
        }

        let mut change = self.rtc.sdp_api();
        let cid = change.add_channel(self.channel_label.clone());
        let (offer, pending) = change.apply().ok_or(EngineError::NothingToNegotiate)?;

        debug!("Offered data channel '{}' ({:?})", self.channel_label, cid);
        self.channel = Some(cid);
        self.pending_offer = Some(pending);
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        self.answer
            .as_ref()
            .map(|answer| SessionDescription::answer(answer.to_sdp_string()))
            .ok_or(EngineError::NoRemoteOffer)
    }

    fn set_local_description(&mut self, desc: &SessionDescription) -> Result<(), EngineError> {
        // str0m has already committed to the description it generated.
        match desc.kind {
            SdpType::Offer if self.pending_offer.is_none() => Err(EngineError::NoPendingOffer),
            SdpType::Answer if self.answer.is_none() => Err(EngineError::NoRemoteOffer),
            _ => Ok(()),
        }
    }

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), EngineError> {
        match desc.kind {
            SdpType::Offer => {
                let offer = SdpOffer::from_sdp_string(&desc.sdp)
                    .map_err(|e| EngineError::InvalidDescription(e.to_string()))?;
                let answer = self.rtc.sdp_api().accept_offer(offer)?;
                self.answer = Some(answer);
            }
            SdpType::Answer => {
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or(EngineError::NoPendingOffer)?;
                let answer = SdpAnswer::from_sdp_string(&desc.sdp)
                    .map_err(|e| EngineError::InvalidDescription(e.to_string()))?;
                self.rtc.sdp_api().accept_answer(pending, answer)?;
            }
        }
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), EngineError> {
        let parsed = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| EngineError::InvalidCandidate(e.to_string()))?;
        self.rtc.add_remote_candidate(parsed);
        Ok(())
    }

    fn close(&mut self) {
        if self.rtc.is_alive() {
            self.rtc.disconnect();
        }
        self.pending_offer = None;
    }
}
