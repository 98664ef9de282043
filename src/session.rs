//! Peer session controller
//!
//! Drives one local media session through the offer/answer handshake. Inbound
//! signals are applied strictly one at a time (`&mut self`), outbound signals
//! are pushed onto an unbounded queue that the transport drains, and state
//! changes are published on a watch channel for the UI layer.
//!
//! Remote candidates that arrive before a remote description are buffered and
//! handed to the engine, in arrival order, the moment the remote description is
//! applied. Candidates arriving after that go straight to the engine.

use std::mem;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::engine::{EngineError, MediaEngine};
use crate::model::message::{IceCandidate, SessionDescription, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    /// Provisional answer states. Never entered: there is no pranswer support.
    HaveLocalAnswer,
    HaveRemoteAnswer,
    Stable,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already negotiating (state {0:?})")]
    AlreadyStarted(SessionState),
    #[error("session is closed")]
    Closed,
    #[error("negotiation failed: {0}")]
    Negotiation(#[source] EngineError),
    #[error("signaling transport closed")]
    TransportClosed,
}

pub struct PeerSession<E> {
    engine: E,
    outbox: mpsc::UnboundedSender<Signal>,
    state: watch::Sender<SessionState>,
    role: Option<Role>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_remote_candidates: Vec<IceCandidate>,
}

impl<E: MediaEngine> PeerSession<E> {
    pub fn new(engine: E, outbox: mpsc::UnboundedSender<Signal>) -> Self {
        let (state, _) = watch::channel(SessionState::New);
        Self {
            engine,
            outbox,
            state,
            role: None,
            local_description: None,
            remote_description: None,
            pending_remote_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// Remote candidates waiting for a remote description.
    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_remote_candidates
    }

    /// Follow state changes. The receiver always sees the latest state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Announce the room without offering; the session then waits for an offer.
    pub fn join(&mut self, room: &str) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        self.send(Signal::Join {
            room: room.to_string(),
        })
    }

    /// Join `room` as the offerer and send the one offer this session makes.
    pub fn start(&mut self, room: &str) -> Result<(), SessionError> {
        match self.state() {
            SessionState::New => {}
            SessionState::Closed => return Err(SessionError::Closed),
            state => return Err(SessionError::AlreadyStarted(state)),
        }

        self.join(room)?;
        self.role = Some(Role::Offerer);

        let offer = match self.create_local(|engine| engine.create_offer()) {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(e)),
        };

        info!("📝 Created local offer for room '{}'", room);
        self.local_description = Some(offer.clone());
        self.transition(SessionState::HaveLocalOffer);
        self.send(Signal::Offer(offer))
    }

    /// Apply one inbound signal.
    ///
    /// Only a failing remote or local description is reported as an error;
    /// out-of-order or repeated signals are ignored.
    pub fn on_message(&mut self, signal: Signal) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            debug!("Ignoring '{}' on closed session", signal.kind());
            return Ok(());
        }

        match signal {
            Signal::Join { room } => {
                debug!("Ignoring join for room '{}'", room);
                Ok(())
            }
            Signal::Offer(offer) => self.accept_offer(offer),
            Signal::Answer(answer) => self.accept_answer(answer),
            Signal::Candidate(candidate) => {
                self.add_remote_candidate(candidate);
                Ok(())
            }
        }
    }

    /// Trickle a locally discovered candidate, whatever the negotiation state.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            debug!("Dropping local candidate on closed session");
            return Ok(());
        }
        self.send(Signal::Candidate(candidate))
    }

    /// The signaling transport is gone.
    pub fn on_transport_closed(&mut self) {
        if self.state() != SessionState::Closed {
            warn!("🔌 Signaling connection lost in state {:?}", self.state());
            self.close();
        }
    }

    /// Release the media session. Calling it again has no further effect.
    pub fn teardown(&mut self) {
        if self.state() != SessionState::Closed {
            info!("Tearing down session");
            self.close();
        }
    }

    fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), SessionError> {
        if self.state() != SessionState::New {
            debug!("Ignoring offer in state {:?}", self.state());
            return Ok(());
        }

        self.role = Some(Role::Answerer);
        if let Err(e) = self.engine.set_remote_description(&offer) {
            return Err(self.fail(e));
        }
        info!("📥 Applied remote offer");
        self.remote_description = Some(offer);
        self.transition(SessionState::HaveRemoteOffer);
        self.drain_pending_candidates();

        let answer = match self.create_local(|engine| engine.create_answer()) {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(e)),
        };
        self.local_description = Some(answer.clone());
        self.send(Signal::Answer(answer))?;
        self.transition(SessionState::Stable);
        Ok(())
    }

    fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), SessionError> {
        if self.state() != SessionState::HaveLocalOffer {
            debug!("Ignoring answer in state {:?}", self.state());
            return Ok(());
        }

        if let Err(e) = self.engine.set_remote_description(&answer) {
            return Err(self.fail(e));
        }
        info!("📥 Applied remote answer");
        self.remote_description = Some(answer);
        self.drain_pending_candidates();
        self.transition(SessionState::Stable);
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_description.is_some() {
            self.apply_candidate(candidate);
        } else {
            debug!(
                "Buffering remote candidate ({} pending)",
                self.pending_remote_candidates.len() + 1
            );
            self.pending_remote_candidates.push(candidate);
        }
    }

    fn drain_pending_candidates(&mut self) {
        let pending = mem::take(&mut self.pending_remote_candidates);
        if !pending.is_empty() {
            debug!("Applying {} buffered remote candidates", pending.len());
        }
        for candidate in pending {
            self.apply_candidate(candidate);
        }
    }

    fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self.engine.add_ice_candidate(&candidate) {
            warn!("Dropping remote candidate '{}': {}", candidate.candidate, e);
        }
    }

    fn create_local(
        &mut self,
        create: impl FnOnce(&mut E) -> Result<SessionDescription, EngineError>,
    ) -> Result<SessionDescription, EngineError> {
        let desc = create(&mut self.engine)?;
        self.engine.set_local_description(&desc)?;
        Ok(desc)
    }

    fn send(&mut self, signal: Signal) -> Result<(), SessionError> {
        let kind = signal.kind();
        if self.outbox.send(signal).is_err() {
            self.on_transport_closed();
            return Err(SessionError::TransportClosed);
        }
        debug!("Queued '{}' for the relay", kind);
        Ok(())
    }

    fn fail(&mut self, e: EngineError) -> SessionError {
        error!("❌ Negotiation failed in state {:?}: {}", self.state(), e);
        self.close();
        SessionError::Negotiation(e)
    }

    fn close(&mut self) {
        self.engine.close();
        self.pending_remote_candidates.clear();
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Session state {:?} -> {:?}", previous, next);
        }
    }
}
