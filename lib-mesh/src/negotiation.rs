//! WebRTC perfect negotiation
//!
//! The standard pattern as a pure state machine: the id tie-break fixes one
//! side polite, the polite side rolls back on offer collision, remote ICE
//! candidates buffer until a remote description is applied, and ICE restarts
//! are bounded. Inputs are signals; outputs are actions for whatever session
//! backend terminates the channel. This node mostly *relays* these signals
//! between browsers, but validates and drives the machine in tests and for
//! any attached backend.

use serde_json::Value;
use tracing::debug;

/// Bounded ICE restart attempts before the session is abandoned.
const MAX_ICE_RESTARTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// What the session backend should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationAction {
    /// Apply the remote offer and produce an answer.
    ApplyRemoteOffer(String),
    ApplyRemoteAnswer(String),
    ApplyCandidate(Value),
    /// Undo the local offer first (polite collision handling).
    Rollback,
    RestartIce,
    Abort,
}

/// Per-session negotiation state for one browser pair.
#[derive(Debug)]
pub struct PerfectNegotiation {
    polite: bool,
    state: SignalingState,
    making_offer: bool,
    remote_description_set: bool,
    buffered_candidates: Vec<Value>,
    ice_restarts: u32,
}

impl PerfectNegotiation {
    pub fn new(polite: bool) -> Self {
        PerfectNegotiation {
            polite,
            state: SignalingState::Stable,
            making_offer: false,
            remote_description_set: false,
            buffered_candidates: Vec::new(),
            ice_restarts: 0,
        }
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    /// The local side started creating an offer.
    pub fn on_local_offer(&mut self) {
        self.making_offer = true;
        self.state = SignalingState::HaveLocalOffer;
    }

    /// The local offer was sent; negotiation idles until a reply.
    pub fn on_local_offer_sent(&mut self) {
        self.making_offer = false;
    }

    /// A remote offer arrived. On collision the impolite side ignores it and
    /// the polite side rolls back before applying.
    pub fn on_remote_offer(&mut self, sdp: String) -> Vec<NegotiationAction> {
        let collision = self.making_offer || self.state != SignalingState::Stable;
        if collision && !self.polite {
            debug!("offer collision, impolite side ignoring");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if collision {
            debug!("offer collision, polite side rolling back");
            actions.push(NegotiationAction::Rollback);
        }
        self.state = SignalingState::HaveRemoteOffer;
        self.remote_description_set = true;
        actions.push(NegotiationAction::ApplyRemoteOffer(sdp));
        actions.extend(self.drain_candidates());
        actions
    }

    /// A remote answer arrived. Only meaningful with a local offer in
    /// flight; anything else is a stray and is dropped.
    pub fn on_remote_answer(&mut self, sdp: String) -> Vec<NegotiationAction> {
        if self.state != SignalingState::HaveLocalOffer {
            debug!("stray answer dropped");
            return Vec::new();
        }
        self.state = SignalingState::Stable;
        self.remote_description_set = true;
        let mut actions = vec![NegotiationAction::ApplyRemoteAnswer(sdp)];
        actions.extend(self.drain_candidates());
        actions
    }

    /// The local side finished answering; the pair is stable again.
    pub fn on_answer_sent(&mut self) {
        self.state = SignalingState::Stable;
    }

    /// A remote ICE candidate: applied immediately once a remote description
    /// exists, buffered until then.
    pub fn on_remote_candidate(&mut self, candidate: Value) -> Vec<NegotiationAction> {
        if self.remote_description_set {
            vec![NegotiationAction::ApplyCandidate(candidate)]
        } else {
            self.buffered_candidates.push(candidate);
            Vec::new()
        }
    }

    /// The connection failed; restart ICE a bounded number of times.
    pub fn on_connection_failed(&mut self) -> NegotiationAction {
        self.ice_restarts += 1;
        if self.ice_restarts > MAX_ICE_RESTARTS {
            NegotiationAction::Abort
        } else {
            NegotiationAction::RestartIce
        }
    }

    fn drain_candidates(&mut self) -> Vec<NegotiationAction> {
        self.buffered_candidates
            .drain(..)
            .map(NegotiationAction::ApplyCandidate)
            .collect()
    }
}
