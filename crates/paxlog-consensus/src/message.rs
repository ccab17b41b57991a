//! Paxos protocol messages.
//!
//! ## Phase 1
//! - [`Prepare`] - Proposer → All: promise not to honor lower ballots
//! - [`Promise`] - Acceptor → Proposer: promised, plus anything already accepted
//! - [`Reject`] - Acceptor → Proposer: a higher ballot already holds this SCN
//!
//! ## Phase 2
//! - [`Accept`] - Proposer → All: accept this value at this ballot
//! - [`AcceptAck`] - Acceptor → Proposer: accepted
//!
//! ## Learning
//! - [`Decide`] - Proposer → All: this value is chosen for this SCN. Also sent
//!   by an acceptor in reply to a `Prepare` for a SCN it has already applied.

use paxlog_types::{Ballot, PeerId, Scn, Value};
use serde::{Deserialize, Serialize};

// ============================================================================
// Message Envelope
// ============================================================================

/// A protocol message with routing information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The peer that sent this message.
    pub from: PeerId,

    /// The intended recipient, `None` for broadcasts.
    ///
    /// Broadcasts include the sender itself: the local acceptor votes like
    /// any other.
    pub to: Option<PeerId>,

    pub payload: MessagePayload,
}

impl Message {
    pub fn targeted(from: PeerId, to: PeerId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: Some(to),
            payload,
        }
    }

    pub fn broadcast(from: PeerId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: None,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Returns true if `peer` should receive this message.
    pub fn is_for(&self, peer: PeerId) -> bool {
        self.to.is_none_or(|to| to == peer)
    }
}

/// Payload of a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    Prepare(Prepare),
    Promise(Promise),
    Reject(Reject),
    Accept(Accept),
    AcceptAck(AcceptAck),
    Decide(Decide),
}

impl MessagePayload {
    /// Returns the SCN this message is about.
    pub fn scn(&self) -> Scn {
        match self {
            Self::Prepare(m) => m.scn,
            Self::Promise(m) => m.scn,
            Self::Reject(m) => m.scn,
            Self::Accept(m) => m.scn,
            Self::AcceptAck(m) => m.scn,
            Self::Decide(m) => m.scn,
        }
    }

    /// Returns the ballot carried by the message, if any.
    pub fn ballot(&self) -> Option<Ballot> {
        match self {
            Self::Prepare(m) => Some(m.ballot),
            Self::Promise(m) => Some(m.ballot),
            Self::Reject(m) => Some(m.ballot),
            Self::Accept(m) => Some(m.ballot),
            Self::AcceptAck(m) => Some(m.ballot),
            Self::Decide(_) => None,
        }
    }

    /// Returns true for messages handled by the acceptor/learner side.
    ///
    /// The remaining kinds (`Promise`, `Reject`, `AcceptAck`) are replies
    /// consumed by the proposer that issued the round.
    pub fn is_for_follower(&self) -> bool {
        matches!(self, Self::Prepare(_) | Self::Accept(_) | Self::Decide(_))
    }

    /// Returns the message type name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prepare(_) => "Prepare",
            Self::Promise(_) => "Promise",
            Self::Reject(_) => "Reject",
            Self::Accept(_) => "Accept",
            Self::AcceptAck(_) => "AcceptAck",
            Self::Decide(_) => "Decide",
        }
    }
}

// ============================================================================
// Phase 1
// ============================================================================

/// Phase 1a: ask acceptors to promise `ballot` for `scn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub scn: Scn,
    pub ballot: Ballot,
}

impl Prepare {
    pub fn new(scn: Scn, ballot: Ballot) -> Self {
        Self { scn, ballot }
    }
}

/// Phase 1b: the acceptor promised `ballot`.
///
/// `accepted` carries the highest-ballot value the acceptor had already
/// accepted for the SCN. The proposer must adopt it if it is the highest
/// among the promise quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    pub scn: Scn,
    pub ballot: Ballot,
    pub accepted: Option<(Ballot, Value)>,
}

impl Promise {
    pub fn new(scn: Scn, ballot: Ballot, accepted: Option<(Ballot, Value)>) -> Self {
        Self {
            scn,
            ballot,
            accepted,
        }
    }
}

/// Negative reply to a `Prepare` or `Accept`.
///
/// `promised` is the ballot currently holding the acceptor's promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub scn: Scn,
    pub ballot: Ballot,
    pub promised: Ballot,
}

impl Reject {
    pub fn new(scn: Scn, ballot: Ballot, promised: Ballot) -> Self {
        Self {
            scn,
            ballot,
            promised,
        }
    }
}

// ============================================================================
// Phase 2
// ============================================================================

/// Phase 2a: accept `value` for `scn` at `ballot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub scn: Scn,
    pub ballot: Ballot,
    pub value: Value,
}

impl Accept {
    pub fn new(scn: Scn, ballot: Ballot, value: Value) -> Self {
        Self { scn, ballot, value }
    }
}

/// Phase 2b: the acceptor accepted the value proposed at `ballot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptAck {
    pub scn: Scn,
    pub ballot: Ballot,
}

impl AcceptAck {
    pub fn new(scn: Scn, ballot: Ballot) -> Self {
        Self { scn, ballot }
    }
}

// ============================================================================
// Learning
// ============================================================================

/// `value` is chosen for `scn`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decide {
    pub scn: Scn,
    pub value: Value,
}

impl Decide {
    pub fn new(scn: Scn, value: Value) -> Self {
        Self { scn, value }
    }
}
