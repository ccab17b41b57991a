//! # paxlog-types: Core types for `paxlog`
//!
//! This crate contains the small value types shared by every layer of the
//! engine:
//! - Sequence numbers ([`Scn`])
//! - Group membership ([`PeerId`])
//! - Round arbitration ([`Ballot`])
//! - Proposed payloads ([`Value`], [`ValueId`])
//! - Frame and record checksums ([`crc32()`])

pub mod crc32;

pub use crc32::crc32;

use std::fmt::{Debug, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Sequence Number - Copy (cheap 8-byte value)
// ============================================================================

/// Position of a decided value in the global total order.
///
/// SCNs are assigned densely: every SCN from 1 upward is eventually bound
/// to exactly one [`Value`]. `Scn::ZERO` is the "nothing applied yet"
/// position, so the first negotiable SCN is always `Scn::ZERO.next()`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Scn(u64);

impl Scn {
    pub const ZERO: Scn = Scn(0);

    pub const fn new(scn: u64) -> Self {
        Self(scn)
    }

    /// Returns the SCN as a `u64`.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next SCN.
    ///
    /// # Panics
    ///
    /// Panics on overflow, which would take longer than the age of the
    /// universe at any realistic commit rate.
    pub fn next(self) -> Self {
        Self(self.0.checked_add(1).expect("scn overflow"))
    }

    /// Returns the number of SCNs in `(self, other]`, or zero if `other`
    /// is not ahead of `self`.
    pub fn distance_to(self, other: Scn) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl Display for Scn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Scn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Scn> for u64 {
    fn from(scn: Scn) -> Self {
        scn.0
    }
}

// ============================================================================
// Peer Identity
// ============================================================================

/// Group-relative index of a peer.
///
/// Peer indexes double as the ballot tie-breaker, so two peers in one
/// group must never share an index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PeerId(u8);

impl PeerId {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

impl From<u8> for PeerId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

// ============================================================================
// Ballot
// ============================================================================

/// A strictly ordered tag arbitrating between competing rounds for a SCN.
///
/// Ballots compare by `counter` first and by `peer` second. Two proposers
/// that pick the same counter are therefore ordered by peer index, and the
/// lower index loses. Field order matters: the derived `Ord` relies on it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Ballot {
    counter: u64,
    peer: PeerId,
}

impl Ballot {
    /// The ballot nobody can hold: "nothing promised yet".
    pub const ZERO: Ballot = Ballot {
        counter: 0,
        peer: PeerId(0),
    };

    pub const fn new(counter: u64, peer: PeerId) -> Self {
        Self { counter, peer }
    }

    /// Returns the smallest ballot owned by `peer` that is strictly greater
    /// than `observed`.
    ///
    /// A peer whose index is above `observed.peer` could win with the same
    /// counter, but always bumping keeps retries monotone per proposer.
    pub fn above(observed: Ballot, peer: PeerId) -> Self {
        Self {
            counter: observed.counter.saturating_add(1),
            peer,
        }
    }

    pub const fn counter(self) -> u64 {
        self.counter
    }

    pub const fn peer(self) -> PeerId {
        self.peer
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.counter, self.peer.0)
    }
}

// ============================================================================
// Values
// ============================================================================

/// Identity of a submitted value: the submitting peer plus a random nonce.
///
/// Lets a proposer tell whether the value learned for a SCN is the one it
/// proposed without comparing payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId {
    pub origin: PeerId,
    pub nonce: u64,
}

impl ValueId {
    pub const fn new(origin: PeerId, nonce: u64) -> Self {
        Self { origin, nonce }
    }
}

impl Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:016x}", self.origin.0, self.nonce)
    }
}

/// A value bound (or to be bound) to a SCN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Filler decided for a SCN nobody proposed a value for.
    Nop,
    /// An application payload.
    Data { id: ValueId, bytes: Bytes },
}

impl Value {
    pub fn data(id: ValueId, bytes: impl Into<Bytes>) -> Self {
        Self::Data {
            id,
            bytes: bytes.into(),
        }
    }

    pub fn is_nop(&self) -> bool {
        matches!(self, Self::Nop)
    }

    /// Returns the identity of a data value.
    pub fn id(&self) -> Option<ValueId> {
        match self {
            Self::Nop => None,
            Self::Data { id, .. } => Some(*id),
        }
    }

    /// Returns the payload, empty for [`Value::Nop`].
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Nop => &[],
            Self::Data { bytes, .. } => bytes,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nop => write!(f, "nop"),
            Self::Data { id, bytes } => write!(f, "data[{id}; {} bytes]", bytes.len()),
        }
    }
}
