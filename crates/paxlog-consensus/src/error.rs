//! Error types for the consensus core.

use paxlog_types::PeerId;

/// Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors raised while building or reconfiguring a peer group.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsensusError {
    /// The group has no members.
    #[error("peer group is empty")]
    EmptyGroup,

    /// The local peer is not a member of the group.
    #[error("local peer {0} is not a member of the group")]
    LocalNotMember(PeerId),

    /// Two members share a peer index.
    #[error("duplicate peer {0}")]
    DuplicatePeer(PeerId),

    /// The peer is not a member of the group.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The local peer cannot be removed from its own group.
    #[error("cannot remove the local peer {0}")]
    RemoveLocal(PeerId),
}
