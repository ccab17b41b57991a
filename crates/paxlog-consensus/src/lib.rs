//! # paxlog-consensus: Multi-Paxos state machines
//!
//! This crate is the I/O-free core of paxlog. It decides which value is
//! bound to each sequence number (SCN) across a group of peers, tolerating
//! the loss of any minority.
//!
//! ## Architecture
//!
//! Both halves follow a functional core / imperative shell split:
//!
//! - [`ProposerCore`] opens rounds, counts votes, retries on timeout or
//!   preemption and fills stalled gaps with `Nop` rounds. It consumes
//!   replies and learner events and returns a [`ProposerOutput`].
//! - [`FollowerCore`] is the acceptor and learner. It answers `Prepare`
//!   and `Accept`, persists promises through an [`AcceptorLog`] before
//!   replying, and applies decided values in SCN order through a
//!   [`Recovery`] base. It returns a [`FollowerOutput`].
//!
//! The runtime in `paxlog-node` moves messages between peers, owns the
//! timers and queues, and feeds these state machines.
//!
//! ## Safety
//!
//! At most one value is ever chosen per SCN:
//! - an acceptor only promises ballots above every ballot it promised;
//! - it only accepts at the ballot it promised;
//! - a proposer that reaches a promise quorum must adopt the value accepted
//!   at the highest ballot among the quorum.
//!
//! Ballots are `(counter, peer)` pairs, so two proposers can never hold
//! the same ballot.

pub mod error;
pub mod follower;
pub mod group;
pub mod instrumentation;
pub mod message;
pub mod proposal;
pub mod proposer;
pub mod recovery;

#[cfg(test)]
mod tests;

pub use error::{ConsensusError, Result};
pub use follower::{FollowerCore, FollowerOutput, Learned};
pub use group::{GroupStatus, LinkState, Peer, PeerGroup, PeerRole};
pub use message::{Accept, AcceptAck, Decide, Message, MessagePayload, Prepare, Promise, Reject};
pub use proposal::{Proposal, ProposalTable, RoundState, Vote};
pub use proposer::{ProposerConfig, ProposerCore, ProposerOutput};
pub use recovery::{AcceptorLog, AcceptorSlot, MemoryRecovery, Recovery, RecoveryBase, RecoveryError};
