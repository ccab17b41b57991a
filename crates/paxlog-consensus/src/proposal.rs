//! Per-SCN proposal rounds and the bounded table that holds them.
//!
//! A [`Proposal`] is a small state machine driven by replies:
//!
//! ```text
//!            quorum of Promise          quorum of AcceptAck       local apply
//! Opened ──────────────────────▶ Promised ──────────────────▶ Accepted ─────────▶ Decided
//!   │  ▲                            │
//!   │  └──── retry (higher ballot) ─┤
//!   ▼                               ▼
//! Superseded ◀──── Reject with a higher promised ballot
//! ```
//!
//! Learning the SCN's value from anyone (`learn`) jumps straight to
//! `Accepted`: the outcome is known, no further rounds are needed.

use std::collections::BTreeMap;
use std::time::Instant;

use paxlog_types::{Ballot, PeerId, Scn, Value};

/// Where a proposal stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundState {
    /// `Prepare` sent, collecting promises.
    Opened,
    /// Promise quorum reached, value fixed, `Accept` sent.
    Promised,
    /// The SCN's value is chosen; waiting for the local apply.
    Accepted,
    /// Applied locally. Ready to reap.
    Decided,
    /// Preempted by a higher ballot; waiting for the retry deadline.
    Superseded,
}

impl RoundState {
    /// Returns true once the SCN's outcome is known.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Accepted | Self::Decided)
    }
}

/// One peer's reply in the current round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    Promised { accepted: Option<(Ballot, Value)> },
    Acked,
    Rejected { promised: Ballot },
}

/// Result of feeding a `Promise` to a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseOutcome {
    /// Stale ballot, wrong state, or duplicate.
    Ignored,
    /// Recorded; quorum not yet reached.
    Pending,
    /// Quorum reached: send `Accept` for this value.
    Quorum(Value),
}

/// Result of feeding an `AcceptAck` to a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Ignored,
    Pending,
    /// Quorum reached: this value is chosen.
    Chosen(Value),
}

/// Result of feeding a `Reject` to a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    Ignored,
    /// The round lost to `by`.
    Superseded { by: Ballot },
}

// ============================================================================
// Proposal
// ============================================================================

/// An in-flight attempt to bind a value to one SCN.
#[derive(Debug, Clone)]
pub struct Proposal {
    scn: Scn,
    ballot: Ballot,
    state: RoundState,
    /// What we propose if no acceptor reports a previously accepted value.
    candidate: Value,
    /// The value fixed in phase 2, or learned for this SCN.
    value: Option<Value>,
    votes: BTreeMap<PeerId, Vote>,
    highest_seen: Ballot,
    attempt: u32,
    deadline: Instant,
}

impl Proposal {
    pub fn new(scn: Scn, ballot: Ballot, candidate: Value, deadline: Instant) -> Self {
        Self {
            scn,
            ballot,
            state: RoundState::Opened,
            candidate,
            value: None,
            votes: BTreeMap::new(),
            highest_seen: ballot,
            attempt: 0,
            deadline,
        }
    }

    pub fn scn(&self) -> Scn {
        self.scn
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn candidate(&self) -> &Value {
        &self.candidate
    }

    /// The value fixed for phase 2 or learned, if any.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Highest ballot observed for this SCN, ours included.
    pub fn highest_seen(&self) -> Ballot {
        self.highest_seen
    }

    /// Number of rounds started after the first.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = deadline;
    }

    pub fn vote(&self, peer: PeerId) -> Option<&Vote> {
        self.votes.get(&peer)
    }

    pub fn promises(&self) -> usize {
        self.votes
            .values()
            .filter(|v| matches!(v, Vote::Promised { .. }))
            .count()
    }

    pub fn acks(&self) -> usize {
        self.votes.values().filter(|v| **v == Vote::Acked).count()
    }

    /// Records a promise for the current ballot.
    pub fn on_promise(
        &mut self,
        from: PeerId,
        ballot: Ballot,
        accepted: Option<(Ballot, Value)>,
        quorum: usize,
    ) -> PromiseOutcome {
        if self.state != RoundState::Opened || ballot != self.ballot {
            return PromiseOutcome::Ignored;
        }
        if self.votes.contains_key(&from) {
            return PromiseOutcome::Ignored;
        }
        if let Some((b, _)) = &accepted {
            self.highest_seen = self.highest_seen.max(*b);
        }
        self.votes.insert(from, Vote::Promised { accepted });

        if self.promises() < quorum {
            return PromiseOutcome::Pending;
        }

        // Adopt the value accepted at the highest ballot among the quorum.
        let adopted = self
            .votes
            .values()
            .filter_map(|v| match v {
                Vote::Promised {
                    accepted: Some((b, value)),
                } => Some((*b, value)),
                _ => None,
            })
            .max_by_key(|(b, _)| *b)
            .map(|(_, value)| value.clone());
        let value = adopted.unwrap_or_else(|| self.candidate.clone());

        self.state = RoundState::Promised;
        self.value = Some(value.clone());
        PromiseOutcome::Quorum(value)
    }

    /// Records an acceptance of the current ballot.
    pub fn on_accept_ack(&mut self, from: PeerId, ballot: Ballot, quorum: usize) -> AckOutcome {
        if self.state != RoundState::Promised || ballot != self.ballot {
            return AckOutcome::Ignored;
        }
        if self.votes.get(&from) == Some(&Vote::Acked) {
            return AckOutcome::Ignored;
        }
        self.votes.insert(from, Vote::Acked);

        if self.acks() < quorum {
            return AckOutcome::Pending;
        }
        self.state = RoundState::Accepted;
        match &self.value {
            Some(value) => AckOutcome::Chosen(value.clone()),
            None => AckOutcome::Ignored,
        }
    }

    /// Records a rejection. Only a reject naming a ballot above ours
    /// preempts the round.
    pub fn on_reject(&mut self, from: PeerId, ballot: Ballot, promised: Ballot) -> RejectOutcome {
        if ballot != self.ballot || promised <= self.ballot {
            return RejectOutcome::Ignored;
        }
        self.highest_seen = self.highest_seen.max(promised);
        if !matches!(self.state, RoundState::Opened | RoundState::Promised) {
            return RejectOutcome::Ignored;
        }
        self.votes.insert(from, Vote::Rejected { promised });
        self.state = RoundState::Superseded;
        RejectOutcome::Superseded { by: promised }
    }

    /// Starts a fresh round at `ballot`, discarding all votes.
    pub fn restart(&mut self, ballot: Ballot, deadline: Instant) {
        debug_assert!(ballot > self.ballot, "retry ballot must increase");
        debug_assert!(!self.state.is_settled(), "settled proposals never retry");
        self.ballot = ballot;
        self.highest_seen = self.highest_seen.max(ballot);
        self.state = RoundState::Opened;
        self.value = None;
        self.votes.clear();
        self.attempt = self.attempt.saturating_add(1);
        self.deadline = deadline;
    }

    /// Records that `value` is the outcome for this SCN.
    ///
    /// Returns our own candidate if a different value won; the proposal
    /// keeps a `Nop` candidate afterwards so the loser is handed back once.
    pub fn learn(&mut self, value: Value) -> Option<Value> {
        if self.state != RoundState::Decided {
            self.state = RoundState::Accepted;
        }
        let lost = self.candidate.id().is_some() && self.candidate.id() != value.id();
        self.value = Some(value);
        lost.then(|| std::mem::replace(&mut self.candidate, Value::Nop))
    }

    pub fn mark_decided(&mut self) {
        self.state = RoundState::Decided;
    }
}

// ============================================================================
// Proposal Table
// ============================================================================

/// Proposals in flight, keyed by SCN, bounded by the pipeline depth.
#[derive(Debug, Clone)]
pub struct ProposalTable {
    depth: usize,
    proposals: BTreeMap<Scn, Proposal>,
}

impl ProposalTable {
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "pipeline depth must be positive");
        Self {
            depth,
            proposals: BTreeMap::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.proposals.len() >= self.depth
    }

    pub fn contains(&self, scn: Scn) -> bool {
        self.proposals.contains_key(&scn)
    }

    pub fn get(&self, scn: Scn) -> Option<&Proposal> {
        self.proposals.get(&scn)
    }

    pub fn get_mut(&mut self, scn: Scn) -> Option<&mut Proposal> {
        self.proposals.get_mut(&scn)
    }

    /// Inserts a proposal. Returns it back if the table is full or the SCN
    /// is already taken.
    pub fn insert(&mut self, proposal: Proposal) -> Result<(), Proposal> {
        if self.is_full() || self.contains(proposal.scn()) {
            return Err(proposal);
        }
        self.proposals.insert(proposal.scn(), proposal);
        Ok(())
    }

    /// Inserts a proposal even when the table is full.
    ///
    /// Only for gap-filling rounds: a full table of chosen-but-unapplied
    /// proposals must not block the round that unblocks them.
    pub fn insert_unbounded(&mut self, proposal: Proposal) -> Result<(), Proposal> {
        if self.contains(proposal.scn()) {
            return Err(proposal);
        }
        self.proposals.insert(proposal.scn(), proposal);
        Ok(())
    }

    pub fn remove(&mut self, scn: Scn) -> Option<Proposal> {
        self.proposals.remove(&scn)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proposal> {
        self.proposals.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Proposal> {
        self.proposals.values_mut()
    }

    /// Removes and returns every proposal at or below `scn`, lowest first.
    pub fn reap_through(&mut self, scn: Scn) -> Vec<Proposal> {
        let keep = self.proposals.split_off(&scn.next());
        let reaped = std::mem::replace(&mut self.proposals, keep);
        reaped.into_values().collect()
    }
}
