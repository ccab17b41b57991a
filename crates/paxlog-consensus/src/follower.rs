//! Acceptor and learner state machine.
//!
//! Every peer runs one follower, the local one included. It answers
//! `Prepare` and `Accept` from any proposer, learns `Decide`s, and hands
//! decided values to the [`Recovery`](crate::recovery::Recovery) base
//! strictly in SCN order.
//!
//! Acceptor state changes are written to the
//! [`AcceptorLog`](crate::recovery::AcceptorLog) before the reply is
//! produced; a storage failure aborts the call with no reply.

use std::collections::BTreeMap;

use paxlog_types::{Ballot, PeerId, Scn, Value};
use tracing::{debug, error, info};

use crate::instrumentation::METRICS;
use crate::message::{Accept, AcceptAck, Decide, Message, MessagePayload, Prepare, Promise, Reject};
use crate::recovery::{AcceptorSlot, RecoveryBase, RecoveryError};

/// A SCN whose value became known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Learned {
    pub scn: Scn,
    pub value: Value,
    /// The peer that broadcast the decision; `None` for catch-up replies.
    pub decided_by: Option<PeerId>,
}

/// What the runtime must do after feeding the follower a message.
#[derive(Debug, Default)]
pub struct FollowerOutput {
    /// Replies to send.
    pub messages: Vec<Message>,
    /// Newly learned SCNs, for the proposer.
    pub learned: Vec<Learned>,
    /// Values applied by this call, in SCN order.
    pub applied: Vec<(Scn, Value)>,
}

impl FollowerOutput {
    /// Highest SCN applied by this call.
    pub fn applied_through(&self) -> Option<Scn> {
        self.applied.last().map(|(scn, _)| *scn)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.learned.is_empty() && self.applied.is_empty()
    }
}

#[derive(Debug)]
pub struct FollowerCore {
    local: PeerId,
    applied: Scn,
    /// Acceptor slots above `applied`, mirrored from the acceptor log.
    slots: BTreeMap<Scn, AcceptorSlot>,
    /// Decided values waiting for their predecessors to apply.
    decided: BTreeMap<Scn, Value>,
}

impl FollowerCore {
    /// Creates a follower resuming after `applied`.
    pub fn new(local: PeerId, applied: Scn) -> Self {
        METRICS.set_last_applied_scn(applied.as_u64());
        Self {
            local,
            applied,
            slots: BTreeMap::new(),
            decided: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn applied(&self) -> Scn {
        self.applied
    }

    /// Number of decided values buffered behind a gap.
    pub fn buffered(&self) -> usize {
        self.decided.len()
    }

    /// Handles a `Prepare`, `Accept` or `Decide`.
    pub fn on_message<R: RecoveryBase + ?Sized>(
        &mut self,
        recovery: &mut R,
        msg: Message,
    ) -> Result<FollowerOutput, RecoveryError> {
        let mut out = FollowerOutput::default();
        let from = msg.from;
        let broadcast = msg.is_broadcast();
        match msg.payload {
            MessagePayload::Prepare(prepare) => self.on_prepare(recovery, from, prepare, &mut out)?,
            MessagePayload::Accept(accept) => self.on_accept(recovery, from, accept, &mut out)?,
            MessagePayload::Decide(decide) => {
                let decided_by = broadcast.then_some(from);
                self.on_decide(recovery, decide, decided_by, &mut out)?;
            }
            other => {
                debug!(kind = other.name(), from = %from, "follower ignoring reply");
            }
        }
        Ok(out)
    }

    /// Overrides the apply position; buffered decisions and acceptor slots
    /// at or below `scn` are dropped.
    ///
    /// The recovery base is moved first, so the next value it is handed is
    /// the one for `scn.next()`.
    pub fn set_scn<R: RecoveryBase + ?Sized>(
        &mut self,
        recovery: &mut R,
        scn: Scn,
    ) -> Result<FollowerOutput, RecoveryError> {
        let mut out = FollowerOutput::default();
        let base = recovery.last_applied_scn();
        if base != scn {
            info!(scn = %scn, previous = %base, "rebasing recovery");
            recovery.set_scn(scn)?;
        }
        info!(scn = %scn, previous = %self.applied, "follower scn override");
        self.applied = scn;
        self.decided = self.decided.split_off(&scn.next());
        self.slots = self.slots.split_off(&scn.next());
        recovery.prune_through(scn)?;
        METRICS.set_last_applied_scn(scn.as_u64());
        self.apply_ready(recovery, &mut out)?;
        Ok(out)
    }

    // ========================================================================
    // Acceptor
    // ========================================================================

    fn on_prepare<R: RecoveryBase + ?Sized>(
        &mut self,
        recovery: &mut R,
        from: PeerId,
        prepare: Prepare,
        out: &mut FollowerOutput,
    ) -> Result<(), RecoveryError> {
        let Prepare { scn, ballot } = prepare;
        if self.is_known(scn) {
            self.reply_decided(recovery, from, scn, out);
            return Ok(());
        }

        let mut slot = self.slot(recovery, scn)?;
        if ballot > slot.promised {
            slot.promised = ballot;
            self.persist(recovery, scn, slot.clone())?;
            METRICS.increment_promises_sent();
            debug!(scn = %scn, ballot = %ballot, to = %from, "promised");
            out.messages.push(Message::targeted(
                self.local,
                from,
                MessagePayload::Promise(Promise::new(scn, ballot, slot.accepted)),
            ));
        } else {
            self.reject(from, scn, ballot, slot.promised, out);
        }
        Ok(())
    }

    fn on_accept<R: RecoveryBase + ?Sized>(
        &mut self,
        recovery: &mut R,
        from: PeerId,
        accept: Accept,
        out: &mut FollowerOutput,
    ) -> Result<(), RecoveryError> {
        let Accept { scn, ballot, value } = accept;
        if self.is_known(scn) {
            self.reply_decided(recovery, from, scn, out);
            return Ok(());
        }

        let mut slot = self.slot(recovery, scn)?;
        let held = slot
            .accepted
            .as_ref()
            .filter(|(b, _)| *b == ballot)
            .map(|(_, v)| v.clone());
        match held {
            Some(v) if v == value => {
                // Retransmission: acknowledge again, nothing to persist.
                self.ack(from, scn, ballot, out);
            }
            Some(v) => {
                error!(
                    scn = %scn,
                    ballot = %ballot,
                    held = %v,
                    offered = %value,
                    "two values proposed under one ballot"
                );
                self.reject(from, scn, ballot, slot.promised, out);
            }
            None if ballot == slot.promised => {
                slot.accepted = Some((ballot, value));
                self.persist(recovery, scn, slot)?;
                self.ack(from, scn, ballot, out);
            }
            None => self.reject(from, scn, ballot, slot.promised, out),
        }
        Ok(())
    }

    fn ack(&self, to: PeerId, scn: Scn, ballot: Ballot, out: &mut FollowerOutput) {
        METRICS.increment_accepts_sent();
        debug!(scn = %scn, ballot = %ballot, to = %to, "accepted");
        out.messages.push(Message::targeted(
            self.local,
            to,
            MessagePayload::AcceptAck(AcceptAck::new(scn, ballot)),
        ));
    }

    fn reject(
        &self,
        to: PeerId,
        scn: Scn,
        ballot: Ballot,
        promised: Ballot,
        out: &mut FollowerOutput,
    ) {
        METRICS.increment_rejects_sent();
        debug!(scn = %scn, ballot = %ballot, promised = %promised, to = %to, "rejected");
        out.messages.push(Message::targeted(
            self.local,
            to,
            MessagePayload::Reject(Reject::new(scn, ballot, promised)),
        ));
    }

    /// Returns true if the value for `scn` is already known locally.
    fn is_known(&self, scn: Scn) -> bool {
        scn <= self.applied || self.decided.contains_key(&scn)
    }

    /// Answers a round for a SCN whose outcome is already known.
    fn reply_decided<R: RecoveryBase + ?Sized>(
        &self,
        recovery: &R,
        to: PeerId,
        scn: Scn,
        out: &mut FollowerOutput,
    ) {
        let value = self
            .decided
            .get(&scn)
            .cloned()
            .or_else(|| recovery.decided_value(scn));
        match value {
            Some(value) => {
                debug!(scn = %scn, to = %to, "answering with decided value");
                out.messages.push(Message::targeted(
                    self.local,
                    to,
                    MessagePayload::Decide(Decide::new(scn, value)),
                ));
            }
            None => debug!(scn = %scn, to = %to, "decided value no longer retained"),
        }
    }

    fn slot<R: RecoveryBase + ?Sized>(
        &mut self,
        recovery: &R,
        scn: Scn,
    ) -> Result<AcceptorSlot, RecoveryError> {
        if let Some(slot) = self.slots.get(&scn) {
            return Ok(slot.clone());
        }
        let slot = recovery.load_slot(scn)?.unwrap_or_default();
        self.slots.insert(scn, slot.clone());
        Ok(slot)
    }

    fn persist<R: RecoveryBase + ?Sized>(
        &mut self,
        recovery: &mut R,
        scn: Scn,
        slot: AcceptorSlot,
    ) -> Result<(), RecoveryError> {
        recovery.store_slot(scn, &slot)?;
        self.slots.insert(scn, slot);
        Ok(())
    }

    // ========================================================================
    // Learner
    // ========================================================================

    fn on_decide<R: RecoveryBase + ?Sized>(
        &mut self,
        recovery: &mut R,
        decide: Decide,
        decided_by: Option<PeerId>,
        out: &mut FollowerOutput,
    ) -> Result<(), RecoveryError> {
        let Decide { scn, value } = decide;

        if scn <= self.applied {
            if let Some(existing) = recovery.decided_value(scn) {
                if existing != value {
                    METRICS.increment_conflicting_decides();
                    error!(scn = %scn, applied = %existing, offered = %value, "conflicting decision for applied scn");
                }
            }
            return Ok(());
        }

        match self.decided.get(&scn) {
            Some(existing) if *existing != value => {
                METRICS.increment_conflicting_decides();
                error!(scn = %scn, held = %existing, offered = %value, "conflicting decision");
                return Ok(());
            }
            Some(_) => return Ok(()),
            None => {}
        }

        debug!(scn = %scn, value = %value, "learned");
        self.decided.insert(scn, value.clone());
        out.learned.push(Learned {
            scn,
            value,
            decided_by,
        });
        self.apply_ready(recovery, out)
    }

    /// Applies every buffered value that directly follows `applied`.
    fn apply_ready<R: RecoveryBase + ?Sized>(
        &mut self,
        recovery: &mut R,
        out: &mut FollowerOutput,
    ) -> Result<(), RecoveryError> {
        let start = self.applied;
        loop {
            let scn = self.applied.next();
            let Some(value) = self.decided.remove(&scn) else {
                break;
            };
            if let Err(e) = recovery.apply_decided(scn, &value) {
                error!(scn = %scn, error = %e, "apply failed");
                self.decided.insert(scn, value);
                return Err(e);
            }
            self.applied = scn;
            METRICS.increment_values_applied();
            out.applied.push((scn, value));
        }

        if self.applied > start {
            self.slots = self.slots.split_off(&self.applied.next());
            recovery.prune_through(self.applied)?;
            METRICS.set_last_applied_scn(self.applied.as_u64());
            debug!(from = %start, through = %self.applied, "applied");
        }
        Ok(())
    }
}
