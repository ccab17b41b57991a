//! Proposer state machine.
//!
//! Drives one [`Proposal`] per SCN through Phase 1 and Phase 2, pipelining
//! up to `pipeline_depth` SCNs at once. Inputs are replies, learner events
//! and ticks; every call returns a [`ProposerOutput`] for the runtime to
//! act on. No I/O, no clocks: time arrives as an explicit `Instant`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use paxlog_types::{Ballot, PeerId, Scn, Value, ValueId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::group::PeerGroup;
use crate::instrumentation::METRICS;
use crate::message::{Accept, Decide, Message, MessagePayload, Prepare};
use crate::proposal::{AckOutcome, Proposal, PromiseOutcome, ProposalTable, RejectOutcome, RoundState};

/// Proposer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposerConfig {
    /// Maximum number of SCNs negotiated concurrently.
    pub pipeline_depth: usize,
    /// Time a round waits for replies before it is retried.
    pub round_timeout: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
    /// How long the apply position may stall below a learned SCN before
    /// the missing SCNs are filled with `Nop` rounds.
    pub gap_timeout: Duration,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 8,
            round_timeout: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            gap_timeout: Duration::from_secs(2),
        }
    }
}

/// What the runtime must do after feeding the proposer an input.
#[derive(Debug, Default)]
pub struct ProposerOutput {
    /// Messages to send. Broadcasts include the local peer.
    pub messages: Vec<Message>,
    /// Our values that were bound to a SCN and applied locally.
    pub bound: Vec<(ValueId, Scn)>,
    /// Values this proposer saw chosen by its own rounds.
    pub chosen: Vec<(Scn, Value)>,
}

impl ProposerOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.bound.is_empty() && self.chosen.is_empty()
    }

    pub fn merge(&mut self, other: ProposerOutput) {
        self.messages.extend(other.messages);
        self.bound.extend(other.bound);
        self.chosen.extend(other.chosen);
    }
}

/// Retry delay for a round that already ran `attempt` times:
/// `round_timeout * 2^attempt`, capped, plus up to half of that as jitter.
fn retry_delay(config: &ProposerConfig, rng: &mut SmallRng, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    let base = config
        .round_timeout
        .saturating_mul(factor)
        .min(config.max_backoff);
    let half = base.as_millis() as u64 / 2;
    let jitter = if half == 0 { 0 } else { rng.gen_range(0..=half) };
    base + Duration::from_millis(jitter)
}

// ============================================================================
// Proposer Core
// ============================================================================

#[derive(Debug)]
pub struct ProposerCore {
    group: PeerGroup,
    config: ProposerConfig,
    table: ProposalTable,
    /// Next SCN handed to a fresh value.
    next_scn: Scn,
    /// Local apply position.
    applied: Scn,
    /// SCNs above `applied` whose value is known.
    learned: BTreeSet<Scn>,
    /// Highest ballot observed anywhere, ours included.
    highest_ballot: Ballot,
    /// Own values displaced from their SCN, keyed by the SCN they lost
    /// plus an arrival sequence. Lower SCNs were claimed first, so popping
    /// the lowest key keeps FIFO.
    requeued: BTreeMap<(Scn, u64), Value>,
    requeue_seq: u64,
    /// Last time the apply position advanced.
    last_progress: Instant,
    rng: SmallRng,
}

impl ProposerCore {
    /// Creates a proposer resuming after `applied`.
    pub fn new(
        group: PeerGroup,
        config: ProposerConfig,
        applied: Scn,
        seed: u64,
        now: Instant,
    ) -> Self {
        let table = ProposalTable::new(config.pipeline_depth);
        METRICS.set_next_scn(applied.next().as_u64());
        Self {
            group,
            config,
            table,
            next_scn: applied.next(),
            applied,
            learned: BTreeSet::new(),
            highest_ballot: Ballot::ZERO,
            requeued: BTreeMap::new(),
            requeue_seq: 0,
            last_progress: now,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn local(&self) -> PeerId {
        self.group.local()
    }

    pub fn group(&self) -> &PeerGroup {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut PeerGroup {
        &mut self.group
    }

    pub fn table(&self) -> &ProposalTable {
        &self.table
    }

    pub fn next_scn(&self) -> Scn {
        self.next_scn
    }

    pub fn applied(&self) -> Scn {
        self.applied
    }

    /// Returns true while the pipeline has room for another SCN.
    pub fn can_open(&self) -> bool {
        !self.table.is_full()
    }

    /// Takes the oldest displaced value, which must be proposed before any
    /// newly submitted one.
    pub fn pop_requeued(&mut self) -> Option<Value> {
        self.requeued.pop_first().map(|(_, v)| v)
    }

    pub fn requeued_len(&self) -> usize {
        self.requeued.len()
    }

    /// Opens a round binding `value` to the next free SCN.
    ///
    /// If the pipeline is full the value is parked with the displaced ones.
    pub fn propose(&mut self, value: Value, now: Instant) -> ProposerOutput {
        let mut out = ProposerOutput::default();
        if !self.can_open() {
            // Behind every value that already holds a SCN.
            self.requeue(Scn::new(u64::MAX), value);
            return out;
        }
        let scn = self.claim_scn();
        self.open_round(scn, value, now, false, &mut out);
        out
    }

    fn requeue(&mut self, lost: Scn, value: Value) {
        self.requeue_seq += 1;
        self.requeued.insert((lost, self.requeue_seq), value);
    }

    fn claim_scn(&mut self) -> Scn {
        let mut scn = self.next_scn;
        while self.table.contains(scn) || self.learned.contains(&scn) {
            scn = scn.next();
        }
        self.next_scn = scn.next();
        METRICS.set_next_scn(self.next_scn.as_u64());
        scn
    }

    fn open_round(
        &mut self,
        scn: Scn,
        candidate: Value,
        now: Instant,
        gap_fill: bool,
        out: &mut ProposerOutput,
    ) {
        let local = self.local();
        let ballot = Ballot::above(self.highest_ballot, local);
        self.highest_ballot = ballot;

        let proposal = Proposal::new(scn, ballot, candidate, now + self.config.round_timeout);
        let inserted = if gap_fill {
            self.table.insert_unbounded(proposal)
        } else {
            self.table.insert(proposal)
        };
        if inserted.is_err() {
            warn!(scn = %scn, "proposal slot unexpectedly taken");
            return;
        }

        METRICS.increment_rounds_opened();
        METRICS.set_proposals_in_flight(self.table.len() as u64);
        debug!(scn = %scn, ballot = %ballot, gap_fill, "round opened");
        out.messages.push(Message::broadcast(
            local,
            MessagePayload::Prepare(Prepare::new(scn, ballot)),
        ));
    }

    fn observe_ballot(&mut self, ballot: Ballot) {
        self.highest_ballot = self.highest_ballot.max(ballot);
    }

    // ========================================================================
    // Replies
    // ========================================================================

    /// Handles a `Promise`, `Reject` or `AcceptAck` addressed to us.
    ///
    /// Replies from peers outside the group are dropped and never count
    /// towards a quorum.
    pub fn on_reply(&mut self, msg: Message, now: Instant) -> ProposerOutput {
        let mut out = ProposerOutput::default();
        let from = msg.from;
        if !self.group.contains(from) {
            debug!(kind = msg.payload.name(), from = %from, "reply from non-member ignored");
            return out;
        }
        let local = self.local();
        let quorum = self.group.quorum_size();

        match msg.payload {
            MessagePayload::Promise(promise) => {
                METRICS.increment_promises_received();
                if let Some((b, _)) = &promise.accepted {
                    self.observe_ballot(*b);
                }
                let Some(prop) = self.table.get_mut(promise.scn) else {
                    return out;
                };
                let outcome = prop.on_promise(from, promise.ballot, promise.accepted, quorum);
                if let PromiseOutcome::Quorum(value) = outcome {
                    prop.set_deadline(now + self.config.round_timeout);
                    debug!(scn = %promise.scn, ballot = %promise.ballot, value = %value, "promise quorum");
                    out.messages.push(Message::broadcast(
                        local,
                        MessagePayload::Accept(Accept::new(promise.scn, promise.ballot, value)),
                    ));
                }
            }
            MessagePayload::AcceptAck(ack) => {
                METRICS.increment_acks_received();
                let Some(prop) = self.table.get_mut(ack.scn) else {
                    return out;
                };
                if let AckOutcome::Chosen(value) = prop.on_accept_ack(from, ack.ballot, quorum) {
                    prop.set_deadline(now + self.config.round_timeout);
                    METRICS.increment_rounds_decided();
                    info!(scn = %ack.scn, ballot = %ack.ballot, value = %value, "value chosen");
                    self.group.observe_leader(local);
                    out.messages.push(Message::broadcast(
                        local,
                        MessagePayload::Decide(Decide::new(ack.scn, value.clone())),
                    ));
                    out.chosen.push((ack.scn, value));
                }
            }
            MessagePayload::Reject(reject) => {
                METRICS.increment_rejects_received();
                self.observe_ballot(reject.promised);
                let Some(prop) = self.table.get_mut(reject.scn) else {
                    return out;
                };
                if let RejectOutcome::Superseded { by } =
                    prop.on_reject(from, reject.ballot, reject.promised)
                {
                    let delay = retry_delay(&self.config, &mut self.rng, prop.attempt());
                    prop.set_deadline(now + delay);
                    METRICS.increment_rounds_superseded();
                    debug!(
                        scn = %reject.scn,
                        ballot = %reject.ballot,
                        by = %by,
                        retry_in_ms = delay.as_millis() as u64,
                        "round superseded"
                    );
                }
            }
            other => {
                debug!(kind = other.name(), from = %from, "proposer ignoring non-reply");
            }
        }
        out
    }

    // ========================================================================
    // Learner events
    // ========================================================================

    /// Records that `value` is decided for `scn`.
    ///
    /// `decided_by` names the peer that broadcast the decision, when known.
    pub fn on_learned(&mut self, scn: Scn, value: &Value, decided_by: Option<PeerId>) {
        if scn <= self.applied {
            return;
        }
        self.learned.insert(scn);
        if scn >= self.next_scn {
            self.next_scn = scn.next();
            METRICS.set_next_scn(self.next_scn.as_u64());
        }
        if let Some(leader) = decided_by {
            self.group.observe_leader(leader);
        }
        let displaced = self
            .table
            .get_mut(scn)
            .and_then(|prop| prop.learn(value.clone()));
        if let Some(displaced) = displaced {
            METRICS.increment_values_requeued();
            debug!(scn = %scn, value = %displaced, "own value displaced, requeued");
            self.requeue(scn, displaced);
        }
    }

    /// Records that the local apply position reached `scn`, reaping every
    /// proposal at or below it.
    pub fn on_applied(&mut self, scn: Scn, now: Instant) -> ProposerOutput {
        let mut out = ProposerOutput::default();
        if scn <= self.applied {
            return out;
        }
        self.applied = scn;
        self.last_progress = now;
        self.learned = self.learned.split_off(&scn.next());
        if self.next_scn <= scn {
            self.next_scn = scn.next();
            METRICS.set_next_scn(self.next_scn.as_u64());
        }
        let reaped = self.table.reap_through(scn);
        self.settle(reaped, &mut out);
        out
    }

    /// Overrides the SCN counter, as if everything through `scn` had been
    /// applied. Open proposals at or below `scn` are dropped and their
    /// values requeued.
    pub fn set_scn(&mut self, scn: Scn, now: Instant) -> ProposerOutput {
        let mut out = ProposerOutput::default();
        info!(scn = %scn, previous = %self.applied, "scn override");
        self.applied = scn;
        self.next_scn = scn.next();
        self.last_progress = now;
        self.learned = self.learned.split_off(&scn.next());
        METRICS.set_next_scn(self.next_scn.as_u64());
        let reaped = self.table.reap_through(scn);
        self.settle(reaped, &mut out);
        out
    }

    fn settle(&mut self, reaped: Vec<Proposal>, out: &mut ProposerOutput) {
        for mut prop in reaped {
            let settled = prop.state().is_settled();
            prop.mark_decided();
            let Some(own) = prop.candidate().id() else {
                continue;
            };
            if settled && prop.value().and_then(Value::id) == Some(own) {
                debug!(scn = %prop.scn(), id = %own, "own value applied");
                out.bound.push((own, prop.scn()));
            } else {
                METRICS.increment_values_requeued();
                self.requeue(prop.scn(), prop.candidate().clone());
            }
        }
        METRICS.set_proposals_in_flight(self.table.len() as u64);
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Retries expired rounds, repeats unlearned decisions and fills
    /// stalled gaps.
    pub fn on_tick(&mut self, now: Instant) -> ProposerOutput {
        let mut out = ProposerOutput::default();
        self.redecide(now, &mut out);

        let expired: Vec<Scn> = self
            .table
            .iter()
            .filter(|p| !p.state().is_settled() && p.deadline() <= now)
            .map(Proposal::scn)
            .collect();
        for scn in expired {
            self.retry(scn, now, &mut out);
        }

        self.fill_gaps(now, &mut out);
        out
    }

    fn retry(&mut self, scn: Scn, now: Instant, out: &mut ProposerOutput) {
        let local = self.local();
        let highest = self.highest_ballot;
        let Some(prop) = self.table.get_mut(scn) else {
            return;
        };
        if prop.state() != RoundState::Superseded {
            METRICS.increment_rounds_timed_out();
            warn!(
                scn = %scn,
                ballot = %prop.ballot(),
                promises = prop.promises(),
                acks = prop.acks(),
                reachable = self.group.reachable(),
                "round timed out"
            );
        }
        let ballot = Ballot::above(highest.max(prop.highest_seen()), local);
        let delay = retry_delay(&self.config, &mut self.rng, prop.attempt() + 1);
        prop.restart(ballot, now + delay);
        self.highest_ballot = ballot;

        METRICS.increment_rounds_retried();
        debug!(scn = %scn, ballot = %ballot, attempt = prop.attempt(), "round retried");
        out.messages.push(Message::broadcast(
            local,
            MessagePayload::Prepare(Prepare::new(scn, ballot)),
        ));
    }

    // A round chosen here stays in the table until applied. If its Decide
    // never reached the local learner, it is broadcast again every
    // `round_timeout` until the SCN is learned.
    fn redecide(&mut self, now: Instant, out: &mut ProposerOutput) {
        let local = self.local();
        let next_deadline = now + self.config.round_timeout;
        for prop in self.table.iter_mut() {
            if prop.state() != RoundState::Accepted
                || prop.deadline() > now
                || self.learned.contains(&prop.scn())
            {
                continue;
            }
            let Some(value) = prop.value().cloned() else {
                continue;
            };
            prop.set_deadline(next_deadline);
            METRICS.increment_decides_resent();
            debug!(scn = %prop.scn(), value = %value, "decision not learned yet, resending");
            out.messages.push(Message::broadcast(
                local,
                MessagePayload::Decide(Decide::new(prop.scn(), value)),
            ));
        }
    }

    fn fill_gaps(&mut self, now: Instant, out: &mut ProposerOutput) {
        let first_missing = self.applied.next();
        let Some(&highest) = self.learned.last() else {
            return;
        };
        if self.learned.contains(&first_missing) {
            return;
        }
        if now.saturating_duration_since(self.last_progress) < self.config.gap_timeout {
            return;
        }

        let mut opened = 0;
        let mut scn = first_missing;
        while scn < highest && opened < self.table.depth() {
            if !self.learned.contains(&scn) && !self.table.contains(scn) {
                METRICS.increment_gap_fills();
                warn!(scn = %scn, applied = %self.applied, learned = %highest, "filling gap");
                self.open_round(scn, Value::Nop, now, true, out);
                opened += 1;
            }
            scn = scn.next();
        }
        self.last_progress = now;
    }
}
