//! Cluster-level tests for paxlog-consensus.
//!
//! Drives several proposer/follower pairs through an in-process network
//! that can drop, duplicate and reorder messages. Everything is seeded, so
//! a failing seed replays exactly.

#![allow(clippy::cast_sign_loss)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use paxlog_types::{Ballot, PeerId, Scn, Value, ValueId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    FollowerCore, MemoryRecovery, Message, MessagePayload, PeerGroup, ProposerConfig,
    ProposerCore, Recovery, RoundState,
};

// ============================================================================
// Simulation Harness
// ============================================================================

const TICK: Duration = Duration::from_millis(10);

fn sim_config() -> ProposerConfig {
    ProposerConfig {
        pipeline_depth: 4,
        round_timeout: Duration::from_millis(50),
        max_backoff: Duration::from_millis(400),
        gap_timeout: Duration::from_millis(200),
    }
}

struct Flight {
    to: PeerId,
    msg: Message,
}

struct SimNode {
    id: PeerId,
    proposer: ProposerCore,
    follower: FollowerCore,
    recovery: MemoryRecovery,
    up: bool,
    /// Values submitted locally but not yet handed to the proposer.
    pending: VecDeque<Value>,
    bound: Vec<(ValueId, Scn)>,
}

struct Sim {
    nodes: Vec<SimNode>,
    network: Vec<Flight>,
    rng: ChaCha8Rng,
    now: Instant,
    drop_rate: f64,
    dup_rate: f64,
    /// Every value any proposer saw chosen, for the safety check.
    chosen: HashMap<Scn, Value>,
    next_nonce: u64,
}

impl Sim {
    fn new(n: u8, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let now = Instant::now();
        let nodes = (0..n)
            .map(|i| {
                let id = PeerId::new(i);
                let recovery = MemoryRecovery::new();
                SimNode {
                    id,
                    proposer: ProposerCore::new(group(id, n), sim_config(), Scn::ZERO, rng.r#gen(), now),
                    follower: FollowerCore::new(id, Scn::ZERO),
                    recovery,
                    up: true,
                    pending: VecDeque::new(),
                    bound: Vec::new(),
                }
            })
            .collect();
        Self {
            nodes,
            network: Vec::new(),
            rng,
            now,
            drop_rate: 0.0,
            dup_rate: 0.0,
            chosen: HashMap::new(),
            next_nonce: 0,
        }
    }

    fn chaos(mut self, drop_rate: f64, dup_rate: f64) -> Self {
        self.drop_rate = drop_rate;
        self.dup_rate = dup_rate;
        self
    }

    fn heal(&mut self) {
        self.drop_rate = 0.0;
        self.dup_rate = 0.0;
    }

    fn submit(&mut self, node: u8) -> Value {
        self.next_nonce += 1;
        let id = ValueId::new(PeerId::new(node), self.next_nonce);
        let value = Value::data(id, self.next_nonce.to_le_bytes().to_vec());
        self.nodes[usize::from(node)].pending.push_back(value.clone());
        value
    }

    fn crash(&mut self, node: u8) {
        self.nodes[usize::from(node)].up = false;
    }

    /// Rebuilds the volatile state from the node's recovery base.
    fn restart(&mut self, node: u8) {
        let n = self.nodes.len() as u8;
        let seed = self.rng.r#gen();
        let now = self.now;
        let sim_node = &mut self.nodes[usize::from(node)];
        let applied = sim_node.recovery.last_applied_scn();
        sim_node.proposer = ProposerCore::new(group(sim_node.id, n), sim_config(), applied, seed, now);
        sim_node.follower = FollowerCore::new(sim_node.id, applied);
        sim_node.up = true;
    }

    fn send(&mut self, messages: Vec<Message>) {
        for msg in messages {
            match msg.to {
                Some(to) => self.network.push(Flight { to, msg }),
                None => {
                    for node in &self.nodes {
                        self.network.push(Flight {
                            to: node.id,
                            msg: msg.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Hands queued values to proposers with pipeline room.
    fn pump(&mut self) {
        let now = self.now;
        let mut outgoing = Vec::new();
        for node in self.nodes.iter_mut().filter(|n| n.up) {
            while node.proposer.can_open() {
                let Some(value) = node
                    .proposer
                    .pop_requeued()
                    .or_else(|| node.pending.pop_front())
                else {
                    break;
                };
                outgoing.extend(node.proposer.propose(value, now).messages);
            }
        }
        self.send(outgoing);
    }

    fn tick(&mut self) {
        self.now += TICK;
        let now = self.now;
        let mut outgoing = Vec::new();
        for node in self.nodes.iter_mut().filter(|n| n.up) {
            outgoing.extend(node.proposer.on_tick(now).messages);
        }
        self.send(outgoing);
    }

    fn deliver(&mut self, flight: Flight) {
        let node = &mut self.nodes[flight.to.as_usize()];
        if !node.up {
            return;
        }
        let now = self.now;
        let mut outgoing = Vec::new();
        let mut chosen = Vec::new();

        if flight.msg.payload.is_for_follower() {
            let out = node
                .follower
                .on_message(&mut node.recovery, flight.msg)
                .expect("memory recovery does not fail");
            for learned in &out.learned {
                node.proposer
                    .on_learned(learned.scn, &learned.value, learned.decided_by);
            }
            if let Some(scn) = out.applied_through() {
                let p = node.proposer.on_applied(scn, now);
                node.bound.extend(p.bound);
                outgoing.extend(p.messages);
            }
            outgoing.extend(out.messages);
        } else {
            let out = node.proposer.on_reply(flight.msg, now);
            node.bound.extend(out.bound);
            chosen = out.chosen;
            outgoing.extend(out.messages);
        }

        for (scn, value) in chosen {
            if let Some(prev) = self.chosen.insert(scn, value.clone()) {
                assert_eq!(prev, value, "two values chosen for scn {scn}");
            }
        }
        self.send(outgoing);
    }

    fn step(&mut self) {
        self.pump();
        if self.network.is_empty() || self.rng.gen_ratio(1, 25) {
            self.tick();
            return;
        }
        let i = self.rng.gen_range(0..self.network.len());
        let flight = self.network.swap_remove(i);
        let loopback = flight.msg.from == flight.to;
        if !loopback && self.rng.gen_bool(self.drop_rate) {
            return;
        }
        if !loopback && self.rng.gen_bool(self.dup_rate) {
            self.network.push(Flight {
                to: flight.to,
                msg: flight.msg.clone(),
            });
        }
        self.deliver(flight);
    }

    fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Runs until `done` holds, panicking after `max_steps`.
    fn run_until(&mut self, max_steps: usize, done: impl Fn(&Sim) -> bool) {
        for _ in 0..max_steps {
            if done(self) {
                return;
            }
            self.step();
        }
        panic!(
            "not done after {max_steps} steps; applied: {:?}",
            self.nodes
                .iter()
                .map(|n| n.recovery.last_applied_scn())
                .collect::<Vec<_>>()
        );
    }

    fn applied(&self, node: u8) -> Vec<(Scn, Value)> {
        self.nodes[usize::from(node)]
            .recovery
            .applied()
            .map(|(scn, v)| (scn, v.clone()))
            .collect()
    }

    fn all_applied_through(&self, scn: u64) -> bool {
        self.nodes
            .iter()
            .all(|n| n.recovery.last_applied_scn() >= Scn::new(scn))
    }

    /// Every pair of nodes agrees on every SCN both have applied.
    fn assert_logs_agree(&self) {
        let reference: HashMap<Scn, Value> = self
            .nodes
            .iter()
            .flat_map(|n| n.recovery.applied().map(|(s, v)| (s, v.clone())))
            .fold(HashMap::new(), |mut acc, (s, v)| {
                if let Some(prev) = acc.get(&s) {
                    assert_eq!(prev, &v, "divergent logs at scn {s}");
                }
                acc.insert(s, v);
                acc
            });
        for (scn, value) in &self.chosen {
            if let Some(applied) = reference.get(scn) {
                assert_eq!(applied, value, "applied value differs from chosen at {scn}");
            }
        }
    }
}

fn group(local: PeerId, n: u8) -> PeerGroup {
    PeerGroup::new(
        local,
        (0..n).map(|i| (PeerId::new(i), format!("sim-{i}"))),
    )
    .expect("valid group")
}

fn data_values(log: &[(Scn, Value)]) -> Vec<Value> {
    log.iter()
        .filter(|(_, v)| !v.is_nop())
        .map(|(_, v)| v.clone())
        .collect()
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn single_proposer_preserves_submission_order() {
    let mut sim = Sim::new(3, 1);
    let submitted: Vec<Value> = (0..10).map(|_| sim.submit(0)).collect();

    sim.run_until(50_000, |s| s.all_applied_through(10));

    for node in 0..3 {
        let log = sim.applied(node);
        assert_eq!(data_values(&log), submitted, "node {node}");
        assert_eq!(log.first().map(|(s, _)| *s), Some(Scn::new(1)));
    }
    let bound: Vec<Scn> = sim.nodes[0].bound.iter().map(|(_, s)| *s).collect();
    assert_eq!(bound, (1..=10).map(Scn::new).collect::<Vec<_>>());
    sim.assert_logs_agree();
}

#[test]
fn applied_scns_are_dense() {
    let mut sim = Sim::new(3, 2);
    for node in 0..3 {
        for _ in 0..4 {
            sim.submit(node);
        }
    }
    sim.run_until(100_000, |s| s.all_applied_through(12));
    for node in 0..3 {
        let scns: Vec<u64> = sim.applied(node).iter().map(|(s, _)| s.as_u64()).collect();
        let expected: Vec<u64> = (1..=scns.len() as u64).collect();
        assert_eq!(scns, expected);
    }
}

// ============================================================================
// Safety
// ============================================================================

#[test]
fn agreement_under_message_chaos() {
    for seed in 0..6 {
        let mut sim = Sim::new(3, 100 + seed).chaos(0.15, 0.10);
        let mut submitted = Vec::new();
        for node in 0..3 {
            for _ in 0..5 {
                submitted.push(sim.submit(node));
            }
        }

        sim.run(20_000);
        sim.assert_logs_agree();

        // Heal, then push one more value through so every lagging node
        // learns a SCN above its gap and fills it.
        sim.heal();
        sim.run_until(400_000, |s| {
            s.nodes
                .iter()
                .all(|n| n.pending.is_empty() && n.proposer.requeued_len() == 0)
                && s.nodes.iter().all(|n| n.proposer.table().is_empty())
        });
        let last = sim.submit(0);
        let last_id = last.id().expect("data value");
        submitted.push(last);
        sim.run_until(400_000, |s| {
            s.nodes[0].bound.iter().any(|(id, _)| *id == last_id)
        });
        let top = sim
            .nodes
            .iter()
            .map(|n| n.recovery.last_applied_scn().as_u64())
            .max()
            .unwrap_or(0);
        sim.run_until(400_000, |s| s.all_applied_through(top));
        sim.assert_logs_agree();

        // Exactly once: every submitted value appears once in the log.
        let log = sim.applied(0);
        let values = data_values(&log);
        let ids: HashSet<ValueId> = values.iter().filter_map(Value::id).collect();
        assert_eq!(ids.len(), values.len(), "seed {seed}: duplicate value in log");
        let expected: HashSet<ValueId> = submitted.iter().filter_map(Value::id).collect();
        assert_eq!(ids, expected, "seed {seed}: lost value");
    }
}

// ============================================================================
// Ballot Arbitration
// ============================================================================

#[test]
fn equal_counter_lower_peer_loses() {
    let now = Instant::now();
    let mut a = ProposerCore::new(group(PeerId::new(0), 3), sim_config(), Scn::new(6), 1, now);
    let mut b = ProposerCore::new(group(PeerId::new(1), 3), sim_config(), Scn::new(6), 2, now);
    let mut acceptors: Vec<(FollowerCore, MemoryRecovery)> = (0..3)
        .map(|i| (FollowerCore::new(PeerId::new(i), Scn::new(6)), MemoryRecovery::starting_at(Scn::new(6))))
        .collect();

    let va = Value::data(ValueId::new(PeerId::new(0), 1), &b"a"[..]);
    let vb = Value::data(ValueId::new(PeerId::new(1), 1), &b"b"[..]);
    let prep_a = a.propose(va, now).messages.remove(0);
    let prep_b = b.propose(vb.clone(), now).messages.remove(0);
    assert_eq!(prep_a.payload.ballot(), Some(Ballot::new(1, PeerId::new(0))));
    assert_eq!(prep_b.payload.ballot(), Some(Ballot::new(1, PeerId::new(1))));
    assert_eq!(prep_a.payload.scn(), Scn::new(7));

    // Every acceptor sees A's prepare first, then B's.
    let mut to_a = Vec::new();
    let mut to_b = Vec::new();
    for (f, r) in &mut acceptors {
        to_a.extend(f.on_message(r, prep_a.clone()).unwrap().messages);
        to_b.extend(f.on_message(r, prep_b.clone()).unwrap().messages);
    }

    // A reaches a promise quorum and sends Accept, but every acceptor has
    // since promised B.
    let mut accepts_a = Vec::new();
    for m in to_a {
        accepts_a.extend(a.on_reply(m, now).messages);
    }
    assert_eq!(accepts_a.len(), 1);
    let mut rejects = Vec::new();
    for (f, r) in &mut acceptors {
        rejects.extend(f.on_message(r, accepts_a[0].clone()).unwrap().messages);
    }
    for m in rejects {
        assert!(matches!(m.payload, MessagePayload::Reject(_)));
        a.on_reply(m, now);
    }
    assert_eq!(a.table().get(Scn::new(7)).unwrap().state(), RoundState::Superseded);

    // B completes.
    let mut accepts_b = Vec::new();
    for m in to_b {
        accepts_b.extend(b.on_reply(m, now).messages);
    }
    let mut acks = Vec::new();
    for (f, r) in &mut acceptors {
        acks.extend(f.on_message(r, accepts_b[0].clone()).unwrap().messages);
    }
    let mut chosen = Vec::new();
    for m in acks {
        chosen.extend(b.on_reply(m, now).chosen);
    }
    assert_eq!(chosen, vec![(Scn::new(7), vb)]);
}

#[test]
fn new_proposer_adopts_accepted_value() {
    let now = Instant::now();
    let mut acceptors: Vec<(FollowerCore, MemoryRecovery)> = (0..3)
        .map(|i| (FollowerCore::new(PeerId::new(i), Scn::ZERO), MemoryRecovery::new()))
        .collect();

    // Proposer 0 gets its value accepted by one acceptor, then goes quiet.
    let mut old = ProposerCore::new(group(PeerId::new(0), 3), sim_config(), Scn::ZERO, 1, now);
    let v_old = Value::data(ValueId::new(PeerId::new(0), 1), &b"old"[..]);
    let prep = old.propose(v_old.clone(), now).messages.remove(0);
    let mut accept = None;
    for (f, r) in acceptors.iter_mut().take(2) {
        for m in f.on_message(r, prep.clone()).unwrap().messages {
            accept = accept.or(old.on_reply(m, now).messages.into_iter().next());
        }
    }
    let accept = accept.expect("promise quorum");
    let (f0, r0) = &mut acceptors[0];
    f0.on_message(r0, accept).unwrap();

    // Proposer 2 now tries its own value for the same SCN.
    let mut new = ProposerCore::new(group(PeerId::new(2), 3), sim_config(), Scn::ZERO, 2, now);
    let v_new = Value::data(ValueId::new(PeerId::new(2), 1), &b"new"[..]);
    let prep = new.propose(v_new, now).messages.remove(0);
    assert!(prep.payload.ballot() > Some(Ballot::new(1, PeerId::new(0))));

    let mut accepts = Vec::new();
    for (f, r) in acceptors.iter_mut().take(2) {
        for m in f.on_message(r, prep.clone()).unwrap().messages {
            accepts.extend(new.on_reply(m, now).messages);
        }
    }
    match &accepts[..] {
        [m] => match &m.payload {
            MessagePayload::Accept(a) => assert_eq!(a.value, v_old),
            other => panic!("expected Accept, got {other:?}"),
        },
        other => panic!("expected one Accept, got {other:?}"),
    }
}

// ============================================================================
// Availability
// ============================================================================

#[test]
fn minority_stalls_majority_progresses() {
    let mut sim = Sim::new(5, 11);
    sim.crash(2);
    sim.crash(3);
    sim.crash(4);
    sim.submit(0);

    sim.run(5_000);
    assert!(sim.chosen.is_empty(), "two of five peers decided something");
    assert_eq!(sim.nodes[0].recovery.last_applied_scn(), Scn::ZERO);
    let prop = sim.nodes[0].proposer.table().get(Scn::new(1)).unwrap();
    assert!(prop.attempt() > 0, "stalled round keeps retrying");

    // A third peer comes back: quorum of three.
    sim.restart(2);
    sim.run_until(50_000, |s| s.nodes[0].recovery.last_applied_scn() >= Scn::new(1));
    sim.assert_logs_agree();
}

#[test]
fn restarted_node_resumes_and_catches_up() {
    let mut sim = Sim::new(3, 21);
    for _ in 0..3 {
        sim.submit(0);
    }
    sim.run_until(50_000, |s| s.all_applied_through(3));

    sim.crash(1);
    for _ in 0..3 {
        sim.submit(2);
    }
    sim.run_until(50_000, |s| {
        s.nodes[0].recovery.last_applied_scn() >= Scn::new(6)
            && s.nodes[2].recovery.last_applied_scn() >= Scn::new(6)
    });

    sim.restart(1);
    assert_eq!(sim.nodes[1].proposer.next_scn(), Scn::new(4));

    // A fresh decision gives the restarted node a SCN above its gap.
    sim.submit(0);
    sim.run_until(200_000, |s| s.all_applied_through(7));
    sim.assert_logs_agree();
    assert_eq!(sim.applied(1), sim.applied(0));
}

#[test]
fn duplicated_replies_do_not_double_count() {
    let mut sim = Sim::new(3, 31).chaos(0.0, 0.5);
    let submitted: Vec<Value> = (0..5).map(|_| sim.submit(1)).collect();
    sim.run_until(100_000, |s| s.all_applied_through(5));
    assert_eq!(data_values(&sim.applied(2)), submitted);
    sim.assert_logs_agree();
}
