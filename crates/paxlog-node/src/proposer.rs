//! The proposer task.
//!
//! Owns the [`ProposerCore`], the tickets of submitted values and the
//! status channels. It wakes on new pending values, on its inbox (peer
//! replies, learner events, link changes) and on a fixed tick that drives
//! round timeouts, retries and gap filling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use paxlog_consensus::instrumentation::METRICS;
use paxlog_consensus::{GroupStatus, ProposerCore, ProposerOutput};
use paxlog_types::{Scn, ValueId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::group::{PeerLinks, ProposerEvent};
use crate::pending::PendingQueue;
use crate::shutdown::Shutdown;

pub(crate) struct ProposerTask {
    pub(crate) core: ProposerCore,
    pub(crate) pending: Arc<PendingQueue>,
    pub(crate) inbox: mpsc::Receiver<ProposerEvent>,
    pub(crate) links: PeerLinks,
    pub(crate) tick: Duration,
    pub(crate) status: watch::Sender<GroupStatus>,
    pub(crate) next_scn: watch::Sender<Scn>,
    pub(crate) shutdown: Shutdown,
    pub(crate) tickets: HashMap<ValueId, oneshot::Sender<Scn>>,
}

impl ProposerTask {
    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let pending = Arc::clone(&self.pending);

        loop {
            let can_open = self.core.can_open();
            tokio::select! {
                biased;
                () = self.shutdown.wait() => break,
                event = self.inbox.recv() => {
                    let Some(event) = event else { break };
                    self.on_event(event);
                }
                () = pending.notified(), if can_open => {}
                _ = tick.tick() => {
                    let out = self.core.on_tick(Instant::now());
                    self.emit(out);
                }
            }
            self.fill_pipeline();
            self.publish();
        }

        self.pending.close();
        info!(
            local = %self.core.local(),
            unresolved = self.tickets.len(),
            "proposer stopped"
        );
    }

    fn on_event(&mut self, event: ProposerEvent) {
        let now = Instant::now();
        match event {
            ProposerEvent::Reply(msg) => {
                let out = self.core.on_reply(msg, now);
                self.emit(out);
            }
            ProposerEvent::Learned(learned) => {
                self.core
                    .on_learned(learned.scn, &learned.value, learned.decided_by);
            }
            ProposerEvent::Applied(scn) => {
                let out = self.core.on_applied(scn, now);
                self.emit(out);
            }
            ProposerEvent::Link { peer, state } => {
                if let Ok(true) = self.core.group_mut().set_link(peer, state) {
                    info!(
                        peer = %peer,
                        link = %state,
                        reachable = self.core.group().reachable(),
                        quorum = self.core.group().quorum_size(),
                        "peer link changed"
                    );
                }
            }
            ProposerEvent::SetScn(scn) => {
                let out = self.core.set_scn(scn, now);
                self.emit(out);
            }
        }
    }

    // Displaced values go first, then new submissions in FIFO order.
    fn fill_pipeline(&mut self) {
        let now = Instant::now();
        while self.core.can_open() {
            let value = match self.core.pop_requeued() {
                Some(value) => value,
                None => match self.pending.try_pop() {
                    Some(item) => {
                        if let Some(id) = item.value.id() {
                            self.tickets.insert(id, item.ticket);
                        }
                        item.value
                    }
                    None => break,
                },
            };
            let out = self.core.propose(value, now);
            self.emit(out);
        }
        METRICS.set_pending_values((self.pending.len() + self.core.requeued_len()) as u64);
        METRICS.set_proposals_in_flight(self.core.table().len() as u64);
    }

    fn emit(&mut self, out: ProposerOutput) {
        for msg in out.messages {
            self.links.send(msg);
        }
        for (id, scn) in out.bound {
            match self.tickets.remove(&id) {
                Some(ticket) => {
                    let _ = ticket.send(scn);
                }
                None => debug!(value = %id, scn = %scn, "bound value has no ticket"),
            }
        }
    }

    fn publish(&self) {
        let next = self.core.next_scn();
        self.next_scn.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
        let status = self.core.group().status();
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            if changed {
                *current = status;
            }
            changed
        });
    }
}
