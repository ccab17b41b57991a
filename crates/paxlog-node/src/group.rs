//! Message routing between the local tasks and remote peers.
//!
//! Every remote peer gets a bounded outbound queue drained by its Output
//! Flusher. Messages for the local node skip the network and go straight
//! to the local proposer or follower inbox, so the local node votes like
//! any other acceptor.
//!
//! All sends are `try_send`: a full queue drops the message. Paxos treats a
//! dropped message like a slow peer, and retries cover the gap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use paxlog_consensus::instrumentation::METRICS;
use paxlog_consensus::{Learned, LinkState, Message, PeerGroup};
use paxlog_types::{PeerId, Scn};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::link::{Flusher, LinkConfig};
use crate::shutdown::Shutdown;

/// Redial hints buffered per peer.
const REDIAL_QUEUE_DEPTH: usize = 4;

/// Inputs of the proposer task.
#[derive(Debug)]
pub(crate) enum ProposerEvent {
    /// PROMISE, REJECT or ACCEPT-ACK from a peer.
    Reply(Message),
    /// The local learner saw a decision.
    Learned(Learned),
    /// The local apply position advanced.
    Applied(Scn),
    /// An outbound link went up or down.
    Link { peer: PeerId, state: LinkState },
    /// Recovery bootstrap moved the SCN counter.
    SetScn(Scn),
}

/// Inputs of the follower task.
#[derive(Debug)]
pub(crate) enum FollowerEvent {
    /// PREPARE, ACCEPT or DECIDE.
    Message(Message),
    SetScn { scn: Scn, done: oneshot::Sender<()> },
}

/// Outbound side of one remote peer.
#[derive(Debug, Clone)]
pub(crate) struct PeerLink {
    pub(crate) queue: mpsc::Sender<Message>,
    /// Reply Readers report dead inbound connections here, with the time
    /// the connection was accepted.
    pub(crate) redial: mpsc::Sender<Instant>,
}

/// Routes messages to peers and local tasks.
#[derive(Debug, Clone)]
pub(crate) struct PeerLinks {
    local: PeerId,
    remotes: Arc<HashMap<PeerId, PeerLink>>,
    proposer: mpsc::Sender<ProposerEvent>,
    follower: mpsc::Sender<FollowerEvent>,
}

impl PeerLinks {
    pub(crate) fn new(
        local: PeerId,
        remotes: HashMap<PeerId, PeerLink>,
        proposer: mpsc::Sender<ProposerEvent>,
        follower: mpsc::Sender<FollowerEvent>,
    ) -> Self {
        Self {
            local,
            remotes: Arc::new(remotes),
            proposer,
            follower,
        }
    }

    /// Creates the outbound queue of every remote member of `group`,
    /// returning the router and one unstarted Output Flusher per peer.
    /// Each flusher dials its peer and keeps redialing with backoff.
    pub(crate) fn resolve(
        group: &PeerGroup,
        config: LinkConfig,
        queue_depth: usize,
        proposer: mpsc::Sender<ProposerEvent>,
        follower: mpsc::Sender<FollowerEvent>,
        shutdown: &Shutdown,
    ) -> (Self, Vec<Flusher>) {
        let local = group.local();
        let mut remotes = HashMap::new();
        let mut flushers = Vec::new();
        for peer in group.remote_peers() {
            let (queue_tx, queue_rx) = mpsc::channel(queue_depth);
            let (redial_tx, redial_rx) = mpsc::channel(REDIAL_QUEUE_DEPTH);
            remotes.insert(
                peer.id,
                PeerLink {
                    queue: queue_tx,
                    redial: redial_tx,
                },
            );
            flushers.push(Flusher {
                local,
                peer: peer.id,
                address: peer.address.clone(),
                queue: queue_rx,
                redial: redial_rx,
                events: proposer.clone(),
                config,
                shutdown: shutdown.clone(),
            });
        }
        (Self::new(local, remotes, proposer, follower), flushers)
    }

    pub(crate) fn local(&self) -> PeerId {
        self.local
    }

    /// Returns true if `peer` is a remote member of the group.
    pub(crate) fn is_remote(&self, peer: PeerId) -> bool {
        self.remotes.contains_key(&peer)
    }

    /// Sends a message to its addressee, or to every peer including the
    /// local node when it has none.
    pub(crate) fn send(&self, msg: Message) {
        match msg.to {
            Some(to) => self.send_to(to, msg),
            None => self.broadcast(msg),
        }
    }

    pub(crate) fn broadcast(&self, msg: Message) {
        for (peer, link) in self.remotes.iter() {
            Self::enqueue(*peer, link, msg.clone());
        }
        self.dispatch(msg);
    }

    pub(crate) fn send_to(&self, to: PeerId, msg: Message) {
        if to == self.local {
            self.dispatch(msg);
            return;
        }
        match self.remotes.get(&to) {
            Some(link) => Self::enqueue(to, link, msg),
            None => {
                METRICS.increment_messages_dropped();
                debug!(peer = %to, kind = msg.payload.name(), "no link to peer, message dropped");
            }
        }
    }

    /// Hands a message received for the local node to the task that owns
    /// its kind. PREPARE, ACCEPT and DECIDE go to the follower, replies to
    /// the proposer.
    pub(crate) fn dispatch(&self, msg: Message) {
        let kind = msg.payload.name();
        let delivered = if msg.payload.is_for_follower() {
            self.follower.try_send(FollowerEvent::Message(msg)).is_ok()
        } else {
            self.proposer.try_send(ProposerEvent::Reply(msg)).is_ok()
        };
        if !delivered {
            METRICS.increment_messages_dropped();
            debug!(kind, "local inbox full, message dropped");
        }
    }

    /// Asks the flusher for `peer` to check its link.
    pub(crate) fn request_redial(&self, peer: PeerId, inbound_since: Instant) {
        if let Some(link) = self.remotes.get(&peer) {
            let _ = link.redial.try_send(inbound_since);
        }
    }

    fn enqueue(peer: PeerId, link: &PeerLink, msg: Message) {
        let kind = msg.payload.name();
        if link.queue.try_send(msg).is_err() {
            METRICS.increment_messages_dropped();
            trace!(peer = %peer, kind, "peer queue full, message dropped");
        }
    }
}
