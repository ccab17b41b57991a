//! Engine bootstrap and the application-facing handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use paxlog_config::PaxlogConfig;
use paxlog_consensus::instrumentation::METRICS;
use paxlog_consensus::{
    FollowerCore, GroupStatus, PeerGroup, ProposerConfig, ProposerCore, Recovery, RecoveryBase,
};
use paxlog_types::{PeerId, Scn, Value, ValueId};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::follower::FollowerTask;
use crate::group::{FollowerEvent, PeerLinks};
use crate::link::{self, LinkConfig};
use crate::pending::{Pending, PendingQueue, PendingValue, PushResult};
use crate::proposer::ProposerTask;
use crate::shutdown::Shutdown;
use crate::{EngineError, EngineResult, SubmitError};

/// Capacity of the broadcast channel behind [`EngineHandle::subscribe`].
const DECISION_CHANNEL_CAPACITY: usize = 1024;

/// Runtime settings of one node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local: PeerId,
    pub listen: String,
    /// Every member of the group, the local node included.
    pub peers: Vec<(PeerId, String)>,
    pub proposer: ProposerConfig,
    pub pending_capacity: usize,
    pub tick: Duration,
    /// Depth of each peer's outbound queue and of the task inboxes.
    pub output_queue_depth: usize,
    pub flush_batch: usize,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl EngineConfig {
    /// Settings for `local` with default tunables.
    pub fn new(local: PeerId, listen: impl Into<String>, peers: Vec<(PeerId, String)>) -> Self {
        Self::from_config(&PaxlogConfig::default()).with_members(local, listen, peers)
    }

    pub fn from_config(config: &PaxlogConfig) -> Self {
        Self {
            local: PeerId::new(config.node.id),
            listen: config.node.listen.clone(),
            peers: config
                .peers
                .iter()
                .map(|p| (PeerId::new(p.id), p.address.clone()))
                .collect(),
            proposer: ProposerConfig {
                pipeline_depth: config.paxos.pipeline_depth,
                round_timeout: config.paxos.round_timeout(),
                max_backoff: config.paxos.max_backoff(),
                gap_timeout: config.paxos.gap_timeout(),
            },
            pending_capacity: config.paxos.pending_capacity,
            tick: config.paxos.tick(),
            output_queue_depth: config.transport.output_queue_depth,
            flush_batch: config.transport.flush_batch,
            reconnect_min: config.transport.reconnect_min(),
            reconnect_max: config.transport.reconnect_max(),
        }
    }

    fn with_members(
        mut self,
        local: PeerId,
        listen: impl Into<String>,
        peers: Vec<(PeerId, String)>,
    ) -> Self {
        self.local = local;
        self.listen = listen.into();
        self.peers = peers;
        self
    }

    fn validate(&self) -> EngineResult<()> {
        let positive = [
            ("pipeline_depth", self.proposer.pipeline_depth),
            ("pending_capacity", self.pending_capacity),
            ("output_queue_depth", self.output_queue_depth),
            ("flush_batch", self.flush_batch),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.tick.is_zero() {
            return Err(EngineError::Config("tick must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Entry point: wires the tasks together.
pub struct Engine;

impl Engine {
    /// Binds `config.listen` and starts the engine.
    pub async fn start(
        config: EngineConfig,
        recovery: Box<dyn RecoveryBase>,
    ) -> EngineResult<EngineHandle> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| EngineError::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        Self::start_with_listener(config, listener, recovery)
    }

    /// Starts the engine on an already bound listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_with_listener(
        config: EngineConfig,
        listener: TcpListener,
        recovery: Box<dyn RecoveryBase>,
    ) -> EngineResult<EngineHandle> {
        config.validate()?;
        let group = PeerGroup::new(config.local, config.peers.iter().cloned())?;
        let local = config.local;
        let applied = recovery.last_applied_scn();
        let now = Instant::now();
        let shutdown = Shutdown::new();

        let (proposer_tx, proposer_rx) = mpsc::channel(config.output_queue_depth);
        let (follower_tx, follower_rx) = mpsc::channel(config.output_queue_depth);

        let link_config = LinkConfig {
            flush_batch: config.flush_batch,
            reconnect_min: config.reconnect_min,
            reconnect_max: config.reconnect_max,
        };
        let (links, flushers) = PeerLinks::resolve(
            &group,
            link_config,
            config.output_queue_depth,
            proposer_tx.clone(),
            follower_tx.clone(),
            &shutdown,
        );

        let seed = rand::random();
        let core = ProposerCore::new(group, config.proposer.clone(), applied, seed, now);
        let (status_tx, status_rx) = watch::channel(core.group().status());
        let (next_scn_tx, next_scn_rx) = watch::channel(core.next_scn());
        let (applied_tx, applied_rx) = watch::channel(applied);
        let (decisions_tx, _) = broadcast::channel(DECISION_CHANNEL_CAPACITY);
        let pending = Arc::new(PendingQueue::new(config.pending_capacity));

        let proposer = ProposerTask {
            core,
            pending: Arc::clone(&pending),
            inbox: proposer_rx,
            links: links.clone(),
            tick: config.tick,
            status: status_tx,
            next_scn: next_scn_tx,
            shutdown: shutdown.clone(),
            tickets: HashMap::new(),
        };
        let follower = FollowerTask {
            core: FollowerCore::new(local, applied),
            recovery,
            inbox: follower_rx,
            links: links.clone(),
            proposer: proposer_tx,
            applied: applied_tx,
            decisions: decisions_tx.clone(),
            shutdown: shutdown.clone(),
        };

        let mut tasks: Vec<JoinHandle<EngineResult<()>>> = Vec::new();
        tasks.push(tokio::spawn(follower.run()));
        tasks.push(tokio::spawn(async move {
            proposer.run().await;
            Ok(())
        }));
        for flusher in flushers {
            tasks.push(tokio::spawn(async move {
                flusher.run().await;
                Ok(())
            }));
        }
        {
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                link::listen(listener, links, shutdown).await;
                Ok(())
            }));
        }

        info!(
            local = %local,
            listen = %config.listen,
            peers = config.peers.len(),
            applied = %applied,
            "engine started"
        );

        Ok(EngineHandle {
            local,
            pending,
            follower: follower_tx,
            status: status_rx,
            next_scn: next_scn_rx,
            applied: applied_rx,
            decisions: decisions_tx,
            shutdown,
            tasks,
        })
    }
}

/// Application-facing handle of a running engine.
pub struct EngineHandle {
    local: PeerId,
    pending: Arc<PendingQueue>,
    follower: mpsc::Sender<FollowerEvent>,
    status: watch::Receiver<GroupStatus>,
    next_scn: watch::Receiver<Scn>,
    applied: watch::Receiver<Scn>,
    decisions: broadcast::Sender<(Scn, Value)>,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<EngineResult<()>>>,
}

impl EngineHandle {
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Queues a value for ordering. Never blocks.
    pub fn submit(&self, bytes: impl Into<Bytes>) -> Result<Pending, SubmitError> {
        if self.shutdown.is_fired() || self.pending.is_closed() {
            return Err(SubmitError::ShutDown);
        }
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(SubmitError::EmptyValue);
        }

        let id = ValueId::new(self.local, rand::random());
        let (ticket, rx) = oneshot::channel();
        let item = PendingValue {
            value: Value::data(id, bytes),
            ticket,
        };
        match self.pending.try_push(item) {
            PushResult::Ok => Ok(Pending::new(id, rx)),
            PushResult::Backpressure(_) => {
                METRICS.increment_submissions_rejected();
                Err(SubmitError::Overloaded)
            }
        }
    }

    /// Seeds or overrides the SCN counter during recovery bootstrap.
    ///
    /// Everything at or below `scn` is treated as applied. Resolves once
    /// both the follower and the proposer moved.
    pub async fn set_scn(&self, scn: Scn) -> EngineResult<()> {
        let (done, rx) = oneshot::channel();
        self.follower
            .send(FollowerEvent::SetScn { scn, done })
            .await
            .map_err(|_| EngineError::ShutDown)?;
        rx.await.map_err(|_| EngineError::ShutDown)
    }

    /// Next SCN the local proposer will claim.
    pub fn next_scn(&self) -> Scn {
        *self.next_scn.borrow()
    }

    pub fn last_applied(&self) -> Scn {
        *self.applied.borrow()
    }

    /// Waits until the local apply position reaches `scn`.
    pub async fn wait_applied(&self, scn: Scn) -> EngineResult<Scn> {
        let mut applied = self.applied.clone();
        let reached = applied
            .wait_for(|current| *current >= scn)
            .await
            .map_err(|_| EngineError::ShutDown)?;
        Ok(*reached)
    }

    pub fn peer_status(&self) -> GroupStatus {
        self.status.borrow().clone()
    }

    /// Stream of `(scn, value)` in apply order.
    ///
    /// A receiver that falls more than the channel capacity behind gets
    /// `RecvError::Lagged` and skips ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<(Scn, Value)> {
        self.decisions.subscribe()
    }

    /// Asks every task to stop. Values not yet applied are abandoned and
    /// their [`Pending`] handles resolve to [`SubmitError::ShutDown`].
    pub fn shutdown(&self) {
        self.pending.close();
        self.shutdown.fire();
    }

    /// Resolves once shutdown was requested or a task failed fatally.
    pub async fn stopped(&self) {
        self.shutdown.wait().await;
    }

    /// Resolves once every task has stopped, with the first fatal error.
    pub async fn wait(self) -> EngineResult<()> {
        let mut first_error = None;
        for task in self.tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                self.shutdown.fire();
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
