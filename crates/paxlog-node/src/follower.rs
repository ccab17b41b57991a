//! The follower task: acceptor and learner on top of the recovery base.

use paxlog_consensus::instrumentation::METRICS;
use paxlog_consensus::{FollowerCore, FollowerOutput, RecoveryBase};
use paxlog_types::{Scn, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};

use crate::group::{FollowerEvent, PeerLinks, ProposerEvent};
use crate::shutdown::Shutdown;
use crate::{EngineError, EngineResult};

pub(crate) struct FollowerTask {
    pub(crate) core: FollowerCore,
    pub(crate) recovery: Box<dyn RecoveryBase>,
    pub(crate) inbox: mpsc::Receiver<FollowerEvent>,
    pub(crate) links: PeerLinks,
    pub(crate) proposer: mpsc::Sender<ProposerEvent>,
    pub(crate) applied: watch::Sender<Scn>,
    pub(crate) decisions: broadcast::Sender<(Scn, Value)>,
    pub(crate) shutdown: Shutdown,
}

impl FollowerTask {
    /// Runs until shutdown. A recovery failure is fatal: it stops the whole
    /// engine and is returned.
    pub(crate) async fn run(mut self) -> EngineResult<()> {
        let result = match self.event_loop().await {
            Err(EngineError::ShutDown) => Ok(()),
            other => other,
        };
        if let Err(e) = &result {
            error!(
                local = %self.core.local(),
                applied = %self.core.applied(),
                error = %e,
                "follower failed, stopping engine"
            );
            self.shutdown.fire();
        } else {
            info!(local = %self.core.local(), applied = %self.core.applied(), "follower stopped");
        }
        result
    }

    async fn event_loop(&mut self) -> EngineResult<()> {
        loop {
            let event = tokio::select! {
                biased;
                () = self.shutdown.wait() => return Ok(()),
                event = self.inbox.recv() => event,
            };
            let Some(event) = event else {
                return Ok(());
            };
            match event {
                FollowerEvent::Message(msg) => {
                    let out = self.core.on_message(&mut *self.recovery, msg)?;
                    self.emit(out).await?;
                }
                FollowerEvent::SetScn { scn, done } => {
                    let out = self.core.set_scn(&mut *self.recovery, scn)?;
                    self.notify_proposer(ProposerEvent::SetScn(scn)).await?;
                    self.applied.send_replace(self.core.applied());
                    self.emit(out).await?;
                    let _ = done.send(());
                }
            }
        }
    }

    async fn emit(&mut self, out: FollowerOutput) -> EngineResult<()> {
        let applied_through = out.applied_through();
        for msg in out.messages {
            self.links.send(msg);
        }
        for learned in out.learned {
            self.notify_proposer(ProposerEvent::Learned(learned)).await?;
        }
        for decision in out.applied {
            // No subscribers is fine.
            let _ = self.decisions.send(decision);
        }
        if let Some(scn) = applied_through {
            METRICS.set_last_applied_scn(scn.as_u64());
            self.applied.send_replace(scn);
            self.notify_proposer(ProposerEvent::Applied(scn)).await?;
        }
        Ok(())
    }

    // Learner events must not be lost, so this waits for inbox room.
    async fn notify_proposer(&mut self, event: ProposerEvent) -> EngineResult<()> {
        tokio::select! {
            biased;
            () = self.shutdown.wait() => Err(EngineError::ShutDown),
            sent = self.proposer.send(event) => sent.map_err(|_| EngineError::ShutDown),
        }
    }
}
