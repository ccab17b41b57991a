//! Run command: starts a node on a durable paxos log.

use std::path::Path;

use anyhow::{Context, Result};
use paxlog_config::PaxlogConfig;
use paxlog_consensus::instrumentation::METRICS;
use paxlog_node::{Engine, EngineConfig};
use paxlog_storage::FileRecovery;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::load_config;

pub fn run(dir: Option<&Path>) -> Result<()> {
    let config = load_config(dir)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: PaxlogConfig) -> Result<()> {
    let data_dir = &config.node.data_dir;
    let recovery = FileRecovery::open(data_dir, config.storage.sync_writes)
        .with_context(|| format!("failed to open paxos log in {}", data_dir.display()))?;
    info!(
        path = %recovery.path().display(),
        slots = recovery.slot_count(),
        bytes = recovery.size_bytes(),
        "paxos log opened"
    );

    let engine = Engine::start(EngineConfig::from_config(&config), Box::new(recovery))
        .await
        .context("failed to start engine")?;
    let mut decisions = engine.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            () = engine.stopped() => break,
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match engine.submit(line.into_bytes()) {
                        Ok(pending) => debug!(value = %pending.id(), "value submitted"),
                        Err(e) => warn!(error = %e, "value rejected"),
                    },
                    None => {
                        stdin_open = false;
                        info!("stdin closed, still serving");
                    }
                }
            }
            decision = decisions.recv() => match decision {
                Ok((scn, value)) => info!(scn = %scn, value = %value, "applied"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "applied stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown();
    let result = engine.wait().await;
    let metrics = serde_json::to_string(&METRICS.snapshot()).context("failed to encode metrics")?;
    info!(metrics = %metrics, "final metrics");
    result.context("engine stopped with an error")?;
    info!("node stopped");
    Ok(())
}
