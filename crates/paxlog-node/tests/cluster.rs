//! Multi-node tests over loopback TCP.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use paxlog_consensus::{MemoryRecovery, Recovery, RecoveryBase};
use paxlog_node::{Engine, EngineConfig, EngineHandle, SubmitError};
use paxlog_storage::{FileRecovery, LOG_FILENAME, LogRecord, read_log};
use paxlog_types::{PeerId, Scn, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const PATIENCE: Duration = Duration::from_secs(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn bind_group(n: u8) -> (Vec<TcpListener>, Vec<(PeerId, String)>) {
    let mut listeners = Vec::new();
    let mut peers = Vec::new();
    for i in 0..n {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        peers.push((PeerId::new(i), listener.local_addr().unwrap().to_string()));
        listeners.push(listener);
    }
    (listeners, peers)
}

fn test_config(local: u8, peers: &[(PeerId, String)]) -> EngineConfig {
    let local = PeerId::new(local);
    let listen = peers[local.as_usize()].1.clone();
    let mut config = EngineConfig::new(local, listen, peers.to_vec());
    config.proposer.pipeline_depth = 4;
    config.proposer.round_timeout = Duration::from_millis(100);
    config.proposer.max_backoff = Duration::from_millis(800);
    config.proposer.gap_timeout = Duration::from_millis(300);
    config.tick = Duration::from_millis(10);
    config.reconnect_min = Duration::from_millis(20);
    config.reconnect_max = Duration::from_millis(200);
    config
}

fn start(config: EngineConfig, listener: TcpListener, recovery: Box<dyn RecoveryBase>) -> EngineHandle {
    Engine::start_with_listener(config, listener, recovery).unwrap()
}

async fn start_group(n: u8) -> Vec<EngineHandle> {
    let (listeners, peers) = bind_group(n).await;
    listeners
        .into_iter()
        .enumerate()
        .map(|(i, listener)| {
            start(
                test_config(i as u8, &peers),
                listener,
                Box::new(MemoryRecovery::new()),
            )
        })
        .collect()
}

async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    timeout(PATIENCE, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_links_up(node: &EngineHandle) {
    within("links", async {
        loop {
            let status = node.peer_status();
            if status.reachable() == status.peers.len() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

/// Collects decisions from `rx` until `through` is reached.
async fn collect(rx: &mut broadcast::Receiver<(Scn, Value)>, through: Scn) -> BTreeMap<Scn, Value> {
    let mut seen = BTreeMap::new();
    within("decisions", async {
        while seen.last_key_value().is_none_or(|(scn, _)| *scn < through) {
            let (scn, value) = rx.recv().await.unwrap();
            seen.insert(scn, value);
        }
    })
    .await;
    seen
}

async fn stop(nodes: Vec<EngineHandle>) {
    for node in &nodes {
        node.shutdown();
    }
    for node in nodes {
        within("shutdown", node.wait()).await.unwrap();
    }
}

#[tokio::test]
async fn three_nodes_agree_on_every_scn() {
    init_tracing();
    let nodes = start_group(3).await;
    let mut streams: Vec<_> = nodes.iter().map(EngineHandle::subscribe).collect();
    for node in &nodes {
        wait_links_up(node).await;
    }

    let mut pending = Vec::new();
    for i in 0..12u32 {
        let proposer = &nodes[(i % 3) as usize];
        pending.push(proposer.submit(format!("value-{i}").into_bytes()).unwrap());
    }
    let mut last = Scn::ZERO;
    for p in pending {
        last = last.max(within("decision", p.decided()).await.unwrap());
    }

    let mut logs = Vec::new();
    for rx in &mut streams {
        logs.push(collect(rx, last).await);
    }
    assert_eq!(logs[0], logs[1]);
    assert_eq!(logs[1], logs[2]);

    // Every SCN up to the last is bound, and every submission appears once.
    let scns: Vec<u64> = logs[0].keys().map(|s| s.as_u64()).collect();
    assert_eq!(scns, (1..=last.as_u64()).collect::<Vec<_>>());
    let data = logs[0].values().filter(|v| !v.is_nop()).count();
    assert_eq!(data, 12);

    stop(nodes).await;
}

#[tokio::test]
async fn single_proposer_keeps_submission_order() {
    init_tracing();
    let nodes = start_group(3).await;
    for node in &nodes {
        wait_links_up(node).await;
    }

    let pending: Vec<_> = (0..20u32)
        .map(|i| nodes[0].submit(i.to_le_bytes().to_vec()).unwrap())
        .collect();
    let mut scns = Vec::new();
    for p in pending {
        scns.push(within("decision", p.decided()).await.unwrap());
    }

    assert!(scns.windows(2).all(|w| w[0] < w[1]), "{scns:?}");
    assert_eq!(nodes[0].last_applied(), *scns.last().unwrap());
    assert!(nodes[0].next_scn() > *scns.last().unwrap());

    stop(nodes).await;
}

#[tokio::test]
async fn submit_rejects_empty_overload_and_shutdown() {
    init_tracing();
    // Peers 1 and 2 never come up, so nothing can be decided.
    let (mut listeners, peers) = bind_group(3).await;
    listeners.truncate(1);
    let listener = listeners.pop().unwrap();
    let mut config = test_config(0, &peers);
    config.proposer.pipeline_depth = 1;
    config.pending_capacity = 2;
    let node = start(config, listener, Box::new(MemoryRecovery::new()));

    assert_eq!(node.submit(Vec::new()).unwrap_err(), SubmitError::EmptyValue);

    // One value in the pipeline plus two queued is the most that fits.
    let results: Vec<_> = (0..4u8).map(|i| node.submit(vec![i + 1])).collect();
    assert!(results.iter().filter(|r| r.is_ok()).count() <= 3);
    assert_eq!(
        results.last().unwrap().as_ref().unwrap_err(),
        &SubmitError::Overloaded
    );

    node.shutdown();
    assert_eq!(node.submit(vec![9]).unwrap_err(), SubmitError::ShutDown);
    let stranded = results.into_iter().find_map(Result::ok).unwrap();
    within("shutdown", node.wait()).await.unwrap();
    assert_eq!(stranded.decided().await, Err(SubmitError::ShutDown));
}

#[tokio::test]
async fn minority_stalls_until_quorum_returns() {
    init_tracing();
    let (mut listeners, peers) = bind_group(3).await;
    // Peers 1 and 2 keep their listeners bound but are not running yet:
    // connections queue in the backlog and nobody answers.
    let l2 = listeners.pop().unwrap();
    let l1 = listeners.pop().unwrap();
    let l0 = listeners.pop().unwrap();
    let node0 = start(test_config(0, &peers), l0, Box::new(MemoryRecovery::new()));

    let pending = node0.submit(&b"needs a quorum"[..]).unwrap();
    let mut decided = Box::pin(pending.decided());
    assert!(
        timeout(Duration::from_millis(600), &mut decided).await.is_err(),
        "decided without a quorum"
    );
    assert_eq!(node0.last_applied(), Scn::ZERO);

    let node1 = start(test_config(1, &peers), l1, Box::new(MemoryRecovery::new()));
    let node2 = start(test_config(2, &peers), l2, Box::new(MemoryRecovery::new()));

    let scn = within("decision after quorum", decided).await.unwrap();
    assert_eq!(scn, Scn::new(1));

    stop(vec![node0, node1, node2]).await;
}

#[tokio::test]
async fn restarted_node_resumes_from_its_log_and_catches_up() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (mut listeners, peers) = bind_group(3).await;
    let l2 = listeners.pop().unwrap();
    let l1 = listeners.pop().unwrap();
    let l0 = listeners.pop().unwrap();

    let node0 = start(test_config(0, &peers), l0, Box::new(MemoryRecovery::new()));
    let node1 = start(test_config(1, &peers), l1, Box::new(MemoryRecovery::new()));
    let durable = FileRecovery::open(dir.path(), false).unwrap();
    let node2 = start(test_config(2, &peers), l2, Box::new(durable));
    let mut decisions = node0.subscribe();
    for node in [&node0, &node1, &node2] {
        wait_links_up(node).await;
    }

    let mut last = Scn::ZERO;
    for i in 0..5u8 {
        last = within("decision", node0.submit(vec![i + 1]).unwrap().decided())
            .await
            .unwrap();
    }
    within("node 2 apply", node2.wait_applied(last)).await.unwrap();
    node2.shutdown();
    within("node 2 shutdown", node2.wait()).await.unwrap();
    let resumed_at = last;

    // The remaining majority keeps deciding.
    for i in 0..5u8 {
        last = within("decision", node0.submit(vec![i + 10]).unwrap().decided())
            .await
            .unwrap();
    }

    let listener = TcpListener::bind(&peers[2].1).await.unwrap();
    let durable = FileRecovery::open(dir.path(), false).unwrap();
    let node2 = start(test_config(2, &peers), listener, Box::new(durable));
    assert_eq!(node2.last_applied(), resumed_at);
    assert!(node2.next_scn() > resumed_at);

    // New decisions reveal the gap; node 2 fills it from its peers.
    within("catch-up", async {
        let mut n = 0u8;
        while node2.last_applied() < last {
            n = n.wrapping_add(1);
            let scn = node0.submit(vec![0xAA, n]).unwrap().decided().await.unwrap();
            last = last.max(scn);
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    let reference = collect(&mut decisions, node2.last_applied()).await;
    stop(vec![node0, node1, node2]).await;

    let replayed: BTreeMap<Scn, Value> = read_log(dir.path().join(LOG_FILENAME))
        .unwrap()
        .into_iter()
        .filter_map(|record| match record {
            LogRecord::Decide { scn, value } => Some((scn, value)),
            _ => None,
        })
        .collect();
    assert_eq!(
        replayed.keys().copied().collect::<Vec<_>>(),
        (1..=replayed.len() as u64).map(Scn::new).collect::<Vec<_>>()
    );
    for (scn, value) in &replayed {
        assert_eq!(reference.get(scn), Some(value), "scn {scn} diverged");
    }
}

#[tokio::test]
async fn set_scn_rebases_a_fresh_group() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (mut listeners, peers) = bind_group(3).await;
    let l2 = listeners.pop().unwrap();
    let l1 = listeners.pop().unwrap();
    let l0 = listeners.pop().unwrap();

    // Every recovery base starts empty, below the restored position.
    let node0 = start(test_config(0, &peers), l0, Box::new(MemoryRecovery::new()));
    let node1 = start(test_config(1, &peers), l1, Box::new(MemoryRecovery::new()));
    let durable = FileRecovery::open(dir.path(), false).unwrap();
    let node2 = start(test_config(2, &peers), l2, Box::new(durable));
    let nodes = vec![node0, node1, node2];
    for node in &nodes {
        wait_links_up(node).await;
    }

    for node in &nodes {
        within("set_scn", node.set_scn(Scn::new(10))).await.unwrap();
        assert_eq!(node.last_applied(), Scn::new(10));
        assert_eq!(node.next_scn(), Scn::new(11));
    }

    let scn = within("decision", nodes[0].submit(&b"after restore"[..]).unwrap().decided())
        .await
        .unwrap();
    assert_eq!(scn, Scn::new(11));
    for node in &nodes {
        within("apply", node.wait_applied(scn)).await.unwrap();
        assert_eq!(node.last_applied(), Scn::new(11));
    }
    let scn = within("decision", nodes[1].submit(&b"next"[..]).unwrap().decided())
        .await
        .unwrap();
    assert_eq!(scn, Scn::new(12));

    stop(nodes).await;

    let records = read_log(dir.path().join(LOG_FILENAME)).unwrap();
    assert!(records.contains(&LogRecord::Base { scn: Scn::new(10) }));
    let reopened = FileRecovery::open(dir.path(), false).unwrap();
    assert!(reopened.last_applied_scn() >= Scn::new(11));
}
