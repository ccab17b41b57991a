//! # paxlog-node: Multi-Paxos runtime
//!
//! This crate runs the pure state machines of `paxlog-consensus` on tokio
//! and connects them to peers over TCP.
//!
//! ## Architecture
//!
//! ```text
//!  submit() ──► PendingQueue ──► Proposer task ──► PeerLinks ──► Output Flusher ──► peer
//!                                    ▲     │           │
//!                      replies,      │     │ local     │ PREPARE / ACCEPT / DECIDE
//!                      learner events│     ▼           ▼
//!  peer ──► Reply Reader ──► PeerLinks::dispatch ──► Follower task ──► Recovery base
//! ```
//!
//! - The **Proposer task** owns the proposal table. It pulls pending values
//!   while the pipeline has room and drives rounds on a fixed tick.
//! - The **Follower task** owns the acceptor state and the recovery base.
//!   A recovery failure stops the engine.
//! - One **Output Flusher** per remote peer owns the outbound link and
//!   batches frames. One **Reply Reader** per inbound link decodes frames
//!   and hands them to the task that owns their kind.
//!
//! Tasks only share channels and the lock-free pending queue.
//!
//! ## Usage
//!
//! ```ignore
//! use paxlog_consensus::MemoryRecovery;
//! use paxlog_node::{Engine, EngineConfig};
//! use paxlog_types::PeerId;
//!
//! let peers = vec![(PeerId::new(0), "127.0.0.1:7400".to_string())];
//! let config = EngineConfig::new(PeerId::new(0), "127.0.0.1:7400", peers);
//! let engine = Engine::start(config, Box::new(MemoryRecovery::new())).await?;
//! let scn = engine.submit(&b"hello"[..])?.decided().await?;
//! ```

mod engine;
mod error;
mod follower;
mod group;
mod link;
pub mod pending;
mod proposer;
mod shutdown;
pub mod wire;

pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::{EngineError, EngineResult, SubmitError, WireError};
pub use pending::Pending;
