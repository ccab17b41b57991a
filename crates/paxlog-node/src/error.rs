//! Runtime error types.

use std::net::SocketAddr;

use paxlog_consensus::{ConsensusError, RecoveryError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that stop an engine or prevent it from starting.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// The recovery base failed to persist or apply state. Fatal.
    #[error("durable apply failed: {0}")]
    Apply(#[from] RecoveryError),

    /// Peer group construction failed.
    #[error("peer group error: {0}")]
    Consensus(#[from] ConsensusError),

    /// A runtime task panicked or was cancelled.
    #[error("engine task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Engine shutdown.
    #[error("engine shut down")]
    ShutDown,
}

/// Reasons a value is refused by [`crate::EngineHandle::submit`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The pending value queue is full. Retry later.
    #[error("pending value queue is full")]
    Overloaded,

    #[error("value is empty")]
    EmptyValue,

    #[error("engine shut down")]
    ShutDown,
}

/// Peer link framing errors. These never leave the link tasks.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad frame magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("frame too large: {size} bytes")]
    FrameTooLarge { size: usize },

    #[error("decode error: {0}")]
    Decode(#[from] postcard::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The first frame on a link was not a `Hello`.
    #[error("expected hello from {addr}")]
    MissingHello { addr: SocketAddr },

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}
