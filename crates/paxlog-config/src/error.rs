//! Configuration error types

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no peers configured")]
    NoPeers,

    #[error("local node {0} is not listed in [[peers]]")]
    LocalNotInPeers(u8),

    #[error("peer {0} is listed more than once")]
    DuplicatePeer(u8),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("XDG directory error: {0}")]
    XdgError(String),
}
