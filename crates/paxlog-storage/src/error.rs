use paxlog_consensus::RecoveryError;
use paxlog_types::Scn;

/// Errors raised by the paxos log.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not enough bytes for a full record.
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// A sentinel is missing: the record was only partially written.
    #[error("torn write: {reason}")]
    TornWrite { reason: String },

    /// The checksum of a complete record does not match.
    #[error("corrupted record at byte {position}")]
    Corrupted { position: u64 },

    #[error("invalid record kind {byte:#04x} at byte {position}")]
    InvalidRecordKind { byte: u8, position: u64 },

    /// Decide records must follow each other without gaps.
    #[error("decide record out of order: expected scn {expected}, found {found}")]
    DecideOutOfOrder { expected: Scn, found: Scn },

    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

impl From<StorageError> for RecoveryError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(io) => RecoveryError::Io(io),
            other => RecoveryError::Storage(other.to_string()),
        }
    }
}
