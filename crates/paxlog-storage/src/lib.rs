//! # paxlog-storage: Durable paxos log
//!
//! [`FileRecovery`] implements the consensus recovery traits on top of a
//! single append-only file. Each acceptor promise, accepted value, applied
//! decision and prune point becomes one checksummed [`LogRecord`].

mod error;
pub mod log;
pub mod record;

pub use error::StorageError;
pub use log::{DEFAULT_RETENTION, FileRecovery, LOG_FILENAME, read_log};
pub use record::{LogRecord, print_row};
