//! File-backed [`Recovery`] and [`AcceptorLog`].
//!
//! Everything lives in one append-only file, `paxos.log`, inside the node
//! data directory. Acceptor slots and decisions are rebuilt in memory by
//! replaying the file on open.
//!
//! # Torn tails
//!
//! A crash can leave the last record half written. On replay a short read,
//! a missing sentinel, or a checksum mismatch on the final record is
//! treated as a torn tail: the file is truncated back to the last complete
//! record and a warning is logged. A checksum mismatch on any earlier
//! record is corruption and fails the open.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use paxlog_consensus::{AcceptorLog, AcceptorSlot, Recovery, RecoveryError};
use paxlog_types::{Scn, Value};
use tracing::{debug, info, warn};

use crate::record::{LogRecord, framed_len};
use crate::StorageError;

/// Name of the log file inside the data directory.
pub const LOG_FILENAME: &str = "paxos.log";

/// Decided values kept in memory for answering lagging peers.
pub const DEFAULT_RETENTION: usize = 65_536;

/// Durable recovery base backed by `paxos.log`.
#[derive(Debug)]
pub struct FileRecovery {
    path: PathBuf,
    file: File,
    sync_writes: bool,
    size_bytes: u64,

    slots: BTreeMap<Scn, AcceptorSlot>,
    decided: BTreeMap<Scn, Value>,
    last_applied: Scn,
    retention: usize,
}

impl FileRecovery {
    /// Opens (or creates) the log in `dir` and replays it.
    pub fn open(dir: impl AsRef<Path>, sync_writes: bool) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILENAME);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut log = Self {
            path,
            file,
            sync_writes,
            size_bytes: 0,
            slots: BTreeMap::new(),
            decided: BTreeMap::new(),
            last_applied: Scn::ZERO,
            retention: DEFAULT_RETENTION,
        };

        let valid = log.replay(&data)?;
        if valid < data.len() {
            warn!(
                path = %log.path.display(),
                valid_bytes = valid,
                dropped_bytes = data.len() - valid,
                "truncating torn tail of paxos log"
            );
            log.file.set_len(valid as u64)?;
            log.file.sync_all()?;
        }
        log.file.seek(SeekFrom::End(0))?;
        log.size_bytes = valid as u64;

        info!(
            path = %log.path.display(),
            last_applied = %log.last_applied,
            slots = log.slots.len(),
            "paxos log opened"
        );
        Ok(log)
    }

    /// Sets how many decided values stay in memory.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self.trim_decided();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log file.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Number of acceptor slots held.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    // Returns the length of the valid prefix of `data`.
    fn replay(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        let mut pos = 0usize;
        while pos < data.len() {
            let rest = &data[pos..];
            let record = match LogRecord::from_bytes(rest, pos as u64) {
                Ok((record, used)) => {
                    pos += used;
                    record
                }
                Err(StorageError::UnexpectedEof | StorageError::TornWrite { .. }) => break,
                Err(StorageError::Corrupted { position }) => {
                    if framed_len(rest) == Some(rest.len()) {
                        break;
                    }
                    return Err(StorageError::Corrupted { position });
                }
                Err(e) => return Err(e),
            };
            self.replay_record(record)?;
        }
        Ok(pos)
    }

    fn replay_record(&mut self, record: LogRecord) -> Result<(), StorageError> {
        match record {
            LogRecord::Promise { scn, slot } | LogRecord::Accept { scn, slot } => {
                self.slots.insert(scn, slot);
            }
            LogRecord::Decide { scn, value } => {
                self.check_decide_order(scn)?;
                self.record_decided(scn, value);
            }
            LogRecord::Prune { scn } => {
                self.slots = self.slots.split_off(&scn.next());
            }
            LogRecord::Base { scn } => self.rebase(scn),
        }
        Ok(())
    }

    // A log only starts above zero after an explicit `Base` record.
    fn check_decide_order(&self, scn: Scn) -> Result<(), StorageError> {
        let expected = self.last_applied.next();
        if scn != expected {
            return Err(StorageError::DecideOutOfOrder {
                expected,
                found: scn,
            });
        }
        Ok(())
    }

    fn record_decided(&mut self, scn: Scn, value: Value) {
        self.decided.insert(scn, value);
        self.last_applied = scn;
        self.trim_decided();
    }

    fn rebase(&mut self, scn: Scn) {
        self.decided.retain(|s, _| *s <= scn);
        self.last_applied = scn;
    }

    fn trim_decided(&mut self) {
        while self.decided.len() > self.retention {
            self.decided.pop_first();
        }
    }

    fn append(&mut self, record: &LogRecord) -> Result<(), StorageError> {
        let bytes = record.to_bytes()?;
        self.file.write_all(&bytes)?;
        if self.sync_writes {
            self.file.sync_all()?;
        }
        self.size_bytes += bytes.len() as u64;
        debug!(record = %record, size_bytes = self.size_bytes, "paxos log append");
        Ok(())
    }
}

impl Recovery for FileRecovery {
    fn apply_decided(&mut self, scn: Scn, value: &Value) -> Result<(), RecoveryError> {
        self.check_decide_order(scn).map_err(|e| match e {
            StorageError::DecideOutOfOrder { expected, found } => RecoveryError::OutOfOrder {
                expected,
                got: found,
            },
            other => other.into(),
        })?;
        self.append(&LogRecord::Decide {
            scn,
            value: value.clone(),
        })?;
        self.record_decided(scn, value.clone());
        Ok(())
    }

    fn last_applied_scn(&self) -> Scn {
        self.last_applied
    }

    fn set_scn(&mut self, scn: Scn) -> Result<(), RecoveryError> {
        self.append(&LogRecord::Base { scn })?;
        info!(path = %self.path.display(), scn = %scn, previous = %self.last_applied, "paxos log rebased");
        self.rebase(scn);
        Ok(())
    }

    fn decided_value(&self, scn: Scn) -> Option<Value> {
        self.decided.get(&scn).cloned()
    }
}

impl AcceptorLog for FileRecovery {
    fn load_slot(&self, scn: Scn) -> Result<Option<AcceptorSlot>, RecoveryError> {
        Ok(self.slots.get(&scn).cloned())
    }

    fn store_slot(&mut self, scn: Scn, slot: &AcceptorSlot) -> Result<(), RecoveryError> {
        self.append(&LogRecord::for_slot(scn, slot.clone()))?;
        self.slots.insert(scn, slot.clone());
        Ok(())
    }

    fn prune_through(&mut self, scn: Scn) -> Result<(), RecoveryError> {
        if self.slots.range(..=scn).next().is_none() {
            return Ok(());
        }
        self.append(&LogRecord::Prune { scn })?;
        self.slots = self.slots.split_off(&scn.next());
        Ok(())
    }
}

/// Reads every complete record of the log at `path`.
///
/// A torn tail ends the listing without an error. The file is not modified.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<LogRecord>, StorageError> {
    let data = fs::read(path)?;
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        match LogRecord::from_bytes(&data[pos..], pos as u64) {
            Ok((record, used)) => {
                records.push(record);
                pos += used;
            }
            Err(StorageError::UnexpectedEof | StorageError::TornWrite { .. }) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}
