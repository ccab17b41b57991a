//! Records of the paxos log.
//!
//! # Record Format
//!
//! ```text
//! [RECORD_START:u32][kind:u8][scn:u64][length:u32][payload:bytes][crc32:u32][RECORD_END:u32]
//!        4B            1B       8B        4B         variable        4B           4B
//! ```
//!
//! The checksum covers everything from `RECORD_START` through the payload.
//! A missing `RECORD_END` means the append was interrupted.

use std::fmt::{self, Display};

use paxlog_consensus::AcceptorSlot;
use paxlog_types::{Scn, Value, crc32};

use crate::StorageError;

// Magic number marking the start of a record.
const RECORD_START: u32 = 0x5041_584F;

// Magic number marking the end of a complete record.
const RECORD_END: u32 = 0x4C4F_4721;

// start_sentinel(4) + kind(1) + scn(8) + length(4)
const HEADER_SIZE: usize = 17;

// header + crc(4) + end_sentinel(4)
pub(crate) const RECORD_OVERHEAD: usize = HEADER_SIZE + 8;

const KIND_PROMISE: u8 = 1;
const KIND_ACCEPT: u8 = 2;
const KIND_DECIDE: u8 = 3;
const KIND_PRUNE: u8 = 4;
const KIND_BASE: u8 = 5;

/// One entry of the paxos log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Acceptor promised a ballot; nothing accepted yet at that ballot.
    Promise { scn: Scn, slot: AcceptorSlot },
    /// Acceptor accepted a value.
    Accept { scn: Scn, slot: AcceptorSlot },
    /// Value applied at `scn`.
    Decide { scn: Scn, value: Value },
    /// Acceptor slots at or below `scn` are no longer needed.
    Prune { scn: Scn },
    /// Apply position overridden; the next decision is for `scn + 1`.
    Base { scn: Scn },
}

impl LogRecord {
    /// The record kind for persisting an acceptor slot.
    pub fn for_slot(scn: Scn, slot: AcceptorSlot) -> Self {
        if slot.accepted.is_some() {
            Self::Accept { scn, slot }
        } else {
            Self::Promise { scn, slot }
        }
    }

    pub fn scn(&self) -> Scn {
        match self {
            Self::Promise { scn, .. }
            | Self::Accept { scn, .. }
            | Self::Decide { scn, .. }
            | Self::Prune { scn }
            | Self::Base { scn } => *scn,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Self::Promise { .. } => KIND_PROMISE,
            Self::Accept { .. } => KIND_ACCEPT,
            Self::Decide { .. } => KIND_DECIDE,
            Self::Prune { .. } => KIND_PRUNE,
            Self::Base { .. } => KIND_BASE,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Promise { .. } => "promise",
            Self::Accept { .. } => "accept",
            Self::Decide { .. } => "decide",
            Self::Prune { .. } => "prune",
            Self::Base { .. } => "base",
        }
    }

    /// Serializes the record, sentinels and checksum included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let payload = match self {
            Self::Promise { slot, .. } | Self::Accept { slot, .. } => postcard::to_allocvec(slot)?,
            Self::Decide { value, .. } => postcard::to_allocvec(value)?,
            Self::Prune { .. } | Self::Base { .. } => Vec::new(),
        };

        let mut buf = Vec::with_capacity(RECORD_OVERHEAD + payload.len());
        buf.extend_from_slice(&RECORD_START.to_le_bytes());
        buf.push(self.kind());
        buf.extend_from_slice(&self.scn().as_u64().to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&RECORD_END.to_le_bytes());
        Ok(buf)
    }

    /// Parses one record from the front of `data`, which starts at byte
    /// `position` of the file.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn from_bytes(data: &[u8], position: u64) -> Result<(Self, usize), StorageError> {
        if data.len() < HEADER_SIZE {
            return Err(StorageError::UnexpectedEof);
        }

        let start = read_u32(data, 0);
        if start != RECORD_START {
            return Err(StorageError::TornWrite {
                reason: format!("missing RECORD_START sentinel at byte {position}"),
            });
        }
        let kind = data[4];
        let scn = Scn::new(read_u64(data, 5));
        let length = read_u32(data, 13) as usize;

        let total = HEADER_SIZE + length + 8;
        if data.len() < total {
            return Err(StorageError::UnexpectedEof);
        }

        let crc_offset = HEADER_SIZE + length;
        let stored = read_u32(data, crc_offset);
        if stored != crc32(&data[..crc_offset]) {
            return Err(StorageError::Corrupted { position });
        }
        let end = read_u32(data, crc_offset + 4);
        if end != RECORD_END {
            return Err(StorageError::TornWrite {
                reason: format!("missing RECORD_END sentinel at byte {position}"),
            });
        }

        let payload = &data[HEADER_SIZE..crc_offset];
        let record = match kind {
            KIND_PROMISE => Self::Promise {
                scn,
                slot: postcard::from_bytes(payload)?,
            },
            KIND_ACCEPT => Self::Accept {
                scn,
                slot: postcard::from_bytes(payload)?,
            },
            KIND_DECIDE => Self::Decide {
                scn,
                value: postcard::from_bytes(payload)?,
            },
            KIND_PRUNE => Self::Prune { scn },
            KIND_BASE => Self::Base { scn },
            byte => return Err(StorageError::InvalidRecordKind { byte, position }),
        };
        Ok((record, total))
    }
}

/// Length the record at the front of `data` claims to occupy, if its
/// header is readable.
pub(crate) fn framed_len(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    Some(RECORD_OVERHEAD + read_u32(data, 13) as usize)
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Renders one record as a single human-readable line.
pub fn print_row(record: &LogRecord) -> String {
    record.to_string()
}

impl Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scn={} kind={}", self.scn(), self.kind_name())?;
        match self {
            Self::Promise { slot, .. } => write!(f, " ballot={}", slot.promised),
            Self::Accept { slot, .. } => {
                write!(f, " ballot={}", slot.promised)?;
                if let Some((b, v)) = &slot.accepted {
                    write!(f, " accepted={b} value={v}")?;
                }
                Ok(())
            }
            Self::Decide { value, .. } => write!(f, " value={value}"),
            Self::Prune { .. } | Self::Base { .. } => Ok(()),
        }
    }
}
