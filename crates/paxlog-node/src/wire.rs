//! Frame format for peer links.
//!
//! Frame format: `[magic:4][length:4][payload:N][checksum:4]`
//!
//! - **magic**: [`FRAME_MAGIC`], little-endian
//! - **length**: payload size in bytes, little-endian
//! - **payload**: postcard-encoded [`WireMessage`]
//! - **checksum**: CRC32 of the payload
//!
//! A bad magic or checksum poisons the whole connection: the reader drops
//! the link instead of trying to resynchronize.

use bytes::{Buf, BufMut, BytesMut};
use paxlog_consensus::Message;
use paxlog_types::{PeerId, crc32};
use serde::{Deserialize, Serialize};

use crate::WireError;

pub const FRAME_MAGIC: u32 = 0x5058_4C47;

/// Header size: 4 (magic) + 4 (length).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Trailer size: 4 (checksum).
pub const FRAME_TRAILER_SIZE: usize = 4;

/// Maximum payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Everything that travels on a peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First frame on every outbound link: who is dialing.
    Hello { peer: PeerId },
    Paxos(Message),
}

/// Appends one framed message to `dst`.
pub fn encode(msg: &WireMessage, dst: &mut BytesMut) -> Result<(), WireError> {
    let payload = postcard::to_allocvec(msg)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: payload.len() });
    }

    dst.reserve(FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE);
    dst.put_u32_le(FRAME_MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(&payload);
    dst.put_u32_le(crc32(&payload));
    Ok(())
}

/// Removes one complete frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a complete frame.
pub fn decode(src: &mut BytesMut) -> Result<Option<WireMessage>, WireError> {
    if src.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let magic = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    if magic != FRAME_MAGIC {
        return Err(WireError::BadMagic { found: magic });
    }
    let length = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: length });
    }

    let total = FRAME_HEADER_SIZE + length + FRAME_TRAILER_SIZE;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(FRAME_HEADER_SIZE);
    let payload = src.split_to(length);
    let expected = src.get_u32_le();
    let actual = crc32(&payload);
    if expected != actual {
        return Err(WireError::Checksum { expected, actual });
    }

    Ok(Some(postcard::from_bytes(&payload)?))
}
