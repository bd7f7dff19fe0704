//! Segment Record Framing
//!
//! This module implements the byte-exact encoding of a message inside a
//! segment file.
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────────────┬────────────┬──────────┬───────────┬────────────┐
//! │ total_size   │ id_size    │ id bytes │ payload   │ terminator │
//! │ (8 bytes BE) │(8 bytes BE)│(16 bytes)│ (N bytes) │ (1 byte)   │
//! └──────────────┴────────────┴──────────┴───────────┴────────────┘
//! ```
//!
//! - `total_size = id_size + payload_len`
//! - terminator `0xFE` marks a persistent message, `0xFF` a transient one
//! - framing overhead is therefore a fixed 17 bytes per record (two length
//!   prefixes plus the terminator)
//!
//! The terminator byte doubles as a write barrier: a record whose terminator
//! is missing or unknown was torn mid-write and is treated as garbage by the
//! recovery scan. The `size` the rest of the system tracks for a message is
//! `total_size`, i.e. excluding the 17 framing bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::MessageId;

/// Fixed framing overhead per record: two u64 length prefixes + terminator.
pub const FRAME_OVERHEAD: u64 = 17;

/// Length of the embedded message id.
pub const MESSAGE_ID_LEN: u64 = 16;

/// Terminator byte for persistent messages.
pub const TERMINATOR_PERSISTENT: u8 = 0xFE;

/// Terminator byte for transient messages.
pub const TERMINATOR_TRANSIENT: u8 = 0xFF;

/// A record decoded from a segment frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub id: MessageId,
    pub payload: Bytes,
    pub persistent: bool,
    /// `id_size + payload_len`, excluding framing.
    pub total_size: u64,
}

/// Size on disk of a record carrying `payload_len` payload bytes,
/// including framing.
pub fn frame_len(payload_len: u64) -> u64 {
    MESSAGE_ID_LEN + payload_len + FRAME_OVERHEAD
}

/// The `total_size` prefix value for a record carrying `payload_len`
/// payload bytes.
pub fn body_len(payload_len: u64) -> u64 {
    MESSAGE_ID_LEN + payload_len
}

/// Encode a record into its on-disk frame.
pub fn encode(id: &MessageId, payload: &[u8], persistent: bool) -> Bytes {
    let total_size = body_len(payload.len() as u64);
    let mut buf = BytesMut::with_capacity((total_size + FRAME_OVERHEAD) as usize);
    buf.put_u64(total_size);
    buf.put_u64(MESSAGE_ID_LEN);
    buf.put_slice(id.as_bytes());
    buf.put_slice(payload);
    buf.put_u8(if persistent {
        TERMINATOR_PERSISTENT
    } else {
        TERMINATOR_TRANSIENT
    });
    buf.freeze()
}

/// Read the two length prefixes from the start of a frame.
///
/// Returns `(total_size, id_size)`. The caller is responsible for having at
/// least 16 bytes in `header`.
pub fn read_prefixes(header: &[u8]) -> (u64, u64) {
    let total_size = u64::from_be_bytes(header[0..8].try_into().expect("8-byte slice"));
    let id_size = u64::from_be_bytes(header[8..16].try_into().expect("8-byte slice"));
    (total_size, id_size)
}

/// Decode a complete frame (prefixes, body, terminator).
///
/// Any inconsistency between the prefixes, the buffer length, or the
/// terminator is a framing error: for online reads that means the segment is
/// corrupt at this location, for the recovery scan it means "skip".
pub fn decode(frame: &[u8]) -> Result<DecodedRecord> {
    if frame.len() < FRAME_OVERHEAD as usize {
        return Err(Error::CorruptFrame("frame shorter than framing overhead"));
    }
    let (total_size, id_size) = read_prefixes(frame);
    if total_size == 0 || id_size == 0 {
        return Err(Error::CorruptFrame("zero length prefix"));
    }
    if id_size != MESSAGE_ID_LEN {
        return Err(Error::CorruptFrame("unexpected id size"));
    }
    if id_size > total_size {
        return Err(Error::CorruptFrame("id size exceeds total size"));
    }
    if frame.len() as u64 != total_size + FRAME_OVERHEAD {
        return Err(Error::CorruptFrame("frame length does not match prefix"));
    }
    let id_start = 16;
    let id_end = id_start + id_size as usize;
    let payload_end = 16 + total_size as usize;
    let id = MessageId::from_slice(&frame[id_start..id_end])?;
    let payload = Bytes::copy_from_slice(&frame[id_end..payload_end]);
    let persistent = match frame[payload_end] {
        TERMINATOR_PERSISTENT => true,
        TERMINATOR_TRANSIENT => false,
        _ => return Err(Error::CorruptFrame("unknown terminator byte")),
    };
    Ok(DecodedRecord {
        id,
        payload,
        persistent,
        total_size,
    })
}
