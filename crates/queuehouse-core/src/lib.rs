//! Queuehouse Core
//!
//! Shared building blocks for the Queuehouse message store:
//!
//! - **MessageId**: the fixed 16-byte message identifier
//! - **Record framing**: the byte-exact on-disk encoding of a message inside
//!   a segment file
//! - **Location types**: where a message lives on disk and how many queue
//!   references point at it, plus the backend trait the store swaps between
//!   in-memory and disk-resident implementations
//! - **Error**: the shared error type
//!
//! Everything here is pure data plumbing; file handling and the store state
//! machine live in `queuehouse-store`, the durable tables in
//! `queuehouse-index`.

pub mod error;
pub mod location;
pub mod message;
pub mod record;

pub use error::{Error, Result};
pub use location::{LocationIndex, MsgLocation};
pub use message::MessageId;
pub use record::{
    DecodedRecord, FRAME_OVERHEAD, MESSAGE_ID_LEN, TERMINATOR_PERSISTENT, TERMINATOR_TRANSIENT,
};
