//! Store Error Types
//!
//! ## Error Categories
//!
//! ### Corruption
//! - `CorruptSegment`: a record failed framing verification on an online
//!   read. Fatal for that message; the recovery scan instead skips over bad
//!   frames.
//!
//! ### Consistency
//! - `UnknownMessage`: a queue row pointed at a message the location index
//!   does not know (should not happen outside crash windows, which recovery
//!   repairs)
//!
//! ### Durability
//! - `Sync`: an fsync failed; broadcast to every deferred commit waiter
//!
//! ### Lifecycle
//! - `Stopped`: the coordinator task is gone (channel closed)
//!
//! All public operations return `Result<T>`, aliased to
//! `Result<T, StoreError>`.

use thiserror::Error;

use queuehouse_core::MessageId;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] queuehouse_core::Error),

    #[error("index error: {0}")]
    Index(#[from] queuehouse_index::IndexError),

    #[error("corrupt segment {segment} at offset {offset}: {reason}")]
    CorruptSegment {
        segment: u64,
        offset: u64,
        reason: String,
    },

    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("message already cached: {0}")]
    AlreadyCached(MessageId),

    #[error("sync failed: {0}")]
    Sync(String),

    #[error("store is stopped")]
    Stopped,
}
