//! Error Types Shared Across Queuehouse Crates
//!
//! ## Error Categories
//!
//! ### Data Integrity Errors
//! - `CorruptFrame`: a segment record failed framing verification (length
//!   prefixes inconsistent or unknown terminator byte)
//! - `InvalidMessageId`: an identifier blob was not exactly 16 bytes
//!
//! ### Programming Errors
//! - `DuplicateMessage`: `insert_new` hit an identifier that is already
//!   indexed
//!
//! ### Backend Errors
//! - `Backend`: a location-index backend failed (the disk-resident backend
//!   wraps its database errors here so the trait stays backend-agnostic)
//!
//! All fallible functions in this crate return `Result<T>`, aliased to
//! `Result<T, Error>`, so callers propagate with `?`.

use thiserror::Error;

use crate::message::MessageId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message id length: {0} (expected 16)")]
    InvalidMessageId(usize),

    #[error("corrupt record frame: {0}")]
    CorruptFrame(&'static str),

    #[error("duplicate message id: {0}")]
    DuplicateMessage(MessageId),

    #[error("location backend error: {0}")]
    Backend(String),
}
