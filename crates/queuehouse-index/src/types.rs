//! Row Types for the Durable Queue Tables

use queuehouse_core::MessageId;

/// One row of the queue-entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub queue: String,
    pub seq: u64,
    pub msg_id: MessageId,
    pub delivered: bool,
}

/// A single row move applied by `requeue`.
///
/// `delivered: None` keeps the stored flag (the tail-rotation path);
/// `Some(flag)` rewrites it (the explicit-requeue path, where the caller
/// reports the entry's current delivery state).
#[derive(Debug, Clone, Copy)]
pub struct RequeueMove {
    pub old_seq: u64,
    pub new_seq: u64,
    pub delivered: Option<bool>,
}
