//! Message Location Types
//!
//! A [`MsgLocation`] records where a live message sits on disk and how many
//! durable queue rows reference it. The map from [`MessageId`] to
//! [`MsgLocation`] is the store's hottest index, so it is kept behind the
//! [`LocationIndex`] trait with two interchangeable backends:
//!
//! - an in-memory hash table (low-latency mode), and
//! - a disk-resident table (low-memory mode).
//!
//! The store swaps backends at runtime by copying every entry across and
//! flipping the active handle; because all writes are serialised through the
//! store coordinator the swap is atomic from the caller's point of view.
//!
//! Invariant: an id is present if and only if `ref_count >= 1`. Reaching
//! zero deletes the entry and turns the record's byte range into a hole.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::MessageId;

/// Physical location and reference count of one live message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgLocation {
    /// Segment number the record lives in.
    pub segment: u64,

    /// Byte offset of the record frame within the segment.
    pub offset: u64,

    /// Record body size (`id_size + payload_len`, excluding the 17 framing
    /// bytes).
    pub size: u64,

    /// Number of durable queue rows referencing this message.
    pub ref_count: u64,

    /// Whether the message survives a restart.
    pub persistent: bool,
}

impl MsgLocation {
    /// Offset one past the record's terminator byte.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size + crate::record::FRAME_OVERHEAD
    }
}

/// Backend interface for the message location index.
///
/// `match_by_segment` style lookups (`by_segment`) are only used by the
/// compactor and recovery; steady-state traffic is point gets, inserts and
/// deletes.
#[async_trait]
pub trait LocationIndex: Send + Sync {
    async fn get(&self, id: &MessageId) -> Result<Option<MsgLocation>>;

    /// Insert or overwrite.
    async fn insert(&self, id: MessageId, loc: MsgLocation) -> Result<()>;

    /// Insert, failing with `Error::DuplicateMessage` if the id is already
    /// present.
    async fn insert_new(&self, id: MessageId, loc: MsgLocation) -> Result<()>;

    /// Remove an entry, returning what was stored.
    async fn delete(&self, id: &MessageId) -> Result<Option<MsgLocation>>;

    /// All entries located in the given segment.
    async fn by_segment(&self, segment: u64) -> Result<Vec<(MessageId, MsgLocation)>>;

    /// Every entry in the index. Used by the backend swap and recovery.
    async fn all(&self) -> Result<Vec<(MessageId, MsgLocation)>>;

    async fn len(&self) -> Result<u64>;

    async fn clear(&self) -> Result<()>;
}
