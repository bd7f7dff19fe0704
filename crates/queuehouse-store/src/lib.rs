//! Queuehouse Store
//!
//! A persistent, reference-counted message store with online compaction,
//! backing a queueing server. Messages are written once to an append-only
//! segmented log; queues are logical sequences referencing stored messages
//! by id; references may be shared across queues; segments are combined and
//! garbage-collected as messages are acknowledged.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   commands    ┌──────────────────────────────┐
//! │ MessageStore  │ ────────────► │ Coordinator (single task)    │
//! │ (handle)      │ ◄──────────── │                              │
//! └───────────────┘   replies     │  SegmentAppender  ──► *.rdq  │
//!                                 │  LocationStore (RAM / disk)  │
//!                                 │  SummaryIndex + dirty set    │
//!                                 │  QueueSeqs                   │
//!                                 │  read / payload caches       │
//!                                 └──────────┬───────────────────┘
//!                                            │ rows
//!                                            ▼
//!                                 ┌──────────────────────────────┐
//!                                 │ QueueIndex (SQLite)          │
//!                                 │ (queue, seq) -> (msg, dlvd)  │
//!                                 └──────────────────────────────┘
//! ```
//!
//! All mutable state is owned by the coordinator task, so every public
//! operation is linearised. Durability is group-committed: appends buffer
//! in the current segment and an interval timer fsyncs, releasing any
//! `tx_commit` callers waiting on it. On startup the store recovers from
//! arbitrary crash points, including a crash in the middle of a compaction
//! combine.
//!
//! ## Usage
//!
//! ```ignore
//! use queuehouse_store::{MessageStore, StoreConfig};
//! use queuehouse_core::MessageId;
//! use bytes::Bytes;
//!
//! let config = StoreConfig {
//!     directory: "./data".into(),
//!     ..Default::default()
//! };
//! let (store, _task) = MessageStore::start(config).await?;
//!
//! let id = MessageId::random();
//! store.publish("orders", id, Bytes::from("payload"), true, false).await?;
//!
//! if let Some(delivery) = store.deliver("orders").await? {
//!     store.ack("orders", vec![(delivery.msg_id, delivery.seq)]).await?;
//! }
//!
//! store.stop().await?;
//! ```

pub mod compactor;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod location;
pub mod msg_cache;
pub mod read_cache;
pub mod recovery;
pub mod segment;
pub mod sequence;
pub mod summary;

pub use config::{StorageMode, StoreConfig};
pub use coordinator::{Delivery, MemoryReport, MessageStore, SegmentStat};
pub use error::{Result, StoreError};
pub use msg_cache::CacheInfo;
