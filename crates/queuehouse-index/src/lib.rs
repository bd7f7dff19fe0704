//! Queuehouse Durable Index
//!
//! This crate owns everything that lives in SQLite:
//!
//! - the **queue-entry table**: one row per `(queue, seq)` position mapping
//!   to `(msg_id, delivered)`, plus a small queue registry carrying the
//!   durability flag
//! - the **disk-resident location backend**: the low-memory-mode
//!   implementation of the `LocationIndex` trait from `queuehouse-core`
//!
//! ## Why SQLite?
//!
//! The store needs a crash-safe transactional table with multi-row atomicity
//! for `tx_commit`, `purge` and `requeue`. An embedded SQLite database gives
//! exactly that with zero configuration, and the recovery protocol only ever
//! folds over it sequentially, so query sophistication is not a concern.
//!
//! All access goes through a `SqlitePool`; multi-row operations run inside a
//! single transaction so a crash can never expose a half-applied commit.
//!
//! ## Usage
//!
//! ```ignore
//! use queuehouse_index::QueueIndex;
//!
//! let index = QueueIndex::open("data/queue-index.db").await?;
//! index.declare_queue("orders", true).await?;
//! index.insert_entry("orders", 0, &msg_id, false).await?;
//! ```

pub mod error;
pub mod location;
pub mod store;
pub mod types;

pub use error::{IndexError, Result};
pub use location::SqliteLocationIndex;
pub use store::QueueIndex;
pub use types::{QueueEntry, RequeueMove};
