//! SQLite Queue-Entry Table
//!
//! `QueueIndex` is the durable half of the queue sequence index: one row per
//! `(queue, seq)` position, plus the queue registry. The in-memory
//! `(read_seq, write_seq)` counters live in the store crate; this type only
//! guarantees that what it acknowledges is on disk and that multi-row
//! operations (`tx_commit`, `purge`, `requeue`) are atomic.
//!
//! ## Connection Pool
//!
//! File-backed databases get a small pool. In-memory databases are pinned to
//! a single connection: every `sqlite::memory:` connection is its own
//! database, so a wider pool would scatter the schema.
//!
//! ## Recovery Helpers
//!
//! The store's recovery protocol folds over this table to rebuild its
//! in-memory indexes: `refcounts` (live reference counts per message),
//! `sweep_dead_entries` (drop rows whose message did not survive the crash),
//! `seq_bounds` and `compact_gaps` (rebuild dense per-queue sequences).

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use queuehouse_core::MessageId;

use crate::error::Result;
use crate::types::{QueueEntry, RequeueMove};

/// Durable `(queue, seq) -> (msg_id, delivered)` table.
pub struct QueueIndex {
    pool: SqlitePool,
}

impl QueueIndex {
    /// Open (or create) a file-backed index database.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!(path = %path.as_ref().display(), "queue index opened");
        Ok(Self { pool })
    }

    /// In-memory database for tests. Pinned to one connection.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Shared pool handle, used by the disk-resident location backend.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    // ------------------------------------------------------------------
    // Queue registry
    // ------------------------------------------------------------------

    /// Register a queue. Re-declaring an existing queue is a no-op and does
    /// not change its durability.
    pub async fn declare_queue(&self, queue: &str, durable: bool) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO queues (name, durable) VALUES (?, ?)")
            .bind(queue)
            .bind(durable as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn queue_names(&self) -> Result<Vec<(String, bool)>> {
        let rows = sqlx::query_as::<_, (String, i64)>("SELECT name, durable FROM queues")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, durable)| (name, durable != 0))
            .collect())
    }

    /// Drop every non-durable queue and its rows. Returns the dropped names.
    pub async fn drop_transient_queues(&self) -> Result<Vec<String>> {
        let names: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM queues WHERE durable = 0")
                .fetch_all(&self.pool)
                .await?;

        let mut tx = self.pool.begin().await?;
        for (name,) in &names {
            sqlx::query("DELETE FROM queue_entries WHERE queue = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM queues WHERE durable = 0")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(names.into_iter().map(|(n,)| n).collect())
    }

    // ------------------------------------------------------------------
    // Row operations
    // ------------------------------------------------------------------

    pub async fn insert_entry(
        &self,
        queue: &str,
        seq: u64,
        msg_id: &MessageId,
        delivered: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue_entries (queue, seq, msg_id, delivered) VALUES (?, ?, ?, ?)",
        )
        .bind(queue)
        .bind(seq as i64)
        .bind(msg_id.to_vec())
        .bind(delivered as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_entry(&self, queue: &str, seq: u64) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(
            "SELECT msg_id, delivered FROM queue_entries WHERE queue = ? AND seq = ?",
        )
        .bind(queue)
        .bind(seq as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let msg_id: Vec<u8> = row.get(0);
                let delivered: i64 = row.get(1);
                Ok(Some(QueueEntry {
                    queue: queue.to_string(),
                    seq,
                    msg_id: MessageId::from_slice(&msg_id)?,
                    delivered: delivered != 0,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn mark_delivered(&self, queue: &str, seq: u64) -> Result<()> {
        sqlx::query("UPDATE queue_entries SET delivered = 1 WHERE queue = ? AND seq = ?")
            .bind(queue)
            .bind(seq as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete one row (ack). Returns whether a row existed.
    pub async fn delete_entry(&self, queue: &str, seq: u64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE queue = ? AND seq = ?")
            .bind(queue)
            .bind(seq as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically insert the published rows and delete the acked rows of one
    /// transaction commit.
    pub async fn tx_commit(
        &self,
        queue: &str,
        publishes: &[(MessageId, u64, bool)],
        ack_seqs: &[u64],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (msg_id, seq, delivered) in publishes {
            sqlx::query(
                "INSERT INTO queue_entries (queue, seq, msg_id, delivered) VALUES (?, ?, ?, ?)",
            )
            .bind(queue)
            .bind(*seq as i64)
            .bind(msg_id.to_vec())
            .bind(*delivered as i64)
            .execute(&mut *tx)
            .await?;
        }
        for seq in ack_seqs {
            sqlx::query("DELETE FROM queue_entries WHERE queue = ? AND seq = ?")
                .bind(queue)
                .bind(*seq as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(
            queue,
            published = publishes.len(),
            acked = ack_seqs.len(),
            "tx committed"
        );
        Ok(())
    }

    /// Move rows to new sequence numbers in one transaction.
    ///
    /// New sequences must not collide with surviving rows; the store always
    /// moves rows to fresh tail positions so this holds by construction.
    pub async fn requeue(&self, queue: &str, moves: &[RequeueMove]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for mv in moves {
            match mv.delivered {
                Some(flag) => {
                    sqlx::query(
                        "UPDATE queue_entries SET seq = ?, delivered = ? \
                         WHERE queue = ? AND seq = ?",
                    )
                    .bind(mv.new_seq as i64)
                    .bind(flag as i64)
                    .bind(queue)
                    .bind(mv.old_seq as i64)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "UPDATE queue_entries SET seq = ? WHERE queue = ? AND seq = ?",
                    )
                    .bind(mv.new_seq as i64)
                    .bind(queue)
                    .bind(mv.old_seq as i64)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete all rows of a queue, returning the message ids that were
    /// referenced (one per row, duplicates included) so the caller can
    /// release references.
    pub async fn purge(&self, queue: &str) -> Result<Vec<MessageId>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(Vec<u8>,)> =
            sqlx::query_as("SELECT msg_id FROM queue_entries WHERE queue = ?")
                .bind(queue)
                .fetch_all(&mut *tx)
                .await?;
        sqlx::query("DELETE FROM queue_entries WHERE queue = ?")
            .bind(queue)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        rows.into_iter()
            .map(|(blob,)| MessageId::from_slice(&blob).map_err(Into::into))
            .collect()
    }

    /// Purge plus removal of the registry row.
    pub async fn delete_queue(&self, queue: &str) -> Result<Vec<MessageId>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(Vec<u8>,)> =
            sqlx::query_as("SELECT msg_id FROM queue_entries WHERE queue = ?")
                .bind(queue)
                .fetch_all(&mut *tx)
                .await?;
        sqlx::query("DELETE FROM queue_entries WHERE queue = ?")
            .bind(queue)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queues WHERE name = ?")
            .bind(queue)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        rows.into_iter()
            .map(|(blob,)| MessageId::from_slice(&blob).map_err(Into::into))
            .collect()
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// All rows of one queue in ascending sequence order.
    pub async fn entries(&self, queue: &str) -> Result<Vec<QueueEntry>> {
        let rows: Vec<(i64, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT seq, msg_id, delivered FROM queue_entries WHERE queue = ? ORDER BY seq",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(seq, blob, delivered)| {
                Ok(QueueEntry {
                    queue: queue.to_string(),
                    seq: seq as u64,
                    msg_id: MessageId::from_slice(&blob)?,
                    delivered: delivered != 0,
                })
            })
            .collect()
    }

    pub async fn entry_count(&self, queue: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_entries WHERE queue = ?")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Every row in the table, all queues. Recovery only.
    pub async fn all_entries(&self) -> Result<Vec<QueueEntry>> {
        let rows: Vec<(String, i64, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT queue, seq, msg_id, delivered FROM queue_entries ORDER BY queue, seq",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(queue, seq, blob, delivered)| {
                Ok(QueueEntry {
                    queue,
                    seq: seq as u64,
                    msg_id: MessageId::from_slice(&blob)?,
                    delivered: delivered != 0,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Recovery helpers
    // ------------------------------------------------------------------

    /// Reference count per message id: how many rows point at it across all
    /// queues.
    pub async fn refcounts(&self) -> Result<Vec<(MessageId, u64)>> {
        let rows: Vec<(Vec<u8>, i64)> =
            sqlx::query_as("SELECT msg_id, COUNT(*) FROM queue_entries GROUP BY msg_id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(blob, count)| Ok((MessageId::from_slice(&blob)?, count as u64)))
            .collect()
    }

    /// Delete every row whose message id is not in the live set. Returns the
    /// number of rows removed.
    pub async fn sweep_dead_entries(&self, live: &HashSet<MessageId>) -> Result<u64> {
        let rows: Vec<(String, i64, Vec<u8>)> =
            sqlx::query_as("SELECT queue, seq, msg_id FROM queue_entries")
                .fetch_all(&self.pool)
                .await?;

        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for (queue, seq, blob) in rows {
            let id = MessageId::from_slice(&blob)?;
            if !live.contains(&id) {
                sqlx::query("DELETE FROM queue_entries WHERE queue = ? AND seq = ?")
                    .bind(&queue)
                    .bind(seq)
                    .execute(&mut *tx)
                    .await?;
                removed += 1;
            }
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// `(min, max)` sequence present for a queue, or `None` when empty.
    pub async fn seq_bounds(&self, queue: &str) -> Result<Option<(u64, u64)>> {
        let row: Option<(Option<i64>, Option<i64>)> =
            sqlx::query_as("SELECT MIN(seq), MAX(seq) FROM queue_entries WHERE queue = ?")
                .bind(queue)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match row {
            Some((Some(min), Some(max))) => Some((min as u64, max as u64)),
            _ => None,
        })
    }

    /// Close sequence gaps left by a crash: shift rows so sequences are
    /// dense starting at the current minimum. Returns the resulting
    /// `(read_seq, write_seq)`, or `None` for an empty queue.
    ///
    /// Rows only ever move to lower sequences, so updating in ascending
    /// order cannot collide with a not-yet-moved row.
    pub async fn compact_gaps(&self, queue: &str) -> Result<Option<(u64, u64)>> {
        let seqs: Vec<(i64,)> =
            sqlx::query_as("SELECT seq FROM queue_entries WHERE queue = ? ORDER BY seq")
                .bind(queue)
                .fetch_all(&self.pool)
                .await?;

        if seqs.is_empty() {
            return Ok(None);
        }

        let base = seqs[0].0;
        let mut tx = self.pool.begin().await?;
        for (i, (old,)) in seqs.iter().enumerate() {
            let new = base + i as i64;
            if new != *old {
                sqlx::query("UPDATE queue_entries SET seq = ? WHERE queue = ? AND seq = ?")
                    .bind(new)
                    .bind(queue)
                    .bind(*old)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        Ok(Some((base as u64, base as u64 + seqs.len() as u64)))
    }

    /// Destructive shutdown: wipe every table.
    pub async fn obliterate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue_entries").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM queues").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM msg_locations").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
