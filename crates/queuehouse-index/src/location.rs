//! Disk-Resident Location Backend
//!
//! Low-memory-mode implementation of the `LocationIndex` trait: the message
//! location map lives in the `msg_locations` table instead of a hash table.
//! Point lookups go through SQLite's primary key index; `by_segment` uses
//! the secondary index and only runs during compaction and recovery.
//!
//! The table is recomputable from segment scans plus the queue-entry table,
//! so it carries no durability obligation: the store truncates it when the
//! backend is constructed.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use queuehouse_core::{Error, LocationIndex, MessageId, MsgLocation, Result};

/// `LocationIndex` backed by the shared SQLite pool.
pub struct SqliteLocationIndex {
    pool: SqlitePool,
}

impl SqliteLocationIndex {
    /// Wrap the shared pool, truncating any stale contents.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let index = Self { pool };
        index.clear().await?;
        Ok(index)
    }

    fn backend_err(err: sqlx::Error) -> Error {
        Error::Backend(err.to_string())
    }
}

fn row_to_location(row: &sqlx::sqlite::SqliteRow) -> Result<MsgLocation> {
    let segment: i64 = row.get("segment");
    let offset: i64 = row.get("byte_offset");
    let size: i64 = row.get("size");
    let ref_count: i64 = row.get("ref_count");
    let persistent: i64 = row.get("persistent");
    Ok(MsgLocation {
        segment: segment as u64,
        offset: offset as u64,
        size: size as u64,
        ref_count: ref_count as u64,
        persistent: persistent != 0,
    })
}

#[async_trait]
impl LocationIndex for SqliteLocationIndex {
    async fn get(&self, id: &MessageId) -> Result<Option<MsgLocation>> {
        let row = sqlx::query(
            "SELECT segment, byte_offset, size, ref_count, persistent \
             FROM msg_locations WHERE msg_id = ?",
        )
        .bind(id.to_vec())
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        row.as_ref().map(row_to_location).transpose()
    }

    async fn insert(&self, id: MessageId, loc: MsgLocation) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO msg_locations \
             (msg_id, segment, byte_offset, size, ref_count, persistent) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_vec())
        .bind(loc.segment as i64)
        .bind(loc.offset as i64)
        .bind(loc.size as i64)
        .bind(loc.ref_count as i64)
        .bind(loc.persistent as i64)
        .execute(&self.pool)
        .await
        .map_err(Self::backend_err)?;
        Ok(())
    }

    async fn insert_new(&self, id: MessageId, loc: MsgLocation) -> Result<()> {
        if self.get(&id).await?.is_some() {
            return Err(Error::DuplicateMessage(id));
        }
        self.insert(id, loc).await
    }

    async fn delete(&self, id: &MessageId) -> Result<Option<MsgLocation>> {
        let prior = self.get(id).await?;
        if prior.is_some() {
            sqlx::query("DELETE FROM msg_locations WHERE msg_id = ?")
                .bind(id.to_vec())
                .execute(&self.pool)
                .await
                .map_err(Self::backend_err)?;
        }
        Ok(prior)
    }

    async fn by_segment(&self, segment: u64) -> Result<Vec<(MessageId, MsgLocation)>> {
        let rows = sqlx::query(
            "SELECT msg_id, segment, byte_offset, size, ref_count, persistent \
             FROM msg_locations WHERE segment = ?",
        )
        .bind(segment as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("msg_id");
                Ok((MessageId::from_slice(&blob)?, row_to_location(row)?))
            })
            .collect()
    }

    async fn all(&self) -> Result<Vec<(MessageId, MsgLocation)>> {
        let rows = sqlx::query(
            "SELECT msg_id, segment, byte_offset, size, ref_count, persistent FROM msg_locations",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("msg_id");
                Ok((MessageId::from_slice(&blob)?, row_to_location(row)?))
            })
            .collect()
    }

    async fn len(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM msg_locations")
            .fetch_one(&self.pool)
            .await
            .map_err(Self::backend_err)?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM msg_locations")
            .execute(&self.pool)
            .await
            .map_err(Self::backend_err)?;
        Ok(())
    }
}
