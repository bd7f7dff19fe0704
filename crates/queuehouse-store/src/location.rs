//! Message Location Store
//!
//! The hot index from message id to `(segment, offset, size, ref_count,
//! persistent)`. Two backends implement the `LocationIndex` trait from
//! `queuehouse-core`:
//!
//! - [`MemoryLocationIndex`] here — a hash table, the low-latency default
//! - `SqliteLocationIndex` in `queuehouse-index` — the low-memory mode
//!
//! [`LocationStore`] owns whichever backend is active and performs the
//! runtime switch: copy every entry into the new backend, clear the old one,
//! flip the handle. The coordinator is the only caller, so the switch is
//! atomic with respect to every other store operation.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use tokio::sync::RwLock;
use tracing::info;

use queuehouse_core::{LocationIndex, MessageId, MsgLocation};
use queuehouse_index::SqliteLocationIndex;

use crate::config::StorageMode;
use crate::error::Result;

/// In-memory backend: a hash table behind a read-write lock.
#[derive(Default)]
pub struct MemoryLocationIndex {
    entries: RwLock<HashMap<MessageId, MsgLocation>>,
}

impl MemoryLocationIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocationIndex for MemoryLocationIndex {
    async fn get(&self, id: &MessageId) -> queuehouse_core::Result<Option<MsgLocation>> {
        Ok(self.entries.read().await.get(id).copied())
    }

    async fn insert(&self, id: MessageId, loc: MsgLocation) -> queuehouse_core::Result<()> {
        self.entries.write().await.insert(id, loc);
        Ok(())
    }

    async fn insert_new(&self, id: MessageId, loc: MsgLocation) -> queuehouse_core::Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(queuehouse_core::Error::DuplicateMessage(id));
        }
        entries.insert(id, loc);
        Ok(())
    }

    async fn delete(&self, id: &MessageId) -> queuehouse_core::Result<Option<MsgLocation>> {
        Ok(self.entries.write().await.remove(id))
    }

    async fn by_segment(&self, segment: u64) -> queuehouse_core::Result<Vec<(MessageId, MsgLocation)>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, loc)| loc.segment == segment)
            .map(|(id, loc)| (*id, *loc))
            .collect())
    }

    async fn all(&self) -> queuehouse_core::Result<Vec<(MessageId, MsgLocation)>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, loc)| (*id, *loc))
            .collect())
    }

    async fn len(&self) -> queuehouse_core::Result<u64> {
        Ok(self.entries.read().await.len() as u64)
    }

    async fn clear(&self) -> queuehouse_core::Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

/// The active location index plus the machinery to swap backends.
pub struct LocationStore {
    backend: Box<dyn LocationIndex>,
    mode: StorageMode,
    pool: SqlitePool,
}

impl LocationStore {
    /// Build the store in the requested starting mode. The disk table is
    /// recomputable, so it is truncated whenever it becomes active.
    pub async fn new(mode: StorageMode, pool: SqlitePool) -> Result<Self> {
        let backend: Box<dyn LocationIndex> = match mode {
            StorageMode::RamDisk => Box::new(MemoryLocationIndex::new()),
            StorageMode::DiskOnly => Box::new(SqliteLocationIndex::new(pool.clone()).await?),
        };
        Ok(Self { backend, mode, pool })
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Switch backends: copy all entries, delete the source, flip.
    /// Returns `false` when already in the requested mode.
    pub async fn set_mode(&mut self, mode: StorageMode) -> Result<bool> {
        if mode == self.mode {
            return Ok(false);
        }

        let entries = self.backend.all().await?;
        let new_backend: Box<dyn LocationIndex> = match mode {
            StorageMode::RamDisk => Box::new(MemoryLocationIndex::new()),
            StorageMode::DiskOnly => {
                Box::new(SqliteLocationIndex::new(self.pool.clone()).await?)
            }
        };
        let copied = entries.len();
        for (id, loc) in entries {
            new_backend.insert(id, loc).await?;
        }
        self.backend.clear().await?;
        self.backend = new_backend;
        self.mode = mode;

        info!(?mode, copied, "location index backend switched");
        Ok(true)
    }

    /// Bulk load (recovery).
    pub async fn load(&self, entries: Vec<(MessageId, MsgLocation)>) -> Result<()> {
        for (id, loc) in entries {
            self.backend.insert_new(id, loc).await?;
        }
        Ok(())
    }

    pub async fn get(&self, id: &MessageId) -> Result<Option<MsgLocation>> {
        Ok(self.backend.get(id).await?)
    }

    pub async fn insert(&self, id: MessageId, loc: MsgLocation) -> Result<()> {
        Ok(self.backend.insert(id, loc).await?)
    }

    pub async fn insert_new(&self, id: MessageId, loc: MsgLocation) -> Result<()> {
        Ok(self.backend.insert_new(id, loc).await?)
    }

    pub async fn delete(&self, id: &MessageId) -> Result<Option<MsgLocation>> {
        Ok(self.backend.delete(id).await?)
    }

    pub async fn by_segment(&self, segment: u64) -> Result<Vec<(MessageId, MsgLocation)>> {
        Ok(self.backend.by_segment(segment).await?)
    }

    pub async fn len(&self) -> Result<u64> {
        Ok(self.backend.len().await?)
    }
}
