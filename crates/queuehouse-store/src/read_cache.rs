//! Read Descriptor Cache
//!
//! Delivering a message means a positional read from a (usually
//! non-current) segment. Opening a descriptor per read would thrash the
//! fd table, so read handles are kept in an LRU cache bounded by descriptor
//! count; evicted handles close on drop.
//!
//! The compactor evicts both participants before combining two files so no
//! stale handle can observe a half-rewritten segment, and segment deletion
//! evicts as well.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use tokio::fs::File;
use tracing::debug;

use crate::error::Result;
use crate::segment::segment_path;

/// LRU of open read descriptors, keyed by segment number.
pub struct ReadHandleCache {
    dir: PathBuf,
    handles: LruCache<u64, File>,
    opens: u64,
    hits: u64,
}

impl ReadHandleCache {
    pub fn new<P: AsRef<Path>>(dir: P, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            dir: dir.as_ref().to_path_buf(),
            handles: LruCache::new(capacity),
            opens: 0,
            hits: 0,
        }
    }

    /// Borrow the read handle for a segment, opening it on a miss. The LRU
    /// silently drops (closes) the coldest handle when full.
    pub async fn handle(&mut self, segment: u64) -> Result<&mut File> {
        if self.handles.contains(&segment) {
            self.hits += 1;
        } else {
            let file = File::open(segment_path(&self.dir, segment)).await?;
            self.handles.put(segment, file);
            self.opens += 1;
            debug!(segment, "read handle opened");
        }
        // The entry was either just inserted or confirmed present.
        Ok(self.handles.get_mut(&segment).unwrap())
    }

    /// Close a segment's cached handle, if any.
    pub fn evict(&mut self, segment: u64) {
        self.handles.pop(&segment);
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn counters(&self) -> (u64, u64) {
        (self.hits, self.opens)
    }
}
