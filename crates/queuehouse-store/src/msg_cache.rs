//! Message Payload Cache
//!
//! A byte-bounded LRU of recently read payloads, keyed by message id. A hit
//! on deliver avoids a positional file read entirely.
//!
//! Each entry carries its own reference count: the number of deliveries the
//! store still expects to fetch this payload. Messages whose location
//! refcount exceeds one are cached eagerly at publish time because they are
//! about to be delivered more than once. A fetch decrements the entry and
//! drops it at zero; a decrement for an id that is not cached is silently
//! ignored (the entry may have been evicted under byte pressure). Inserting
//! over an existing key, by contrast, can only be a bookkeeping bug and is
//! reported as an error.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;

use queuehouse_core::MessageId;

use crate::error::{Result, StoreError};

// Byte budget is the real bound; the entry bound just keeps the LRU finite.
const ENTRY_CAP: usize = 16 * 1024;

struct CacheEntry {
    payload: Bytes,
    refs: u64,
}

/// Cache statistics reported through `cache_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub entries: usize,
    pub bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Byte-bounded payload LRU.
pub struct MessageCache {
    entries: LruCache<MessageId, CacheEntry>,
    max_bytes: u64,
    current_bytes: u64,
    hits: u64,
    misses: u64,
}

impl MessageCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(ENTRY_CAP).unwrap()),
            max_bytes,
            current_bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Insert a payload with an expected fetch count. Zero-ref inserts and
    /// oversized payloads are dropped silently; an existing key is an
    /// error.
    pub fn insert(&mut self, id: MessageId, payload: Bytes, refs: u64) -> Result<()> {
        if self.entries.contains(&id) {
            return Err(StoreError::AlreadyCached(id));
        }
        if refs == 0 || payload.len() as u64 > self.max_bytes {
            return Ok(());
        }

        self.current_bytes += payload.len() as u64;
        self.entries.put(id, CacheEntry { payload, refs });
        self.evict_over_budget();
        Ok(())
    }

    /// Add expected fetches to an already-cached entry; ignored on a miss.
    pub fn add_refs(&mut self, id: &MessageId, refs: u64) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.refs += refs;
        }
    }

    /// Eager caching for a message that gained another reference: bump the
    /// cached entry if present, otherwise cache the payload with the full
    /// expected fetch count.
    pub fn share(&mut self, id: MessageId, payload: Bytes, refs_if_new: u64) {
        if self.entries.contains(&id) {
            self.add_refs(&id, 1);
        } else {
            // Key known absent, insert cannot fail.
            let _ = self.insert(id, payload, refs_if_new);
        }
    }

    /// Fetch a payload, consuming one expected delivery. The last expected
    /// fetch removes the entry.
    pub fn fetch(&mut self, id: &MessageId) -> Option<Bytes> {
        match self.entries.get_mut(id) {
            Some(entry) if entry.refs > 1 => {
                entry.refs -= 1;
                self.hits += 1;
                return Some(entry.payload.clone());
            }
            Some(_) => {}
            None => {
                self.misses += 1;
                return None;
            }
        }
        // Last expected fetch: hand the entry out and drop it.
        self.hits += 1;
        let entry = self.entries.pop(id).unwrap();
        self.current_bytes -= entry.payload.len() as u64;
        Some(entry.payload)
    }

    /// Drop an entry regardless of its refs (message died).
    pub fn remove(&mut self, id: &MessageId) {
        if let Some(entry) = self.entries.pop(id) {
            self.current_bytes -= entry.payload.len() as u64;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_bytes = 0;
    }

    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            entries: self.entries.len(),
            bytes: self.current_bytes,
            max_bytes: self.max_bytes,
            hits: self.hits,
            misses: self.misses,
        }
    }

    fn evict_over_budget(&mut self) {
        while self.current_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, entry)) => {
                    self.current_bytes -= entry.payload.len() as u64;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_fetch_single_ref() {
        let mut cache = MessageCache::new(1024);
        let id = MessageId::random();
        cache.insert(id, Bytes::from_static(b"body"), 1).unwrap();

        assert_eq!(cache.fetch(&id), Some(Bytes::from_static(b"body")));
        // Entry consumed.
        assert_eq!(cache.fetch(&id), None);
        assert_eq!(cache.info().bytes, 0);
    }

    #[test]
    fn test_multi_ref_fetches() {
        let mut cache = MessageCache::new(1024);
        let id = MessageId::random();
        cache.insert(id, Bytes::from_static(b"shared"), 3).unwrap();

        assert!(cache.fetch(&id).is_some());
        assert!(cache.fetch(&id).is_some());
        assert!(cache.fetch(&id).is_some());
        assert!(cache.fetch(&id).is_none());
    }

    #[test]
    fn test_miss_is_permissive() {
        let mut cache = MessageCache::new(1024);
        assert!(cache.fetch(&MessageId::random()).is_none());
        assert_eq!(cache.info().misses, 1);
    }

    #[test]
    fn test_duplicate_insert_is_error() {
        let mut cache = MessageCache::new(1024);
        let id = MessageId::random();
        cache.insert(id, Bytes::from_static(b"a"), 2).unwrap();

        let err = cache.insert(id, Bytes::from_static(b"b"), 1).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyCached(_)));
    }

    #[test]
    fn test_byte_budget_eviction() {
        let mut cache = MessageCache::new(250);
        let a = MessageId::random();
        let b = MessageId::random();
        let c = MessageId::random();
        cache.insert(a, Bytes::from(vec![1u8; 100]), 2).unwrap();
        cache.insert(b, Bytes::from(vec![2u8; 100]), 2).unwrap();
        cache.insert(c, Bytes::from(vec![3u8; 100]), 2).unwrap();

        // a was coldest and fell out.
        assert!(cache.fetch(&a).is_none());
        assert!(cache.fetch(&b).is_some());
        assert!(cache.fetch(&c).is_some());
        assert!(cache.info().bytes <= 250);
    }

    #[test]
    fn test_oversized_payload_not_cached() {
        let mut cache = MessageCache::new(50);
        let id = MessageId::random();
        cache.insert(id, Bytes::from(vec![0u8; 100]), 2).unwrap();
        assert!(cache.fetch(&id).is_none());
    }

    #[test]
    fn test_zero_ref_insert_is_dropped() {
        let mut cache = MessageCache::new(1024);
        let id = MessageId::random();
        cache.insert(id, Bytes::from_static(b"x"), 0).unwrap();
        assert!(cache.fetch(&id).is_none());
        assert_eq!(cache.info().entries, 0);
    }

    #[test]
    fn test_add_refs() {
        let mut cache = MessageCache::new(1024);
        let id = MessageId::random();
        cache.insert(id, Bytes::from_static(b"x"), 1).unwrap();
        cache.add_refs(&id, 1);

        assert!(cache.fetch(&id).is_some());
        assert!(cache.fetch(&id).is_some());
        assert!(cache.fetch(&id).is_none());

        // add_refs on a missing id is ignored.
        cache.add_refs(&MessageId::random(), 5);
    }

    #[test]
    fn test_share_bumps_or_inserts() {
        let mut cache = MessageCache::new(1024);
        let id = MessageId::random();

        // Unknown id: inserted with the full expected fetch count.
        cache.share(id, Bytes::from_static(b"p"), 2);
        assert!(cache.fetch(&id).is_some());

        // Known id: one more expected fetch.
        cache.share(id, Bytes::from_static(b"p"), 2);
        assert!(cache.fetch(&id).is_some());
        assert!(cache.fetch(&id).is_some());
        assert!(cache.fetch(&id).is_none());
    }

    #[test]
    fn test_remove() {
        let mut cache = MessageCache::new(1024);
        let id = MessageId::random();
        cache.insert(id, Bytes::from_static(b"gone"), 5).unwrap();
        cache.remove(&id);
        assert!(cache.fetch(&id).is_none());
        assert_eq!(cache.info().bytes, 0);
    }
}
