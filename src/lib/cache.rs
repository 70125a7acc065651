use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::record::Record;

/// A materialised record and the stream version it was folded up to. The
/// stream version can run ahead of `record.version` when the stream carries
/// events the fold ignores.
#[derive(Debug, Clone)]
pub struct CachedRecord {
    pub record: Record,
    pub stream_version: u64,
}

/// LRU of materialised records keyed by stream id.
pub struct RecordCache {
    inner: Mutex<LruCache<String, CachedRecord>>,
}

impl RecordCache {
    /// `None` when `capacity` is zero, which disables caching.
    pub fn new(capacity: usize) -> Option<Self> {
        NonZeroUsize::new(capacity).map(|size| Self {
            inner: Mutex::new(LruCache::new(size)),
        })
    }

    pub fn get(&self, stream_id: &str) -> Option<CachedRecord> {
        let mut guard = self.inner.lock();
        guard.get(stream_id).cloned()
    }

    /// Stores `entry` unless a fresher entry for the same stream is present.
    pub fn put(&self, stream_id: &str, entry: CachedRecord) {
        let mut guard = self.inner.lock();
        if let Some(existing) = guard.peek(stream_id) {
            if existing.stream_version > entry.stream_version {
                return;
            }
        }
        guard.put(stream_id.to_string(), entry);
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, stream_version: u64) -> CachedRecord {
        let mut record = Record::new("user", id);
        record.version = stream_version;
        CachedRecord {
            record,
            stream_version,
        }
    }

    #[test]
    fn zero_capacity_disables_cache() {
        assert!(RecordCache::new(0).is_none());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = RecordCache::new(2).unwrap();
        cache.put("user/1", entry("1", 1));
        cache.put("user/2", entry("2", 1));
        assert!(cache.get("user/1").is_some());
        cache.put("user/3", entry("3", 1));
        assert!(cache.get("user/2").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn stale_entries_do_not_replace_fresher_ones() {
        let cache = RecordCache::new(4).unwrap();
        cache.put("user/1", entry("1", 3));
        cache.put("user/1", entry("1", 2));
        assert_eq!(cache.get("user/1").unwrap().stream_version, 3);
        cache.clear();
        assert!(cache.is_empty());
    }
}
