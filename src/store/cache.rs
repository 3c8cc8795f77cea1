//! Bounded write-back cache of page buffers.

use lru::LruCache;
use std::num::NonZeroUsize;

struct CacheEntry {
    data: Box<[u8]>,
    dirty: bool,
}

/// An LRU of page buffers sitting in front of the raw file store.
///
/// Dirty buffers are handed back to the caller on eviction and on
/// [`PageCache::take_dirty`]; the cache itself never touches the file.
pub struct PageCache {
    cache: LruCache<i64, CacheEntry>,
    capacity: usize,
}

impl PageCache {
    /// A cache bounded to `capacity` pages. `capacity` must be non-zero.
    pub fn new(capacity: usize) -> PageCache {
        // UNWRAP: capacity is validated by the options layer.
        let cap = NonZeroUsize::new(capacity).unwrap();
        PageCache {
            cache: LruCache::new(cap),
            capacity: capacity.max(1),
        }
    }

    /// Look up a page buffer, refreshing its LRU position.
    pub fn get(&mut self, index: i64) -> Option<&[u8]> {
        self.cache.get(&index).map(|e| &e.data[..])
    }

    /// Insert or replace a page buffer. Returns an evicted dirty buffer that
    /// the caller must write back, if any.
    pub fn put(&mut self, index: i64, data: Box<[u8]>, dirty: bool) -> Option<(i64, Box<[u8]>)> {
        if let Some(entry) = self.cache.get_mut(&index) {
            let dirty = dirty || entry.dirty;
            *entry = CacheEntry { data, dirty };
            return None;
        }

        let evicted = if self.cache.len() >= self.capacity {
            self.cache
                .pop_lru()
                .filter(|(_, e)| e.dirty)
                .map(|(i, e)| (i, e.data))
        } else {
            None
        };

        self.cache.put(index, CacheEntry { data, dirty });
        evicted
    }

    /// Drop a cached page without write-back.
    pub fn remove(&mut self, index: i64) {
        self.cache.pop(&index);
    }

    /// Clone out every dirty buffer and mark it clean.
    pub fn take_dirty(&mut self) -> Vec<(i64, Box<[u8]>)> {
        let mut dirty = Vec::new();
        for (&index, entry) in self.cache.iter_mut() {
            if entry.dirty {
                dirty.push((index, entry.data.clone()));
                entry.dirty = false;
            }
        }
        // Deterministic write order.
        dirty.sort_by_key(|&(i, _)| i);
        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(fill: u8) -> Box<[u8]> {
        vec![fill; 64].into_boxed_slice()
    }

    #[test]
    fn eviction_returns_dirty_buffers_only() {
        let mut cache = PageCache::new(2);
        assert!(cache.put(0, buf(0), true).is_none());
        assert!(cache.put(1, buf(1), false).is_none());

        // Touch page 0 so page 1 is the LRU victim; clean pages evict
        // silently.
        assert!(cache.get(0).is_some());
        assert!(cache.put(2, buf(2), true).is_none());

        // Now page 0 (dirty) is the victim.
        let evicted = cache.put(3, buf(3), false).unwrap();
        assert_eq!(evicted.0, 0);
        assert_eq!(evicted.1[0], 0);
    }

    #[test]
    fn replace_keeps_dirtiness() {
        let mut cache = PageCache::new(4);
        cache.put(5, buf(1), true);
        // A clean re-insert of a dirty page must not lose the pending write.
        cache.put(5, buf(2), false);
        let dirty = cache.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].0, 5);
        assert_eq!(dirty[0].1[0], 2);
        assert!(cache.take_dirty().is_empty());
    }
}
