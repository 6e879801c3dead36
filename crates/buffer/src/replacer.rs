//! LRU replacement policy: tracks which frames are candidates for eviction.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Ordered set of unpinned frame ids. `unpin` marks a frame as a victim
/// candidate (most-recently-used); `pin` removes it from the candidate set;
/// `victim` evicts the least-recently-used candidate. All operations are
/// O(1), backed by the `lru` crate's intrusive linked hash map.
pub struct LruReplacer {
    cache: LruCache<usize, ()>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Marks `frame` as the most-recently-used eviction candidate.
    pub fn unpin(&mut self, frame: usize) {
        if !self.cache.contains(&frame) {
            self.cache.put(frame, ());
        } else {
            self.cache.promote(&frame);
        }
    }

    /// Removes `frame` from the candidate set, if present.
    pub fn pin(&mut self, frame: usize) {
        self.cache.pop(&frame);
    }

    /// Evicts and returns the least-recently-used candidate frame, if any.
    pub fn victim(&mut self) -> Option<usize> {
        self.cache.pop_lru().map(|(frame, ())| frame)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
