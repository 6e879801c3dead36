//! Latched buffer pool with LRU eviction.
//!
//! A single mutex guards the frame table, the page table, the free list,
//! and the replacer together, exactly the data `fetch_page`/`unpin_page`/
//! `new_page`/`delete_page`/`flush_page` touch. Every public method takes
//! the lock for its entire body and releases it before returning;
//! `flush_all_pages` inlines the write-back loop instead of calling
//! `flush_page` per frame; calling it would try to reacquire the same
//! mutex and deadlock.
//!
//! Page *content* safety across threads (e.g. two threads racing to mutate
//! the same B+-tree node) is not this module's job, that's what the
//! per-`page_id` latch table in `btree` is for. This module only guarantees
//! that pin counts, dirty flags, and frame assignment are consistent.

pub mod replacer;

use common::{DbError, DbResult, PageId};
use hashbrown::HashMap;
use replacer::LruReplacer;
use std::collections::VecDeque;
use std::sync::Mutex;
use storage::{DiskManager, PAGE_SIZE};

struct Frame {
    page_id: Option<PageId>,
    data: Vec<u8>,
    pin_count: u32,
    dirty: bool,
}

impl Frame {
    fn empty() -> Self {
        Self {
            page_id: None,
            data: vec![0u8; PAGE_SIZE],
            pin_count: 0,
            dirty: false,
        }
    }

    fn reset(&mut self) {
        self.page_id = None;
        self.data.iter_mut().for_each(|b| *b = 0);
        self.pin_count = 0;
        self.dirty = false;
    }
}

struct Inner {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, usize>,
    free_list: VecDeque<usize>,
    replacer: LruReplacer,
    disk: DiskManager,
}

impl Inner {
    /// Finds a usable frame: the free list first, then an LRU victim. If a
    /// victim is dirty it is written back before being handed out.
    fn find_free_frame(&mut self) -> DbResult<Option<usize>> {
        if let Some(idx) = self.free_list.pop_front() {
            return Ok(Some(idx));
        }
        let Some(idx) = self.replacer.victim() else {
            return Ok(None);
        };
        if let Some(old_id) = self.frames[idx].page_id {
            if self.frames[idx].dirty {
                self.disk.write_page(old_id, &self.frames[idx].data)?;
            }
            self.page_table.remove(&old_id);
        }
        Ok(Some(idx))
    }
}

/// Owns `pool_size` frames of page-sized memory, backed by a `DiskManager`.
pub struct BufferPoolManager {
    inner: Mutex<Inner>,
}

impl BufferPoolManager {
    pub fn new(disk: DiskManager, pool_size: usize) -> Self {
        let frames = (0..pool_size).map(|_| Frame::empty()).collect();
        let free_list = (0..pool_size).collect();
        Self {
            inner: Mutex::new(Inner {
                frames,
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(pool_size),
                disk,
            }),
        }
    }

    /// Ensures `id` is resident and pinned. Hits bump the pin count and
    /// remove the frame from the replacer; misses evict a frame (flushing
    /// it if dirty) and read the page from disk.
    pub fn fetch_page(&self, id: PageId) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.page_table.get(&id) {
            inner.frames[idx].pin_count += 1;
            inner.replacer.pin(idx);
            return Ok(());
        }

        let Some(idx) = inner.find_free_frame()? else {
            return Err(DbError::NoFrame);
        };
        let data = match inner.disk.read_page(id) {
            Ok(d) => d,
            Err(e) => {
                inner.free_list.push_back(idx);
                return Err(e);
            }
        };
        inner.frames[idx].page_id = Some(id);
        inner.frames[idx].data = data;
        inner.frames[idx].pin_count = 1;
        inner.frames[idx].dirty = false;
        inner.page_table.insert(id, idx);
        inner.replacer.pin(idx);
        Ok(())
    }

    /// Allocates a new page on disk and pins it resident. The fresh page is
    /// always marked dirty so an empty page still gets flushed.
    pub fn new_page(&self) -> DbResult<PageId> {
        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner.find_free_frame()? else {
            return Err(DbError::NoFrame);
        };
        let id = inner.disk.allocate_page()?;
        inner.frames[idx].page_id = Some(id);
        inner.frames[idx].data.iter_mut().for_each(|b| *b = 0);
        inner.frames[idx].pin_count = 1;
        inner.frames[idx].dirty = true;
        inner.page_table.insert(id, idx);
        inner.replacer.pin(idx);
        Ok(id)
    }

    /// Decrements the pin count for `id`, ORing in `dirty`. Once the pin
    /// count reaches zero the frame becomes an eviction candidate.
    pub fn unpin_page(&self, id: PageId, dirty: bool) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(&idx) = inner.page_table.get(&id) else {
            return Err(DbError::Storage(format!("unpin_page: {id:?} not resident")));
        };
        let frame = &mut inner.frames[idx];
        if frame.pin_count == 0 {
            return Err(DbError::Storage(format!("unpin_page: {id:?} pin count already 0")));
        }
        frame.pin_count -= 1;
        frame.dirty = frame.dirty || dirty;
        if frame.pin_count == 0 {
            inner.replacer.unpin(idx);
        }
        Ok(())
    }

    /// Removes `id` from the pool. A no-op success if `id` isn't resident;
    /// fails if still pinned. Drops any in-memory dirty state rather than
    /// flushing it, matching the buffer pool's contract.
    pub fn delete_page(&self, id: PageId) -> DbResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(&idx) = inner.page_table.get(&id) else {
            return Ok(true);
        };
        if inner.frames[idx].pin_count > 0 {
            return Ok(false);
        }
        inner.page_table.remove(&id);
        inner.replacer.pin(idx); // exclude from victim selection while reset runs
        inner.frames[idx].reset();
        inner.free_list.push_back(idx);
        Ok(true)
    }

    pub fn flush_page(&self, id: PageId) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(&idx) = inner.page_table.get(&id) else {
            return Err(DbError::Storage(format!("flush_page: {id:?} not resident")));
        };
        if inner.frames[idx].dirty {
            inner.disk.write_page(id, &inner.frames[idx].data.clone())?;
            inner.frames[idx].dirty = false;
        }
        Ok(())
    }

    /// Flushes every dirty resident page. Inlines the write-back logic
    /// instead of calling `flush_page` per frame to avoid re-entering this
    /// mutex.
    pub fn flush_all_pages(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for idx in 0..inner.frames.len() {
            if !inner.frames[idx].dirty {
                continue;
            }
            let Some(id) = inner.frames[idx].page_id else {
                continue;
            };
            let data = inner.frames[idx].data.clone();
            inner.disk.write_page(id, &data)?;
            inner.frames[idx].dirty = false;
        }
        Ok(())
    }

    /// Runs `f` against the resident (pinned) bytes for `id`.
    pub fn with_page<R>(&self, id: PageId, f: impl FnOnce(&[u8]) -> R) -> DbResult<R> {
        let inner = self.inner.lock().unwrap();
        let Some(&idx) = inner.page_table.get(&id) else {
            return Err(DbError::Storage(format!("with_page: {id:?} not resident")));
        };
        Ok(f(&inner.frames[idx].data))
    }

    /// Runs `f` against the resident (pinned) bytes for `id`, mutably. The
    /// caller is responsible for having fetched `id` first and unpinning
    /// with `dirty=true` afterward.
    pub fn with_page_mut<R>(&self, id: PageId, f: impl FnOnce(&mut [u8]) -> R) -> DbResult<R> {
        let mut inner = self.inner.lock().unwrap();
        let Some(&idx) = inner.page_table.get(&id) else {
            return Err(DbError::Storage(format!("with_page_mut: {id:?} not resident")));
        };
        Ok(f(&mut inner.frames[idx].data))
    }

    #[cfg(test)]
    fn pin_count(&self, id: PageId) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .page_table
            .get(&id)
            .map(|&idx| inner.frames[idx].pin_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pool(pool_size: usize) -> (tempfile::TempDir, BufferPoolManager) {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(dir.path().join("t.db"), PAGE_SIZE).unwrap();
        (dir, BufferPoolManager::new(disk, pool_size))
    }

    #[test]
    fn new_page_is_dirty_and_pinned() {
        let (_d, bpm) = pool(4);
        let id = bpm.new_page().unwrap();
        assert_eq!(bpm.pin_count(id), Some(1));
    }

    #[test]
    fn fetch_after_unpin_all_returns_pattern() {
        let (_d, bpm) = pool(5);
        let mut ids = vec![];
        for i in 0..20u8 {
            let id = bpm.new_page().unwrap();
            bpm.with_page_mut(id, |data| data[0] = i).unwrap();
            bpm.unpin_page(id, true).unwrap();
            ids.push(id);
        }
        for (i, id) in ids.iter().enumerate() {
            bpm.fetch_page(*id).unwrap();
            bpm.with_page(*id, |data| assert_eq!(data[0], i as u8)).unwrap();
            bpm.unpin_page(*id, false).unwrap();
        }
    }

    #[test]
    fn no_frame_when_pool_exhausted() {
        let (_d, bpm) = pool(2);
        let _a = bpm.new_page().unwrap();
        let _b = bpm.new_page().unwrap();
        assert!(matches!(bpm.new_page(), Err(DbError::NoFrame)));
    }

    #[test]
    fn delete_page_refuses_while_pinned() {
        let (_d, bpm) = pool(2);
        let id = bpm.new_page().unwrap();
        assert_eq!(bpm.delete_page(id).unwrap(), false);
        bpm.unpin_page(id, false).unwrap();
        assert_eq!(bpm.delete_page(id).unwrap(), true);
    }

    #[test]
    fn delete_page_missing_is_idempotent() {
        let (_d, bpm) = pool(2);
        assert_eq!(bpm.delete_page(PageId(99)).unwrap(), true);
    }

    #[test]
    fn flush_all_does_not_deadlock_and_clears_dirty() {
        let (_d, bpm) = pool(3);
        let a = bpm.new_page().unwrap();
        let b = bpm.new_page().unwrap();
        bpm.unpin_page(a, true).unwrap();
        bpm.unpin_page(b, true).unwrap();
        bpm.flush_all_pages().unwrap();
    }

    #[test]
    fn concurrent_fetch_unpin_never_goes_negative() {
        let (_d, bpm) = pool(4);
        let id = bpm.new_page().unwrap();
        bpm.unpin_page(id, false).unwrap();
        let bpm = Arc::new(bpm);

        let mut handles = vec![];
        for _ in 0..8 {
            let bpm = Arc::clone(&bpm);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    bpm.fetch_page(id).unwrap();
                    bpm.unpin_page(id, false).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        bpm.fetch_page(id).unwrap();
        assert_eq!(bpm.pin_count(id), Some(1));
    }
}
