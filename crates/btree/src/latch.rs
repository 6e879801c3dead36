//! Per-page exclusive latches for hand-over-hand (crabbing) descent.
//!
//! Each page gets its own `parking_lot::Mutex<()>`, handed out wrapped in an
//! `Arc` so a descent can hold an owned guard for every page on its path
//! without borrowing from a table that outlives the traversal. The `arc_lock`
//! feature's [`parking_lot::ArcMutexGuard`] is what makes that possible: the
//! guard owns its own `Arc` clone, so a `Vec<ArcMutexGuard<..>>` can be built
//! up one level at a time and drained in reverse order to unlatch. No
//! lifetimes, no `unsafe`.

use common::PageId;
use hashbrown::HashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

type PageMutex = Arc<Mutex<()>>;

/// An owned exclusive lock on one page, released on drop.
pub type PageGuard = ArcMutexGuard<RawMutex, ()>;

/// Registry of per-page latches. Latches are created lazily and kept around
/// for the process lifetime, a B+-tree's page set only grows while it's
/// mounted, so this never needs to shrink.
#[derive(Default)]
pub struct LatchTable {
    latches: StdMutex<HashMap<PageId, PageMutex>>,
}

impl LatchTable {
    pub fn new() -> Self {
        Self {
            latches: StdMutex::new(HashMap::new()),
        }
    }

    fn handle(&self, page_id: PageId) -> PageMutex {
        let mut table = self.latches.lock().unwrap();
        table
            .entry(page_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the exclusive latch for `page_id`, blocking if held.
    pub fn acquire(&self, page_id: PageId) -> PageGuard {
        let mutex = self.handle(page_id);
        mutex.lock_arc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn latches_on_different_pages_are_independent() {
        let table = LatchTable::new();
        let _a = table.acquire(PageId(1));
        let _b = table.acquire(PageId(2));
    }

    #[test]
    fn same_page_latch_serializes_threads() {
        let table = StdArc::new(LatchTable::new());
        let counter = StdArc::new(StdMutex::new(0u32));

        let mut handles = vec![];
        for _ in 0..8 {
            let table = StdArc::clone(&table);
            let counter = StdArc::clone(&counter);
            handles.push(thread::spawn(move || {
                let _guard = table.acquire(PageId(1));
                let mut c = counter.lock().unwrap();
                *c += 1;
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }
}
