//! Fixed-size page I/O over a single file.
//!
//! `DiskManager` has no internal locking of its own, it is always driven
//! from behind the buffer pool's single mutex (see `buffer::BufferPoolManager`),
//! so every method here takes `&mut self`.

use crate::PAGE_SIZE;
use common::{DbError, DbResult, PageId};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Manages fixed-size page I/O against a single on-disk file.
#[derive(Debug)]
pub struct DiskManager {
    path: PathBuf,
    file: File,
    page_size: usize,
    num_pages: u64,
}

impl DiskManager {
    /// Opens (creating if absent) the database file at `path` and recovers
    /// `num_pages` from the file size.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let num_pages = len / page_size as u64;

        Ok(Self {
            path,
            file,
            page_size,
            num_pages,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Reads exactly `page_size` bytes for `id`. Fails if `id` is beyond the
    /// current page count.
    pub fn read_page(&mut self, id: PageId) -> DbResult<Vec<u8>> {
        self.bounds_check(id)?;
        let mut buf = vec![0u8; self.page_size];
        self.file
            .seek(SeekFrom::Start(id.0 as u64 * self.page_size as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Overwrites the page at `id` with `data`, which must be exactly
    /// `page_size` bytes, then flushes to stable storage.
    pub fn write_page(&mut self, id: PageId, data: &[u8]) -> DbResult<()> {
        self.bounds_check(id)?;
        if data.len() != self.page_size {
            return Err(DbError::Storage(format!(
                "write_page: expected {} bytes, got {}",
                self.page_size,
                data.len()
            )));
        }
        self.file
            .seek(SeekFrom::Start(id.0 as u64 * self.page_size as u64))?;
        self.file.write_all(data)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Appends a zeroed page at end-of-file and returns its id. Bypasses
    /// `write_page`'s bounds check since the page does not exist yet.
    pub fn allocate_page(&mut self) -> DbResult<PageId> {
        let id = PageId(self.num_pages as i64);
        let zeros = vec![0u8; self.page_size];
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&zeros)?;
        self.file.sync_data()?;
        self.num_pages += 1;
        Ok(id)
    }

    fn bounds_check(&self, id: PageId) -> DbResult<()> {
        if !id.is_valid() || id.0 as u64 >= self.num_pages {
            return Err(DbError::Storage(format!(
                "page {} out of bounds (num_pages={})",
                id.0, self.num_pages
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut dm = DiskManager::open(dir.path().join("t.db"), PAGE_SIZE).unwrap();
        let id = dm.allocate_page().unwrap();
        assert_eq!(id, PageId(0));

        let mut pattern = vec![0u8; PAGE_SIZE];
        pattern[0] = 0xAB;
        pattern[PAGE_SIZE - 1] = 0xCD;
        dm.write_page(id, &pattern).unwrap();

        let back = dm.read_page(id).unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn read_beyond_disk_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut dm = DiskManager::open(dir.path().join("t.db"), PAGE_SIZE).unwrap();
        assert!(dm.read_page(PageId(0)).is_err());
    }

    #[test]
    fn write_wrong_length_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut dm = DiskManager::open(dir.path().join("t.db"), PAGE_SIZE).unwrap();
        let id = dm.allocate_page().unwrap();
        assert!(dm.write_page(id, &[0u8; 10]).is_err());
    }

    #[test]
    fn num_pages_recovered_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let mut dm = DiskManager::open(&path, PAGE_SIZE).unwrap();
            for _ in 0..5 {
                dm.allocate_page().unwrap();
            }
        }
        let dm = DiskManager::open(&path, PAGE_SIZE).unwrap();
        assert_eq!(dm.num_pages(), 5);
    }
}
