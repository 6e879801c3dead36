//! Small helper shared by `StorageEngine` and `IndexManager` for reading and
//! persisting the page-0 catalog through the buffer pool. Kept separate so
//! neither caller needs a back-pointer to the other, both just take a
//! `&BufferPoolManager` and the in-memory `CatalogPage` they already hold.

use buffer::BufferPoolManager;
use catalog::CatalogPage;
use common::{DbResult, PageId};

const CATALOG_PAGE_ID: PageId = PageId(0);

/// Loads the catalog from page 0, creating (and persisting) an empty one if
/// the database file is brand new.
pub fn open(bpm: &BufferPoolManager, page_size: usize) -> DbResult<CatalogPage> {
    match bpm.fetch_page(CATALOG_PAGE_ID) {
        Ok(()) => {
            let catalog = bpm.with_page(CATALOG_PAGE_ID, CatalogPage::deserialize)??;
            bpm.unpin_page(CATALOG_PAGE_ID, false)?;
            Ok(catalog)
        }
        Err(_) => {
            let id = bpm.new_page()?;
            debug_assert_eq!(id, CATALOG_PAGE_ID, "catalog must be the first page allocated");
            let catalog = CatalogPage::new();
            let buf = catalog.serialize(page_size)?;
            bpm.with_page_mut(id, |data| data.copy_from_slice(&buf))?;
            bpm.unpin_page(id, true)?;
            Ok(catalog)
        }
    }
}

/// Serializes `catalog` and writes it back to page 0, holding the page
/// pinned-dirty for the duration of the write as the spec's catalog
/// durability rule requires.
pub fn flush(bpm: &BufferPoolManager, catalog: &CatalogPage, page_size: usize) -> DbResult<()> {
    bpm.fetch_page(CATALOG_PAGE_ID)?;
    let buf = catalog.serialize(page_size)?;
    let result = bpm.with_page_mut(CATALOG_PAGE_ID, |data| data.copy_from_slice(&buf));
    match result {
        Ok(()) => bpm.unpin_page(CATALOG_PAGE_ID, true),
        Err(e) => {
            let _ = bpm.unpin_page(CATALOG_PAGE_ID, false);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::{ColumnDef, TableSchema};
    use storage::{DiskManager, PAGE_SIZE};
    use types::SqlType;

    fn bpm() -> (tempfile::TempDir, BufferPoolManager) {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(dir.path().join("t.db"), PAGE_SIZE).unwrap();
        (dir, BufferPoolManager::new(disk, 8))
    }

    #[test]
    fn open_on_empty_file_creates_page_zero() {
        let (_d, pool) = bpm();
        let catalog = open(&pool, PAGE_SIZE).unwrap();
        assert!(catalog.tables.is_empty());
    }

    #[test]
    fn flush_then_reopen_round_trips() {
        let (_d, pool) = bpm();
        let mut catalog = open(&pool, PAGE_SIZE).unwrap();
        catalog
            .create_table(
                "t",
                TableSchema::new(vec![ColumnDef::new("id", SqlType::Int).primary_key()]),
                common::PageId(1),
            )
            .unwrap();
        flush(&pool, &catalog, PAGE_SIZE).unwrap();

        let reopened = open(&pool, PAGE_SIZE).unwrap();
        assert!(reopened.table("t").is_ok());
    }
}
