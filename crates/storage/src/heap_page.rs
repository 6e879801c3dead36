//! Table heap page: a directory of the data pages belonging to one table.

use crate::PAGE_SIZE;
use common::{DbError, DbResult, PageId};

const MAGIC: &[u8; 4] = b"THP1";
const HEADER_LEN: usize = 4 + 4;
const ENTRY_LEN: usize = 4;

/// An ordered list of data page ids belonging to a single table, serialized
/// as a fixed-size page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableHeapPage {
    pub page_ids: Vec<PageId>,
}

impl TableHeapPage {
    pub fn new() -> Self {
        Self { page_ids: Vec::new() }
    }

    pub fn serialize(&self) -> DbResult<Vec<u8>> {
        let needed = HEADER_LEN + self.page_ids.len() * ENTRY_LEN;
        if needed > PAGE_SIZE {
            return Err(DbError::PageFull);
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&(self.page_ids.len() as u32).to_le_bytes());
        let mut offset = HEADER_LEN;
        for id in &self.page_ids {
            buf[offset..offset + ENTRY_LEN].copy_from_slice(&(id.0 as i32).to_le_bytes());
            offset += ENTRY_LEN;
        }
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Self {
        if buf.len() < HEADER_LEN || &buf[0..4] != MAGIC {
            return Self::new();
        }
        let count = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let max_possible = (buf.len() - HEADER_LEN) / ENTRY_LEN;
        let count = count.min(max_possible);

        let mut page_ids = Vec::with_capacity(count);
        let mut offset = HEADER_LEN;
        for _ in 0..count {
            let id = i32::from_le_bytes(buf[offset..offset + ENTRY_LEN].try_into().unwrap());
            page_ids.push(PageId(id as i64));
            offset += ENTRY_LEN;
        }
        Self { page_ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_empty() {
        let heap = TableHeapPage::new();
        let buf = heap.serialize().unwrap();
        assert_eq!(TableHeapPage::deserialize(&buf), heap);
    }

    #[test]
    fn round_trips_with_pages() {
        let heap = TableHeapPage {
            page_ids: vec![PageId(1), PageId(2), PageId(7)],
        };
        let buf = heap.serialize().unwrap();
        assert_eq!(TableHeapPage::deserialize(&buf), heap);
    }

    #[test]
    fn deserialize_rejects_bad_magic() {
        let buf = vec![0u8; PAGE_SIZE];
        assert_eq!(TableHeapPage::deserialize(&buf), TableHeapPage::new());
    }
}
