//! Data page codec: append-only cells with negative-length tombstones.
//!
//! A data page has no stored free-space pointer. `F`, the offset of the
//! first unused byte, is always recomputed by scanning from 0 and stepping
//! by `|len|` until a zero length (or the page boundary) is hit. This keeps
//! the on-disk format self-describing at the cost of an O(page) scan per
//! mutation, which is fine at 4 KiB.

use common::{DbError, DbResult};

const LEN_PREFIX: usize = 4;

/// Stateless codec over a page buffer, every method takes the buffer it
/// operates on explicitly rather than owning it, since the buffer lives in
/// a buffer pool frame the caller already holds pinned.
pub struct DataPage;

impl DataPage {
    /// Scans the page from offset 0 and returns `F`, the first unused byte.
    pub fn free_end(buf: &[u8]) -> usize {
        let mut offset = 0usize;
        while offset + LEN_PREFIX <= buf.len() {
            let len = read_len(buf, offset);
            if len == 0 {
                break;
            }
            offset += LEN_PREFIX + (len.unsigned_abs() as usize);
            if offset > buf.len() {
                // Corrupt page; stop rather than run past the buffer.
                return buf.len();
            }
        }
        offset
    }

    pub fn free_space(buf: &[u8]) -> usize {
        buf.len().saturating_sub(Self::free_end(buf))
    }

    /// Appends `payload` as a new live cell and returns its offset.
    pub fn insert(buf: &mut [u8], payload: &[u8]) -> DbResult<u32> {
        let offset = Self::free_end(buf);
        let cell_len = LEN_PREFIX + payload.len();
        if offset + cell_len > buf.len() {
            return Err(DbError::PageFull);
        }
        write_len(buf, offset, cell_len as i32);
        buf[offset + LEN_PREFIX..offset + cell_len].copy_from_slice(payload);
        Ok(offset as u32)
    }

    /// Returns the live payload at `offset`, or `None` if tombstoned.
    pub fn get(buf: &[u8], offset: u32) -> Option<Vec<u8>> {
        let offset = offset as usize;
        let len = read_len(buf, offset);
        if len <= 0 {
            return None;
        }
        let cell_len = len as usize;
        Some(buf[offset + LEN_PREFIX..offset + cell_len].to_vec())
    }

    /// Tombstones the cell at `offset` by negating its length prefix.
    /// Returns `false` if the cell was already dead or out of range.
    pub fn delete(buf: &mut [u8], offset: u32) -> bool {
        let offset = offset as usize;
        if offset + LEN_PREFIX > buf.len() {
            return false;
        }
        let len = read_len(buf, offset);
        if len <= 0 {
            return false;
        }
        write_len(buf, offset, -len);
        true
    }

    /// Updates the cell at `offset`. If `new_payload` fits within the old
    /// cell it is rewritten in place (tail zero-filled) and the RID is
    /// preserved (`moved = false`). Otherwise the old cell is tombstoned and
    /// the new payload is appended (`moved = true`, new offset returned).
    pub fn update(buf: &mut [u8], offset: u32, new_payload: &[u8]) -> DbResult<(u32, bool)> {
        let off = offset as usize;
        let old_len = read_len(buf, off);
        if old_len <= 0 {
            return Err(DbError::Storage(format!(
                "update: no live record at offset {offset}"
            )));
        }
        let old_len = old_len as usize;
        let new_cell_len = LEN_PREFIX + new_payload.len();

        if new_cell_len <= old_len {
            write_len(buf, off, new_cell_len as i32);
            buf[off + LEN_PREFIX..off + new_cell_len].copy_from_slice(new_payload);
            for b in &mut buf[off + new_cell_len..off + old_len] {
                *b = 0;
            }
            Ok((offset, false))
        } else {
            let free_end = Self::free_end(buf);
            let needed = LEN_PREFIX + new_payload.len();
            if free_end + needed > buf.len() {
                return Err(DbError::PageFull);
            }
            write_len(buf, off, -(old_len as i32));
            let new_offset = Self::insert(buf, new_payload)?;
            Ok((new_offset, true))
        }
    }

    /// Returns every live `(offset, payload)` pair in insertion order.
    pub fn scan(buf: &[u8]) -> Vec<(u32, Vec<u8>)> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        let end = Self::free_end(buf);
        while offset < end {
            let len = read_len(buf, offset);
            if len == 0 {
                break;
            }
            let cell_len = len.unsigned_abs() as usize;
            if len > 0 {
                out.push((
                    offset as u32,
                    buf[offset + LEN_PREFIX..offset + LEN_PREFIX + cell_len - LEN_PREFIX].to_vec(),
                ));
            }
            offset += cell_len;
            if offset > end {
                break;
            }
        }
        out
    }
}

fn read_len(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + LEN_PREFIX].try_into().unwrap())
}

fn write_len(buf: &mut [u8], offset: usize, len: i32) {
    buf[offset..offset + LEN_PREFIX].copy_from_slice(&len.to_le_bytes());
}
