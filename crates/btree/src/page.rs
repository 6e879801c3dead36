//! Raw byte-level codec for B+-tree pages.
//!
//! Layout (all integers little-endian):
//!
//! Common header: `is_leaf: u8` (0 internal, 1 leaf), `num_keys: u16`.
//!
//! Internal page: header, then `ptr_0: i32`, then `num_keys` repetitions of
//! `(key: [u8; 16], ptr: i32)`. `ptr_0` is the child below the first key.
//!
//! Leaf page: header, then `prev: i32`, `next: i32` (sibling page ids, or
//! `-1`), then `num_keys` repetitions of `(key: [u8; 16], page_id: i32,
//! offset: i32)`, the two signed ints are a [`RecordId`].

use crate::key::KEY_SIZE;
use crate::node::{BTreeNode, InternalNode, LeafNode};
use common::{DbError, DbResult, PageId, RecordId};

const LEAF_TAG: u8 = 1;
const INTERNAL_TAG: u8 = 0;

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn write_i32(buf: &mut [u8], at: usize, v: i32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn page_id_from_i32(v: i32) -> PageId {
    PageId(v as i64)
}

fn page_id_to_i32(id: PageId) -> i32 {
    id.0 as i32
}

/// Decodes a raw page buffer into a [`BTreeNode`].
pub fn decode(buf: &[u8]) -> DbResult<BTreeNode> {
    if buf.is_empty() {
        return Err(DbError::PageCorrupt("empty b-tree page buffer".into()));
    }
    let num_keys = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    match buf[0] {
        INTERNAL_TAG => {
            let mut children = Vec::with_capacity(num_keys + 1);
            children.push(page_id_from_i32(read_i32(buf, 3)));
            let mut keys = Vec::with_capacity(num_keys);
            let mut at = 7;
            for _ in 0..num_keys {
                let mut key = [0u8; KEY_SIZE];
                key.copy_from_slice(&buf[at..at + KEY_SIZE]);
                at += KEY_SIZE;
                children.push(page_id_from_i32(read_i32(buf, at)));
                at += 4;
                keys.push(key);
            }
            Ok(BTreeNode::Internal(InternalNode { keys, children }))
        }
        LEAF_TAG => {
            let prev = page_id_from_i32(read_i32(buf, 3));
            let next = page_id_from_i32(read_i32(buf, 7));
            let mut keys = Vec::with_capacity(num_keys);
            let mut rids = Vec::with_capacity(num_keys);
            let mut at = 11;
            for _ in 0..num_keys {
                let mut key = [0u8; KEY_SIZE];
                key.copy_from_slice(&buf[at..at + KEY_SIZE]);
                at += KEY_SIZE;
                let page_id = page_id_from_i32(read_i32(buf, at));
                at += 4;
                let offset = read_i32(buf, at) as u32;
                at += 4;
                keys.push(key);
                rids.push(RecordId { page_id, offset });
            }
            Ok(BTreeNode::Leaf(LeafNode {
                prev,
                next,
                keys,
                rids,
            }))
        }
        tag => Err(DbError::PageCorrupt(format!("unknown b-tree page tag {tag}"))),
    }
}

/// Encodes `node` into `buf`, zeroing the rest of the page. Fails if the
/// node's key count does not fit in `buf.len()` bytes.
pub fn encode(node: &BTreeNode, buf: &mut [u8]) -> DbResult<()> {
    buf.iter_mut().for_each(|b| *b = 0);
    match node {
        BTreeNode::Internal(n) => {
            let needed = 7 + n.keys.len() * (KEY_SIZE + 4);
            if needed > buf.len() {
                return Err(DbError::PageFull);
            }
            buf[0] = INTERNAL_TAG;
            buf[1..3].copy_from_slice(&(n.keys.len() as u16).to_le_bytes());
            write_i32(buf, 3, page_id_to_i32(n.children[0]));
            let mut at = 7;
            for (key, child) in n.keys.iter().zip(n.children.iter().skip(1)) {
                buf[at..at + KEY_SIZE].copy_from_slice(key);
                at += KEY_SIZE;
                write_i32(buf, at, page_id_to_i32(*child));
                at += 4;
            }
        }
        BTreeNode::Leaf(n) => {
            let needed = 11 + n.keys.len() * (KEY_SIZE + 8);
            if needed > buf.len() {
                return Err(DbError::PageFull);
            }
            buf[0] = LEAF_TAG;
            buf[1..3].copy_from_slice(&(n.keys.len() as u16).to_le_bytes());
            write_i32(buf, 3, page_id_to_i32(n.prev));
            write_i32(buf, 7, page_id_to_i32(n.next));
            let mut at = 11;
            for (key, rid) in n.keys.iter().zip(n.rids.iter()) {
                buf[at..at + KEY_SIZE].copy_from_slice(key);
                at += KEY_SIZE;
                write_i32(buf, at, page_id_to_i32(rid.page_id));
                at += 4;
                write_i32(buf, at, rid.offset as i32);
                at += 4;
            }
        }
    }
    Ok(())
}
