//! Latched, disk-backed B+-tree index.
//!
//! Every page visited during a descent is protected by an exclusive latch
//! from [`latch::LatchTable`], acquired root-to-leaf and released once a
//! node proves "safe" (has spare capacity for insert, or more than the
//! minimum number of keys for delete). Ancestor latches are dropped at that
//! point since the operation below can no longer propagate a structural
//! change past that node. This is the textbook latch-crabbing discipline;
//! unlike some classic descriptions, the safety predicate here is applied
//! uniformly to leaf and internal nodes alike (a node is safe purely because
//! it has room, regardless of kind). Treating every leaf as unconditionally
//! safe can release a grandparent's latch too early and corrupt a tree mid
//! cascading split.
//!
//! Keys are fixed 16-byte arrays (see [`key`]); page layout and its codec
//! live in [`page`]; node shapes and their pure vector manipulation live in
//! [`node`].

pub mod key;
pub mod latch;
pub mod node;
pub mod page;

pub use key::{encode_key, Key, KEY_SIZE};
pub use node::{BTreeNode, InternalNode, LeafNode};

use buffer::BufferPoolManager;
use common::{DbError, DbResult, PageId, RecordId, INVALID_PAGE_ID};
use latch::{LatchTable, PageGuard};
use std::sync::{Arc, Mutex as StdMutex};

fn min_keys_for(node: &BTreeNode, page_size: usize) -> usize {
    match node {
        BTreeNode::Internal(_) => InternalNode::min_keys(page_size),
        BTreeNode::Leaf(_) => LeafNode::min_keys(page_size),
    }
}

fn redistribute_leaf_from_left(
    parent: &mut InternalNode,
    child_idx: usize,
    left: &mut LeafNode,
    child: &mut LeafNode,
) {
    let key = left.keys.pop().expect("left sibling has a key to lend");
    let rid = left.rids.pop().expect("left sibling has an rid to lend");
    child.keys.insert(0, key);
    child.rids.insert(0, rid);
    parent.keys[child_idx - 1] = child.keys[0];
}

fn redistribute_leaf_from_right(
    parent: &mut InternalNode,
    child_idx: usize,
    child: &mut LeafNode,
    right: &mut LeafNode,
) {
    let key = right.keys.remove(0);
    let rid = right.rids.remove(0);
    child.keys.push(key);
    child.rids.push(rid);
    parent.keys[child_idx] = right.keys[0];
}

fn merge_leaves(left: &mut LeafNode, right: &LeafNode) {
    left.keys.extend_from_slice(&right.keys);
    left.rids.extend_from_slice(&right.rids);
    left.next = right.next;
}

fn redistribute_internal_from_left(
    parent: &mut InternalNode,
    child_idx: usize,
    left: &mut InternalNode,
    child: &mut InternalNode,
) {
    let borrowed_child = left.children.pop().expect("left sibling has a child to lend");
    let borrowed_key = left.keys.pop().expect("left sibling has a key to lend");
    child.keys.insert(0, parent.keys[child_idx - 1]);
    child.children.insert(0, borrowed_child);
    parent.keys[child_idx - 1] = borrowed_key;
}

fn redistribute_internal_from_right(
    parent: &mut InternalNode,
    child_idx: usize,
    child: &mut InternalNode,
    right: &mut InternalNode,
) {
    let borrowed_child = right.children.remove(0);
    let borrowed_key = right.keys.remove(0);
    child.keys.push(parent.keys[child_idx]);
    child.children.push(borrowed_child);
    parent.keys[child_idx] = borrowed_key;
}

fn merge_internals(parent_separator: Key, left: &mut InternalNode, right: &InternalNode) {
    left.keys.push(parent_separator);
    left.keys.extend_from_slice(&right.keys);
    left.children.extend_from_slice(&right.children);
}

/// A latched B+-tree over fixed-size pages, keyed on [`Key`] and storing
/// [`RecordId`] values. One instance per index; several instances typically
/// share a single [`BufferPoolManager`].
pub struct BTree {
    bpm: Arc<BufferPoolManager>,
    latches: LatchTable,
    root: StdMutex<PageId>,
    page_size: usize,
}

impl BTree {
    /// Opens a tree rooted at `root_page_id` (pass [`INVALID_PAGE_ID`] for a
    /// brand new, empty index, the first insert allocates its root).
    pub fn open(bpm: Arc<BufferPoolManager>, root_page_id: PageId, page_size: usize) -> Self {
        Self {
            bpm,
            latches: LatchTable::new(),
            root: StdMutex::new(root_page_id),
            page_size,
        }
    }

    /// The tree's current root page, [`INVALID_PAGE_ID`] if still empty.
    /// Changes across splits and root collapses, callers that persist it
    /// (the catalog, via `IndexManager`) must re-read it after every
    /// mutating call.
    pub fn root_page_id(&self) -> PageId {
        *self.root.lock().unwrap()
    }

    fn read_node(&self, id: PageId) -> DbResult<BTreeNode> {
        self.bpm.fetch_page(id)?;
        let node = self.bpm.with_page(id, page::decode)?;
        self.bpm.unpin_page(id, false)?;
        node
    }

    fn write_node(&self, id: PageId, node: &BTreeNode) -> DbResult<()> {
        self.bpm.fetch_page(id)?;
        let result = self
            .bpm
            .with_page_mut(id, |buf| page::encode(node, buf))?;
        self.bpm.unpin_page(id, true)?;
        result
    }

    fn ensure_root(&self, new_pages: &mut Vec<PageId>) -> DbResult<PageId> {
        let mut root = self.root.lock().unwrap();
        if root.is_valid() {
            return Ok(*root);
        }
        let id = self.bpm.new_page()?;
        new_pages.push(id);
        self.write_node(id, &BTreeNode::Leaf(LeafNode::new()))?;
        *root = id;
        Ok(id)
    }

    /// Looks up `key`, returning its [`RecordId`] if present. Crabs down one
    /// level at a time, never holding more than one latch at once. A
    /// search can never cause a structural change, so ancestor latches add
    /// nothing but contention.
    pub fn search(&self, key: &Key) -> DbResult<Option<RecordId>> {
        let root_id = *self.root.lock().unwrap();
        if !root_id.is_valid() {
            return Ok(None);
        }
        let mut current = root_id;
        loop {
            let guard = self.latches.acquire(current);
            let node = self.read_node(current)?;
            drop(guard);
            match node {
                BTreeNode::Leaf(leaf) => return Ok(leaf.lookup(key)),
                BTreeNode::Internal(internal) => current = internal.lookup_child(key),
            }
        }
    }

    /// Returns every `(key, rid)` pair in ascending key order, walking the
    /// leaf level via its sibling links. Used for full-index scans and
    /// invariant tests; not meant for hot-path range queries over large
    /// trees (it holds no latches between leaves, so it can observe a torn
    /// snapshot under concurrent writers).
    pub fn scan_all(&self) -> DbResult<Vec<(Key, RecordId)>> {
        let root_id = *self.root.lock().unwrap();
        if !root_id.is_valid() {
            return Ok(Vec::new());
        }
        let mut current = root_id;
        loop {
            let node = self.read_node(current)?;
            match node {
                BTreeNode::Leaf(_) => break,
                BTreeNode::Internal(internal) => current = internal.children[0],
            }
        }
        let mut out = Vec::new();
        let mut leaf_id = current;
        while leaf_id.is_valid() {
            let node = self.read_node(leaf_id)?;
            let leaf = node.as_leaf().expect("leaf chain contains only leaves");
            out.extend(leaf.keys.iter().copied().zip(leaf.rids.iter().copied()));
            leaf_id = leaf.next;
        }
        Ok(out)
    }

    /// Inserts `(key, rid)`. Fails with [`DbError::DuplicateKey`] if `key`
    /// is already present, callers enforcing uniqueness above the tree
    /// (primary keys, unique indexes) rely on this.
    pub fn insert(&self, key: Key, rid: RecordId) -> DbResult<()> {
        let mut new_pages = Vec::new();
        let result = self.insert_inner(key, rid, &mut new_pages);
        if result.is_err() {
            for pid in new_pages {
                let _ = self.bpm.delete_page(pid);
            }
        }
        result
    }

    fn insert_inner(&self, key: Key, rid: RecordId, new_pages: &mut Vec<PageId>) -> DbResult<()> {
        let root_id = self.ensure_root(new_pages)?;

        let mut stack: Vec<(PageId, PageGuard)> = Vec::new();
        let mut current = root_id;
        loop {
            let guard = self.latches.acquire(current);
            let node = self.read_node(current)?;
            if node.has_room(self.page_size) {
                stack.clear();
            }
            let is_leaf = node.is_leaf();
            let next = if is_leaf {
                None
            } else {
                Some(node.as_internal().unwrap().lookup_child(&key))
            };
            stack.push((current, guard));
            match next {
                Some(child) => current = child,
                None => break,
            }
        }

        let (leaf_id, _) = *stack.last().unwrap();
        let mut leaf_page = self.read_node(leaf_id)?;
        {
            let leaf = leaf_page.as_leaf_mut().unwrap();
            if leaf.lookup(&key).is_some() {
                return Err(DbError::DuplicateKey);
            }
            leaf.insert(key, rid);
        }

        if !leaf_page.is_full(self.page_size) {
            self.write_node(leaf_id, &leaf_page)?;
            return Ok(());
        }

        let (sibling_id, sibling_node, separator) =
            self.split_leaf(leaf_id, &mut leaf_page, new_pages)?;
        self.write_node(leaf_id, &leaf_page)?;
        self.write_node(sibling_id, &sibling_node)?;
        stack.pop();
        self.insert_into_parent(stack, leaf_id, separator, sibling_id, new_pages)
    }

    fn split_leaf(
        &self,
        leaf_id: PageId,
        node: &mut BTreeNode,
        new_pages: &mut Vec<PageId>,
    ) -> DbResult<(PageId, BTreeNode, Key)> {
        let leaf = node.as_leaf_mut().unwrap();
        let split_at = leaf.keys.len() / 2;
        let right_keys = leaf.keys.split_off(split_at);
        let right_rids = leaf.rids.split_off(split_at);
        let old_next = leaf.next;

        let sibling_id = self.bpm.new_page()?;
        new_pages.push(sibling_id);
        leaf.next = sibling_id;

        let separator = right_keys[0];
        let sibling = LeafNode {
            prev: leaf_id,
            next: old_next,
            keys: right_keys,
            rids: right_rids,
        };

        if old_next.is_valid() {
            let guard = self.latches.acquire(old_next);
            let mut next_node = self.read_node(old_next)?;
            next_node.as_leaf_mut().unwrap().prev = sibling_id;
            self.write_node(old_next, &next_node)?;
            drop(guard);
        }

        Ok((sibling_id, BTreeNode::Leaf(sibling), separator))
    }

    fn split_internal(
        &self,
        node: &mut BTreeNode,
        new_pages: &mut Vec<PageId>,
    ) -> DbResult<(PageId, BTreeNode, Key)> {
        let internal = node.as_internal_mut().unwrap();
        let total_keys = internal.keys.len();
        let mid = total_keys / 2;
        let separator = internal.keys[mid];

        let right_keys = internal.keys.split_off(mid + 1);
        internal.keys.truncate(mid);
        let right_children = internal.children.split_off(mid + 1);

        let sibling_id = self.bpm.new_page()?;
        new_pages.push(sibling_id);
        let sibling = InternalNode {
            keys: right_keys,
            children: right_children,
        };
        Ok((sibling_id, BTreeNode::Internal(sibling), separator))
    }

    fn insert_into_parent(
        &self,
        mut stack: Vec<(PageId, PageGuard)>,
        left_id: PageId,
        separator: Key,
        right_id: PageId,
        new_pages: &mut Vec<PageId>,
    ) -> DbResult<()> {
        match stack.pop() {
            None => {
                let new_root_id = self.bpm.new_page()?;
                new_pages.push(new_root_id);
                let mut root_node = BTreeNode::Internal(InternalNode::new(left_id));
                root_node.as_internal_mut().unwrap().insert(separator, right_id);
                self.write_node(new_root_id, &root_node)?;
                *self.root.lock().unwrap() = new_root_id;
                Ok(())
            }
            Some((parent_id, _guard)) => {
                let mut parent_node = self.read_node(parent_id)?;
                parent_node
                    .as_internal_mut()
                    .unwrap()
                    .insert(separator, right_id);

                if !parent_node.is_full(self.page_size) {
                    self.write_node(parent_id, &parent_node)?;
                    return Ok(());
                }

                let (sibling_id, sibling_node, new_separator) =
                    self.split_internal(&mut parent_node, new_pages)?;
                self.write_node(parent_id, &parent_node)?;
                self.write_node(sibling_id, &sibling_node)?;
                self.insert_into_parent(stack, parent_id, new_separator, sibling_id, new_pages)
            }
        }
    }

    /// Removes `key`. Returns `false` if it wasn't present. Rebalances the
    /// tree (borrowing from a sibling, or merging with one) whenever a node
    /// drops below the minimum key count, except the root, which is
    /// allowed to underflow freely and is only collapsed once it has zero
    /// keys left.
    pub fn delete(&self, key: &Key) -> DbResult<bool> {
        let root_id = *self.root.lock().unwrap();
        if !root_id.is_valid() {
            return Ok(false);
        }

        let mut stack: Vec<(PageId, PageGuard)> = Vec::new();
        let mut current = root_id;
        loop {
            let guard = self.latches.acquire(current);
            let node = self.read_node(current)?;
            if node.is_safe_for_delete(self.page_size) {
                stack.clear();
            }
            let is_leaf = node.is_leaf();
            let next = if is_leaf {
                None
            } else {
                Some(node.as_internal().unwrap().lookup_child(key))
            };
            stack.push((current, guard));
            match next {
                Some(child) => current = child,
                None => break,
            }
        }

        let (leaf_id, _) = *stack.last().unwrap();
        let mut leaf_page = self.read_node(leaf_id)?;
        let found = leaf_page.as_leaf_mut().unwrap().remove(key);
        if !found {
            return Ok(false);
        }
        self.write_node(leaf_id, &leaf_page)?;

        if stack.len() == 1 {
            if leaf_page.num_keys() == 0 {
                *self.root.lock().unwrap() = INVALID_PAGE_ID;
            }
            return Ok(true);
        }
        if leaf_page.num_keys() >= LeafNode::min_keys(self.page_size) {
            return Ok(true);
        }

        self.fixup_after_delete(stack)?;
        Ok(true)
    }

    fn fixup_after_delete(&self, mut stack: Vec<(PageId, PageGuard)>) -> DbResult<()> {
        loop {
            if stack.len() == 1 {
                let root_id = stack.last().unwrap().0;
                let root_node = self.read_node(root_id)?;
                if let BTreeNode::Internal(root_internal) = &root_node {
                    if root_internal.num_keys() == 0 {
                        let only_child = root_internal.children[0];
                        *self.root.lock().unwrap() = only_child;
                        self.bpm.delete_page(root_id)?;
                    }
                }
                return Ok(());
            }

            let child_id = stack.last().unwrap().0;
            let mut child_node = self.read_node(child_id)?;
            if child_node.num_keys() >= min_keys_for(&child_node, self.page_size) {
                return Ok(());
            }

            let parent_id = stack[stack.len() - 2].0;
            let mut parent_node = self.read_node(parent_id)?;
            let child_idx = parent_node
                .as_internal()
                .unwrap()
                .index_of_child(child_id)
                .ok_or_else(|| {
                    DbError::PageCorrupt("child missing from parent during delete fixup".into())
                })?;

            let left_id = (child_idx > 0)
                .then(|| parent_node.as_internal().unwrap().children[child_idx - 1]);
            let right_id = parent_node
                .as_internal()
                .unwrap()
                .children
                .get(child_idx + 1)
                .copied();

            if let Some(left_id) = left_id {
                let left_guard = self.latches.acquire(left_id);
                let mut left_node = self.read_node(left_id)?;
                if left_node.num_keys() > min_keys_for(&left_node, self.page_size) {
                    {
                        let parent = parent_node.as_internal_mut().unwrap();
                        match (&mut left_node, &mut child_node) {
                            (BTreeNode::Leaf(l), BTreeNode::Leaf(c)) => {
                                redistribute_leaf_from_left(parent, child_idx, l, c)
                            }
                            (BTreeNode::Internal(l), BTreeNode::Internal(c)) => {
                                redistribute_internal_from_left(parent, child_idx, l, c)
                            }
                            _ => unreachable!("siblings are always the same kind"),
                        }
                    }
                    self.write_node(left_id, &left_node)?;
                    self.write_node(child_id, &child_node)?;
                    self.write_node(parent_id, &parent_node)?;
                    drop(left_guard);
                    return Ok(());
                }
                drop(left_guard);
            }

            if let Some(right_id) = right_id {
                let right_guard = self.latches.acquire(right_id);
                let mut right_node = self.read_node(right_id)?;
                if right_node.num_keys() > min_keys_for(&right_node, self.page_size) {
                    {
                        let parent = parent_node.as_internal_mut().unwrap();
                        match (&mut child_node, &mut right_node) {
                            (BTreeNode::Leaf(c), BTreeNode::Leaf(r)) => {
                                redistribute_leaf_from_right(parent, child_idx, c, r)
                            }
                            (BTreeNode::Internal(c), BTreeNode::Internal(r)) => {
                                redistribute_internal_from_right(parent, child_idx, c, r)
                            }
                            _ => unreachable!("siblings are always the same kind"),
                        }
                    }
                    self.write_node(child_id, &child_node)?;
                    self.write_node(right_id, &right_node)?;
                    self.write_node(parent_id, &parent_node)?;
                    drop(right_guard);
                    return Ok(());
                }
                drop(right_guard);
            }

            if let Some(left_id) = left_id {
                let left_guard = self.latches.acquire(left_id);
                let mut left_node = self.read_node(left_id)?;
                let separator = parent_node.as_internal().unwrap().keys[child_idx - 1];
                match (&mut left_node, &child_node) {
                    (BTreeNode::Leaf(l), BTreeNode::Leaf(c)) => merge_leaves(l, c),
                    (BTreeNode::Internal(l), BTreeNode::Internal(c)) => {
                        merge_internals(separator, l, c)
                    }
                    _ => unreachable!("siblings are always the same kind"),
                }
                {
                    let parent = parent_node.as_internal_mut().unwrap();
                    parent.keys.remove(child_idx - 1);
                    parent.children.remove(child_idx);
                }
                self.write_node(left_id, &left_node)?;
                self.write_node(parent_id, &parent_node)?;
                drop(left_guard);
                self.bpm.delete_page(child_id)?;
            } else {
                let right_id = right_id.expect("an underflowing non-root node has a sibling");
                let right_guard = self.latches.acquire(right_id);
                let right_node = self.read_node(right_id)?;
                let separator = parent_node.as_internal().unwrap().keys[child_idx];
                match (&mut child_node, &right_node) {
                    (BTreeNode::Leaf(c), BTreeNode::Leaf(r)) => merge_leaves(c, r),
                    (BTreeNode::Internal(c), BTreeNode::Internal(r)) => {
                        merge_internals(separator, c, r)
                    }
                    _ => unreachable!("siblings are always the same kind"),
                }
                {
                    let parent = parent_node.as_internal_mut().unwrap();
                    parent.keys.remove(child_idx);
                    parent.children.remove(child_idx + 1);
                }
                self.write_node(child_id, &child_node)?;
                self.write_node(parent_id, &parent_node)?;
                drop(right_guard);
                self.bpm.delete_page(right_id)?;
            }

            stack.pop();
        }
    }
}
