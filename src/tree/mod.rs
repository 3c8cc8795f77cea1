//! The B+Tree access method: an ordered map from byte-string keys to blob
//! references.
//!
//! Nodes live on `BPlusTreeNode` pages. Leaves hold `(key, blob-ref)` entries
//! and form a doubly linked list in ascending key order; internal nodes hold
//! separator/child pairs plus a rightmost child, and are chained per level
//! the same way. Keys are compared lexicographically.
//!
//! Descent starts at the heading's access-method root. Inserts split
//! overflowing nodes upward; deletes redistribute from or merge with a
//! sibling under the same parent, collapsing the root when it is left with a
//! single child. A node is in overflow when its body does not fit the page,
//! and in underflow when more than half of the body capacity is free.

use crate::blob;
use crate::error::{Error, Result};
use crate::fsm::FreeSpaceMap;
use crate::page::headers::{HeadingPageHeader, NodePageHeader};
use crate::page::{class_of_free, Page, NIL_PAGE};
use crate::store::PageStore;

pub mod iterator;
pub mod node;

use node::{InternalEntry, LeafEntry};

/// Upper bound on tree depth; descents past it indicate a cycle.
const MAX_DEPTH: usize = 64;

/// The B+Tree over one page store, borrowed per operation.
///
/// The tree owns no state of its own: the root index lives in the heading,
/// nodes are short-lived page buffers and parents are resolved through the
/// page store on demand.
pub struct Tree<'a> {
    store: &'a mut PageStore,
    fsm: &'a mut FreeSpaceMap,
    heading: &'a mut HeadingPageHeader,
}

impl<'a> Tree<'a> {
    pub fn new(
        store: &'a mut PageStore,
        fsm: &'a mut FreeSpaceMap,
        heading: &'a mut HeadingPageHeader,
    ) -> Tree<'a> {
        Tree {
            store,
            fsm,
            heading,
        }
    }

    /// Create the initial empty root leaf and point the heading at it.
    pub fn init_root(&mut self) -> Result<()> {
        let index = self.fsm.allocate_empty(self.store)?;
        let header = NodePageHeader {
            parent_page_index: NIL_PAGE,
            previous_page_index: NIL_PAGE,
            next_page_index: NIL_PAGE,
            is_leaf: true,
        };
        self.write_leaf_node(index, &header, &[])?;
        self.heading.access_method_page_index = index;
        self.write_heading()
    }

    /// Look up the value stored under `key`.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf = *self.descend(key)?.last().unwrap();
        let (page, _) = self.fetch_node(leaf)?;
        let entries = node::decode_leaf(&page)?;
        match search(&entries, key) {
            Ok(i) => Ok(Some(blob::read(self.store, &entries[i].blob)?)),
            Err(_) => Ok(None),
        }
    }

    /// Whether `key` is present, without reading its value.
    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        let leaf = *self.descend(key)?.last().unwrap();
        let (page, _) = self.fetch_node(leaf)?;
        let entries = node::decode_leaf(&page)?;
        Ok(search(&entries, key).is_ok())
    }

    /// Insert or overwrite the value under `key`.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let max = node::max_key_size(self.store.page_size());
        if key.len() > max {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max,
            });
        }

        let path = self.descend(key)?;
        let leaf = *path.last().unwrap();
        let (page, header) = self.fetch_node(leaf)?;
        let mut entries = node::decode_leaf(&page)?;
        match search(&entries, key) {
            Ok(i) => {
                // Same key: the old blob goes first, then the replacement is
                // installed in place. The reference is fixed-size, so the
                // node cannot overflow.
                let old = entries[i].blob;
                blob::release(self.store, self.fsm, &old)?;
                entries[i].blob = blob::write(self.store, self.fsm, value)?;
                self.write_leaf_node(leaf, &header, &entries)
            }
            Err(i) => {
                let blob = blob::write(self.store, self.fsm, value)?;
                entries.insert(
                    i,
                    LeafEntry {
                        key: key.to_vec(),
                        blob,
                    },
                );
                if node::leaf_used(&entries) <= self.capacity() {
                    self.write_leaf_node(leaf, &header, &entries)
                } else {
                    self.split_leaf(&path, header, entries)
                }
            }
        }
    }

    /// Remove `key` and release its blob. Returns whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let path = self.descend(key)?;
        let leaf = *path.last().unwrap();
        let (page, header) = self.fetch_node(leaf)?;
        let mut entries = node::decode_leaf(&page)?;
        let Ok(i) = search(&entries, key) else {
            return Ok(false);
        };
        let removed = entries.remove(i);
        blob::release(self.store, self.fsm, &removed.blob)?;
        let used = node::leaf_used(&entries);
        self.write_leaf_node(leaf, &header, &entries)?;
        if self.is_underflow(used) {
            self.rebalance(path)?;
        }
        Ok(true)
    }

    /// The number of stored entries, by walking the leaf chain.
    pub fn count(&mut self) -> Result<u64> {
        let mut index = self.leftmost_leaf()?;
        let mut total = 0u64;
        let mut visited: i64 = 0;
        while index != NIL_PAGE {
            visited += 1;
            if visited > self.store.page_count() {
                return Err(Error::StorageFormat(
                    "leaf sibling chain does not terminate".into(),
                ));
            }
            let (page, header) = self.fetch_node(index)?;
            if !header.is_leaf {
                return Err(Error::StorageFormat(format!(
                    "page {index} in the leaf chain is not a leaf"
                )));
            }
            total += node::decode_leaf(&page)?.len() as u64;
            index = header.next_page_index;
        }
        Ok(total)
    }

    /// The smallest stored key.
    pub fn first_key(&mut self) -> Result<Option<Vec<u8>>> {
        let leaf = self.leftmost_leaf()?;
        let (page, _) = self.fetch_node(leaf)?;
        Ok(node::decode_leaf(&page)?.first().map(|e| e.key.clone()))
    }

    /// The largest stored key.
    pub fn last_key(&mut self) -> Result<Option<Vec<u8>>> {
        let leaf = self.rightmost_leaf()?;
        let (page, _) = self.fetch_node(leaf)?;
        Ok(node::decode_leaf(&page)?.last().map(|e| e.key.clone()))
    }

    /// The smallest stored key strictly greater than `key`.
    pub fn next_key(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf = *self.descend(key)?.last().unwrap();
        let (page, header) = self.fetch_node(leaf)?;
        let entries = node::decode_leaf(&page)?;
        let pos = entries.partition_point(|e| e.key.as_slice() <= key);
        if pos < entries.len() {
            return Ok(Some(entries[pos].key.clone()));
        }
        if header.next_page_index == NIL_PAGE {
            return Ok(None);
        }
        let (next, _) = self.fetch_node(header.next_page_index)?;
        // Leaves other than an empty root always hold at least one entry.
        Ok(node::decode_leaf(&next)?.first().map(|e| e.key.clone()))
    }

    /// The largest stored key strictly less than `key`.
    pub fn previous_key(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf = *self.descend(key)?.last().unwrap();
        let (page, header) = self.fetch_node(leaf)?;
        let entries = node::decode_leaf(&page)?;
        let pos = entries.partition_point(|e| e.key.as_slice() < key);
        if pos > 0 {
            return Ok(Some(entries[pos - 1].key.clone()));
        }
        if header.previous_page_index == NIL_PAGE {
            return Ok(None);
        }
        let (prev, _) = self.fetch_node(header.previous_page_index)?;
        Ok(node::decode_leaf(&prev)?.last().map(|e| e.key.clone()))
    }

    fn capacity(&self) -> usize {
        node::body_capacity(self.store.page_size())
    }

    fn is_underflow(&self, used: usize) -> bool {
        self.capacity() - used > self.capacity() / 2
    }

    fn root(&self) -> i64 {
        self.heading.access_method_page_index
    }

    fn write_heading(&mut self) -> Result<()> {
        let mut page = self.store.fetch_page(0)?;
        self.heading.encode_to(&mut page);
        self.store.update_page(page)
    }

    fn fetch_node(&mut self, index: i64) -> Result<(Page, NodePageHeader)> {
        let page = self.store.fetch_page(index)?;
        let header = NodePageHeader::decode(&page)?;
        Ok((page, header))
    }

    /// Walk from the root to the leaf owning `key`, returning every page
    /// index on the way, leaf last.
    fn descend(&mut self, key: &[u8]) -> Result<Vec<i64>> {
        let mut path = Vec::new();
        let mut index = self.root();
        loop {
            if path.len() >= MAX_DEPTH {
                return Err(Error::StorageFormat(
                    "tree descent does not terminate".into(),
                ));
            }
            let (page, header) = self.fetch_node(index)?;
            path.push(index);
            if header.is_leaf {
                return Ok(path);
            }
            let (entries, rightmost) = node::decode_internal(&page)?;
            // Least separator strictly greater than the key bounds the
            // subtree; the rightmost child takes everything at or past the
            // last separator.
            let pos = entries.partition_point(|e| e.key.as_slice() <= key);
            index = if pos < entries.len() {
                entries[pos].child
            } else {
                rightmost
            };
        }
    }

    fn leftmost_leaf(&mut self) -> Result<i64> {
        self.edge_leaf(true)
    }

    fn rightmost_leaf(&mut self) -> Result<i64> {
        self.edge_leaf(false)
    }

    fn edge_leaf(&mut self, leftmost: bool) -> Result<i64> {
        let mut index = self.root();
        for _ in 0..MAX_DEPTH {
            let (page, header) = self.fetch_node(index)?;
            if header.is_leaf {
                return Ok(index);
            }
            let (entries, rightmost) = node::decode_internal(&page)?;
            index = if leftmost {
                entries.first().map(|e| e.child).unwrap_or(rightmost)
            } else {
                rightmost
            };
        }
        Err(Error::StorageFormat(
            "tree descent does not terminate".into(),
        ))
    }

    /// Rebuild a leaf page from its header and entries, refreshing the size
    /// class here and in the free-space map.
    fn write_leaf_node(
        &mut self,
        index: i64,
        header: &NodePageHeader,
        entries: &[LeafEntry],
    ) -> Result<()> {
        let mut page = Page::zeroed(index, self.store.page_size());
        header.encode_to(&mut page);
        node::encode_leaf(&mut page, entries);
        let class = class_of_free(self.capacity() - node::leaf_used(entries), page.len());
        page.set_size_class(class);
        self.store.update_page(page)?;
        self.fsm.set_class(self.store, index, class)
    }

    /// Rebuild an internal page, as [`Self::write_leaf_node`].
    fn write_internal_node(
        &mut self,
        index: i64,
        header: &NodePageHeader,
        entries: &[InternalEntry],
        rightmost: i64,
    ) -> Result<()> {
        let mut page = Page::zeroed(index, self.store.page_size());
        header.encode_to(&mut page);
        node::encode_internal(&mut page, entries, rightmost);
        let class = class_of_free(self.capacity() - node::internal_used(entries), page.len());
        page.set_size_class(class);
        self.store.update_page(page)?;
        self.fsm.set_class(self.store, index, class)
    }

    /// Rewrite only the header of an existing node, leaving the body alone.
    fn patch_header(&mut self, index: i64, patch: impl FnOnce(&mut NodePageHeader)) -> Result<()> {
        let (mut page, mut header) = self.fetch_node(index)?;
        patch(&mut header);
        header.encode_to(&mut page);
        self.store.update_page(page)
    }

    fn set_parent(&mut self, child: i64, parent: i64) -> Result<()> {
        self.patch_header(child, |h| h.parent_page_index = parent)
    }

    /// Return a node page to the free-space map.
    fn free_node_page(&mut self, index: i64) -> Result<()> {
        self.store.remove_page(index)?;
        self.fsm.release(self.store, index)
    }

    fn split_leaf(
        &mut self,
        path: &[i64],
        mut header: NodePageHeader,
        mut entries: Vec<LeafEntry>,
    ) -> Result<()> {
        let leaf = *path.last().unwrap();
        let m = node::split_point_by_size(
            entries.iter().map(|e| node::leaf_entry_size(e.key.len())),
            1,
            entries.len() - 1,
        );
        let right_entries = entries.split_off(m);
        let split_key = right_entries[0].key.clone();

        let right = self.fsm.allocate_empty(self.store)?;
        let right_header = NodePageHeader {
            parent_page_index: header.parent_page_index,
            previous_page_index: leaf,
            next_page_index: header.next_page_index,
            is_leaf: true,
        };
        if header.next_page_index != NIL_PAGE {
            self.patch_header(header.next_page_index, |h| h.previous_page_index = right)?;
        }
        header.next_page_index = right;

        self.write_leaf_node(leaf, &header, &entries)?;
        self.write_leaf_node(right, &right_header, &right_entries)?;
        log::debug!("split leaf {leaf}, new right sibling {right}");

        self.insert_into_parent(&path[..path.len() - 1], leaf, split_key, right)
    }

    fn split_internal(
        &mut self,
        path: &[i64],
        mut header: NodePageHeader,
        mut entries: Vec<InternalEntry>,
        rightmost: i64,
    ) -> Result<()> {
        let index = *path.last().unwrap();
        debug_assert!(entries.len() >= 3);
        let m = node::split_point_by_size(
            entries
                .iter()
                .map(|e| node::internal_entry_size(e.key.len())),
            1,
            entries.len() - 2,
        );
        let mut right_entries = entries.split_off(m);
        // The median moves up: its child becomes the left node's rightmost.
        let median = right_entries.remove(0);
        let left_rightmost = median.child;
        let split_key = median.key;

        let right = self.fsm.allocate_empty(self.store)?;
        let right_header = NodePageHeader {
            parent_page_index: header.parent_page_index,
            previous_page_index: index,
            next_page_index: header.next_page_index,
            is_leaf: false,
        };
        if header.next_page_index != NIL_PAGE {
            self.patch_header(header.next_page_index, |h| h.previous_page_index = right)?;
        }
        header.next_page_index = right;

        self.write_internal_node(index, &header, &entries, left_rightmost)?;
        self.write_internal_node(right, &right_header, &right_entries, rightmost)?;
        for entry in &right_entries {
            self.set_parent(entry.child, right)?;
        }
        self.set_parent(rightmost, right)?;
        log::debug!("split internal node {index}, new right sibling {right}");

        self.insert_into_parent(&path[..path.len() - 1], index, split_key, right)
    }

    /// Install `(key, right)` produced by splitting `left` into its parent,
    /// growing a new root when `left` was the root.
    fn insert_into_parent(&mut self, path: &[i64], left: i64, key: Vec<u8>, right: i64) -> Result<()> {
        let Some(&parent) = path.last() else {
            let root = self.fsm.allocate_empty(self.store)?;
            let header = NodePageHeader {
                parent_page_index: NIL_PAGE,
                previous_page_index: NIL_PAGE,
                next_page_index: NIL_PAGE,
                is_leaf: false,
            };
            let entries = vec![InternalEntry { key, child: left }];
            self.write_internal_node(root, &header, &entries, right)?;
            self.set_parent(left, root)?;
            self.set_parent(right, root)?;
            self.heading.access_method_page_index = root;
            self.write_heading()?;
            log::debug!("tree grew a level, new root {root}");
            return Ok(());
        };

        let (page, header) = self.fetch_node(parent)?;
        let (mut entries, mut rightmost) = node::decode_internal(&page)?;
        if let Some(i) = entries.iter().position(|e| e.child == left) {
            // The old separator now bounds the right node.
            entries[i].child = right;
            entries.insert(i, InternalEntry { key, child: left });
        } else if rightmost == left {
            entries.push(InternalEntry { key, child: left });
            rightmost = right;
        } else {
            return Err(Error::StorageFormat(format!(
                "node {parent} is not the parent of {left}"
            )));
        }
        self.set_parent(right, parent)?;

        if node::internal_used(&entries) <= self.capacity() {
            self.write_internal_node(parent, &header, &entries, rightmost)
        } else {
            self.split_internal(path, header, entries, rightmost)
        }
    }

    /// Restore min-occupancy along `path` after a removal, bottom up.
    fn rebalance(&mut self, mut path: Vec<i64>) -> Result<()> {
        loop {
            let index = *path.last().unwrap();
            let (page, header) = self.fetch_node(index)?;

            if path.len() == 1 {
                // The root is exempt from min-occupancy; an internal root
                // left with a single child hands it the crown.
                if !header.is_leaf {
                    let (entries, rightmost) = node::decode_internal(&page)?;
                    if entries.is_empty() {
                        self.set_parent(rightmost, NIL_PAGE)?;
                        self.heading.access_method_page_index = rightmost;
                        self.write_heading()?;
                        self.free_node_page(index)?;
                        log::debug!("tree shrank a level, root now {rightmost}");
                    }
                }
                return Ok(());
            }

            if !self.is_underflow(node::body_used(&page, header.is_leaf)?) {
                return Ok(());
            }

            let parent = path[path.len() - 2];
            let (parent_page, parent_header) = self.fetch_node(parent)?;
            let (parent_entries, parent_rightmost) = node::decode_internal(&parent_page)?;
            let pos = child_position(&parent_entries, parent_rightmost, index).ok_or_else(|| {
                Error::StorageFormat(format!("node {parent} is not the parent of {index}"))
            })?;

            // Prefer the left sibling; at the leftmost position the node
            // itself plays the left role against its right sibling.
            let (a, b, sep) = if pos > 0 {
                (
                    child_at(&parent_entries, parent_rightmost, pos - 1),
                    index,
                    pos - 1,
                )
            } else {
                if parent_entries.is_empty() {
                    return Err(Error::StorageFormat(format!(
                        "underflowing node {index} has no sibling under {parent}"
                    )));
                }
                (
                    index,
                    child_at(&parent_entries, parent_rightmost, 1),
                    0,
                )
            };

            let outcome = if header.is_leaf {
                self.settle_leaves(a, b, sep, parent, parent_header, parent_entries, parent_rightmost)?
            } else {
                self.settle_internal(a, b, sep, parent, parent_header, parent_entries, parent_rightmost)?
            };

            match outcome {
                Settled::Done => return Ok(()),
                Settled::ParentUnderflow => {
                    path.pop();
                }
            }
        }
    }

    /// Merge or redistribute the adjacent leaves `a` (left) and `b` (right),
    /// then update their separator in the parent.
    #[allow(clippy::too_many_arguments)]
    fn settle_leaves(
        &mut self,
        a: i64,
        b: i64,
        sep: usize,
        parent: i64,
        parent_header: NodePageHeader,
        mut parent_entries: Vec<InternalEntry>,
        mut parent_rightmost: i64,
    ) -> Result<Settled> {
        let (a_page, mut a_header) = self.fetch_node(a)?;
        let mut a_entries = node::decode_leaf(&a_page)?;
        let (b_page, b_header) = self.fetch_node(b)?;
        let b_entries = node::decode_leaf(&b_page)?;

        let combined = node::leaf_used(&a_entries) + node::leaf_used(&b_entries) - 2;
        if combined <= self.capacity() {
            // Merge b into a.
            a_entries.extend(b_entries);
            a_header.next_page_index = b_header.next_page_index;
            if b_header.next_page_index != NIL_PAGE {
                self.patch_header(b_header.next_page_index, |h| h.previous_page_index = a)?;
            }
            self.write_leaf_node(a, &a_header, &a_entries)?;
            self.free_node_page(b)?;
            log::debug!("merged leaf {b} into {a}");

            remove_merged_child(&mut parent_entries, &mut parent_rightmost, sep, a, b)?;
            let used = node::internal_used(&parent_entries);
            self.write_internal_node(parent, &parent_header, &parent_entries, parent_rightmost)?;
            if self.is_underflow(used) {
                return Ok(Settled::ParentUnderflow);
            }
            return Ok(Settled::Done);
        }

        // Redistribute across the boundary and refresh the separator.
        let mut all = a_entries;
        all.extend(b_entries);
        let m = node::split_point_by_size(
            all.iter().map(|e| node::leaf_entry_size(e.key.len())),
            1,
            all.len() - 1,
        );
        let b_new = all.split_off(m);
        let new_sep = b_new[0].key.clone();
        self.write_leaf_node(a, &a_header, &all)?;
        self.write_leaf_node(b, &b_header, &b_new)?;
        log::debug!("redistributed leaves {a} and {b}");

        parent_entries[sep].key = new_sep;
        self.rewrite_separator_parent(parent, parent_header, parent_entries, parent_rightmost)
    }

    /// Merge or redistribute the adjacent internal nodes `a` and `b`. The
    /// parent separator moves down on merge and rotates on redistribution.
    #[allow(clippy::too_many_arguments)]
    fn settle_internal(
        &mut self,
        a: i64,
        b: i64,
        sep: usize,
        parent: i64,
        parent_header: NodePageHeader,
        mut parent_entries: Vec<InternalEntry>,
        mut parent_rightmost: i64,
    ) -> Result<Settled> {
        let (a_page, mut a_header) = self.fetch_node(a)?;
        let (a_entries, a_rightmost) = node::decode_internal(&a_page)?;
        let (b_page, b_header) = self.fetch_node(b)?;
        let (b_entries, b_rightmost) = node::decode_internal(&b_page)?;

        // The separator comes down between the two runs of entries.
        let moved: Vec<i64> = b_entries
            .iter()
            .map(|e| e.child)
            .chain(std::iter::once(b_rightmost))
            .collect();
        let mut all = a_entries;
        all.push(InternalEntry {
            key: parent_entries[sep].key.clone(),
            child: a_rightmost,
        });
        all.extend(b_entries);

        if node::internal_used(&all) <= self.capacity() {
            // Merge b into a.
            a_header.next_page_index = b_header.next_page_index;
            if b_header.next_page_index != NIL_PAGE {
                self.patch_header(b_header.next_page_index, |h| h.previous_page_index = a)?;
            }
            self.write_internal_node(a, &a_header, &all, b_rightmost)?;
            for child in moved {
                self.set_parent(child, a)?;
            }
            self.free_node_page(b)?;
            log::debug!("merged internal node {b} into {a}");

            remove_merged_child(&mut parent_entries, &mut parent_rightmost, sep, a, b)?;
            let used = node::internal_used(&parent_entries);
            self.write_internal_node(parent, &parent_header, &parent_entries, parent_rightmost)?;
            if self.is_underflow(used) {
                return Ok(Settled::ParentUnderflow);
            }
            return Ok(Settled::Done);
        }

        // Redistribute: split the pooled entries, rotating the median key
        // through the parent.
        let m = node::split_point_by_size(
            all.iter().map(|e| node::internal_entry_size(e.key.len())),
            1,
            all.len() - 2,
        );
        let mut b_new = all.split_off(m);
        let median = b_new.remove(0);
        let a_new = all;
        let a_new_rightmost = median.child;

        self.write_internal_node(a, &a_header, &a_new, a_new_rightmost)?;
        self.write_internal_node(b, &b_header, &b_new, b_rightmost)?;
        for entry in &a_new {
            self.set_parent(entry.child, a)?;
        }
        self.set_parent(a_new_rightmost, a)?;
        for entry in &b_new {
            self.set_parent(entry.child, b)?;
        }
        self.set_parent(b_rightmost, b)?;
        log::debug!("redistributed internal nodes {a} and {b}");

        parent_entries[sep].key = median.key;
        self.rewrite_separator_parent(parent, parent_header, parent_entries, parent_rightmost)
    }

    /// Write the parent back after a separator change, splitting it when the
    /// new separator no longer fits.
    fn rewrite_separator_parent(
        &mut self,
        parent: i64,
        parent_header: NodePageHeader,
        parent_entries: Vec<InternalEntry>,
        parent_rightmost: i64,
    ) -> Result<Settled> {
        let used = node::internal_used(&parent_entries);
        if used > self.capacity() {
            let parent_path = self.path_to(parent)?;
            self.split_internal(&parent_path, parent_header, parent_entries, parent_rightmost)?;
            return Ok(Settled::Done);
        }
        self.write_internal_node(parent, &parent_header, &parent_entries, parent_rightmost)?;
        if self.is_underflow(used) {
            Ok(Settled::ParentUnderflow)
        } else {
            Ok(Settled::Done)
        }
    }

    /// Reconstruct the root path of `index` through parent links.
    fn path_to(&mut self, index: i64) -> Result<Vec<i64>> {
        let mut path = vec![index];
        let mut current = index;
        while current != self.root() {
            if path.len() >= MAX_DEPTH {
                return Err(Error::StorageFormat(
                    "parent chain does not terminate".into(),
                ));
            }
            let (_, header) = self.fetch_node(current)?;
            if header.parent_page_index == NIL_PAGE {
                return Err(Error::StorageFormat(format!(
                    "node {current} has no parent but is not the root"
                )));
            }
            current = header.parent_page_index;
            path.push(current);
        }
        path.reverse();
        Ok(path)
    }
}

enum Settled {
    Done,
    ParentUnderflow,
}

/// Position of `child` among the parent's children, `entries.len()` meaning
/// the rightmost slot.
fn child_position(entries: &[InternalEntry], rightmost: i64, child: i64) -> Option<usize> {
    if let Some(i) = entries.iter().position(|e| e.child == child) {
        Some(i)
    } else if rightmost == child {
        Some(entries.len())
    } else {
        None
    }
}

fn child_at(entries: &[InternalEntry], rightmost: i64, pos: usize) -> i64 {
    if pos < entries.len() {
        entries[pos].child
    } else {
        rightmost
    }
}

/// After merging `b` into `a`, drop the separator at `sep` and rewire the
/// child slot that referenced `b`.
fn remove_merged_child(
    entries: &mut Vec<InternalEntry>,
    rightmost: &mut i64,
    sep: usize,
    a: i64,
    b: i64,
) -> Result<()> {
    entries.remove(sep);
    if sep < entries.len() {
        if entries[sep].child != b {
            return Err(Error::StorageFormat(format!(
                "separator {sep} does not bound merged child {b}"
            )));
        }
        entries[sep].child = a;
    } else {
        if *rightmost != b {
            return Err(Error::StorageFormat(format!(
                "rightmost child is not the merged node {b}"
            )));
        }
        *rightmost = a;
    }
    Ok(())
}

fn search(entries: &[LeafEntry], key: &[u8]) -> std::result::Result<usize, usize> {
    entries.binary_search_by(|e| e.key.as_slice().cmp(key))
}
