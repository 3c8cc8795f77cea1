//! Ascending range scans over the leaf sibling chain.

use crate::blob;
use crate::error::{Error, Result};
use crate::page::NIL_PAGE;
use crate::tree::{node, Tree};

/// Iterator over `(key, value)` pairs in ascending key order, from an
/// inclusive lower bound to an exclusive upper bound.
///
/// Entries of the current leaf are buffered; advancing to the next leaf
/// follows the sibling chain.
pub struct RangeIter<'t, 'a> {
    tree: &'t mut Tree<'a>,
    entries: Vec<node::LeafEntry>,
    pos: usize,
    next_leaf: i64,
    upper: Option<Vec<u8>>,
    visited: i64,
    done: bool,
}

impl<'a> Tree<'a> {
    /// Scan keys in `[lower, upper)`; an absent `upper` scans to the end.
    pub fn range<'t>(
        &'t mut self,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> Result<RangeIter<'t, 'a>> {
        let leaf = *self.descend(lower)?.last().unwrap();
        let (page, header) = self.fetch_node(leaf)?;
        let entries = node::decode_leaf(&page)?;
        let pos = entries.partition_point(|e| e.key.as_slice() < lower);
        Ok(RangeIter {
            tree: self,
            entries,
            pos,
            next_leaf: header.next_page_index,
            upper: upper.map(|u| u.to_vec()),
            visited: 1,
            done: false,
        })
    }
}

impl RangeIter<'_, '_> {
    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if self.pos < self.entries.len() {
                let entry = &self.entries[self.pos];
                if let Some(upper) = &self.upper {
                    if entry.key >= *upper {
                        self.done = true;
                        return Ok(None);
                    }
                }
                self.pos += 1;
                let key = self.entries[self.pos - 1].key.clone();
                let value = blob::read(self.tree.store, &self.entries[self.pos - 1].blob)?;
                return Ok(Some((key, value)));
            }

            if self.next_leaf == NIL_PAGE {
                self.done = true;
                return Ok(None);
            }
            self.visited += 1;
            if self.visited > self.tree.store.page_count() {
                return Err(Error::StorageFormat(
                    "leaf sibling chain does not terminate".into(),
                ));
            }
            let (page, header) = self.tree.fetch_node(self.next_leaf)?;
            if !header.is_leaf {
                return Err(Error::StorageFormat(format!(
                    "page {} in the leaf chain is not a leaf",
                    self.next_leaf
                )));
            }
            self.entries = node::decode_leaf(&page)?;
            self.pos = 0;
            self.next_leaf = header.next_page_index;
        }
    }
}

impl Iterator for RangeIter<'_, '_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
