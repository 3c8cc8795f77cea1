//! B+Tree node body codecs.
//!
//! Both node kinds share the slotted layout: an entry count, a cell-pointer
//! array of absolute offsets ordered by key, and cells packed toward the page
//! end.
//!
//! Leaf body (offsets relative to the page, body starts at the header end):
//!
//! ```rust,ignore
//! n: u16                    // offset 30
//! cell_pointers: [u16; n]   // offset 32
//! padding: [u8]
//! cells: [key_len: u16, key: [u8], blob_ref: [u8; 11]]
//! ```
//!
//! Internal body:
//!
//! ```rust,ignore
//! n: u16                    // offset 30
//! rightmost_child: i64      // offset 32
//! cell_pointers: [u16; n]   // offset 40
//! padding: [u8]
//! cells: [key_len: u16, key: [u8], child: i64]
//! ```
//!
//! An internal node with `n` separators references `n + 1` children; for each
//! entry, every key of the referenced subtree is strictly less than the
//! separator, and the rightmost child holds the rest.
//!
//! Mutations do not edit bodies in place: the caller decodes to entry
//! vectors, edits those, and re-encodes, so release holes never accumulate.

use crate::blob::{BlobRef, BLOB_REF_SIZE};
use crate::error::{Error, Result};
use crate::page::headers::NodePageHeader;
use crate::page::{Page, NIL_PAGE};

const BODY: usize = NodePageHeader::LENGTH;
const LEAF_DIR: usize = BODY + 2;
const INTERNAL_DIR: usize = BODY + 2 + 8;

/// One leaf entry: a key and the reference to its value blob.
#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub blob: BlobRef,
}

/// One internal entry: a separator key and the child it bounds.
#[derive(Debug, Clone)]
pub struct InternalEntry {
    pub key: Vec<u8>,
    pub child: i64,
}

/// Usable body bytes of a node page.
pub fn body_capacity(page_size: usize) -> usize {
    page_size - BODY
}

/// Largest accepted key: an eighth of the page size, which keeps at least
/// four entries per node.
pub fn max_key_size(page_size: usize) -> usize {
    page_size / 8
}

pub fn leaf_entry_size(key_len: usize) -> usize {
    // cell pointer + key_len field + key + blob reference
    2 + 2 + key_len + BLOB_REF_SIZE
}

pub fn internal_entry_size(key_len: usize) -> usize {
    // cell pointer + key_len field + key + child index
    2 + 2 + key_len + 8
}

/// Body bytes used by a leaf holding `entries`.
pub fn leaf_used(entries: &[LeafEntry]) -> usize {
    2 + entries
        .iter()
        .map(|e| leaf_entry_size(e.key.len()))
        .sum::<usize>()
}

/// Body bytes used by an internal node holding `entries`.
pub fn internal_used(entries: &[InternalEntry]) -> usize {
    2 + 8
        + entries
            .iter()
            .map(|e| internal_entry_size(e.key.len()))
            .sum::<usize>()
}

pub fn encode_leaf(page: &mut Page, entries: &[LeafEntry]) {
    debug_assert!(leaf_used(entries) <= body_capacity(page.len()));
    page[BODY..].fill(0);
    page[BODY..BODY + 2].copy_from_slice(&(entries.len() as u16).to_le_bytes());
    let mut cursor = page.len();
    for (i, entry) in entries.iter().enumerate() {
        cursor -= 2 + entry.key.len() + BLOB_REF_SIZE;
        let at = LEAF_DIR + i * 2;
        page[at..at + 2].copy_from_slice(&(cursor as u16).to_le_bytes());
        page[cursor..cursor + 2].copy_from_slice(&(entry.key.len() as u16).to_le_bytes());
        page[cursor + 2..cursor + 2 + entry.key.len()].copy_from_slice(&entry.key);
        entry
            .blob
            .encode_to(&mut page[cursor + 2 + entry.key.len()..cursor + 2 + entry.key.len() + BLOB_REF_SIZE]);
    }
}

pub fn decode_leaf(page: &Page) -> Result<Vec<LeafEntry>> {
    let n = u16::from_le_bytes([page[BODY], page[BODY + 1]]) as usize;
    let dir_end = LEAF_DIR + n * 2;
    if dir_end > page.len() {
        return Err(corrupt(page, "cell directory overruns the page"));
    }
    let mut entries = Vec::with_capacity(n);
    for i in 0..n {
        let at = LEAF_DIR + i * 2;
        let offset = u16::from_le_bytes([page[at], page[at + 1]]) as usize;
        if offset < dir_end || offset + 2 > page.len() {
            return Err(corrupt(page, "cell offset out of range"));
        }
        let key_len = u16::from_le_bytes([page[offset], page[offset + 1]]) as usize;
        let end = offset + 2 + key_len + BLOB_REF_SIZE;
        if end > page.len() {
            return Err(corrupt(page, "cell overruns the page"));
        }
        let key = page[offset + 2..offset + 2 + key_len].to_vec();
        let blob = BlobRef::decode(&page[offset + 2 + key_len..end])?;
        entries.push(LeafEntry { key, blob });
    }
    if !strictly_ascending(entries.iter().map(|e| &e.key)) {
        return Err(corrupt(page, "leaf keys are not strictly ascending"));
    }
    Ok(entries)
}

pub fn encode_internal(page: &mut Page, entries: &[InternalEntry], rightmost: i64) {
    debug_assert!(internal_used(entries) <= body_capacity(page.len()));
    debug_assert!(rightmost != NIL_PAGE);
    page[BODY..].fill(0);
    page[BODY..BODY + 2].copy_from_slice(&(entries.len() as u16).to_le_bytes());
    page[BODY + 2..BODY + 10].copy_from_slice(&rightmost.to_le_bytes());
    let mut cursor = page.len();
    for (i, entry) in entries.iter().enumerate() {
        cursor -= 2 + entry.key.len() + 8;
        let at = INTERNAL_DIR + i * 2;
        page[at..at + 2].copy_from_slice(&(cursor as u16).to_le_bytes());
        page[cursor..cursor + 2].copy_from_slice(&(entry.key.len() as u16).to_le_bytes());
        page[cursor + 2..cursor + 2 + entry.key.len()].copy_from_slice(&entry.key);
        page[cursor + 2 + entry.key.len()..cursor + 2 + entry.key.len() + 8]
            .copy_from_slice(&entry.child.to_le_bytes());
    }
}

pub fn decode_internal(page: &Page) -> Result<(Vec<InternalEntry>, i64)> {
    let n = u16::from_le_bytes([page[BODY], page[BODY + 1]]) as usize;
    // UNWRAP: the body always holds the rightmost child field.
    let rightmost = i64::from_le_bytes(page[BODY + 2..BODY + 10].try_into().unwrap());
    if rightmost == NIL_PAGE {
        return Err(corrupt(page, "internal node has no rightmost child"));
    }
    let dir_end = INTERNAL_DIR + n * 2;
    if dir_end > page.len() {
        return Err(corrupt(page, "cell directory overruns the page"));
    }
    let mut entries = Vec::with_capacity(n);
    for i in 0..n {
        let at = INTERNAL_DIR + i * 2;
        let offset = u16::from_le_bytes([page[at], page[at + 1]]) as usize;
        if offset < dir_end || offset + 2 > page.len() {
            return Err(corrupt(page, "cell offset out of range"));
        }
        let key_len = u16::from_le_bytes([page[offset], page[offset + 1]]) as usize;
        let end = offset + 2 + key_len + 8;
        if end > page.len() {
            return Err(corrupt(page, "cell overruns the page"));
        }
        let key = page[offset + 2..offset + 2 + key_len].to_vec();
        // UNWRAP: bounds checked above.
        let child = i64::from_le_bytes(page[offset + 2 + key_len..end].try_into().unwrap());
        if child == NIL_PAGE {
            return Err(corrupt(page, "separator references no child"));
        }
        entries.push(InternalEntry { key, child });
    }
    if !strictly_ascending(entries.iter().map(|e| &e.key)) {
        return Err(corrupt(page, "separators are not strictly ascending"));
    }
    Ok((entries, rightmost))
}

/// Body bytes used by the node, leaf or internal.
pub fn body_used(page: &Page, is_leaf: bool) -> Result<usize> {
    if is_leaf {
        Ok(leaf_used(&decode_leaf(page)?))
    } else {
        let (entries, _) = decode_internal(page)?;
        Ok(internal_used(&entries))
    }
}

/// Index of the first entry sized past half the total, the split point that
/// leaves both halves near 50% occupancy. Clamped to `[min, max]`.
pub fn split_point_by_size(sizes: impl Iterator<Item = usize>, min: usize, max: usize) -> usize {
    let sizes: Vec<usize> = sizes.collect();
    let total: usize = sizes.iter().sum();
    let mut acc = 0;
    let mut point = sizes.len();
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc * 2 >= total {
            point = i + 1;
            break;
        }
    }
    point.clamp(min, max)
}

fn strictly_ascending<'a>(keys: impl Iterator<Item = &'a Vec<u8>>) -> bool {
    let mut prev: Option<&Vec<u8>> = None;
    for key in keys {
        if let Some(p) = prev {
            if p >= key {
                return false;
            }
        }
        prev = Some(key);
    }
    true
}

fn corrupt(page: &Page, what: &str) -> Error {
    Error::StorageFormat(format!("node page {}: {what}", page.index()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::SizeClass;

    fn leaf_entry(key: &[u8]) -> LeafEntry {
        LeafEntry {
            key: key.to_vec(),
            blob: BlobRef {
                start: 9,
                item: 1,
                class: SizeClass::Class2,
            },
        }
    }

    #[test]
    fn leaf_round_trip() {
        let mut page = Page::zeroed(5, 4096);
        let entries = vec![leaf_entry(b"alpha"), leaf_entry(b"beta"), leaf_entry(b"gamma")];
        encode_leaf(&mut page, &entries);
        let back = decode_leaf(&page).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0].key, b"alpha");
        assert_eq!(back[2].key, b"gamma");
        assert_eq!(back[1].blob.start, 9);
        assert_eq!(leaf_used(&back), leaf_used(&entries));
    }

    #[test]
    fn internal_round_trip() {
        let mut page = Page::zeroed(6, 4096);
        let entries = vec![
            InternalEntry {
                key: b"m".to_vec(),
                child: 10,
            },
            InternalEntry {
                key: b"t".to_vec(),
                child: 11,
            },
        ];
        encode_internal(&mut page, &entries, 12);
        let (back, rightmost) = decode_internal(&page).unwrap();
        assert_eq!(rightmost, 12);
        assert_eq!(back[0].child, 10);
        assert_eq!(back[1].key, b"t");
    }

    #[test]
    fn unsorted_leaf_is_rejected() {
        let mut page = Page::zeroed(5, 4096);
        let entries = vec![leaf_entry(b"b"), leaf_entry(b"a")];
        encode_leaf(&mut page, &entries);
        assert!(decode_leaf(&page).is_err());
    }

    #[test]
    fn split_point_balances_sizes() {
        // Uniform sizes split in the middle.
        let m = split_point_by_size([10usize; 8].into_iter(), 1, 7);
        assert_eq!(m, 4);
        // A heavy first entry pushes the point left.
        let m = split_point_by_size([100usize, 10, 10, 10].into_iter(), 1, 3);
        assert_eq!(m, 1);
        // Clamping keeps both sides non-empty.
        let m = split_point_by_size([100usize, 1].into_iter(), 1, 1);
        assert_eq!(m, 1);
    }
}
