//! The blob allocator: variable-length byte strings behind page references.
//!
//! A payload that fits on one page is stored as a record of a
//! `VariableSizeItem` page. Those pages are shared between records: a slot
//! directory grows from the header, payloads are packed toward the page end,
//! and released slots are tombstoned for reuse:
//!
//! ```rust,ignore
//! common: [u8; 4]
//! slot_count: u16                  // offset 4, pad to 8
//! slots: [(offset: u16, len: u16)] // offset 8
//! padding: [u8]                    // gap between directory and payloads
//! payloads: [u8]                   // packed toward the page end
//! ```
//!
//! Oversized payloads are split into fragments, one `MultiPage` per fragment,
//! doubly linked and all stamped with the head's index. Their free-space map
//! entries are `Full`.

use crate::error::{Error, Result};
use crate::fsm::FreeSpaceMap;
use crate::page::headers::MultiPageHeader;
use crate::page::{
    class_of_free, class_of_payload, min_class_for, Page, PageType, SizeClass, NIL_PAGE,
};
use crate::store::PageStore;

/// Header size of a variable-size item page.
const ITEM_HEADER: usize = 8;

/// Bytes per slot directory entry.
const SLOT_SIZE: usize = 4;

/// Offset marker of a released slot.
const TOMBSTONE: u16 = 0xFFFF;

/// Largest supported blob payload, 512 MiB.
pub const MAX_VALUE_SIZE: usize = 1 << 29;

/// Encoded size of a [`BlobRef`].
pub const BLOB_REF_SIZE: usize = 11;

/// Reference to a stored blob.
///
/// `class` is the kind marker: the size bucket of the payload for single-page
/// records, or [`SizeClass::MultiPage`] when `start` heads a page chain. The
/// `item` slot index addresses the record within a shared item page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRef {
    pub start: i64,
    pub item: u16,
    pub class: SizeClass,
}

impl BlobRef {
    pub fn is_multi_page(&self) -> bool {
        self.class == SizeClass::MultiPage
    }

    pub fn encode_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.start.to_le_bytes());
        buf[8..10].copy_from_slice(&self.item.to_le_bytes());
        buf[10] = self.class as u8;
    }

    pub fn decode(buf: &[u8]) -> Result<BlobRef> {
        // UNWRAP: callers hand exactly BLOB_REF_SIZE bytes.
        let start = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let item = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let class = SizeClass::from_byte(buf[10])?;
        if !class.is_class() && class != SizeClass::MultiPage {
            return Err(Error::StorageFormat(format!(
                "invalid blob reference kind {class:?}"
            )));
        }
        Ok(BlobRef { start, item, class })
    }
}

/// Largest payload storable as a single-page record.
pub fn single_page_capacity(page_size: usize) -> usize {
    page_size - ITEM_HEADER - SLOT_SIZE
}

/// Store `payload`, consulting the free-space map for a target page.
///
/// The empty payload is special-cased to a nil reference and occupies no
/// pages.
pub fn write(store: &mut PageStore, fsm: &mut FreeSpaceMap, payload: &[u8]) -> Result<BlobRef> {
    if payload.len() > MAX_VALUE_SIZE {
        return Err(Error::ValueTooLarge {
            size: payload.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    if payload.is_empty() {
        return Ok(BlobRef {
            start: NIL_PAGE,
            item: 0,
            class: SizeClass::Class0,
        });
    }
    if payload.len() <= single_page_capacity(store.page_size()) {
        write_single(store, fsm, payload)
    } else {
        write_chain(store, fsm, payload)
    }
}

/// Read the payload behind `blob`.
pub fn read(store: &mut PageStore, blob: &BlobRef) -> Result<Vec<u8>> {
    if blob.start == NIL_PAGE {
        return Ok(Vec::new());
    }
    if blob.is_multi_page() {
        read_chain(store, blob)
    } else {
        let page = store.fetch_page(blob.start)?;
        let (offset, len) = locate_record(&page, blob)?;
        Ok(page[offset..offset + len].to_vec())
    }
}

/// Release the payload behind `blob`, returning its pages to the free-space
/// map. Idempotent on already-released pages.
pub fn release(store: &mut PageStore, fsm: &mut FreeSpaceMap, blob: &BlobRef) -> Result<()> {
    if blob.start == NIL_PAGE {
        return Ok(());
    }
    if blob.is_multi_page() {
        release_chain(store, fsm, blob)
    } else {
        release_single(store, fsm, blob)
    }
}

fn write_single(store: &mut PageStore, fsm: &mut FreeSpaceMap, payload: &[u8]) -> Result<BlobRef> {
    let page_size = store.page_size();
    let len = payload.len();
    let needed = len + SLOT_SIZE;

    let index = match min_class_for(needed, page_size) {
        Some(min_class) => fsm.find_page(store, min_class, |store, candidate| {
            accepts_record(store, candidate, len)
        })?,
        // More than half a page: only a fully-free page is guaranteed to fit.
        None => fsm.allocate_empty(store)?,
    };

    let mut page = store.fetch_page(index)?;
    if page.page_type()? != PageType::VariableSizeItem {
        format_item_page(&mut page);
    }

    // Pick a slot: the first tombstone, or a fresh one at the end. Growing
    // the directory must not run into the lowest payload, so compact first
    // when the gap is too tight.
    let count = slot_count(&page);
    let slot = match (0..count).find(|&i| read_slot(&page, i).0 == TOMBSTONE) {
        Some(i) => i,
        None => {
            if ITEM_HEADER + (count + 1) * SLOT_SIZE + len > live_payload_start(&page) {
                compact_item_page(&mut page);
            }
            set_slot_count(&mut page, count + 1);
            write_slot(&mut page, count, TOMBSTONE, 0);
            count
        }
    };

    let directory_end = ITEM_HEADER + slot_count(&page) * SLOT_SIZE;
    let mut payload_start = live_payload_start(&page);
    if payload_start < directory_end + len {
        compact_item_page(&mut page);
        payload_start = live_payload_start(&page);
    }
    debug_assert!(payload_start >= directory_end + len);

    let offset = payload_start - len;
    page[offset..offset + len].copy_from_slice(payload);
    write_slot(&mut page, slot, offset as u16, len as u16);

    let class = class_of_free(total_free(&page), page_size);
    page.set_size_class(class);
    store.update_page(page)?;
    fsm.set_class(store, index, class)?;

    Ok(BlobRef {
        start: index,
        item: slot as u16,
        class: class_of_payload(len, page_size),
    })
}

fn write_chain(store: &mut PageStore, fsm: &mut FreeSpaceMap, payload: &[u8]) -> Result<BlobRef> {
    let page_size = store.page_size();
    let fragment = page_size - MultiPageHeader::LENGTH;
    let total = (payload.len() + fragment - 1) / fragment;

    let mut indices = Vec::with_capacity(total);
    for _ in 0..total {
        indices.push(fsm.allocate_empty(store)?);
    }

    for (i, chunk) in payload.chunks(fragment).enumerate() {
        let mut page = Page::zeroed(indices[i], page_size);
        let header = MultiPageHeader {
            start_page_index: indices[0],
            previous_page_index: if i == 0 { NIL_PAGE } else { indices[i - 1] },
            next_page_index: if i + 1 == total {
                NIL_PAGE
            } else {
                indices[i + 1]
            },
            payload_len: chunk.len() as u32,
        };
        header.encode_to(&mut page);
        page[MultiPageHeader::LENGTH..MultiPageHeader::LENGTH + chunk.len()]
            .copy_from_slice(chunk);
        store.update_page(page)?;
        fsm.set_class(store, indices[i], SizeClass::Full)?;
    }
    log::trace!("stored {} bytes across {total} multi-pages", payload.len());

    Ok(BlobRef {
        start: indices[0],
        item: 0,
        class: SizeClass::MultiPage,
    })
}

fn read_chain(store: &mut PageStore, blob: &BlobRef) -> Result<Vec<u8>> {
    let page_size = store.page_size();
    let mut out = Vec::new();
    let mut index = blob.start;
    let mut visited: i64 = 0;
    while index != NIL_PAGE {
        visited += 1;
        if visited > store.page_count() {
            return Err(Error::StorageFormat(format!(
                "multi-page chain at {} does not terminate",
                blob.start
            )));
        }
        let page = store.fetch_page(index)?;
        let header = MultiPageHeader::decode(&page)?;
        if header.start_page_index != blob.start {
            return Err(Error::StorageFormat(format!(
                "multi-page {index} belongs to chain {}, expected {}",
                header.start_page_index, blob.start
            )));
        }
        let len = header.payload_len as usize;
        if len > page_size - MultiPageHeader::LENGTH {
            return Err(Error::StorageFormat(format!(
                "multi-page {index} declares {len} payload bytes"
            )));
        }
        out.extend_from_slice(&page[MultiPageHeader::LENGTH..MultiPageHeader::LENGTH + len]);
        index = header.next_page_index;
    }
    Ok(out)
}

fn release_chain(store: &mut PageStore, fsm: &mut FreeSpaceMap, blob: &BlobRef) -> Result<()> {
    let mut index = blob.start;
    let mut visited: i64 = 0;
    while index != NIL_PAGE {
        if index >= store.page_count() {
            // Already released and truncated away.
            break;
        }
        visited += 1;
        if visited > store.page_count() {
            return Err(Error::StorageFormat(format!(
                "multi-page chain at {} does not terminate",
                blob.start
            )));
        }
        let page = store.fetch_page(index)?;
        if page.page_type()? != PageType::MultiPage {
            // Already released.
            break;
        }
        let header = MultiPageHeader::decode(&page)?;
        if header.start_page_index != blob.start {
            break;
        }
        let next = header.next_page_index;
        store.remove_page(index)?;
        fsm.release(store, index)?;
        index = next;
    }
    Ok(())
}

fn release_single(store: &mut PageStore, fsm: &mut FreeSpaceMap, blob: &BlobRef) -> Result<()> {
    if blob.start >= store.page_count() {
        // Already released and truncated away.
        return Ok(());
    }
    let mut page = store.fetch_page(blob.start)?;
    if page.page_type()? != PageType::VariableSizeItem {
        // Already released.
        return Ok(());
    }
    let slot = blob.item as usize;
    if slot >= slot_count(&page) || read_slot(&page, slot).0 == TOMBSTONE {
        return Ok(());
    }
    write_slot(&mut page, slot, TOMBSTONE, 0);

    // Trailing tombstones carry no references; shrink the directory.
    let mut count = slot_count(&page);
    while count > 0 && read_slot(&page, count - 1).0 == TOMBSTONE {
        count -= 1;
    }
    set_slot_count(&mut page, count);

    if count == 0 {
        let index = page.index();
        drop(page);
        store.remove_page(index)?;
        fsm.release(store, index)?;
    } else {
        let class = class_of_free(total_free(&page), store.page_size());
        page.set_size_class(class);
        let index = page.index();
        store.update_page(page)?;
        fsm.set_class(store, index, class)?;
    }
    Ok(())
}

/// Whether the item page at `candidate` can take another `len`-byte record.
fn accepts_record(store: &mut PageStore, candidate: i64, len: usize) -> Result<bool> {
    let page = store.fetch_page(candidate)?;
    match page.page_type()? {
        // A fully-free page is always acceptable for a single-page record.
        PageType::Free => Ok(true),
        PageType::VariableSizeItem => {
            let has_tombstone =
                (0..slot_count(&page)).any(|i| read_slot(&page, i).0 == TOMBSTONE);
            let needed = if has_tombstone { len } else { len + SLOT_SIZE };
            Ok(total_free(&page) >= needed)
        }
        _ => Ok(false),
    }
}

fn format_item_page(page: &mut Page) {
    for b in page.iter_mut() {
        *b = 0;
    }
    page.set_page_type(PageType::VariableSizeItem);
    page.set_size_class(SizeClass::Class7);
    page.set_header_len(ITEM_HEADER);
}

fn slot_count(page: &Page) -> usize {
    u16::from_le_bytes([page[4], page[5]]) as usize
}

fn set_slot_count(page: &mut Page, count: usize) {
    page[4..6].copy_from_slice(&(count as u16).to_le_bytes());
}

fn read_slot(page: &Page, slot: usize) -> (u16, u16) {
    let at = ITEM_HEADER + slot * SLOT_SIZE;
    (
        u16::from_le_bytes([page[at], page[at + 1]]),
        u16::from_le_bytes([page[at + 2], page[at + 3]]),
    )
}

fn write_slot(page: &mut Page, slot: usize, offset: u16, len: u16) {
    let at = ITEM_HEADER + slot * SLOT_SIZE;
    page[at..at + 2].copy_from_slice(&offset.to_le_bytes());
    page[at + 2..at + 4].copy_from_slice(&len.to_le_bytes());
}

/// First byte occupied by a live payload; the page size when there is none.
fn live_payload_start(page: &Page) -> usize {
    (0..slot_count(page))
        .map(|i| read_slot(page, i))
        .filter(|&(offset, _)| offset != TOMBSTONE)
        .map(|(offset, _)| offset as usize)
        .min()
        .unwrap_or(page.len())
}

/// Total free bytes of an item page: everything not taken by the header, the
/// slot directory or live payloads.
fn total_free(page: &Page) -> usize {
    let live: usize = (0..slot_count(page))
        .map(|i| read_slot(page, i))
        .filter(|&(offset, _)| offset != TOMBSTONE)
        .map(|(_, len)| len as usize)
        .sum();
    page.len() - ITEM_HEADER - slot_count(page) * SLOT_SIZE - live
}

/// Repack live payloads toward the page end, closing release holes. Slot
/// indices are preserved, so outstanding references stay valid.
fn compact_item_page(page: &mut Page) {
    let count = slot_count(page);
    let mut live: Vec<(usize, u16, u16)> = (0..count)
        .map(|i| {
            let (offset, len) = read_slot(page, i);
            (i, offset, len)
        })
        .filter(|&(_, offset, _)| offset != TOMBSTONE)
        .collect();
    // Repack in descending offset order so moves never overlap a yet-unmoved
    // payload.
    live.sort_by_key(|&(_, offset, _)| std::cmp::Reverse(offset));

    let mut cursor = page.len();
    for (slot, offset, len) in live {
        let offset = offset as usize;
        let len = len as usize;
        cursor -= len;
        page.copy_within(offset..offset + len, cursor);
        write_slot(page, slot, cursor as u16, len as u16);
    }
}

fn locate_record(page: &Page, blob: &BlobRef) -> Result<(usize, usize)> {
    if page.page_type()? != PageType::VariableSizeItem {
        return Err(Error::StorageFormat(format!(
            "blob reference points at page {} which is not an item page",
            blob.start
        )));
    }
    let slot = blob.item as usize;
    if slot >= slot_count(page) {
        return Err(Error::StorageFormat(format!(
            "blob reference slot {slot} out of range on page {}",
            blob.start
        )));
    }
    let (offset, len) = read_slot(page, slot);
    if offset == TOMBSTONE {
        return Err(Error::StorageFormat(format!(
            "blob reference points at released slot {slot} on page {}",
            blob.start
        )));
    }
    let (offset, len) = (offset as usize, len as usize);
    let directory_end = ITEM_HEADER + slot_count(page) * SLOT_SIZE;
    if offset < directory_end || offset + len > page.len() {
        return Err(Error::StorageFormat(format!(
            "corrupt record slot {slot} on page {}",
            blob.start
        )));
    }
    Ok((offset, len))
}
