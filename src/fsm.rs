//! The free-space map: a coarse per-page fullness index.
//!
//! Every page of the storage gets a four-bit entry: one of the eight
//! fullness classes (`0..=7`), `Full` (`8`) for pages owned whole, or
//! `NotUsed` (`15`) for released pages and indices beyond the allocated
//! range. FSM pages form a doubly linked chain rooted at the heading's
//! `fsm_page_index`; each page covers `(page_size - header) * 2` page
//! indices and is appended lazily once the store outgrows the chain's
//! coverage.
//!
//! Pages that never take part in size-classed allocation (the heading and
//! the FSM pages themselves) are pinned `Full` so scans skip them.

use bitvec::prelude::*;

use crate::error::{Error, Result};
use crate::page::headers::FsmPageHeader;
use crate::page::{Page, SizeClass, NIL_PAGE};
use crate::store::PageStore;

const FULL_NIBBLE: u8 = 8;
const NOT_USED_NIBBLE: u8 = 15;

/// The free-space map over one page store.
///
/// The chain index (`pages`) is kept in memory and rebuilt on open by walking
/// the on-disk chain; it is the only transient state.
pub struct FreeSpaceMap {
    /// Indices of the FSM chain pages, in coverage order.
    pages: Vec<i64>,
    /// Page indices covered per FSM page.
    entries_per_page: usize,
    /// Ordinal of the most recently used FSM page; scans start here.
    cursor: usize,
}

impl FreeSpaceMap {
    fn entries_per_page(page_size: usize) -> usize {
        (page_size - FsmPageHeader::LENGTH) * 2
    }

    /// Create the first FSM page (page 1) in a fresh space holding only the
    /// heading, and pin both pages `Full`.
    pub fn create(store: &mut PageStore) -> Result<FreeSpaceMap> {
        debug_assert_eq!(store.page_count(), 1);
        let mut page = store.create_page()?;
        let first_index = page.index();
        init_fsm_page(
            &mut page,
            FsmPageHeader {
                start_page_index: first_index,
                previous_page_index: NIL_PAGE,
                next_page_index: NIL_PAGE,
                base_page_index: 0,
            },
        );
        store.update_page(page)?;

        let mut fsm = FreeSpaceMap {
            pages: vec![first_index],
            entries_per_page: Self::entries_per_page(store.page_size()),
            cursor: 0,
        };
        fsm.set_class(store, 0, SizeClass::Full)?;
        fsm.set_class(store, first_index, SizeClass::Full)?;
        Ok(fsm)
    }

    /// Rebuild the chain index of an existing space by walking the linked
    /// list from `first_index`.
    pub fn open(store: &mut PageStore, first_index: i64) -> Result<FreeSpaceMap> {
        let entries_per_page = Self::entries_per_page(store.page_size());
        let mut pages = Vec::new();
        let mut index = first_index;
        while index != NIL_PAGE {
            if pages.len() as i64 > store.page_count() {
                return Err(Error::StorageFormat(
                    "free-space map chain does not terminate".into(),
                ));
            }
            let page = store.fetch_page(index)?;
            let header = FsmPageHeader::decode(&page)?;
            if header.start_page_index != first_index {
                return Err(Error::StorageFormat(format!(
                    "free-space map page {index} belongs to chain {}, expected {first_index}",
                    header.start_page_index
                )));
            }
            let expected_base = (pages.len() * entries_per_page) as i64;
            if header.base_page_index != expected_base {
                return Err(Error::StorageFormat(format!(
                    "free-space map page {index} covers base {}, expected {expected_base}",
                    header.base_page_index
                )));
            }
            pages.push(index);
            index = header.next_page_index;
        }
        if pages.is_empty() {
            return Err(Error::StorageFormat("free-space map chain is empty".into()));
        }
        Ok(FreeSpaceMap {
            pages,
            entries_per_page,
            cursor: 0,
        })
    }

    /// The fullness class recorded for `index`. Indices beyond the chain's
    /// coverage read as `NotUsed`.
    pub fn get_class(&mut self, store: &mut PageStore, index: i64) -> Result<SizeClass> {
        debug_assert!(index >= 0);
        let ord = index as usize / self.entries_per_page;
        if ord >= self.pages.len() {
            return Ok(SizeClass::NotUsed);
        }
        let page = store.fetch_page(self.pages[ord])?;
        let nibble = read_entry(&page, index as usize % self.entries_per_page);
        nibble_to_class(nibble).ok_or_else(|| {
            Error::StorageFormat(format!(
                "invalid free-space entry {nibble:#03x} for page {index}"
            ))
        })
    }

    /// Record the fullness class of `index`, extending coverage as needed.
    pub fn set_class(&mut self, store: &mut PageStore, index: i64, class: SizeClass) -> Result<()> {
        debug_assert!(index >= 0);
        self.ensure_coverage(store)?;
        let ord = index as usize / self.entries_per_page;
        let mut page = store.fetch_page(self.pages[ord])?;
        write_entry(
            &mut page,
            index as usize % self.entries_per_page,
            class_to_nibble(class),
        );
        store.update_page(page)
    }

    /// Mark `index` released. Idempotent.
    pub fn release(&mut self, store: &mut PageStore, index: i64) -> Result<()> {
        self.set_class(store, index, SizeClass::NotUsed)
    }

    /// Find a data page whose class is at least `min_class`, asking `accept`
    /// to confirm each candidate (callers reject pages of a different owner).
    ///
    /// The scan starts at the most recently used FSM page and prefers the
    /// lowest qualifying index within a page. On miss, a released page is
    /// recycled or a brand-new data page is created; either way the result is
    /// a fully-free page classed `Class7`.
    pub fn find_page(
        &mut self,
        store: &mut PageStore,
        min_class: SizeClass,
        mut accept: impl FnMut(&mut PageStore, i64) -> Result<bool>,
    ) -> Result<i64> {
        debug_assert!(min_class.is_class());
        self.ensure_coverage(store)?;
        let chain_len = self.pages.len();
        for step in 0..chain_len {
            let ord = (self.cursor + step) % chain_len;
            let page = store.fetch_page(self.pages[ord])?;
            let base = ord * self.entries_per_page;
            for slot in 0..self.entries_per_page {
                let target = (base + slot) as i64;
                if target >= store.page_count() {
                    break;
                }
                let nibble = read_entry(&page, slot);
                if nibble <= 7 && nibble >= min_class.class_index() {
                    if accept(store, target)? {
                        self.cursor = ord;
                        return Ok(target);
                    }
                }
            }
        }
        self.allocate_empty(store)
    }

    /// A guaranteed fully-free page: a recycled `NotUsed` page if one exists,
    /// otherwise a brand-new one. Its class is set to `Class7`; the caller
    /// formats the content.
    pub fn allocate_empty(&mut self, store: &mut PageStore) -> Result<i64> {
        self.ensure_coverage(store)?;
        let chain_len = self.pages.len();
        for step in 0..chain_len {
            let ord = (self.cursor + step) % chain_len;
            let page = store.fetch_page(self.pages[ord])?;
            let base = ord * self.entries_per_page;
            for slot in 0..self.entries_per_page {
                let target = (base + slot) as i64;
                if target >= store.page_count() {
                    break;
                }
                if read_entry(&page, slot) == NOT_USED_NIBBLE {
                    self.cursor = ord;
                    self.set_class(store, target, SizeClass::Class7)?;
                    log::trace!("recycled released page {target}");
                    return Ok(target);
                }
            }
        }

        let page = store.create_page()?;
        let index = page.index();
        self.ensure_coverage(store)?;
        self.set_class(store, index, SizeClass::Class7)?;
        Ok(index)
    }

    /// Append FSM pages until every page of the store is covered.
    fn ensure_coverage(&mut self, store: &mut PageStore) -> Result<()> {
        let mut appended = Vec::new();
        while (self.pages.len() * self.entries_per_page) < store.page_count() as usize {
            let mut page = store.create_page()?;
            let index = page.index();
            // UNWRAP: the chain always holds at least the page created by
            // `create`.
            let last = *self.pages.last().unwrap();
            init_fsm_page(
                &mut page,
                FsmPageHeader {
                    start_page_index: self.pages[0],
                    previous_page_index: last,
                    next_page_index: NIL_PAGE,
                    base_page_index: (self.pages.len() * self.entries_per_page) as i64,
                },
            );
            store.update_page(page)?;

            let mut prev = store.fetch_page(last)?;
            let mut prev_header = FsmPageHeader::decode(&prev)?;
            prev_header.next_page_index = index;
            prev_header.encode_to(&mut prev);
            store.update_page(prev)?;

            log::debug!("appended free-space map page {index}");
            self.pages.push(index);
            appended.push(index);
        }
        // The new chain pages are now within coverage; pin them `Full`.
        for index in appended {
            self.set_class(store, index, SizeClass::Full)?;
        }
        Ok(())
    }
}

fn init_fsm_page(page: &mut Page, header: FsmPageHeader) {
    // Fresh entries all read `NotUsed`.
    page[FsmPageHeader::LENGTH..].fill(0xFF);
    header.encode_to(page);
}

fn read_entry(page: &Page, slot: usize) -> u8 {
    let bits = page[FsmPageHeader::LENGTH..].view_bits::<Lsb0>();
    bits[slot * 4..slot * 4 + 4].load_le::<u8>()
}

fn write_entry(page: &mut Page, slot: usize, nibble: u8) {
    debug_assert!(nibble <= 0xF);
    let bits = page[FsmPageHeader::LENGTH..].view_bits_mut::<Lsb0>();
    bits[slot * 4..slot * 4 + 4].store_le(nibble);
}

fn class_to_nibble(class: SizeClass) -> u8 {
    match class {
        c if c.is_class() => c.class_index(),
        SizeClass::NotUsed => NOT_USED_NIBBLE,
        // Pages owned whole (multi-page links) and pages outside size-classed
        // allocation are pinned full.
        _ => FULL_NIBBLE,
    }
}

fn nibble_to_class(nibble: u8) -> Option<SizeClass> {
    match nibble {
        0..=7 => SizeClass::from_byte(nibble).ok(),
        FULL_NIBBLE => Some(SizeClass::Full),
        NOT_USED_NIBBLE => Some(SizeClass::NotUsed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;
    use std::path::PathBuf;

    fn setup(name: &str) -> (PageStore, FreeSpaceMap) {
        let dir = PathBuf::from("test").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let mut store = PageStore::create_new_space(&dir, 4096, 64).unwrap();
        // Stand-in heading page.
        let mut heading = store.create_page().unwrap();
        heading.set_page_type(PageType::Heading);
        store.update_page(heading).unwrap();
        let fsm = FreeSpaceMap::create(&mut store).unwrap();
        (store, fsm)
    }

    #[test]
    fn heading_and_fsm_pages_are_pinned_full() {
        let (mut store, mut fsm) = setup("fsm_pinned");
        assert_eq!(fsm.get_class(&mut store, 0).unwrap(), SizeClass::Full);
        assert_eq!(fsm.get_class(&mut store, 1).unwrap(), SizeClass::Full);
    }

    #[test]
    fn set_get_release_round_trip() {
        let (mut store, mut fsm) = setup("fsm_round_trip");
        let index = fsm.allocate_empty(&mut store).unwrap();
        assert_eq!(index, 2);
        assert_eq!(fsm.get_class(&mut store, index).unwrap(), SizeClass::Class7);

        fsm.set_class(&mut store, index, SizeClass::Class3).unwrap();
        assert_eq!(fsm.get_class(&mut store, index).unwrap(), SizeClass::Class3);

        fsm.release(&mut store, index).unwrap();
        assert_eq!(fsm.get_class(&mut store, index).unwrap(), SizeClass::NotUsed);
        // Releasing again is a no-op.
        fsm.release(&mut store, index).unwrap();
    }

    #[test]
    fn released_pages_are_recycled_before_growth() {
        let (mut store, mut fsm) = setup("fsm_recycle");
        let a = fsm.allocate_empty(&mut store).unwrap();
        let b = fsm.allocate_empty(&mut store).unwrap();
        assert_ne!(a, b);
        let count = store.page_count();

        fsm.release(&mut store, a).unwrap();
        let c = fsm.allocate_empty(&mut store).unwrap();
        assert_eq!(c, a);
        assert_eq!(store.page_count(), count);
    }

    #[test]
    fn find_page_honors_class_and_predicate() {
        let (mut store, mut fsm) = setup("fsm_find");
        let a = fsm.allocate_empty(&mut store).unwrap();
        fsm.set_class(&mut store, a, SizeClass::Class2).unwrap();

        // Class2 does not satisfy a Class5 request; a fresh page is created.
        let found = fsm
            .find_page(&mut store, SizeClass::Class5, |_, _| Ok(true))
            .unwrap();
        assert_ne!(found, a);

        // A Class1 request is satisfied by the lowest qualifying page.
        let found = fsm
            .find_page(&mut store, SizeClass::Class1, |_, _| Ok(true))
            .unwrap();
        assert_eq!(found, a);

        // The predicate can veto every candidate, forcing a fresh page.
        let fresh = fsm
            .find_page(&mut store, SizeClass::Class1, |_, _| Ok(false))
            .unwrap();
        assert_eq!(fsm.get_class(&mut store, fresh).unwrap(), SizeClass::Class7);
    }

    #[test]
    fn chain_survives_reopen() {
        let dir = PathBuf::from("test").join("fsm_reopen");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        {
            let mut store = PageStore::create_new_space(&dir, 4096, 64).unwrap();
            let mut heading = store.create_page().unwrap();
            heading.set_page_type(PageType::Heading);
            store.update_page(heading).unwrap();
            let mut fsm = FreeSpaceMap::create(&mut store).unwrap();
            let index = fsm.allocate_empty(&mut store).unwrap();
            fsm.set_class(&mut store, index, SizeClass::Class4).unwrap();
            store.flush().unwrap();
        }
        let mut store = PageStore::open_existing_space(&dir, 4096, 64).unwrap();
        let mut fsm = FreeSpaceMap::open(&mut store, 1).unwrap();
        assert_eq!(fsm.get_class(&mut store, 2).unwrap(), SizeClass::Class4);
        assert_eq!(fsm.get_class(&mut store, 0).unwrap(), SizeClass::Full);
    }
}
