//! Typed page headers and their fixed-offset codecs.
//!
//! All integers are little-endian. Each header starts with the common four
//! bytes (`page_type`, `size_class`, `length`) and appends its fields at the
//! offsets documented per type. `length` always records the full header size,
//! padding included; page bodies start at that offset.

use crate::error::{Error, Result};
use crate::page::{Page, PageType, SizeClass};

fn read_i64(buf: &[u8], at: usize) -> i64 {
    // UNWRAP: callers index within the fixed header range.
    i64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn write_i64(buf: &mut [u8], at: usize, v: i64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    // UNWRAP: callers index within the fixed header range.
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn expect_header(page: &Page, expected: PageType, length: usize) -> Result<()> {
    let found = page.page_type()?;
    if found != expected {
        return Err(Error::StorageFormat(format!(
            "page {}: expected {:?} page, found {:?}",
            page.index(),
            expected,
            found
        )));
    }
    if page.header_len() != length {
        return Err(Error::StorageFormat(format!(
            "page {}: {:?} header declares {} bytes, expected {length}",
            page.index(),
            expected,
            page.header_len()
        )));
    }
    Ok(())
}

/// The access method layered above the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessMethod {
    /// Ordered map over comparable keys.
    BPlusTree = 1,
    /// Byte-string map with prefix lookup. Reserved.
    RadixTree = 2,
}

impl AccessMethod {
    fn from_byte(b: u8) -> Result<AccessMethod> {
        match b {
            1 => Ok(AccessMethod::BPlusTree),
            2 => Ok(AccessMethod::RadixTree),
            _ => Err(Error::StorageFormat(format!(
                "unknown access method byte {b:#04x}"
            ))),
        }
    }
}

/// Header of page 0.
///
/// ```rust,ignore
/// common: [u8; 4]
/// page_size: u32                  // offset 4
/// structure_version: u32          // offset 8
/// access_method: u8               // offset 12, pad to 16
/// fsm_page_index: i64             // offset 16
/// access_method_page_index: i64   // offset 24
/// ```
#[derive(Debug, Clone)]
pub struct HeadingPageHeader {
    pub page_size: u32,
    pub structure_version: u32,
    pub access_method: AccessMethod,
    pub fsm_page_index: i64,
    pub access_method_page_index: i64,
}

impl HeadingPageHeader {
    pub const LENGTH: usize = 32;

    /// Offset of the `page_size` field, read raw before the page size of an
    /// existing storage is known.
    pub const PAGE_SIZE_OFFSET: usize = 4;

    pub fn encode_to(&self, page: &mut Page) {
        page.set_page_type(PageType::Heading);
        page.set_size_class(SizeClass::NotApplicable);
        page.set_header_len(Self::LENGTH);
        write_u32(page, 4, self.page_size);
        write_u32(page, 8, self.structure_version);
        page[12] = self.access_method as u8;
        page[13..16].fill(0);
        write_i64(page, 16, self.fsm_page_index);
        write_i64(page, 24, self.access_method_page_index);
    }

    pub fn decode(page: &Page) -> Result<HeadingPageHeader> {
        expect_header(page, PageType::Heading, Self::LENGTH)?;
        Ok(HeadingPageHeader {
            page_size: read_u32(page, 4),
            structure_version: read_u32(page, 8),
            access_method: AccessMethod::from_byte(page[12])?,
            fsm_page_index: read_i64(page, 16),
            access_method_page_index: read_i64(page, 24),
        })
    }
}

/// Header of a free-space map page.
///
/// ```rust,ignore
/// common: [u8; 4], pad to 8
/// start_page_index: i64       // offset 8, first FSM page of the chain
/// previous_page_index: i64    // offset 16
/// next_page_index: i64        // offset 24
/// base_page_index: i64        // offset 32, first page this FSM page covers
/// ```
#[derive(Debug, Clone)]
pub struct FsmPageHeader {
    pub start_page_index: i64,
    pub previous_page_index: i64,
    pub next_page_index: i64,
    pub base_page_index: i64,
}

impl FsmPageHeader {
    pub const LENGTH: usize = 40;

    pub fn encode_to(&self, page: &mut Page) {
        page.set_page_type(PageType::FreeSpaceMap);
        page.set_size_class(SizeClass::NotApplicable);
        page.set_header_len(Self::LENGTH);
        page[4..8].fill(0);
        write_i64(page, 8, self.start_page_index);
        write_i64(page, 16, self.previous_page_index);
        write_i64(page, 24, self.next_page_index);
        write_i64(page, 32, self.base_page_index);
    }

    pub fn decode(page: &Page) -> Result<FsmPageHeader> {
        expect_header(page, PageType::FreeSpaceMap, Self::LENGTH)?;
        Ok(FsmPageHeader {
            start_page_index: read_i64(page, 8),
            previous_page_index: read_i64(page, 16),
            next_page_index: read_i64(page, 24),
            base_page_index: read_i64(page, 32),
        })
    }
}

/// Header of a B+Tree node page, leaf or internal.
///
/// ```rust,ignore
/// common: [u8; 4]
/// parent_page_index: i64      // offset 4
/// previous_page_index: i64    // offset 12, same-level sibling
/// next_page_index: i64        // offset 20, same-level sibling
/// is_leaf: u8                 // offset 28, pad to 30
/// ```
///
/// The size-class byte of a node page always carries a real fullness class,
/// never `NotApplicable` or `MultiPage`.
#[derive(Debug, Clone)]
pub struct NodePageHeader {
    pub parent_page_index: i64,
    pub previous_page_index: i64,
    pub next_page_index: i64,
    pub is_leaf: bool,
}

impl NodePageHeader {
    pub const LENGTH: usize = 30;

    /// Write the header fields. The size-class byte is left to the caller,
    /// which recomputes it whenever the body changes.
    pub fn encode_to(&self, page: &mut Page) {
        page.set_page_type(PageType::BPlusTreeNode);
        page.set_header_len(Self::LENGTH);
        write_i64(page, 4, self.parent_page_index);
        write_i64(page, 12, self.previous_page_index);
        write_i64(page, 20, self.next_page_index);
        page[28] = self.is_leaf as u8;
        page[29] = 0;
    }

    pub fn decode(page: &Page) -> Result<NodePageHeader> {
        expect_header(page, PageType::BPlusTreeNode, Self::LENGTH)?;
        let class = page.size_class()?;
        if !class.is_class() {
            return Err(Error::StorageFormat(format!(
                "node page {}: invalid size class {:?}",
                page.index(),
                class
            )));
        }
        Ok(NodePageHeader {
            parent_page_index: read_i64(page, 4),
            previous_page_index: read_i64(page, 12),
            next_page_index: read_i64(page, 20),
            is_leaf: page[28] != 0,
        })
    }
}

/// Header of one link of a multi-page blob chain.
///
/// ```rust,ignore
/// common: [u8; 4], pad to 8
/// start_page_index: i64       // offset 8, head of the chain
/// previous_page_index: i64    // offset 16
/// next_page_index: i64        // offset 24
/// payload_len: u32            // offset 32, bytes stored on this page, pad to 40
/// ```
#[derive(Debug, Clone)]
pub struct MultiPageHeader {
    pub start_page_index: i64,
    pub previous_page_index: i64,
    pub next_page_index: i64,
    pub payload_len: u32,
}

impl MultiPageHeader {
    pub const LENGTH: usize = 40;

    pub fn encode_to(&self, page: &mut Page) {
        page.set_page_type(PageType::MultiPage);
        page.set_size_class(SizeClass::MultiPage);
        page.set_header_len(Self::LENGTH);
        page[4..8].fill(0);
        write_i64(page, 8, self.start_page_index);
        write_i64(page, 16, self.previous_page_index);
        write_i64(page, 24, self.next_page_index);
        write_u32(page, 32, self.payload_len);
        page[36..40].fill(0);
    }

    pub fn decode(page: &Page) -> Result<MultiPageHeader> {
        expect_header(page, PageType::MultiPage, Self::LENGTH)?;
        Ok(MultiPageHeader {
            start_page_index: read_i64(page, 8),
            previous_page_index: read_i64(page, 16),
            next_page_index: read_i64(page, 24),
            payload_len: read_u32(page, 32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::NIL_PAGE;

    #[test]
    fn heading_round_trip() {
        let mut page = Page::zeroed(0, 4096);
        let h = HeadingPageHeader {
            page_size: 4096,
            structure_version: 1,
            access_method: AccessMethod::BPlusTree,
            fsm_page_index: 1,
            access_method_page_index: 2,
        };
        h.encode_to(&mut page);
        assert_eq!(page.header_len(), HeadingPageHeader::LENGTH);
        let back = HeadingPageHeader::decode(&page).unwrap();
        assert_eq!(back.page_size, 4096);
        assert_eq!(back.structure_version, 1);
        assert_eq!(back.access_method, AccessMethod::BPlusTree);
        assert_eq!(back.fsm_page_index, 1);
        assert_eq!(back.access_method_page_index, 2);
    }

    #[test]
    fn node_round_trip_and_type_check() {
        let mut page = Page::zeroed(7, 4096);
        let h = NodePageHeader {
            parent_page_index: 3,
            previous_page_index: NIL_PAGE,
            next_page_index: 9,
            is_leaf: true,
        };
        h.encode_to(&mut page);
        page.set_size_class(SizeClass::Class4);
        let back = NodePageHeader::decode(&page).unwrap();
        assert_eq!(back.parent_page_index, 3);
        assert_eq!(back.previous_page_index, NIL_PAGE);
        assert_eq!(back.next_page_index, 9);
        assert!(back.is_leaf);

        // A node page must carry a real fullness class.
        page.set_size_class(SizeClass::NotApplicable);
        assert!(NodePageHeader::decode(&page).is_err());

        // Decoding against the wrong page type fails.
        let other = Page::zeroed(8, 4096);
        assert!(NodePageHeader::decode(&other).is_err());
    }

    #[test]
    fn multi_page_round_trip() {
        let mut page = Page::zeroed(12, 4096);
        let h = MultiPageHeader {
            start_page_index: 12,
            previous_page_index: NIL_PAGE,
            next_page_index: 13,
            payload_len: 4056,
        };
        h.encode_to(&mut page);
        let back = MultiPageHeader::decode(&page).unwrap();
        assert_eq!(back.start_page_index, 12);
        assert_eq!(back.next_page_index, 13);
        assert_eq!(back.payload_len, 4056);
        assert_eq!(page.size_class().unwrap(), SizeClass::MultiPage);
    }
}
