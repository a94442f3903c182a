//! Page management for SnapDB
//!
//! Each relation is stored in fixed 4 KiB slotted pages. Layout:
//!
//! ```text
//! | header (24) | slot directory -> ...free... <- tuple data |
//! ```
//!
//! Header bytes: page id (4), slot count (2), free space offset (2),
//! page type (1), xxh3 checksum (8), live slot count (2), reserved (5).
//! Slot entries are `(offset: u16, size: u16)`; a size of 0 marks a
//! reclaimed slot. Slot numbers are never reassigned, so a tuple location
//! stays valid until its slot is reclaimed.

use byteorder::{ByteOrder, LittleEndian};
use xxhash_rust::xxh3::xxh3_64;

use super::tuple::{TxnId, XMAX_OFFSET};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page header size
pub const PAGE_HEADER_SIZE: usize = 24;

/// Size of one slot directory entry
pub const SLOT_SIZE: usize = 4;

/// Largest tuple a fresh page can hold
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE;

/// Page ID type
pub type PageId = u32;

const CHECKSUM_RANGE: std::ops::Range<usize> = 9..17;

/// Why a page image was rejected on load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLoadError {
    ChecksumMismatch { stored: u64, computed: u64 },
    BadLayout(String),
}

impl std::fmt::Display for PageLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageLoadError::ChecksumMismatch { stored, computed } => write!(
                f,
                "checksum mismatch (stored {:#018x}, computed {:#018x})",
                stored, computed
            ),
            PageLoadError::BadLayout(detail) => write!(f, "{}", detail),
        }
    }
}

/// Page header structure
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub page_id: PageId,
    /// Slots ever allocated on this page
    pub slot_count: u16,
    /// Offset to free space start
    pub free_space_offset: u16,
    /// Page type (0 = heap data)
    pub page_type: u8,
    /// Slots still holding a tuple
    pub live_count: u16,
}

impl PageHeader {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            slot_count: 0,
            free_space_offset: PAGE_SIZE as u16,
            page_type: 0,
            live_count: 0,
        }
    }

    /// Get free space available between slot directory and tuple data
    pub fn free_space(&self) -> usize {
        self.free_space_offset as usize - PAGE_HEADER_SIZE - (self.slot_count as usize * SLOT_SIZE)
    }
}

/// A database page
#[derive(Debug, Clone)]
pub struct Page {
    header: PageHeader,
    data: Vec<u8>,
    dirty: bool,
}

impl Page {
    /// Create a new empty page
    pub fn new(page_id: PageId) -> Self {
        let mut page = Self {
            header: PageHeader::new(page_id),
            data: vec![0u8; PAGE_SIZE],
            dirty: false,
        };
        page.write_header();
        page
    }

    fn write_header(&mut self) {
        LittleEndian::write_u32(&mut self.data[0..4], self.header.page_id);
        LittleEndian::write_u16(&mut self.data[4..6], self.header.slot_count);
        LittleEndian::write_u16(&mut self.data[6..8], self.header.free_space_offset);
        self.data[8] = self.header.page_type;
        LittleEndian::write_u16(&mut self.data[17..19], self.header.live_count);
        self.data[19..24].fill(0);
        self.dirty = true;
    }

    /// Parse and verify a page image read from disk. An all-zero image is
    /// a page that was allocated but never written and loads as empty.
    pub fn from_bytes(page_id: PageId, bytes: &[u8]) -> std::result::Result<Self, PageLoadError> {
        if bytes.len() != PAGE_SIZE {
            return Err(PageLoadError::BadLayout(format!(
                "expected {} bytes, got {}",
                PAGE_SIZE,
                bytes.len()
            )));
        }
        if bytes.iter().all(|b| *b == 0) {
            let mut page = Page::new(page_id);
            page.dirty = false;
            return Ok(page);
        }

        let stored = LittleEndian::read_u64(&bytes[CHECKSUM_RANGE]);
        let computed = checksum(bytes);
        if stored != computed {
            return Err(PageLoadError::ChecksumMismatch { stored, computed });
        }

        let header = PageHeader {
            page_id: LittleEndian::read_u32(&bytes[0..4]),
            slot_count: LittleEndian::read_u16(&bytes[4..6]),
            free_space_offset: LittleEndian::read_u16(&bytes[6..8]),
            page_type: bytes[8],
            live_count: LittleEndian::read_u16(&bytes[17..19]),
        };
        if header.page_id != page_id {
            return Err(PageLoadError::BadLayout(format!(
                "page header claims id {}",
                header.page_id
            )));
        }
        let directory_end = PAGE_HEADER_SIZE + header.slot_count as usize * SLOT_SIZE;
        if directory_end > header.free_space_offset as usize
            || header.free_space_offset as usize > PAGE_SIZE
        {
            return Err(PageLoadError::BadLayout(
                "slot directory overlaps tuple data".to_string(),
            ));
        }

        Ok(Self {
            header,
            data: bytes.to_vec(),
            dirty: false,
        })
    }

    /// Stamp the checksum and return the image to write
    pub fn seal(&mut self) -> &[u8] {
        self.data[CHECKSUM_RANGE].fill(0);
        let sum = checksum(&self.data);
        LittleEndian::write_u64(&mut self.data[CHECKSUM_RANGE], sum);
        &self.data
    }

    pub fn page_id(&self) -> PageId {
        self.header.page_id
    }

    /// Slots ever allocated, including reclaimed ones
    pub fn slot_count(&self) -> u16 {
        self.header.slot_count
    }

    pub fn live_count(&self) -> usize {
        self.header.live_count as usize
    }

    pub fn free_space(&self) -> usize {
        self.header.free_space()
    }

    /// Bytes that `compact` would give back
    pub fn reclaimable_space(&self) -> usize {
        let used: usize = (0..self.header.slot_count)
            .map(|slot| self.slot(slot).1 as usize)
            .sum();
        PAGE_SIZE - self.header.free_space_offset as usize - used
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn slot(&self, slot_num: u16) -> (u16, u16) {
        let at = PAGE_HEADER_SIZE + slot_num as usize * SLOT_SIZE;
        (
            LittleEndian::read_u16(&self.data[at..at + 2]),
            LittleEndian::read_u16(&self.data[at + 2..at + 4]),
        )
    }

    fn set_slot(&mut self, slot_num: u16, offset: u16, size: u16) {
        let at = PAGE_HEADER_SIZE + slot_num as usize * SLOT_SIZE;
        LittleEndian::write_u16(&mut self.data[at..at + 2], offset);
        LittleEndian::write_u16(&mut self.data[at + 2..at + 4], size);
    }

    /// Insert a tuple into the page, returning its slot number
    pub fn insert_tuple(&mut self, tuple_data: &[u8]) -> Option<u16> {
        let size = tuple_data.len();
        if size == 0 || self.free_space() < size + SLOT_SIZE {
            return None;
        }

        let slot_num = self.header.slot_count;
        let offset = self.header.free_space_offset as usize - size;

        self.header.slot_count += 1;
        self.header.live_count += 1;
        self.header.free_space_offset = offset as u16;

        self.set_slot(slot_num, offset as u16, size as u16);
        self.data[offset..offset + size].copy_from_slice(tuple_data);

        self.write_header();
        Some(slot_num)
    }

    /// Get a tuple from the page by slot index
    pub fn get_tuple(&self, slot_num: u16) -> Option<&[u8]> {
        if slot_num >= self.header.slot_count {
            return None;
        }
        let (offset, size) = self.slot(slot_num);
        if size == 0 {
            return None;
        }
        Some(&self.data[offset as usize..offset as usize + size as usize])
    }

    /// Overwrite the deleter field of a stored tuple in place
    pub fn set_xmax(&mut self, slot_num: u16, xmax: TxnId) -> bool {
        if slot_num >= self.header.slot_count {
            return false;
        }
        let (offset, size) = self.slot(slot_num);
        if (size as usize) < XMAX_OFFSET + 8 {
            return false;
        }
        let at = offset as usize + XMAX_OFFSET;
        LittleEndian::write_u64(&mut self.data[at..at + 8], xmax);
        self.dirty = true;
        true
    }

    /// Reclaim a slot. Its bytes become garbage until `compact`.
    pub fn delete_tuple(&mut self, slot_num: u16) -> bool {
        if slot_num >= self.header.slot_count {
            return false;
        }
        let (offset, size) = self.slot(slot_num);
        if size == 0 {
            return false;
        }
        self.set_slot(slot_num, offset, 0);
        self.header.live_count -= 1;
        self.write_header();
        true
    }

    /// Pack live tuples against the end of the page. Slot numbers are kept.
    pub fn compact(&mut self) {
        let mut live: Vec<(u16, Vec<u8>)> = Vec::with_capacity(self.live_count());
        for slot in 0..self.header.slot_count {
            if let Some(bytes) = self.get_tuple(slot) {
                live.push((slot, bytes.to_vec()));
            }
        }

        let mut offset = PAGE_SIZE;
        let directory_end = PAGE_HEADER_SIZE + self.header.slot_count as usize * SLOT_SIZE;
        self.data[directory_end..].fill(0);
        for (slot, bytes) in live {
            offset -= bytes.len();
            self.data[offset..offset + bytes.len()].copy_from_slice(&bytes);
            self.set_slot(slot, offset as u16, bytes.len() as u16);
        }
        self.header.free_space_offset = offset as u16;
        self.write_header();
    }
}

fn checksum(image: &[u8]) -> u64 {
    let mut copy = [0u8; PAGE_SIZE];
    copy.copy_from_slice(image);
    copy[CHECKSUM_RANGE].fill(0);
    xxh3_64(&copy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_creation() {
        let page = Page::new(0);
        assert_eq!(page.page_id(), 0);
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.free_space(), PAGE_SIZE - PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_insert_and_delete() {
        let mut page = Page::new(3);
        let a = page.insert_tuple(&[1u8; 40]).unwrap();
        let b = page.insert_tuple(&[2u8; 40]).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(page.get_tuple(b), Some(&[2u8; 40][..]));

        assert!(page.delete_tuple(a));
        assert!(!page.delete_tuple(a));
        assert!(page.get_tuple(a).is_none());
        assert_eq!(page.live_count(), 1);
        assert_eq!(page.reclaimable_space(), 40);
    }

    #[test]
    fn test_compact_keeps_slots() {
        let mut page = Page::new(0);
        let slots: Vec<u16> = (0..5u8)
            .map(|i| page.insert_tuple(&[i; 100]).unwrap())
            .collect();
        let before = page.free_space();

        page.delete_tuple(slots[1]);
        page.delete_tuple(slots[3]);
        page.compact();

        assert_eq!(page.free_space(), before + 200);
        assert_eq!(page.get_tuple(slots[4]), Some(&[4u8; 100][..]));
        assert_eq!(page.get_tuple(slots[0]), Some(&[0u8; 100][..]));
        assert!(page.get_tuple(slots[1]).is_none());
    }

    #[test]
    fn test_page_full() {
        let mut page = Page::new(0);
        assert!(page.insert_tuple(&vec![0u8; MAX_TUPLE_SIZE]).is_some());
        assert!(page.insert_tuple(&[1u8; 1]).is_none());
    }

    #[test]
    fn test_checksum_roundtrip_and_corruption() {
        let mut page = Page::new(7);
        page.insert_tuple(b"some tuple bytes here").unwrap();
        let mut image = page.seal().to_vec();

        let loaded = Page::from_bytes(7, &image).unwrap();
        assert_eq!(loaded.get_tuple(0), Some(&b"some tuple bytes here"[..]));

        image[PAGE_SIZE - 3] ^= 0xff;
        assert!(matches!(
            Page::from_bytes(7, &image),
            Err(PageLoadError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_page_loads_empty() {
        let page = Page::from_bytes(2, &[0u8; PAGE_SIZE]).unwrap();
        assert_eq!(page.page_id(), 2);
        assert_eq!(page.slot_count(), 0);
    }
}
