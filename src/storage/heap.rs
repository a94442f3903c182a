//! Heap file storage for SnapDB
//!
//! Tuples are stored unordered in slotted pages. Every page is cached in
//! memory behind its own latch; `flush` writes dirty pages through the
//! disk manager. Version headers are patched under the page write latch.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::error;

use super::disk::DiskManager;
use super::page::{Page, PageId, MAX_TUPLE_SIZE, PAGE_SIZE};
use super::tuple::{Tuple, TupleHeader, TxnId};
use crate::error::{Error, Result};

/// Physical address of a tuple version
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TupleLocation {
    pub page_id: PageId,
    pub slot: u16,
}

impl TupleLocation {
    pub fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for TupleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.page_id, self.slot)
    }
}

/// Slot and live-tuple totals, used to detect stale persisted indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeapStamp {
    pub slots: u64,
    pub live: u64,
}

/// Heap file for storing tuples
#[derive(Debug)]
pub struct HeapFile {
    table_id: u32,
    pages: RwLock<Vec<Arc<RwLock<Page>>>>,
    disk: Option<Arc<DiskManager>>,
}

impl HeapFile {
    /// Create an empty heap file
    pub fn new(table_id: u32, disk: Option<Arc<DiskManager>>) -> Self {
        Self {
            table_id,
            pages: RwLock::new(Vec::new()),
            disk,
        }
    }

    /// Load every page of an existing heap file, verifying checksums
    pub fn open(table_id: u32, disk: Arc<DiskManager>) -> Result<Self> {
        let count = disk.get_page_count(table_id)? as PageId;
        let mut pages = Vec::with_capacity(count as usize);
        let mut buf = vec![0u8; PAGE_SIZE];
        for page_id in 0..count {
            disk.read_page(table_id, page_id, &mut buf)?;
            let page = Page::from_bytes(page_id, &buf).map_err(|e| {
                error!(table_id, page_id, error = %e, "page failed verification");
                Error::StorageCorruption {
                    table_id,
                    page: page_id,
                    detail: e.to_string(),
                }
            })?;
            pages.push(Arc::new(RwLock::new(page)));
        }

        Ok(Self {
            table_id,
            pages: RwLock::new(pages),
            disk: Some(disk),
        })
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    fn page(&self, page_id: PageId) -> Option<Arc<RwLock<Page>>> {
        self.pages.read().get(page_id as usize).cloned()
    }

    /// Insert a tuple into the heap file
    pub fn insert(&self, tuple: &Tuple) -> Result<TupleLocation> {
        let bytes = tuple.to_bytes();
        if bytes.len() > MAX_TUPLE_SIZE {
            return Err(Error::TupleTooLarge(bytes.len()));
        }

        let last = self.pages.read().last().cloned();
        if let Some(last) = last {
            let mut page = last.write();
            if let Some(slot) = page.insert_tuple(&bytes) {
                return Ok(TupleLocation::new(page.page_id(), slot));
            }
            if page.reclaimable_space() >= bytes.len() {
                page.compact();
                if let Some(slot) = page.insert_tuple(&bytes) {
                    return Ok(TupleLocation::new(page.page_id(), slot));
                }
            }
        }

        let mut pages = self.pages.write();
        let page_id = pages.len() as PageId;
        let mut page = Page::new(page_id);
        let slot = page
            .insert_tuple(&bytes)
            .ok_or(Error::TupleTooLarge(bytes.len()))?;
        pages.push(Arc::new(RwLock::new(page)));
        Ok(TupleLocation::new(page_id, slot))
    }

    /// Get a tuple by location; `None` once the slot has been reclaimed
    pub fn get(&self, loc: TupleLocation) -> Result<Option<Tuple>> {
        let Some(page) = self.page(loc.page_id) else {
            return Ok(None);
        };
        let page = page.read();
        page.get_tuple(loc.slot).map(Tuple::from_bytes).transpose()
    }

    /// Read just the version header
    pub fn header(&self, loc: TupleLocation) -> Result<Option<TupleHeader>> {
        let Some(page) = self.page(loc.page_id) else {
            return Ok(None);
        };
        let page = page.read();
        page.get_tuple(loc.slot)
            .map(Tuple::header_from_bytes)
            .transpose()
    }

    /// Inspect a header and optionally stamp a new deleter, atomically with
    /// respect to other writers of the same page.
    pub fn with_header<R>(
        &self,
        loc: TupleLocation,
        f: impl FnOnce(TupleHeader) -> (Option<TxnId>, R),
    ) -> Result<Option<R>> {
        let Some(page) = self.page(loc.page_id) else {
            return Ok(None);
        };
        let mut page = page.write();
        let header = match page.get_tuple(loc.slot) {
            Some(bytes) => Tuple::header_from_bytes(bytes)?,
            None => return Ok(None),
        };
        let (new_xmax, result) = f(header);
        if let Some(xmax) = new_xmax {
            page.set_xmax(loc.slot, xmax);
        }
        Ok(Some(result))
    }

    /// Overwrite the deleter of a version
    pub fn set_xmax(&self, loc: TupleLocation, xmax: TxnId) -> bool {
        match self.page(loc.page_id) {
            Some(page) => page.write().set_xmax(loc.slot, xmax),
            None => false,
        }
    }

    /// Physically remove a version
    pub fn remove(&self, loc: TupleLocation) -> bool {
        match self.page(loc.page_id) {
            Some(page) => page.write().delete_tuple(loc.slot),
            None => false,
        }
    }

    /// Compact pages with reclaimable space
    pub fn compact(&self) -> usize {
        let pages: Vec<_> = self.pages.read().clone();
        let mut compacted = 0;
        for page in pages {
            let mut page = page.write();
            if page.reclaimable_space() > 0 {
                page.compact();
                compacted += 1;
            }
        }
        compacted
    }

    /// All tuples stored on one page, in slot order
    pub fn page_tuples(&self, page_id: PageId) -> Result<Vec<(TupleLocation, Tuple)>> {
        let Some(page) = self.page(page_id) else {
            return Ok(Vec::new());
        };
        let page = page.read();
        let mut tuples = Vec::with_capacity(page.live_count());
        for slot in 0..page.slot_count() {
            if let Some(bytes) = page.get_tuple(slot) {
                tuples.push((TupleLocation::new(page_id, slot), Tuple::from_bytes(bytes)?));
            }
        }
        Ok(tuples)
    }

    /// Lazily iterate every stored version, page by page from page 0
    pub fn scan(&self) -> HeapScan<'_> {
        HeapScan {
            heap: self,
            next_page: 0,
            buffer: VecDeque::new(),
        }
    }

    pub fn stamp(&self) -> HeapStamp {
        let pages = self.pages.read();
        let mut stamp = HeapStamp::default();
        for page in pages.iter() {
            let page = page.read();
            stamp.slots += page.slot_count() as u64;
            stamp.live += page.live_count() as u64;
        }
        stamp
    }

    /// Write dirty pages to disk. Returns the number of pages written.
    pub fn flush(&self) -> Result<usize> {
        let Some(disk) = &self.disk else {
            return Ok(0);
        };
        let pages: Vec<_> = self.pages.read().clone();
        let mut written = 0;
        for page in pages {
            let mut page = page.write();
            if page.is_dirty() {
                let page_id = page.page_id();
                disk.write_page(self.table_id, page_id, page.seal())?;
                page.clear_dirty();
                written += 1;
            }
        }
        if written > 0 {
            disk.flush(self.table_id)?;
        }
        Ok(written)
    }
}

/// Page-at-a-time iterator over a heap file
pub struct HeapScan<'a> {
    heap: &'a HeapFile,
    next_page: PageId,
    buffer: VecDeque<(TupleLocation, Tuple)>,
}

impl Iterator for HeapScan<'_> {
    type Item = Result<(TupleLocation, Tuple)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            if self.next_page as usize >= self.heap.page_count() {
                return None;
            }
            match self.heap.page_tuples(self.next_page) {
                Ok(tuples) => self.buffer.extend(tuples),
                Err(e) => {
                    self.next_page = PageId::MAX;
                    return Some(Err(e));
                }
            }
            self.next_page += 1;
        }
    }
}
