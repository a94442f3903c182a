//! Table storage for SnapDB
//!
//! This module combines a heap file with the table's indexes and provides
//! the versioned tuple operations: insert, read, update, delete and scan.
//! Which versions a caller sees is decided by a [`Visibility`] rule
//! supplied by the transaction layer.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::btree::IndexKey;
use super::disk::DiskManager;
use super::heap::{HeapFile, HeapScan, HeapStamp, TupleLocation};
use super::index::Index;
use super::tuple::{Tuple, TupleHeader, TxnId, INVALID_TXN};
use super::value::Value;
use crate::error::Result;

/// Decides which tuple versions a reader sees
pub trait Visibility {
    fn is_visible(&self, header: &TupleHeader) -> bool;
}

/// Sees every stored version
pub struct AllVersions;

impl Visibility for AllVersions {
    fn is_visible(&self, _header: &TupleHeader) -> bool {
        true
    }
}

/// Result of trying to place a delete intent on a version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The intent is now ours
    Marked,
    /// We had already deleted this version
    OwnedBySelf,
    /// Another transaction's intent is in place
    Blocked(TxnId),
    /// The version no longer exists
    Missing,
}

/// A version written by `insert` or `update`, with the index entries that
/// were added for it
#[derive(Debug, Clone)]
pub struct InsertedVersion {
    pub loc: TupleLocation,
    pub index_entries: Vec<(String, IndexKey)>,
}

/// A table combining heap storage and indexes
#[derive(Debug)]
pub struct Table {
    id: u32,
    name: String,
    heap: HeapFile,
    indexes: RwLock<Vec<Arc<Index>>>,
    /// Inserts and deletes since creation; drives statistics staleness
    modifications: AtomicU64,
}

impl Table {
    /// Create a new, empty table
    pub fn new(id: u32, name: impl Into<String>, disk: Option<Arc<DiskManager>>) -> Self {
        Self {
            id,
            name: name.into(),
            heap: HeapFile::new(id, disk),
            indexes: RwLock::new(Vec::new()),
            modifications: AtomicU64::new(0),
        }
    }

    /// Open an existing table from disk
    pub fn open(id: u32, name: impl Into<String>, disk: Arc<DiskManager>) -> Result<Self> {
        Ok(Self {
            id,
            name: name.into(),
            heap: HeapFile::open(id, disk)?,
            indexes: RwLock::new(Vec::new()),
            modifications: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn heap(&self) -> &HeapFile {
        &self.heap
    }

    pub fn indexes(&self) -> Vec<Arc<Index>> {
        self.indexes.read().clone()
    }

    /// Attach an index; it must already reflect the heap
    pub fn attach_index(&self, index: Arc<Index>) {
        self.indexes.write().push(index);
    }

    /// Populate an index from every stored version and attach it. Writers
    /// are held off until the index is attached, so no version is missed.
    pub fn add_index(&self, index: Arc<Index>) -> Result<()> {
        let mut indexes = self.indexes.write();
        self.build_index(&index)?;
        indexes.push(index);
        Ok(())
    }

    fn build_index(&self, index: &Index) -> Result<()> {
        let mut entries = Vec::new();
        for item in self.heap.scan() {
            let (loc, tuple) = item?;
            entries.push((index.key_for(tuple.values()), loc));
        }
        index.rebuild(entries);
        Ok(())
    }

    /// Store a new version created by `txn` and index it
    pub fn insert(&self, values: Vec<Value>, txn: TxnId) -> Result<InsertedVersion> {
        self.insert_version(Tuple::new(txn, values))
    }

    fn insert_version(&self, tuple: Tuple) -> Result<InsertedVersion> {
        let indexes = self.indexes.read();
        let loc = self.heap.insert(&tuple)?;
        let mut index_entries = Vec::with_capacity(indexes.len());
        for index in indexes.iter() {
            let key = index.key_for(tuple.values());
            index.insert(key.clone(), loc);
            index_entries.push((index.name().to_string(), key));
        }
        self.modifications.fetch_add(1, Ordering::Relaxed);
        Ok(InsertedVersion { loc, index_entries })
    }

    /// Read a version if the view can see it
    pub fn read(&self, loc: TupleLocation, view: &dyn Visibility) -> Result<Option<Tuple>> {
        Ok(self
            .heap
            .get(loc)?
            .filter(|tuple| view.is_visible(&tuple.header)))
    }

    /// Read a version regardless of visibility
    pub fn read_version(&self, loc: TupleLocation) -> Result<Option<Tuple>> {
        self.heap.get(loc)
    }

    /// Place `txn`'s delete intent on a version. An existing intent is
    /// replaced only when `can_override` says its owner aborted.
    pub fn delete(
        &self,
        loc: TupleLocation,
        txn: TxnId,
        can_override: impl Fn(TxnId) -> bool,
    ) -> Result<MarkOutcome> {
        let outcome = self.heap.with_header(loc, |header| {
            if header.xmax == txn {
                (None, MarkOutcome::OwnedBySelf)
            } else if header.xmax == INVALID_TXN || can_override(header.xmax) {
                (Some(txn), MarkOutcome::Marked)
            } else {
                (None, MarkOutcome::Blocked(header.xmax))
            }
        })?;
        let outcome = outcome.unwrap_or(MarkOutcome::Missing);
        if outcome == MarkOutcome::Marked {
            self.modifications.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Delete the version at `loc` and store its successor. The successor is
    /// only written when the delete intent was placed.
    pub fn update(
        &self,
        loc: TupleLocation,
        new_values: Vec<Value>,
        txn: TxnId,
        can_override: impl Fn(TxnId) -> bool,
    ) -> Result<(MarkOutcome, Option<InsertedVersion>)> {
        let outcome = self.delete(loc, txn, can_override)?;
        if outcome != MarkOutcome::Marked {
            return Ok((outcome, None));
        }
        let version = self.insert_version(Tuple::new(txn, new_values).as_update())?;
        Ok((outcome, Some(version)))
    }

    /// Drop `txn`'s delete intent
    pub fn clear_delete(&self, loc: TupleLocation, txn: TxnId) -> Result<()> {
        self.heap.with_header(loc, |header| {
            if header.xmax == txn {
                (Some(INVALID_TXN), ())
            } else {
                (None, ())
            }
        })?;
        Ok(())
    }

    /// Physically remove a version and its index entries
    pub fn purge(&self, loc: TupleLocation) -> Result<bool> {
        let Some(tuple) = self.heap.get(loc)? else {
            return Ok(false);
        };
        let indexes = self.indexes.read();
        for index in indexes.iter() {
            index.delete(&index.key_for(tuple.values()), loc);
        }
        Ok(self.heap.remove(loc))
    }

    /// Lazily iterate the versions visible to `view`, page by page
    pub fn scan<'a>(&'a self, view: &'a dyn Visibility) -> TableScan<'a> {
        TableScan {
            inner: self.heap.scan(),
            view,
        }
    }

    /// Iterate every stored version
    pub fn scan_versions(&self) -> HeapScan<'_> {
        self.heap.scan()
    }

    pub fn stamp(&self) -> HeapStamp {
        self.heap.stamp()
    }

    pub fn modifications(&self) -> u64 {
        self.modifications.load(Ordering::Relaxed)
    }

    /// Write dirty pages
    pub fn flush(&self) -> Result<usize> {
        self.heap.flush()
    }
}

/// Iterator over visible versions of a table
pub struct TableScan<'a> {
    inner: HeapScan<'a>,
    view: &'a dyn Visibility,
}

impl Iterator for TableScan<'_> {
    type Item = Result<(TupleLocation, Tuple)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((loc, tuple)) if self.view.is_visible(&tuple.header) => {
                    return Some(Ok((loc, tuple)))
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IndexDef;

    /// Sees live versions only
    struct LiveOnly;

    impl Visibility for LiveOnly {
        fn is_visible(&self, header: &TupleHeader) -> bool {
            !header.has_deleter()
        }
    }

    fn table_with_index() -> (Table, Arc<Index>) {
        let table = Table::new(1, "items", None);
        let def = Arc::new(IndexDef::new("idx_items_name", "items", vec!["name".into()], 1));
        let index = Arc::new(Index::new(def, vec![1], 4));
        table.attach_index(index.clone());
        (table, index)
    }

    fn item(id: i64, name: &str) -> Vec<Value> {
        vec![Value::Integer(id), Value::from(name)]
    }

    #[test]
    fn test_insert_indexes_version() {
        let (table, index) = table_with_index();
        let version = table.insert(item(1, "bolt"), 10).unwrap();

        assert_eq!(version.index_entries.len(), 1);
        assert_eq!(
            index.lookup_equal(&IndexKey::new(Value::from("bolt"))),
            vec![version.loc]
        );
        let tuple = table.read(version.loc, &LiveOnly).unwrap().unwrap();
        assert_eq!(tuple.header.xmin, 10);
        assert_eq!(table.modifications(), 1);
    }

    #[test]
    fn test_delete_intents() {
        let (table, _) = table_with_index();
        let loc = table.insert(item(1, "nut"), 10).unwrap().loc;

        assert_eq!(table.delete(loc, 11, |_| false).unwrap(), MarkOutcome::Marked);
        assert_eq!(table.delete(loc, 11, |_| false).unwrap(), MarkOutcome::OwnedBySelf);
        assert_eq!(table.delete(loc, 12, |_| false).unwrap(), MarkOutcome::Blocked(11));
        assert_eq!(table.delete(loc, 12, |x| x == 11).unwrap(), MarkOutcome::Marked);
        assert!(table.read(loc, &LiveOnly).unwrap().is_none());

        table.clear_delete(loc, 12).unwrap();
        assert!(table.read(loc, &LiveOnly).unwrap().is_some());

        let missing = TupleLocation::new(9, 0);
        assert_eq!(table.delete(missing, 12, |_| false).unwrap(), MarkOutcome::Missing);
    }

    #[test]
    fn test_update_creates_successor() {
        let (table, index) = table_with_index();
        let loc = table.insert(item(1, "washer"), 10).unwrap().loc;

        let (outcome, version) = table.update(loc, item(1, "spring"), 11, |_| false).unwrap();
        assert_eq!(outcome, MarkOutcome::Marked);
        let new_loc = version.unwrap().loc;

        let successor = table.read_version(new_loc).unwrap().unwrap();
        assert!(successor.header.is_update_successor());
        assert_eq!(table.read_version(loc).unwrap().unwrap().header.xmax, 11);

        // both versions stay indexed until vacuum
        assert_eq!(index.len(), 2);
        let live: Vec<_> = table.scan(&LiveOnly).map(|r| r.unwrap().0).collect();
        assert_eq!(live, vec![new_loc]);

        let (blocked, none) = table.update(loc, item(1, "x"), 12, |_| false).unwrap();
        assert_eq!(blocked, MarkOutcome::Blocked(11));
        assert!(none.is_none());
    }

    #[test]
    fn test_purge_removes_index_entries() {
        let (table, index) = table_with_index();
        let loc = table.insert(item(1, "gear"), 10).unwrap().loc;

        assert!(table.purge(loc).unwrap());
        assert!(index.is_empty());
        assert!(table.read_version(loc).unwrap().is_none());
        assert!(!table.purge(loc).unwrap());
    }

    #[test]
    fn test_build_index_from_heap() {
        let table = Table::new(2, "parts", None);
        for i in 0..50 {
            table.insert(item(i, &format!("p{}", i % 5)), 1).unwrap();
        }
        let def = Arc::new(IndexDef::new("idx_parts_name", "parts", vec!["name".into()], 2));
        let index = Arc::new(Index::new(def, vec![1], 4));
        table.add_index(index.clone()).unwrap();

        assert_eq!(index.len(), 50);
        assert_eq!(index.lookup_equal(&IndexKey::new(Value::from("p3"))).len(), 10);
        assert_eq!(table.scan(&AllVersions).count(), 50);
        table.insert(item(50, "p3"), 1).unwrap();
        assert_eq!(index.lookup_equal(&IndexKey::new(Value::from("p3"))).len(), 11);
    }

    #[test]
    fn test_add_index_during_inserts() {
        let table = Arc::new(Table::new(3, "parts", None));
        let writer = {
            let table = table.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    table.insert(item(i, "bulk"), 1).unwrap();
                }
            })
        };
        let def = Arc::new(IndexDef::new("idx_parts_name", "parts", vec!["name".into()], 3));
        let index = Arc::new(Index::new(def, vec![1], 8));
        table.add_index(index.clone()).unwrap();
        writer.join().unwrap();

        assert_eq!(index.len(), 2000);
        assert_eq!(index.entries().len(), table.scan_versions().count());
    }
}
