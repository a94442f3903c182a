//! Index manager for SnapDB
//!
//! Each secondary or constraint index is a B+ tree behind its own latch,
//! mapping the indexed columns of every stored version to its location.
//! Visibility is not the index's concern: callers filter the returned
//! locations through the transaction's read view.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::btree::{BPlusTree, IndexKey};
use super::heap::{HeapStamp, TupleLocation};
use super::value::Value;
use crate::catalog::IndexDef;
use crate::error::{Error, Result};

/// One physical index
#[derive(Debug)]
pub struct Index {
    def: Arc<IndexDef>,
    /// Positions of the indexed columns in the table schema
    columns: Vec<usize>,
    tree: RwLock<BPlusTree>,
}

impl Index {
    pub fn new(def: Arc<IndexDef>, columns: Vec<usize>, order: usize) -> Self {
        Self {
            def,
            columns,
            tree: RwLock::new(BPlusTree::new(order)),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &Arc<IndexDef> {
        &self.def
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    pub fn is_unique(&self) -> bool {
        self.def.unique
    }

    /// Extract this index's key from a full row
    pub fn key_for(&self, values: &[Value]) -> IndexKey {
        IndexKey::composite(
            self.columns
                .iter()
                .map(|&i| values.get(i).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    pub fn insert(&self, key: IndexKey, loc: TupleLocation) -> bool {
        self.tree.write().insert(key, loc)
    }

    pub fn delete(&self, key: &IndexKey, loc: TupleLocation) -> bool {
        self.tree.write().delete(key, loc)
    }

    pub fn lookup_equal(&self, key: &IndexKey) -> Vec<TupleLocation> {
        self.tree.read().lookup_equal(key)
    }

    pub fn lookup_range(
        &self,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
    ) -> Vec<TupleLocation> {
        self.tree
            .read()
            .range(lower, upper)
            .into_iter()
            .map(|(_, loc)| loc)
            .collect()
    }

    pub fn entries(&self) -> Vec<(IndexKey, TupleLocation)> {
        self.tree.read().scan_all()
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> usize {
        self.tree.read().height()
    }

    /// Replace the contents with the given entries
    pub fn rebuild(&self, entries: impl IntoIterator<Item = (IndexKey, TupleLocation)>) {
        let mut tree = BPlusTree::new(self.tree.read().order());
        for (key, loc) in entries {
            tree.insert(key, loc);
        }
        *self.tree.write() = tree;
    }
}

/// On-disk image of an index
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    name: String,
    stamp: HeapStamp,
    tree: BPlusTree,
}

/// Registry of every index in the database
#[derive(Debug)]
pub struct IndexManager {
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    order: usize,
}

impl IndexManager {
    pub fn new(order: usize) -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            order,
        }
    }

    /// Register an empty index
    pub fn register(&self, def: Arc<IndexDef>, columns: Vec<usize>) -> Arc<Index> {
        let index = self.prepare(def, columns);
        self.publish(index.clone());
        index
    }

    /// An empty index that lookups cannot reach yet
    pub fn prepare(&self, def: Arc<IndexDef>, columns: Vec<usize>) -> Arc<Index> {
        Arc::new(Index::new(def, columns, self.order))
    }

    pub fn publish(&self, index: Arc<Index>) {
        self.indexes
            .write()
            .insert(index.name().to_string(), index);
    }

    pub fn get(&self, name: &str) -> Result<Arc<Index>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    /// Indexes on one table, ordered by id
    pub fn for_table(&self, table: &str) -> Vec<Arc<Index>> {
        let mut found: Vec<_> = self
            .indexes
            .read()
            .values()
            .filter(|i| i.def.table_name == table)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.def.id);
        found
    }

    pub fn insert(&self, index: &str, key: IndexKey, loc: TupleLocation) -> Result<bool> {
        Ok(self.get(index)?.insert(key, loc))
    }

    pub fn delete(&self, index: &str, key: &IndexKey, loc: TupleLocation) -> Result<bool> {
        Ok(self.get(index)?.delete(key, loc))
    }

    pub fn lookup_equal(&self, index: &str, key: &IndexKey) -> Result<Vec<TupleLocation>> {
        Ok(self.get(index)?.lookup_equal(key))
    }

    pub fn lookup_range(
        &self,
        index: &str,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
    ) -> Result<Vec<TupleLocation>> {
        Ok(self.get(index)?.lookup_range(lower, upper))
    }

    fn path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("index_{}.json", name))
    }

    /// Persist one index tagged with the heap state it reflects
    pub fn save(&self, dir: &Path, name: &str, stamp: HeapStamp) -> Result<()> {
        let index = self.get(name)?;
        let image = PersistedIndex {
            name: name.to_string(),
            stamp,
            tree: index.tree.read().clone(),
        };
        let path = Self::path(dir, name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&image)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(index = name, entries = index.len(), "saved index");
        Ok(())
    }

    /// Load a persisted index if it matches the heap; `false` means the
    /// caller must rebuild it from the heap.
    pub fn load(&self, dir: &Path, name: &str, stamp: HeapStamp) -> Result<bool> {
        let index = self.get(name)?;
        let path = Self::path(dir, name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(index = name, "index image missing");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let image: PersistedIndex = match serde_json::from_slice(&bytes) {
            Ok(image) => image,
            Err(e) => {
                warn!(index = name, error = %e, "index image unreadable");
                return Ok(false);
            }
        };
        if image.stamp != stamp || image.name != name {
            warn!(index = name, "index image is stale");
            return Ok(false);
        }
        *index.tree.write() = image.tree;
        Ok(true)
    }
}
