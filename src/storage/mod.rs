//! Storage engine module
//!
//! This module contains the storage engine components:
//! - Typed values and versioned tuples
//! - Slotted pages and per-table data files
//! - Heap file storage and tables
//! - B+ tree indexes and the index manager
//! - Commit log

pub mod btree;
pub mod clog;
pub mod disk;
pub mod heap;
pub mod index;
pub mod page;
pub mod table;
pub mod tuple;
pub mod value;

pub use btree::{BPlusTree, IndexKey};
pub use clog::{ClogRecordType, CommitLog};
pub use disk::DiskManager;
pub use heap::{HeapFile, HeapStamp, TupleLocation};
pub use index::{Index, IndexManager};
pub use page::Page;
pub use table::{AllVersions, InsertedVersion, MarkOutcome, Table, Visibility};
pub use tuple::{Tuple, TupleHeader, TxnId, INVALID_TXN};
pub use value::{Decimal, Value};
