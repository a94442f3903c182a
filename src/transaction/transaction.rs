//! Per-transaction state
//!
//! A `TransactionContext` owns everything a running transaction has done:
//! its snapshot, undo log, read set (for SERIALIZABLE validation), deferred
//! foreign key checks and the writes it will publish on commit.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use super::snapshot::Snapshot;
use super::{IsolationLevel, TxnStatus};
use crate::error::Result;
use crate::storage::{InsertedVersion, Table, TupleLocation, TxnId, Value};

/// Handle returned by `begin`, passed to every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transaction {
    pub id: TxnId,
    pub isolation: IsolationLevel,
}

/// Reversal of one storage mutation
#[derive(Debug, Clone, PartialEq)]
pub enum UndoRecord {
    /// A version was stored (and indexed)
    Inserted { table: String, loc: TupleLocation },
    /// A delete intent was placed
    Deleted { table: String, loc: TupleLocation },
}

/// A scan predicate remembered for SERIALIZABLE validation. A missing
/// matcher conflicts with every insert into the table.
#[derive(Clone)]
pub struct ReadPredicate {
    pub table: String,
    pub matcher: Option<Arc<dyn Fn(&[Value]) -> bool + Send + Sync>>,
}

impl ReadPredicate {
    pub fn matches(&self, table: &str, row: &[Value]) -> bool {
        self.table == table && self.matcher.as_ref().map_or(true, |m| m(row))
    }
}

impl fmt::Debug for ReadPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadPredicate")
            .field("table", &self.table)
            .field("conservative", &self.matcher.is_none())
            .finish()
    }
}

/// A foreign key whose referenced row must exist when the transaction commits
#[derive(Debug, Clone, PartialEq)]
pub struct PendingForeignKey {
    pub table: String,
    pub constraint: String,
    pub values: Vec<Value>,
}

/// Position in the transaction's logs at the start of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementMark {
    undo: usize,
    pending_fk: usize,
    deleted: usize,
    inserted: usize,
}

/// State of a running transaction
#[derive(Debug)]
pub struct TransactionContext {
    pub id: TxnId,
    pub isolation: IsolationLevel,
    pub state: TxnStatus,
    snapshot: Option<Arc<Snapshot>>,
    undo: Vec<UndoRecord>,
    read_rows: HashSet<(String, TupleLocation)>,
    read_predicates: Vec<ReadPredicate>,
    pending_fk: Vec<PendingForeignKey>,
    deleted: Vec<(String, TupleLocation)>,
    inserted: Vec<(String, Vec<Value>)>,
    written_tables: BTreeSet<String>,
    /// Nesting of trigger-enqueued writes
    pub trigger_depth: usize,
}

impl TransactionContext {
    pub fn new(id: TxnId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation,
            state: TxnStatus::Active,
            snapshot: None,
            undo: Vec::new(),
            read_rows: HashSet::new(),
            read_predicates: Vec::new(),
            pending_fk: Vec::new(),
            deleted: Vec::new(),
            inserted: Vec::new(),
            written_tables: BTreeSet::new(),
            trigger_depth: 0,
        }
    }

    pub fn handle(&self) -> Transaction {
        Transaction {
            id: self.id,
            isolation: self.isolation,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnStatus::Active
    }

    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.snapshot.as_ref()
    }

    pub fn set_snapshot(&mut self, snapshot: Arc<Snapshot>) {
        self.snapshot = Some(snapshot);
    }

    pub fn record_insert(&mut self, table: &str, version: &InsertedVersion, values: Vec<Value>) {
        self.undo.push(UndoRecord::Inserted {
            table: table.to_string(),
            loc: version.loc,
        });
        self.inserted.push((table.to_string(), values));
        self.written_tables.insert(table.to_string());
    }

    pub fn record_delete(&mut self, table: &str, loc: TupleLocation) {
        self.undo.push(UndoRecord::Deleted {
            table: table.to_string(),
            loc,
        });
        self.deleted.push((table.to_string(), loc));
        self.written_tables.insert(table.to_string());
    }

    /// Remember a row read (SERIALIZABLE only)
    pub fn record_read(&mut self, table: &str, loc: TupleLocation) {
        if self.isolation == IsolationLevel::Serializable {
            self.read_rows.insert((table.to_string(), loc));
        }
    }

    /// Remember a scan predicate (SERIALIZABLE only)
    pub fn record_predicate(&mut self, predicate: ReadPredicate) {
        if self.isolation == IsolationLevel::Serializable {
            self.read_predicates.push(predicate);
        }
    }

    pub fn defer_foreign_key(&mut self, check: PendingForeignKey) {
        self.pending_fk.push(check);
    }

    pub fn take_pending_foreign_keys(&mut self) -> Vec<PendingForeignKey> {
        std::mem::take(&mut self.pending_fk)
    }

    /// Remove and return the checks added since `mark`
    pub fn take_pending_foreign_keys_since(&mut self, mark: StatementMark) -> Vec<PendingForeignKey> {
        let start = mark.pending_fk.min(self.pending_fk.len());
        self.pending_fk.split_off(start)
    }

    pub fn read_rows(&self) -> &HashSet<(String, TupleLocation)> {
        &self.read_rows
    }

    pub fn read_predicates(&self) -> &[ReadPredicate] {
        &self.read_predicates
    }

    pub fn deleted(&self) -> &[(String, TupleLocation)] {
        &self.deleted
    }

    pub fn inserted(&self) -> &[(String, Vec<Value>)] {
        &self.inserted
    }

    pub fn written_tables(&self) -> &BTreeSet<String> {
        &self.written_tables
    }

    pub fn has_writes(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn mark(&self) -> StatementMark {
        StatementMark {
            undo: self.undo.len(),
            pending_fk: self.pending_fk.len(),
            deleted: self.deleted.len(),
            inserted: self.inserted.len(),
        }
    }

    /// Undo every mutation made after `mark`, newest first
    pub fn rollback_to(
        &mut self,
        mark: StatementMark,
        resolve: &dyn Fn(&str) -> Option<Arc<Table>>,
    ) -> Result<()> {
        while self.undo.len() > mark.undo {
            let Some(record) = self.undo.pop() else { break };
            match record {
                UndoRecord::Inserted { table, loc } => {
                    if let Some(table) = resolve(&table) {
                        table.purge(loc)?;
                    }
                }
                UndoRecord::Deleted { table, loc } => {
                    if let Some(table) = resolve(&table) {
                        table.clear_delete(loc, self.id)?;
                    }
                }
            }
        }
        self.pending_fk.truncate(mark.pending_fk);
        self.deleted.truncate(mark.deleted);
        self.inserted.truncate(mark.inserted);
        Ok(())
    }

    /// Undo everything
    pub fn rollback_all(&mut self, resolve: &dyn Fn(&str) -> Option<Arc<Table>>) -> Result<()> {
        self.rollback_to(
            StatementMark {
                undo: 0,
                pending_fk: 0,
                deleted: 0,
                inserted: 0,
            },
            resolve,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AllVersions, Visibility};

    #[test]
    fn test_statement_rollback() {
        let table = Arc::new(Table::new(1, "t", None));
        let resolve_table = table.clone();
        let resolve = move |name: &str| (name == "t").then(|| resolve_table.clone());

        let mut ctx = TransactionContext::new(5, IsolationLevel::ReadCommitted);
        let kept = table.insert(vec![Value::Integer(1)], 5).unwrap();
        ctx.record_insert("t", &kept, vec![Value::Integer(1)]);

        let mark = ctx.mark();
        let dropped = table.insert(vec![Value::Integer(2)], 5).unwrap();
        ctx.record_insert("t", &dropped, vec![Value::Integer(2)]);
        table.delete(kept.loc, 5, |_| false).unwrap();
        ctx.record_delete("t", kept.loc);

        ctx.rollback_to(mark, &resolve).unwrap();
        assert_eq!(ctx.undo_len(), 1);
        assert_eq!(ctx.inserted().len(), 1);
        assert!(table.read_version(dropped.loc).unwrap().is_none());
        let survivor = table.read_version(kept.loc).unwrap().unwrap();
        assert!(!survivor.header.has_deleter());

        ctx.rollback_all(&resolve).unwrap();
        assert_eq!(table.scan(&AllVersions).count(), 0);
        assert!(!ctx.has_writes());
    }

    #[test]
    fn test_reads_tracked_only_when_serializable() {
        let mut rc = TransactionContext::new(1, IsolationLevel::ReadCommitted);
        rc.record_read("t", TupleLocation::new(0, 0));
        assert!(rc.read_rows().is_empty());

        let mut ser = TransactionContext::new(2, IsolationLevel::Serializable);
        ser.record_read("t", TupleLocation::new(0, 0));
        ser.record_predicate(ReadPredicate {
            table: "t".into(),
            matcher: Some(Arc::new(|row: &[Value]| row[0] == Value::Integer(1))),
        });
        assert_eq!(ser.read_rows().len(), 1);
        assert!(ser.read_predicates()[0].matches("t", &[Value::Integer(1)]));
        assert!(!ser.read_predicates()[0].matches("t", &[Value::Integer(2)]));
        assert!(!ser.read_predicates()[0].matches("u", &[Value::Integer(1)]));
    }

    #[test]
    fn test_visibility_trait_object() {
        let view: &dyn Visibility = &AllVersions;
        assert!(view.is_visible(&crate::storage::TupleHeader::new(1)));
    }
}
