//! Statement execution inside one transaction
//!
//! A `Session` pairs the database with a locked transaction context for the
//! length of a statement. It is the executor's data source, the planner's
//! catalog view and the constraint enforcer's key lookup, and it carries out
//! every write together with its triggers and referential actions.

use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

use crate::catalog::{FkAction, IndexDef, TableDef, TableStatistics};
use crate::config::ForeignKeyCheck;
use crate::constraint::{
    project, referenced_key, restrict_violation, same_key, KeyLookup, QueuedWrite, TriggerContext,
    TriggerEvent,
};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::executor::{
    bind_row_expr, evaluate, DataSource, Executor, Expr, LocatedRow, PlanContext, Planner, Query,
    QueryResult, RowMatcher,
};
use crate::storage::{IndexKey, MarkOutcome, Table, TupleLocation, Value};
use crate::transaction::{
    PendingForeignKey, ReadPredicate, ReadView, StatementMark, TransactionContext, TxnStatus,
};

pub(crate) struct Session<'a> {
    db: &'a Database,
    ctx: &'a mut TransactionContext,
}

impl<'a> Session<'a> {
    pub(crate) fn new(db: &'a Database, ctx: &'a mut TransactionContext) -> Self {
        Self { db, ctx }
    }

    fn view(&self) -> ReadView<'a> {
        let db = self.db;
        db.txns.read_view(self.ctx)
    }

    /// Statement epilogue: immediate foreign key checks
    pub(crate) fn finish_statement(&mut self, mark: StatementMark) -> Result<()> {
        if self.db.config.foreign_key_check == ForeignKeyCheck::Immediate {
            let pending = self.ctx.take_pending_foreign_keys_since(mark);
            self.check_references(&pending)?;
        }
        Ok(())
    }

    pub(crate) fn check_references(&mut self, pending: &[PendingForeignKey]) -> Result<()> {
        let db = self.db;
        for check in pending {
            db.enforcer.check_reference(&db.catalog, check, self)?;
        }
        Ok(())
    }

    // ---------- reads ----------

    pub(crate) fn query(&mut self, query: &Query) -> Result<QueryResult> {
        let plan = Planner::new(&*self).plan(query)?;
        Executor::new(self).execute(&plan)
    }

    /// Rows of `table` passing `filter`, located for modification
    fn matching(&mut self, table: &str, filter: Option<&Expr>) -> Result<Vec<LocatedRow>> {
        let mut query = Query::from(table);
        if let Some(filter) = filter {
            query = query.filter(filter.clone());
        }
        let plan = Planner::new(&*self).plan(&query)?;
        Executor::new(self).matching_rows(&plan)
    }

    pub(crate) fn read_row(&mut self, table: &str, loc: TupleLocation) -> Result<Option<Vec<Value>>> {
        let storage = self.db.storage(table)?;
        let found = storage.read(loc, &self.view())?;
        if found.is_some() {
            self.ctx.record_read(table, loc);
        }
        Ok(found.map(|tuple| tuple.into_values()))
    }

    pub(crate) fn scan_rows(&mut self, table: &str) -> Result<Vec<LocatedRow>> {
        let rows = DataSource::scan(self, table)?;
        self.record_predicate(table, None);
        for (loc, _) in &rows {
            self.ctx.record_read(table, *loc);
        }
        Ok(rows)
    }

    // ---------- writes ----------

    pub(crate) fn insert_row(&mut self, table: &str, values: Vec<Value>) -> Result<TupleLocation> {
        let db = self.db;
        let def = db.catalog.get_table(table)?;
        let storage = db.storage(table)?;
        let row = db.enforcer.coerce_row(&def, values)?;
        self.store(&def, &storage, row)
    }

    pub(crate) fn insert_named(
        &mut self,
        table: &str,
        columns: &[(&str, Value)],
    ) -> Result<TupleLocation> {
        let db = self.db;
        let def = db.catalog.get_table(table)?;
        let storage = db.storage(table)?;
        let row = db.enforcer.complete_row(&def, columns)?;
        let row = db.enforcer.coerce_row(&def, row)?;
        self.store(&def, &storage, row)
    }

    fn store(&mut self, def: &TableDef, storage: &Table, row: Vec<Value>) -> Result<TupleLocation> {
        let db = self.db;
        let row = self.fire(def, TriggerEvent::BeforeInsert, row, None)?;
        let row = db.enforcer.coerce_row(def, row)?;
        db.enforcer.check_row(def, &row)?;

        let version = storage.insert(row.clone(), self.ctx.id)?;
        self.ctx.record_insert(&def.name, &version, row.clone());

        let indexes = db.catalog.get_table_indexes(&def.name);
        db.enforcer
            .check_unique(def, &indexes, &row, Some(version.loc), self)?;
        for check in db.enforcer.foreign_key_checks(def, &row, None)? {
            self.ctx.defer_foreign_key(check);
        }

        self.fire(def, TriggerEvent::AfterInsert, row, None)?;
        Ok(version.loc)
    }

    pub(crate) fn update_where(
        &mut self,
        table: &str,
        filter: Option<&Expr>,
        assignments: &[(String, Expr)],
    ) -> Result<usize> {
        let db = self.db;
        let def = db.catalog.get_table(table)?;
        let storage = db.storage(table)?;
        let bound = assignments
            .iter()
            .map(|(column, expr)| Ok((def.column_index(column)?, bind_row_expr(&def, expr)?.0)))
            .collect::<Result<Vec<_>>>()?;

        let rows = self.matching(table, filter)?;
        let mut updated = 0;
        for (loc, old) in rows {
            let mut new = old.clone();
            for (idx, expr) in &bound {
                new[*idx] = evaluate(expr, &old)?;
            }
            if self.update_row(&def, &storage, loc, old, new)?.is_some() {
                updated += 1;
            }
        }
        debug!(txn = self.ctx.id, table, rows = updated, "update");
        Ok(updated)
    }

    fn update_row(
        &mut self,
        def: &TableDef,
        storage: &Table,
        loc: TupleLocation,
        old: Vec<Value>,
        new: Vec<Value>,
    ) -> Result<Option<TupleLocation>> {
        let db = self.db;
        let new = db.enforcer.coerce_row(def, new)?;
        let new = self.fire(def, TriggerEvent::BeforeUpdate, new, Some(&old))?;
        let new = db.enforcer.coerce_row(def, new)?;
        db.enforcer.check_row(def, &new)?;
        self.restrict_key_change(def, &old, &new)?;

        let version = loop {
            let (outcome, version) =
                storage.update(loc, new.clone(), self.ctx.id, |holder| {
                    db.txns.can_override(holder)
                })?;
            match (outcome, version) {
                (MarkOutcome::Marked, Some(version)) => break version,
                (MarkOutcome::Blocked(holder), _) => {
                    db.txns.resolve_blocked(self.ctx, &def.name, holder)?;
                }
                (MarkOutcome::Marked, None) => {
                    return Err(Error::Internal(format!(
                        "update of {} in '{}' stored no successor",
                        loc, def.name
                    )));
                }
                (MarkOutcome::OwnedBySelf | MarkOutcome::Missing, _) => return Ok(None),
            }
        };
        self.ctx.record_delete(&def.name, loc);
        self.ctx.record_insert(&def.name, &version, new.clone());

        let indexes = db.catalog.get_table_indexes(&def.name);
        db.enforcer
            .check_unique(def, &indexes, &new, Some(version.loc), self)?;
        for check in db.enforcer.foreign_key_checks(def, &new, Some(&old))? {
            self.ctx.defer_foreign_key(check);
        }

        self.fire(def, TriggerEvent::AfterUpdate, new, Some(&old))?;
        Ok(Some(version.loc))
    }

    pub(crate) fn delete_where(&mut self, table: &str, filter: Option<&Expr>) -> Result<usize> {
        let db = self.db;
        let def = db.catalog.get_table(table)?;
        let storage = db.storage(table)?;
        let rows = self.matching(table, filter)?;
        let mut deleted = 0;
        for (loc, old) in rows {
            if self.delete_row(&def, &storage, loc, old)? {
                deleted += 1;
            }
        }
        debug!(txn = self.ctx.id, table, rows = deleted, "delete");
        Ok(deleted)
    }

    fn delete_row(
        &mut self,
        def: &TableDef,
        storage: &Table,
        loc: TupleLocation,
        old: Vec<Value>,
    ) -> Result<bool> {
        let db = self.db;
        self.fire(def, TriggerEvent::BeforeDelete, old.clone(), Some(&old))?;

        loop {
            match storage.delete(loc, self.ctx.id, |holder| db.txns.can_override(holder))? {
                MarkOutcome::Marked => break,
                MarkOutcome::Blocked(holder) => {
                    db.txns.resolve_blocked(self.ctx, &def.name, holder)?;
                }
                MarkOutcome::OwnedBySelf | MarkOutcome::Missing => return Ok(false),
            }
        }
        self.ctx.record_delete(&def.name, loc);

        self.apply_referential_actions(def, &old)?;
        Ok(true)
    }

    /// RESTRICT or CASCADE for rows referencing a deleted row
    fn apply_referential_actions(&mut self, def: &TableDef, old: &[Value]) -> Result<()> {
        let db = self.db;
        for (child, fk) in db.catalog.referencing(&def.name) {
            let Some(key) = referenced_key(def, &fk, old)? else {
                continue;
            };
            let children = self.live_rows(&child, &fk.columns, &key)?;
            if children.is_empty() {
                continue;
            }
            match fk.on_delete {
                FkAction::Restrict => return Err(restrict_violation(&child, &fk, &key)),
                FkAction::Cascade => {
                    debug!(
                        txn = self.ctx.id,
                        table = %child.name,
                        rows = children.len(),
                        constraint = %fk.name,
                        "cascading delete"
                    );
                    let storage = db.storage(&child.name)?;
                    for (loc, row) in children {
                        self.delete_row(&child, &storage, loc, row)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Changing a referenced key is refused while referencing rows exist
    fn restrict_key_change(&mut self, def: &TableDef, old: &[Value], new: &[Value]) -> Result<()> {
        let db = self.db;
        for (child, fk) in db.catalog.referencing(&def.name) {
            let Some(key) = referenced_key(def, &fk, old)? else {
                continue;
            };
            let next = project(new, &def.column_indices(&fk.ref_columns)?);
            if same_key(&key, &next) {
                continue;
            }
            if !self.live_rows(&child, &fk.columns, &key)?.is_empty() {
                return Err(restrict_violation(&child, &fk, &key));
            }
        }
        Ok(())
    }

    // ---------- triggers ----------

    fn fire(
        &mut self,
        def: &TableDef,
        event: TriggerEvent,
        row: Vec<Value>,
        old: Option<&[Value]>,
    ) -> Result<Vec<Value>> {
        let db = self.db;
        let mut tctx = TriggerContext::new(def, event, self.ctx.handle(), old, self.ctx.trigger_depth);
        let row = db.triggers.run(&mut tctx, row)?;
        let queued = tctx.take_queued();
        if !queued.is_empty() {
            self.run_queued(queued)?;
        }
        Ok(row)
    }

    fn run_queued(&mut self, queued: Vec<QueuedWrite>) -> Result<()> {
        let limit = self.db.config.max_trigger_depth;
        if self.ctx.trigger_depth >= limit {
            return Err(Error::ExecutionError(format!(
                "trigger-queued writes nested deeper than {}",
                limit
            )));
        }
        self.ctx.trigger_depth += 1;
        let result = self.apply_queued(queued);
        self.ctx.trigger_depth -= 1;
        result
    }

    fn apply_queued(&mut self, queued: Vec<QueuedWrite>) -> Result<()> {
        for write in queued {
            match write {
                QueuedWrite::Insert { table, values } => {
                    self.insert_row(&table, values)?;
                }
                QueuedWrite::Update {
                    table,
                    filter,
                    assignments,
                } => {
                    self.update_where(&table, filter.as_ref(), &assignments)?;
                }
                QueuedWrite::Delete { table, filter } => {
                    self.delete_where(&table, filter.as_ref())?;
                }
            }
        }
        Ok(())
    }

    // ---------- latest-state lookups ----------

    /// Versions of `def` that may carry `key` in `columns`
    fn candidates(
        &self,
        def: &TableDef,
        storage: &Table,
        columns: &[String],
        key: &[Value],
    ) -> Result<Vec<TupleLocation>> {
        if let Some(index_def) = self.db.catalog.find_index(&def.name, columns) {
            let index = self.db.indexes.get(&index_def.name)?;
            let key = IndexKey::composite(key.to_vec());
            return Ok(index.lookup_range(Bound::Included(&key), Bound::Included(&key)));
        }
        let positions = def.column_indices(columns)?;
        let mut found = Vec::new();
        for item in storage.scan_versions() {
            let (loc, tuple) = item?;
            if same_key(&project(tuple.values(), &positions), key) {
                found.push(loc);
            }
        }
        Ok(found)
    }

    /// The row at `loc` if it exists in the latest state, counting this
    /// transaction's own writes. Rows whose creator or deleter is still
    /// running are waited on.
    fn latest(&mut self, storage: &Table, loc: TupleLocation) -> Result<Option<Vec<Value>>> {
        let db = self.db;
        let own = self.ctx.id;
        loop {
            let Some(tuple) = storage.read_version(loc)? else {
                return Ok(None);
            };
            let header = tuple.header;
            if header.xmin != own {
                match db.txns.status(header.xmin) {
                    TxnStatus::Aborted => return Ok(None),
                    TxnStatus::Active => {
                        db.txns.await_outcome(self.ctx, header.xmin)?;
                        continue;
                    }
                    TxnStatus::Committed => {}
                }
            }
            if !header.has_deleter() {
                return Ok(Some(tuple.into_values()));
            }
            if header.xmax == own {
                return Ok(None);
            }
            match db.txns.status(header.xmax) {
                TxnStatus::Aborted => return Ok(Some(tuple.into_values())),
                TxnStatus::Committed => return Ok(None),
                TxnStatus::Active => {
                    db.txns.await_outcome(self.ctx, header.xmax)?;
                }
            }
        }
    }

    /// Rows of `def` in the latest state whose `columns` equal `key`
    fn live_rows(
        &mut self,
        def: &TableDef,
        columns: &[String],
        key: &[Value],
    ) -> Result<Vec<LocatedRow>> {
        let storage = self.db.storage(&def.name)?;
        let positions = def.column_indices(columns)?;
        let mut rows = Vec::new();
        for loc in self.candidates(def, &storage, columns, key)? {
            if let Some(values) = self.latest(&storage, loc)? {
                if same_key(&project(&values, &positions), key) {
                    rows.push((loc, values));
                }
            }
        }
        Ok(rows)
    }
}

impl KeyLookup for Session<'_> {
    fn key_exists(
        &mut self,
        table: &TableDef,
        columns: &[String],
        key: &[Value],
        exclude: Option<TupleLocation>,
    ) -> Result<bool> {
        let storage = self.db.storage(&table.name)?;
        let positions = table.column_indices(columns)?;
        for loc in self.candidates(table, &storage, columns, key)? {
            if Some(loc) == exclude {
                continue;
            }
            if let Some(values) = self.latest(&storage, loc)? {
                if same_key(&project(&values, &positions), key) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

impl PlanContext for Session<'_> {
    fn table(&self, name: &str) -> Result<Arc<TableDef>> {
        PlanContext::table(self.db, name)
    }

    fn indexes(&self, table: &str) -> Vec<Arc<IndexDef>> {
        PlanContext::indexes(self.db, table)
    }

    fn statistics(&self, table: &str) -> Result<TableStatistics> {
        self.db.statistics(table)
    }
}

impl DataSource for Session<'_> {
    fn scan(&mut self, table: &str) -> Result<Vec<LocatedRow>> {
        let storage = self.db.storage(table)?;
        let view = self.view();
        storage
            .scan(&view)
            .map(|item| item.map(|(loc, tuple)| (loc, tuple.into_values())))
            .collect()
    }

    fn index_scan(
        &mut self,
        table: &str,
        index: &str,
        lower: Bound<IndexKey>,
        upper: Bound<IndexKey>,
    ) -> Result<Vec<LocatedRow>> {
        let storage = self.db.storage(table)?;
        let index = self.db.indexes.get(index)?;
        let view = self.view();
        let mut rows = Vec::new();
        for loc in index.lookup_range(lower.as_ref(), upper.as_ref()) {
            if let Some(tuple) = storage.read(loc, &view)? {
                rows.push((loc, tuple.into_values()));
            }
        }
        Ok(rows)
    }

    fn record_read(&mut self, table: &str, loc: TupleLocation) {
        self.ctx.record_read(table, loc);
    }

    fn record_predicate(&mut self, table: &str, matcher: Option<RowMatcher>) {
        self.ctx.record_predicate(ReadPredicate {
            table: table.to_string(),
            matcher,
        });
    }
}
