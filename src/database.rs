//! Database facade
//!
//! `Database` owns the catalog, table storage, indexes, transaction manager,
//! constraint enforcer and trigger registry, and exposes the engine's API.
//! Every statement runs with a savepoint: a failure undoes only that
//! statement's writes, except errors that require a restart, which abort
//! the whole transaction.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, IndexDef, TableDef, TableStatistics};
use crate::config::EngineConfig;
use crate::constraint::{project, ConstraintEnforcer, Trigger, TriggerEvent, TriggerRegistry};
use crate::error::{ConstraintKind, Error, Result};
use crate::executor::{Explain, Expr, LocatedRow, PlanContext, Planner, Query, QueryResult};
use crate::session::Session;
use crate::storage::{
    CommitLog, DiskManager, IndexManager, Table, TupleLocation, TxnId, Value, INVALID_TXN,
};
use crate::transaction::{
    IdleTransaction, IsolationLevel, StatementMark, Transaction, TransactionContext,
    TransactionManager,
};

pub const CATALOG_FILE: &str = "catalog.json";
pub const COMMIT_LOG_FILE: &str = "commit.log";

/// What a vacuum pass reclaimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    pub tables: usize,
    pub versions_removed: usize,
    pub pages_compacted: usize,
}

/// Result of checking one table's storage against its indexes
#[derive(Debug, Clone, Default)]
pub struct TableReport {
    pub table: String,
    pub pages: usize,
    /// Stored versions, live or not
    pub versions: usize,
    /// Stored versions written by an UPDATE
    pub successors: usize,
    /// Rows in the latest committed state
    pub rows: usize,
    pub index_entries: Vec<(String, usize)>,
    pub problems: Vec<String>,
}

impl TableReport {
    pub fn is_healthy(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Handle to the background idle sweep; dropping it stops the thread
#[derive(Debug)]
pub struct IdleMonitor {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IdleMonitor {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("idle monitor thread panicked");
            }
        }
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A database instance
pub struct Database {
    pub(crate) config: EngineConfig,
    pub(crate) catalog: Catalog,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    pub(crate) indexes: IndexManager,
    pub(crate) txns: TransactionManager,
    pub(crate) enforcer: ConstraintEnforcer,
    pub(crate) triggers: TriggerRegistry,
    disk: Option<Arc<DiskManager>>,
    /// Serializes schema changes and checkpoints
    ddl: Mutex<()>,
}

impl Database {
    /// Open a database. With a `data_dir` the catalog, heaps, indexes and
    /// commit log found there are recovered; without one everything lives in
    /// memory.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let lock_timeout = config.lock_timeout_duration();
        let Some(dir) = config.data_dir.clone() else {
            let txns = TransactionManager::new(CommitLog::in_memory(), lock_timeout);
            return Ok(Self::assemble(config, Catalog::new(), txns, None));
        };

        std::fs::create_dir_all(&dir)?;
        let disk = Arc::new(DiskManager::new(dir.clone(), config.sync_on_commit));
        let catalog_path = dir.join(CATALOG_FILE);
        let catalog = if catalog_path.exists() {
            Catalog::load_from_disk(&catalog_path)?
        } else {
            Catalog::new()
        };

        let mut tables = HashMap::new();
        let mut max_seen: TxnId = 0;
        for def in catalog.list_tables() {
            let storage = match Table::open(def.id, &def.name, disk.clone()) {
                Ok(storage) => storage,
                Err(e) => {
                    if e.is_fatal() {
                        error!(table = %def.name, error = %e, "table failed verification");
                    }
                    return Err(e);
                }
            };
            for item in storage.scan_versions() {
                let (_, tuple) = item?;
                max_seen = max_seen.max(tuple.header.xmin);
                if tuple.header.xmax != INVALID_TXN {
                    max_seen = max_seen.max(tuple.header.xmax);
                }
            }
            tables.insert(def.name.clone(), Arc::new(storage));
        }

        let (clog, state) = CommitLog::open(dir.join(COMMIT_LOG_FILE), config.sync_on_commit)?;
        let next_id = state.max_txn.max(max_seen) + 1;
        let committed = state.committed.len();
        let txns = TransactionManager::recover(clog, next_id, state.committed, lock_timeout);

        let db = Self::assemble(config, catalog, txns, Some(disk));
        for def in db.catalog.list_tables() {
            let Some(storage) = tables.remove(&def.name) else {
                continue;
            };
            for index_def in db.catalog.get_table_indexes(&def.name) {
                let columns = def.column_indices(&index_def.columns)?;
                let index = db.indexes.register(index_def.clone(), columns);
                if db.indexes.load(&dir, &index_def.name, storage.stamp())? {
                    storage.attach_index(index);
                } else {
                    warn!(index = %index_def.name, table = %def.name, "rebuilding index from heap");
                    storage.add_index(index)?;
                }
            }
            if let Some(stats) = &def.stats {
                let mut stats = stats.clone();
                stats.modifications = 0;
                db.catalog.update_table_stats(&def.name, stats)?;
            }
            db.tables.write().insert(def.name.clone(), storage);
        }

        info!(
            dir = %dir.display(),
            tables = db.tables.read().len(),
            committed,
            next_txn = next_id,
            "recovered database"
        );
        Ok(db)
    }

    /// An empty in-memory database with default settings
    pub fn in_memory() -> Self {
        let config = EngineConfig::default();
        let txns = TransactionManager::new(CommitLog::in_memory(), config.lock_timeout_duration());
        Self::assemble(config, Catalog::new(), txns, None)
    }

    fn assemble(
        config: EngineConfig,
        catalog: Catalog,
        txns: TransactionManager,
        disk: Option<Arc<DiskManager>>,
    ) -> Self {
        Self {
            indexes: IndexManager::new(config.btree_order),
            config,
            catalog,
            tables: RwLock::new(HashMap::new()),
            txns,
            enforcer: ConstraintEnforcer::new(),
            triggers: TriggerRegistry::new(),
            disk,
            ddl: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.config.data_dir.as_deref()
    }

    /// Names of every table, sorted
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Storage of one table
    pub fn storage(&self, name: &str) -> Result<Arc<Table>> {
        self.lookup(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    fn lookup(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    fn save_catalog(&self) -> Result<()> {
        if let Some(dir) = self.data_dir() {
            self.catalog.save_to_disk(&dir.join(CATALOG_FILE))?;
        }
        Ok(())
    }

    // ---------- schema ----------

    /// Create a table with its primary key and unique indexes
    pub fn create_table(&self, def: TableDef) -> Result<Arc<TableDef>> {
        let _ddl = self.ddl.lock();
        let def = self.catalog.create_table(def)?;
        let storage = Arc::new(Table::new(def.id, &def.name, self.disk.clone()));
        for index_def in self.catalog.get_table_indexes(&def.name) {
            let columns = def.column_indices(&index_def.columns)?;
            storage.attach_index(self.indexes.register(index_def, columns));
        }
        self.tables.write().insert(def.name.clone(), storage);
        self.save_catalog()?;
        Ok(def)
    }

    /// Create a secondary index and populate it from the heap. A unique
    /// index is refused if committed rows already share a key.
    pub fn create_index(
        &self,
        name: &str,
        table: &str,
        columns: &[&str],
        unique: bool,
    ) -> Result<Arc<IndexDef>> {
        let _ddl = self.ddl.lock();
        let def = self.catalog.get_table(table)?;
        let storage = self.storage(table)?;
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let positions = def.column_indices(&columns)?;
        if unique {
            self.ensure_unique(&def, &storage, &positions)?;
        }

        // planners only see the index once it is complete
        let index_def = self.catalog.new_index_def(name, table, columns, unique)?;
        let index = self.indexes.prepare(index_def.clone(), positions);
        storage.add_index(index.clone())?;
        self.indexes.publish(index);
        self.catalog.add_index(index_def.clone())?;
        self.save_catalog()?;
        Ok(index_def)
    }

    fn ensure_unique(&self, def: &TableDef, storage: &Table, positions: &[usize]) -> Result<()> {
        let view = self.txns.latest_committed();
        let mut seen = HashSet::new();
        for item in storage.scan(&view) {
            let (_, tuple) = item?;
            let key = project(tuple.values(), positions);
            if key.iter().any(Value::is_null) {
                continue;
            }
            if !seen.insert(key.clone()) {
                let rendered: Vec<String> = key.iter().map(|v| v.to_string()).collect();
                return Err(Error::constraint(
                    ConstraintKind::Unique,
                    &def.name,
                    format!("existing rows share the key ({})", rendered.join(", ")),
                ));
            }
        }
        Ok(())
    }

    /// Append a lifecycle handler for `event` on `table`
    pub fn register_trigger(
        &self,
        table: &str,
        event: TriggerEvent,
        name: &str,
        handler: impl Trigger + 'static,
    ) -> Result<()> {
        self.catalog.get_table(table)?;
        self.triggers
            .register(table, event, name, Arc::new(handler))?;
        info!(table, trigger = name, %event, "registered trigger");
        Ok(())
    }

    /// Recompute statistics from the latest committed state
    pub fn analyze(&self, table: &str) -> Result<TableStatistics> {
        let def = self.catalog.get_table(table)?;
        let storage = self.storage(table)?;
        let view = self.txns.latest_committed();
        let rows = storage
            .scan(&view)
            .map(|item| item.map(|(_, tuple)| tuple.into_values()))
            .collect::<Result<Vec<_>>>()?;
        let stats = TableStatistics::gather(
            def.schema.column_count(),
            rows.iter().map(|row| row.as_slice()),
            storage.modifications(),
        );
        self.catalog.update_table_stats(table, stats.clone())?;
        debug!(table, rows = stats.row_count, "analyzed");
        Ok(stats)
    }

    // ---------- transactions ----------

    pub fn begin(&self, isolation: IsolationLevel) -> Transaction {
        self.txns.begin(isolation)
    }

    pub fn begin_default(&self) -> Transaction {
        self.begin(self.config.default_isolation)
    }

    /// Run deferred foreign key checks, then commit. Any failure aborts the
    /// transaction.
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        let entry = self.txns.entry(txn.id)?;
        let mut ctx = entry.lock();
        if !ctx.is_active() {
            return Err(Error::TransactionNotActive(txn.id));
        }
        let lookup = |name: &str| self.lookup(name);

        let pending = ctx.take_pending_foreign_keys();
        if !pending.is_empty() {
            let checked = Session::new(self, &mut ctx).check_references(&pending);
            if let Err(e) = checked {
                debug!(txn = txn.id, error = %e, "deferred foreign key check failed");
                self.txns.abort(&mut ctx, &lookup)?;
                return Err(e);
            }
        }
        self.txns.commit(&mut ctx, &lookup)
    }

    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        let entry = self.txns.entry(txn.id)?;
        let mut ctx = entry.lock();
        let lookup = |name: &str| self.lookup(name);
        self.txns.abort(&mut ctx, &lookup)
    }

    pub fn active_transactions(&self) -> usize {
        self.txns.active_count()
    }

    /// Run one statement under a savepoint
    fn statement<T>(
        &self,
        txn: &Transaction,
        run: impl FnOnce(&mut Session<'_>) -> Result<T>,
    ) -> Result<T> {
        let entry = self.txns.entry(txn.id)?;
        let mut ctx = entry.lock();
        if !ctx.is_active() {
            return Err(Error::TransactionNotActive(txn.id));
        }
        self.txns.begin_statement(&mut ctx);
        let mark = ctx.mark();

        let result = {
            let mut session = Session::new(self, &mut ctx);
            run(&mut session).and_then(|value| {
                session.finish_statement(mark)?;
                Ok(value)
            })
        };
        if let Err(e) = &result {
            self.fail_statement(&mut ctx, mark, e);
        }
        result
    }

    fn fail_statement(&self, ctx: &mut TransactionContext, mark: StatementMark, cause: &Error) {
        let lookup = |name: &str| self.lookup(name);
        if cause.requires_restart() || cause.is_fatal() || self.config.escalate_statement_errors {
            debug!(txn = ctx.id, error = %cause, "statement failure aborts transaction");
            if let Err(e) = self.txns.abort(ctx, &lookup) {
                error!(txn = ctx.id, error = %e, "abort failed");
            }
        } else if let Err(e) = ctx.rollback_to(mark, &lookup) {
            error!(txn = ctx.id, error = %e, "statement rollback failed");
            if let Err(e) = self.txns.abort(ctx, &lookup) {
                error!(txn = ctx.id, error = %e, "abort failed");
            }
        }
    }

    // ---------- DML ----------

    /// Insert a full row in column order
    pub fn insert(&self, txn: &Transaction, table: &str, values: Vec<Value>) -> Result<TupleLocation> {
        self.statement(txn, |s| s.insert_row(table, values))
    }

    /// Insert named columns; omitted ones take their default or NULL
    pub fn insert_columns(
        &self,
        txn: &Transaction,
        table: &str,
        columns: &[(&str, Value)],
    ) -> Result<TupleLocation> {
        self.statement(txn, |s| s.insert_named(table, columns))
    }

    /// Apply `assignments` to every row passing `filter`; returns the number
    /// of rows updated
    pub fn update(
        &self,
        txn: &Transaction,
        table: &str,
        filter: Option<Expr>,
        assignments: &[(&str, Expr)],
    ) -> Result<usize> {
        let assignments: Vec<(String, Expr)> = assignments
            .iter()
            .map(|(column, expr)| (column.to_string(), expr.clone()))
            .collect();
        self.statement(txn, |s| s.update_where(table, filter.as_ref(), &assignments))
    }

    /// Delete every row passing `filter`; returns the number deleted
    pub fn delete(&self, txn: &Transaction, table: &str, filter: Option<Expr>) -> Result<usize> {
        self.statement(txn, |s| s.delete_where(table, filter.as_ref()))
    }

    // ---------- reads ----------

    pub fn read(
        &self,
        txn: &Transaction,
        table: &str,
        loc: TupleLocation,
    ) -> Result<Option<Vec<Value>>> {
        self.statement(txn, |s| s.read_row(table, loc))
    }

    /// Every row visible to the transaction, in storage order
    pub fn scan(&self, txn: &Transaction, table: &str) -> Result<Vec<LocatedRow>> {
        self.statement(txn, |s| s.scan_rows(table))
    }

    pub fn execute(&self, txn: &Transaction, query: &Query) -> Result<QueryResult> {
        self.statement(txn, |s| s.query(query))
    }

    pub fn explain(&self, query: &Query) -> Result<Explain> {
        Planner::new(self).explain(query)
    }

    /// Statistics for planning, refreshed when missing or stale
    fn current_statistics(&self, table: &str) -> Result<TableStatistics> {
        let def = self.catalog.get_table(table)?;
        let storage = self.storage(table)?;
        match &def.stats {
            Some(stats) if !stats.is_stale(storage.modifications()) => Ok(stats.clone()),
            _ => self.analyze(table),
        }
    }

    // ---------- maintenance ----------

    /// Flush every table, then persist the catalog and index layouts
    pub fn checkpoint(&self) -> Result<()> {
        let _ddl = self.ddl.lock();
        let tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        let mut pages = 0;
        for storage in &tables {
            pages += storage.flush()?;
        }
        let Some(dir) = self.data_dir() else {
            return Ok(());
        };
        self.save_catalog()?;
        for storage in &tables {
            let stamp = storage.stamp();
            for index in storage.indexes() {
                self.indexes.save(dir, index.name(), stamp)?;
            }
        }
        info!(tables = tables.len(), pages, "checkpoint complete");
        Ok(())
    }

    /// Remove versions no snapshot can see and compact their pages
    pub fn vacuum(&self) -> Result<VacuumStats> {
        let horizon = self.txns.vacuum_horizon();
        let tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        let mut stats = VacuumStats::default();
        for storage in tables {
            let mut dead = Vec::new();
            for item in storage.scan_versions() {
                let (loc, tuple) = item?;
                if self.txns.is_dead(&tuple.header, horizon) {
                    dead.push(loc);
                }
            }
            for loc in dead {
                if storage.purge(loc)? {
                    stats.versions_removed += 1;
                }
            }
            stats.pages_compacted += storage.heap().compact();
            stats.tables += 1;
        }
        info!(
            horizon,
            removed = stats.versions_removed,
            compacted = stats.pages_compacted,
            "vacuum complete"
        );
        Ok(stats)
    }

    /// Report (and with `abort_idle`, abort) transactions idle longer than
    /// the configured timeout
    pub fn sweep_idle(&self) -> Vec<IdleTransaction> {
        let lookup = |name: &str| self.lookup(name);
        self.txns.sweep_idle(
            self.config.idle_timeout_duration(),
            self.config.abort_idle,
            &lookup,
        )
    }

    /// Run `sweep_idle` every `sweep_interval` on a background thread
    pub fn spawn_idle_monitor(self: &Arc<Self>) -> Result<IdleMonitor> {
        let db = Arc::downgrade(self);
        let interval = self.config.sweep_interval_duration();
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("snapdb-idle-monitor".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(db) = db.upgrade() else { break };
                let idle = db.sweep_idle();
                if !idle.is_empty() {
                    debug!(count = idle.len(), "idle sweep");
                }
            })?;
        Ok(IdleMonitor {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Cross-check every table's versions against its indexes
    pub fn verify(&self) -> Result<Vec<TableReport>> {
        let mut reports = Vec::new();
        for def in self.catalog.list_tables() {
            let storage = self.storage(&def.name)?;
            let mut report = TableReport {
                table: def.name.clone(),
                pages: storage.heap().page_count(),
                ..Default::default()
            };

            let mut versions = HashMap::new();
            for item in storage.scan_versions() {
                let (loc, tuple) = item?;
                if tuple.header.is_update_successor() {
                    report.successors += 1;
                }
                versions.insert(loc, tuple.into_values());
            }
            report.versions = versions.len();
            report.rows = storage.scan(&self.txns.latest_committed()).count();

            for index in storage.indexes() {
                let entries = index.entries();
                report
                    .index_entries
                    .push((index.name().to_string(), entries.len()));
                if entries.len() != versions.len() {
                    report.problems.push(format!(
                        "index '{}' has {} entries for {} versions",
                        index.name(),
                        entries.len(),
                        versions.len()
                    ));
                }
                for (key, loc) in entries {
                    match versions.get(&loc) {
                        None => report.problems.push(format!(
                            "index '{}' points at missing version {}",
                            index.name(),
                            loc
                        )),
                        Some(values) => {
                            if key.compare(&index.key_for(values)) != std::cmp::Ordering::Equal {
                                report.problems.push(format!(
                                    "index '{}' key for {} does not match the row",
                                    index.name(),
                                    loc
                                ));
                            }
                        }
                    }
                }
            }
            if !report.is_healthy() {
                warn!(table = %def.name, problems = report.problems.len(), "verification found problems");
            }
            reports.push(report);
        }
        Ok(reports)
    }
}

impl PlanContext for Database {
    fn table(&self, name: &str) -> Result<Arc<TableDef>> {
        self.catalog.get_table(name)
    }

    fn indexes(&self, table: &str) -> Vec<Arc<IndexDef>> {
        self.catalog.get_table_indexes(table)
    }

    fn statistics(&self, table: &str) -> Result<TableStatistics> {
        self.current_statistics(table)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data_dir", &self.config.data_dir)
            .field("tables", &self.table_names())
            .field("active_transactions", &self.txns.active_count())
            .finish()
    }
}
