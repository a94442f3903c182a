//! Transaction Manager
//!
//! Handles transaction lifecycle (Begin, Commit, Abort), statement
//! snapshots, waiting on write intents with deadlock detection, and
//! validation of SERIALIZABLE transactions at commit.

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::snapshot::{ReadView, Snapshot, StatusTable};
use super::transaction::{Transaction, TransactionContext};
use super::{IsolationLevel, TxnStatus};
use crate::error::{Error, Result};
use crate::storage::{
    ClogRecordType, CommitLog, Table, TupleHeader, TupleLocation, TxnId, Value, Visibility,
};

/// Looks up a table by name during undo and commit
pub type TableLookup<'a> = &'a dyn Fn(&str) -> Option<Arc<Table>>;

/// A registered transaction
#[derive(Debug)]
pub struct ActiveTransaction {
    ctx: Mutex<TransactionContext>,
    last_activity: Mutex<Instant>,
}

impl ActiveTransaction {
    /// Lock the context for a statement
    pub fn lock(&self) -> MutexGuard<'_, TransactionContext> {
        let guard = self.ctx.lock();
        *self.last_activity.lock() = Instant::now();
        guard
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// What a blocked writer should do once the intent holder is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedWrite {
    /// The holder aborted; try again
    Retry,
}

/// Writes published by a committed transaction, kept while a SERIALIZABLE
/// transaction that cannot see them is still running
#[derive(Debug)]
struct CommittedWrites {
    txn: TxnId,
    deleted: HashSet<(String, TupleLocation)>,
    inserted: Vec<(String, Vec<Value>)>,
}

/// Sees versions created by committed transactions and not deleted by one
pub struct LatestCommitted<'a> {
    manager: &'a TransactionManager,
}

impl Visibility for LatestCommitted<'_> {
    fn is_visible(&self, header: &TupleHeader) -> bool {
        let status = &self.manager.status;
        status.status(header.xmin) == TxnStatus::Committed
            && !(header.has_deleter() && status.status(header.xmax) == TxnStatus::Committed)
    }
}

/// A transaction reported by the idle sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleTransaction {
    pub id: TxnId,
    pub isolation: IsolationLevel,
    pub idle: Duration,
    pub aborted: bool,
}

/// Transaction Manager
#[derive(Debug)]
pub struct TransactionManager {
    status: StatusTable,
    /// Active Transactions
    entries: RwLock<HashMap<TxnId, Arc<ActiveTransaction>>>,
    /// Current snapshot of every transaction that has one
    snapshots: Mutex<HashMap<TxnId, (IsolationLevel, Arc<Snapshot>)>>,
    /// Serializes validation and the commit point
    commit_lock: Mutex<()>,
    /// Wait-for graph: waiter -> intent holder
    waits: Mutex<HashMap<TxnId, TxnId>>,
    wakeup: Condvar,
    recent: Mutex<Vec<CommittedWrites>>,
    clog: CommitLog,
    lock_timeout: Duration,
}

impl TransactionManager {
    /// A fresh manager with no history
    pub fn new(clog: CommitLog, lock_timeout: Duration) -> Self {
        Self::recover(clog, 1, HashSet::new(), lock_timeout)
    }

    /// A manager resuming after restart: ids in `committed` are committed,
    /// every other id below `next_id` counts as aborted
    pub fn recover(
        clog: CommitLog,
        next_id: TxnId,
        committed: HashSet<TxnId>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            status: StatusTable::new(next_id, committed),
            entries: RwLock::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            waits: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
            recent: Mutex::new(Vec::new()),
            clog,
            lock_timeout,
        }
    }

    /// Begin a new transaction
    pub fn begin(&self, isolation: IsolationLevel) -> Transaction {
        let id = self.status.begin();
        let entry = Arc::new(ActiveTransaction {
            ctx: Mutex::new(TransactionContext::new(id, isolation)),
            last_activity: Mutex::new(Instant::now()),
        });
        self.entries.write().insert(id, entry);
        debug!(txn = id, %isolation, "begin");
        Transaction { id, isolation }
    }

    /// The registered transaction `id`
    pub fn entry(&self, id: TxnId) -> Result<Arc<ActiveTransaction>> {
        if let Some(entry) = self.entries.read().get(&id) {
            return Ok(entry.clone());
        }
        if id != 0 && id < self.status.next_id() {
            Err(Error::TransactionNotActive(id))
        } else {
            Err(Error::TransactionNotFound(id))
        }
    }

    pub fn status(&self, txn: TxnId) -> TxnStatus {
        self.status.status(txn)
    }

    pub fn is_active(&self, txn: TxnId) -> bool {
        self.entries.read().contains_key(&txn)
    }

    pub fn active_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn next_id(&self) -> TxnId {
        self.status.next_id()
    }

    /// An existing intent may be replaced only if its owner aborted
    pub fn can_override(&self, holder: TxnId) -> bool {
        self.status.status(holder) == TxnStatus::Aborted
    }

    /// Prepare the context for a new statement: READ COMMITTED takes a
    /// fresh snapshot, REPEATABLE READ and SERIALIZABLE keep their first one
    pub fn begin_statement(&self, ctx: &mut TransactionContext) {
        let refresh = match ctx.isolation {
            IsolationLevel::ReadUncommitted => false,
            IsolationLevel::ReadCommitted => true,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                ctx.snapshot().is_none()
            }
        };
        if refresh {
            let snapshot = Arc::new(self.status.snapshot(ctx.id));
            self.snapshots
                .lock()
                .insert(ctx.id, (ctx.isolation, snapshot.clone()));
            ctx.set_snapshot(snapshot);
        }
    }

    /// The visibility rule for the context's current statement
    pub fn read_view(&self, ctx: &TransactionContext) -> ReadView<'_> {
        match (ctx.isolation, ctx.snapshot()) {
            (IsolationLevel::ReadUncommitted, _) | (_, None) => {
                ReadView::uncommitted(ctx.id, &self.status)
            }
            (_, Some(snapshot)) => ReadView::snapshot(snapshot.clone(), &self.status),
        }
    }

    /// Whether `header` is the latest version: neither deleted by a
    /// committed transaction nor created by an aborted one
    pub fn is_current(&self, header: &TupleHeader, own: TxnId) -> bool {
        if self.status.status(header.xmin) == TxnStatus::Aborted && header.xmin != own {
            return false;
        }
        !header.has_deleter()
            || (header.xmax != own && self.status.status(header.xmax) == TxnStatus::Aborted)
    }

    /// Decide what a writer does after finding `holder`'s intent on a row.
    /// Returns `Retry` when the holder aborted; every other outcome is an
    /// error.
    pub fn resolve_blocked(
        &self,
        ctx: &TransactionContext,
        table: &str,
        holder: TxnId,
    ) -> Result<BlockedWrite> {
        let snapshot_level = ctx.isolation.uses_transaction_snapshot();
        let status = match self.status.status(holder) {
            TxnStatus::Active if snapshot_level => {
                debug!(txn = ctx.id, holder, table, "concurrent update");
                return Err(Error::SerializationFailure {
                    txn: ctx.id,
                    detail: format!(
                        "row in '{}' is being modified by transaction {}",
                        table, holder
                    ),
                });
            }
            TxnStatus::Active => self.wait_for(ctx.id, holder)?,
            status => status,
        };

        match status {
            TxnStatus::Aborted => Ok(BlockedWrite::Retry),
            TxnStatus::Committed => {
                let unseen = ctx.snapshot().map_or(false, |s| !s.sees(holder));
                if snapshot_level && unseen {
                    Err(Error::SerializationFailure {
                        txn: ctx.id,
                        detail: format!(
                            "row in '{}' was modified by concurrent transaction {}",
                            table, holder
                        ),
                    })
                } else {
                    Err(Error::WriteConflict {
                        table: table.to_string(),
                        detail: format!("row was modified by transaction {}", holder),
                    })
                }
            }
            TxnStatus::Active => Err(Error::Internal(format!(
                "transaction {} still active after wait",
                holder
            ))),
        }
    }

    /// Wait for `holder` regardless of isolation level and report how it
    /// ended. Constraint lookups use this on rows whose fate is undecided.
    pub fn await_outcome(&self, ctx: &TransactionContext, holder: TxnId) -> Result<TxnStatus> {
        match self.status.status(holder) {
            TxnStatus::Active => self.wait_for(ctx.id, holder),
            status => Ok(status),
        }
    }

    /// A view of the latest committed version of every row
    pub fn latest_committed(&self) -> LatestCommitted<'_> {
        LatestCommitted { manager: self }
    }

    /// Block until `holder` finishes, returning its final status
    fn wait_for(&self, me: TxnId, holder: TxnId) -> Result<TxnStatus> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut waits = self.waits.lock();

        loop {
            let status = self.status.status(holder);
            if status != TxnStatus::Active {
                waits.remove(&me);
                return Ok(status);
            }
            if waits.get(&me) != Some(&holder) {
                waits.insert(me, holder);
                if Self::has_cycle(&waits, me) {
                    waits.remove(&me);
                    warn!(txn = me, holder, "deadlock detected");
                    return Err(Error::DeadlockDetected(me));
                }
                debug!(txn = me, holder, "waiting on write intent");
            }
            if self.wakeup.wait_until(&mut waits, deadline).timed_out() {
                let status = self.status.status(holder);
                waits.remove(&me);
                if status != TxnStatus::Active {
                    return Ok(status);
                }
                warn!(txn = me, holder, "lock wait timed out");
                return Err(Error::LockTimeout { txn: me, holder });
            }
        }
    }

    /// Following the wait-for chain from `start` leads back to it
    fn has_cycle(waits: &HashMap<TxnId, TxnId>, start: TxnId) -> bool {
        let mut seen = HashSet::new();
        let mut current = start;
        while let Some(&next) = waits.get(&current) {
            if next == start {
                return true;
            }
            if !seen.insert(next) {
                return false;
            }
            current = next;
        }
        false
    }

    fn notify_waiters(&self) {
        let _waits = self.waits.lock();
        self.wakeup.notify_all();
    }

    /// Commit: validate (SERIALIZABLE), flush written tables, log, then flip
    /// the status. A failure aborts the transaction.
    pub fn commit(&self, ctx: &mut TransactionContext, tables: TableLookup<'_>) -> Result<()> {
        if !ctx.is_active() {
            return Err(Error::TransactionNotActive(ctx.id));
        }

        let commit_guard = self.commit_lock.lock();
        let published = self.publish(ctx, tables);
        if let Err(e) = published {
            drop(commit_guard);
            debug!(txn = ctx.id, error = %e, "commit failed");
            self.abort(ctx, tables)?;
            return Err(e);
        }
        self.status.finish(ctx.id, TxnStatus::Committed);
        ctx.state = TxnStatus::Committed;
        drop(commit_guard);

        self.finish(ctx.id);
        debug!(txn = ctx.id, "commit");
        Ok(())
    }

    fn publish(&self, ctx: &TransactionContext, tables: TableLookup<'_>) -> Result<()> {
        if ctx.isolation == IsolationLevel::Serializable {
            self.validate(ctx)?;
        }
        if !ctx.has_writes() {
            return Ok(());
        }
        for name in ctx.written_tables() {
            if let Some(table) = tables(name) {
                table.flush()?;
            }
        }
        self.clog.append(ctx.id, ClogRecordType::Commit)?;

        let serializable_running = self
            .snapshots
            .lock()
            .iter()
            .any(|(id, (level, _))| *id != ctx.id && *level == IsolationLevel::Serializable);
        if serializable_running {
            self.recent.lock().push(CommittedWrites {
                txn: ctx.id,
                deleted: ctx.deleted().iter().cloned().collect(),
                inserted: ctx.inserted().to_vec(),
            });
        }
        Ok(())
    }

    /// Reject the commit if a concurrent committed transaction changed a row
    /// this one read or inserted a row its scans would have returned
    fn validate(&self, ctx: &TransactionContext) -> Result<()> {
        let Some(snapshot) = ctx.snapshot() else {
            return Ok(());
        };
        let recent = self.recent.lock();
        for writes in recent.iter().filter(|w| !snapshot.sees(w.txn)) {
            if ctx.read_rows().iter().any(|row| writes.deleted.contains(row)) {
                return Err(Error::SerializationFailure {
                    txn: ctx.id,
                    detail: format!("a row read was changed by transaction {}", writes.txn),
                });
            }
            let phantom = writes.inserted.iter().any(|(table, row)| {
                ctx.read_predicates()
                    .iter()
                    .any(|predicate| predicate.matches(table, row))
            });
            if phantom {
                return Err(Error::SerializationFailure {
                    txn: ctx.id,
                    detail: format!(
                        "transaction {} inserted a row matching a scan",
                        writes.txn
                    ),
                });
            }
        }
        Ok(())
    }

    /// Abort: undo every mutation, then mark the transaction aborted
    pub fn abort(&self, ctx: &mut TransactionContext, tables: TableLookup<'_>) -> Result<()> {
        if !ctx.is_active() {
            return Err(Error::TransactionNotActive(ctx.id));
        }
        let had_writes = ctx.has_writes();
        let undone = ctx.rollback_all(tables);
        if let Err(e) = &undone {
            error!(txn = ctx.id, error = %e, "undo failed");
        }
        self.status.finish(ctx.id, TxnStatus::Aborted);
        ctx.state = TxnStatus::Aborted;
        if had_writes {
            self.clog.append(ctx.id, ClogRecordType::Abort)?;
        }
        self.finish(ctx.id);
        debug!(txn = ctx.id, "abort");
        undone
    }

    /// Drop bookkeeping for a finished transaction and wake waiters
    fn finish(&self, id: TxnId) {
        self.notify_waiters();
        self.entries.write().remove(&id);

        let mut snapshots = self.snapshots.lock();
        snapshots.remove(&id);
        let open: Vec<Arc<Snapshot>> = snapshots
            .values()
            .filter(|(level, _)| *level == IsolationLevel::Serializable)
            .map(|(_, snapshot)| snapshot.clone())
            .collect();
        drop(snapshots);
        self.recent
            .lock()
            .retain(|w| open.iter().any(|snapshot| !snapshot.sees(w.txn)));
    }

    /// Oldest id whose deletions some snapshot may not see yet
    pub fn vacuum_horizon(&self) -> TxnId {
        let oldest = self.status.oldest_active();
        self.snapshots
            .lock()
            .values()
            .map(|(_, snapshot)| snapshot.oldest_unseen())
            .fold(oldest, TxnId::min)
    }

    /// Whether no current or future reader can see this version
    pub fn is_dead(&self, header: &TupleHeader, horizon: TxnId) -> bool {
        if self.status.status(header.xmin) == TxnStatus::Aborted {
            return true;
        }
        header.has_deleter()
            && header.xmax < horizon
            && self.status.status(header.xmax) == TxnStatus::Committed
    }

    /// Report transactions idle longer than `timeout`, aborting them when
    /// `abort` is set. Transactions in the middle of a statement are skipped.
    pub fn sweep_idle(
        &self,
        timeout: Duration,
        abort: bool,
        tables: TableLookup<'_>,
    ) -> Vec<IdleTransaction> {
        let entries: Vec<Arc<ActiveTransaction>> = self.entries.read().values().cloned().collect();
        let mut idle = Vec::new();

        for entry in entries {
            let idle_for = entry.idle_for();
            if idle_for < timeout {
                continue;
            }
            let Some(mut ctx) = entry.ctx.try_lock() else {
                continue;
            };
            if !ctx.is_active() {
                continue;
            }
            warn!(txn = ctx.id, idle_ms = idle_for.as_millis() as u64, "idle transaction");
            let mut aborted = false;
            if abort {
                match self.abort(&mut ctx, tables) {
                    Ok(()) => aborted = true,
                    Err(e) => error!(txn = ctx.id, error = %e, "failed to abort idle transaction"),
                }
            }
            idle.push(IdleTransaction {
                id: ctx.id,
                isolation: ctx.isolation,
                idle: idle_for,
                aborted,
            });
        }

        idle.sort_by_key(|t| t.id);
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::ReadPredicate;
    use std::thread;

    fn manager() -> TransactionManager {
        TransactionManager::new(CommitLog::in_memory(), Duration::from_millis(500))
    }

    fn no_tables(_: &str) -> Option<Arc<Table>> {
        None
    }

    fn run<F, R>(tm: &TransactionManager, txn: Transaction, f: F) -> R
    where
        F: FnOnce(&mut TransactionContext) -> R,
    {
        let entry = tm.entry(txn.id).unwrap();
        let mut ctx = entry.lock();
        f(&mut ctx)
    }

    #[test]
    fn test_lifecycle() {
        let tm = manager();
        let txn = tm.begin(IsolationLevel::ReadCommitted);
        assert!(tm.is_active(txn.id));
        assert_eq!(tm.status(txn.id), TxnStatus::Active);

        run(&tm, txn, |ctx| tm.commit(ctx, &no_tables)).unwrap();
        assert_eq!(tm.status(txn.id), TxnStatus::Committed);
        assert!(matches!(tm.entry(txn.id), Err(Error::TransactionNotActive(_))));
        assert!(matches!(tm.entry(999), Err(Error::TransactionNotFound(999))));
    }

    #[test]
    fn test_read_committed_refreshes_snapshot() {
        let tm = manager();
        let reader = tm.begin(IsolationLevel::ReadCommitted);
        let repeatable = tm.begin(IsolationLevel::RepeatableRead);
        run(&tm, reader, |ctx| tm.begin_statement(ctx));
        run(&tm, repeatable, |ctx| tm.begin_statement(ctx));

        let writer = tm.begin(IsolationLevel::ReadCommitted);
        run(&tm, writer, |ctx| tm.commit(ctx, &no_tables)).unwrap();
        let row = TupleHeader::new(writer.id);

        run(&tm, reader, |ctx| {
            assert!(!tm.read_view(ctx).is_visible(&row));
            tm.begin_statement(ctx);
            assert!(tm.read_view(ctx).is_visible(&row));
        });
        run(&tm, repeatable, |ctx| {
            tm.begin_statement(ctx);
            // the first snapshot stays in force for the whole transaction
            assert!(!tm.read_view(ctx).is_visible(&row));
        });
    }

    #[test]
    fn test_blocked_write_under_repeatable_read() {
        let tm = manager();
        let holder = tm.begin(IsolationLevel::ReadCommitted);
        let writer = tm.begin(IsolationLevel::RepeatableRead);
        run(&tm, writer, |ctx| {
            tm.begin_statement(ctx);
            let err = tm.resolve_blocked(ctx, "t", holder.id).unwrap_err();
            assert!(matches!(err, Error::SerializationFailure { .. }));
        });
    }

    #[test]
    fn test_waiter_sees_commit_as_conflict() {
        let tm = Arc::new(manager());
        let holder = tm.begin(IsolationLevel::ReadCommitted);
        let waiter = tm.begin(IsolationLevel::ReadCommitted);

        let tm2 = tm.clone();
        let handle = thread::spawn(move || {
            run(&tm2, waiter, |ctx| {
                tm2.begin_statement(ctx);
                tm2.resolve_blocked(ctx, "t", holder.id)
            })
        });
        thread::sleep(Duration::from_millis(50));
        run(&tm, holder, |ctx| tm.commit(ctx, &no_tables)).unwrap();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::WriteConflict { .. })));
    }

    #[test]
    fn test_waiter_retries_after_abort() {
        let tm = Arc::new(manager());
        let holder = tm.begin(IsolationLevel::ReadCommitted);
        let waiter = tm.begin(IsolationLevel::ReadCommitted);

        let tm2 = tm.clone();
        let handle = thread::spawn(move || {
            run(&tm2, waiter, |ctx| tm2.resolve_blocked(ctx, "t", holder.id))
        });
        thread::sleep(Duration::from_millis(50));
        run(&tm, holder, |ctx| tm.abort(ctx, &no_tables)).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), BlockedWrite::Retry);
    }

    #[test]
    fn test_lock_timeout() {
        let tm = TransactionManager::new(CommitLog::in_memory(), Duration::from_millis(30));
        let holder = tm.begin(IsolationLevel::ReadCommitted);
        let waiter = tm.begin(IsolationLevel::ReadCommitted);
        let err = run(&tm, waiter, |ctx| tm.resolve_blocked(ctx, "t", holder.id)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
    }

    #[test]
    fn test_cycle_detection() {
        let waits = HashMap::from([(1, 2), (2, 3), (3, 1)]);
        assert!(TransactionManager::has_cycle(&waits, 1));
        let waits = HashMap::from([(1, 2), (2, 3)]);
        assert!(!TransactionManager::has_cycle(&waits, 1));
    }

    #[test]
    fn test_serializable_phantom_rejected() {
        let tm = manager();
        let reader = tm.begin(IsolationLevel::Serializable);
        run(&tm, reader, |ctx| {
            tm.begin_statement(ctx);
            ctx.record_predicate(ReadPredicate {
                table: "devices".into(),
                matcher: Some(Arc::new(|row: &[Value]| row[0] == Value::from("kitchen"))),
            });
        });

        let writer = tm.begin(IsolationLevel::ReadCommitted);
        let table = Arc::new(Table::new(1, "devices", None));
        let lookup_table = table.clone();
        let lookup = move |name: &str| (name == "devices").then(|| lookup_table.clone());
        run(&tm, writer, |ctx| {
            let version = table.insert(vec![Value::from("kitchen")], ctx.id).unwrap();
            ctx.record_insert("devices", &version, vec![Value::from("kitchen")]);
            tm.commit(ctx, &lookup)
        })
        .unwrap();

        let err = run(&tm, reader, |ctx| tm.commit(ctx, &no_tables)).unwrap_err();
        assert!(matches!(err, Error::SerializationFailure { .. }));
        assert_eq!(tm.status(reader.id), TxnStatus::Aborted);
    }

    #[test]
    fn test_vacuum_horizon_tracks_snapshots() {
        let tm = manager();
        let old = tm.begin(IsolationLevel::RepeatableRead);
        run(&tm, old, |ctx| tm.begin_statement(ctx));
        let deleter = tm.begin(IsolationLevel::ReadCommitted);
        run(&tm, deleter, |ctx| tm.commit(ctx, &no_tables)).unwrap();

        let header = TupleHeader {
            xmin: 0,
            xmax: deleter.id,
            flags: 0,
        };
        let horizon = tm.vacuum_horizon();
        assert_eq!(horizon, old.id);
        assert!(!tm.is_dead(&TupleHeader { xmin: old.id, ..header }, horizon));

        run(&tm, old, |ctx| tm.commit(ctx, &no_tables)).unwrap();
        let horizon = tm.vacuum_horizon();
        assert!(tm.is_dead(&TupleHeader { xmin: old.id, ..header }, horizon));
    }

    #[test]
    fn test_sweep_idle() {
        let tm = manager();
        let txn = tm.begin(IsolationLevel::ReadCommitted);

        assert!(tm.sweep_idle(Duration::from_secs(60), true, &no_tables).is_empty());
        let report = tm.sweep_idle(Duration::ZERO, false, &no_tables);
        assert_eq!(report.len(), 1);
        assert!(!report[0].aborted);
        assert!(tm.is_active(txn.id));

        let report = tm.sweep_idle(Duration::ZERO, true, &no_tables);
        assert!(report[0].aborted);
        assert_eq!(tm.status(txn.id), TxnStatus::Aborted);
    }
}
