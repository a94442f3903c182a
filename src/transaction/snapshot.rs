//! Snapshots and visibility
//!
//! A snapshot freezes which transactions count as finished for a reader:
//! everything below `xmax` that was not active when it was taken. A
//! [`ReadView`] combines a snapshot (or none, for READ UNCOMMITTED) with
//! the live status table to decide tuple visibility.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::TxnStatus;
use crate::storage::{TupleHeader, TxnId, Visibility, INVALID_TXN};

/// Frozen view of which transactions had finished
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub owner: TxnId,
    /// First id not yet assigned when the snapshot was taken
    pub xmax: TxnId,
    /// Transactions running when the snapshot was taken, owner excluded
    pub active: HashSet<TxnId>,
}

impl Snapshot {
    /// Whether `txn` had finished (or is the owner) as of this snapshot
    pub fn sees(&self, txn: TxnId) -> bool {
        txn == self.owner || (txn < self.xmax && !self.active.contains(&txn))
    }

    /// Smallest id this snapshot may still consider in progress
    pub fn oldest_unseen(&self) -> TxnId {
        self.active.iter().copied().min().unwrap_or(self.xmax).min(self.owner)
    }
}

#[derive(Debug)]
struct StatusInner {
    states: HashMap<TxnId, TxnStatus>,
    active: BTreeSet<TxnId>,
    next_id: TxnId,
}

/// Authoritative status of every transaction id
#[derive(Debug)]
pub struct StatusTable {
    inner: RwLock<StatusInner>,
}

impl StatusTable {
    /// Ids below `next_id` that are not listed as committed count as aborted
    pub fn new(next_id: TxnId, committed: impl IntoIterator<Item = TxnId>) -> Self {
        let states = committed
            .into_iter()
            .map(|id| (id, TxnStatus::Committed))
            .collect();
        Self {
            inner: RwLock::new(StatusInner {
                states,
                active: BTreeSet::new(),
                next_id: next_id.max(1),
            }),
        }
    }

    /// Assign the next id and mark it active
    pub fn begin(&self) -> TxnId {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.states.insert(id, TxnStatus::Active);
        inner.active.insert(id);
        id
    }

    pub fn status(&self, txn: TxnId) -> TxnStatus {
        if txn == INVALID_TXN {
            return TxnStatus::Aborted;
        }
        let inner = self.inner.read();
        inner
            .states
            .get(&txn)
            .copied()
            .unwrap_or(TxnStatus::Aborted)
    }

    /// Flip a transaction to its final state. This is the commit point.
    pub fn finish(&self, txn: TxnId, status: TxnStatus) {
        let mut inner = self.inner.write();
        inner.active.remove(&txn);
        match status {
            TxnStatus::Aborted => {
                inner.states.remove(&txn);
            }
            _ => {
                inner.states.insert(txn, status);
            }
        }
    }

    /// Take a snapshot for `owner`
    pub fn snapshot(&self, owner: TxnId) -> Snapshot {
        let inner = self.inner.read();
        Snapshot {
            owner,
            xmax: inner.next_id,
            active: inner
                .active
                .iter()
                .copied()
                .filter(|id| *id != owner)
                .collect(),
        }
    }

    /// Smallest id still running, or the next id if none
    pub fn oldest_active(&self) -> TxnId {
        let inner = self.inner.read();
        inner.active.iter().next().copied().unwrap_or(inner.next_id)
    }

    pub fn active_ids(&self) -> Vec<TxnId> {
        self.inner.read().active.iter().copied().collect()
    }

    pub fn next_id(&self) -> TxnId {
        self.inner.read().next_id
    }
}

#[derive(Debug, Clone)]
enum ViewMode {
    /// Every version whose creator did not abort
    Uncommitted,
    Snapshot(Arc<Snapshot>),
}

/// Visibility rule for one reader
#[derive(Debug, Clone)]
pub struct ReadView<'a> {
    owner: TxnId,
    mode: ViewMode,
    status: &'a StatusTable,
}

impl<'a> ReadView<'a> {
    pub fn uncommitted(owner: TxnId, status: &'a StatusTable) -> Self {
        Self {
            owner,
            mode: ViewMode::Uncommitted,
            status,
        }
    }

    pub fn snapshot(snapshot: Arc<Snapshot>, status: &'a StatusTable) -> Self {
        Self {
            owner: snapshot.owner,
            mode: ViewMode::Snapshot(snapshot),
            status,
        }
    }

    pub fn owner(&self) -> TxnId {
        self.owner
    }

    /// Whether `txn`'s effects are part of this view
    pub fn sees_txn(&self, txn: TxnId) -> bool {
        if txn == self.owner {
            return true;
        }
        match &self.mode {
            ViewMode::Uncommitted => self.status.status(txn) != TxnStatus::Aborted,
            ViewMode::Snapshot(snapshot) => {
                snapshot.sees(txn) && self.status.status(txn) == TxnStatus::Committed
            }
        }
    }

}

impl Visibility for ReadView<'_> {
    /// Creator in the view and deleter (if any) outside it. Both ends are
    /// judged against the same view, so another transaction's inserts and
    /// deletes appear together or not at all.
    fn is_visible(&self, header: &TupleHeader) -> bool {
        self.sees_txn(header.xmin) && !(header.has_deleter() && self.sees_txn(header.xmax))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(xmin: TxnId, xmax: TxnId) -> TupleHeader {
        TupleHeader {
            xmin,
            xmax,
            flags: 0,
        }
    }

    #[test]
    fn test_snapshot_excludes_concurrent() {
        let status = StatusTable::new(1, []);
        let t1 = status.begin();
        let t2 = status.begin();
        let snap = Arc::new(status.snapshot(t2));
        status.finish(t1, TxnStatus::Committed);

        let view = ReadView::snapshot(snap.clone(), &status);
        assert!(!view.is_visible(&header(t1, 0)));
        assert!(view.is_visible(&header(t2, 0)));
        assert!(!view.is_visible(&header(t2, t2)));

        let fresh = Arc::new(status.snapshot(t2));
        let view = ReadView::snapshot(fresh, &status);
        assert!(view.is_visible(&header(t1, 0)));
    }

    #[test]
    fn test_uncommitted_view_sees_active() {
        let status = StatusTable::new(1, []);
        let writer = status.begin();
        let reader = status.begin();

        let view = ReadView::uncommitted(reader, &status);
        assert!(view.is_visible(&header(writer, 0)));

        status.finish(writer, TxnStatus::Aborted);
        assert!(!view.is_visible(&header(writer, 0)));
    }

    #[test]
    fn test_later_commit_is_all_or_nothing() {
        let status = StatusTable::new(1, []);
        let old_writer = status.begin();
        status.finish(old_writer, TxnStatus::Committed);
        let reader = status.begin();
        let snap = Arc::new(status.snapshot(reader));

        // a later transaction replaces an old row and adds a new one
        let writer = status.begin();
        let replaced = header(old_writer, writer);
        let replacement = header(writer, 0);
        let added = header(writer, 0);
        status.finish(writer, TxnStatus::Committed);

        let view = ReadView::snapshot(snap, &status);
        assert!(view.is_visible(&replaced));
        assert!(!view.is_visible(&replacement));
        assert!(!view.is_visible(&added));
    }

    #[test]
    fn test_recovered_ids_default_to_aborted() {
        let status = StatusTable::new(10, [4, 7]);
        assert_eq!(status.status(4), TxnStatus::Committed);
        assert_eq!(status.status(5), TxnStatus::Aborted);
        assert_eq!(status.begin(), 10);
        assert_eq!(status.oldest_active(), 10);
    }
}
