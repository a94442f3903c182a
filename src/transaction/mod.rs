//! Transaction module
//!
//! Transaction ids, snapshots and visibility, per-transaction state with
//! undo logging, write-intent waiting with deadlock detection, and
//! serializable commit validation.

pub mod manager;
pub mod snapshot;
pub mod transaction;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use manager::{
    BlockedWrite, IdleTransaction, LatestCommitted, TableLookup, TransactionManager,
};
pub use snapshot::{ReadView, Snapshot};
pub use transaction::{
    PendingForeignKey, ReadPredicate, StatementMark, Transaction, TransactionContext, UndoRecord,
};

/// Isolation level of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// One snapshot for the whole transaction
    pub fn uses_transaction_snapshot(&self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead | IsolationLevel::Serializable)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        f.write_str(name)
    }
}

/// Transaction State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
}
