//! Error types for SnapDB
//!
//! This module defines all error types used throughout the database engine.

use std::fmt;

use thiserror::Error;

/// Which constraint a write violated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    NotNull,
    PrimaryKey,
    Unique,
    ForeignKey,
    Check,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::NotNull => "NOT NULL",
            ConstraintKind::PrimaryKey => "PRIMARY KEY",
            ConstraintKind::Unique => "UNIQUE",
            ConstraintKind::ForeignKey => "FOREIGN KEY",
            ConstraintKind::Check => "CHECK",
        };
        f.write_str(name)
    }
}

/// The main error type for SnapDB
#[derive(Error, Debug)]
pub enum Error {
    // ========== Catalog Errors ==========
    #[error("Catalog error: table '{0}' not found")]
    TableNotFound(String),

    #[error("Catalog error: table '{0}' already exists")]
    TableAlreadyExists(String),

    #[error("Catalog error: column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Catalog error: index '{0}' not found")]
    IndexNotFound(String),

    #[error("Catalog error: index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("Catalog error: invalid schema - {0}")]
    InvalidSchema(String),

    // ========== Type Errors ==========
    #[error("Type error: column '{column}' expects {expected}, got {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("Type error: expected {expected} values, got {found}")]
    ColumnCountMismatch { expected: usize, found: usize },

    #[error("Execution error: division by zero")]
    DivisionByZero,

    // ========== Statement Errors ==========
    #[error("Constraint violation: {kind} on table '{table}' - {detail}")]
    ConstraintViolation {
        kind: ConstraintKind,
        table: String,
        detail: String,
    },

    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("Trigger '{trigger}' on table '{table}' aborted the write: {reason}")]
    TriggerAborted {
        table: String,
        trigger: String,
        reason: String,
    },

    #[error("Execution error: {0}")]
    ExecutionError(String),

    // ========== Transaction Errors ==========
    #[error("Write conflict on table '{table}': {detail}")]
    WriteConflict { table: String, detail: String },

    #[error("Serialization failure in transaction {txn}: {detail}")]
    SerializationFailure { txn: u64, detail: String },

    #[error("Deadlock detected: transaction {0} was aborted")]
    DeadlockDetected(u64),

    #[error("Lock timeout: transaction {txn} gave up waiting for transaction {holder}")]
    LockTimeout { txn: u64, holder: u64 },

    #[error("Transaction error: transaction {0} not found")]
    TransactionNotFound(u64),

    #[error("Transaction error: transaction {0} is not active")]
    TransactionNotActive(u64),

    // ========== Storage Errors ==========
    #[error("Storage error: tuple of {0} bytes does not fit in a page")]
    TupleTooLarge(usize),

    #[error("Storage error: corrupted page {page} of table {table_id}: {detail}")]
    StorageCorruption {
        table_id: u32,
        page: u32,
        detail: String,
    },

    #[error("Storage error: {0}")]
    StorageError(String),

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn constraint(
        kind: ConstraintKind,
        table: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Error::ConstraintViolation {
            kind,
            table: table.into(),
            detail: detail.into(),
        }
    }

    /// The constraint kind, if this is a constraint violation
    pub fn constraint_kind(&self) -> Option<ConstraintKind> {
        match self {
            Error::ConstraintViolation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The failed statement may be retried on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WriteConflict { .. } | Error::LockTimeout { .. })
    }

    /// The transaction was aborted and must be retried from `begin`
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            Error::SerializationFailure { .. } | Error::DeadlockDetected(_)
        )
    }

    /// Unrecoverable engine error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StorageCorruption { .. })
    }
}

/// Result type alias for SnapDB operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TableNotFound("users".to_string());
        assert_eq!(err.to_string(), "Catalog error: table 'users' not found");

        let err = Error::constraint(ConstraintKind::Check, "orders", "quantity_positive");
        assert_eq!(
            err.to_string(),
            "Constraint violation: CHECK on table 'orders' - quantity_positive"
        );
        assert_eq!(err.constraint_kind(), Some(ConstraintKind::Check));
    }

    #[test]
    fn test_error_classes() {
        let conflict = Error::WriteConflict {
            table: "t".into(),
            detail: "row updated".into(),
        };
        assert!(conflict.is_retryable());
        assert!(!conflict.requires_restart());

        let failure = Error::SerializationFailure {
            txn: 7,
            detail: "read row changed".into(),
        };
        assert!(failure.requires_restart());
        assert!(Error::DeadlockDetected(3).requires_restart());

        let corrupt = Error::StorageCorruption {
            table_id: 1,
            page: 2,
            detail: "checksum".into(),
        };
        assert!(corrupt.is_fatal());
    }
}
