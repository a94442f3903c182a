//! SnapDB - A single-node relational engine written in Rust
//!
//! This library provides the core components of a transactional store:
//! - Storage engine (slotted pages, multi-version heap files, B+ tree indexes)
//! - Constraint enforcement and row lifecycle triggers
//! - Query planning (cost-based access paths, subplans) and execution
//! - Transactions with four isolation levels, commit log and vacuum
//! - System catalog
//!
//! Queries arrive as expression trees; there is no SQL text layer.

pub mod catalog;
pub mod config;
pub mod constraint;
pub mod database;
pub mod error;
pub mod executor;
mod session;
pub mod storage;
pub mod transaction;

pub use catalog::{ColumnDefault, DataType, FkAction, TableBuilder};
pub use config::{EngineConfig, ForeignKeyCheck};
pub use constraint::{StampTimestamp, Trigger, TriggerAction, TriggerContext, TriggerEvent};
pub use database::{Database, IdleMonitor, TableReport, VacuumStats};
pub use error::{ConstraintKind, Error, Result};
pub use executor::{AggregateFunc, Explain, Expr, JoinMethod, Query, QueryResult};
pub use storage::{Decimal, TupleLocation, Value};
pub use transaction::{IsolationLevel, Transaction};
