//! Catalog module
//!
//! This module contains the system catalog, schema definitions, and data types.

pub mod catalog;
pub mod schema;
pub mod types;

pub use catalog::{Catalog, TableBuilder};
pub use schema::{
    Column, ColumnDefault, ColumnStats, Constraint, FkAction, ForeignKey, IndexDef, Schema,
    TableDef, TableStatistics,
};
pub use types::DataType;
