//! Schema definitions for SnapDB
//!
//! This module defines table schemas, column metadata, constraints and
//! the statistics the planner reads.

use super::types::DataType;
use crate::error::{Error, Result};
use crate::executor::Expr;
use crate::storage::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Value filled in when an insert omits a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnDefault {
    /// A constant
    Value(Value),
    /// The wall-clock time of the insert
    CurrentTimestamp,
}

impl ColumnDefault {
    /// Produce the default value for one row
    pub fn evaluate(&self) -> Value {
        match self {
            ColumnDefault::Value(v) => v.clone(),
            ColumnDefault::CurrentTimestamp => Value::now(),
        }
    }
}

/// Column definition in a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Data type
    pub data_type: DataType,
    /// Column position (0-indexed)
    pub position: usize,
    /// Is this column nullable?
    pub nullable: bool,
    /// Default applied when the column is omitted
    pub default: Option<ColumnDefault>,
}

impl Column {
    /// Create a new column with minimal required fields
    pub fn new(name: impl Into<String>, data_type: DataType, position: usize) -> Self {
        Self {
            name: name.into(),
            data_type,
            position,
            nullable: true,
            default: None,
        }
    }

    /// Set nullable flag
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set default value
    pub fn default(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }
}

/// What happens to referencing rows when a referenced row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FkAction {
    Restrict,
    Cascade,
}

impl fmt::Display for FkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FkAction::Restrict => write!(f, "RESTRICT"),
            FkAction::Cascade => write!(f, "CASCADE"),
        }
    }
}

/// A foreign key from this table's columns to another table's key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    pub on_delete: FkAction,
}

/// Table-level constraint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constraint {
    PrimaryKey(Vec<String>),
    Unique(Vec<String>),
    NotNull(String),
    Check { name: String, expr: Expr },
    ForeignKey(ForeignKey),
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::PrimaryKey(cols) => write!(f, "PRIMARY KEY ({})", cols.join(", ")),
            Constraint::Unique(cols) => write!(f, "UNIQUE ({})", cols.join(", ")),
            Constraint::NotNull(col) => write!(f, "NOT NULL ({})", col),
            Constraint::Check { name, expr } => write!(f, "CHECK {} ({})", name, expr),
            Constraint::ForeignKey(fk) => write!(
                f,
                "FOREIGN KEY {} ({}) REFERENCES {} ({}) ON DELETE {}",
                fk.name,
                fk.columns.join(", "),
                fk.ref_table,
                fk.ref_columns.join(", "),
                fk.on_delete
            ),
        }
    }
}

/// Table schema - defines the structure of a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Ordered list of columns
    columns: Vec<Column>,
    /// Column name to index mapping
    name_to_index: HashMap<String, usize>,
}

impl Schema {
    /// Create a new empty schema
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            name_to_index: HashMap::new(),
        }
    }

    /// Create a schema from a list of columns
    pub fn from_columns(columns: Vec<Column>) -> Self {
        let mut schema = Self::new();
        for col in columns {
            schema.add_column(col);
        }
        schema
    }

    /// Add a column to the schema
    pub fn add_column(&mut self, mut column: Column) {
        column.position = self.columns.len();
        self.name_to_index
            .insert(column.name.clone(), column.position);
        self.columns.push(column);
    }

    /// Get column by name
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.name_to_index.get(name).map(|&idx| &self.columns[idx])
    }

    /// Get column by index
    pub fn get_column_by_index(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Get column index by name
    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        let idx = *self.name_to_index.get(name)?;
        self.columns.get_mut(idx)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-column statistics gathered by `analyze`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnStats {
    pub distinct: usize,
    pub nulls: usize,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

/// Table statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableStatistics {
    /// Row count for the table
    pub row_count: usize,
    /// One entry per schema column
    pub columns: Vec<ColumnStats>,
    /// Table modification counter when these were gathered
    pub modifications: u64,
}

impl TableStatistics {
    /// Gather statistics over a set of rows
    pub fn gather<'a>(
        width: usize,
        rows: impl IntoIterator<Item = &'a [Value]>,
        modifications: u64,
    ) -> Self {
        let mut seen: Vec<std::collections::HashSet<&Value>> = vec![Default::default(); width];
        let mut columns = vec![ColumnStats::default(); width];
        let mut row_count = 0;
        for row in rows {
            row_count += 1;
            for (i, value) in row.iter().enumerate().take(width) {
                let stats = &mut columns[i];
                if value.is_null() {
                    stats.nulls += 1;
                    continue;
                }
                seen[i].insert(value);
                let lower = stats.min.as_ref().map_or(true, |m| {
                    value.compare(m) == Some(std::cmp::Ordering::Less)
                });
                if lower {
                    stats.min = Some(value.clone());
                }
                let higher = stats.max.as_ref().map_or(true, |m| {
                    value.compare(m) == Some(std::cmp::Ordering::Greater)
                });
                if higher {
                    stats.max = Some(value.clone());
                }
            }
        }
        for (stats, values) in columns.iter_mut().zip(&seen) {
            stats.distinct = values.len();
        }
        Self {
            row_count,
            columns,
            modifications,
        }
    }

    /// Fraction of rows whose column is NULL
    pub fn null_fraction(&self, column: usize) -> Option<f64> {
        if self.row_count == 0 {
            return None;
        }
        self.columns
            .get(column)
            .map(|c| c.nulls as f64 / self.row_count as f64)
    }

    pub fn distinct(&self, column: usize) -> Option<usize> {
        self.columns.get(column).map(|c| c.distinct).filter(|d| *d > 0)
    }

    /// More than a tenth of the table changed since analysis
    pub fn is_stale(&self, modifications: u64) -> bool {
        let changed = modifications.saturating_sub(self.modifications);
        changed as f64 > (self.row_count.max(10) as f64) * 0.1
    }
}

/// Table definition - full table metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name
    pub name: String,
    /// Table schema
    pub schema: Schema,
    /// Table ID (for internal use)
    pub id: u32,
    /// Declared constraints
    pub constraints: Vec<Constraint>,
    /// Table statistics
    pub stats: Option<TableStatistics>,
}

impl TableDef {
    /// Create a new table definition
    pub fn new(name: impl Into<String>, schema: Schema, id: u32) -> Self {
        Self {
            name: name.into(),
            schema,
            id,
            constraints: Vec::new(),
            stats: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.schema.get_column(name)
    }

    /// Resolve a column name to its position
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.schema
            .get_column_index(name)
            .ok_or_else(|| Error::ColumnNotFound(name.to_string(), self.name.clone()))
    }

    /// Resolve a list of column names to positions
    pub fn column_indices(&self, names: &[String]) -> Result<Vec<usize>> {
        names.iter().map(|n| self.column_index(n)).collect()
    }

    pub fn primary_key(&self) -> Option<&[String]> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::PrimaryKey(cols) => Some(cols.as_slice()),
            _ => None,
        })
    }

    /// Column sets that must be unique (primary key first)
    pub fn unique_keys(&self) -> Vec<&[String]> {
        let mut keys: Vec<&[String]> = self.primary_key().into_iter().collect();
        keys.extend(self.constraints.iter().filter_map(|c| match c {
            Constraint::Unique(cols) => Some(cols.as_slice()),
            _ => None,
        }));
        keys
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = &ForeignKey> {
        self.constraints.iter().filter_map(|c| match c {
            Constraint::ForeignKey(fk) => Some(fk),
            _ => None,
        })
    }

    pub fn checks(&self) -> impl Iterator<Item = (&str, &Expr)> {
        self.constraints.iter().filter_map(|c| match c {
            Constraint::Check { name, expr } => Some((name.as_str(), expr)),
            _ => None,
        })
    }

    /// Fold NOT NULL and PRIMARY KEY constraints into column flags and
    /// check that every constraint names real columns.
    pub(crate) fn normalize(&mut self) -> Result<()> {
        let mut forced = Vec::new();
        let mut primary_keys = 0;
        for constraint in &self.constraints {
            let cols: Vec<&String> = match constraint {
                Constraint::PrimaryKey(cols) => {
                    primary_keys += 1;
                    forced.extend(cols.iter().cloned());
                    cols.iter().collect()
                }
                Constraint::Unique(cols) => cols.iter().collect(),
                Constraint::NotNull(col) => {
                    forced.push(col.clone());
                    vec![col]
                }
                Constraint::ForeignKey(fk) => {
                    if fk.columns.len() != fk.ref_columns.len() || fk.columns.is_empty() {
                        return Err(Error::InvalidSchema(format!(
                            "foreign key '{}' column count does not match its reference",
                            fk.name
                        )));
                    }
                    fk.columns.iter().collect()
                }
                Constraint::Check { .. } => Vec::new(),
            };
            for col in cols {
                if !self.schema.has_column(col) {
                    return Err(Error::ColumnNotFound(col.clone(), self.name.clone()));
                }
            }
        }
        if primary_keys > 1 {
            return Err(Error::InvalidSchema(format!(
                "table '{}' declares more than one primary key",
                self.name
            )));
        }
        for name in forced {
            if let Some(col) = self.schema.column_mut(&name) {
                col.nullable = false;
            }
        }
        Ok(())
    }
}

/// Index definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name
    pub name: String,
    /// Table this index belongs to
    pub table_name: String,
    /// Columns included in the index
    pub columns: Vec<String>,
    /// Is this a unique index?
    pub unique: bool,
    /// Is this the primary key index?
    pub primary: bool,
    /// Index ID
    pub id: u32,
}

impl IndexDef {
    /// Create a new index definition
    pub fn new(
        name: impl Into<String>,
        table_name: impl Into<String>,
        columns: Vec<String>,
        id: u32,
    ) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            columns,
            unique: false,
            primary: false,
            id,
        }
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        self
    }

    /// Whether the index's leading columns are exactly `columns` in order
    pub fn covers_prefix(&self, columns: &[String]) -> bool {
        columns.len() <= self.columns.len() && self.columns[..columns.len()] == *columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_def() -> TableDef {
        let mut schema = Schema::new();
        schema.add_column(Column::new("id", DataType::Integer, 0));
        schema.add_column(Column::new("customer", DataType::Integer, 1));
        schema.add_column(Column::new("quantity", DataType::Integer, 2));
        TableDef::new("orders", schema, 1)
    }

    #[test]
    fn test_schema_creation() {
        let mut schema = Schema::new();
        schema.add_column(Column::new("id", DataType::Integer, 0).nullable(false));
        schema.add_column(
            Column::new("created", DataType::Timestamp, 1).default(ColumnDefault::CurrentTimestamp),
        );

        assert_eq!(schema.column_count(), 2);
        assert!(schema.has_column("id"));
        assert!(!schema.has_column("unknown"));
        assert!(!schema.get_column("id").unwrap().nullable);
        assert_eq!(schema.get_column_index("created"), Some(1));
    }

    #[test]
    fn test_normalize_forces_pk_not_null() {
        let mut def = orders_def();
        def.constraints.push(Constraint::PrimaryKey(vec!["id".into()]));
        def.constraints.push(Constraint::NotNull("customer".into()));
        def.normalize().unwrap();

        assert!(!def.get_column("id").unwrap().nullable);
        assert!(!def.get_column("customer").unwrap().nullable);
        assert!(def.get_column("quantity").unwrap().nullable);
        assert_eq!(def.primary_key(), Some(&["id".to_string()][..]));
    }

    #[test]
    fn test_normalize_rejects_unknown_column() {
        let mut def = orders_def();
        def.constraints.push(Constraint::Unique(vec!["missing".into()]));
        assert!(matches!(def.normalize(), Err(Error::ColumnNotFound(_, _))));
    }

    #[test]
    fn test_stats_staleness() {
        let stats = TableStatistics {
            row_count: 1000,
            columns: Vec::new(),
            modifications: 500,
        };
        assert!(!stats.is_stale(550));
        assert!(stats.is_stale(601));
    }

    #[test]
    fn test_gather_statistics() {
        let rows = vec![
            vec![Value::Integer(1), Value::Text("a".into())],
            vec![Value::Integer(2), Value::Null],
            vec![Value::Integer(3), Value::Text("a".into())],
            vec![Value::Integer(4), Value::Null],
        ];
        let stats = TableStatistics::gather(2, rows.iter().map(|r| r.as_slice()), 7);
        assert_eq!(stats.row_count, 4);
        assert_eq!(stats.distinct(0), Some(4));
        assert_eq!(stats.distinct(1), Some(1));
        assert_eq!(stats.null_fraction(1), Some(0.5));
        assert_eq!(stats.columns[0].max, Some(Value::Integer(4)));
        assert_eq!(stats.modifications, 7);
    }
}
