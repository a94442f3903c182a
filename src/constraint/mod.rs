//! Constraint enforcement
//!
//! Row-local rules (arity, types, defaults, NOT NULL, CHECK) are decided
//! here directly. Key rules (PRIMARY KEY, UNIQUE, FOREIGN KEY) need the
//! latest state of other rows, which callers expose through [`KeyLookup`].

pub mod trigger;

use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::{Catalog, ForeignKey, IndexDef, TableDef};
use crate::error::{ConstraintKind, Error, Result};
use crate::executor::{bind_row_expr, evaluate_condition, BoundExpr};
use crate::storage::{TupleLocation, Value};
use crate::transaction::PendingForeignKey;

pub use trigger::{
    QueuedWrite, StampTimestamp, Trigger, TriggerAction, TriggerContext, TriggerEvent,
    TriggerRegistry,
};

/// Answers key existence questions against the latest state of a table
pub trait KeyLookup {
    /// Whether a row of `table` whose `columns` equal `key` exists, ignoring
    /// the version at `exclude`
    fn key_exists(
        &mut self,
        table: &TableDef,
        columns: &[String],
        key: &[Value],
        exclude: Option<TupleLocation>,
    ) -> Result<bool>;
}

/// A CHECK constraint bound against its table
#[derive(Debug)]
struct BoundCheck {
    name: String,
    expr: BoundExpr,
}

/// Enforces declared constraints on candidate rows
#[derive(Debug, Default)]
pub struct ConstraintEnforcer {
    checks: RwLock<HashMap<String, Arc<Vec<BoundCheck>>>>,
}

impl ConstraintEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a full row from named values, filling omitted columns with
    /// their default or NULL
    pub fn complete_row(&self, def: &TableDef, columns: &[(&str, Value)]) -> Result<Vec<Value>> {
        let mut row: Vec<Option<Value>> = vec![None; def.schema.column_count()];
        for (name, value) in columns {
            let idx = def.column_index(name)?;
            if row[idx].is_some() {
                return Err(Error::ExecutionError(format!(
                    "column '{}' specified more than once",
                    name
                )));
            }
            row[idx] = Some(value.clone());
        }
        Ok(row
            .into_iter()
            .zip(def.schema.columns())
            .map(|(value, column)| {
                value.unwrap_or_else(|| {
                    column
                        .default
                        .as_ref()
                        .map_or(Value::Null, |d| d.evaluate())
                })
            })
            .collect())
    }

    /// Check arity and coerce each value to its column type
    pub fn coerce_row(&self, def: &TableDef, values: Vec<Value>) -> Result<Vec<Value>> {
        let columns = def.schema.columns();
        if values.len() != columns.len() {
            return Err(Error::ColumnCountMismatch {
                expected: columns.len(),
                found: values.len(),
            });
        }
        values
            .into_iter()
            .zip(columns)
            .map(|(value, column)| value.coerce_to(column.data_type, &column.name))
            .collect()
    }

    /// NOT NULL, then CHECK. A CHECK that evaluates to UNKNOWN passes.
    pub fn check_row(&self, def: &TableDef, row: &[Value]) -> Result<()> {
        for (column, value) in def.schema.columns().iter().zip(row) {
            if !column.nullable && value.is_null() {
                return Err(Error::constraint(
                    ConstraintKind::NotNull,
                    &def.name,
                    format!("column '{}' cannot be null", column.name),
                ));
            }
        }

        for check in self.bound_checks(def)?.iter() {
            if !evaluate_condition(&check.expr, row)?.passes_check() {
                return Err(Error::constraint(
                    ConstraintKind::Check,
                    &def.name,
                    format!("row violates check '{}'", check.name),
                ));
            }
        }
        Ok(())
    }

    fn bound_checks(&self, def: &TableDef) -> Result<Arc<Vec<BoundCheck>>> {
        if let Some(checks) = self.checks.read().get(&def.name) {
            return Ok(checks.clone());
        }
        let bound = def
            .checks()
            .map(|(name, expr)| {
                Ok(BoundCheck {
                    name: name.to_string(),
                    expr: bind_row_expr(def, expr)?.0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let bound = Arc::new(bound);
        self.checks.write().insert(def.name.clone(), bound.clone());
        Ok(bound)
    }

    /// Reject the row if any unique index already holds its key. Keys with
    /// a NULL component never conflict.
    pub fn check_unique(
        &self,
        def: &TableDef,
        indexes: &[Arc<IndexDef>],
        row: &[Value],
        exclude: Option<TupleLocation>,
        lookup: &mut dyn KeyLookup,
    ) -> Result<()> {
        for index in indexes.iter().filter(|i| i.unique) {
            let key = project(row, &def.column_indices(&index.columns)?);
            if key.iter().any(Value::is_null) {
                continue;
            }
            if lookup.key_exists(def, &index.columns, &key, exclude)? {
                let kind = if index.primary {
                    ConstraintKind::PrimaryKey
                } else {
                    ConstraintKind::Unique
                };
                return Err(Error::constraint(
                    kind,
                    &def.name,
                    format!(
                        "duplicate key ({}) = ({}) violates '{}'",
                        index.columns.join(", "),
                        render(&key),
                        index.name
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Foreign keys of `row` that need an existence check. NULL keys are
    /// exempt, and so are keys an update left unchanged.
    pub fn foreign_key_checks(
        &self,
        def: &TableDef,
        row: &[Value],
        old: Option<&[Value]>,
    ) -> Result<Vec<PendingForeignKey>> {
        let mut pending = Vec::new();
        for fk in def.foreign_keys() {
            let positions = def.column_indices(&fk.columns)?;
            let key = project(row, &positions);
            if key.iter().any(Value::is_null) {
                continue;
            }
            if let Some(old) = old {
                if same_key(&project(old, &positions), &key) {
                    continue;
                }
            }
            pending.push(PendingForeignKey {
                table: def.name.clone(),
                constraint: fk.name.clone(),
                values: key,
            });
        }
        Ok(pending)
    }

    /// Confirm the referenced row of a pending check exists
    pub fn check_reference(
        &self,
        catalog: &Catalog,
        pending: &PendingForeignKey,
        lookup: &mut dyn KeyLookup,
    ) -> Result<()> {
        let def = catalog.get_table(&pending.table)?;
        let fk = def
            .foreign_keys()
            .find(|fk| fk.name == pending.constraint)
            .ok_or_else(|| {
                Error::Internal(format!(
                    "foreign key '{}' missing from '{}'",
                    pending.constraint, pending.table
                ))
            })?;
        let parent = catalog.get_table(&fk.ref_table)?;
        if lookup.key_exists(&parent, &fk.ref_columns, &pending.values, None)? {
            return Ok(());
        }
        Err(Error::constraint(
            ConstraintKind::ForeignKey,
            &def.name,
            format!(
                "'{}': key ({}) = ({}) is not present in '{}'",
                fk.name,
                fk.columns.join(", "),
                render(&pending.values),
                fk.ref_table
            ),
        ))
    }
}

/// The referenced key a row of the parent table carries for `fk`, or
/// `None` when a component is NULL
pub fn referenced_key(parent: &TableDef, fk: &ForeignKey, row: &[Value]) -> Result<Option<Vec<Value>>> {
    let key = project(row, &parent.column_indices(&fk.ref_columns)?);
    Ok((!key.iter().any(Value::is_null)).then_some(key))
}

/// Key comparison for constraint purposes; NULL never matches
pub fn same_key(left: &[Value], right: &[Value]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .all(|(l, r)| !l.is_null() && !r.is_null() && l.compare(r) == Some(Ordering::Equal))
}

/// Violation raised when a referenced row still has referencing rows
pub fn restrict_violation(child: &TableDef, fk: &ForeignKey, key: &[Value]) -> Error {
    Error::constraint(
        ConstraintKind::ForeignKey,
        &child.name,
        format!(
            "'{}': key ({}) = ({}) is still referenced from '{}'",
            fk.name,
            fk.ref_columns.join(", "),
            render(key),
            child.name
        ),
    )
}

pub(crate) fn project(row: &[Value], positions: &[usize]) -> Vec<Value> {
    positions
        .iter()
        .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
        .collect()
}

fn render(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
