//! Row lifecycle hooks
//!
//! Handlers are registered per (table, event) and run in registration
//! order. BEFORE handlers may rewrite the candidate row or abort the write;
//! AFTER handlers see the stored row and may queue further writes that run
//! in the same transaction once the handler chain finishes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::catalog::TableDef;
use crate::error::{Error, Result};
use crate::executor::Expr;
use crate::storage::Value;
use crate::transaction::Transaction;

/// When a handler fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerEvent {
    BeforeInsert,
    BeforeUpdate,
    AfterInsert,
    AfterUpdate,
    BeforeDelete,
}

impl TriggerEvent {
    /// BEFORE handlers can rewrite the row
    pub fn is_before(&self) -> bool {
        matches!(
            self,
            TriggerEvent::BeforeInsert | TriggerEvent::BeforeUpdate | TriggerEvent::BeforeDelete
        )
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerEvent::BeforeInsert => "BEFORE INSERT",
            TriggerEvent::BeforeUpdate => "BEFORE UPDATE",
            TriggerEvent::AfterInsert => "AFTER INSERT",
            TriggerEvent::AfterUpdate => "AFTER UPDATE",
            TriggerEvent::BeforeDelete => "BEFORE DELETE",
        };
        f.write_str(name)
    }
}

/// What a handler decided
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerAction {
    /// Continue with this row
    Proceed(Vec<Value>),
    /// Reject the write
    Abort(String),
}

/// A write queued by an AFTER handler
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedWrite {
    Insert {
        table: String,
        values: Vec<Value>,
    },
    Update {
        table: String,
        filter: Option<Expr>,
        assignments: Vec<(String, Expr)>,
    },
    Delete {
        table: String,
        filter: Option<Expr>,
    },
}

/// What a handler can see about the write that fired it
pub struct TriggerContext<'a> {
    pub table: &'a TableDef,
    pub event: TriggerEvent,
    pub txn: Transaction,
    /// Previous row for updates and deletes
    pub old: Option<&'a [Value]>,
    /// Nesting of trigger-queued writes that led here
    pub depth: usize,
    queued: Vec<QueuedWrite>,
}

impl<'a> TriggerContext<'a> {
    pub fn new(
        table: &'a TableDef,
        event: TriggerEvent,
        txn: Transaction,
        old: Option<&'a [Value]>,
        depth: usize,
    ) -> Self {
        Self {
            table,
            event,
            txn,
            old,
            depth,
            queued: Vec::new(),
        }
    }

    /// Position of a column in the firing table
    pub fn column(&self, name: &str) -> Result<usize> {
        self.table.column_index(name)
    }

    pub fn enqueue_insert(&mut self, table: impl Into<String>, values: Vec<Value>) {
        self.queued.push(QueuedWrite::Insert {
            table: table.into(),
            values,
        });
    }

    pub fn enqueue_update(
        &mut self,
        table: impl Into<String>,
        filter: Option<Expr>,
        assignments: Vec<(String, Expr)>,
    ) {
        self.queued.push(QueuedWrite::Update {
            table: table.into(),
            filter,
            assignments,
        });
    }

    pub fn enqueue_delete(&mut self, table: impl Into<String>, filter: Option<Expr>) {
        self.queued.push(QueuedWrite::Delete {
            table: table.into(),
            filter,
        });
    }

    pub fn take_queued(&mut self) -> Vec<QueuedWrite> {
        std::mem::take(&mut self.queued)
    }
}

/// A row lifecycle handler
pub trait Trigger: Send + Sync {
    fn fire(&self, ctx: &mut TriggerContext<'_>, row: Vec<Value>) -> Result<TriggerAction>;
}

impl<F> Trigger for F
where
    F: Fn(&mut TriggerContext<'_>, Vec<Value>) -> Result<TriggerAction> + Send + Sync,
{
    fn fire(&self, ctx: &mut TriggerContext<'_>, row: Vec<Value>) -> Result<TriggerAction> {
        self(ctx, row)
    }
}

/// Sets a column to the current time
#[derive(Debug, Clone)]
pub struct StampTimestamp {
    column: String,
}

impl StampTimestamp {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

impl Trigger for StampTimestamp {
    fn fire(&self, ctx: &mut TriggerContext<'_>, mut row: Vec<Value>) -> Result<TriggerAction> {
        let idx = ctx.column(&self.column)?;
        if let Some(slot) = row.get_mut(idx) {
            *slot = Value::now();
        }
        Ok(TriggerAction::Proceed(row))
    }
}

type Handlers = Vec<(String, Arc<dyn Trigger>)>;

/// Registered handlers keyed by (table, event)
#[derive(Default)]
pub struct TriggerRegistry {
    handlers: RwLock<HashMap<(String, TriggerEvent), Handlers>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; names are unique per (table, event)
    pub fn register(
        &self,
        table: &str,
        event: TriggerEvent,
        name: &str,
        handler: Arc<dyn Trigger>,
    ) -> Result<()> {
        let mut handlers = self.handlers.write();
        let list = handlers.entry((table.to_string(), event)).or_default();
        if list.iter().any(|(existing, _)| existing == name) {
            return Err(Error::InvalidSchema(format!(
                "trigger '{}' already registered for {} on '{}'",
                name, event, table
            )));
        }
        list.push((name.to_string(), handler));
        Ok(())
    }

    /// Handlers for one event, in registration order
    pub fn handlers(&self, table: &str, event: TriggerEvent) -> Handlers {
        self.handlers
            .read()
            .get(&(table.to_string(), event))
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, table: &str) -> usize {
        self.handlers
            .read()
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, list)| list.len())
            .sum()
    }

    /// Run the handler chain. BEFORE events return the rewritten row; the
    /// row handed back for AFTER events is informational.
    pub fn run(&self, ctx: &mut TriggerContext<'_>, row: Vec<Value>) -> Result<Vec<Value>> {
        let mut row = row;
        for (name, handler) in self.handlers(&ctx.table.name, ctx.event) {
            row = match handler.fire(ctx, row)? {
                TriggerAction::Proceed(next) => next,
                TriggerAction::Abort(reason) => {
                    return Err(Error::TriggerAborted {
                        table: ctx.table.name.clone(),
                        trigger: name,
                        reason,
                    });
                }
            };
        }
        Ok(row)
    }
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_map()
            .entries(handlers.iter().map(|((table, event), list)| {
                let names: Vec<&str> = list.iter().map(|(n, _)| n.as_str()).collect();
                (format!("{} {}", table, event), names)
            }))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataType, TableBuilder};
    use crate::transaction::IsolationLevel;

    fn readings() -> TableDef {
        TableBuilder::new("readings")
            .primary_key("id")
            .column("value", DataType::Integer)
            .column("taken_at", DataType::Timestamp)
            .build()
    }

    fn txn() -> Transaction {
        Transaction {
            id: 7,
            isolation: IsolationLevel::ReadCommitted,
        }
    }

    #[test]
    fn test_handlers_run_in_order() {
        let registry = TriggerRegistry::new();
        let double = |_: &mut TriggerContext<'_>, mut row: Vec<Value>| {
            if let Value::Integer(v) = row[1] {
                row[1] = Value::Integer(v * 2);
            }
            Ok(TriggerAction::Proceed(row))
        };
        let add_one = |_: &mut TriggerContext<'_>, mut row: Vec<Value>| {
            if let Value::Integer(v) = row[1] {
                row[1] = Value::Integer(v + 1);
            }
            Ok(TriggerAction::Proceed(row))
        };
        registry
            .register("readings", TriggerEvent::BeforeInsert, "double", Arc::new(double))
            .unwrap();
        registry
            .register("readings", TriggerEvent::BeforeInsert, "add_one", Arc::new(add_one))
            .unwrap();

        let def = readings();
        let mut ctx = TriggerContext::new(&def, TriggerEvent::BeforeInsert, txn(), None, 0);
        let row = registry
            .run(&mut ctx, vec![Value::Integer(1), Value::Integer(5), Value::Null])
            .unwrap();
        assert_eq!(row[1], Value::Integer(11));
        assert_eq!(registry.count("readings"), 2);
    }

    #[test]
    fn test_abort_names_the_trigger() {
        let registry = TriggerRegistry::new();
        let reject = |_: &mut TriggerContext<'_>, _row: Vec<Value>| {
            Ok(TriggerAction::Abort("negative reading".into()))
        };
        registry
            .register("readings", TriggerEvent::BeforeInsert, "no_negatives", Arc::new(reject))
            .unwrap();
        let def = readings();
        let mut ctx = TriggerContext::new(&def, TriggerEvent::BeforeInsert, txn(), None, 0);
        match registry.run(&mut ctx, vec![Value::Integer(1), Value::Integer(-1), Value::Null]) {
            Err(Error::TriggerAborted { trigger, reason, .. }) => {
                assert_eq!(trigger, "no_negatives");
                assert_eq!(reason, "negative reading");
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = TriggerRegistry::new();
        let stamp = Arc::new(StampTimestamp::new("taken_at"));
        registry
            .register("readings", TriggerEvent::BeforeUpdate, "stamp", stamp.clone())
            .unwrap();
        assert!(registry
            .register("readings", TriggerEvent::BeforeUpdate, "stamp", stamp.clone())
            .is_err());
        registry
            .register("readings", TriggerEvent::BeforeInsert, "stamp", stamp)
            .unwrap();
    }

    #[test]
    fn test_stamp_timestamp() {
        let def = readings();
        let mut ctx = TriggerContext::new(&def, TriggerEvent::BeforeInsert, txn(), None, 0);
        let action = StampTimestamp::new("taken_at")
            .fire(&mut ctx, vec![Value::Integer(1), Value::Integer(3), Value::Null])
            .unwrap();
        match action {
            TriggerAction::Proceed(row) => assert!(matches!(row[2], Value::Timestamp(_))),
            other => panic!("unexpected {:?}", other),
        }
        assert!(StampTimestamp::new("missing")
            .fire(&mut ctx, vec![Value::Null, Value::Null, Value::Null])
            .is_err());
    }

    #[test]
    fn test_after_handler_queues_writes() {
        let registry = TriggerRegistry::new();
        let audit = |ctx: &mut TriggerContext<'_>, row: Vec<Value>| {
            ctx.enqueue_insert("audit", vec![row[0].clone()]);
            Ok(TriggerAction::Proceed(row))
        };
        registry
            .register("readings", TriggerEvent::AfterInsert, "audit", Arc::new(audit))
            .unwrap();
        let def = readings();
        let mut ctx = TriggerContext::new(&def, TriggerEvent::AfterInsert, txn(), None, 0);
        registry
            .run(&mut ctx, vec![Value::Integer(4), Value::Integer(1), Value::Null])
            .unwrap();
        assert_eq!(
            ctx.take_queued(),
            vec![QueuedWrite::Insert {
                table: "audit".into(),
                values: vec![Value::Integer(4)]
            }]
        );
        assert!(ctx.take_queued().is_empty());
    }
}
