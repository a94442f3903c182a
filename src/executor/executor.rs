//! Query Executor for SnapDB
//!
//! This module runs plan trees against a [`DataSource`] and evaluates bound
//! expressions with three-valued logic. Subplans run per outer row when
//! correlated and once per statement otherwise.

use indexmap::IndexMap;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::Bound;
use std::rc::Rc;
use std::sync::Arc;

use super::expr::{
    apply_arithmetic, compare_values, like_match, AggregateFunc, BinaryOperator, TriBool,
    UnaryOperator,
};
use super::planner::{AggregateCall, BoundExpr, PlanNode, Predicate, QueryPlan, SortKey};
use super::query::QueryResult;
use crate::error::{Error, Result};
use crate::storage::{Decimal, IndexKey, TupleLocation, Value};

/// Conservative row filter remembered for SERIALIZABLE validation
pub type RowMatcher = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// A located row
pub type LocatedRow = (TupleLocation, Vec<Value>);

type Rows = Vec<Vec<Value>>;

/// Where the executor reads rows from
pub trait DataSource {
    /// Rows of `table` visible to the running statement
    fn scan(&mut self, table: &str) -> Result<Vec<LocatedRow>>;

    /// Visible rows whose `index` key falls within the bounds. Bounds
    /// compare only the key columns they carry.
    fn index_scan(
        &mut self,
        table: &str,
        index: &str,
        lower: Bound<IndexKey>,
        upper: Bound<IndexKey>,
    ) -> Result<Vec<LocatedRow>>;

    /// A row that satisfied a scan's filter
    fn record_read(&mut self, table: &str, loc: TupleLocation);

    /// A scan's filter; `None` matches every row of the table
    fn record_predicate(&mut self, table: &str, matcher: Option<RowMatcher>);
}

/// Runs query plans
pub struct Executor<'s> {
    source: &'s mut dyn DataSource,
    /// Scans whose predicate has been recorded in this statement
    recorded: HashSet<usize>,
}

impl<'s> Executor<'s> {
    pub fn new(source: &'s mut dyn DataSource) -> Self {
        Self {
            source,
            recorded: HashSet::new(),
        }
    }

    /// Run a plan to completion
    pub fn execute(&mut self, plan: &QueryPlan) -> Result<QueryResult> {
        let rows = self.run(plan, &[])?;
        Ok(QueryResult::new(plan.columns.clone(), rows))
    }

    /// Rows of the plan's table that pass its filter, with their locations
    pub fn matching_rows(&mut self, plan: &QueryPlan) -> Result<Vec<LocatedRow>> {
        let mut frame = Frame::new(self, plan, &[]);
        frame.scan(plan.scan())
    }

    fn run(&mut self, plan: &QueryPlan, params: &[Value]) -> Result<Rows> {
        let mut frame = Frame::new(self, plan, params);
        let mut rows = frame.node(&plan.root)?;
        let width = plan.width();
        for row in &mut rows {
            row.truncate(width);
        }
        Ok(rows)
    }
}

/// Evaluate an expression that needs nothing but the row
pub fn evaluate(expr: &BoundExpr, row: &[Value]) -> Result<Value> {
    eval(&mut RowOnly, expr, row)
}

/// Evaluate a condition that needs nothing but the row
pub fn evaluate_condition(expr: &BoundExpr, row: &[Value]) -> Result<TriBool> {
    TriBool::from_value(&evaluate(expr, row)?)
}

trait Env {
    fn param(&self, index: usize) -> Result<Value>;
    fn subquery(&mut self, id: usize, row: &[Value]) -> Result<Rc<Rows>>;
}

struct RowOnly;

impl Env for RowOnly {
    fn param(&self, index: usize) -> Result<Value> {
        Err(Error::Internal(format!(
            "parameter {} evaluated outside a subquery",
            index
        )))
    }

    fn subquery(&mut self, _id: usize, _row: &[Value]) -> Result<Rc<Rows>> {
        Err(Error::InvalidPredicate(
            "subqueries are not allowed here".to_string(),
        ))
    }
}

/// Execution state of one plan run
struct Frame<'e, 's, 'p> {
    exec: &'e mut Executor<'s>,
    plan: &'p QueryPlan,
    params: &'p [Value],
    /// Results of uncorrelated subplans
    cache: Vec<Option<Rc<Rows>>>,
}

impl<'e, 's, 'p> Frame<'e, 's, 'p> {
    fn new(exec: &'e mut Executor<'s>, plan: &'p QueryPlan, params: &'p [Value]) -> Self {
        Self {
            exec,
            plan,
            params,
            cache: vec![None; plan.subplans.len()],
        }
    }

    fn node(&mut self, node: &PlanNode) -> Result<Rows> {
        match node {
            PlanNode::SeqScan { .. } | PlanNode::IndexScan { .. } => {
                Ok(self.scan(node)?.into_iter().map(|(_, row)| row).collect())
            }
            PlanNode::Aggregate {
                input,
                group_by,
                aggregates,
                ..
            } => {
                let rows = self.node(input)?;
                self.aggregate(rows, group_by, aggregates)
            }
            PlanNode::NestedLoopJoin {
                left, right, on, ..
            } => {
                let outer = self.node(left)?;
                let inner: Rows = self.scan(right)?.into_iter().map(|(_, row)| row).collect();
                let mut joined = Vec::new();
                for l in &outer {
                    for r in &inner {
                        self.join_row(l, r, on, &mut joined)?;
                    }
                }
                Ok(joined)
            }
            PlanNode::IndexNestedLoop {
                left,
                table,
                index,
                keys,
                filter,
                on,
                ..
            } => {
                let filter: Vec<&Predicate> = filter.iter().collect();
                self.record_predicate(node, table, &filter);
                let outer = self.node(left)?;
                let mut joined = Vec::new();
                for l in &outer {
                    let key = keys
                        .iter()
                        .map(|e| eval(self, e, l))
                        .collect::<Result<Vec<_>>>()?;
                    // NULL never equals anything
                    if key.iter().any(Value::is_null) {
                        continue;
                    }
                    let key = IndexKey::composite(key);
                    let rows = self.exec.source.index_scan(
                        table,
                        index,
                        Bound::Included(key.clone()),
                        Bound::Included(key),
                    )?;
                    for (_, r) in self.filter_rows(table, rows, &filter)? {
                        self.join_row(l, &r, on, &mut joined)?;
                    }
                }
                Ok(joined)
            }
            PlanNode::Filter { input, predicate } => {
                let rows = self.node(input)?;
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows {
                    if self.test(&predicate.expr, &row)? {
                        kept.push(row);
                    }
                }
                Ok(kept)
            }
            PlanNode::Project { input, exprs, .. } => {
                let rows = self.node(input)?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let projected = exprs
                        .iter()
                        .map(|e| eval(self, e, &row))
                        .collect::<Result<Vec<_>>>()?;
                    out.push(projected);
                }
                Ok(out)
            }
            PlanNode::Distinct { input, width } => {
                let rows = self.node(input)?;
                let mut seen = HashSet::new();
                Ok(rows
                    .into_iter()
                    .filter(|row| seen.insert(row[..(*width).min(row.len())].to_vec()))
                    .collect())
            }
            PlanNode::Sort { input, keys } => {
                let mut rows = self.node(input)?;
                rows.sort_by(|a, b| compare_rows(a, b, keys));
                Ok(rows)
            }
            PlanNode::Limit { input, limit } => {
                let mut rows = self.node(input)?;
                rows.truncate(*limit);
                Ok(rows)
            }
        }
    }

    fn scan(&mut self, node: &PlanNode) -> Result<Vec<LocatedRow>> {
        match node {
            PlanNode::SeqScan { table, filter, .. } => {
                let filter: Vec<&Predicate> = filter.iter().collect();
                self.record_predicate(node, table, &filter);
                let rows = self.exec.source.scan(table)?;
                self.filter_rows(table, rows, &filter)
            }
            PlanNode::IndexScan {
                table,
                index,
                eq,
                range,
                index_cond,
                residual,
                ..
            } => {
                let filter: Vec<&Predicate> = index_cond.iter().chain(residual).collect();
                self.record_predicate(node, table, &filter);

                let prefix = eq
                    .iter()
                    .map(|e| eval(self, e, &[]))
                    .collect::<Result<Vec<_>>>()?;
                let (lower, upper) = match range {
                    Some(range) => (
                        self.bound(&prefix, &range.lower)?,
                        self.bound(&prefix, &range.upper)?,
                    ),
                    None => (
                        self.bound(&prefix, &Bound::Unbounded)?,
                        self.bound(&prefix, &Bound::Unbounded)?,
                    ),
                };
                let rows = self.exec.source.index_scan(table, index, lower, upper)?;
                self.filter_rows(table, rows, &filter)
            }
            _ => Err(Error::Internal("expected a scan node".to_string())),
        }
    }

    /// Key bound: the equality prefix, extended by the range value if any
    fn bound(&mut self, prefix: &[Value], bound: &Bound<BoundExpr>) -> Result<Bound<IndexKey>> {
        let extend = |frame: &mut Self, expr: &BoundExpr| -> Result<IndexKey> {
            let mut values = prefix.to_vec();
            values.push(eval(frame, expr, &[])?);
            Ok(IndexKey::composite(values))
        };
        Ok(match bound {
            Bound::Included(expr) => Bound::Included(extend(self, expr)?),
            Bound::Excluded(expr) => Bound::Excluded(extend(self, expr)?),
            Bound::Unbounded if prefix.is_empty() => Bound::Unbounded,
            Bound::Unbounded => Bound::Included(IndexKey::composite(prefix.to_vec())),
        })
    }

    fn filter_rows(
        &mut self,
        table: &str,
        rows: Vec<LocatedRow>,
        filter: &[&Predicate],
    ) -> Result<Vec<LocatedRow>> {
        let mut kept = Vec::with_capacity(rows.len());
        'rows: for (loc, row) in rows {
            for predicate in filter {
                if !self.test(&predicate.expr, &row)? {
                    continue 'rows;
                }
            }
            self.exec.source.record_read(table, loc);
            kept.push((loc, row));
        }
        Ok(kept)
    }

    fn record_predicate(&mut self, node: &PlanNode, table: &str, filter: &[&Predicate]) {
        if !self.exec.recorded.insert(node as *const PlanNode as usize) {
            return;
        }
        // terms that need parameters or subqueries are dropped, which only
        // widens the match
        let simple: Vec<BoundExpr> = filter
            .iter()
            .filter(|p| p.expr.is_simple())
            .map(|p| p.expr.clone())
            .collect();
        let matcher: Option<RowMatcher> = if simple.is_empty() {
            None
        } else {
            Some(Arc::new(move |row: &[Value]| {
                simple
                    .iter()
                    .all(|expr| !matches!(evaluate_condition(expr, row), Ok(t) if !t.is_true()))
            }))
        };
        self.exec.source.record_predicate(table, matcher);
    }

    /// Concatenate a left and a right row, kept when every join term holds
    fn join_row(
        &mut self,
        left: &[Value],
        right: &[Value],
        on: &[Predicate],
        out: &mut Rows,
    ) -> Result<()> {
        let row: Vec<Value> = left.iter().chain(right).cloned().collect();
        for predicate in on {
            if !self.test(&predicate.expr, &row)? {
                return Ok(());
            }
        }
        out.push(row);
        Ok(())
    }

    fn test(&mut self, expr: &BoundExpr, row: &[Value]) -> Result<bool> {
        Ok(TriBool::from_value(&eval(self, expr, row)?)?.is_true())
    }

    fn aggregate(
        &mut self,
        rows: Rows,
        group_by: &[BoundExpr],
        calls: &[AggregateCall],
    ) -> Result<Rows> {
        let fresh = || calls.iter().map(|c| Accumulator::new(c.func)).collect::<Vec<_>>();
        let mut groups: IndexMap<Vec<Value>, Vec<Accumulator>> = IndexMap::new();
        for row in rows {
            let key = group_by
                .iter()
                .map(|e| eval(self, e, &row))
                .collect::<Result<Vec<_>>>()?;
            let mut args = Vec::with_capacity(calls.len());
            for call in calls {
                args.push(match &call.arg {
                    Some(arg) => Some(eval(self, arg, &row)?),
                    None => None,
                });
            }
            let accumulators = groups.entry(key).or_insert_with(&fresh);
            for (acc, arg) in accumulators.iter_mut().zip(args) {
                acc.add(arg)?;
            }
        }
        // without GROUP BY there is always exactly one group
        if groups.is_empty() && group_by.is_empty() {
            groups.insert(Vec::new(), fresh());
        }

        groups
            .into_iter()
            .map(|(mut row, accumulators)| {
                for acc in accumulators {
                    row.push(acc.finish()?);
                }
                Ok(row)
            })
            .collect()
    }
}

impl Env for Frame<'_, '_, '_> {
    fn param(&self, index: usize) -> Result<Value> {
        self.params
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("missing parameter {}", index)))
    }

    fn subquery(&mut self, id: usize, row: &[Value]) -> Result<Rc<Rows>> {
        let plan = self.plan;
        let sub = plan
            .subplans
            .get(id)
            .ok_or_else(|| Error::Internal(format!("missing subplan {}", id)))?;
        if !sub.correlated {
            if let Some(Some(rows)) = self.cache.get(id) {
                return Ok(rows.clone());
            }
        }
        let params = sub
            .params
            .iter()
            .map(|e| eval(self, e, row))
            .collect::<Result<Vec<_>>>()?;
        let rows = Rc::new(self.exec.run(&sub.plan, &params)?);
        if !sub.correlated {
            self.cache[id] = Some(rows.clone());
        }
        Ok(rows)
    }
}

fn eval(env: &mut dyn Env, expr: &BoundExpr, row: &[Value]) -> Result<Value> {
    match expr {
        BoundExpr::Column(i) => row
            .get(*i)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("column {} out of range", i))),
        BoundExpr::Param(i) => env.param(*i),
        BoundExpr::Literal(value) => Ok(value.clone()),
        BoundExpr::Binary {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let l = TriBool::from_value(&eval(env, left, row)?)?;
            if l == TriBool::False {
                return Ok(Value::Boolean(false));
            }
            let r = TriBool::from_value(&eval(env, right, row)?)?;
            Ok(l.and(r).into_value())
        }
        BoundExpr::Binary {
            left,
            op: BinaryOperator::Or,
            right,
        } => {
            let l = TriBool::from_value(&eval(env, left, row)?)?;
            if l == TriBool::True {
                return Ok(Value::Boolean(true));
            }
            let r = TriBool::from_value(&eval(env, right, row)?)?;
            Ok(l.or(r).into_value())
        }
        BoundExpr::Binary { left, op, right } => {
            let l = eval(env, left, row)?;
            let r = eval(env, right, row)?;
            if op.is_comparison() {
                Ok(compare_values(*op, &l, &r)?.into_value())
            } else {
                apply_arithmetic(*op, &l, &r)
            }
        }
        BoundExpr::Unary {
            op: UnaryOperator::Not,
            expr,
        } => Ok(TriBool::from_value(&eval(env, expr, row)?)?
            .not()
            .into_value()),
        BoundExpr::Unary {
            op: UnaryOperator::Minus,
            expr,
        } => negate(eval(env, expr, row)?),
        BoundExpr::IsNull { expr, negated } => {
            Ok(Value::Boolean(eval(env, expr, row)?.is_null() != *negated))
        }
        BoundExpr::Like {
            expr,
            pattern,
            escape,
            negated,
        } => {
            let value = eval(env, expr, row)?;
            let pattern = eval(env, pattern, row)?;
            match (&value, &pattern) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::Text(text), Value::Text(pattern)) => {
                    Ok(Value::Boolean(like_match(text, pattern, *escape)? != *negated))
                }
                _ => Err(Error::InvalidPredicate(format!(
                    "LIKE applies to text, not {}",
                    value.type_name()
                ))),
            }
        }
        BoundExpr::InList {
            expr,
            list,
            negated,
        } => {
            let value = eval(env, expr, row)?;
            let items = list
                .iter()
                .map(|e| eval(env, e, row))
                .collect::<Result<Vec<_>>>()?;
            membership(&value, items.iter(), *negated)
        }
        BoundExpr::Exists { subplan, negated } => {
            let rows = env.subquery(*subplan, row)?;
            Ok(Value::Boolean(rows.is_empty() == *negated))
        }
        BoundExpr::InSubquery {
            expr,
            subplan,
            negated,
        } => {
            let value = eval(env, expr, row)?;
            let rows = env.subquery(*subplan, row)?;
            membership(&value, rows.iter().filter_map(|r| r.first()), *negated)
        }
        BoundExpr::Scalar(subplan) => {
            let rows = env.subquery(*subplan, row)?;
            match rows.as_slice() {
                [] => Ok(Value::Null),
                [only] => Ok(only.first().cloned().unwrap_or(Value::Null)),
                _ => Err(Error::ExecutionError(
                    "scalar subquery returned more than one row".to_string(),
                )),
            }
        }
    }
}

/// `value IN items`: unknown when no item matches but NULLs are involved
fn membership<'v>(
    value: &Value,
    items: impl Iterator<Item = &'v Value>,
    negated: bool,
) -> Result<Value> {
    let mut result = TriBool::False;
    let mut any = false;
    for item in items {
        any = true;
        match compare_values(BinaryOperator::Eq, value, item)? {
            TriBool::True => {
                result = TriBool::True;
                break;
            }
            TriBool::Unknown => result = TriBool::Unknown,
            TriBool::False => {}
        }
    }
    if !any {
        result = TriBool::False;
    }
    Ok(if negated { result.not() } else { result }.into_value())
}

fn negate(value: Value) -> Result<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Integer(i) => i
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| Error::ExecutionError(format!("-{} overflows", i))),
        Value::Decimal(d) => d
            .units()
            .checked_neg()
            .map(|units| Value::Decimal(Decimal::new(units, d.scale())))
            .ok_or_else(|| Error::ExecutionError(format!("-{} overflows", d))),
        other => Err(Error::InvalidPredicate(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

/// NULLs first ascending, last descending
fn compare_rows(a: &[Value], b: &[Value], keys: &[SortKey]) -> Ordering {
    for key in keys {
        let (Some(x), Some(y)) = (a.get(key.column), b.get(key.column)) else {
            continue;
        };
        let ordering = x.compare(y).unwrap_or(Ordering::Equal);
        let ordering = if key.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

enum Accumulator {
    Count(i64),
    Sum(Option<Value>),
    Avg { sum: Option<Value>, count: i64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl Accumulator {
    fn new(func: AggregateFunc) -> Self {
        match func {
            AggregateFunc::CountStar | AggregateFunc::Count => Accumulator::Count(0),
            AggregateFunc::Sum => Accumulator::Sum(None),
            AggregateFunc::Avg => Accumulator::Avg {
                sum: None,
                count: 0,
            },
            AggregateFunc::Min => Accumulator::Min(None),
            AggregateFunc::Max => Accumulator::Max(None),
        }
    }

    /// `None` is COUNT(*)'s argument; NULL arguments are skipped
    fn add(&mut self, arg: Option<Value>) -> Result<()> {
        let value = match arg {
            None => {
                if let Accumulator::Count(n) = self {
                    *n += 1;
                }
                return Ok(());
            }
            Some(Value::Null) => return Ok(()),
            Some(value) => value,
        };
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(total) => *total = Some(accumulate(total.take(), value)?),
            Accumulator::Avg { sum, count } => {
                *sum = Some(accumulate(sum.take(), value)?);
                *count += 1;
            }
            Accumulator::Min(current) => {
                if current
                    .as_ref()
                    .map_or(true, |c| value.compare(c) == Some(Ordering::Less))
                {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if current
                    .as_ref()
                    .map_or(true, |c| value.compare(c) == Some(Ordering::Greater))
                {
                    *current = Some(value);
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Value> {
        match self {
            Accumulator::Count(n) => Ok(Value::Integer(n)),
            Accumulator::Sum(total) => Ok(total.unwrap_or(Value::Null)),
            Accumulator::Avg { sum: None, .. } => Ok(Value::Null),
            Accumulator::Avg {
                sum: Some(sum),
                count,
            } => {
                let sum = match sum {
                    Value::Integer(i) => Value::Decimal(Decimal::from_integer(i)),
                    other => other,
                };
                apply_arithmetic(BinaryOperator::Div, &sum, &Value::Integer(count))
            }
            Accumulator::Min(v) | Accumulator::Max(v) => Ok(v.unwrap_or(Value::Null)),
        }
    }
}

fn accumulate(total: Option<Value>, value: Value) -> Result<Value> {
    match total {
        None => Ok(value),
        Some(total) => apply_arithmetic(BinaryOperator::Add, &total, &value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, DataType, IndexDef, TableBuilder, TableDef, TableStatistics};
    use crate::executor::planner::{PlanContext, Planner};
    use crate::executor::{Expr, Query};
    use std::collections::HashMap;

    /// In-memory tables. Index scans return every row; the executor
    /// re-checks the filter.
    struct MemorySource {
        catalog: Catalog,
        rows: HashMap<String, Vec<Vec<Value>>>,
        reads: usize,
        predicates: Vec<(String, Option<RowMatcher>)>,
    }

    impl MemorySource {
        fn new() -> Self {
            let catalog = Catalog::new();
            catalog
                .create_table(
                    TableBuilder::new("staff")
                        .primary_key("id")
                        .column("name", DataType::Text)
                        .column("dept", DataType::Text)
                        .column("salary", DataType::Integer)
                        .build(),
                )
                .unwrap();
            catalog
                .create_index("idx_staff_dept", "staff", vec!["dept".into()], false)
                .unwrap();
            let row = |id: i64, name: &str, dept: Option<&str>, salary: Option<i64>| {
                vec![Value::Integer(id), Value::from(name), Value::from(dept), Value::from(salary)]
            };
            let rows = vec![
                row(1, "ann", Some("eng"), Some(120)),
                row(2, "bob", Some("eng"), Some(100)),
                row(3, "cid", Some("ops"), Some(90)),
                row(4, "dee", None, Some(80)),
                row(5, "eve", None, None),
                row(6, "fay", Some("ops"), Some(95)),
            ];
            Self {
                catalog,
                rows: HashMap::from([("staff".to_string(), rows)]),
                reads: 0,
                predicates: Vec::new(),
            }
        }

        fn run(&mut self, query: Query) -> Result<QueryResult> {
            let plan = Planner::new(&*self).plan(&query)?;
            Executor::new(self).execute(&plan)
        }
    }

    impl PlanContext for MemorySource {
        fn table(&self, name: &str) -> Result<Arc<TableDef>> {
            self.catalog.get_table(name)
        }

        fn indexes(&self, table: &str) -> Vec<Arc<IndexDef>> {
            self.catalog.get_table_indexes(table)
        }

        fn statistics(&self, table: &str) -> Result<TableStatistics> {
            let rows = self.rows.get(table).map(Vec::as_slice).unwrap_or_default();
            Ok(TableStatistics::gather(4, rows.iter().map(Vec::as_slice), 0))
        }
    }

    impl DataSource for MemorySource {
        fn scan(&mut self, table: &str) -> Result<Vec<LocatedRow>> {
            let rows = self
                .rows
                .get(table)
                .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
            Ok(rows
                .iter()
                .enumerate()
                .map(|(i, row)| (TupleLocation::new(0, i as u16), row.clone()))
                .collect())
        }

        fn index_scan(
            &mut self,
            table: &str,
            _index: &str,
            _lower: Bound<IndexKey>,
            _upper: Bound<IndexKey>,
        ) -> Result<Vec<LocatedRow>> {
            self.scan(table)
        }

        fn record_read(&mut self, _table: &str, _loc: TupleLocation) {
            self.reads += 1;
        }

        fn record_predicate(&mut self, table: &str, matcher: Option<RowMatcher>) {
            self.predicates.push((table.to_string(), matcher));
        }
    }

    fn names(result: &QueryResult) -> Vec<Value> {
        result.column("name").unwrap()
    }

    #[test]
    fn test_three_valued_filters() {
        let mut db = MemorySource::new();
        // NULL departments are neither equal nor unequal to 'eng'
        let result = db
            .run(Query::from("staff").filter(Expr::col("dept").neq(Expr::lit("eng"))))
            .unwrap();
        assert_eq!(result.len(), 2);

        // NOT IN a list containing NULL never holds
        let result = db
            .run(Query::from("staff").filter(
                Expr::col("salary").not_in_list(vec![Expr::lit(120), Expr::null()]),
            ))
            .unwrap();
        assert!(result.is_empty());

        let result = db
            .run(Query::from("staff").filter(Expr::col("dept").is_null()))
            .unwrap();
        assert_eq!(names(&result), vec![Value::from("dee"), Value::from("eve")]);
    }

    #[test]
    fn test_self_join_pairs_colleagues() {
        let mut db = MemorySource::new();
        let result = db
            .run(
                Query::from("staff")
                    .alias("a")
                    .join_as(
                        "staff",
                        "b",
                        Expr::col("a.dept")
                            .eq(Expr::col("b.dept"))
                            .and(Expr::col("a.id").lt(Expr::col("b.id"))),
                    )
                    .select(vec![Expr::col("a.name"), Expr::col("b.name")])
                    .order_by(Expr::col("a.name")),
            )
            .unwrap();
        // NULL departments pair with nobody
        assert_eq!(
            result.rows,
            vec![
                vec![Value::from("ann"), Value::from("bob")],
                vec![Value::from("cid"), Value::from("fay")],
            ]
        );
        assert!(db.predicates.iter().all(|(table, _)| table == "staff"));
        assert_eq!(db.predicates.len(), 2);
    }

    #[test]
    fn test_group_by_treats_nulls_as_one_group() {
        let mut db = MemorySource::new();
        let result = db
            .run(
                Query::from("staff")
                    .select(vec![
                        Expr::col("dept"),
                        Expr::count_star(),
                        Expr::count(Expr::col("salary")),
                        Expr::sum(Expr::col("salary")),
                    ])
                    .group_by(vec![Expr::col("dept")])
                    .order_by(Expr::col("dept")),
            )
            .unwrap();
        assert_eq!(
            result.rows,
            vec![
                vec![Value::Null, Value::Integer(2), Value::Integer(1), Value::Integer(80)],
                vec![Value::from("eng"), Value::Integer(2), Value::Integer(2), Value::Integer(220)],
                vec![Value::from("ops"), Value::Integer(2), Value::Integer(2), Value::Integer(185)],
            ]
        );
    }

    #[test]
    fn test_aggregates_over_empty_input() {
        let mut db = MemorySource::new();
        let result = db
            .run(
                Query::from("staff")
                    .filter(Expr::col("salary").gt(Expr::lit(1000)))
                    .select(vec![
                        Expr::count_star(),
                        Expr::sum(Expr::col("salary")),
                        Expr::max(Expr::col("salary")),
                    ]),
            )
            .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Value::Integer(0), Value::Null, Value::Null]]
        );
    }

    #[test]
    fn test_order_by_null_placement() {
        let mut db = MemorySource::new();
        let asc = db
            .run(Query::from("staff").order_by(Expr::col("salary")))
            .unwrap();
        assert_eq!(asc.rows[0][1], Value::from("eve"));

        let desc = db
            .run(
                Query::from("staff")
                    .select(vec![Expr::col("name")])
                    .order_by_desc(Expr::col("salary"))
                    .limit(6),
            )
            .unwrap();
        assert_eq!(desc.rows[0][0], Value::from("ann"));
        assert_eq!(desc.rows[5][0], Value::from("eve"));
        // the hidden sort key is not part of the output
        assert_eq!(desc.columns, vec!["name"]);
        assert_eq!(desc.rows[0].len(), 1);
    }

    #[test]
    fn test_distinct_and_having() {
        let mut db = MemorySource::new();
        let result = db
            .run(
                Query::from("staff")
                    .select(vec![Expr::col("dept")])
                    .distinct()
                    .order_by(Expr::col("dept")),
            )
            .unwrap();
        assert_eq!(result.len(), 3);

        let result = db
            .run(
                Query::from("staff")
                    .select(vec![Expr::col("dept")])
                    .group_by(vec![Expr::col("dept")])
                    .having(Expr::avg(Expr::col("salary")).gt(Expr::lit(100))),
            )
            .unwrap();
        assert_eq!(result.rows, vec![vec![Value::from("eng")]]);
    }

    #[test]
    fn test_correlated_subquery() {
        let mut db = MemorySource::new();
        // best-paid person per department
        let richer = Query::from("staff")
            .select(vec![Expr::col("id")])
            .filter(Expr::col("dept").eq(Expr::outer("dept")))
            .filter(Expr::col("salary").gt(Expr::outer("salary")));
        let result = db
            .run(
                Query::from("staff")
                    .filter(Expr::col("dept").is_not_null())
                    .filter(Expr::not_exists(richer))
                    .order_by(Expr::col("name")),
            )
            .unwrap();
        assert_eq!(names(&result), vec![Value::from("ann"), Value::from("fay")]);
    }

    #[test]
    fn test_scalar_and_in_subqueries() {
        let mut db = MemorySource::new();
        let top = Query::from("staff").select(vec![Expr::max(Expr::col("salary"))]);
        let result = db
            .run(Query::from("staff").filter(Expr::col("salary").eq(Expr::scalar(top))))
            .unwrap();
        assert_eq!(names(&result), vec![Value::from("ann")]);

        let ops = Query::from("staff")
            .select(vec![Expr::col("salary")])
            .filter(Expr::col("dept").eq(Expr::lit("ops")));
        let result = db
            .run(Query::from("staff").filter(Expr::col("salary").in_subquery(ops)))
            .unwrap();
        assert_eq!(result.len(), 2);

        let many = Query::from("staff").select(vec![Expr::col("salary")]);
        let err = db
            .run(Query::from("staff").filter(Expr::col("salary").eq(Expr::scalar(many))))
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionError(_)));
    }

    #[test]
    fn test_runtime_errors_surface() {
        let mut db = MemorySource::new();
        let err = db
            .run(Query::from("staff").select(vec![Expr::col("salary").div(Expr::lit(0))]))
            .unwrap_err();
        assert!(matches!(err, Error::DivisionByZero));
    }

    #[test]
    fn test_reads_and_predicates_recorded() {
        let mut db = MemorySource::new();
        db.run(Query::from("staff").filter(Expr::col("dept").eq(Expr::lit("eng"))))
            .unwrap();
        assert_eq!(db.reads, 2);
        assert_eq!(db.predicates.len(), 1);

        let (table, matcher) = &db.predicates[0];
        assert_eq!(table, "staff");
        let matcher = matcher.as_ref().unwrap();
        assert!(matcher(&[
            Value::Integer(9),
            Value::from("x"),
            Value::from("eng"),
            Value::Null
        ]));
        assert!(!matcher(&[
            Value::Integer(9),
            Value::from("x"),
            Value::from("ops"),
            Value::Null
        ]));
    }

    #[test]
    fn test_standalone_evaluation() {
        let row = [Value::Integer(5), Value::Null];
        let expr = BoundExpr::Binary {
            left: Box::new(BoundExpr::Column(0)),
            op: BinaryOperator::Gt,
            right: Box::new(BoundExpr::Column(1)),
        };
        assert_eq!(evaluate_condition(&expr, &row).unwrap(), TriBool::Unknown);
        assert!(matches!(
            evaluate(&BoundExpr::Scalar(0), &row),
            Err(Error::InvalidPredicate(_))
        ));
    }
}
