//! Query Planner for SnapDB
//!
//! This module binds logical queries against the catalog, estimates the
//! selectivity and cost of each access path, and builds the plan tree the
//! executor runs. Subqueries are compiled into [`SubPlan`]s; references to
//! the enclosing row become parameters bound per execution.

use std::fmt;
use std::fmt::Write as _;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

use super::expr::{AggregateFunc, BinaryOperator, Expr, UnaryOperator};
use super::query::{Query, SelectItem};
use crate::catalog::{DataType, IndexDef, TableDef, TableStatistics};
use crate::error::{Error, Result};
use crate::storage::Value;

/// Cost of reading one row during a sequential scan
pub const SEQ_ROW_COST: f64 = 1.0;
/// Cost of fetching one row through an index
pub const INDEX_FETCH_COST: f64 = 2.0;

const DEFAULT_EQ_SELECTIVITY: f64 = 0.1;
const RANGE_SELECTIVITY: f64 = 1.0 / 3.0;
const BOUNDED_RANGE_SELECTIVITY: f64 = 0.25;
const DEFAULT_NULL_FRACTION: f64 = 0.05;
const LIKE_SELECTIVITY: f64 = 0.1;
const DEFAULT_SELECTIVITY: f64 = 1.0 / 3.0;

/// Catalog information the planner needs
pub trait PlanContext {
    fn table(&self, name: &str) -> Result<Arc<TableDef>>;
    fn indexes(&self, table: &str) -> Vec<Arc<IndexDef>>;
    /// Current statistics, refreshed if missing or stale
    fn statistics(&self, table: &str) -> Result<TableStatistics>;
}

/// An expression with columns resolved to positions
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    Column(usize),
    /// Value bound from the enclosing query's row
    Param(usize),
    Literal(Value),
    Binary {
        left: Box<BoundExpr>,
        op: BinaryOperator,
        right: Box<BoundExpr>,
    },
    Unary {
        op: UnaryOperator,
        expr: Box<BoundExpr>,
    },
    IsNull {
        expr: Box<BoundExpr>,
        negated: bool,
    },
    Like {
        expr: Box<BoundExpr>,
        pattern: Box<BoundExpr>,
        escape: char,
        negated: bool,
    },
    InList {
        expr: Box<BoundExpr>,
        list: Vec<BoundExpr>,
        negated: bool,
    },
    Exists {
        subplan: usize,
        negated: bool,
    },
    InSubquery {
        expr: Box<BoundExpr>,
        subplan: usize,
        negated: bool,
    },
    Scalar(usize),
}

impl BoundExpr {
    /// Evaluable from the row alone: no parameters, no subqueries
    pub fn is_simple(&self) -> bool {
        match self {
            BoundExpr::Column(_) | BoundExpr::Literal(_) => true,
            BoundExpr::Param(_)
            | BoundExpr::Exists { .. }
            | BoundExpr::InSubquery { .. }
            | BoundExpr::Scalar(_) => false,
            BoundExpr::Binary { left, right, .. } => left.is_simple() && right.is_simple(),
            BoundExpr::Unary { expr, .. } | BoundExpr::IsNull { expr, .. } => expr.is_simple(),
            BoundExpr::Like { expr, pattern, .. } => expr.is_simple() && pattern.is_simple(),
            BoundExpr::InList { expr, list, .. } => {
                expr.is_simple() && list.iter().all(BoundExpr::is_simple)
            }
        }
    }

    /// A literal or parameter: the same for every row of the scan
    fn is_row_independent(&self) -> bool {
        matches!(self, BoundExpr::Literal(_) | BoundExpr::Param(_))
    }

    /// Push the referenced column positions into `out`. False when a
    /// subquery is involved.
    fn collect_columns(&self, out: &mut Vec<usize>) -> bool {
        match self {
            BoundExpr::Column(c) => {
                out.push(*c);
                true
            }
            BoundExpr::Param(_) | BoundExpr::Literal(_) => true,
            BoundExpr::Exists { .. } | BoundExpr::InSubquery { .. } | BoundExpr::Scalar(_) => false,
            BoundExpr::Binary { left, right, .. } => {
                left.collect_columns(out) && right.collect_columns(out)
            }
            BoundExpr::Unary { expr, .. } | BoundExpr::IsNull { expr, .. } => {
                expr.collect_columns(out)
            }
            BoundExpr::Like { expr, pattern, .. } => {
                expr.collect_columns(out) && pattern.collect_columns(out)
            }
            BoundExpr::InList { expr, list, .. } => {
                expr.collect_columns(out) && list.iter().all(|e| e.collect_columns(out))
            }
        }
    }

    /// The same expression with column positions moved down by `offset`
    fn shifted(&self, offset: usize) -> BoundExpr {
        let shift = |e: &BoundExpr| Box::new(e.shifted(offset));
        match self {
            BoundExpr::Column(c) => BoundExpr::Column(c.saturating_sub(offset)),
            BoundExpr::Binary { left, op, right } => BoundExpr::Binary {
                left: shift(left),
                op: *op,
                right: shift(right),
            },
            BoundExpr::Unary { op, expr } => BoundExpr::Unary {
                op: *op,
                expr: shift(expr),
            },
            BoundExpr::IsNull { expr, negated } => BoundExpr::IsNull {
                expr: shift(expr),
                negated: *negated,
            },
            BoundExpr::Like {
                expr,
                pattern,
                escape,
                negated,
            } => BoundExpr::Like {
                expr: shift(expr),
                pattern: shift(pattern),
                escape: *escape,
                negated: *negated,
            },
            BoundExpr::InList {
                expr,
                list,
                negated,
            } => BoundExpr::InList {
                expr: shift(expr),
                list: list.iter().map(|e| e.shifted(offset)).collect(),
                negated: *negated,
            },
            other => other.clone(),
        }
    }
}

/// A bound predicate with its source text for EXPLAIN
#[derive(Debug, Clone)]
pub struct Predicate {
    pub expr: BoundExpr,
    pub text: String,
}

impl Predicate {
    fn shifted(self, offset: usize) -> Predicate {
        Predicate {
            expr: self.expr.shifted(offset),
            text: self.text,
        }
    }
}

/// Planner estimates for a scan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub selectivity: f64,
    pub rows: f64,
    pub cost: f64,
    /// Rows in the table when planned
    pub table_rows: f64,
}

#[derive(Debug, Clone)]
pub struct AggregateCall {
    pub func: AggregateFunc,
    pub arg: Option<BoundExpr>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
    pub text: String,
}

/// Bounds on the first index column after the equality prefix
#[derive(Debug, Clone)]
pub struct RangeBounds {
    pub lower: Bound<BoundExpr>,
    pub upper: Bound<BoundExpr>,
}

/// Plan node
#[derive(Debug, Clone)]
pub enum PlanNode {
    /// Read every visible row
    SeqScan {
        table: String,
        filter: Vec<Predicate>,
        estimate: Estimate,
    },
    /// Look rows up through an index, then re-check the whole filter
    IndexScan {
        table: String,
        index: String,
        eq: Vec<BoundExpr>,
        range: Option<RangeBounds>,
        index_cond: Vec<Predicate>,
        residual: Vec<Predicate>,
        estimate: Estimate,
    },
    /// Pair each left row with every inner row passing `on`. The inner
    /// scan runs once.
    NestedLoopJoin {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        on: Vec<Predicate>,
        estimate: Estimate,
    },
    /// Look up `index` on the inner table with keys computed from each left
    /// row, then check the inner filter and `on`
    IndexNestedLoop {
        left: Box<PlanNode>,
        table: String,
        index: String,
        /// Evaluated over the left row
        keys: Vec<BoundExpr>,
        key_text: Vec<String>,
        /// Over the inner row alone
        filter: Vec<Predicate>,
        on: Vec<Predicate>,
        estimate: Estimate,
    },
    /// Group rows; output is group keys followed by aggregate values
    Aggregate {
        input: Box<PlanNode>,
        group_by: Vec<BoundExpr>,
        group_text: Vec<String>,
        aggregates: Vec<AggregateCall>,
    },
    /// HAVING, or a WHERE term spanning joined relations
    Filter {
        input: Box<PlanNode>,
        predicate: Predicate,
    },
    /// Output columns followed by hidden sort keys
    Project {
        input: Box<PlanNode>,
        exprs: Vec<BoundExpr>,
        names: Vec<String>,
    },
    /// Deduplicate on the first `width` columns
    Distinct { input: Box<PlanNode>, width: usize },
    Sort {
        input: Box<PlanNode>,
        keys: Vec<SortKey>,
    },
    Limit { input: Box<PlanNode>, limit: usize },
}

impl PlanNode {
    pub fn input(&self) -> Option<&PlanNode> {
        match self {
            PlanNode::SeqScan { .. } | PlanNode::IndexScan { .. } => None,
            PlanNode::NestedLoopJoin { left, .. } | PlanNode::IndexNestedLoop { left, .. } => {
                Some(left)
            }
            PlanNode::Aggregate { input, .. }
            | PlanNode::Filter { input, .. }
            | PlanNode::Project { input, .. }
            | PlanNode::Distinct { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Limit { input, .. } => Some(input),
        }
    }

    pub fn estimate(&self) -> Option<Estimate> {
        match self {
            PlanNode::SeqScan { estimate, .. }
            | PlanNode::IndexScan { estimate, .. }
            | PlanNode::NestedLoopJoin { estimate, .. }
            | PlanNode::IndexNestedLoop { estimate, .. } => Some(*estimate),
            _ => None,
        }
    }

    fn render(&self, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        let arrow = if depth == 0 { "" } else { "-> " };
        let join = |preds: &[Predicate]| {
            preds
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join(" AND ")
        };
        let _ = match self {
            PlanNode::SeqScan {
                table,
                filter,
                estimate,
            } => {
                let _ = writeln!(
                    out,
                    "{}{}Seq Scan on {} (selectivity={:.3} rows={:.1} cost={:.2})",
                    pad, arrow, table, estimate.selectivity, estimate.rows, estimate.cost
                );
                if !filter.is_empty() {
                    let _ = writeln!(out, "{}     Filter: {}", pad, join(filter));
                }
                Ok(())
            }
            PlanNode::IndexScan {
                table,
                index,
                index_cond,
                residual,
                estimate,
                ..
            } => {
                let _ = writeln!(
                    out,
                    "{}{}Index Scan using {} on {} (selectivity={:.3} rows={:.1} cost={:.2})",
                    pad, arrow, index, table, estimate.selectivity, estimate.rows, estimate.cost
                );
                let _ = writeln!(out, "{}     Index Cond: {}", pad, join(index_cond));
                if !residual.is_empty() {
                    let _ = writeln!(out, "{}     Filter: {}", pad, join(residual));
                }
                Ok(())
            }
            PlanNode::NestedLoopJoin { on, estimate, .. } => {
                let _ = writeln!(
                    out,
                    "{}{}Nested Loop (rows={:.1} cost={:.2})",
                    pad, arrow, estimate.rows, estimate.cost
                );
                if !on.is_empty() {
                    let _ = writeln!(out, "{}     Join Filter: {}", pad, join(on));
                }
                Ok(())
            }
            PlanNode::IndexNestedLoop {
                table,
                index,
                key_text,
                filter,
                on,
                estimate,
                ..
            } => {
                let _ = writeln!(
                    out,
                    "{}{}Index Nested Loop using {} on {} (rows={:.1} cost={:.2})",
                    pad, arrow, index, table, estimate.rows, estimate.cost
                );
                let _ = writeln!(out, "{}     Index Cond: {}", pad, key_text.join(" AND "));
                if !filter.is_empty() {
                    let _ = writeln!(out, "{}     Filter: {}", pad, join(filter));
                }
                if !on.is_empty() {
                    let _ = writeln!(out, "{}     Join Filter: {}", pad, join(on));
                }
                Ok(())
            }
            PlanNode::Aggregate {
                group_text,
                aggregates,
                ..
            } => {
                let aggs: Vec<&str> = aggregates.iter().map(|a| a.text.as_str()).collect();
                if group_text.is_empty() {
                    writeln!(out, "{}{}Aggregate ({})", pad, arrow, aggs.join(", "))
                } else {
                    writeln!(
                        out,
                        "{}{}Group By {} ({})",
                        pad,
                        arrow,
                        group_text.join(", "),
                        aggs.join(", ")
                    )
                }
            }
            PlanNode::Filter { predicate, .. } => {
                writeln!(out, "{}{}Filter: {}", pad, arrow, predicate.text)
            }
            PlanNode::Project { names, .. } => {
                writeln!(out, "{}{}Project ({})", pad, arrow, names.join(", "))
            }
            PlanNode::Distinct { .. } => writeln!(out, "{}{}Distinct", pad, arrow),
            PlanNode::Sort { keys, .. } => {
                let keys: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{}{}", k.text, if k.descending { " DESC" } else { "" }))
                    .collect();
                writeln!(out, "{}{}Sort ({})", pad, arrow, keys.join(", "))
            }
            PlanNode::Limit { limit, .. } => writeln!(out, "{}{}Limit ({})", pad, arrow, limit),
        };
        if let Some(input) = self.input() {
            input.render(depth + 1, out);
        }
        if let PlanNode::NestedLoopJoin { right, .. } = self {
            right.render(depth + 1, out);
        }
    }

    /// Join strategies from the bottom of the tree up
    pub fn joins(&self) -> Vec<JoinMethod> {
        let mut found = self.input().map(PlanNode::joins).unwrap_or_default();
        match self {
            PlanNode::NestedLoopJoin { right, .. } => {
                let table = match right.as_ref() {
                    PlanNode::SeqScan { table, .. } | PlanNode::IndexScan { table, .. } => {
                        table.clone()
                    }
                    _ => String::new(),
                };
                found.push(JoinMethod::NestedLoop { table });
            }
            PlanNode::IndexNestedLoop { table, index, .. } => {
                found.push(JoinMethod::IndexNestedLoop {
                    table: table.clone(),
                    index: index.clone(),
                })
            }
            _ => {}
        }
        found
    }
}

/// How one joined relation is read
#[derive(Debug, Clone, PartialEq)]
pub enum JoinMethod {
    NestedLoop { table: String },
    IndexNestedLoop { table: String, index: String },
}

/// A compiled subquery
#[derive(Debug, Clone)]
pub struct SubPlan {
    pub plan: QueryPlan,
    /// Expressions over the enclosing row that feed the subquery's parameters
    pub params: Vec<BoundExpr>,
    /// Re-run per outer row; otherwise run once per statement and cached
    pub correlated: bool,
}

/// A plan ready for execution
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub table: String,
    pub root: PlanNode,
    /// Visible output columns
    pub columns: Vec<String>,
    pub types: Vec<Option<DataType>>,
    pub subplans: Vec<SubPlan>,
}

impl QueryPlan {
    /// The scan at the bottom of the tree
    pub fn scan(&self) -> &PlanNode {
        let mut node = &self.root;
        while let Some(input) = node.input() {
            node = input;
        }
        node
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    fn render(&self, depth: usize, out: &mut String) {
        self.root.render(depth, out);
        for (i, sub) in self.subplans.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}SubPlan {} ({})",
                "  ".repeat(depth + 1),
                i,
                if sub.correlated {
                    "correlated, re-run per row"
                } else {
                    "run once, cached"
                }
            );
            sub.plan.render(depth + 2, out);
        }
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(0, &mut out);
        f.write_str(out.trim_end())
    }
}

/// Chosen access path
#[derive(Debug, Clone, PartialEq)]
pub enum AccessPath {
    SeqScan,
    IndexScan { index: String },
}

/// Planner report for one query
#[derive(Debug, Clone)]
pub struct Explain {
    pub access: AccessPath,
    pub selectivity: f64,
    pub estimated_rows: f64,
    pub cost: f64,
    /// What a sequential scan would have cost
    pub seq_scan_cost: f64,
    /// One entry per joined relation
    pub joins: Vec<JoinMethod>,
    pub plan: QueryPlan,
}

impl Explain {
    pub fn uses_index(&self) -> bool {
        matches!(self.access, AccessPath::IndexScan { .. })
    }

    pub fn index_name(&self) -> Option<&str> {
        match &self.access {
            AccessPath::IndexScan { index } => Some(index),
            AccessPath::SeqScan => None,
        }
    }
}

impl fmt::Display for Explain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.plan)
    }
}

type Typed = (BoundExpr, Option<DataType>);

/// One relation of a FROM list
#[derive(Debug, Clone)]
struct Relation {
    /// Qualifier of its columns
    name: String,
    table: String,
    columns: Vec<String>,
    types: Vec<DataType>,
    /// Position of its first column in the combined row
    offset: usize,
}

impl Relation {
    fn new(name: &str, def: &TableDef, offset: usize) -> Self {
        Relation {
            name: name.to_string(),
            table: def.name.clone(),
            columns: def.schema.columns().iter().map(|c| c.name.clone()).collect(),
            types: def.schema.columns().iter().map(|c| c.data_type).collect(),
            offset,
        }
    }

    fn end(&self) -> usize {
        self.offset + self.columns.len()
    }

    fn covers(&self, column: usize) -> bool {
        column >= self.offset && column < self.end()
    }
}

/// The single relation whose columns `expr` reads; `None` when it reads
/// several or contains a subquery
fn owner(expr: &BoundExpr, relations: &[Relation]) -> Option<usize> {
    let mut columns = Vec::new();
    if !expr.collect_columns(&mut columns) {
        return None;
    }
    let Some(first) = columns.first() else {
        return Some(0);
    };
    let r = relations.iter().position(|rel| rel.covers(*first))?;
    columns
        .iter()
        .all(|c| relations[r].covers(*c))
        .then_some(r)
}

/// Name resolution scope
#[derive(Debug)]
enum Scope {
    /// Columns of the scanned relations, concatenated in FROM order
    Row { relations: Vec<Relation> },
    /// Output of an Aggregate node
    Grouped {
        keys: Vec<Expr>,
        key_types: Vec<Option<DataType>>,
        aggregates: Vec<Expr>,
        aggregate_types: Vec<Option<DataType>>,
    },
}

impl Scope {
    fn for_table(def: &TableDef) -> Scope {
        Scope::Row {
            relations: vec![Relation::new(&def.name, def, 0)],
        }
    }

    fn column(&self, name: &str) -> Result<Typed> {
        match self {
            Scope::Row { relations } => {
                let (qualifier, column) = match name.split_once('.') {
                    Some((q, c)) => (Some(q), c),
                    None => (None, name),
                };
                let mut found = None;
                for rel in relations {
                    if qualifier.is_some_and(|q| q != rel.name) {
                        continue;
                    }
                    let Some(i) = rel.columns.iter().position(|c| c == column) else {
                        continue;
                    };
                    if found.is_some() {
                        return Err(Error::InvalidPredicate(format!(
                            "column reference '{}' is ambiguous",
                            name
                        )));
                    }
                    found = Some((BoundExpr::Column(rel.offset + i), Some(rel.types[i])));
                }
                found.ok_or_else(|| {
                    let tables: Vec<&str> = relations.iter().map(|r| r.table.as_str()).collect();
                    Error::ColumnNotFound(name.to_string(), tables.join(", "))
                })
            }
            Scope::Grouped {
                keys, key_types, ..
            } => keys
                .iter()
                .position(|k| matches!(k, Expr::Column(n) if n == name))
                .map(|i| (BoundExpr::Column(i), key_types[i]))
                .ok_or_else(|| {
                    Error::InvalidPredicate(format!(
                        "column '{}' must appear in GROUP BY or inside an aggregate",
                        name
                    ))
                }),
        }
    }
}

/// Binds and plans one query level
pub struct Planner<'a> {
    ctx: Option<&'a dyn PlanContext>,
    parent: Option<&'a Scope>,
    /// Outer references: name, expression in the parent scope, type
    params: Vec<(String, BoundExpr, Option<DataType>)>,
    subplans: Vec<SubPlan>,
}

impl<'a> Planner<'a> {
    pub fn new(ctx: &'a dyn PlanContext) -> Self {
        Self {
            ctx: Some(ctx),
            parent: None,
            params: Vec::new(),
            subplans: Vec::new(),
        }
    }

    fn nested(ctx: &'a dyn PlanContext, parent: &'a Scope) -> Self {
        Self {
            ctx: Some(ctx),
            parent: Some(parent),
            params: Vec::new(),
            subplans: Vec::new(),
        }
    }

    /// Plan a query
    pub fn plan(mut self, query: &Query) -> Result<QueryPlan> {
        let plan = self.build(query)?;
        if !self.params.is_empty() {
            return Err(Error::InvalidPredicate(
                "outer reference outside a subquery".to_string(),
            ));
        }
        Ok(plan)
    }

    /// Plan a query and report the chosen access path
    pub fn explain(self, query: &Query) -> Result<Explain> {
        let plan = self.plan(query)?;
        let (access, estimate) = match plan.scan() {
            PlanNode::IndexScan {
                index, estimate, ..
            } => (
                AccessPath::IndexScan {
                    index: index.clone(),
                },
                *estimate,
            ),
            other => (
                AccessPath::SeqScan,
                other.estimate().unwrap_or(Estimate {
                    selectivity: 1.0,
                    rows: 0.0,
                    cost: 0.0,
                    table_rows: 0.0,
                }),
            ),
        };
        let seq_scan_cost = estimate.table_rows * SEQ_ROW_COST;
        Ok(Explain {
            access,
            selectivity: estimate.selectivity,
            estimated_rows: estimate.rows,
            cost: estimate.cost,
            seq_scan_cost,
            joins: plan.root.joins(),
            plan,
        })
    }

    fn build(&mut self, query: &Query) -> Result<QueryPlan> {
        let ctx = self
            .ctx
            .ok_or_else(|| Error::InvalidPredicate("subqueries are not allowed here".to_string()))?;
        let def = ctx.table(&query.relation)?;
        let mut relations = vec![Relation::new(query.name(), &def, 0)];
        let mut defs = vec![def.clone()];
        for join in &query.joins {
            if relations.iter().any(|r| r.name == join.name()) {
                return Err(Error::InvalidPredicate(format!(
                    "relation name '{}' is used twice; give one an alias",
                    join.name()
                )));
            }
            let joined = ctx.table(&join.relation)?;
            let offset = relations.last().map_or(0, Relation::end);
            relations.push(Relation::new(join.name(), &joined, offset));
            defs.push(joined);
        }
        let row_scope = Scope::Row {
            relations: relations.clone(),
        };

        // WHERE
        let mut conjuncts = Vec::new();
        if let Some(filter) = &query.filter {
            for term in filter.conjuncts() {
                let (expr, ty) = self.bind(term, &row_scope)?;
                expect_boolean(ty, "WHERE")?;
                conjuncts.push(Predicate {
                    expr,
                    text: term.to_string(),
                });
            }
        }
        let mut node = if query.joins.is_empty() {
            let stats = ctx.statistics(&def.name)?;
            self.choose_access(&def, ctx.indexes(&def.name), &stats, conjuncts)
        } else {
            self.plan_joins(ctx, query, &relations, &defs, conjuncts)?
        };

        // GROUP BY / aggregates
        let scope = if query.is_aggregate() {
            let mut group_by = Vec::new();
            let mut key_types = Vec::new();
            for key in &query.group_by {
                if key.contains_aggregate() {
                    return Err(Error::InvalidPredicate(
                        "aggregates are not allowed in GROUP BY".to_string(),
                    ));
                }
                let (expr, ty) = self.bind(key, &row_scope)?;
                group_by.push(expr);
                key_types.push(ty);
            }

            let mut calls = Vec::new();
            for item in &query.projection {
                collect_aggregates(&item.expr, &mut calls);
            }
            if let Some(having) = &query.having {
                collect_aggregates(having, &mut calls);
            }
            for order in &query.order_by {
                collect_aggregates(&order.expr, &mut calls);
            }

            let mut aggregates = Vec::new();
            let mut aggregate_types = Vec::new();
            for call in &calls {
                let Expr::Aggregate { func, arg } = call else {
                    continue;
                };
                let bound_arg = match arg {
                    Some(arg) => {
                        if arg.contains_aggregate() {
                            return Err(Error::InvalidPredicate(
                                "aggregate calls cannot be nested".to_string(),
                            ));
                        }
                        Some(self.bind(arg, &row_scope)?)
                    }
                    None => None,
                };
                aggregate_types.push(aggregate_type(*func, bound_arg.as_ref().and_then(|a| a.1))?);
                aggregates.push(AggregateCall {
                    func: *func,
                    arg: bound_arg.map(|a| a.0),
                    text: call.to_string(),
                });
            }

            node = PlanNode::Aggregate {
                input: Box::new(node),
                group_by,
                group_text: query.group_by.iter().map(|e| e.to_string()).collect(),
                aggregates,
            };
            Scope::Grouped {
                keys: query.group_by.clone(),
                key_types,
                aggregates: calls,
                aggregate_types,
            }
        } else {
            row_scope
        };

        // HAVING
        if let Some(having) = &query.having {
            let (expr, ty) = self.bind(having, &scope)?;
            expect_boolean(ty, "HAVING")?;
            node = PlanNode::Filter {
                input: Box::new(node),
                predicate: Predicate {
                    expr,
                    text: having.to_string(),
                },
            };
        }

        // Projection
        let items: Vec<SelectItem> = if query.projection.is_empty() {
            if matches!(scope, Scope::Grouped { .. }) {
                return Err(Error::InvalidPredicate(
                    "aggregate queries need an explicit select list".to_string(),
                ));
            }
            if query.joins.is_empty() {
                def.schema
                    .columns()
                    .iter()
                    .map(|c| SelectItem::from(Expr::Column(c.name.clone())))
                    .collect()
            } else {
                relations
                    .iter()
                    .flat_map(|r| {
                        r.columns.iter().map(move |c| {
                            SelectItem::from(Expr::Column(format!("{}.{}", r.name, c)))
                        })
                    })
                    .collect()
            }
        } else {
            query.projection.clone()
        };
        let mut exprs = Vec::with_capacity(items.len());
        let mut types = Vec::with_capacity(items.len());
        let names: Vec<String> = items.iter().map(SelectItem::name).collect();
        for item in &items {
            let (expr, ty) = self.bind(&item.expr, &scope)?;
            exprs.push(expr);
            types.push(ty);
        }
        let width = exprs.len();

        // ORDER BY: output columns by name or expression, otherwise hidden keys
        let mut keys = Vec::with_capacity(query.order_by.len());
        for order in &query.order_by {
            let by_name = match &order.expr {
                Expr::Column(name) => names.iter().position(|n| n == name),
                _ => None,
            };
            let column = match by_name.or_else(|| items.iter().position(|i| i.expr == order.expr)) {
                Some(column) => column,
                None => {
                    let (expr, _) = self.bind(&order.expr, &scope)?;
                    exprs.push(expr);
                    exprs.len() - 1
                }
            };
            keys.push(SortKey {
                column,
                descending: order.descending,
                text: order.expr.to_string(),
            });
        }

        node = PlanNode::Project {
            input: Box::new(node),
            exprs,
            names: names.clone(),
        };
        if query.distinct {
            node = PlanNode::Distinct {
                input: Box::new(node),
                width,
            };
        }
        if !keys.is_empty() {
            node = PlanNode::Sort {
                input: Box::new(node),
                keys,
            };
        }
        if let Some(limit) = query.limit {
            node = PlanNode::Limit {
                input: Box::new(node),
                limit,
            };
        }

        Ok(QueryPlan {
            table: def.name.clone(),
            root: node,
            columns: names,
            types,
            subplans: std::mem::take(&mut self.subplans),
        })
    }

    /// Scan the base relation, then join each further relation in FROM
    /// order. WHERE and ON terms over a single relation move into that
    /// relation's scan; terms spanning relations are checked after the
    /// join that completes them.
    fn plan_joins(
        &mut self,
        ctx: &dyn PlanContext,
        query: &Query,
        relations: &[Relation],
        defs: &[Arc<TableDef>],
        conjuncts: Vec<Predicate>,
    ) -> Result<PlanNode> {
        let mut pushed: Vec<Vec<Predicate>> = vec![Vec::new(); relations.len()];
        let mut spanning = Vec::new();
        for predicate in conjuncts {
            match owner(&predicate.expr, relations) {
                Some(r) => pushed[r].push(predicate.shifted(relations[r].offset)),
                None => spanning.push(predicate),
            }
        }

        let base = &defs[0];
        let stats = ctx.statistics(&base.name)?;
        let base_filter = std::mem::take(&mut pushed[0]);
        let mut node = self.choose_access(base, ctx.indexes(&base.name), &stats, base_filter);

        for (i, join) in query.joins.iter().enumerate() {
            let r = i + 1;
            let scope = Scope::Row {
                relations: relations[..=r].to_vec(),
            };
            let mut filter = std::mem::take(&mut pushed[r]);
            let mut on = Vec::new();
            for term in join.on.conjuncts() {
                let (expr, ty) = self.bind(term, &scope)?;
                expect_boolean(ty, "JOIN ON")?;
                let predicate = Predicate {
                    expr,
                    text: term.to_string(),
                };
                match owner(&predicate.expr, &relations[..=r]) {
                    Some(o) if o == r => filter.push(predicate.shifted(relations[r].offset)),
                    _ => on.push(predicate),
                }
            }
            node = self.plan_join(ctx, node, &relations[r], &defs[r], filter, on)?;
        }

        for predicate in spanning {
            node = PlanNode::Filter {
                input: Box::new(node),
                predicate,
            };
        }
        Ok(node)
    }

    /// Join one relation to `left`: a nested loop over a single inner scan,
    /// or an index lookup per left row when an index on the inner table is
    /// keyed by the join's equalities
    fn plan_join(
        &self,
        ctx: &dyn PlanContext,
        left: PlanNode,
        relation: &Relation,
        def: &TableDef,
        filter: Vec<Predicate>,
        on: Vec<Predicate>,
    ) -> Result<PlanNode> {
        let stats = ctx.statistics(&def.name)?;
        let outer = left.estimate().unwrap_or(Estimate {
            selectivity: 1.0,
            rows: 0.0,
            cost: 0.0,
            table_rows: 0.0,
        });
        let inner_rows = stats.row_count as f64;
        let inner_selectivity = filter_selectivity(filter.iter().map(|p| &p.expr), &stats);

        // outer column = inner column
        let mut links: Vec<(usize, BoundExpr, usize)> = Vec::new();
        for (i, predicate) in on.iter().enumerate() {
            let BoundExpr::Binary {
                left: l,
                op: BinaryOperator::Eq,
                right: r,
            } = &predicate.expr
            else {
                continue;
            };
            match (l.as_ref(), r.as_ref()) {
                (BoundExpr::Column(a), BoundExpr::Column(b))
                | (BoundExpr::Column(b), BoundExpr::Column(a))
                    if relation.covers(*b) && *a < relation.offset =>
                {
                    links.push((b - relation.offset, BoundExpr::Column(*a), i));
                }
                _ => {}
            }
        }
        let on_selectivity: f64 = (0..on.len())
            .map(|i| match links.iter().find(|link| link.2 == i) {
                Some((column, _, _)) => eq_selectivity(*column, &stats),
                None => DEFAULT_SELECTIVITY,
            })
            .product();
        let rows = outer.rows * inner_rows * inner_selectivity * on_selectivity;

        let inner = self.choose_access(def, ctx.indexes(&def.name), &stats, filter.clone());
        let inner_estimate = inner.estimate().unwrap_or(outer);
        let loop_cost =
            outer.cost + inner_estimate.cost + outer.rows * inner_estimate.rows * SEQ_ROW_COST;

        let terms: Vec<Term> = filter.iter().map(|p| classify(&p.expr)).collect();
        let descent = (inner_rows.max(1.0)).log2() + 1.0;
        let mut best: Option<(f64, String, Vec<BoundExpr>, Vec<String>)> = None;
        for index in ctx.indexes(&def.name) {
            let Ok(positions) = def.column_indices(&index.columns) else {
                continue;
            };
            let mut keys = Vec::new();
            let mut key_text = Vec::new();
            let mut linked = false;
            let mut matched = 1.0;
            for &column in &positions {
                if let Some((_, outer_expr, i)) = links.iter().find(|link| link.0 == column) {
                    keys.push(outer_expr.clone());
                    key_text.push(on[*i].text.clone());
                    linked = true;
                } else if let Some((i, value)) = literal_eq(&terms, column) {
                    keys.push(value);
                    key_text.push(filter[i].text.clone());
                } else {
                    break;
                }
                matched *= eq_selectivity(column, &stats);
            }
            if !linked {
                continue;
            }
            let mut per_lookup = inner_rows * matched;
            if index.unique && keys.len() == positions.len() {
                per_lookup = per_lookup.min(1.0);
            }
            let cost = outer.cost + outer.rows * (descent + per_lookup * INDEX_FETCH_COST);
            if best.as_ref().map_or(true, |b| cost < b.0) {
                best = Some((cost, index.name.clone(), keys, key_text));
            }
        }

        let estimate = |cost| Estimate {
            selectivity: inner_selectivity * on_selectivity,
            rows,
            cost,
            table_rows: inner_rows,
        };
        Ok(match best {
            Some((cost, index, keys, key_text)) if cost < loop_cost => {
                debug!(table = %def.name, index = %index, cost, loop_cost, "chose index nested loop");
                PlanNode::IndexNestedLoop {
                    left: Box::new(left),
                    table: def.name.clone(),
                    index,
                    keys,
                    key_text,
                    filter,
                    on,
                    estimate: estimate(cost),
                }
            }
            _ => {
                debug!(table = %def.name, loop_cost, "chose nested loop");
                PlanNode::NestedLoopJoin {
                    left: Box::new(left),
                    right: Box::new(inner),
                    on,
                    estimate: estimate(loop_cost),
                }
            }
        })
    }

    /// Pick a sequential scan or the cheapest usable index
    fn choose_access(
        &self,
        def: &TableDef,
        indexes: Vec<Arc<IndexDef>>,
        stats: &TableStatistics,
        conjuncts: Vec<Predicate>,
    ) -> PlanNode {
        let rows = stats.row_count as f64;
        let selectivity = filter_selectivity(conjuncts.iter().map(|p| &p.expr), stats);
        let seq_cost = rows * SEQ_ROW_COST;
        let terms: Vec<Term> = conjuncts.iter().map(|p| classify(&p.expr)).collect();

        let mut best: Option<IndexChoice> = None;
        for index in &indexes {
            let Ok(positions) = def.column_indices(&index.columns) else {
                continue;
            };
            let Some(choice) = match_index(index, &positions, &terms, stats) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(current) => {
                    choice.cost < current.cost
                        || (choice.cost == current.cost && choice.matched > current.matched)
                }
            };
            if better {
                best = Some(choice);
            }
        }

        match best {
            Some(choice) if choice.cost < seq_cost => {
                debug!(
                    table = %def.name,
                    index = %choice.index,
                    cost = choice.cost,
                    seq_cost,
                    "chose index scan"
                );
                let mut index_cond = Vec::new();
                let mut residual = Vec::new();
                for (i, predicate) in conjuncts.into_iter().enumerate() {
                    if choice.used.contains(&i) {
                        index_cond.push(predicate);
                    } else {
                        residual.push(predicate);
                    }
                }
                PlanNode::IndexScan {
                    table: def.name.clone(),
                    index: choice.index,
                    eq: choice.eq,
                    range: choice.range,
                    index_cond,
                    residual,
                    estimate: Estimate {
                        selectivity,
                        rows: rows * selectivity,
                        cost: choice.cost,
                        table_rows: rows,
                    },
                }
            }
            _ => {
                debug!(table = %def.name, seq_cost, "chose sequential scan");
                PlanNode::SeqScan {
                    table: def.name.clone(),
                    filter: conjuncts,
                    estimate: Estimate {
                        selectivity,
                        rows: rows * selectivity,
                        cost: seq_cost,
                        table_rows: rows,
                    },
                }
            }
        }
    }

    fn bind(&mut self, expr: &Expr, scope: &Scope) -> Result<Typed> {
        if let Scope::Grouped {
            keys,
            key_types,
            aggregates,
            aggregate_types,
        } = scope
        {
            if let Some(i) = keys.iter().position(|k| k == expr) {
                return Ok((BoundExpr::Column(i), key_types[i]));
            }
            if let Expr::Aggregate { .. } = expr {
                let j = aggregates.iter().position(|a| a == expr).ok_or_else(|| {
                    Error::Internal(format!("aggregate {} was not collected", expr))
                })?;
                return Ok((BoundExpr::Column(keys.len() + j), aggregate_types[j]));
            }
        }

        match expr {
            Expr::Column(name) => scope.column(name),
            Expr::Outer(name) => self.bind_outer(name),
            Expr::Literal(value) => Ok((BoundExpr::Literal(value.clone()), value.data_type())),
            Expr::BinaryOp { left, op, right } => {
                let (l, lt) = self.bind(left, scope)?;
                let (r, rt) = self.bind(right, scope)?;
                let ty = binary_type(*op, lt, rt)?;
                Ok((
                    BoundExpr::Binary {
                        left: Box::new(l),
                        op: *op,
                        right: Box::new(r),
                    },
                    ty,
                ))
            }
            Expr::UnaryOp { op, expr } => {
                let (inner, ty) = self.bind(expr, scope)?;
                let ty = match op {
                    UnaryOperator::Not => {
                        expect_boolean(ty, "NOT")?;
                        Some(DataType::Boolean)
                    }
                    UnaryOperator::Minus => match ty {
                        Some(t) if !t.is_numeric() => {
                            return Err(Error::InvalidPredicate(format!("cannot negate {}", t)))
                        }
                        ty => ty,
                    },
                };
                Ok((
                    BoundExpr::Unary {
                        op: *op,
                        expr: Box::new(inner),
                    },
                    ty,
                ))
            }
            Expr::IsNull { expr, negated } => {
                let (inner, _) = self.bind(expr, scope)?;
                Ok((
                    BoundExpr::IsNull {
                        expr: Box::new(inner),
                        negated: *negated,
                    },
                    Some(DataType::Boolean),
                ))
            }
            Expr::Like {
                expr,
                pattern,
                escape,
                negated,
            } => {
                let (inner, ty) = self.bind(expr, scope)?;
                let (pat, pty) = self.bind(pattern, scope)?;
                for t in [ty, pty].into_iter().flatten() {
                    if t != DataType::Text {
                        return Err(Error::InvalidPredicate(format!(
                            "LIKE applies to text, not {}",
                            t
                        )));
                    }
                }
                Ok((
                    BoundExpr::Like {
                        expr: Box::new(inner),
                        pattern: Box::new(pat),
                        escape: *escape,
                        negated: *negated,
                    },
                    Some(DataType::Boolean),
                ))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let (inner, ty) = self.bind(expr, scope)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    let (bound, ity) = self.bind(item, scope)?;
                    check_comparable(ty, ity)?;
                    items.push(bound);
                }
                Ok((
                    BoundExpr::InList {
                        expr: Box::new(inner),
                        list: items,
                        negated: *negated,
                    },
                    Some(DataType::Boolean),
                ))
            }
            Expr::Exists { query, negated } => {
                let (subplan, _) = self.plan_subquery(query, scope)?;
                Ok((
                    BoundExpr::Exists {
                        subplan,
                        negated: *negated,
                    },
                    Some(DataType::Boolean),
                ))
            }
            Expr::InSubquery {
                expr,
                query,
                negated,
            } => {
                let (inner, ty) = self.bind(expr, scope)?;
                let (subplan, types) = self.plan_subquery(query, scope)?;
                let [sty] = types.as_slice() else {
                    return Err(Error::InvalidPredicate(
                        "IN subquery must return exactly one column".to_string(),
                    ));
                };
                check_comparable(ty, *sty)?;
                Ok((
                    BoundExpr::InSubquery {
                        expr: Box::new(inner),
                        subplan,
                        negated: *negated,
                    },
                    Some(DataType::Boolean),
                ))
            }
            Expr::ScalarSubquery(query) => {
                let (subplan, types) = self.plan_subquery(query, scope)?;
                let [ty] = types.as_slice() else {
                    return Err(Error::InvalidPredicate(
                        "scalar subquery must return exactly one column".to_string(),
                    ));
                };
                Ok((BoundExpr::Scalar(subplan), *ty))
            }
            Expr::Aggregate { .. } => Err(Error::InvalidPredicate(format!(
                "aggregate {} is not allowed here",
                expr
            ))),
        }
    }

    fn bind_outer(&mut self, name: &str) -> Result<Typed> {
        if let Some(i) = self.params.iter().position(|(n, _, _)| n == name) {
            return Ok((BoundExpr::Param(i), self.params[i].2));
        }
        let parent = self.parent.ok_or_else(|| {
            Error::InvalidPredicate(format!("outer reference '{}' outside a subquery", name))
        })?;
        let (expr, ty) = parent.column(name)?;
        self.params.push((name.to_string(), expr, ty));
        Ok((BoundExpr::Param(self.params.len() - 1), ty))
    }

    fn plan_subquery(
        &mut self,
        query: &Query,
        scope: &Scope,
    ) -> Result<(usize, Vec<Option<DataType>>)> {
        let ctx = self
            .ctx
            .ok_or_else(|| Error::InvalidPredicate("subqueries are not allowed here".to_string()))?;
        let mut child = Planner::nested(ctx, scope);
        let plan = child.build(query)?;
        let params: Vec<BoundExpr> = child.params.into_iter().map(|(_, e, _)| e).collect();
        let types = plan.types.clone();
        self.subplans.push(SubPlan {
            correlated: !params.is_empty(),
            plan,
            params,
        });
        Ok((self.subplans.len() - 1, types))
    }
}

/// Bind an expression over one table's row, without subqueries. Used for
/// CHECK constraints and UPDATE assignments.
pub fn bind_row_expr(def: &TableDef, expr: &Expr) -> Result<(BoundExpr, Option<DataType>)> {
    let scope = Scope::for_table(def);
    let mut planner = Planner {
        ctx: None,
        parent: None,
        params: Vec::new(),
        subplans: Vec::new(),
    };
    planner.bind(expr, &scope)
}

fn expect_boolean(ty: Option<DataType>, clause: &str) -> Result<()> {
    match ty {
        None | Some(DataType::Boolean) => Ok(()),
        Some(other) => Err(Error::InvalidPredicate(format!(
            "{} expects a boolean, got {}",
            clause, other
        ))),
    }
}

fn check_comparable(left: Option<DataType>, right: Option<DataType>) -> Result<()> {
    match (left, right) {
        (Some(l), Some(r)) if !l.is_comparable_with(&r) => Err(Error::InvalidPredicate(format!(
            "cannot compare {} with {}",
            l, r
        ))),
        _ => Ok(()),
    }
}

fn binary_type(
    op: BinaryOperator,
    left: Option<DataType>,
    right: Option<DataType>,
) -> Result<Option<DataType>> {
    use BinaryOperator::*;
    let mismatch = |l: DataType, r: DataType| {
        Err(Error::InvalidPredicate(format!(
            "operator {:?} does not apply to {} and {}",
            op, l, r
        )))
    };
    match op {
        Eq | Neq | Lt | Gt | Lte | Gte => {
            check_comparable(left, right)?;
            Ok(Some(DataType::Boolean))
        }
        And | Or => {
            expect_boolean(left, "AND/OR")?;
            expect_boolean(right, "AND/OR")?;
            Ok(Some(DataType::Boolean))
        }
        Concat => match (left, right) {
            (Some(l), Some(r)) if l != DataType::Text || r != DataType::Text => mismatch(l, r),
            _ => Ok(Some(DataType::Text)),
        },
        Add | Sub | Mul | Div | Mod => {
            let (Some(l), Some(r)) = (left, right) else {
                return Ok(left.or(right).filter(|t| t.is_numeric()));
            };
            match (l, r) {
                (DataType::Integer, DataType::Integer) => Ok(Some(DataType::Integer)),
                (a, b) if a.is_numeric() && b.is_numeric() && op != Mod => Ok(Some(
                    DataType::Decimal(18, a.scale().max(b.scale())),
                )),
                (DataType::Date, DataType::Integer) if matches!(op, Add | Sub) => {
                    Ok(Some(DataType::Date))
                }
                (DataType::Date, DataType::Date) if op == Sub => Ok(Some(DataType::Integer)),
                (a, b) => mismatch(a, b),
            }
        }
    }
}

fn aggregate_type(func: AggregateFunc, arg: Option<DataType>) -> Result<Option<DataType>> {
    match func {
        AggregateFunc::CountStar | AggregateFunc::Count => Ok(Some(DataType::Integer)),
        AggregateFunc::Sum | AggregateFunc::Avg => match arg {
            Some(t) if !t.is_numeric() => Err(Error::InvalidPredicate(format!(
                "{} expects a numeric argument, got {}",
                func, t
            ))),
            Some(DataType::Integer) if func == AggregateFunc::Sum => Ok(Some(DataType::Integer)),
            Some(t) => Ok(Some(DataType::Decimal(18, t.scale().max(4)))),
            None => Ok(None),
        },
        AggregateFunc::Min | AggregateFunc::Max => Ok(arg),
    }
}

/// Collect aggregate calls outside subqueries, without duplicates
fn collect_aggregates(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Aggregate { .. } => {
            if !out.contains(expr) {
                out.push(expr.clone());
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_aggregates(left, out);
            collect_aggregates(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::IsNull { expr, .. } => collect_aggregates(expr, out),
        Expr::Like { expr, pattern, .. } => {
            collect_aggregates(expr, out);
            collect_aggregates(pattern, out);
        }
        Expr::InList { expr, list, .. } => {
            collect_aggregates(expr, out);
            for item in list {
                collect_aggregates(item, out);
            }
        }
        Expr::InSubquery { expr, .. } => collect_aggregates(expr, out),
        _ => {}
    }
}

/// Shape of one WHERE conjunct, as far as index matching cares
#[derive(Debug, Clone)]
enum Term {
    Eq(usize, BoundExpr),
    Range(usize, BinaryOperator, BoundExpr),
    Other,
}

fn classify(expr: &BoundExpr) -> Term {
    let BoundExpr::Binary { left, op, right } = expr else {
        return Term::Other;
    };
    let (column, op, value) = match (left.as_ref(), right.as_ref()) {
        (BoundExpr::Column(c), v) if v.is_row_independent() => (*c, *op, v),
        (v, BoundExpr::Column(c)) if v.is_row_independent() => (*c, op.flip(), v),
        _ => return Term::Other,
    };
    match op {
        BinaryOperator::Eq => Term::Eq(column, value.clone()),
        BinaryOperator::Lt | BinaryOperator::Lte | BinaryOperator::Gt | BinaryOperator::Gte => {
            Term::Range(column, op, value.clone())
        }
        _ => Term::Other,
    }
}

/// First equality conjunct binding `column` to a literal or parameter
fn literal_eq(terms: &[Term], column: usize) -> Option<(usize, BoundExpr)> {
    terms.iter().enumerate().find_map(|(i, t)| match t {
        Term::Eq(c, v) if *c == column => Some((i, v.clone())),
        _ => None,
    })
}

fn eq_selectivity(column: usize, stats: &TableStatistics) -> f64 {
    stats
        .distinct(column)
        .map_or(DEFAULT_EQ_SELECTIVITY, |d| 1.0 / d as f64)
}

/// Estimated fraction of rows for which `expr` is true
pub fn selectivity(expr: &BoundExpr, stats: &TableStatistics) -> f64 {
    let estimate = match expr {
        BoundExpr::Literal(Value::Boolean(true)) => 1.0,
        BoundExpr::Literal(_) => 0.0,
        BoundExpr::Binary {
            left,
            op: BinaryOperator::And,
            right,
        } => selectivity(left, stats) * selectivity(right, stats),
        BoundExpr::Binary {
            left,
            op: BinaryOperator::Or,
            right,
        } => {
            let a = selectivity(left, stats);
            let b = selectivity(right, stats);
            a + b - a * b
        }
        BoundExpr::Unary {
            op: UnaryOperator::Not,
            expr,
        } => 1.0 - selectivity(expr, stats),
        BoundExpr::Binary { left, op, right } if op.is_comparison() => {
            let column = match (left.as_ref(), right.as_ref()) {
                (BoundExpr::Column(c), v) | (v, BoundExpr::Column(c)) if v.is_row_independent() => {
                    Some(*c)
                }
                _ => None,
            };
            match (op, column) {
                (BinaryOperator::Eq, Some(c)) => eq_selectivity(c, stats),
                (BinaryOperator::Eq, None) => DEFAULT_EQ_SELECTIVITY,
                (BinaryOperator::Neq, Some(c)) => 1.0 - eq_selectivity(c, stats),
                (BinaryOperator::Neq, None) => 1.0 - DEFAULT_EQ_SELECTIVITY,
                _ => RANGE_SELECTIVITY,
            }
        }
        BoundExpr::IsNull { expr, negated } => {
            let fraction = match expr.as_ref() {
                BoundExpr::Column(c) => stats.null_fraction(*c).unwrap_or(DEFAULT_NULL_FRACTION),
                _ => DEFAULT_NULL_FRACTION,
            };
            if *negated {
                1.0 - fraction
            } else {
                fraction
            }
        }
        BoundExpr::Like { negated, .. } => {
            if *negated {
                1.0 - LIKE_SELECTIVITY
            } else {
                LIKE_SELECTIVITY
            }
        }
        BoundExpr::InList {
            expr,
            list,
            negated,
        } => {
            let each = match expr.as_ref() {
                BoundExpr::Column(c) => eq_selectivity(*c, stats),
                _ => DEFAULT_EQ_SELECTIVITY,
            };
            let s = (each * list.len() as f64).min(1.0);
            if *negated {
                1.0 - s
            } else {
                s
            }
        }
        _ => DEFAULT_SELECTIVITY,
    };
    estimate.clamp(0.0, 1.0)
}

/// Combined selectivity of a conjunction. Lower and upper bounds on the
/// same column count once, as a bounded range.
pub fn filter_selectivity<'e>(
    conjuncts: impl IntoIterator<Item = &'e BoundExpr>,
    stats: &TableStatistics,
) -> f64 {
    let mut total = 1.0;
    let mut ranges: Vec<(usize, bool, bool)> = Vec::new();
    for expr in conjuncts {
        match classify(expr) {
            Term::Range(column, op, _) => {
                let lower = matches!(op, BinaryOperator::Gt | BinaryOperator::Gte);
                match ranges.iter_mut().find(|(c, _, _)| *c == column) {
                    Some(entry) if lower => entry.1 = true,
                    Some(entry) => entry.2 = true,
                    None => ranges.push((column, lower, !lower)),
                }
            }
            _ => total *= selectivity(expr, stats),
        }
    }
    for (_, lower, upper) in ranges {
        total *= if lower && upper {
            BOUNDED_RANGE_SELECTIVITY
        } else {
            RANGE_SELECTIVITY
        };
    }
    total
}

struct IndexChoice {
    index: String,
    eq: Vec<BoundExpr>,
    range: Option<RangeBounds>,
    /// Conjuncts answered by the index
    used: Vec<usize>,
    matched: usize,
    cost: f64,
}

/// Match equality conjuncts against the index's leading columns, then an
/// optional range on the next column
fn match_index(
    index: &IndexDef,
    positions: &[usize],
    terms: &[Term],
    stats: &TableStatistics,
) -> Option<IndexChoice> {
    let mut eq = Vec::new();
    let mut used = Vec::new();
    let mut selectivity = 1.0;

    for &column in positions {
        let found = terms.iter().enumerate().find_map(|(i, t)| match t {
            Term::Eq(c, v) if *c == column => Some((i, v.clone())),
            _ => None,
        });
        let Some((i, value)) = found else {
            break;
        };
        eq.push(value);
        used.push(i);
        selectivity *= eq_selectivity(column, stats);
    }

    let mut range = None;
    if let Some(&next) = positions.get(eq.len()) {
        let mut lower = Bound::Unbounded;
        let mut upper = Bound::Unbounded;
        for (i, term) in terms.iter().enumerate() {
            let Term::Range(c, op, v) = term else {
                continue;
            };
            if *c != next {
                continue;
            }
            match op {
                BinaryOperator::Gt if matches!(lower, Bound::Unbounded) => {
                    lower = Bound::Excluded(v.clone())
                }
                BinaryOperator::Gte if matches!(lower, Bound::Unbounded) => {
                    lower = Bound::Included(v.clone())
                }
                BinaryOperator::Lt if matches!(upper, Bound::Unbounded) => {
                    upper = Bound::Excluded(v.clone())
                }
                BinaryOperator::Lte if matches!(upper, Bound::Unbounded) => {
                    upper = Bound::Included(v.clone())
                }
                _ => continue,
            }
            used.push(i);
        }
        let bounded = |b: &Bound<BoundExpr>| !matches!(b, Bound::Unbounded);
        match (bounded(&lower), bounded(&upper)) {
            (true, true) => selectivity *= BOUNDED_RANGE_SELECTIVITY,
            (true, false) | (false, true) => selectivity *= RANGE_SELECTIVITY,
            (false, false) => {}
        }
        if bounded(&lower) || bounded(&upper) {
            range = Some(RangeBounds { lower, upper });
        }
    }

    if eq.is_empty() && range.is_none() {
        return None;
    }

    let n = stats.row_count as f64;
    let mut rows = n * selectivity;
    if index.unique && eq.len() == positions.len() {
        rows = rows.min(1.0);
    }
    let descent = (n.max(1.0)).log2() + 1.0;
    Some(IndexChoice {
        index: index.name.clone(),
        matched: eq.len() + usize::from(range.is_some()),
        eq,
        range,
        used,
        cost: descent + rows * INDEX_FETCH_COST,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, ColumnStats, TableBuilder};

    struct TestContext {
        catalog: Catalog,
        stats: TableStatistics,
    }

    impl PlanContext for TestContext {
        fn table(&self, name: &str) -> Result<Arc<TableDef>> {
            self.catalog.get_table(name)
        }

        fn indexes(&self, table: &str) -> Vec<Arc<IndexDef>> {
            self.catalog.get_table_indexes(table)
        }

        fn statistics(&self, _table: &str) -> Result<TableStatistics> {
            Ok(self.stats.clone())
        }
    }

    /// 1000 employees over 5 departments, indexed on department
    fn employees() -> TestContext {
        let catalog = Catalog::new();
        catalog
            .create_table(
                TableBuilder::new("employees")
                    .primary_key("id")
                    .column("name", DataType::Text)
                    .column("department", DataType::Text)
                    .column("level", DataType::Integer)
                    .build(),
            )
            .unwrap();
        catalog
            .create_index(
                "idx_emp_dept",
                "employees",
                vec!["department".into(), "level".into()],
                false,
            )
            .unwrap();
        let column = |distinct| ColumnStats {
            distinct,
            nulls: 0,
            min: None,
            max: None,
        };
        TestContext {
            catalog,
            stats: TableStatistics {
                row_count: 1000,
                columns: vec![column(1000), column(900), column(5), column(10)],
                modifications: 0,
            },
        }
    }

    #[test]
    fn test_equality_uses_index() {
        let ctx = employees();
        let query = Query::from("employees")
            .filter(Expr::col("department").eq(Expr::lit("Engineering")));
        let explain = Planner::new(&ctx).explain(&query).unwrap();

        assert_eq!(explain.index_name(), Some("idx_emp_dept"));
        assert!((explain.selectivity - 0.2).abs() < 1e-9);
        assert!((explain.estimated_rows - 200.0).abs() < 1e-9);
        assert!(explain.cost < explain.seq_scan_cost);
        assert!(explain.to_string().contains("Index Scan using idx_emp_dept"));
    }

    #[test]
    fn test_broad_predicates_scan_sequentially() {
        let ctx = employees();
        for filter in [
            Expr::col("department").neq(Expr::lit("Engineering")),
            Expr::col("department").is_not_null(),
            Expr::col("name").like("A%"),
        ] {
            let explain = Planner::new(&ctx)
                .explain(&Query::from("employees").filter(filter))
                .unwrap();
            assert_eq!(explain.access, AccessPath::SeqScan);
        }
    }

    #[test]
    fn test_primary_key_lookup_beats_secondary() {
        let ctx = employees();
        let query = Query::from("employees")
            .filter(Expr::col("id").eq(Expr::lit(7)))
            .filter(Expr::col("department").eq(Expr::lit("Sales")));
        let explain = Planner::new(&ctx).explain(&query).unwrap();
        assert_eq!(explain.index_name(), Some("employees_pkey"));

        let PlanNode::IndexScan { residual, .. } = explain.plan.scan() else {
            panic!("expected an index scan");
        };
        assert_eq!(residual.len(), 1);
    }

    #[test]
    fn test_composite_prefix_and_range() {
        let ctx = employees();
        let query = Query::from("employees")
            .filter(Expr::col("department").eq(Expr::lit("Sales")))
            .filter(Expr::col("level").gt(Expr::lit(2)))
            .filter(Expr::col("level").lte(Expr::lit(8)));
        let plan = Planner::new(&ctx).plan(&query).unwrap();
        let PlanNode::IndexScan {
            eq,
            range,
            index_cond,
            estimate,
            ..
        } = plan.scan()
        else {
            panic!("expected an index scan");
        };
        assert_eq!(eq.len(), 1);
        assert!(range.is_some());
        assert_eq!(index_cond.len(), 3);
        // 1/5 for the department, 1/4 for the two-sided range
        assert!((estimate.selectivity - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_selectivity_rules() {
        let ctx = employees();
        let def = ctx.catalog.get_table("employees").unwrap();
        let sel = |expr: Expr| {
            let (bound, _) = bind_row_expr(&def, &expr).unwrap();
            selectivity(&bound, &ctx.stats)
        };
        assert!((sel(Expr::col("department").eq(Expr::lit("x"))) - 0.2).abs() < 1e-9);
        assert!((sel(Expr::col("department").neq(Expr::lit("x"))) - 0.8).abs() < 1e-9);
        assert!((sel(Expr::col("level").gt(Expr::lit(1))) - 1.0 / 3.0).abs() < 1e-9);
        assert!((sel(Expr::col("name").like("a%")) - 0.1).abs() < 1e-9);
        assert!(sel(Expr::col("name").is_null()).abs() < 1e-9);
        let either = Expr::col("department")
            .eq(Expr::lit("a"))
            .or(Expr::col("department").eq(Expr::lit("b")));
        assert!((sel(either) - 0.36).abs() < 1e-9);
    }

    #[test]
    fn test_type_errors_rejected_before_execution() {
        let ctx = employees();
        let query = Query::from("employees").filter(Expr::col("level").eq(Expr::lit("high")));
        assert!(matches!(
            Planner::new(&ctx).plan(&query),
            Err(Error::InvalidPredicate(_))
        ));

        let query = Query::from("employees").filter(Expr::col("level").add(Expr::lit(1)));
        assert!(matches!(
            Planner::new(&ctx).plan(&query),
            Err(Error::InvalidPredicate(_))
        ));

        let query = Query::from("employees").filter(Expr::col("salary").eq(Expr::lit(1)));
        assert!(matches!(
            Planner::new(&ctx).plan(&query),
            Err(Error::ColumnNotFound(_, _))
        ));
    }

    #[test]
    fn test_correlated_subquery_becomes_parameterized_subplan() {
        let ctx = employees();
        let peers = Query::from("employees")
            .select(vec![Expr::col("id")])
            .filter(Expr::col("department").eq(Expr::outer("department")))
            .filter(Expr::col("level").gt(Expr::outer("level")));
        let query = Query::from("employees").filter(Expr::not_exists(peers));
        let plan = Planner::new(&ctx).plan(&query).unwrap();

        assert_eq!(plan.subplans.len(), 1);
        let sub = &plan.subplans[0];
        assert!(sub.correlated);
        assert_eq!(sub.params, vec![BoundExpr::Column(2), BoundExpr::Column(3)]);
        // the parameter feeds the inner index lookup
        assert!(matches!(sub.plan.scan(), PlanNode::IndexScan { .. }));
        assert!(plan.to_string().contains("SubPlan 0 (correlated"));
    }

    #[test]
    fn test_uncorrelated_subquery() {
        let ctx = employees();
        let top = Query::from("employees").select(vec![Expr::max(Expr::col("level"))]);
        let query = Query::from("employees").filter(Expr::col("level").eq(Expr::scalar(top)));
        let plan = Planner::new(&ctx).plan(&query).unwrap();
        assert!(!plan.subplans[0].correlated);

        let stray = Query::from("employees").filter(Expr::col("id").eq(Expr::outer("id")));
        assert!(matches!(
            Planner::new(&ctx).plan(&stray),
            Err(Error::InvalidPredicate(_))
        ));
    }

    #[test]
    fn test_grouping_rules() {
        let ctx = employees();
        let query = Query::from("employees")
            .select(vec![Expr::col("department"), Expr::count_star()])
            .group_by(vec![Expr::col("department")])
            .having(Expr::count_star().gt(Expr::lit(1)))
            .order_by_desc(Expr::count_star());
        let plan = Planner::new(&ctx).plan(&query).unwrap();
        assert_eq!(plan.columns, vec!["department", "COUNT(*)"]);

        let bad = Query::from("employees")
            .select(vec![Expr::col("name"), Expr::count_star()])
            .group_by(vec![Expr::col("department")]);
        assert!(matches!(
            Planner::new(&ctx).plan(&bad),
            Err(Error::InvalidPredicate(_))
        ));
    }
    /// `employees` plus a `reviews` table keyed by employee
    fn with_reviews() -> TestContext {
        let ctx = employees();
        ctx.catalog
            .create_table(
                TableBuilder::new("reviews")
                    .primary_key("id")
                    .column("employee_id", DataType::Integer)
                    .column("score", DataType::Integer)
                    .build(),
            )
            .unwrap();
        ctx
    }

    #[test]
    fn test_join_on_primary_key_uses_index_nested_loop() {
        let ctx = with_reviews();
        let query = Query::from("reviews")
            .alias("r")
            .join_as(
                "employees",
                "e",
                Expr::col("r.employee_id").eq(Expr::col("e.id")),
            )
            .filter(Expr::col("e.department").eq(Expr::lit("Sales")))
            .select(vec![Expr::col("e.name"), Expr::col("score")]);
        let explain = Planner::new(&ctx).explain(&query).unwrap();

        assert_eq!(
            explain.joins,
            vec![JoinMethod::IndexNestedLoop {
                table: "employees".to_string(),
                index: "employees_pkey".to_string(),
            }]
        );
        assert_eq!(explain.plan.table, "reviews");
        assert_eq!(explain.plan.columns, vec!["e.name", "score"]);

        let PlanNode::IndexNestedLoop {
            keys, filter, on, ..
        } = explain.plan.root.input().unwrap()
        else {
            panic!("expected an index nested loop under the projection");
        };
        // reviews occupies positions 0..3, so e.department is column 2 of employees
        assert!(matches!(keys.as_slice(), [BoundExpr::Column(1)]));
        assert_eq!(filter.len(), 1);
        assert!(matches!(
            &filter[0].expr,
            BoundExpr::Binary { left, .. } if matches!(left.as_ref(), BoundExpr::Column(2))
        ));
        assert_eq!(on.len(), 1);

        let text = explain.to_string();
        assert!(text.contains("Index Nested Loop using employees_pkey on employees"));
        assert!(text.contains("Index Cond: r.employee_id = e.id"));
    }

    #[test]
    fn test_join_without_usable_index_loops() {
        let ctx = with_reviews();
        let query = Query::from("employees").join(
            "reviews",
            Expr::col("employees.level").lt(Expr::col("reviews.score")),
        );
        let plan = Planner::new(&ctx).plan(&query).unwrap();
        assert_eq!(
            plan.root.joins(),
            vec![JoinMethod::NestedLoop {
                table: "reviews".to_string()
            }]
        );
        // an empty select list expands to every qualified column
        assert_eq!(plan.columns.len(), 7);
        assert_eq!(plan.columns[0], "employees.id");
        assert_eq!(plan.columns[4], "reviews.id");
    }

    #[test]
    fn test_join_name_resolution() {
        let ctx = with_reviews();
        let ambiguous = Query::from("reviews")
            .join("employees", Expr::col("employee_id").eq(Expr::col("employees.id")))
            .filter(Expr::col("id").eq(Expr::lit(1)));
        assert!(matches!(
            Planner::new(&ctx).plan(&ambiguous),
            Err(Error::InvalidPredicate(msg)) if msg.contains("ambiguous")
        ));

        let unknown_alias = Query::from("reviews")
            .join("employees", Expr::col("employee_id").eq(Expr::col("x.id")));
        assert!(matches!(
            Planner::new(&ctx).plan(&unknown_alias),
            Err(Error::ColumnNotFound(_, _))
        ));

        let twice = Query::from("employees").join("employees", Expr::lit(true));
        assert!(matches!(
            Planner::new(&ctx).plan(&twice),
            Err(Error::InvalidPredicate(_))
        ));
    }
}
