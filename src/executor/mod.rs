//! Query execution module
//!
//! This module contains the expression language, logical queries, the
//! cost-based planner and the executor that runs its plans.

pub mod executor;
pub mod expr;
pub mod planner;
pub mod query;

pub use executor::{evaluate, evaluate_condition, DataSource, Executor, LocatedRow, RowMatcher};
pub use expr::{AggregateFunc, BinaryOperator, Expr, TriBool, UnaryOperator};
pub use planner::{
    bind_row_expr, AccessPath, BoundExpr, Explain, JoinMethod, PlanContext, PlanNode, Planner,
    QueryPlan,
};
pub use query::{Join, OrderBy, Query, QueryResult, SelectItem};
