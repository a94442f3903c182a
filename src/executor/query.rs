//! Logical queries and their results

use serde::{Deserialize, Serialize};
use std::fmt;

use super::expr::Expr;
use crate::storage::Value;

/// One output column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectItem {
    /// Name of the output column
    pub fn name(&self) -> String {
        match (&self.alias, &self.expr) {
            (Some(alias), _) => alias.clone(),
            (None, Expr::Column(name)) => name.clone(),
            (None, expr) => expr.to_string(),
        }
    }
}

impl From<Expr> for SelectItem {
    fn from(expr: Expr) -> Self {
        SelectItem { expr, alias: None }
    }
}

/// ORDER BY item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub expr: Expr,
    /// Descending (NULLs last) instead of ascending (NULLs first)
    pub descending: bool,
}

/// Inner join of one more relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub relation: String,
    /// Name columns are qualified with; defaults to the relation name
    pub alias: Option<String>,
    pub on: Expr,
}

impl Join {
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.relation)
    }
}

/// A query over one relation and any number of inner joins. Columns are
/// referenced as `alias.column`, or by bare name when only one relation
/// has that column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub relation: String,
    pub alias: Option<String>,
    pub joins: Vec<Join>,
    pub filter: Option<Expr>,
    /// Empty means every column of every relation
    pub projection: Vec<SelectItem>,
    pub distinct: bool,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn from(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            alias: None,
            joins: Vec::new(),
            filter: None,
            projection: Vec::new(),
            distinct: false,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Name the base relation for qualified column references
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.relation)
    }

    /// Inner join on `on`
    pub fn join(mut self, relation: impl Into<String>, on: Expr) -> Self {
        self.joins.push(Join {
            relation: relation.into(),
            alias: None,
            on,
        });
        self
    }

    pub fn join_as(
        mut self,
        relation: impl Into<String>,
        alias: impl Into<String>,
        on: Expr,
    ) -> Self {
        self.joins.push(Join {
            relation: relation.into(),
            alias: Some(alias.into()),
            on,
        });
        self
    }

    /// Add a WHERE term; repeated calls are ANDed together
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn select(mut self, items: Vec<Expr>) -> Self {
        self.projection = items.into_iter().map(SelectItem::from).collect();
        self
    }

    pub fn select_as(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.projection.push(SelectItem {
            expr,
            alias: Some(alias.into()),
        });
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.having = Some(expr);
        self
    }

    pub fn order_by(mut self, expr: Expr) -> Self {
        self.order_by.push(OrderBy {
            expr,
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, expr: Expr) -> Self {
        self.order_by.push(OrderBy {
            expr,
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the query aggregates (explicitly or through its select list)
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty()
            || self.projection.iter().any(|item| item.expr.contains_aggregate())
            || self.having.is_some()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        if self.projection.is_empty() {
            write!(f, "*")?;
        } else {
            let items: Vec<String> = self
                .projection
                .iter()
                .map(|item| match &item.alias {
                    Some(alias) => format!("{} AS {}", item.expr, alias),
                    None => item.expr.to_string(),
                })
                .collect();
            write!(f, "{}", items.join(", "))?;
        }
        write!(f, " FROM {}", self.relation)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {}", alias)?;
        }
        for join in &self.joins {
            write!(f, " JOIN {}", join.relation)?;
            if let Some(alias) = &join.alias {
                write!(f, " AS {}", alias)?;
            }
            write!(f, " ON {}", join.on)?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {}", filter)?;
        }
        if !self.group_by.is_empty() {
            let keys: Vec<String> = self.group_by.iter().map(|e| e.to_string()).collect();
            write!(f, " GROUP BY {}", keys.join(", "))?;
        }
        if let Some(having) = &self.having {
            write!(f, " HAVING {}", having)?;
        }
        if !self.order_by.is_empty() {
            let keys: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{}{}", o.expr, if o.descending { " DESC" } else { "" }))
                .collect();
            write!(f, " ORDER BY {}", keys.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        Ok(())
    }
}

/// Result of a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one output column
    pub fn column(&self, name: &str) -> Option<Vec<Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// The single value of a one-row, one-column result
    pub fn scalar(&self) -> Option<&Value> {
        match (self.rows.as_slice(), self.columns.len()) {
            ([row], 1) => row.first(),
            _ => None,
        }
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.columns.join(" | "))?;
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(f, "{}", cells.join(" | "))?;
        }
        write!(f, "({} rows)", self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_display() {
        let query = Query::from("devices")
            .filter(Expr::col("room").eq(Expr::lit("kitchen")))
            .filter(Expr::col("power").gt(Expr::lit(10)))
            .select(vec![Expr::col("name")])
            .order_by_desc(Expr::col("power"))
            .limit(5);

        assert_eq!(
            query.to_string(),
            "SELECT name FROM devices WHERE (room = 'kitchen' AND power > 10) ORDER BY power DESC LIMIT 5"
        );
        assert!(!query.is_aggregate());
        assert!(Query::from("t")
            .select(vec![Expr::count_star()])
            .is_aggregate());
    }

    #[test]
    fn test_join_display() {
        let query = Query::from("device_usage")
            .alias("du")
            .join_as("devices", "d", Expr::col("du.device_id").eq(Expr::col("d.id")))
            .select(vec![Expr::col("d.name"), Expr::count_star()])
            .group_by(vec![Expr::col("d.name")]);
        assert_eq!(
            query.to_string(),
            "SELECT d.name, COUNT(*) FROM device_usage AS du JOIN devices AS d ON du.device_id = d.id GROUP BY d.name"
        );
        assert_eq!(query.name(), "du");
        assert_eq!(query.joins[0].name(), "d");
    }

    #[test]
    fn test_result_accessors() {
        let result = QueryResult::new(vec!["n".into()], vec![vec![Value::Integer(3)]]);
        assert_eq!(result.scalar(), Some(&Value::Integer(3)));
        assert_eq!(result.column("n").unwrap(), vec![Value::Integer(3)]);
        assert!(result.column("x").is_none());
    }
}
