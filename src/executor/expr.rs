//! Expression trees
//!
//! Callers hand the engine already-parsed expressions. Column references
//! are resolved by name against the queried table; `Outer` references reach
//! the row of the enclosing query from inside a subquery.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::query::Query;
use crate::error::{Error, Result};
use crate::storage::Value;

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    // Logical
    And,
    Or,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // String
    Concat,
}

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::Neq
                | BinaryOperator::Lt
                | BinaryOperator::Gt
                | BinaryOperator::Lte
                | BinaryOperator::Gte
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }

    /// The operator with its operands swapped (`a < b` == `b > a`)
    pub fn flip(&self) -> BinaryOperator {
        match self {
            BinaryOperator::Lt => BinaryOperator::Gt,
            BinaryOperator::Gt => BinaryOperator::Lt,
            BinaryOperator::Lte => BinaryOperator::Gte,
            BinaryOperator::Gte => BinaryOperator::Lte,
            op => *op,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Eq => "=",
            BinaryOperator::Neq => "<>",
            BinaryOperator::Lt => "<",
            BinaryOperator::Gt => ">",
            BinaryOperator::Lte => "<=",
            BinaryOperator::Gte => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Mod => "%",
            BinaryOperator::Concat => "||",
        }
    }
}

/// Unary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOperator {
    /// NOT
    Not,
    /// - (negation)
    Minus,
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunc {
    /// COUNT(*)
    CountStar,
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunc::CountStar | AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        };
        f.write_str(name)
    }
}

/// An expression over the columns of one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column of the current row
    Column(String),
    /// Column of the enclosing query's current row (correlation)
    Outer(String),
    /// Literal value
    Literal(Value),
    /// Binary operation
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    /// Unary operation
    UnaryOp { op: UnaryOperator, expr: Box<Expr> },
    /// IS [NOT] NULL
    IsNull { expr: Box<Expr>, negated: bool },
    /// [NOT] LIKE with `%`, `_` and an escape character
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        escape: char,
        negated: bool,
    },
    /// [NOT] IN (list)
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    /// [NOT] EXISTS (subquery)
    Exists { query: Box<Query>, negated: bool },
    /// [NOT] IN (subquery)
    InSubquery {
        expr: Box<Expr>,
        query: Box<Query>,
        negated: bool,
    },
    /// Subquery producing at most one value
    ScalarSubquery(Box<Query>),
    /// Aggregate call; only valid in projections, HAVING and ORDER BY
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
    },
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Column(name.into())
    }

    pub fn outer(name: impl Into<String>) -> Expr {
        Expr::Outer(name.into())
    }

    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn null() -> Expr {
        Expr::Literal(Value::Null)
    }

    pub fn binary(left: Expr, op: BinaryOperator, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Eq, other)
    }

    pub fn neq(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Neq, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Lt, other)
    }

    pub fn lte(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Lte, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Gt, other)
    }

    pub fn gte(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Gte, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::And, other)
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Or, other)
    }

    pub fn add(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Add, other)
    }

    pub fn sub(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Sub, other)
    }

    pub fn mul(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Mul, other)
    }

    pub fn div(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOperator::Div, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: Box::new(self),
        }
    }

    pub fn neg(self) -> Expr {
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr: Box::new(self),
        }
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    /// `self LIKE pattern` with `\` as the escape character
    pub fn like(self, pattern: impl Into<String>) -> Expr {
        self.like_escape(pattern, '\\')
    }

    pub fn like_escape(self, pattern: impl Into<String>, escape: char) -> Expr {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(Expr::Literal(Value::Text(pattern.into()))),
            escape,
            negated: false,
        }
    }

    pub fn not_like(self, pattern: impl Into<String>) -> Expr {
        match self.like(pattern) {
            Expr::Like {
                expr,
                pattern,
                escape,
                ..
            } => Expr::Like {
                expr,
                pattern,
                escape,
                negated: true,
            },
            other => other,
        }
    }

    /// `self BETWEEN low AND high`
    pub fn between(self, low: Expr, high: Expr) -> Expr {
        self.clone().gte(low).and(self.lte(high))
    }

    pub fn in_list(self, list: Vec<Expr>) -> Expr {
        Expr::InList {
            expr: Box::new(self),
            list,
            negated: false,
        }
    }

    pub fn not_in_list(self, list: Vec<Expr>) -> Expr {
        Expr::InList {
            expr: Box::new(self),
            list,
            negated: true,
        }
    }

    pub fn exists(query: Query) -> Expr {
        Expr::Exists {
            query: Box::new(query),
            negated: false,
        }
    }

    pub fn not_exists(query: Query) -> Expr {
        Expr::Exists {
            query: Box::new(query),
            negated: true,
        }
    }

    pub fn in_subquery(self, query: Query) -> Expr {
        Expr::InSubquery {
            expr: Box::new(self),
            query: Box::new(query),
            negated: false,
        }
    }

    pub fn not_in_subquery(self, query: Query) -> Expr {
        Expr::InSubquery {
            expr: Box::new(self),
            query: Box::new(query),
            negated: true,
        }
    }

    pub fn scalar(query: Query) -> Expr {
        Expr::ScalarSubquery(Box::new(query))
    }

    pub fn count_star() -> Expr {
        Expr::Aggregate {
            func: AggregateFunc::CountStar,
            arg: None,
        }
    }

    pub fn aggregate(func: AggregateFunc, arg: Expr) -> Expr {
        Expr::Aggregate {
            func,
            arg: Some(Box::new(arg)),
        }
    }

    pub fn count(arg: Expr) -> Expr {
        Expr::aggregate(AggregateFunc::Count, arg)
    }

    pub fn sum(arg: Expr) -> Expr {
        Expr::aggregate(AggregateFunc::Sum, arg)
    }

    pub fn avg(arg: Expr) -> Expr {
        Expr::aggregate(AggregateFunc::Avg, arg)
    }

    pub fn min(arg: Expr) -> Expr {
        Expr::aggregate(AggregateFunc::Min, arg)
    }

    pub fn max(arg: Expr) -> Expr {
        Expr::aggregate(AggregateFunc::Max, arg)
    }

    /// Split a conjunction into its terms
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                let mut terms = left.conjuncts();
                terms.extend(right.conjuncts());
                terms
            }
            other => vec![other],
        }
    }

    /// Whether the expression contains an aggregate call outside subqueries
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::BinaryOp { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Expr::UnaryOp { expr, .. } | Expr::IsNull { expr, .. } => expr.contains_aggregate(),
            Expr::Like { expr, pattern, .. } => {
                expr.contains_aggregate() || pattern.contains_aggregate()
            }
            Expr::InList { expr, list, .. } => {
                expr.contains_aggregate() || list.iter().any(Expr::contains_aggregate)
            }
            Expr::InSubquery { expr, .. } => expr.contains_aggregate(),
            _ => false,
        }
    }
}

fn fmt_literal(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Value::Null => f.write_str("NULL"),
        Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        Value::Date(_) | Value::Timestamp(_) => write!(f, "'{}'", value),
        other => write!(f, "{}", other),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => f.write_str(name),
            Expr::Outer(name) => write!(f, "outer.{}", name),
            Expr::Literal(value) => fmt_literal(value, f),
            Expr::BinaryOp { left, op, right } if op.is_logical() => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::BinaryOp { left, op, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => write!(f, "NOT ({})", expr),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => write!(f, "-{}", expr),
            Expr::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Expr::Like {
                expr,
                pattern,
                escape,
                negated,
            } => {
                write!(f, "{} {}LIKE {}", expr, if *negated { "NOT " } else { "" }, pattern)?;
                if *escape != '\\' {
                    write!(f, " ESCAPE '{}'", escape)?;
                }
                Ok(())
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let items: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                write!(
                    f,
                    "{} {}IN ({})",
                    expr,
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                )
            }
            Expr::Exists { query, negated } => {
                write!(f, "{}EXISTS ({})", if *negated { "NOT " } else { "" }, query)
            }
            Expr::InSubquery {
                expr,
                query,
                negated,
            } => write!(
                f,
                "{} {}IN ({})",
                expr,
                if *negated { "NOT " } else { "" },
                query
            ),
            Expr::ScalarSubquery(query) => write!(f, "({})", query),
            Expr::Aggregate { func, arg: None } => write!(f, "{}(*)", func),
            Expr::Aggregate {
                func,
                arg: Some(arg),
            } => write!(f, "{}({})", func, arg),
        }
    }
}

/// Three-valued logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriBool {
    True,
    False,
    Unknown,
}

impl TriBool {
    /// Interpret a value as a truth value; NULL is unknown
    pub fn from_value(value: &Value) -> Result<TriBool> {
        match value {
            Value::Boolean(true) => Ok(TriBool::True),
            Value::Boolean(false) => Ok(TriBool::False),
            Value::Null => Ok(TriBool::Unknown),
            other => Err(Error::InvalidPredicate(format!(
                "expected a boolean, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn and(self, other: TriBool) -> TriBool {
        match (self, other) {
            (TriBool::False, _) | (_, TriBool::False) => TriBool::False,
            (TriBool::True, TriBool::True) => TriBool::True,
            _ => TriBool::Unknown,
        }
    }

    pub fn or(self, other: TriBool) -> TriBool {
        match (self, other) {
            (TriBool::True, _) | (_, TriBool::True) => TriBool::True,
            (TriBool::False, TriBool::False) => TriBool::False,
            _ => TriBool::Unknown,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> TriBool {
        match self {
            TriBool::True => TriBool::False,
            TriBool::False => TriBool::True,
            TriBool::Unknown => TriBool::Unknown,
        }
    }

    /// WHERE and HAVING keep a row only when true
    pub fn is_true(self) -> bool {
        self == TriBool::True
    }

    /// CHECK rejects a row only when false
    pub fn passes_check(self) -> bool {
        self != TriBool::False
    }

    pub fn into_value(self) -> Value {
        match self {
            TriBool::True => Value::Boolean(true),
            TriBool::False => Value::Boolean(false),
            TriBool::Unknown => Value::Null,
        }
    }
}

impl From<bool> for TriBool {
    fn from(b: bool) -> Self {
        if b {
            TriBool::True
        } else {
            TriBool::False
        }
    }
}

/// Compare two values with SQL semantics: NULL on either side is unknown
pub fn compare_values(op: BinaryOperator, left: &Value, right: &Value) -> Result<TriBool> {
    if left.is_null() || right.is_null() {
        return Ok(TriBool::Unknown);
    }
    let ordering = left.compare(right).ok_or_else(|| {
        Error::InvalidPredicate(format!(
            "cannot compare {} with {}",
            left.type_name(),
            right.type_name()
        ))
    })?;
    let result = match op {
        BinaryOperator::Eq => ordering.is_eq(),
        BinaryOperator::Neq => ordering.is_ne(),
        BinaryOperator::Lt => ordering.is_lt(),
        BinaryOperator::Gt => ordering.is_gt(),
        BinaryOperator::Lte => ordering.is_le(),
        BinaryOperator::Gte => ordering.is_ge(),
        other => {
            return Err(Error::Internal(format!(
                "{} is not a comparison",
                other.symbol()
            )))
        }
    };
    Ok(result.into())
}

/// Apply an arithmetic or string operator
pub fn apply_arithmetic(op: BinaryOperator, left: &Value, right: &Value) -> Result<Value> {
    let overflow = || Error::ExecutionError(format!("{} {} {} overflows", left, op.symbol(), right));
    let mismatch = || {
        Error::InvalidPredicate(format!(
            "operator {} does not apply to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    };
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    // operands that fail despite matching types have overflowed
    let numeric = |v: &Value| matches!(v, Value::Integer(_) | Value::Decimal(_));
    let temporal = matches!(
        (left, right),
        (Value::Date(_), Value::Integer(_)) | (Value::Date(_), Value::Date(_))
    );
    let failed = || {
        if (numeric(left) && numeric(right)) || temporal {
            overflow()
        } else {
            mismatch()
        }
    };
    match op {
        BinaryOperator::Add => left.add(right).ok_or_else(failed),
        BinaryOperator::Sub => left.sub(right).ok_or_else(failed),
        BinaryOperator::Mul => left.mul(right).ok_or_else(failed),
        BinaryOperator::Div => {
            if right.is_zero() {
                return Err(Error::DivisionByZero);
            }
            left.div(right).ok_or_else(failed)
        }
        BinaryOperator::Mod => match (left, right) {
            (Value::Integer(_), Value::Integer(0)) => Err(Error::DivisionByZero),
            (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a.wrapping_rem(*b))),
            _ => Err(mismatch()),
        },
        BinaryOperator::Concat => match (left, right) {
            (Value::Text(a), Value::Text(b)) => Ok(Value::Text(format!("{}{}", a, b))),
            _ => Err(mismatch()),
        },
        _ => Err(Error::Internal(format!("{} is not arithmetic", op.symbol()))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternToken {
    Char(char),
    /// `_`
    One,
    /// `%`
    Many,
}

fn compile_pattern(pattern: &str, escape: char) -> Result<Vec<PatternToken>> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        let token = match c {
            c if c == escape => match chars.next() {
                Some(escaped) => PatternToken::Char(escaped),
                None => {
                    return Err(Error::InvalidPredicate(
                        "LIKE pattern must not end with the escape character".to_string(),
                    ))
                }
            },
            '%' => PatternToken::Many,
            '_' => PatternToken::One,
            c => PatternToken::Char(c),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

/// Match `text` against a LIKE pattern
pub fn like_match(text: &str, pattern: &str, escape: char) -> Result<bool> {
    let tokens = compile_pattern(pattern, escape)?;
    let text: Vec<char> = text.chars().collect();

    // matched[j]: the first i chars of text match the first j tokens
    let mut matched = vec![false; tokens.len() + 1];
    matched[0] = true;
    for (j, token) in tokens.iter().enumerate() {
        matched[j + 1] = matched[j] && *token == PatternToken::Many;
    }

    for ch in &text {
        let mut next = vec![false; tokens.len() + 1];
        for (j, token) in tokens.iter().enumerate() {
            next[j + 1] = match token {
                PatternToken::Many => next[j] || matched[j + 1],
                PatternToken::One => matched[j],
                PatternToken::Char(c) => matched[j] && c == ch,
            };
        }
        matched = next;
    }
    Ok(matched[tokens.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kleene_logic() {
        use TriBool::*;
        assert_eq!(Unknown.and(False), False);
        assert_eq!(Unknown.and(True), Unknown);
        assert_eq!(Unknown.or(True), True);
        assert_eq!(Unknown.or(False), Unknown);
        assert_eq!(Unknown.not(), Unknown);
        assert!(!Unknown.is_true());
        assert!(Unknown.passes_check());
        assert!(!False.passes_check());
    }

    #[test]
    fn test_comparison_with_null_is_unknown() {
        let result = compare_values(BinaryOperator::Eq, &Value::Null, &Value::Null).unwrap();
        assert_eq!(result, TriBool::Unknown);
        let result =
            compare_values(BinaryOperator::Lt, &Value::Integer(1), &Value::decimal(150, 2)).unwrap();
        assert_eq!(result, TriBool::True);
        assert!(matches!(
            compare_values(BinaryOperator::Eq, &Value::Integer(1), &Value::from("1")),
            Err(Error::InvalidPredicate(_))
        ));
    }

    #[test]
    fn test_arithmetic() {
        let sum = apply_arithmetic(BinaryOperator::Add, &Value::Integer(2), &Value::Integer(3));
        assert_eq!(sum.unwrap(), Value::Integer(5));
        assert!(matches!(
            apply_arithmetic(BinaryOperator::Div, &Value::Integer(1), &Value::Integer(0)),
            Err(Error::DivisionByZero)
        ));
        assert!(matches!(
            apply_arithmetic(BinaryOperator::Add, &Value::Integer(i64::MAX), &Value::Integer(1)),
            Err(Error::ExecutionError(_))
        ));
        assert!(matches!(
            apply_arithmetic(BinaryOperator::Add, &Value::from("a"), &Value::Integer(1)),
            Err(Error::InvalidPredicate(_))
        ));
        assert_eq!(
            apply_arithmetic(BinaryOperator::Mul, &Value::Null, &Value::Integer(1)).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_like_patterns() {
        assert!(like_match("thermostat", "therm%", '\\').unwrap());
        assert!(like_match("thermostat", "%stat", '\\').unwrap());
        assert!(like_match("lamp", "l_mp", '\\').unwrap());
        assert!(!like_match("lamp", "l_m", '\\').unwrap());
        assert!(like_match("", "%", '\\').unwrap());
        assert!(like_match("a%b", "a\\%b", '\\').unwrap());
        assert!(!like_match("axb", "a\\%b", '\\').unwrap());
        assert!(like_match("50%", "50!%", '!').unwrap());
        assert!(like_match("under_score", "under!_%", '!').unwrap());
        assert!(matches!(
            like_match("x", "abc\\", '\\'),
            Err(Error::InvalidPredicate(_))
        ));
    }

    #[test]
    fn test_conjuncts_and_display() {
        let expr = Expr::col("department")
            .eq(Expr::lit("Engineering"))
            .and(Expr::col("level").gt(Expr::lit(2)))
            .and(Expr::col("name").like("A%"));
        assert_eq!(expr.conjuncts().len(), 3);
        assert_eq!(
            Expr::col("quantity").gt(Expr::lit(0)).to_string(),
            "quantity > 0"
        );
        assert_eq!(
            Expr::col("name").is_not_null().to_string(),
            "name IS NOT NULL"
        );
        assert!(Expr::count_star().contains_aggregate());
        assert!(!expr.contains_aggregate());
    }
}
