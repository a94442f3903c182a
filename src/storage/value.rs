//! Value types for SnapDB
//!
//! This module defines how typed column values are represented in memory,
//! compared, coerced into column types and combined arithmetically.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::catalog::DataType;
use crate::error::{Error, Result};

/// Largest supported decimal scale
pub const MAX_DECIMAL_SCALE: u8 = 18;

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Midnight of `days` in microseconds, wide enough for any date
fn date_micros(days: i32) -> i128 {
    i128::from(days) * i128::from(MICROS_PER_DAY)
}

/// Fixed-point decimal: `units / 10^scale`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Decimal {
    units: i64,
    scale: u8,
}

impl Decimal {
    pub fn new(units: i64, scale: u8) -> Self {
        Self {
            units,
            scale: scale.min(MAX_DECIMAL_SCALE),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self::new(value, 0)
    }

    pub fn units(&self) -> i64 {
        self.units
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Rescale, rounding half away from zero when digits are dropped
    pub fn rescale(&self, scale: u8) -> Option<Decimal> {
        let scale = scale.min(MAX_DECIMAL_SCALE);
        let units = if scale >= self.scale {
            (self.units as i128).checked_mul(pow10(scale - self.scale))?
        } else {
            let div = pow10(self.scale - scale);
            let v = self.units as i128;
            let q = v / div;
            let r = (v % div).abs();
            if r * 2 >= div {
                q + v.signum()
            } else {
                q
            }
        };
        i64::try_from(units).ok().map(|u| Decimal::new(u, scale))
    }

    /// Number of significant integer + fraction digits
    pub fn digits(&self) -> u32 {
        let mut n = self.units.unsigned_abs();
        let mut digits = 1;
        while n >= 10 {
            n /= 10;
            digits += 1;
        }
        digits
    }

    fn widened(&self, scale: u8) -> i128 {
        self.units as i128 * pow10(scale - self.scale)
    }

    fn normalized(&self) -> (i64, u8) {
        let mut units = self.units;
        let mut scale = self.scale;
        while scale > 0 && units % 10 == 0 {
            units /= 10;
            scale -= 1;
        }
        (units, scale)
    }

    pub fn to_f64(&self) -> f64 {
        self.units as f64 / pow10(self.scale) as f64
    }

    fn checked_add(&self, other: &Decimal) -> Option<Decimal> {
        let scale = self.scale.max(other.scale);
        let sum = self.widened(scale).checked_add(other.widened(scale))?;
        i64::try_from(sum).ok().map(|u| Decimal::new(u, scale))
    }

    fn checked_sub(&self, other: &Decimal) -> Option<Decimal> {
        let scale = self.scale.max(other.scale);
        let diff = self.widened(scale).checked_sub(other.widened(scale))?;
        i64::try_from(diff).ok().map(|u| Decimal::new(u, scale))
    }

    fn checked_mul(&self, other: &Decimal) -> Option<Decimal> {
        let product = (self.units as i128).checked_mul(other.units as i128)?;
        let scale = self.scale + other.scale;
        if scale > MAX_DECIMAL_SCALE {
            let d = Decimal {
                units: i64::try_from(product / pow10(scale - MAX_DECIMAL_SCALE)).ok()?,
                scale: MAX_DECIMAL_SCALE,
            };
            return Some(d);
        }
        i64::try_from(product).ok().map(|u| Decimal::new(u, scale))
    }

    fn checked_div(&self, other: &Decimal) -> Option<Decimal> {
        if other.units == 0 {
            return None;
        }
        let scale = (self.scale.max(other.scale) + 4).min(MAX_DECIMAL_SCALE);
        let exp = scale + other.scale - self.scale;
        let numerator = (self.units as i128).checked_mul(pow10(exp))?;
        i64::try_from(numerator / other.units as i128)
            .ok()
            .map(|u| Decimal::new(u, scale))
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Decimal {}

impl Hash for Decimal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        self.widened(scale).cmp(&other.widened(scale))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.units);
        }
        let div = pow10(self.scale);
        let v = self.units as i128;
        let sign = if v < 0 { "-" } else { "" };
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            (v / div).abs(),
            (v % div).abs(),
            width = self.scale as usize
        )
    }
}

fn pow10(exp: u8) -> i128 {
    10i128.pow(exp as u32)
}

/// A value in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean value
    Boolean(bool),
    /// Integer value (64-bit)
    Integer(i64),
    /// Fixed-point decimal value
    Decimal(Decimal),
    /// Text value
    Text(String),
    /// Date value (days since epoch)
    Date(i32),
    /// Timestamp value (microseconds since epoch, UTC)
    Timestamp(i64),
}

// NULL equals NULL here: grouping and DISTINCT rely on it. Predicates go
// through `compare`, which never treats NULL as equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::Integer(v) => v.hash(state),
            Value::Decimal(v) => v.hash(state),
            Value::Text(v) => v.hash(state),
            Value::Date(v) => v.hash(state),
            Value::Timestamp(v) => v.hash(state),
        }
    }
}

impl Value {
    /// Build a date value from a calendar date
    pub fn date(year: i32, month: u32, day: u32) -> Value {
        Value::Date(days_from_civil(year, month, day))
    }

    /// Build a UTC timestamp from calendar parts and a zone offset in minutes
    pub fn timestamp(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
        offset_minutes: i32,
    ) -> Value {
        let days = days_from_civil(year, month, day) as i64;
        let secs = hour as i64 * 3600 + minute as i64 * 60 + second as i64
            - offset_minutes as i64 * 60;
        Value::Timestamp(days * MICROS_PER_DAY + secs * 1_000_000)
    }

    /// Current wall-clock time as a timestamp
    pub fn now() -> Value {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Value::Timestamp(micros)
    }

    /// Build a decimal value
    pub fn decimal(units: i64, scale: u8) -> Value {
        Value::Decimal(Decimal::new(units, scale))
    }

    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to convert to boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Decimal(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    /// Try to borrow as text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Integer(_) => "INTEGER",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMPTZ",
        }
    }

    /// The column type this value naturally belongs to
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Integer(_) => Some(DataType::Integer),
            Value::Decimal(d) => Some(DataType::Decimal(18, d.scale())),
            Value::Text(_) => Some(DataType::Text),
            Value::Date(_) => Some(DataType::Date),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    /// Total order used by indexes and ORDER BY: NULL sorts first.
    /// Returns `None` for incompatible types.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),

            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),

            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Decimal(b)) => Some(Decimal::from_integer(*a).cmp(b)),
            (Value::Decimal(a), Value::Integer(b)) => Some(a.cmp(&Decimal::from_integer(*b))),

            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),

            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Timestamp(b)) => Some(date_micros(*a).cmp(&(*b as i128))),
            (Value::Timestamp(a), Value::Date(b)) => Some((*a as i128).cmp(&date_micros(*b))),

            _ => None,
        }
    }

    /// Coerce a value into a column's declared type
    pub fn coerce_to(self, data_type: DataType, column: &str) -> Result<Value> {
        let mismatch = |v: &Value| Error::TypeMismatch {
            column: column.to_string(),
            expected: data_type.to_string(),
            found: v.type_name().to_string(),
        };
        match (self, data_type) {
            (Value::Null, _) => Ok(Value::Null),
            (v @ Value::Boolean(_), DataType::Boolean) => Ok(v),
            (v @ Value::Integer(_), DataType::Integer) => Ok(v),
            (v @ Value::Text(_), DataType::Text) => Ok(v),
            (v @ Value::Date(_), DataType::Date) => Ok(v),
            (v @ Value::Timestamp(_), DataType::Timestamp) => Ok(v),
            (Value::Date(d), DataType::Timestamp) => i64::from(d)
                .checked_mul(MICROS_PER_DAY)
                .map(Value::Timestamp)
                .ok_or_else(|| Error::TypeMismatch {
                    column: column.to_string(),
                    expected: data_type.to_string(),
                    found: format!("out-of-range date {}", Value::Date(d)),
                }),
            (Value::Integer(i), DataType::Decimal(p, s)) => {
                coerce_decimal(Decimal::from_integer(i), p, s).ok_or_else(|| Error::TypeMismatch {
                    column: column.to_string(),
                    expected: data_type.to_string(),
                    found: format!("out-of-range value {}", i),
                })
            }
            (Value::Decimal(d), DataType::Decimal(p, s)) => {
                coerce_decimal(d, p, s).ok_or_else(|| Error::TypeMismatch {
                    column: column.to_string(),
                    expected: data_type.to_string(),
                    found: format!("out-of-range value {}", d),
                })
            }
            (Value::Decimal(d), DataType::Integer) if d.rescale(0).map(|r| r == d) == Some(true) => {
                Ok(Value::Integer(d.rescale(0).map(|r| r.units()).unwrap_or_default()))
            }
            (v, _) => Err(mismatch(&v)),
        }
    }

    /// Add two values. NULL propagates.
    pub fn add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Some(Value::Null),
            (Value::Integer(a), Value::Integer(b)) => a.checked_add(*b).map(Value::Integer),
            (Value::Date(d), Value::Integer(n)) => i32::try_from(*n)
                .ok()
                .and_then(|n| d.checked_add(n))
                .map(Value::Date),
            _ => decimal_pair(self, other)
                .and_then(|(a, b)| a.checked_add(&b))
                .map(Value::Decimal),
        }
    }

    /// Subtract two values. NULL propagates.
    pub fn sub(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Some(Value::Null),
            (Value::Integer(a), Value::Integer(b)) => a.checked_sub(*b).map(Value::Integer),
            (Value::Date(a), Value::Date(b)) => Some(Value::Integer(i64::from(*a) - i64::from(*b))),
            (Value::Date(d), Value::Integer(n)) => i32::try_from(*n)
                .ok()
                .and_then(|n| d.checked_sub(n))
                .map(Value::Date),
            _ => decimal_pair(self, other)
                .and_then(|(a, b)| a.checked_sub(&b))
                .map(Value::Decimal),
        }
    }

    /// Multiply two values. NULL propagates.
    pub fn mul(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Some(Value::Null),
            (Value::Integer(a), Value::Integer(b)) => a.checked_mul(*b).map(Value::Integer),
            _ => decimal_pair(self, other)
                .and_then(|(a, b)| a.checked_mul(&b))
                .map(Value::Decimal),
        }
    }

    /// Divide two values. NULL propagates; the caller checks for zero.
    pub fn div(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Some(Value::Null),
            (Value::Integer(a), Value::Integer(b)) => a.checked_div(*b).map(Value::Integer),
            _ => decimal_pair(self, other)
                .and_then(|(a, b)| a.checked_div(&b))
                .map(Value::Decimal),
        }
    }

    /// Whether this value is a numeric zero
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Integer(i) => *i == 0,
            Value::Decimal(d) => d.units() == 0,
            _ => false,
        }
    }
}

fn coerce_decimal(d: Decimal, precision: u8, scale: u8) -> Option<Value> {
    let r = d.rescale(scale)?;
    if precision > 0 && r.digits() > precision as u32 {
        return None;
    }
    Some(Value::Decimal(r))
}

fn decimal_pair(a: &Value, b: &Value) -> Option<(Decimal, Decimal)> {
    let lift = |v: &Value| match v {
        Value::Integer(i) => Some(Decimal::from_integer(*i)),
        Value::Decimal(d) => Some(*d),
        _ => None,
    };
    Some((lift(a)?, lift(b)?))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => {
                let (y, m, day) = civil_from_days(*d as i64);
                write!(f, "{:04}-{:02}-{:02}", y, m, day)
            }
            Value::Timestamp(t) => {
                let days = t.div_euclid(MICROS_PER_DAY);
                let rem = t.rem_euclid(MICROS_PER_DAY);
                let (y, m, d) = civil_from_days(days);
                let secs = rem / 1_000_000;
                write!(
                    f,
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}+00",
                    y,
                    m,
                    d,
                    secs / 3600,
                    (secs / 60) % 60,
                    secs % 60,
                    rem % 1_000_000
                )
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

// Howard Hinnant's civil calendar conversions.
fn days_from_civil(year: i32, month: u32, day: u32) -> i32 {
    let y = if month <= 2 { year - 1 } else { year } as i64;
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = month as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    (era * 146_097 + doe - 719_468) as i32
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = yoe + era * 400 + if m <= 2 { 1 } else { 0 };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_comparison() {
        assert_eq!(
            Value::Integer(5).compare(&Value::Integer(3)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::from("abc").compare(&Value::from("def")),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.compare(&Value::Integer(1)), Some(Ordering::Less));
        assert_eq!(
            Value::Integer(2).compare(&Value::decimal(150, 2)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Integer(1).compare(&Value::from("1")), None);
    }

    #[test]
    fn test_null_equality_for_grouping() {
        assert_eq!(Value::Null, Value::Null);
        assert_eq!(Value::decimal(150, 2), Value::decimal(15, 1));
        assert_ne!(Value::Integer(1), Value::Null);
    }

    #[test]
    fn test_value_arithmetic() {
        assert_eq!(
            Value::Integer(5).add(&Value::Integer(3)),
            Some(Value::Integer(8))
        );
        assert_eq!(
            Value::decimal(150, 2).mul(&Value::Integer(2)),
            Some(Value::decimal(300, 2))
        );
        assert_eq!(Value::Integer(1).add(&Value::Null), Some(Value::Null));
        assert_eq!(Value::Integer(7).div(&Value::Integer(2)), Some(Value::Integer(3)));
        assert_eq!(
            Value::decimal(10, 0).div(&Value::decimal(4, 0)),
            Some(Value::decimal(25_000, 4))
        );
    }

    #[test]
    fn test_coercion() {
        let v = Value::Integer(3).coerce_to(DataType::Decimal(6, 2), "price").unwrap();
        assert_eq!(v.to_string(), "3.00");

        let v = Value::decimal(12345, 3)
            .coerce_to(DataType::Decimal(6, 2), "price")
            .unwrap();
        assert_eq!(v.to_string(), "12.35");

        let err = Value::from("x").coerce_to(DataType::Integer, "qty");
        assert!(matches!(err, Err(Error::TypeMismatch { .. })));

        let err = Value::Integer(123_456).coerce_to(DataType::Decimal(4, 2), "price");
        assert!(err.is_err());
    }

    #[test]
    fn test_temporal_display() {
        assert_eq!(Value::date(2024, 3, 1).to_string(), "2024-03-01");
        assert_eq!(
            Value::timestamp(2024, 3, 1, 10, 30, 0, 120).to_string(),
            "2024-03-01 08:30:00.000000+00"
        );
        assert_eq!(
            Value::date(2024, 3, 1).compare(&Value::timestamp(2024, 3, 1, 0, 0, 0, 0)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_date_arithmetic_overflow() {
        assert_eq!(
            Value::Date(0).add(&Value::Integer(4_294_967_296)),
            None
        );
        assert_eq!(Value::Date(i32::MAX).add(&Value::Integer(1)), None);
        assert_eq!(Value::Date(i32::MIN).sub(&Value::Integer(1)), None);
        assert_eq!(
            Value::Date(i32::MAX).sub(&Value::Date(i32::MIN)),
            Some(Value::Integer(i64::from(i32::MAX) - i64::from(i32::MIN)))
        );
        assert_eq!(Value::Date(10).add(&Value::Integer(-3)), Some(Value::Date(7)));
        assert_eq!(Value::Integer(i64::MIN).div(&Value::Integer(-1)), None);

        assert_eq!(
            Value::Date(i32::MAX).compare(&Value::Timestamp(i64::MAX)),
            Some(Ordering::Greater)
        );
        let err = Value::Date(i32::MAX).coerce_to(DataType::Timestamp, "at");
        assert!(matches!(err, Err(Error::TypeMismatch { .. })));
    }
}
