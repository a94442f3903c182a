//! Data types for SnapDB
//!
//! This module defines the column types supported by the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean type
    Boolean,
    /// 64-bit signed integer
    Integer,
    /// Fixed-point decimal with precision and scale
    Decimal(u8, u8),
    /// Unlimited text
    Text,
    /// Date (days since epoch)
    Date,
    /// Timestamp with time zone, normalized to UTC
    Timestamp,
}

impl DataType {
    /// Check if this type is numeric
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Decimal(_, _))
    }

    /// Check if this type is temporal
    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::Timestamp)
    }

    /// Check if this type is comparable with another type
    pub fn is_comparable_with(&self, other: &DataType) -> bool {
        match (self, other) {
            (a, b) if a == b => true,
            (a, b) if a.is_numeric() && b.is_numeric() => true,
            (a, b) if a.is_temporal() && b.is_temporal() => true,
            _ => false,
        }
    }

    /// Scale of a decimal column (0 for everything else)
    pub fn scale(&self) -> u8 {
        match self {
            DataType::Decimal(_, s) => *s,
            _ => 0,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::Decimal(p, s) => write!(f, "DECIMAL({}, {})", p, s),
            DataType::Text => write!(f, "TEXT"),
            DataType::Date => write!(f, "DATE"),
            DataType::Timestamp => write!(f, "TIMESTAMPTZ"),
        }
    }
}
