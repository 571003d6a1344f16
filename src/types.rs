//! Logical column types and the scalar values chunk statistics are made of.

use serde::{Deserialize, Serialize};

/// Logical type of a foreign-table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalType {
    Bool,
    Int32,
    Int64,
    Float64,
    String,
}

impl LogicalType {
    /// Variable-length types store their bytes in a data chunk and their
    /// element boundaries in a separate offsets chunk.
    pub fn is_varlen(&self) -> bool {
        matches!(self, LogicalType::String)
    }

    /// Fixed width in bytes of one encoded element. Varlen types have no
    /// fixed width.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            LogicalType::Bool => Some(1),
            LogicalType::Int32 => Some(4),
            LogicalType::Int64 => Some(8),
            LogicalType::Float64 => Some(8),
            LogicalType::String => None,
        }
    }
}

/// Primitive value stored in per-chunk statistics.
#[derive(Debug, Clone, PartialOrd, Serialize, Deserialize)]
pub enum DataValue {
    // NOTE: Null comes first.
    // => NULL is less than any non-NULL values
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
}

impl PartialEq for DataValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            _ => false,
        }
    }
}

impl DataValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }

    /// Parse a CSV field into a value of the given type. An empty field is
    /// NULL.
    pub fn from_field(ty: LogicalType, field: &str) -> Option<Self> {
        if field.is_empty() {
            return Some(DataValue::Null);
        }
        match ty {
            LogicalType::Bool => match field.to_ascii_lowercase().as_str() {
                "t" | "true" | "1" => Some(DataValue::Bool(true)),
                "f" | "false" | "0" => Some(DataValue::Bool(false)),
                _ => None,
            },
            LogicalType::Int32 => field.parse().ok().map(DataValue::Int32),
            LogicalType::Int64 => field.parse().ok().map(DataValue::Int64),
            LogicalType::Float64 => field.parse().ok().map(DataValue::Float64),
            LogicalType::String => Some(DataValue::String(field.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fields() {
        assert_eq!(
            DataValue::from_field(LogicalType::Int32, "42"),
            Some(DataValue::Int32(42))
        );
        assert_eq!(
            DataValue::from_field(LogicalType::Int64, ""),
            Some(DataValue::Null)
        );
        assert_eq!(DataValue::from_field(LogicalType::Int32, "4x"), None);
        assert_eq!(
            DataValue::from_field(LogicalType::Bool, "TRUE"),
            Some(DataValue::Bool(true))
        );
    }

    #[test]
    fn null_sorts_first() {
        assert!(DataValue::Null < DataValue::Int32(i32::MIN));
    }
}
