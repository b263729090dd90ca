//! Column type metadata.

use crate::value::Value;

/// SQL type of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    /// BOOLEAN
    Boolean,
    /// INTEGER (32-bit)
    Integer,
    /// BIGINT (64-bit)
    BigInt,
    /// DOUBLE PRECISION
    Double,
    /// TEXT
    Text,
    /// TIMESTAMP
    Timestamp,
}

impl SqlType {
    /// The SQL type name.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Text => "TEXT",
            SqlType::Timestamp => "TIMESTAMP",
        }
    }

    /// Whether the type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(self, SqlType::Integer | SqlType::BigInt | SqlType::Double)
    }

    /// Whether a value can be stored in a column of this type.
    ///
    /// NULL is accepted here; nullability is checked separately.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (SqlType::Boolean, Value::Bool(_)) => true,
            (SqlType::Integer | SqlType::BigInt, Value::Int(_) | Value::BigInt(_)) => true,
            (SqlType::Double, Value::Int(_) | Value::BigInt(_) | Value::Double(_)) => true,
            (SqlType::Text, Value::Text(_)) => true,
            (SqlType::Timestamp, Value::Timestamp(_)) => true,
            _ => false,
        }
    }

    /// Whether values of the two types can be compared in a predicate.
    pub const fn comparable_with(&self, other: SqlType) -> bool {
        (self.is_numeric() && other.is_numeric()) || (*self as u8 == other as u8)
    }
}
