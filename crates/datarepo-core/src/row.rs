//! Result rows.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::{FromValue, Value};

/// A row returned by the store.
///
/// Column labels are shared between all rows of one result set. Joined
/// selects label columns `alias.column`; projections label them by the
/// projected path.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row from shared column labels and values.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Column labels.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Index of a column label.
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// Raw value by label.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.index_of(column).map(|i| &self.values[i])
    }

    /// Raw value by position.
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Typed value by label.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self.value(column).ok_or_else(|| Error::Mapping {
            column: column.to_string(),
            reason: "column not present in result".to_string(),
        })?;
        T::from_value(value).ok_or_else(|| Error::Mapping {
            column: column.to_string(),
            reason: format!("unexpected {} value", value.type_name()),
        })
    }

    /// Typed value by position.
    pub fn get_at<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.value_at(index).ok_or_else(|| Error::Mapping {
            column: format!("#{index}"),
            reason: "column index out of range".to_string(),
        })?;
        T::from_value(value).ok_or_else(|| Error::Mapping {
            column: self.columns[index].clone(),
            reason: format!("unexpected {} value", value.type_name()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        let columns: Arc<[String]> = vec!["m.member_id".to_string(), "m.username".to_string()].into();
        Row::new(columns, vec![Value::BigInt(1), Value::from("AAA")])
    }

    #[test]
    fn test_typed_get() {
        let row = row();
        assert_eq!(row.get::<i64>("m.member_id").unwrap(), 1);
        assert_eq!(row.get::<String>("m.username").unwrap(), "AAA");
        assert_eq!(row.get_at::<String>(1).unwrap(), "AAA");
    }

    #[test]
    fn test_missing_and_mistyped_columns() {
        let row = row();
        assert!(matches!(row.get::<i64>("m.age"), Err(Error::Mapping { .. })));
        assert!(matches!(row.get::<i64>("m.username"), Err(Error::Mapping { .. })));
        assert!(row.get_at::<i64>(9).is_err());
    }
}
