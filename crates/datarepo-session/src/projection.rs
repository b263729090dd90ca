//! Mapping of projection rows onto caller types.

use datarepo_core::{Result, Row};

/// A type built from one row of a scalar or constructor projection.
///
/// Columns are read positionally, in the order the query selects them.
///
/// ```ignore
/// struct MemberDto {
///     username: String,
///     team_name: Option<String>,
/// }
///
/// impl Projection for MemberDto {
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self {
///             username: row.get_at(0)?,
///             team_name: row.get_at(1)?,
///         })
///     }
/// }
/// ```
pub trait Projection: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

impl Projection for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use datarepo_core::Value;

    use super::*;

    struct NameAge {
        name: String,
        age: Option<i32>,
    }

    impl Projection for NameAge {
        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                name: row.get_at(0)?,
                age: row.get_at(1)?,
            })
        }
    }

    #[test]
    fn test_projection_reads_by_position() {
        let columns: Arc<[String]> = vec!["username".to_string(), "age".to_string()].into();
        let row = Row::new(columns, vec![Value::from("member1"), Value::Null]);
        let dto = NameAge::from_row(&row).unwrap();
        assert_eq!(dto.name, "member1");
        assert_eq!(dto.age, None);
    }
}
