//! Field and column definitions.

use crate::types::SqlType;

/// Metadata about a mapped scalar field.
///
/// Relationship foreign keys are not fields; they are described by
/// [`RelationshipInfo`](crate::RelationshipInfo).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Rust field name (also the property name used by derived queries)
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column_name: &'static str,
    /// SQL type for this field
    pub sql_type: SqlType,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether this is the primary key
    pub primary_key: bool,
    /// Whether the key is generated from the store sequence on persist
    pub generated: bool,
    /// Whether the column is written by UPDATE statements
    pub updatable: bool,
}

impl FieldInfo {
    /// Create a new field info; the column name defaults to the field name.
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column_name: name,
            sql_type,
            nullable: false,
            primary_key: false,
            generated: false,
            updatable: true,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }

    /// Mark the field as nullable.
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark the field as the primary key.
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.updatable = false;
        self
    }

    /// Mark the key as generated on persist.
    pub const fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Exclude the column from UPDATE statements (`updatable = false`).
    pub const fn not_updatable(mut self) -> Self {
        self.updatable = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_builder_chain() {
        const ID: FieldInfo = FieldInfo::new("id", SqlType::BigInt)
            .column("member_id")
            .primary_key()
            .generated();
        assert_eq!(ID.name, "id");
        assert_eq!(ID.column_name, "member_id");
        assert!(ID.primary_key);
        assert!(ID.generated);
        assert!(!ID.updatable);
        assert!(!ID.nullable);
    }

    #[test]
    fn test_not_updatable() {
        let created = FieldInfo::new("created_date", SqlType::Timestamp)
            .nullable()
            .not_updatable();
        assert!(created.nullable);
        assert!(!created.updatable);
        assert_eq!(created.column_name, "created_date");
    }
}
