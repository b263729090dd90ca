//! Write statements for single entity rows.
//!
//! Rows are laid out in [`EntityDescriptor::columns`] order: every field,
//! then the foreign key of every owning relationship.

use datarepo_core::{
    Assignment, ColumnRef, CompareOp, Condition, Delete, EntityDescriptor, Insert, Operand,
    ScalarExpr, Statement, TableRef, Update, Value,
};

/// INSERT builder for one entity row.
///
/// A generated primary key that is still null is left out so the store
/// assigns it.
#[derive(Debug)]
pub struct InsertBuilder<'a> {
    descriptor: &'a EntityDescriptor,
    row: &'a [Value],
}

impl<'a> InsertBuilder<'a> {
    pub fn new(descriptor: &'a EntityDescriptor, row: &'a [Value]) -> Self {
        Self { descriptor, row }
    }

    /// Build the INSERT and its parameters.
    pub fn build(&self) -> (Statement, Vec<Value>) {
        let fields = self.descriptor.fields();
        let mut columns = Vec::new();
        let mut params = Vec::new();
        for (n, (column, value)) in self.descriptor.columns().into_iter().zip(self.row).enumerate() {
            if let Some(field) = fields.get(n) {
                if field.generated && value.is_null() {
                    continue;
                }
            }
            columns.push(column.to_string());
            params.push(value.clone());
        }
        let values = (0..params.len()).map(Operand::Param).collect();
        let statement = Statement::Insert(Insert {
            table: self.descriptor.table().to_string(),
            columns,
            values,
        });
        (statement, params)
    }
}

/// UPDATE builder for one entity row, keyed by primary key.
#[derive(Debug)]
pub struct UpdateBuilder<'a> {
    descriptor: &'a EntityDescriptor,
    key: Value,
    set: Vec<(&'static str, Value)>,
}

impl<'a> UpdateBuilder<'a> {
    pub fn new(descriptor: &'a EntityDescriptor, key: Value) -> Self {
        Self {
            descriptor,
            key,
            set: Vec::new(),
        }
    }

    /// Set every updatable column whose value differs between `before`
    /// and `after`.
    pub fn changed(mut self, before: &[Value], after: &[Value]) -> Self {
        let fields = self.descriptor.fields();
        for (n, column) in self.descriptor.columns().into_iter().enumerate() {
            let updatable = fields.get(n).is_none_or(|f| f.updatable);
            match (before.get(n), after.get(n)) {
                (Some(old), Some(new)) if updatable && old != new => {
                    self.set.push((column, new.clone()));
                }
                _ => {}
            }
        }
        self
    }

    /// Whether no column is set.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Column names being set.
    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.set.iter().map(|(c, _)| *c)
    }

    pub fn build(&self) -> (Statement, Vec<Value>) {
        let mut params: Vec<Value> = self.set.iter().map(|(_, v)| v.clone()).collect();
        let assignments = self
            .set
            .iter()
            .enumerate()
            .map(|(n, (column, _))| Assignment {
                column: column.to_string(),
                value: ScalarExpr::Operand(Operand::Param(n)),
            })
            .collect();
        let filter = key_condition(self.descriptor, params.len());
        params.push(self.key.clone());
        let statement = Statement::Update(Update {
            table: TableRef::new(self.descriptor.table(), self.descriptor.table()),
            assignments,
            filter: Some(filter),
        });
        (statement, params)
    }
}

/// DELETE builder for one entity row, keyed by primary key.
#[derive(Debug)]
pub struct DeleteBuilder<'a> {
    descriptor: &'a EntityDescriptor,
    key: Value,
}

impl<'a> DeleteBuilder<'a> {
    pub fn new(descriptor: &'a EntityDescriptor, key: Value) -> Self {
        Self { descriptor, key }
    }

    pub fn build(&self) -> (Statement, Vec<Value>) {
        let statement = Statement::Delete(Delete {
            table: TableRef::new(self.descriptor.table(), self.descriptor.table()),
            filter: Some(key_condition(self.descriptor, 0)),
        });
        (statement, vec![self.key.clone()])
    }
}

fn key_condition(descriptor: &EntityDescriptor, param: usize) -> Condition {
    Condition::Compare {
        column: ColumnRef::new(descriptor.table(), descriptor.primary_key().column_name),
        op: CompareOp::Eq,
        operand: Operand::Param(param),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::catalog;

    #[test]
    fn test_insert_skips_null_generated_key() {
        let catalog = catalog();
        let member = catalog.descriptor("Member").unwrap();
        let row = vec![Value::Null, Value::from("member1"), Value::Int(10), Value::BigInt(1)];
        let (statement, params) = InsertBuilder::new(member, &row).build();
        assert_eq!(
            statement.to_sql(),
            "INSERT INTO member (username, age, team_id) VALUES ($1, $2, $3)"
        );
        assert_eq!(params.len(), 3);

        let row = vec![Value::BigInt(7), Value::from("member1"), Value::Int(10), Value::Null];
        let (statement, params) = InsertBuilder::new(member, &row).build();
        assert_eq!(
            statement.to_sql(),
            "INSERT INTO member (member_id, username, age, team_id) VALUES ($1, $2, $3, $4)"
        );
        assert_eq!(params[0], Value::BigInt(7));
    }

    #[test]
    fn test_update_only_changed_columns() {
        let catalog = catalog();
        let member = catalog.descriptor("Member").unwrap();
        let before = vec![Value::BigInt(1), Value::from("member1"), Value::Int(10), Value::Null];
        let after = vec![Value::BigInt(1), Value::from("member1"), Value::Int(11), Value::BigInt(3)];
        let update = UpdateBuilder::new(member, Value::BigInt(1)).changed(&before, &after);
        assert_eq!(update.columns().collect::<Vec<_>>(), vec!["age", "team_id"]);
        let (statement, params) = update.build();
        assert_eq!(
            statement.to_sql(),
            "UPDATE member member SET age = $1, team_id = $2 WHERE member.member_id = $3"
        );
        assert_eq!(params, vec![Value::Int(11), Value::BigInt(3), Value::BigInt(1)]);

        let unchanged = UpdateBuilder::new(member, Value::BigInt(1)).changed(&before, &before);
        assert!(unchanged.is_empty());
    }

    #[test]
    fn test_update_never_touches_primary_key() {
        let catalog = catalog();
        let member = catalog.descriptor("Member").unwrap();
        let before = vec![Value::BigInt(1), Value::from("a"), Value::Int(1), Value::Null];
        let after = vec![Value::BigInt(2), Value::from("a"), Value::Int(1), Value::Null];
        assert!(
            UpdateBuilder::new(member, Value::BigInt(1))
                .changed(&before, &after)
                .is_empty()
        );
    }

    #[test]
    fn test_delete_by_key() {
        let catalog = catalog();
        let team = catalog.descriptor("Team").unwrap();
        let (statement, params) = DeleteBuilder::new(team, Value::BigInt(4)).build();
        assert_eq!(statement.to_sql(), "DELETE FROM team team WHERE team.team_id = $1");
        assert_eq!(params, vec![Value::BigInt(4)]);
    }
}
