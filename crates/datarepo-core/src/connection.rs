//! The store boundary.

use crate::error::Result;
use crate::row::Row;
use crate::statement::Statement;
use crate::value::Value;

/// A synchronous connection to a relational store.
///
/// Implementations report store failures as
/// [`Error::StoreExecution`](crate::Error::StoreExecution) carrying the
/// statement rendered by [`Statement::to_sql`].
pub trait Connection {
    /// Run a SELECT and return every row.
    fn query(&mut self, statement: &Statement, params: &[Value]) -> Result<Vec<Row>>;

    /// Run an INSERT, UPDATE or DELETE and return the affected row count.
    fn execute(&mut self, statement: &Statement, params: &[Value]) -> Result<u64>;

    /// Next value of the table's key sequence.
    fn next_id(&mut self, table: &str) -> Result<i64>;

    /// Open a transaction.
    fn begin(&mut self) -> Result<()>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Whether a transaction is open.
    fn in_transaction(&self) -> bool;
}

impl<C: Connection + ?Sized> Connection for &mut C {
    fn query(&mut self, statement: &Statement, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(statement, params)
    }

    fn execute(&mut self, statement: &Statement, params: &[Value]) -> Result<u64> {
        (**self).execute(statement, params)
    }

    fn next_id(&mut self, table: &str) -> Result<i64> {
        (**self).next_id(table)
    }

    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }

    fn in_transaction(&self) -> bool {
        (**self).in_transaction()
    }
}
