//! [`Connection`] implementation over a [`MemoryStore`](crate::MemoryStore).

use std::sync::Arc;

use datarepo_core::{
    Condition, Connection, Delete, Error, Insert, Result, Row, RowLock, Select, Statement,
    StoreError, Update, Value,
};

use crate::eval::{self, Scope, Tuple, operand_value};
use crate::store::{Counted, Database, Shared, Table, lock_key};

#[derive(Debug)]
enum Undo {
    Insert { table: String, key: Value },
    Update { table: String, key: Value, before: Vec<Value> },
    Delete { table: String, index: usize, row: Vec<Value> },
}

#[derive(Debug)]
struct Txn {
    id: u64,
    undo: Vec<Undo>,
}

/// A connection to an in-memory store.
///
/// Outside a transaction every statement commits on its own. Inside one,
/// writes are recorded in an undo log and row locks are held until commit
/// or rollback. Dropping a connection with an open transaction rolls it
/// back.
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    txn: Option<Txn>,
}

impl MemoryConnection {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let id = shared.next_id();
        tracing::debug!(connection = id, "Opened memory connection");
        Self {
            shared,
            id,
            txn: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn txn_id(&self) -> Option<u64> {
        self.txn.as_ref().map(|t| t.id)
    }

    fn record(&mut self, undo: Undo) {
        if let Some(txn) = &mut self.txn {
            txn.undo.push(undo);
        }
    }

    fn failed(statement: &Statement) -> impl FnOnce(StoreError) -> Error + '_ {
        move |source| Error::StoreExecution {
            statement: statement.to_sql(),
            source,
        }
    }

    fn run_select(
        &mut self,
        select: &Select,
        params: &[Value],
    ) -> Result<Vec<Row>, StoreError> {
        let db = self.shared.lock();
        let db = match select.lock {
            Some(lock) => {
                let Some(txn) = self.txn_id() else {
                    return Err(StoreError::NotInTransaction(match lock {
                        RowLock::Update => "SELECT ... FOR UPDATE",
                        RowLock::Share => "SELECT ... FOR SHARE",
                    }));
                };
                self.shared
                    .acquire(db, Some(txn), lock == RowLock::Update, |db| {
                        eval::select(db, select, params).map(|s| s.keys)
                    })?
            }
            None => db,
        };
        let selected = eval::select(&db, select, params)?;
        self.shared.count(if select.is_count() {
            Counted::Count
        } else {
            Counted::Select
        });
        Ok(selected
            .rows
            .into_iter()
            .map(|values| Row::new(selected.columns.clone(), values))
            .collect())
    }

    fn run_insert(&mut self, insert: &Insert, params: &[Value]) -> Result<u64, StoreError> {
        let mut db = self.shared.lock();
        let table = db.table(&insert.table)?;
        let mut row = vec![Value::Null; table.columns.len()];
        for (column, operand) in insert.columns.iter().zip(&insert.values) {
            let index = table
                .column_index(column)
                .ok_or_else(|| StoreError::NoSuchColumn(format!("{}.{column}", insert.table)))?;
            row[index] = operand_value(operand, params)?.clone();
        }
        let key_index = table.key;
        if row[key_index].is_null() && table.generated {
            let table = db.table_mut(&insert.table)?;
            table.sequence += 1;
            row[key_index] = Value::BigInt(table.sequence);
        }
        let table = db.table(&insert.table)?;
        let row = row
            .into_iter()
            .enumerate()
            .map(|(i, v)| table.coerce(i, v))
            .collect::<Result<Vec<_>, _>>()?;
        let key = row[key_index].clone();
        if table.position(&key).is_some() {
            return Err(StoreError::DuplicateKey {
                table: table.name.clone(),
                key: key.to_string(),
            });
        }
        check_references(&db, &insert.table, &row)?;

        let table = db.table_mut(&insert.table)?;
        if let Some(n) = key.as_i64() {
            table.sequence = table.sequence.max(n);
        }
        table.rows.push(row);
        drop(db);
        self.record(Undo::Insert {
            table: insert.table.clone(),
            key,
        });
        self.shared.count(Counted::Insert);
        Ok(1)
    }

    fn run_update(&mut self, update: &Update, params: &[Value]) -> Result<u64, StoreError> {
        let name = update.table.table.as_str();
        let db = self.shared.lock();
        let txn = self.txn_id();
        let mut db = self.shared.acquire(db, txn, true, |db| {
            let table = db.table(name)?;
            Ok(matching(table, &update.table.alias, update.filter.as_ref(), params)?
                .into_iter()
                .map(|i| lock_key(name, &table.rows[i][table.key]))
                .collect())
        })?;

        let table = db.table(name)?;
        let indexes = matching(table, &update.table.alias, update.filter.as_ref(), params)?;
        let scope = Scope::single(update.table.alias.as_str(), table);
        let mut changes = Vec::with_capacity(indexes.len());
        for &index in &indexes {
            let before = &table.rows[index];
            let tuple: Tuple<'_> = vec![Some(before.as_slice())];
            let mut after = before.clone();
            for assignment in &update.assignments {
                let column = table.column_index(&assignment.column).ok_or_else(|| {
                    StoreError::NoSuchColumn(format!("{name}.{}", assignment.column))
                })?;
                if column == table.key {
                    return Err(StoreError::Unsupported(
                        "primary key columns cannot be updated".to_string(),
                    ));
                }
                let value = scope.scalar(&tuple, &assignment.value, params)?;
                after[column] = table.coerce(column, value)?;
            }
            check_references(&db, name, &after)?;
            changes.push((index, before.clone(), after));
        }

        let table = db.table_mut(name)?;
        let mut undo = Vec::with_capacity(changes.len());
        for (index, before, after) in changes {
            undo.push(Undo::Update {
                table: name.to_string(),
                key: after[table.key].clone(),
                before,
            });
            table.rows[index] = after;
        }
        drop(db);
        let affected = undo.len() as u64;
        for entry in undo {
            self.record(entry);
        }
        self.shared.count(Counted::Update);
        Ok(affected)
    }

    fn run_delete(&mut self, delete: &Delete, params: &[Value]) -> Result<u64, StoreError> {
        let name = delete.table.table.as_str();
        let db = self.shared.lock();
        let txn = self.txn_id();
        let mut db = self.shared.acquire(db, txn, true, |db| {
            let table = db.table(name)?;
            Ok(matching(table, &delete.table.alias, delete.filter.as_ref(), params)?
                .into_iter()
                .map(|i| lock_key(name, &table.rows[i][table.key]))
                .collect())
        })?;

        let table = db.table(name)?;
        let indexes = matching(table, &delete.table.alias, delete.filter.as_ref(), params)?;
        for &index in &indexes {
            let key = &table.rows[index][table.key];
            for (referencing, column) in db.referencing(name) {
                if referencing.rows.iter().any(|r| r[column].sql_eq(key)) {
                    return Err(StoreError::ForeignKeyViolation {
                        table: referencing.name.clone(),
                        column: referencing.columns[column].name.clone(),
                    });
                }
            }
        }

        let table = db.table_mut(name)?;
        let mut undo = Vec::with_capacity(indexes.len());
        for &index in indexes.iter().rev() {
            let row = table.rows.remove(index);
            undo.push(Undo::Delete {
                table: name.to_string(),
                index,
                row,
            });
        }
        drop(db);
        let affected = undo.len() as u64;
        for entry in undo {
            self.record(entry);
        }
        self.shared.count(Counted::Delete);
        Ok(affected)
    }

    fn finish(&mut self, commit: bool) -> Result<(), StoreError> {
        let txn = self.txn.take().ok_or(StoreError::NotInTransaction(if commit {
            "COMMIT"
        } else {
            "ROLLBACK"
        }))?;
        let mut db = self.shared.lock();
        if !commit {
            for undo in txn.undo.into_iter().rev() {
                revert(&mut db, undo);
            }
        }
        db.release(txn.id);
        drop(db);
        self.shared.notify();
        Ok(())
    }
}

/// Indexes of the rows of `table` matching `filter`.
fn matching(
    table: &Table,
    alias: &str,
    filter: Option<&Condition>,
    params: &[Value],
) -> Result<Vec<usize>, StoreError> {
    let scope = Scope::single(alias, table);
    let mut indexes = Vec::new();
    for (index, row) in table.rows.iter().enumerate() {
        let tuple: Tuple<'_> = vec![Some(row.as_slice())];
        let keep = match filter {
            Some(filter) => scope.test(&tuple, filter, params)? == Some(true),
            None => true,
        };
        if keep {
            indexes.push(index);
        }
    }
    Ok(indexes)
}

fn check_references(db: &Database, table: &str, row: &[Value]) -> Result<(), StoreError> {
    let def = db.table(table)?;
    for (column, value) in def.columns.iter().zip(row) {
        let Some(target) = &column.references else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if db.table(target)?.position(value).is_none() {
            return Err(StoreError::ForeignKeyViolation {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

fn revert(db: &mut Database, undo: Undo) {
    match undo {
        Undo::Insert { table, key } => {
            if let Ok(table) = db.table_mut(&table) {
                if let Some(index) = table.position(&key) {
                    table.rows.remove(index);
                }
            }
        }
        Undo::Update { table, key, before } => {
            if let Ok(table) = db.table_mut(&table) {
                if let Some(index) = table.position(&key) {
                    table.rows[index] = before;
                }
            }
        }
        Undo::Delete { table, index, row } => {
            if let Ok(table) = db.table_mut(&table) {
                let index = index.min(table.rows.len());
                table.rows.insert(index, row);
            }
        }
    }
}

impl Connection for MemoryConnection {
    fn query(&mut self, statement: &Statement, params: &[Value]) -> Result<Vec<Row>> {
        tracing::debug!(connection = self.id, sql = %statement, params = params.len(), "Executing query");
        match statement {
            Statement::Select(select) => self
                .run_select(select, params)
                .map_err(Self::failed(statement)),
            _ => Err(Self::failed(statement)(StoreError::Unsupported(format!(
                "{} cannot return rows",
                statement.kind()
            )))),
        }
    }

    fn execute(&mut self, statement: &Statement, params: &[Value]) -> Result<u64> {
        tracing::debug!(connection = self.id, sql = %statement, params = params.len(), "Executing statement");
        let result = match statement {
            Statement::Insert(insert) => self.run_insert(insert, params),
            Statement::Update(update) => self.run_update(update, params),
            Statement::Delete(delete) => self.run_delete(delete, params),
            Statement::Select(_) => Err(StoreError::Unsupported(
                "use query() for SELECT".to_string(),
            )),
        };
        result.map_err(Self::failed(statement))
    }

    fn next_id(&mut self, table: &str) -> Result<i64> {
        let mut db = self.shared.lock();
        let table_def = db.table_mut(table).map_err(|source| Error::StoreExecution {
            statement: format!("NEXTVAL({table})"),
            source,
        })?;
        table_def.sequence += 1;
        Ok(table_def.sequence)
    }

    fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::StoreExecution {
                statement: "BEGIN".to_string(),
                source: StoreError::TransactionAlreadyOpen,
            });
        }
        let id = self.shared.next_id();
        tracing::debug!(connection = self.id, txn = id, "Began transaction");
        self.txn = Some(Txn {
            id,
            undo: Vec::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.finish(true).map_err(|source| Error::StoreExecution {
            statement: "COMMIT".to_string(),
            source,
        })
    }

    fn rollback(&mut self) -> Result<()> {
        self.finish(false).map_err(|source| Error::StoreExecution {
            statement: "ROLLBACK".to_string(),
            source,
        })
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.txn.is_some() {
            tracing::debug!(connection = self.id, "Rolling back transaction on drop");
            let _ = self.finish(false);
        }
    }
}
