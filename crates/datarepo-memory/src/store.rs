//! Tables, row locks and the shared store handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use datarepo_core::{Error, Result, SchemaCatalog, SqlType, StoreError, Value};
use serde::Serialize;

use crate::config::MemoryStoreConfig;
use crate::connection::MemoryConnection;

// ============================================================================
// Tables
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    /// Table whose primary key this column references.
    pub references: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub key: usize,
    pub generated: bool,
    pub rows: Vec<Vec<Value>>,
    pub sequence: i64,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn position(&self, key: &Value) -> Option<usize> {
        self.rows.iter().position(|row| row[self.key].sql_eq(key))
    }

    /// Convert a value to the column's storage type.
    pub fn coerce(&self, column: usize, value: Value) -> Result<Value, StoreError> {
        let def = &self.columns[column];
        let mismatch = |value: &Value| {
            StoreError::TypeMismatch(format!(
                "`{}.{}` is {}, got {}",
                self.name,
                def.name,
                def.sql_type.sql_name(),
                value.type_name()
            ))
        };
        match (def.sql_type, value) {
            (_, Value::Null) if !def.nullable => Err(StoreError::NotNull {
                table: self.name.clone(),
                column: def.name.clone(),
            }),
            (_, Value::Null) => Ok(Value::Null),
            (SqlType::Integer, Value::BigInt(v)) => {
                i32::try_from(v).map(Value::Int).map_err(|_| mismatch(&Value::BigInt(v)))
            }
            (SqlType::BigInt, Value::Int(v)) => Ok(Value::BigInt(i64::from(v))),
            (SqlType::Double, Value::Int(v)) => Ok(Value::Double(f64::from(v))),
            (SqlType::Double, Value::BigInt(v)) => Ok(Value::Double(v as f64)),
            (ty, value) if ty.accepts(&value) => Ok(value),
            (_, value) => Err(mismatch(&value)),
        }
    }
}

/// Identity of a locked row: table plus rendered key.
pub(crate) type LockKey = (String, String);

pub(crate) fn lock_key(table: &str, key: &Value) -> LockKey {
    let rendered = key.as_i64().map_or_else(|| key.to_string(), |n| n.to_string());
    (table.to_string(), rendered)
}

#[derive(Debug)]
struct RowLockEntry {
    exclusive: bool,
    holders: Vec<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct Database {
    pub tables: HashMap<String, Table>,
    locks: HashMap<LockKey, RowLockEntry>,
}

impl Database {
    pub fn table(&self, name: &str) -> Result<&Table, StoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::NoSuchTable(name.to_string()))
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table, StoreError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::NoSuchTable(name.to_string()))
    }

    fn conflicts(&self, keys: &[LockKey], txn: Option<u64>, exclusive: bool) -> bool {
        keys.iter().any(|key| {
            self.locks.get(key).is_some_and(|entry| {
                let foreign = entry.holders.iter().any(|h| Some(*h) != txn);
                foreign && (exclusive || entry.exclusive)
            })
        })
    }

    fn grant(&mut self, keys: Vec<LockKey>, txn: u64, exclusive: bool) {
        for key in keys {
            let entry = self.locks.entry(key).or_insert(RowLockEntry {
                exclusive,
                holders: Vec::new(),
            });
            entry.exclusive |= exclusive;
            if !entry.holders.contains(&txn) {
                entry.holders.push(txn);
            }
        }
    }

    /// Drop every lock held by `txn`.
    pub fn release(&mut self, txn: u64) {
        self.locks.retain(|_, entry| {
            entry.holders.retain(|h| *h != txn);
            !entry.holders.is_empty()
        });
    }

    /// Tables with a column referencing `table`.
    pub fn referencing(&self, table: &str) -> Vec<(&Table, usize)> {
        self.tables
            .values()
            .flat_map(|t| {
                t.columns
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.references.as_deref() == Some(table))
                    .map(move |(i, _)| (t, i))
            })
            .collect()
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    selects: AtomicU64,
    count_queries: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

/// Statements executed since the store was created or stats were reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Row-returning SELECTs.
    pub selects: u64,
    /// `SELECT COUNT(*)` statements.
    pub count_queries: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

/// Kind of statement, for the counters.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Counted {
    Select,
    Count,
    Insert,
    Update,
    Delete,
}

#[derive(Debug)]
pub(crate) struct Shared {
    db: Mutex<Database>,
    released: Condvar,
    pub config: MemoryStoreConfig,
    counters: Counters,
    next_id: AtomicU64,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn count(&self, kind: Counted) {
        let counter = match kind {
            Counted::Select => &self.counters.selects,
            Counted::Count => &self.counters.count_queries,
            Counted::Insert => &self.counters.inserts,
            Counted::Update => &self.counters.updates,
            Counted::Delete => &self.counters.deletes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Wake statements waiting for row locks.
    pub fn notify(&self) {
        self.released.notify_all();
    }

    /// Block until none of the rows named by `keys` is locked by another
    /// transaction, then lock them for `txn` (if any).
    ///
    /// `keys` is re-evaluated after every wake-up since the rows may have
    /// changed while waiting.
    pub fn acquire<'a>(
        &'a self,
        mut db: MutexGuard<'a, Database>,
        txn: Option<u64>,
        exclusive: bool,
        mut keys: impl FnMut(&Database) -> Result<Vec<LockKey>, StoreError>,
    ) -> Result<MutexGuard<'a, Database>, StoreError> {
        let timeout = self.config.lock_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let wanted = keys(&*db)?;
            if !db.conflicts(&wanted, txn, exclusive) {
                if let Some(txn) = txn {
                    db.grant(wanted, txn, exclusive);
                }
                return Ok(db);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(?timeout, "Row lock wait timed out");
                return Err(StoreError::LockTimeout(timeout));
            }
            tracing::debug!(?remaining, "Waiting for row lock");
            db = self
                .released
                .wait_timeout(db, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

// ============================================================================
// Store handle
// ============================================================================

/// An in-memory relational store.
///
/// Cloning is cheap; clones share the same tables. Every
/// [`MemoryConnection`] sees the rows written by every other connection,
/// including uncommitted ones; isolation comes from row locks only.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                db: Mutex::new(Database::default()),
                released: Condvar::new(),
                config,
                counters: Counters::default(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Create one table per catalog entity, with foreign keys for owning
    /// relationships. Existing tables are kept.
    #[tracing::instrument(level = "debug", skip(self, catalog))]
    pub fn install(&self, catalog: &SchemaCatalog) -> Result<()> {
        let mut db = self.shared.lock();
        for descriptor in catalog.entities() {
            if db.tables.contains_key(descriptor.table()) {
                continue;
            }
            let mut columns: Vec<ColumnDef> = descriptor
                .fields()
                .iter()
                .map(|f| ColumnDef {
                    name: f.column_name.to_string(),
                    sql_type: f.sql_type,
                    nullable: f.nullable && !f.primary_key,
                    references: None,
                })
                .collect();
            for rel in descriptor.owning_relationships() {
                let target = catalog.descriptor(rel.target)?;
                columns.push(ColumnDef {
                    name: rel.foreign_key.unwrap_or_default().to_string(),
                    sql_type: target.primary_key().sql_type,
                    nullable: true,
                    references: Some(target.table().to_string()),
                });
            }
            let key = descriptor.primary_key_index();
            tracing::info!(
                table = descriptor.table(),
                columns = columns.len(),
                "Creating table"
            );
            db.tables.insert(
                descriptor.table().to_string(),
                Table {
                    name: descriptor.table().to_string(),
                    columns,
                    key,
                    generated: descriptor.primary_key().generated,
                    rows: Vec::new(),
                    sequence: 0,
                },
            );
        }
        Ok(())
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection::new(self.shared.clone())
    }

    /// Number of rows currently stored in `table`.
    pub fn row_count(&self, table: &str) -> Result<usize> {
        self.shared
            .lock()
            .table(table)
            .map(|t| t.rows.len())
            .map_err(|source| Error::StoreExecution {
                statement: format!("SELECT COUNT(*) FROM {table}"),
                source,
            })
    }

    pub fn stats(&self) -> StoreStats {
        let c = &self.shared.counters;
        StoreStats {
            selects: c.selects.load(Ordering::Relaxed),
            count_queries: c.count_queries.load(Ordering::Relaxed),
            inserts: c.inserts.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.shared.counters;
        for counter in [
            &c.selects,
            &c.count_queries,
            &c.inserts,
            &c.updates,
            &c.deletes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
