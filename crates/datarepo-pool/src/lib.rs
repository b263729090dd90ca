//! Connection pooling for datarepo.
//!
//! `datarepo-pool` hands out store connections to request threads. A
//! [`Pool`] is `Send + Sync` and cheap to clone; each unit of work checks
//! out one [`PooledConnection`] and owns it for its lifetime.
//!
//! # Role In The Architecture
//!
//! - **Bounded**: at most `max_connections` connections are ever opened.
//! - **Blocking checkout**: when every connection is in use, `acquire`
//!   waits up to `acquire_timeout` and then fails with
//!   `Error::ConnectionAcquireTimeout`.
//! - **Guarded return**: dropping a `PooledConnection` rolls back any open
//!   transaction and returns the connection, on every exit path.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use datarepo_core::{Connection, Error, Result, Row, Statement, Value};
use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

/// Pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Self::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    /// Connections opened so far.
    pub open: usize,
    /// Open connections not checked out.
    pub idle: usize,
    pub acquires: u64,
    pub timeouts: u64,
}

// ============================================================================
// Pool
// ============================================================================

type Factory<C> = dyn Fn() -> Result<C> + Send + Sync;

/// Longest single wait on the idle channel before re-checking for a free slot.
const WAIT_SLICE: Duration = Duration::from_millis(20);

struct PoolInner<C> {
    config: PoolConfig,
    factory: Box<Factory<C>>,
    idle_tx: Sender<C>,
    idle_rx: Receiver<C>,
    open: AtomicUsize,
    acquires: AtomicU64,
    timeouts: AtomicU64,
}

impl<C> PoolInner<C> {
    /// Reserve a slot for a new connection, if under the limit.
    fn reserve(&self) -> bool {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.config.max_connections).then_some(open + 1)
            })
            .is_ok()
    }
}

/// A bounded pool of store connections.
///
/// ```ignore
/// let store = MemoryStore::default();
/// let pool = Pool::new(PoolConfig::new(4), move || Ok(store.connect()));
/// let mut conn = pool.acquire()?;
/// conn.begin()?;
/// ```
pub struct Pool<C: Connection + Send + 'static> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection + Send + 'static> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connection + Send + 'static> Pool<C> {
    /// Create a pool that opens connections with `factory` on demand.
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        let (idle_tx, idle_rx) = bounded(config.max_connections.max(1));
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(factory),
                idle_tx,
                idle_rx,
                open: AtomicUsize::new(0),
                acquires: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a connection, blocking up to the acquire timeout.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn acquire(&self) -> Result<PooledConnection<C>> {
        let inner = &self.inner;
        let timeout = inner.config.acquire_timeout();
        let deadline = Instant::now().checked_add(timeout);
        let conn = loop {
            if let Ok(conn) = inner.idle_rx.try_recv() {
                break conn;
            }
            if inner.reserve() {
                break self.open_connection()?;
            }
            // A discarded connection frees a slot without sending on the
            // idle channel, so the wait is sliced and the slot re-checked.
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        inner.timeouts.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            ?timeout,
                            max_connections = inner.config.max_connections,
                            "Timed out waiting for a pooled connection"
                        );
                        return Err(Error::ConnectionAcquireTimeout { timeout });
                    }
                    left.min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            match inner.idle_rx.recv_timeout(slice) {
                Ok(conn) => break conn,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
            }
        };
        inner.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
        })
    }

    /// Open a connection in a slot already reserved.
    fn open_connection(&self) -> Result<C> {
        let inner = &self.inner;
        match (inner.factory)() {
            Ok(conn) => {
                tracing::debug!(
                    open = inner.open.load(Ordering::Relaxed),
                    "Opened pooled connection"
                );
                Ok(conn)
            }
            Err(e) => {
                inner.open.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_connections: self.inner.config.max_connections,
            open: self.inner.open.load(Ordering::Relaxed),
            idle: self.inner.idle_rx.len(),
            acquires: self.inner.acquires.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl<C: Connection + Send + 'static> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Checked-out connection
// ============================================================================

/// A connection checked out of a [`Pool`].
///
/// Returned to the pool on drop; an open transaction is rolled back first.
pub struct PooledConnection<C: Connection + Send + 'static> {
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connection + Send + 'static> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only taken in Drop.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<C: Connection + Send + 'static> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C: Connection + Send + 'static> Connection for PooledConnection<C> {
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

impl<C: Connection + Send + 'static> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if conn.in_transaction() {
            tracing::debug!("Rolling back open transaction before returning connection");
            if let Err(e) = conn.rollback() {
                // A connection in an unknown state is not reused.
                tracing::warn!(error = %e, "Discarding pooled connection after failed rollback");
                self.pool.open.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
        if self.pool.idle_tx.try_send(conn).is_err() {
            self.pool.open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<C: Connection + Send + 'static> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("in_transaction", &self.conn.as_ref().map(|c| c.in_transaction()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use datarepo_core::StoreError;
    use datarepo_memory::MemoryStore;

    use super::*;

    fn pool(max: usize, timeout: Duration) -> Pool<datarepo_memory::MemoryConnection> {
        let store = MemoryStore::default();
        Pool::new(
            PoolConfig::new(max).with_acquire_timeout(timeout),
            move || Ok(store.connect()),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_connections_are_reused() {
        let pool = pool(2, Duration::from_millis(50));
        let first_id = pool.acquire().unwrap().id();
        let again = pool.acquire().unwrap();
        assert_eq!(again.id(), first_id);
        assert_eq!(pool.stats().open, 1);
    }

    #[test]
    fn test_exhaustion_times_out() {
        let pool = pool(1, Duration::from_millis(50));
        let held = pool.acquire().unwrap();
        let started = Instant::now();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, Error::ConnectionAcquireTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(pool.stats().timeouts, 1);
        drop(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_waiter_gets_released_connection() {
        let pool = pool(1, Duration::from_secs(5));
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|c| c.id()))
        };
        thread::sleep(Duration::from_millis(30));
        let id = held.id();
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    /// A connection whose rollback always fails.
    struct BrokenRollback {
        in_transaction: bool,
    }

    impl Connection for BrokenRollback {
        fn query(&mut self, _: &Statement, _: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        fn execute(&mut self, _: &Statement, _: &[Value]) -> Result<u64> {
            Ok(0)
        }

        fn next_id(&mut self, _: &str) -> Result<i64> {
            Ok(1)
        }

        fn begin(&mut self) -> Result<()> {
            self.in_transaction = true;
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.in_transaction = false;
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            Err(Error::StoreExecution {
                statement: "ROLLBACK".to_string(),
                source: StoreError::NotInTransaction("rollback"),
            })
        }

        fn in_transaction(&self) -> bool {
            self.in_transaction
        }
    }

    #[test]
    fn test_waiter_opens_connection_after_discard() {
        let pool = Pool::new(
            PoolConfig::new(1).with_acquire_timeout(Duration::from_secs(5)),
            || {
                Ok(BrokenRollback {
                    in_transaction: false,
                })
            },
        );
        let mut held = pool.acquire().unwrap();
        held.begin().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|c| c.in_transaction()))
        };
        thread::sleep(Duration::from_millis(50));
        // rollback fails, so the connection is discarded instead of returned
        drop(held);

        let started = Instant::now();
        assert!(!waiter.join().unwrap().unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        let stats = pool.stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.acquires, 2);
        assert_eq!(stats.timeouts, 0);
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let pool = pool(1, Duration::from_millis(50));
        {
            let mut conn = pool.acquire().unwrap();
            conn.begin().unwrap();
            assert!(conn.in_transaction());
        }
        let conn = pool.acquire().unwrap();
        assert!(!conn.in_transaction());
    }
}
