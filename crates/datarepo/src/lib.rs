//! Derived-query repositories for relational stores.
//!
//! `datarepo` is the facade crate. It ties together the schema catalog
//! (`datarepo-core`), query derivation and planning (`datarepo-query`), the
//! unit of work (`datarepo-session`), pooling (`datarepo-pool`) and the
//! in-memory store (`datarepo-memory`).
//!
//! # Example
//!
//! ```ignore
//! use datarepo::prelude::*;
//! use datarepo::example::{self, Member, MemberRepository, Team};
//!
//! let settings = Settings::load()?;
//! let catalog = Arc::new(example::catalog()?);
//! let store = MemoryStore::new(settings.store.clone());
//! let source = DataSource::memory(&store, catalog.clone(), &settings)?;
//! let members = MemberRepository::build(catalog)?;
//!
//! let mut uow = source.begin()?;
//! let team = uow.save(Team::new("teamA"))?;
//! uow.save(Member::new("member1", 10, Some(&team)))?;
//! let found = members
//!     .repo
//!     .invoke(&mut uow, members.find_by_username_and_age_greater_than)
//!     .arg("member1")
//!     .arg(5)
//!     .list()?;
//! uow.commit()?;
//! ```

pub mod example;
pub mod method;
pub mod repository;
pub mod settings;

use std::sync::Arc;

use datarepo_core::{Connection, Result, SchemaCatalog};
use datarepo_memory::{MemoryConnection, MemoryStore};
use datarepo_pool::{Pool, PooledConnection};
use datarepo_session::{SessionConfig, UnitOfWork};

pub use method::{CompiledMethod, MethodDecl, MethodId, Modifying};
pub use repository::{Invocation, Repository, RepositoryBuilder};
pub use settings::Settings;

pub use datarepo_memory as memory;
pub use datarepo_pool as pool;
pub use datarepo_query as query;
pub use datarepo_session as session;

/// Catalog, pool and session settings: where units of work come from.
pub struct DataSource<C: Connection + Send + 'static> {
    catalog: Arc<SchemaCatalog>,
    pool: Pool<C>,
    session: SessionConfig,
}

impl<C: Connection + Send + 'static> DataSource<C> {
    pub fn new(catalog: Arc<SchemaCatalog>, pool: Pool<C>, session: SessionConfig) -> Self {
        Self {
            catalog,
            pool,
            session,
        }
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// A unit of work inside a write transaction.
    pub fn begin(&self) -> Result<UnitOfWork<PooledConnection<C>>> {
        UnitOfWork::begin(self.pool.acquire()?, self.catalog.clone(), self.session.clone())
    }

    /// A unit of work without a transaction; writes and locks are rejected.
    pub fn read_only(&self) -> Result<UnitOfWork<PooledConnection<C>>> {
        Ok(UnitOfWork::new(
            self.pool.acquire()?,
            self.catalog.clone(),
            self.session.clone(),
        ))
    }
}

impl DataSource<MemoryConnection> {
    /// Install `catalog` into `store` and pool connections to it.
    pub fn memory(
        store: &MemoryStore,
        catalog: Arc<SchemaCatalog>,
        settings: &Settings,
    ) -> Result<Self> {
        store.install(&catalog)?;
        let connect = store.clone();
        let pool = Pool::new(settings.pool.clone(), move || Ok(connect.connect()));
        tracing::info!(
            entities = catalog.entities().count(),
            max_connections = settings.pool.max_connections,
            "In-memory data source ready"
        );
        Ok(Self::new(catalog, pool, settings.session.clone()))
    }
}

impl<C: Connection + Send + 'static> std::fmt::Debug for DataSource<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("pool", &self.pool)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Commonly used types.
pub mod prelude {
    pub use std::sync::Arc;

    pub use datarepo_core::{
        Entity, Error, FieldInfo, FieldValues, Lazy, LifecyclePhase, Managed, RelationSlot,
        RelationshipInfo, Result, Row, RowLock, SchemaCatalog, SqlType, StoreError, Value,
    };
    pub use datarepo_memory::{MemoryStore, MemoryStoreConfig};
    pub use datarepo_pool::{Pool, PoolConfig};
    pub use datarepo_query::{
        Direction, Order, Page, PageRequest, ParamDecl, Slice, Sort, Specification,
    };
    pub use datarepo_session::{Projection, QueryHints, SessionConfig, UnitOfWork};

    pub use crate::{DataSource, MethodDecl, MethodId, Repository, RepositoryBuilder, Settings};
}
