//! In-memory relational store for datarepo.
//!
//! `datarepo-memory` implements the core `Connection` contract over tables
//! kept in process memory. It is the store the facade's tests and examples
//! run against.
//!
//! # Role In The Architecture
//!
//! - **Schema**: [`MemoryStore::install`] creates one table per entity in a
//!   `SchemaCatalog`, with primary-key sequences and foreign keys for owning
//!   relationships.
//! - **Execution**: [`MemoryConnection`] evaluates structured `Statement`s
//!   (joins, three-valued filters, ordering, paging, `COUNT(*)`).
//! - **Transactions**: undo-log rollback and row locks (`FOR UPDATE`,
//!   `FOR SHARE`) with a configurable wait timeout.
//! - **Observability**: [`StoreStats`] counts statements by kind.

pub mod config;
pub mod connection;
mod eval;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::MemoryStoreConfig;
pub use connection::MemoryConnection;
pub use store::{MemoryStore, StoreStats};
