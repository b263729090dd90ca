//! Core types and traits for datarepo.
//!
//! `datarepo-core` is the **foundation layer** of the workspace. It defines the
//! traits and data types every other crate builds on.
//!
//! # Role In The Architecture
//!
//! - **Contract layer**: `Entity` is implemented by user types and `Connection`
//!   by stores.
//! - **Data model**: `Value`, `Row` and `SqlType` describe statement inputs and
//!   outputs; `Statement` is the structured form a store executes.
//! - **Schema**: `SchemaCatalog` holds one immutable `EntityDescriptor` per
//!   entity, with relationships, named entity graphs and lifecycle callbacks.
//!
//! # Who Uses This Crate
//!
//! - `datarepo-query` resolves properties against the catalog and compiles
//!   plans into `Statement`s.
//! - `datarepo-session` runs statements through a `Connection` and maps rows
//!   back into `Managed` entities.
//! - `datarepo-memory` implements `Connection`.
//!
//! Most applications should use the `datarepo` facade.

pub mod catalog;
pub mod connection;
pub mod entity;
pub mod error;
pub mod field;
pub mod relationship;
pub mod row;
pub mod statement;
pub mod types;
pub mod value;

pub use catalog::{
    CatalogBuilder, DescriptorBuilder, EntityDescriptor, LifecycleCallback, LifecyclePhase,
    NamedGraph, SchemaCatalog,
};
pub use connection::Connection;
pub use entity::{Entity, FieldValues, Managed};
pub use error::{ClosedState, Error, Result, StoreError};
pub use field::FieldInfo;
pub use relationship::{FetchMode, Lazy, RelationSlot, RelationshipInfo, RelationshipKind};
pub use row::Row;
pub use statement::{
    Assignment, ColumnRef, CompareOp, Condition, Delete, Insert, Join, JoinKind, Operand,
    OrderItem, RowLock, ScalarExpr, Select, SelectItem, Statement, TableRef, Update,
};
pub use types::SqlType;
pub use value::{FromValue, LIKE_ESCAPE, Value};
