//! Query derivation and planning for datarepo.
//!
//! `datarepo-query` turns repository method declarations into reusable
//! [`QueryPlan`]s.
//!
//! # Role In The Architecture
//!
//! - **Derivation**: [`Derivator`] reads a method name such as
//!   `findTop3ByTeamNameAndAgeGreaterThanOrderByUsernameDesc` into a
//!   [`DerivedQuery`].
//! - **Parsing**: [`QueryParser`] reads hand-written queries (select, bulk
//!   update and delete, DTO constructors, fetch joins).
//! - **Planning**: [`QueryPlanBuilder`] resolves property paths to joins and
//!   columns and compiles everything into core `Statement`s.
//! - **Paging**: [`PageRequest`], [`Sort`], [`Page`] and [`Slice`].
//!
//! All of this happens when a repository is built, so a bad method name or
//! query fails at startup rather than on first call.

pub mod builder;
pub mod derive;
pub mod paging;
pub mod param;
pub mod parse;
pub mod plan;
pub mod predicate;
pub mod spec;

#[cfg(test)]
mod testing;

pub use builder::{DeleteBuilder, InsertBuilder, UpdateBuilder};
pub use derive::{Cardinality, DerivedQuery, Derivator};
pub use paging::{Direction, Mapped, Order, Page, PageMeta, PageRequest, Slice, SliceMeta, Sort};
pub use param::{ParamDecl, ParamKind, ParamSlot};
pub use parse::{
    ParsedDelete, ParsedExpr, ParsedJoin, ParsedProjection, ParsedQuery, ParsedSelect,
    ParsedUpdate, QueryParser,
};
pub use plan::{EntityLayout, FetchedRelation, PlanProjection, QueryPlan, QueryPlanBuilder, Window};
pub use predicate::{Predicate, PropertyPath, Wildcard};
pub use spec::Specification;
