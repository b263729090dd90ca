//! Relationship metadata and deferred references.
//!
//! Relationships are declared as static metadata on each [`Entity`]. The
//! owning side (many-to-one) holds the foreign key and is represented on the
//! entity by a [`Lazy`] slot; the inverse side (one-to-many) is never stored
//! on the entity and is computed by querying the owning side.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::entity::{Entity, Managed};
use crate::value::Value;

/// The cardinality of a relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many-to-one: many `Member`s belong to one `Team`. Owns the foreign key.
    #[default]
    ManyToOne,
    /// One-to-many: one `Team` has many `Member`s. Inverse side.
    OneToMany,
}

/// When related rows are loaded by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// Joined into every query on the owning entity.
    Eager,
    /// Loaded on first resolution of the [`Lazy`] slot.
    #[default]
    Lazy,
}

/// Metadata about a relationship between entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the relationship field.
    pub name: &'static str,

    /// The related entity name.
    pub target: &'static str,

    /// Kind of relationship.
    pub kind: RelationshipKind,

    /// Foreign key column on the owning table (ManyToOne only).
    pub foreign_key: Option<&'static str>,

    /// For the inverse side: the many-to-one field on the target that owns
    /// the foreign key.
    pub mapped_by: Option<&'static str>,

    /// Default fetch mode.
    pub fetch: FetchMode,
}

impl RelationshipInfo {
    /// Owning many-to-one relationship stored in `foreign_key`.
    #[must_use]
    pub const fn many_to_one(
        name: &'static str,
        target: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            kind: RelationshipKind::ManyToOne,
            foreign_key: Some(foreign_key),
            mapped_by: None,
            fetch: FetchMode::Lazy,
        }
    }

    /// Inverse one-to-many relationship mapped by `mapped_by` on `target`.
    #[must_use]
    pub const fn one_to_many(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            kind: RelationshipKind::OneToMany,
            foreign_key: None,
            mapped_by: Some(mapped_by),
            fetch: FetchMode::Lazy,
        }
    }

    /// Set the default fetch mode.
    #[must_use]
    pub const fn fetch(mut self, fetch: FetchMode) -> Self {
        self.fetch = fetch;
        self
    }

    /// Whether this side holds the foreign key.
    pub const fn is_owning(&self) -> bool {
        matches!(self.kind, RelationshipKind::ManyToOne)
    }
}

/// Type-erased access to a [`Lazy`] slot.
///
/// The engine uses this to read foreign keys when writing rows, to install
/// keys when materializing rows, and to pre-fill slots from fetch joins.
pub trait RelationSlot {
    /// The foreign key currently referenced (NULL when unset).
    fn key(&self) -> Value;

    /// Reset the slot to an unloaded reference to `key`.
    fn set_key(&mut self, key: Value);

    /// Whether the target has been resolved.
    fn is_loaded(&self) -> bool;

    /// The resolved target: `None` while unresolved, `Some(None)` for a
    /// resolved NULL reference.
    fn loaded(&self) -> Option<Option<Rc<dyn Any>>>;

    /// Fill the slot with a resolved target. Returns `false` when the
    /// handle does not hold the slot's target type.
    fn fill(&mut self, target: Option<Rc<dyn Any>>) -> bool;
}

/// A deferred to-one reference.
///
/// Holds the foreign key until resolved; once resolved the target handle is
/// cached on the owning instance. While resolved, [`Lazy::key`] follows the
/// target's current primary key.
pub struct Lazy<T> {
    key: Value,
    loaded: Option<Option<Managed<T>>>,
}

impl<T: Entity> Lazy<T> {
    /// A reference to nothing (NULL foreign key).
    pub fn none() -> Self {
        Self {
            key: Value::Null,
            loaded: Some(None),
        }
    }

    /// An unresolved reference to `key`.
    pub fn from_key(key: impl Into<Value>) -> Self {
        let key = key.into();
        let loaded = if key.is_null() { Some(None) } else { None };
        Self { key, loaded }
    }

    /// A resolved reference to `target`.
    pub fn to(target: &Managed<T>) -> Self {
        Self {
            key: target.borrow().id(),
            loaded: Some(Some(target.clone())),
        }
    }

    /// The referenced key.
    pub fn key(&self) -> Value {
        if let Some(Some(target)) = &self.loaded {
            if let Ok(entity) = target.try_borrow() {
                return entity.id();
            }
        }
        self.key.clone()
    }

    /// Whether the reference has been resolved.
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// The resolved target, if resolution already happened.
    pub fn get(&self) -> Option<Option<&Managed<T>>> {
        self.loaded.as_ref().map(Option::as_ref)
    }

    /// Point the reference at `target` (or clear it).
    pub fn set(&mut self, target: Option<&Managed<T>>) {
        match target {
            Some(t) => *self = Self::to(t),
            None => *self = Self::none(),
        }
    }
}

impl<T: Entity> Default for Lazy<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            loaded: self.loaded.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("target", &T::ENTITY_NAME)
            .field("key", &self.key())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl<T: Entity> RelationSlot for Lazy<T> {
    fn key(&self) -> Value {
        Lazy::key(self)
    }

    fn set_key(&mut self, key: Value) {
        *self = Self::from_key(key);
    }

    fn is_loaded(&self) -> bool {
        Lazy::is_loaded(self)
    }

    fn loaded(&self) -> Option<Option<Rc<dyn Any>>> {
        self.loaded
            .as_ref()
            .map(|target| target.as_ref().map(Managed::to_any))
    }

    fn fill(&mut self, target: Option<Rc<dyn Any>>) -> bool {
        match target {
            None => {
                self.loaded = Some(None);
                true
            }
            Some(any) => match Managed::<T>::from_any(any) {
                Some(handle) => {
                    self.key = handle.borrow().id();
                    self.loaded = Some(Some(handle));
                    true
                }
                None => false,
            },
        }
    }
}
