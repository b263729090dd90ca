//! The `Entity` trait and managed handles.
//!
//! An entity maps a Rust struct onto one table. Scalar fields are described
//! by [`FieldInfo`]; to-one relationships are [`Lazy`](crate::Lazy) slots
//! reachable through [`Entity::relation`].

use std::any::Any;
use std::cell::{BorrowError, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::catalog::DescriptorBuilder;
use crate::error::{Error, Result};
use crate::field::FieldInfo;
use crate::relationship::{RelationSlot, RelationshipInfo};
use crate::value::{FromValue, Value};

/// Trait for types that map to a database table.
///
/// # Example
///
/// ```ignore
/// impl Entity for Team {
///     const ENTITY_NAME: &'static str = "Team";
///     const TABLE_NAME: &'static str = "team";
///
///     fn fields() -> &'static [FieldInfo] {
///         const FIELDS: &[FieldInfo] = &[
///             FieldInfo::new("id", SqlType::BigInt).column("team_id").primary_key().generated(),
///             FieldInfo::new("name", SqlType::Text),
///         ];
///         FIELDS
///     }
///
///     fn to_values(&self) -> Vec<Value> {
///         vec![self.id.into(), self.name.clone().into()]
///     }
///
///     fn from_values(values: &FieldValues<'_>) -> Result<Self> {
///         Ok(Team { id: values.get("id")?, name: values.get("name")? })
///     }
///
///     fn id(&self) -> Value { self.id.into() }
///     fn set_id(&mut self, id: Value) { self.id = id.as_i64(); }
/// }
/// ```
pub trait Entity: Sized + 'static {
    /// Name used in query strings and by the catalog.
    const ENTITY_NAME: &'static str;

    /// Backing table.
    const TABLE_NAME: &'static str;

    /// Scalar fields in column order.
    fn fields() -> &'static [FieldInfo];

    /// Relationship metadata.
    fn relationships() -> &'static [RelationshipInfo] {
        &[]
    }

    /// Register named entity graphs and lifecycle callbacks.
    fn describe(descriptor: DescriptorBuilder<Self>) -> DescriptorBuilder<Self> {
        descriptor
    }

    /// Field values in the order of [`Entity::fields`].
    fn to_values(&self) -> Vec<Value>;

    /// Construct an instance from values in the order of [`Entity::fields`].
    ///
    /// Relationship slots should be left unresolved; the engine installs
    /// foreign keys after construction.
    fn from_values(values: &FieldValues<'_>) -> Result<Self>;

    /// Primary key value (NULL when not assigned).
    fn id(&self) -> Value;

    /// Assign the primary key.
    fn set_id(&mut self, id: Value);

    /// Whether `save` should persist rather than merge.
    fn is_new(&self) -> bool {
        self.id().is_null()
    }

    /// Borrow a to-one relationship slot by field name.
    fn relation(&self, _name: &str) -> Option<&dyn RelationSlot> {
        None
    }

    /// Mutably borrow a to-one relationship slot by field name.
    fn relation_mut(&mut self, _name: &str) -> Option<&mut dyn RelationSlot> {
        None
    }
}

/// Field values handed to [`Entity::from_values`].
#[derive(Debug, Clone, Copy)]
pub struct FieldValues<'a> {
    entity: &'static str,
    fields: &'static [FieldInfo],
    values: &'a [Value],
}

impl<'a> FieldValues<'a> {
    /// Wrap `values`, which must be aligned with `fields`.
    pub fn new(entity: &'static str, fields: &'static [FieldInfo], values: &'a [Value]) -> Self {
        debug_assert_eq!(fields.len(), values.len());
        Self {
            entity,
            fields,
            values,
        }
    }

    /// Raw value of a field.
    pub fn value(&self, field: &str) -> Result<&'a Value> {
        self.fields
            .iter()
            .position(|f| f.name == field)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| Error::Mapping {
                column: format!("{}.{field}", self.entity),
                reason: "unknown field".to_string(),
            })
    }

    /// Typed value of a field.
    pub fn get<T: FromValue>(&self, field: &str) -> Result<T> {
        let value = self.value(field)?;
        T::from_value(value).ok_or_else(|| Error::Mapping {
            column: format!("{}.{field}", self.entity),
            reason: format!("unexpected {} value", value.type_name()),
        })
    }
}

/// Shared handle to an entity instance owned by a unit of work.
///
/// Two handles to the same row inside one unit of work are always the same
/// allocation, which [`Managed::ptr_eq`] checks.
pub struct Managed<E>(Rc<RefCell<E>>);

impl<E: 'static> Managed<E> {
    /// Wrap a new instance.
    pub fn new(entity: E) -> Self {
        Self(Rc::new(RefCell::new(entity)))
    }

    /// Immutable borrow. Panics if mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, E> {
        self.0.borrow()
    }

    /// Mutable borrow. Panics if already borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, E> {
        self.0.borrow_mut()
    }

    /// Immutable borrow that fails instead of panicking.
    pub fn try_borrow(&self) -> std::result::Result<Ref<'_, E>, BorrowError> {
        self.0.try_borrow()
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Type-erased handle.
    pub fn to_any(&self) -> Rc<dyn Any> {
        self.0.clone()
    }

    /// Recover a typed handle from [`Managed::to_any`].
    pub fn from_any(any: Rc<dyn Any>) -> Option<Self> {
        any.downcast::<RefCell<E>>().ok().map(Self)
    }
}

impl<E> Clone for Managed<E> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<E: fmt::Debug> fmt::Debug for Managed<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(entity) => f.debug_tuple("Managed").field(&*entity).finish(),
            Err(_) => f.write_str("Managed(<borrowed>)"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::SqlType;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Widget {
        pub id: Option<i64>,
        pub label: String,
    }

    impl Entity for Widget {
        const ENTITY_NAME: &'static str = "Widget";
        const TABLE_NAME: &'static str = "widget";

        fn fields() -> &'static [FieldInfo] {
            const FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id", SqlType::BigInt)
                    .column("widget_id")
                    .primary_key()
                    .generated(),
                FieldInfo::new("label", SqlType::Text),
            ];
            FIELDS
        }

        fn to_values(&self) -> Vec<Value> {
            vec![self.id.into(), self.label.clone().into()]
        }

        fn from_values(values: &FieldValues<'_>) -> Result<Self> {
            Ok(Widget {
                id: values.get("id")?,
                label: values.get("label")?,
            })
        }

        fn id(&self) -> Value {
            self.id.into()
        }

        fn set_id(&mut self, id: Value) {
            self.id = id.as_i64();
        }
    }

    #[test]
    fn test_from_values_roundtrip_through_field_names() {
        let values = vec![Value::BigInt(4), Value::from("gear")];
        let widget = Widget::from_values(&FieldValues::new("Widget", Widget::fields(), &values))
            .unwrap();
        assert_eq!(widget.id, Some(4));
        assert_eq!(widget.label, "gear");
        assert!(!widget.is_new());
    }

    #[test]
    fn test_field_values_reports_entity_and_field() {
        let values = vec![Value::from("x"), Value::from("gear")];
        let err = Widget::from_values(&FieldValues::new("Widget", Widget::fields(), &values))
            .unwrap_err();
        match err {
            Error::Mapping { column, .. } => assert_eq!(column, "Widget.id"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_managed_identity() {
        let a = Managed::new(Widget { id: None, label: "a".into() });
        let b = a.clone();
        let c = Managed::new(Widget { id: None, label: "a".into() });
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));

        b.borrow_mut().label = "changed".into();
        assert_eq!(a.borrow().label, "changed");

        let back = Managed::<Widget>::from_any(a.to_any()).unwrap();
        assert!(back.ptr_eq(&a));
        assert!(Managed::<String>::from_any(a.to_any()).is_none());
    }
}
