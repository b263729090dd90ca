//! Identity map entries.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

use datarepo_core::{EntityDescriptor, Value};

/// Identity-map key: entity name plus a hash of the primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    entity: &'static str,
    pk_hash: u64,
}

impl ObjectKey {
    pub fn new(entity: &'static str, key: &Value) -> Self {
        let mut hasher = DefaultHasher::new();
        hash_value(key, &mut hasher);
        Self {
            entity,
            pk_hash: hasher.finish(),
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }
}

/// Hash a key so that values the store treats as equal collide: `Int(7)`
/// and `BigInt(7)` name the same row.
fn hash_value(value: &Value, hasher: &mut impl Hasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int(_) | Value::BigInt(_) => {
            2u8.hash(hasher);
            value.as_i64().hash(hasher);
        }
        Value::Double(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Text(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Timestamp(ts) => {
            5u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Array(items) => {
            6u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
    }
}

/// State of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Saved in this unit of work; INSERT on flush.
    New,
    /// Loaded from, or already written to, the store.
    Persistent,
    /// Marked for removal; DELETE on flush.
    Deleted,
}

/// One identity-map entry.
pub(crate) struct TrackedObject {
    pub descriptor: Arc<EntityDescriptor>,
    /// `RefCell<E>` behind a `Managed<E>` handle.
    pub object: Rc<dyn Any>,
    pub key: Value,
    /// Row as last written or loaded; `None` for read-only instances, which
    /// are never dirty-checked.
    pub snapshot: Option<Vec<Value>>,
    pub state: ObjectState,
}

impl TrackedObject {
    /// Current stored row of the instance.
    pub fn values(&self) -> datarepo_core::Result<Vec<Value>> {
        self.descriptor.instance_values(&*self.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_hash_consistency() {
        assert_eq!(
            ObjectKey::new("Member", &Value::BigInt(42)),
            ObjectKey::new("Member", &Value::BigInt(42))
        );
    }

    #[test]
    fn test_object_key_integer_widths_collide() {
        assert_eq!(
            ObjectKey::new("Member", &Value::Int(42)),
            ObjectKey::new("Member", &Value::BigInt(42))
        );
    }

    #[test]
    fn test_object_key_different_values() {
        assert_ne!(
            ObjectKey::new("Member", &Value::BigInt(42)),
            ObjectKey::new("Member", &Value::BigInt(43))
        );
        assert_ne!(
            ObjectKey::new("Member", &Value::BigInt(42)),
            ObjectKey::new("Member", &Value::from("42"))
        );
    }

    #[test]
    fn test_object_key_is_per_entity() {
        assert_ne!(
            ObjectKey::new("Member", &Value::BigInt(1)),
            ObjectKey::new("Team", &Value::BigInt(1))
        );
        assert_eq!(ObjectKey::new("Team", &Value::BigInt(1)).entity(), "Team");
    }
}
