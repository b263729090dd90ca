//! Composable criteria built in code.

use std::fmt;
use std::marker::PhantomData;

use datarepo_core::{CompareOp, Entity, Operand, Value};

use crate::predicate::{Predicate, PropertyPath};

/// A reusable predicate over entity `E`.
///
/// Empty specifications impose no restriction and vanish when combined.
///
/// ```ignore
/// let spec = Specification::<Member>::equal("username", "m1")
///     .and(Specification::equal("team.name", "teamA"));
/// let members = repo.find_matching(&mut uow, &spec)?;
/// ```
pub struct Specification<E> {
    predicate: Option<Predicate>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Specification<E> {
    fn of(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            _entity: PhantomData,
        }
    }

    fn compare(path: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::of(Predicate::Comparison {
            path: PropertyPath::parse(path),
            op,
            operand: Operand::Literal(value.into()),
        })
    }

    /// Matches everything.
    pub fn empty() -> Self {
        Self {
            predicate: None,
            _entity: PhantomData,
        }
    }

    pub fn equal(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    pub fn not_equal(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Ne, value)
    }

    pub fn greater_than(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Gt, value)
    }

    pub fn less_than(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Lt, value)
    }

    /// `LIKE` with the pattern given verbatim.
    pub fn like(path: &str, pattern: impl Into<String>) -> Self {
        Self::compare(path, CompareOp::Like, Value::Text(pattern.into()))
    }

    pub fn in_list<V: Into<Value>>(path: &str, values: Vec<V>) -> Self {
        Self::of(Predicate::In {
            path: PropertyPath::parse(path),
            operand: Operand::Literal(Value::from(values)),
            negated: false,
        })
    }

    pub fn is_null(path: &str) -> Self {
        Self::of(Predicate::IsNull {
            path: PropertyPath::parse(path),
            negated: false,
        })
    }

    pub fn and(self, other: Self) -> Self {
        self.combine(other, Predicate::and)
    }

    pub fn or(self, other: Self) -> Self {
        self.combine(other, Predicate::or)
    }

    fn combine(self, other: Self, f: fn(Predicate, Predicate) -> Predicate) -> Self {
        let predicate = match (self.predicate, other.predicate) {
            (Some(l), Some(r)) => Some(f(l, r)),
            (l, r) => l.or(r),
        };
        Self {
            predicate,
            _entity: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.predicate.is_none()
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }
}

impl<E> Clone for Specification<E> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> fmt::Debug for Specification<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Specification")
            .field("predicate", &self.predicate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Member;

    #[test]
    fn test_empty_specifications_vanish() {
        let spec = Specification::<Member>::empty()
            .and(Specification::equal("username", "m1"))
            .or(Specification::empty());
        assert!(matches!(
            spec.predicate(),
            Some(Predicate::Comparison { op: CompareOp::Eq, .. })
        ));
        assert!(
            Specification::<Member>::empty()
                .and(Specification::empty())
                .is_empty()
        );
    }

    #[test]
    fn test_specifications_use_literals() {
        let spec = Specification::<Member>::equal("team.name", "teamA")
            .and(Specification::in_list("age", vec![10, 20]));
        assert_eq!(spec.predicate().unwrap().param_count(), 0);
        let Some(Predicate::And(l, _)) = spec.predicate() else {
            panic!("expected conjunction");
        };
        assert!(matches!(
            &**l,
            Predicate::Comparison { path, .. } if path.to_string() == "team.name"
        ));
    }
}
