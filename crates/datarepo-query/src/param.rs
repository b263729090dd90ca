//! Declared repository method parameters.

use serde::{Deserialize, Serialize};

use crate::predicate::Wildcard;

/// Shape of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    /// A single value.
    Scalar,
    /// A list of values bound to `IN`.
    Collection,
    /// A [`PageRequest`](crate::PageRequest); never bound positionally.
    Pageable,
    /// A [`Sort`](crate::Sort); never bound positionally.
    Sort,
}

impl ParamKind {
    /// Whether the parameter takes a positional binding slot.
    pub const fn is_bindable(self) -> bool {
        matches!(self, ParamKind::Scalar | ParamKind::Collection)
    }
}

/// A parameter in a repository method signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub kind: ParamKind,
}

impl ParamDecl {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Scalar,
        }
    }

    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Collection,
        }
    }

    pub fn pageable() -> Self {
        Self {
            name: "pageable".to_string(),
            kind: ParamKind::Pageable,
        }
    }

    pub fn sort() -> Self {
        Self {
            name: "sort".to_string(),
            kind: ParamKind::Sort,
        }
    }
}

/// The bindable parameters of a signature, in positional order.
pub fn bindable(params: &[ParamDecl]) -> impl Iterator<Item = &ParamDecl> {
    params.iter().filter(|p| p.kind.is_bindable())
}

/// One positional slot of a compiled plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    pub name: String,
    pub kind: ParamKind,
    pub wildcard: Wildcard,
}

impl ParamSlot {
    /// Slots for every bindable declared parameter.
    pub fn from_decls(params: &[ParamDecl]) -> Vec<ParamSlot> {
        bindable(params)
            .map(|p| ParamSlot {
                name: p.name.clone(),
                kind: p.kind,
                wildcard: Wildcard::None,
            })
            .collect()
    }
}
