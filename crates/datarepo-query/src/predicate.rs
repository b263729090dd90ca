//! Predicate trees over entity property paths.
//!
//! Both derived method names and hand-written query strings compile to the
//! same [`Predicate`] form; the plan builder later resolves property paths
//! to qualified columns and joins.

use std::fmt;

use datarepo_core::{CompareOp, LIKE_ESCAPE, Operand};

/// A dotted property path rooted at the queried entity: `age`, `team.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    segments: Vec<String>,
}

impl PropertyPath {
    /// Parse `a.b.c`.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }

    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Final segment.
    pub fn leaf(&self) -> &str {
        self.segments.last().map_or("", String::as_str)
    }

    /// Path with one more segment.
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Self { segments }
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// Wildcards added around a `LIKE` argument at bind time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Wildcard {
    #[default]
    None,
    /// `StartingWith`: `value%`
    Suffix,
    /// `EndingWith`: `%value`
    Prefix,
    /// `Containing`: `%value%`
    Both,
}

impl Wildcard {
    /// Wrap `text` in wildcards. The argument itself matches literally, so
    /// any `%`, `_` or escape character in it is escaped first.
    pub fn apply(self, text: &str) -> String {
        if self == Wildcard::None {
            return text.to_string();
        }
        let mut escaped = String::with_capacity(text.len() + 2);
        for c in text.chars() {
            if matches!(c, '%' | '_' | LIKE_ESCAPE) {
                escaped.push(LIKE_ESCAPE);
            }
            escaped.push(c);
        }
        match self {
            Wildcard::None => escaped,
            Wildcard::Suffix => format!("{escaped}%"),
            Wildcard::Prefix => format!("%{escaped}"),
            Wildcard::Both => format!("%{escaped}%"),
        }
    }
}

/// Predicate tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Comparison {
        path: PropertyPath,
        op: CompareOp,
        operand: Operand,
    },
    In {
        path: PropertyPath,
        operand: Operand,
        negated: bool,
    },
    IsNull {
        path: PropertyPath,
        negated: bool,
    },
    Between {
        path: PropertyPath,
        low: Operand,
        high: Operand,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    #[must_use]
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// Visit every property path in the tree.
    pub fn for_each_path<'a>(&'a self, f: &mut impl FnMut(&'a PropertyPath)) {
        match self {
            Predicate::Comparison { path, .. }
            | Predicate::In { path, .. }
            | Predicate::IsNull { path, .. }
            | Predicate::Between { path, .. } => f(path),
            Predicate::And(l, r) | Predicate::Or(l, r) => {
                l.for_each_path(f);
                r.for_each_path(f);
            }
        }
    }

    /// Number of bound-parameter slots referenced (highest index + 1).
    pub fn param_count(&self) -> usize {
        fn operand(o: &Operand) -> usize {
            match o {
                Operand::Param(i) => i + 1,
                Operand::Literal(_) => 0,
            }
        }
        match self {
            Predicate::Comparison { operand: o, .. } | Predicate::In { operand: o, .. } => {
                operand(o)
            }
            Predicate::IsNull { .. } => 0,
            Predicate::Between { low, high, .. } => operand(low).max(operand(high)),
            Predicate::And(l, r) | Predicate::Or(l, r) => l.param_count().max(r.param_count()),
        }
    }
}
