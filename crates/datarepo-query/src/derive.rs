//! Method-name query derivation.
//!
//! Compiles names such as `findTop3DistinctByUsernameAndAgeGreaterThanOrderByAgeDesc`
//! into a [`DerivedQuery`]:
//!
//! ```text
//! <prefix><subject words>By<part>((And|Or)<part>)*[OrderBy<prop>[Asc|Desc]...]
//! ```
//!
//! Prefixes are `find`, `read`, `get`, `query`, `stream`, `count` and
//! `exists`. Subject words other than `Distinct`, `First`, `Top<N>` and `One`
//! are descriptive and ignored.

use std::sync::OnceLock;

use datarepo_core::{CompareOp, EntityDescriptor, Error, Operand, Result, SchemaCatalog, Value};
use regex::Regex;

use crate::paging::{Direction, Order, Sort};
use crate::param::{ParamDecl, ParamKind, bindable};
use crate::predicate::{Predicate, PropertyPath, Wildcard};

/// How many results a query produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Any number of rows.
    Collection,
    /// At most one row; more is a `NonUniqueResult`.
    Single,
    /// The first N rows.
    First(u64),
    /// A row count.
    Count,
    /// Whether any row matches.
    Exists,
}

/// Output of the derivator.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedQuery {
    pub method: String,
    pub cardinality: Cardinality,
    pub distinct: bool,
    pub predicate: Option<Predicate>,
    pub sort: Sort,
    /// `LIKE` wildcards per bindable parameter.
    pub wildcards: Vec<Wildcard>,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Compare(CompareOp),
    Wild(Wildcard),
    In { negated: bool },
    Null { negated: bool },
    Bool(bool),
    Between,
}

impl Op {
    const fn arity(self) -> usize {
        match self {
            Op::Null { .. } | Op::Bool(_) => 0,
            Op::Between => 2,
            _ => 1,
        }
    }
}

// Longer keywords first where one is a suffix of another.
const OPERATORS: &[(&str, Op)] = &[
    ("IsNotNull", Op::Null { negated: true }),
    ("NotNull", Op::Null { negated: true }),
    ("IsNull", Op::Null { negated: false }),
    ("Null", Op::Null { negated: false }),
    ("GreaterThanEqual", Op::Compare(CompareOp::Ge)),
    ("GreaterThan", Op::Compare(CompareOp::Gt)),
    ("LessThanEqual", Op::Compare(CompareOp::Le)),
    ("LessThan", Op::Compare(CompareOp::Lt)),
    ("Between", Op::Between),
    ("NotLike", Op::Compare(CompareOp::NotLike)),
    ("Like", Op::Compare(CompareOp::Like)),
    ("StartingWith", Op::Wild(Wildcard::Suffix)),
    ("StartsWith", Op::Wild(Wildcard::Suffix)),
    ("EndingWith", Op::Wild(Wildcard::Prefix)),
    ("EndsWith", Op::Wild(Wildcard::Prefix)),
    ("Containing", Op::Wild(Wildcard::Both)),
    ("Contains", Op::Wild(Wildcard::Both)),
    ("NotIn", Op::In { negated: true }),
    ("In", Op::In { negated: false }),
    ("IsTrue", Op::Bool(true)),
    ("True", Op::Bool(true)),
    ("IsFalse", Op::Bool(false)),
    ("False", Op::Bool(false)),
    ("IsNot", Op::Compare(CompareOp::Ne)),
    ("Not", Op::Compare(CompareOp::Ne)),
    ("Equals", Op::Compare(CompareOp::Eq)),
    ("Is", Op::Compare(CompareOp::Eq)),
];

fn method_regex() -> &'static std::result::Result<Regex, regex::Error> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(find|read|get|query|stream|count|exists)(\w*?)(?:By(\w*))?$"))
}

fn word_regex() -> &'static std::result::Result<Regex, regex::Error> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Z][a-z]*|[0-9]+"))
}

/// Derives queries for one root entity.
pub struct Derivator<'a> {
    catalog: &'a SchemaCatalog,
    root: &'a EntityDescriptor,
}

impl<'a> Derivator<'a> {
    pub fn new(catalog: &'a SchemaCatalog, root: &'a EntityDescriptor) -> Self {
        Self { catalog, root }
    }

    /// Derive a query from `method` and its declared parameters.
    #[tracing::instrument(level = "debug", skip(self, params), fields(entity = self.root.name()))]
    pub fn derive(&self, method: &str, params: &[ParamDecl]) -> Result<DerivedQuery> {
        let regex = method_regex()
            .as_ref()
            .map_err(|e| Error::derivation(method, e.to_string()))?;
        let caps = regex.captures(method).ok_or_else(|| {
            Error::derivation(
                method,
                "expected find/read/get/query/stream/count/exists prefix",
            )
        })?;
        let prefix = caps.get(1).map_or("", |m| m.as_str());
        let subject = caps.get(2).map_or("", |m| m.as_str());
        let criteria = caps.get(3).map(|m| m.as_str());

        let (mut cardinality, distinct) = self.parse_subject(method, subject)?;
        match prefix {
            "count" => cardinality = Cardinality::Count,
            "exists" => cardinality = Cardinality::Exists,
            _ => {}
        }

        let (predicate_part, order_part) = match criteria {
            None => ("", None),
            Some("") => return Err(Error::derivation(method, "no criteria after `By`")),
            Some(c) => split_order_by(c),
        };

        let slots: Vec<&ParamDecl> = bindable(params).collect();
        let mut wildcards = vec![Wildcard::None; slots.len()];
        let mut cursor = 0;
        let mut predicate = None;
        if !predicate_part.is_empty() {
            let mut disjunction: Option<Predicate> = None;
            for branch in split_keyword(predicate_part, "Or") {
                let mut conjunction: Option<Predicate> = None;
                for part in split_keyword(branch, "And") {
                    let node =
                        self.parse_part(method, part, &slots, &mut cursor, &mut wildcards)?;
                    conjunction = Some(match conjunction {
                        Some(c) => c.and(node),
                        None => node,
                    });
                }
                if let Some(c) = conjunction {
                    disjunction = Some(match disjunction {
                        Some(d) => d.or(c),
                        None => c,
                    });
                }
            }
            predicate = disjunction;
        }
        if cursor != slots.len() {
            return Err(Error::derivation(
                method,
                format!(
                    "method declares {} bindable parameters but the name consumes {cursor}",
                    slots.len()
                ),
            ));
        }

        let sort = match order_part {
            Some(order) => self.parse_order(method, order)?,
            None => Sort::unsorted(),
        };

        tracing::debug!(method, ?cardinality, distinct, "Derived query");
        Ok(DerivedQuery {
            method: method.to_string(),
            cardinality,
            distinct,
            predicate,
            sort,
            wildcards,
        })
    }

    fn parse_subject(&self, method: &str, subject: &str) -> Result<(Cardinality, bool)> {
        let words = word_regex()
            .as_ref()
            .map_err(|e| Error::derivation(method, e.to_string()))?;
        let tokens: Vec<&str> = words.find_iter(subject).map(|m| m.as_str()).collect();
        let mut cardinality = Cardinality::Collection;
        let mut distinct = false;
        let mut i = 0;
        while i < tokens.len() {
            match tokens[i] {
                "Distinct" => distinct = true,
                "One" => cardinality = Cardinality::Single,
                "First" | "Top" => {
                    let n = match tokens.get(i + 1).and_then(|t| t.parse::<u64>().ok()) {
                        Some(n) => {
                            i += 1;
                            n
                        }
                        None => 1,
                    };
                    if n == 0 {
                        return Err(Error::derivation(method, "result limit must be positive"));
                    }
                    cardinality = Cardinality::First(n);
                }
                _ => {}
            }
            i += 1;
        }
        Ok((cardinality, distinct))
    }

    fn parse_part(
        &self,
        method: &str,
        part: &str,
        slots: &[&ParamDecl],
        cursor: &mut usize,
        wildcards: &mut [Wildcard],
    ) -> Result<Predicate> {
        let (path, op) = OPERATORS
            .iter()
            .filter(|(kw, _)| part.len() > kw.len() && part.ends_with(kw))
            .find_map(|(kw, op)| {
                self.resolve(self.root, &part[..part.len() - kw.len()])
                    .map(|path| (path, *op))
            })
            .or_else(|| {
                self.resolve(self.root, part)
                    .map(|path| (path, Op::Compare(CompareOp::Eq)))
            })
            .ok_or_else(|| {
                Error::derivation(
                    method,
                    format!("no property matches `{part}` on `{}`", self.root.name()),
                )
            })?;

        let first = *cursor;
        if first + op.arity() > slots.len() {
            return Err(Error::derivation(
                method,
                format!("`{part}` needs {} argument(s) but too few are declared", op.arity()),
            ));
        }
        for slot in &slots[first..first + op.arity()] {
            let expected = match op {
                Op::In { .. } => ParamKind::Collection,
                _ => ParamKind::Scalar,
            };
            if slot.kind != expected {
                return Err(Error::derivation(
                    method,
                    format!("parameter `{}` must be {expected:?} for `{part}`", slot.name),
                ));
            }
        }
        *cursor += op.arity();

        Ok(match op {
            Op::Compare(op) => Predicate::Comparison {
                path,
                op,
                operand: Operand::Param(first),
            },
            Op::Wild(wildcard) => {
                wildcards[first] = wildcard;
                Predicate::Comparison {
                    path,
                    op: CompareOp::Like,
                    operand: Operand::Param(first),
                }
            }
            Op::In { negated } => Predicate::In {
                path,
                operand: Operand::Param(first),
                negated,
            },
            Op::Null { negated } => Predicate::IsNull { path, negated },
            Op::Bool(b) => Predicate::Comparison {
                path,
                op: CompareOp::Eq,
                operand: Operand::Literal(Value::Bool(b)),
            },
            Op::Between => Predicate::Between {
                path,
                low: Operand::Param(first),
                high: Operand::Param(first + 1),
            },
        })
    }

    fn parse_order(&self, method: &str, order: &str) -> Result<Sort> {
        let mut orders = Vec::new();
        let mut rest = order;
        while !rest.is_empty() {
            let (property, direction, next) = match find_direction(rest) {
                Some((at, direction, len)) => (&rest[..at], direction, &rest[at + len..]),
                None => (rest, Direction::Asc, ""),
            };
            let path = self.resolve(self.root, property).ok_or_else(|| {
                Error::derivation(method, format!("cannot order by unknown property `{property}`"))
            })?;
            orders.push(Order {
                property: path.to_string(),
                direction,
            });
            rest = next;
        }
        if orders.is_empty() {
            return Err(Error::derivation(method, "`OrderBy` without a property"));
        }
        Ok(Sort::from(orders))
    }

    /// Resolve a CamelCase property against `entity`, following to-one
    /// relationships for nested names such as `TeamName`.
    fn resolve(&self, entity: &EntityDescriptor, camel: &str) -> Option<PropertyPath> {
        self.resolve_key(entity, &normalize(camel))
    }

    fn resolve_key(&self, entity: &EntityDescriptor, key: &str) -> Option<PropertyPath> {
        if key.is_empty() {
            return None;
        }
        if let Some(field) = entity.fields().iter().find(|f| normalize(f.name) == key) {
            return Some(PropertyPath::parse(field.name));
        }
        let owning: Vec<_> = entity.owning_relationships().collect();
        if let Some(rel) = owning.iter().find(|r| normalize(r.name) == key) {
            return Some(PropertyPath::parse(rel.name));
        }
        owning.iter().find_map(|rel| {
            let name = normalize(rel.name);
            let rest = key.strip_prefix(name.as_str())?;
            let target = self.catalog.descriptor(rel.target).ok()?;
            let nested = self.resolve_key(target, rest)?;
            let mut segments = vec![rel.name.to_string()];
            segments.extend(nested.segments().iter().cloned());
            Some(PropertyPath::from_segments(segments))
        })
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_boundary(s: &str, at: usize) -> bool {
    s[at..].chars().next().is_none_or(char::is_uppercase)
}

/// Split on `keyword` where it starts a CamelCase word and is followed by one.
fn split_keyword<'s>(s: &'s str, keyword: &str) -> Vec<&'s str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 1;
    while i < s.len() {
        if s.is_char_boundary(i)
            && s[i..].starts_with(keyword)
            && i + keyword.len() < s.len()
            && is_boundary(s, i + keyword.len())
        {
            parts.push(&s[start..i]);
            start = i + keyword.len();
            i = start + 1;
        } else {
            i += 1;
        }
    }
    parts.push(&s[start..]);
    parts
}

fn split_order_by(criteria: &str) -> (&str, Option<&str>) {
    if let Some(order) = criteria.strip_prefix("OrderBy") {
        return ("", Some(order));
    }
    let mut i = 1;
    while i < criteria.len() {
        if criteria.is_char_boundary(i)
            && criteria[i..].starts_with("OrderBy")
            && is_boundary(criteria, i + "OrderBy".len())
        {
            return (&criteria[..i], Some(&criteria[i + "OrderBy".len()..]));
        }
        i += 1;
    }
    (criteria, None)
}

fn find_direction(s: &str) -> Option<(usize, Direction, usize)> {
    s.char_indices().skip(1).find_map(|(i, _)| {
        [("Desc", Direction::Desc), ("Asc", Direction::Asc)]
            .into_iter()
            .find(|(kw, _)| s[i..].starts_with(kw) && is_boundary(s, i + kw.len()))
            .map(|(kw, dir)| (i, dir, kw.len()))
    })
}
