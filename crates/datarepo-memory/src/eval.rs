//! Statement evaluation over in-memory tables.
//!
//! Conditions use SQL three-valued logic: a comparison against NULL is
//! unknown, and unknown rows are filtered out.

use std::cmp::Ordering;
use std::sync::Arc;

use datarepo_core::{
    ColumnRef, CompareOp, Condition, JoinKind, Operand, ScalarExpr, Select, SelectItem,
    StoreError, Value,
};

use crate::store::{Database, LockKey, Table, lock_key};

/// Tables visible to a statement, by alias.
pub(crate) struct Scope<'a> {
    sources: Vec<(&'a str, &'a Table)>,
}

/// One candidate row: a slot per source, `None` for an unmatched outer join.
pub(crate) type Tuple<'a> = Vec<Option<&'a [Value]>>;

impl<'a> Scope<'a> {
    pub fn single(alias: &'a str, table: &'a Table) -> Self {
        Self {
            sources: vec![(alias, table)],
        }
    }

    fn resolve(&self, column: &ColumnRef) -> Result<(usize, usize), StoreError> {
        let (source, (_, table)) = self
            .sources
            .iter()
            .enumerate()
            .find(|(_, (alias, _))| *alias == column.alias)
            .ok_or_else(|| StoreError::NoSuchTable(column.alias.clone()))?;
        let index = table
            .column_index(&column.column)
            .ok_or_else(|| StoreError::NoSuchColumn(column.label()))?;
        Ok((source, index))
    }

    fn value<'t>(&self, tuple: &Tuple<'t>, column: &ColumnRef) -> Result<&'t Value, StoreError> {
        static NULL: Value = Value::Null;
        let (source, index) = self.resolve(column)?;
        Ok(tuple[source].map_or(&NULL, |row| &row[index]))
    }

    /// Evaluate a filter; `None` is SQL unknown.
    pub fn test(
        &self,
        tuple: &Tuple<'_>,
        condition: &Condition,
        params: &[Value],
    ) -> Result<Option<bool>, StoreError> {
        Ok(match condition {
            Condition::Compare {
                column,
                op,
                operand,
            } => {
                let lhs = self.value(tuple, column)?;
                let rhs = operand_value(operand, params)?;
                compare(lhs, *op, rhs)
            }
            Condition::In {
                column,
                operand,
                negated,
            } => {
                let lhs = self.value(tuple, column)?;
                let list = operand_value(operand, params)?;
                let items = list.as_array().ok_or_else(|| {
                    StoreError::TypeMismatch(format!("IN expects a list, got {}", list.type_name()))
                })?;
                if lhs.is_null() {
                    None
                } else {
                    Some(items.iter().any(|item| lhs.sql_eq(item)) != *negated)
                }
            }
            Condition::IsNull { column, negated } => {
                Some(self.value(tuple, column)?.is_null() != *negated)
            }
            Condition::Between { column, low, high } => {
                let value = self.value(tuple, column)?;
                let low = value.compare(operand_value(low, params)?);
                let high = value.compare(operand_value(high, params)?);
                match (low, high) {
                    (Some(l), Some(h)) => Some(l != Ordering::Less && h != Ordering::Greater),
                    _ => None,
                }
            }
            Condition::And(l, r) => match (self.test(tuple, l, params)?, self.test(tuple, r, params)?) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Condition::Or(l, r) => match (self.test(tuple, l, params)?, self.test(tuple, r, params)?) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
        })
    }

    /// Evaluate the right-hand side of an UPDATE assignment.
    pub fn scalar(
        &self,
        tuple: &Tuple<'_>,
        expr: &ScalarExpr,
        params: &[Value],
    ) -> Result<Value, StoreError> {
        match expr {
            ScalarExpr::Column(column) => Ok(self.value(tuple, column)?.clone()),
            ScalarExpr::Operand(operand) => Ok(operand_value(operand, params)?.clone()),
            ScalarExpr::Add(l, r) | ScalarExpr::Sub(l, r) => {
                let lhs = self.scalar(tuple, l, params)?;
                let rhs = self.scalar(tuple, r, params)?;
                let result = if matches!(expr, ScalarExpr::Add(..)) {
                    lhs.checked_add(&rhs)
                } else {
                    lhs.checked_sub(&rhs)
                };
                result.ok_or_else(|| {
                    StoreError::TypeMismatch(format!(
                        "cannot apply arithmetic to {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    ))
                })
            }
        }
    }
}

pub(crate) fn operand_value<'v>(
    operand: &'v Operand,
    params: &'v [Value],
) -> Result<&'v Value, StoreError> {
    match operand {
        Operand::Param(i) => params.get(*i).ok_or(StoreError::MissingParameter(i + 1)),
        Operand::Literal(value) => Ok(value),
    }
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> Option<bool> {
    if lhs.is_null() || rhs.is_null() {
        return None;
    }
    match op {
        CompareOp::Like => return Some(lhs.like(rhs)),
        CompareOp::NotLike => return Some(!lhs.like(rhs)),
        _ => {}
    }
    let ordering = lhs.compare(rhs)?;
    Some(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Like | CompareOp::NotLike => false,
    })
}

/// NULLs sort first.
fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

/// Output of a SELECT.
pub(crate) struct Selected {
    pub columns: Arc<[String]>,
    pub rows: Vec<Vec<Value>>,
    /// Root-table rows behind `rows`, for row locks.
    pub keys: Vec<LockKey>,
}

/// Run a SELECT against the database.
pub(crate) fn select(
    db: &Database,
    select: &Select,
    params: &[Value],
) -> Result<Selected, StoreError> {
    let root = db.table(&select.from.table)?;
    let mut scope = Scope::single(select.from.alias.as_str(), root);
    let mut tuples: Vec<Tuple<'_>> = root.rows.iter().map(|r| vec![Some(r.as_slice())]).collect();

    for join in &select.joins {
        let table = db.table(&join.table.table)?;
        scope.sources.push((join.table.alias.as_str(), table));
        let right = table
            .column_index(&join.right.column)
            .ok_or_else(|| StoreError::NoSuchColumn(join.right.label()))?;
        let mut joined = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let left = scope.value(&tuple, &join.left)?;
            let matches: Vec<&[Value]> = table
                .rows
                .iter()
                .filter(|row| left.sql_eq(&row[right]))
                .map(Vec::as_slice)
                .collect();
            if matches.is_empty() {
                if join.kind == JoinKind::LeftOuter {
                    let mut tuple = tuple;
                    tuple.push(None);
                    joined.push(tuple);
                }
                continue;
            }
            for row in matches {
                let mut extended = tuple.clone();
                extended.push(Some(row));
                joined.push(extended);
            }
        }
        tuples = joined;
    }

    if let Some(filter) = &select.filter {
        let mut kept = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            if scope.test(&tuple, filter, params)? == Some(true) {
                kept.push(tuple);
            }
        }
        tuples = kept;
    }

    if select.is_count() {
        let count = i64::try_from(tuples.len()).unwrap_or(i64::MAX);
        return Ok(Selected {
            columns: Arc::from(vec!["count".to_string()]),
            rows: vec![vec![Value::BigInt(count)]],
            keys: Vec::new(),
        });
    }

    if !select.order_by.is_empty() {
        let mut keyed = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let key = select
                .order_by
                .iter()
                .map(|o| scope.value(&tuple, &o.column).cloned())
                .collect::<Result<Vec<_>, _>>()?;
            keyed.push((key, tuple));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            select
                .order_by
                .iter()
                .zip(a.iter().zip(b))
                .map(|(o, (x, y))| {
                    let ord = order_values(x, y);
                    if o.descending { ord.reverse() } else { ord }
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        tuples = keyed.into_iter().map(|(_, t)| t).collect();
    }

    let mut rows = Vec::with_capacity(tuples.len());
    let mut keys = Vec::with_capacity(tuples.len());
    for tuple in &tuples {
        let row = select
            .items
            .iter()
            .map(|item| match item {
                SelectItem::Column(c) => scope.value(tuple, c).cloned(),
                SelectItem::CountStar => Err(StoreError::Unsupported(
                    "COUNT(*) mixed with columns".to_string(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if select.distinct && rows.contains(&row) {
            continue;
        }
        rows.push(row);
        if let Some(root_row) = tuple[0] {
            keys.push(lock_key(&root.name, &root_row[root.key]));
        }
    }

    let offset = usize::try_from(select.offset.unwrap_or(0)).unwrap_or(usize::MAX);
    let limit = select
        .limit
        .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
    let rows: Vec<_> = rows.into_iter().skip(offset).take(limit).collect();
    let keys: Vec<_> = keys.into_iter().skip(offset).take(limit).collect();

    let columns: Vec<String> = select
        .items
        .iter()
        .map(|item| match item {
            SelectItem::Column(c) => c.label(),
            SelectItem::CountStar => "count".to_string(),
        })
        .collect();

    Ok(Selected {
        columns: Arc::from(columns),
        rows,
        keys,
    })
}
