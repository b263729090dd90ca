//! Structured statements passed across the store boundary.
//!
//! Statements are data, not SQL text: the store interprets them directly and
//! [`Statement::to_sql`] renders them for logging and error messages. Bound
//! parameters render as `$n`; literals are redacted to `?`.

use std::fmt::{self, Write};

use crate::value::{LIKE_ESCAPE, Value};

/// A table with the alias used to qualify its columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
}

impl TableRef {
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
        }
    }
}

/// A column qualified by a table alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            column: column.into(),
        }
    }

    /// Result label: `alias.column`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.alias, self.column)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.alias, self.column)
    }
}

/// Join type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

/// `JOIN table alias ON left = right`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub left: ColumnRef,
    pub right: ColumnRef,
}

/// Value side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Zero-based index into the bound parameter list.
    Param(usize),
    /// Literal from a hand-written query.
    Literal(Value),
}

impl Operand {
    /// Resolve against bound parameters.
    pub fn resolve<'a>(&'a self, params: &'a [Value]) -> Option<&'a Value> {
        match self {
            Operand::Param(i) => params.get(*i),
            Operand::Literal(v) => Some(v),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Param(i) => write!(f, "${}", i + 1),
            Operand::Literal(_) => f.write_str("?"),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
}

impl CompareOp {
    pub const fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
        }
    }
}

/// WHERE clause tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        column: ColumnRef,
        op: CompareOp,
        operand: Operand,
    },
    In {
        column: ColumnRef,
        operand: Operand,
        negated: bool,
    },
    IsNull {
        column: ColumnRef,
        negated: bool,
    },
    Between {
        column: ColumnRef,
        low: Operand,
        high: Operand,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Conjunction, absorbing a missing side.
    pub fn and(lhs: Option<Condition>, rhs: Option<Condition>) -> Option<Condition> {
        match (lhs, rhs) {
            (Some(l), Some(r)) => Some(Condition::And(Box::new(l), Box::new(r))),
            (l, r) => l.or(r),
        }
    }

    fn render(&self, out: &mut String, nested: bool) -> fmt::Result {
        match self {
            Condition::Compare {
                column,
                op,
                operand,
            } => {
                write!(out, "{column} {} {operand}", op.as_sql())?;
                if matches!(op, CompareOp::Like | CompareOp::NotLike) {
                    write!(out, " ESCAPE '{LIKE_ESCAPE}'")?;
                }
                Ok(())
            }
            Condition::In {
                column,
                operand,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                write!(out, "{column} {not}IN ({operand})")
            }
            Condition::IsNull { column, negated } => {
                let not = if *negated { "NOT " } else { "" };
                write!(out, "{column} IS {not}NULL")
            }
            Condition::Between { column, low, high } => {
                write!(out, "{column} BETWEEN {low} AND {high}")
            }
            Condition::And(l, r) => {
                l.render(out, true)?;
                out.push_str(" AND ");
                r.render(out, true)
            }
            Condition::Or(l, r) => {
                if nested {
                    out.push('(');
                }
                l.render(out, false)?;
                out.push_str(" OR ");
                r.render(out, false)?;
                if nested {
                    out.push(')');
                }
                Ok(())
            }
        }
    }
}

/// Projected item of a SELECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectItem {
    /// A column labeled `alias.column`.
    Column(ColumnRef),
    /// `COUNT(*)`, labeled `count`.
    CountStar,
}

/// ORDER BY item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub column: ColumnRef,
    pub descending: bool,
}

/// Row lock requested by a SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    /// `FOR SHARE`
    Share,
    /// `FOR UPDATE`
    Update,
}

/// SELECT statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub filter: Option<Condition>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub lock: Option<RowLock>,
}

impl Select {
    /// `SELECT ... FROM table alias` with no projection yet.
    pub fn from(from: TableRef) -> Self {
        Self {
            distinct: false,
            items: Vec::new(),
            from,
            joins: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            lock: None,
        }
    }

    /// Whether this is a bare `COUNT(*)`.
    pub fn is_count(&self) -> bool {
        matches!(self.items.as_slice(), [SelectItem::CountStar])
    }
}

/// Right-hand side of an UPDATE assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    Column(ColumnRef),
    Operand(Operand),
    Add(Box<ScalarExpr>, Box<ScalarExpr>),
    Sub(Box<ScalarExpr>, Box<ScalarExpr>),
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarExpr::Column(c) => write!(f, "{c}"),
            ScalarExpr::Operand(o) => write!(f, "{o}"),
            ScalarExpr::Add(l, r) => write!(f, "{l} + {r}"),
            ScalarExpr::Sub(l, r) => write!(f, "{l} - {r}"),
        }
    }
}

/// `column = expr` in an UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: ScalarExpr,
}

/// INSERT of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Operand>,
}

/// UPDATE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: TableRef,
    pub assignments: Vec<Assignment>,
    pub filter: Option<Condition>,
}

/// DELETE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: TableRef,
    pub filter: Option<Condition>,
}

/// Any statement the store executes.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Statement {
    /// Short keyword for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Insert(_) => "INSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
        }
    }

    /// Render as parameterized SQL with literals redacted.
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) -> fmt::Result {
        match self {
            Statement::Select(s) => render_select(s, out),
            Statement::Insert(i) => {
                write!(out, "INSERT INTO {} (", i.table)?;
                out.push_str(&i.columns.join(", "));
                out.push_str(") VALUES (");
                for (n, v) in i.values.iter().enumerate() {
                    if n > 0 {
                        out.push_str(", ");
                    }
                    write!(out, "{v}")?;
                }
                out.push(')');
                Ok(())
            }
            Statement::Update(u) => {
                write!(out, "UPDATE {} {} SET ", u.table.table, u.table.alias)?;
                for (n, a) in u.assignments.iter().enumerate() {
                    if n > 0 {
                        out.push_str(", ");
                    }
                    write!(out, "{} = {}", a.column, a.value)?;
                }
                render_where(u.filter.as_ref(), out)
            }
            Statement::Delete(d) => {
                write!(out, "DELETE FROM {} {}", d.table.table, d.table.alias)?;
                render_where(d.filter.as_ref(), out)
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

fn render_where(filter: Option<&Condition>, out: &mut String) -> fmt::Result {
    if let Some(cond) = filter {
        out.push_str(" WHERE ");
        cond.render(out, false)?;
    }
    Ok(())
}

fn render_select(s: &Select, out: &mut String) -> fmt::Result {
    out.push_str("SELECT ");
    if s.distinct {
        out.push_str("DISTINCT ");
    }
    for (n, item) in s.items.iter().enumerate() {
        if n > 0 {
            out.push_str(", ");
        }
        match item {
            SelectItem::Column(c) => write!(out, "{c}")?,
            SelectItem::CountStar => out.push_str("COUNT(*)"),
        }
    }
    write!(out, " FROM {} {}", s.from.table, s.from.alias)?;
    for join in &s.joins {
        let kind = match join.kind {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::LeftOuter => "LEFT OUTER JOIN",
        };
        write!(
            out,
            " {kind} {} {} ON {} = {}",
            join.table.table, join.table.alias, join.left, join.right
        )?;
    }
    render_where(s.filter.as_ref(), out)?;
    if !s.order_by.is_empty() {
        out.push_str(" ORDER BY ");
        for (n, o) in s.order_by.iter().enumerate() {
            if n > 0 {
                out.push_str(", ");
            }
            write!(out, "{}", o.column)?;
            if o.descending {
                out.push_str(" DESC");
            }
        }
    }
    if let Some(limit) = s.limit {
        write!(out, " LIMIT {limit}")?;
    }
    if let Some(offset) = s.offset {
        write!(out, " OFFSET {offset}")?;
    }
    match s.lock {
        Some(RowLock::Update) => out.push_str(" FOR UPDATE"),
        Some(RowLock::Share) => out.push_str(" FOR SHARE"),
        None => {}
    }
    Ok(())
}
