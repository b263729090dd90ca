//! Parser for hand-written query strings.
//!
//! Supports a JPQL-like subset:
//!
//! ```text
//! select m from Member m left join fetch m.team t where m.age > :age order by m.username desc
//! select new MemberDto(m.id, m.username, t.name) from Member m join m.team t
//! select count(m) from Member m
//! update Member m set m.age = m.age + 1 where m.age >= :age
//! delete from Member m where m.username = ?1
//! ```
//!
//! Paths are resolved against the catalog while parsing and returned
//! relative to the root entity, so `t.name` above becomes `team.name`.

use std::collections::HashMap;
use std::sync::Arc;

use datarepo_core::{
    CompareOp, EntityDescriptor, Error, JoinKind, Operand, Result, SchemaCatalog, Value,
};

use crate::paging::{Direction, Order};
use crate::param::{ParamDecl, bindable};
use crate::predicate::{Predicate, PropertyPath};

/// A parsed query string.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedQuery {
    Select(ParsedSelect),
    Update(ParsedUpdate),
    Delete(ParsedDelete),
}

/// What a SELECT returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedProjection {
    /// The root entity (`select m`).
    Root,
    /// Individual properties.
    Paths(Vec<PropertyPath>),
    /// `new Name(args...)`; `name` is the unqualified class name.
    Constructor {
        name: String,
        args: Vec<PropertyPath>,
    },
    /// `count(...)`.
    Count,
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJoin {
    pub path: PropertyPath,
    pub kind: JoinKind,
    pub fetch: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSelect {
    pub entity: String,
    pub alias: String,
    pub distinct: bool,
    pub projection: ParsedProjection,
    pub joins: Vec<ParsedJoin>,
    pub predicate: Option<Predicate>,
    pub order: Vec<Order>,
}

/// Right-hand side of a bulk assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedExpr {
    Path(PropertyPath),
    Operand(Operand),
    Add(Box<ParsedExpr>, Box<ParsedExpr>),
    Sub(Box<ParsedExpr>, Box<ParsedExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUpdate {
    pub entity: String,
    pub alias: String,
    pub assignments: Vec<(String, ParsedExpr)>,
    pub predicate: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDelete {
    pub entity: String,
    pub alias: String,
    pub predicate: Option<Predicate>,
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Named(String),
    Positional(usize),
    Sym(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: usize,
}

fn parse_error(position: usize, message: impl Into<String>) -> Error {
    Error::QueryParse {
        position,
        message: message.into(),
    }
}

const SYMBOLS: &[&str] = &[
    "<>", "!=", "<=", ">=", "=", "<", ">", "(", ")", ",", ".", "+", "-", "*",
];

fn lex(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let tok = if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            Tok::Ident(input[start..i].to_string())
        } else if c.is_ascii_digit() {
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let text = &input[start..i];
                Tok::Float(
                    text.parse()
                        .map_err(|_| parse_error(start, format!("invalid number `{text}`")))?,
                )
            } else {
                let text = &input[start..i];
                Tok::Int(
                    text.parse()
                        .map_err(|_| parse_error(start, format!("invalid number `{text}`")))?,
                )
            }
        } else if c == b'\'' {
            let mut text = String::new();
            i += 1;
            loop {
                match input[i..].chars().next() {
                    None => return Err(parse_error(start, "unterminated string literal")),
                    Some('\'') if bytes.get(i + 1) == Some(&b'\'') => {
                        text.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        text.push(ch);
                        i += ch.len_utf8();
                    }
                }
            }
            Tok::Str(text)
        } else if c == b':' {
            i += 1;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            if i == start + 1 {
                return Err(parse_error(start, "expected a parameter name after `:`"));
            }
            Tok::Named(input[start + 1..i].to_string())
        } else if c == b'?' {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let n = input[start + 1..i]
                .parse()
                .map_err(|_| parse_error(start, "expected a position after `?`"))?;
            Tok::Positional(n)
        } else if let Some(sym) = SYMBOLS.iter().find(|s| input[i..].starts_with(**s)) {
            i += sym.len();
            Tok::Sym(sym)
        } else {
            let ch = input[i..].chars().next().unwrap_or('?');
            return Err(parse_error(start, format!("unexpected character `{ch}`")));
        };
        tokens.push(Token { tok, pos: start });
    }
    tokens.push(Token {
        tok: Tok::Eof,
        pos: input.len(),
    });
    Ok(tokens)
}

const KEYWORDS: &[&str] = &[
    "select", "distinct", "from", "where", "and", "or", "not", "in", "is", "null", "between",
    "like", "order", "by", "asc", "desc", "join", "left", "outer", "inner", "fetch", "update",
    "set", "delete", "new", "count", "true", "false", "as",
];

// ============================================================================
// Parser
// ============================================================================

struct AliasTarget {
    path: PropertyPath,
    entity: Arc<EntityDescriptor>,
}

/// Raw projection captured before FROM declares the aliases.
enum RawProjection {
    Paths(Vec<(usize, Vec<String>)>),
    Constructor(String, Vec<(usize, Vec<String>)>),
    Count,
}

/// Parses query strings against a catalog and a declared parameter list.
pub struct QueryParser<'a> {
    catalog: &'a SchemaCatalog,
    params: Vec<&'a ParamDecl>,
    tokens: Vec<Token>,
    idx: usize,
    root: Option<Arc<EntityDescriptor>>,
    aliases: HashMap<String, AliasTarget>,
}

impl<'a> QueryParser<'a> {
    pub fn new(catalog: &'a SchemaCatalog, params: &'a [ParamDecl]) -> Self {
        Self {
            catalog,
            params: bindable(params).collect(),
            tokens: Vec::new(),
            idx: 0,
            root: None,
            aliases: HashMap::new(),
        }
    }

    /// Parse one statement.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn parse(mut self, query: &str) -> Result<ParsedQuery> {
        self.tokens = lex(query)?;
        let parsed = if self.peek_keyword("select") {
            ParsedQuery::Select(self.parse_select()?)
        } else if self.peek_keyword("update") {
            ParsedQuery::Update(self.parse_update()?)
        } else if self.peek_keyword("delete") {
            ParsedQuery::Delete(self.parse_delete()?)
        } else {
            return Err(self.error("expected SELECT, UPDATE or DELETE"));
        };
        if !matches!(self.peek(), Tok::Eof) {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(parsed)
    }

    // ---- token helpers ----

    fn peek(&self) -> &Tok {
        &self.tokens[self.idx.min(self.tokens.len() - 1)].tok
    }

    fn pos(&self) -> usize {
        self.tokens[self.idx.min(self.tokens.len() - 1)].pos
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> Error {
        parse_error(self.pos(), message)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Tok::Ident(id) if id.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", keyword.to_uppercase())))
        }
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Tok::Sym(s) if *s == sym) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{sym}`")))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek() {
            Tok::Ident(id) if !is_keyword(id) => {
                let id = id.clone();
                self.advance();
                Ok(id)
            }
            _ => Err(self.error("expected an identifier")),
        }
    }

    fn dotted(&mut self) -> Result<(usize, Vec<String>)> {
        let pos = self.pos();
        let mut parts = vec![self.ident()?];
        while self.eat_sym(".") {
            parts.push(self.ident()?);
        }
        Ok((pos, parts))
    }

    // ---- FROM / JOIN ----

    fn parse_root(&mut self) -> Result<(String, String)> {
        let pos = self.pos();
        let entity_name = self.ident()?;
        let entity = self
            .catalog
            .descriptor(&entity_name)
            .map_err(|_| parse_error(pos, format!("unknown entity `{entity_name}`")))?
            .clone();
        self.eat_keyword("as");
        let alias = self.ident()?;
        self.aliases.insert(
            alias.clone(),
            AliasTarget {
                path: PropertyPath::from_segments(Vec::new()),
                entity: entity.clone(),
            },
        );
        self.root = Some(entity);
        Ok((entity_name, alias))
    }

    fn parse_joins(&mut self) -> Result<Vec<ParsedJoin>> {
        let mut joins = Vec::new();
        loop {
            let kind = if self.eat_keyword("left") {
                self.eat_keyword("outer");
                JoinKind::LeftOuter
            } else if self.eat_keyword("inner") {
                JoinKind::Inner
            } else if self.peek_keyword("join") {
                JoinKind::Inner
            } else {
                break;
            };
            self.expect_keyword("join")?;
            let fetch = self.eat_keyword("fetch");
            let (pos, parts) = self.dotted()?;
            let [owner, relationship] = parts.as_slice() else {
                return Err(parse_error(pos, "join path must be `alias.relationship`"));
            };
            let parent = self
                .aliases
                .get(owner)
                .ok_or_else(|| parse_error(pos, format!("unknown alias `{owner}`")))?;
            let rel = parent.entity.relationship(relationship).ok_or_else(|| {
                parse_error(
                    pos,
                    format!(
                        "`{}` has no relationship `{relationship}`",
                        parent.entity.name()
                    ),
                )
            })?;
            if !rel.is_owning() {
                return Err(parse_error(
                    pos,
                    format!("cannot join to-many relationship `{owner}.{relationship}`"),
                ));
            }
            let path = parent.path.child(relationship);
            let target = self
                .catalog
                .descriptor(rel.target)
                .map_err(|_| parse_error(pos, format!("unknown entity `{}`", rel.target)))?
                .clone();
            self.eat_keyword("as");
            if matches!(self.peek(), Tok::Ident(id) if !is_keyword(id)) {
                let alias = self.ident()?;
                self.aliases.insert(
                    alias,
                    AliasTarget {
                        path: path.clone(),
                        entity: target,
                    },
                );
            }
            joins.push(ParsedJoin { path, kind, fetch });
        }
        Ok(joins)
    }

    /// Resolve `alias.a.b` to a root-relative path; the leaf must be a field
    /// or to-one relationship.
    fn resolve(&self, pos: usize, parts: &[String]) -> Result<PropertyPath> {
        let (alias, rest) = parts
            .split_first()
            .ok_or_else(|| parse_error(pos, "empty path"))?;
        let target = self
            .aliases
            .get(alias)
            .ok_or_else(|| parse_error(pos, format!("unknown alias `{alias}`")))?;
        if rest.is_empty() {
            return Err(parse_error(pos, format!("`{alias}` is not a property path")));
        }
        let mut entity = target.entity.clone();
        let mut path = target.path.clone();
        for (i, segment) in rest.iter().enumerate() {
            let last = i + 1 == rest.len();
            if last && entity.field(segment).is_some() {
                path = path.child(segment);
                break;
            }
            let rel = entity.relationship(segment).ok_or_else(|| {
                parse_error(
                    pos,
                    format!("`{}` has no property `{segment}`", entity.name()),
                )
            })?;
            if !rel.is_owning() {
                return Err(parse_error(
                    pos,
                    format!("cannot navigate to-many relationship `{segment}`"),
                ));
            }
            path = path.child(segment);
            if !last {
                entity = self
                    .catalog
                    .descriptor(rel.target)
                    .map_err(|_| parse_error(pos, format!("unknown entity `{}`", rel.target)))?
                    .clone();
            }
        }
        Ok(path)
    }

    fn path(&mut self) -> Result<PropertyPath> {
        let (pos, parts) = self.dotted()?;
        self.resolve(pos, &parts)
    }

    // ---- SELECT ----

    fn parse_select(&mut self) -> Result<ParsedSelect> {
        self.expect_keyword("select")?;
        let distinct = self.eat_keyword("distinct");
        let raw = self.parse_raw_projection()?;
        self.expect_keyword("from")?;
        let (entity, alias) = self.parse_root()?;
        let joins = self.parse_joins()?;

        let projection = match raw {
            RawProjection::Count => ParsedProjection::Count,
            RawProjection::Paths(paths) => match paths.as_slice() {
                [(_, single)] if single.len() == 1 && single[0] == alias => ParsedProjection::Root,
                _ => ParsedProjection::Paths(
                    paths
                        .iter()
                        .map(|(pos, parts)| self.resolve(*pos, parts))
                        .collect::<Result<_>>()?,
                ),
            },
            RawProjection::Constructor(name, args) => ParsedProjection::Constructor {
                name,
                args: args
                    .iter()
                    .map(|(pos, parts)| self.resolve(*pos, parts))
                    .collect::<Result<_>>()?,
            },
        };

        let predicate = if self.eat_keyword("where") {
            Some(self.condition()?)
        } else {
            None
        };

        let mut order = Vec::new();
        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            loop {
                let path = self.path()?;
                let direction = if self.eat_keyword("desc") {
                    Direction::Desc
                } else {
                    self.eat_keyword("asc");
                    Direction::Asc
                };
                order.push(Order {
                    property: path.to_string(),
                    direction,
                });
                if !self.eat_sym(",") {
                    break;
                }
            }
        }

        Ok(ParsedSelect {
            entity,
            alias,
            distinct,
            projection,
            joins,
            predicate,
            order,
        })
    }

    fn parse_raw_projection(&mut self) -> Result<RawProjection> {
        if self.eat_keyword("count") {
            self.expect_sym("(")?;
            self.eat_keyword("distinct");
            if !self.eat_sym("*") {
                self.dotted()?;
            }
            self.expect_sym(")")?;
            return Ok(RawProjection::Count);
        }
        if self.eat_keyword("new") {
            let (_, qualified) = self.dotted()?;
            let name = qualified.last().cloned().unwrap_or_default();
            self.expect_sym("(")?;
            let mut args = vec![self.dotted()?];
            while self.eat_sym(",") {
                args.push(self.dotted()?);
            }
            self.expect_sym(")")?;
            return Ok(RawProjection::Constructor(name, args));
        }
        let mut paths = vec![self.dotted()?];
        while self.eat_sym(",") {
            paths.push(self.dotted()?);
        }
        Ok(RawProjection::Paths(paths))
    }

    // ---- UPDATE / DELETE ----

    fn parse_update(&mut self) -> Result<ParsedUpdate> {
        self.expect_keyword("update")?;
        let (entity, alias) = self.parse_root()?;
        self.expect_keyword("set")?;
        let mut assignments = Vec::new();
        loop {
            let pos = self.pos();
            let path = self.path()?;
            let field = self.bulk_field(pos, &path)?;
            self.expect_sym("=")?;
            let value = self.expr()?;
            assignments.push((field, value));
            if !self.eat_sym(",") {
                break;
            }
        }
        let predicate = self.bulk_where()?;
        Ok(ParsedUpdate {
            entity,
            alias,
            assignments,
            predicate,
        })
    }

    fn parse_delete(&mut self) -> Result<ParsedDelete> {
        self.expect_keyword("delete")?;
        self.expect_keyword("from")?;
        let (entity, alias) = self.parse_root()?;
        let predicate = self.bulk_where()?;
        Ok(ParsedDelete {
            entity,
            alias,
            predicate,
        })
    }

    fn bulk_where(&mut self) -> Result<Option<Predicate>> {
        if !self.eat_keyword("where") {
            return Ok(None);
        }
        let pos = self.pos();
        let predicate = self.condition()?;
        let mut nested = None;
        predicate.for_each_path(&mut |p| {
            if p.segments().len() > 1 && nested.is_none() {
                nested = Some(p.to_string());
            }
        });
        match nested {
            Some(path) => Err(parse_error(
                pos,
                format!("bulk statements cannot navigate relationships (`{path}`)"),
            )),
            None => Ok(Some(predicate)),
        }
    }

    fn bulk_field(&self, pos: usize, path: &PropertyPath) -> Result<String> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| parse_error(pos, "no root entity"))?;
        match path.segments() {
            [field] if root.field(field).is_some() => Ok(field.clone()),
            _ => Err(parse_error(
                pos,
                format!("`{path}` is not a field of `{}`", root.name()),
            )),
        }
    }

    fn expr(&mut self) -> Result<ParsedExpr> {
        let mut lhs = self.term()?;
        loop {
            if self.eat_sym("+") {
                lhs = ParsedExpr::Add(Box::new(lhs), Box::new(self.term()?));
            } else if self.eat_sym("-") {
                lhs = ParsedExpr::Sub(Box::new(lhs), Box::new(self.term()?));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn term(&mut self) -> Result<ParsedExpr> {
        if matches!(self.peek(), Tok::Ident(id) if !is_keyword(id)) {
            Ok(ParsedExpr::Path(self.path()?))
        } else {
            Ok(ParsedExpr::Operand(self.operand()?))
        }
    }

    // ---- WHERE ----

    fn condition(&mut self) -> Result<Predicate> {
        let mut lhs = self.conjunction()?;
        while self.eat_keyword("or") {
            lhs = lhs.or(self.conjunction()?);
        }
        Ok(lhs)
    }

    fn conjunction(&mut self) -> Result<Predicate> {
        let mut lhs = self.atom()?;
        while self.eat_keyword("and") {
            lhs = lhs.and(self.atom()?);
        }
        Ok(lhs)
    }

    fn atom(&mut self) -> Result<Predicate> {
        if self.eat_sym("(") {
            let inner = self.condition()?;
            self.expect_sym(")")?;
            return Ok(inner);
        }
        let path = self.path()?;

        if self.eat_keyword("is") {
            let negated = self.eat_keyword("not");
            self.expect_keyword("null")?;
            return Ok(Predicate::IsNull { path, negated });
        }
        if self.eat_keyword("between") {
            let low = self.operand()?;
            self.expect_keyword("and")?;
            let high = self.operand()?;
            return Ok(Predicate::Between { path, low, high });
        }
        let negated = self.eat_keyword("not");
        if self.eat_keyword("in") {
            let parenthesized = self.eat_sym("(");
            let operand = self.operand()?;
            if parenthesized {
                self.expect_sym(")")?;
            }
            return Ok(Predicate::In {
                path,
                operand,
                negated,
            });
        }
        if self.eat_keyword("like") {
            let op = if negated {
                CompareOp::NotLike
            } else {
                CompareOp::Like
            };
            let operand = self.operand()?;
            return Ok(Predicate::Comparison { path, op, operand });
        }
        if negated {
            return Err(self.error("expected IN or LIKE after NOT"));
        }

        let op = match self.peek() {
            Tok::Sym("=") => CompareOp::Eq,
            Tok::Sym("<>" | "!=") => CompareOp::Ne,
            Tok::Sym("<") => CompareOp::Lt,
            Tok::Sym("<=") => CompareOp::Le,
            Tok::Sym(">") => CompareOp::Gt,
            Tok::Sym(">=") => CompareOp::Ge,
            _ => return Err(self.error("expected a comparison operator")),
        };
        self.advance();
        let operand = self.operand()?;
        Ok(Predicate::Comparison { path, op, operand })
    }

    fn operand(&mut self) -> Result<Operand> {
        let pos = self.pos();
        let negative = self.eat_sym("-");
        let operand = match self.advance() {
            Tok::Named(name) => {
                let index = self
                    .params
                    .iter()
                    .position(|p| p.name == name)
                    .ok_or(Error::UnboundParameter { name })?;
                Operand::Param(index)
            }
            Tok::Positional(n) => {
                if n == 0 || n > self.params.len() {
                    return Err(Error::UnboundParameter {
                        name: format!("?{n}"),
                    });
                }
                Operand::Param(n - 1)
            }
            Tok::Int(v) => {
                let v = if negative { -v } else { v };
                Operand::Literal(i32::try_from(v).map_or(Value::BigInt(v), Value::Int))
            }
            Tok::Float(v) => Operand::Literal(Value::Double(if negative { -v } else { v })),
            Tok::Str(s) => Operand::Literal(Value::Text(s)),
            Tok::Ident(id) if id.eq_ignore_ascii_case("true") => {
                Operand::Literal(Value::Bool(true))
            }
            Tok::Ident(id) if id.eq_ignore_ascii_case("false") => {
                Operand::Literal(Value::Bool(false))
            }
            Tok::Ident(id) if id.eq_ignore_ascii_case("null") => Operand::Literal(Value::Null),
            _ => return Err(parse_error(pos, "expected a parameter or literal")),
        };
        if negative && !matches!(operand, Operand::Literal(Value::Int(_) | Value::BigInt(_) | Value::Double(_))) {
            return Err(parse_error(pos, "`-` must precede a numeric literal"));
        }
        Ok(operand)
    }
}

fn is_keyword(id: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(id))
}
