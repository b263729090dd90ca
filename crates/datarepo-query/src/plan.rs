//! Query plans: predicate trees plus fetch, lock and paging directives,
//! compiled into store statements.

use std::sync::Arc;

use datarepo_core::{
    Assignment, ColumnRef, Condition, Delete, EntityDescriptor, Error, Join, JoinKind,
    OrderItem, Result, RowLock, ScalarExpr, SchemaCatalog, Select, SelectItem, Statement,
    TableRef, Update, Value,
};

use crate::derive::{Cardinality, DerivedQuery};
use crate::paging::{Direction, Sort};
use crate::param::{ParamDecl, ParamKind, ParamSlot};
use crate::parse::{ParsedExpr, ParsedProjection, ParsedQuery, ParsedSelect};
use crate::predicate::{Predicate, PropertyPath};

// ============================================================================
// Plan shape
// ============================================================================

/// What rows of a plan are mapped into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanProjection {
    /// Full entities (plus fetch-joined relations).
    Entity,
    /// Scalar columns, one per property path.
    Scalars(Vec<String>),
    /// A DTO built from the listed arguments.
    Constructor { name: String, args: Vec<String> },
    /// A row count.
    Count,
    /// Whether any row matches.
    Exists,
}

/// Column range of one entity in an entity-projection row.
#[derive(Debug, Clone)]
pub struct EntityLayout {
    pub descriptor: Arc<EntityDescriptor>,
    pub alias: String,
    /// Index of the first column; fields come first, then owned foreign keys.
    pub start: usize,
}

impl EntityLayout {
    pub fn width(&self) -> usize {
        self.descriptor.fields().len() + self.descriptor.owning_relationships().count()
    }
}

/// A fetch-joined relationship to pre-fill during materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRelation {
    /// Layout index of the owning entity.
    pub parent: usize,
    pub relationship: &'static str,
    /// Layout index of the fetched entity.
    pub layout: usize,
}

/// Paging window applied when a select statement is produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct Window<'a> {
    pub sort: Option<&'a Sort>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone)]
enum PlanBody {
    Select { select: Select, joins: JoinSet },
    Bulk(Statement),
}

/// A compiled, reusable query.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    method: String,
    root: Arc<EntityDescriptor>,
    cardinality: Cardinality,
    projection: PlanProjection,
    body: PlanBody,
    layouts: Vec<EntityLayout>,
    fetches: Vec<FetchedRelation>,
    params: Vec<ParamSlot>,
    count: Option<Select>,
}

impl QueryPlan {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn root(&self) -> &Arc<EntityDescriptor> {
        &self.root
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn projection(&self) -> &PlanProjection {
        &self.projection
    }

    pub fn layouts(&self) -> &[EntityLayout] {
        &self.layouts
    }

    pub fn fetches(&self) -> &[FetchedRelation] {
        &self.fetches
    }

    pub fn params(&self) -> &[ParamSlot] {
        &self.params
    }

    /// Whether this is a bulk UPDATE or DELETE.
    pub fn is_bulk(&self) -> bool {
        matches!(self.body, PlanBody::Bulk(_))
    }

    /// Requested row lock, if any.
    pub fn lock(&self) -> Option<RowLock> {
        match &self.body {
            PlanBody::Select { select, .. } => select.lock,
            PlanBody::Bulk(_) => None,
        }
    }

    /// Check call-site arguments against the parameter slots and apply
    /// `LIKE` wildcards.
    pub fn bind(&self, args: &[Value]) -> Result<Vec<Value>> {
        if let Some(missing) = self.params.get(args.len()) {
            return Err(Error::UnboundParameter {
                name: missing.name.clone(),
            });
        }
        if args.len() > self.params.len() {
            return Err(Error::invocation(
                &self.method,
                format!(
                    "expected {} argument(s), got {}",
                    self.params.len(),
                    args.len()
                ),
            ));
        }
        self.params
            .iter()
            .zip(args)
            .map(|(slot, arg)| match (slot.kind, arg) {
                (ParamKind::Collection, Value::Array(_)) => Ok(arg.clone()),
                (ParamKind::Collection, _) => Err(Error::invocation(
                    &self.method,
                    format!("parameter `{}` expects a collection", slot.name),
                )),
                (_, Value::Array(_)) => Err(Error::invocation(
                    &self.method,
                    format!("parameter `{}` expects a single value", slot.name),
                )),
                (_, Value::Text(text)) => Ok(Value::Text(slot.wildcard.apply(text))),
                _ => Ok(arg.clone()),
            })
            .collect()
    }

    /// The SELECT to run, with the window's sort merged into the plan's
    /// order and its limit/offset applied.
    pub fn select_statement(&self, window: Window<'_>) -> Result<Statement> {
        let PlanBody::Select { select, joins } = &self.body else {
            return Err(Error::invocation(&self.method, "bulk statement cannot be selected"));
        };
        let mut select = select.clone();
        if let Some(sort) = window.sort.filter(|s| !s.is_unsorted()) {
            let mut joins = joins.clone();
            for order in sort.orders() {
                let column = joins
                    .column(&PropertyPath::parse(&order.property), JoinKind::LeftOuter, false)
                    .map_err(|reason| Error::invocation(&self.method, reason))?;
                let descending = order.direction == Direction::Desc;
                match select.order_by.iter_mut().find(|o| o.column == column) {
                    Some(existing) => existing.descending = descending,
                    None => select.order_by.push(OrderItem { column, descending }),
                }
            }
            select.joins = joins.joins();
        }
        select.limit = match (select.limit, window.limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if window.offset.is_some() {
            select.offset = window.offset;
        }
        Ok(Statement::Select(select))
    }

    /// The count query for paging: the declared override, or `COUNT(*)`
    /// over the same joins without fetch-only joins.
    pub fn count_statement(&self) -> Result<Statement> {
        if let Some(count) = &self.count {
            return Ok(Statement::Select(count.clone()));
        }
        let PlanBody::Select { select, joins } = &self.body else {
            return Err(Error::invocation(&self.method, "bulk statement cannot be counted"));
        };
        let mut count = Select::from(select.from.clone());
        count.items = vec![SelectItem::CountStar];
        count.joins = joins.count_joins();
        count.filter = select.filter.clone();
        Ok(Statement::Select(count))
    }

    /// The bulk UPDATE or DELETE.
    pub fn bulk_statement(&self) -> Result<&Statement> {
        match &self.body {
            PlanBody::Bulk(statement) => Ok(statement),
            PlanBody::Select { .. } => Err(Error::invocation(
                &self.method,
                "not a modifying query",
            )),
        }
    }
}

// ============================================================================
// Join bookkeeping
// ============================================================================

#[derive(Debug, Clone)]
struct JoinEntry {
    path: PropertyPath,
    alias: String,
    descriptor: Arc<EntityDescriptor>,
    join: Join,
    fetch: bool,
    filtered: bool,
}

/// Joins needed by a plan, keyed by relationship path.
#[derive(Debug, Clone)]
struct JoinSet {
    catalog: Arc<SchemaCatalog>,
    root: Arc<EntityDescriptor>,
    root_alias: String,
    entries: Vec<JoinEntry>,
}

impl JoinSet {
    fn new(catalog: Arc<SchemaCatalog>, root: Arc<EntityDescriptor>, root_alias: String) -> Self {
        Self {
            catalog,
            root,
            root_alias,
            entries: Vec::new(),
        }
    }

    /// Join every relationship along `path`; returns the last entry.
    fn ensure(
        &mut self,
        path: &[String],
        kind: JoinKind,
        fetch: bool,
        filtered: bool,
    ) -> std::result::Result<usize, String> {
        let mut parent_alias = self.root_alias.clone();
        let mut parent = self.root.clone();
        let mut last = None;
        for depth in 0..path.len() {
            let prefix = PropertyPath::from_segments(path[..=depth].to_vec());
            let segment = &path[depth];
            let rel = parent
                .relationship(segment)
                .ok_or_else(|| format!("`{}` has no relationship `{segment}`", parent.name()))?;
            if !rel.is_owning() {
                return Err(format!("to-many relationship `{prefix}` cannot be joined"));
            }
            let index = match self.entries.iter().position(|e| e.path == prefix) {
                Some(index) => index,
                None => {
                    let target = self
                        .catalog
                        .descriptor(rel.target)
                        .map_err(|e| e.to_string())?
                        .clone();
                    let alias = prefix.segments().join("_");
                    let join = Join {
                        kind,
                        table: TableRef::new(target.table(), alias.as_str()),
                        left: ColumnRef::new(parent_alias.as_str(), rel.foreign_key.unwrap_or_default()),
                        right: ColumnRef::new(alias.as_str(), target.primary_key().column_name),
                    };
                    self.entries.push(JoinEntry {
                        path: prefix,
                        alias,
                        descriptor: target,
                        join,
                        fetch: false,
                        filtered: false,
                    });
                    self.entries.len() - 1
                }
            };
            let entry = &mut self.entries[index];
            entry.fetch |= fetch;
            entry.filtered |= filtered;
            parent_alias = entry.alias.clone();
            parent = entry.descriptor.clone();
            last = Some(index);
        }
        last.ok_or_else(|| "empty relationship path".to_string())
    }

    /// Resolve a property path to a qualified column, joining as needed.
    fn column(
        &mut self,
        path: &PropertyPath,
        kind: JoinKind,
        filtered: bool,
    ) -> std::result::Result<ColumnRef, String> {
        let (leaf, parents) = path
            .segments()
            .split_last()
            .ok_or_else(|| "empty property path".to_string())?;
        let (alias, entity) = if parents.is_empty() {
            (self.root_alias.clone(), self.root.clone())
        } else {
            let i = self.ensure(parents, kind, false, filtered)?;
            (self.entries[i].alias.clone(), self.entries[i].descriptor.clone())
        };
        if let Some(field) = entity.field(leaf) {
            return Ok(ColumnRef::new(alias, field.column_name));
        }
        match entity.relationship(leaf) {
            Some(rel) if rel.is_owning() => {
                Ok(ColumnRef::new(alias, rel.foreign_key.unwrap_or_default()))
            }
            Some(_) => Err(format!("to-many relationship `{path}` is not a column")),
            None => Err(format!("`{}` has no property `{leaf}`", entity.name())),
        }
    }

    fn condition(&mut self, predicate: &Predicate) -> std::result::Result<Condition, String> {
        Ok(match predicate {
            Predicate::Comparison { path, op, operand } => Condition::Compare {
                column: self.column(path, JoinKind::Inner, true)?,
                op: *op,
                operand: operand.clone(),
            },
            Predicate::In {
                path,
                operand,
                negated,
            } => Condition::In {
                column: self.column(path, JoinKind::Inner, true)?,
                operand: operand.clone(),
                negated: *negated,
            },
            Predicate::IsNull { path, negated } => Condition::IsNull {
                column: self.column(path, JoinKind::Inner, true)?,
                negated: *negated,
            },
            Predicate::Between { path, low, high } => Condition::Between {
                column: self.column(path, JoinKind::Inner, true)?,
                low: low.clone(),
                high: high.clone(),
            },
            Predicate::And(l, r) => {
                Condition::And(Box::new(self.condition(l)?), Box::new(self.condition(r)?))
            }
            Predicate::Or(l, r) => {
                Condition::Or(Box::new(self.condition(l)?), Box::new(self.condition(r)?))
            }
        })
    }

    fn joins(&self) -> Vec<Join> {
        self.entries.iter().map(|e| e.join.clone()).collect()
    }

    /// Joins that can change the row count.
    fn count_joins(&self) -> Vec<Join> {
        self.entries
            .iter()
            .filter(|e| !(e.fetch && e.join.kind == JoinKind::LeftOuter && !e.filtered))
            .map(|e| e.join.clone())
            .collect()
    }
}

fn push_layout(
    layouts: &mut Vec<EntityLayout>,
    items: &mut Vec<SelectItem>,
    descriptor: Arc<EntityDescriptor>,
    alias: &str,
) -> usize {
    let start = items.len();
    items.extend(
        descriptor
            .columns()
            .into_iter()
            .map(|c| SelectItem::Column(ColumnRef::new(alias, c))),
    );
    layouts.push(EntityLayout {
        descriptor,
        alias: alias.to_string(),
        start,
    });
    layouts.len() - 1
}

fn default_alias(entity: &EntityDescriptor) -> String {
    entity
        .name()
        .chars()
        .next()
        .map_or_else(|| "e".to_string(), |c| c.to_lowercase().collect())
}

// ============================================================================
// Builder
// ============================================================================

/// Builds [`QueryPlan`]s for one root entity.
///
/// Errors are reported as [`Error::UnsupportedDerivation`] so that they
/// surface when repositories are built.
pub struct QueryPlanBuilder {
    catalog: Arc<SchemaCatalog>,
    root: Arc<EntityDescriptor>,
    method: String,
    params: Vec<ParamDecl>,
    fetch: Vec<PropertyPath>,
    lock: Option<RowLock>,
    dto: Option<(String, Vec<PropertyPath>)>,
    count: Option<ParsedSelect>,
}

impl QueryPlanBuilder {
    pub fn new(catalog: Arc<SchemaCatalog>, root: Arc<EntityDescriptor>, method: &str) -> Self {
        Self {
            catalog,
            root,
            method: method.to_string(),
            params: Vec::new(),
            fetch: Vec::new(),
            lock: None,
            dto: None,
            count: None,
        }
    }

    /// Declared method parameters.
    pub fn params(mut self, params: &[ParamDecl]) -> Self {
        self.params = params.to_vec();
        self
    }

    /// Fetch these relationship paths with `LEFT OUTER JOIN`s.
    pub fn fetch_paths<S: AsRef<str>>(mut self, paths: &[S]) -> Self {
        self.fetch
            .extend(paths.iter().map(|p| PropertyPath::parse(p.as_ref())));
        self
    }

    /// Fetch the paths of a named entity graph declared on the root.
    pub fn named_graph(self, name: &str) -> Result<Self> {
        let paths = self
            .root
            .named_graph(name)
            .ok_or_else(|| {
                Error::derivation(
                    &self.method,
                    format!("`{}` declares no entity graph `{name}`", self.root.name()),
                )
            })?
            .to_vec();
        Ok(self.fetch_paths(&paths))
    }

    /// Append a row-lock clause.
    pub fn lock(mut self, lock: RowLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Project each result into a DTO built from `paths`.
    pub fn dto<S: AsRef<str>>(mut self, name: &str, paths: &[S]) -> Self {
        self.dto = Some((
            name.to_string(),
            paths.iter().map(|p| PropertyPath::parse(p.as_ref())).collect(),
        ));
        self
    }

    /// Use a hand-written count query for paging.
    pub fn count_query(mut self, count: ParsedSelect) -> Self {
        self.count = Some(count);
        self
    }

    fn fail(&self, reason: impl Into<String>) -> Error {
        Error::derivation(&self.method, reason)
    }

    /// Plan a derived query.
    pub fn build_derived(self, derived: &DerivedQuery) -> Result<QueryPlan> {
        let mut slots = ParamSlot::from_decls(&self.params);
        for (slot, wildcard) in slots.iter_mut().zip(&derived.wildcards) {
            slot.wildcard = *wildcard;
        }
        let projection = match derived.cardinality {
            Cardinality::Count => PlanProjection::Count,
            Cardinality::Exists => PlanProjection::Exists,
            _ => PlanProjection::Entity,
        };
        let mut joins = self.joins(default_alias(&self.root));
        let mut select = Select::from(TableRef::new(self.root.table(), joins.root_alias.as_str()));
        select.distinct = derived.distinct;
        if let Some(predicate) = &derived.predicate {
            select.filter = Some(joins.condition(predicate).map_err(|r| self.fail(r))?);
        }
        for order in derived.sort.orders() {
            let column = joins
                .column(&PropertyPath::parse(&order.property), JoinKind::LeftOuter, false)
                .map_err(|r| self.fail(r))?;
            select.order_by.push(OrderItem {
                column,
                descending: order.direction == Direction::Desc,
            });
        }
        match derived.cardinality {
            Cardinality::First(n) => select.limit = Some(n),
            Cardinality::Exists => select.limit = Some(1),
            _ => {}
        }
        self.finish(derived.cardinality, projection, select, joins, slots)
    }

    /// Plan an unrestricted or criteria query (used by `find_all`,
    /// specifications and key lookups).
    pub fn build_criteria(
        self,
        predicate: Option<&Predicate>,
        sort: &Sort,
        cardinality: Cardinality,
    ) -> Result<QueryPlan> {
        let derived = DerivedQuery {
            method: self.method.clone(),
            cardinality,
            distinct: false,
            predicate: predicate.cloned(),
            sort: sort.clone(),
            wildcards: Vec::new(),
        };
        self.build_derived(&derived)
    }

    /// Plan a parsed query string.
    pub fn build_parsed(self, parsed: ParsedQuery) -> Result<QueryPlan> {
        let slots = ParamSlot::from_decls(&self.params);
        match parsed {
            ParsedQuery::Select(select) => self.build_parsed_select(select, slots),
            ParsedQuery::Update(update) => {
                let alias = update.alias;
                let mut joins = self.joins(alias.clone());
                let filter = update
                    .predicate
                    .as_ref()
                    .map(|p| joins.condition(p))
                    .transpose()
                    .map_err(|r| self.fail(r))?;
                let assignments = update
                    .assignments
                    .iter()
                    .map(|(field, expr)| {
                        let column = self
                            .root
                            .field(field)
                            .ok_or_else(|| self.fail(format!("unknown field `{field}`")))?
                            .column_name;
                        Ok(Assignment {
                            column: column.to_string(),
                            value: self.scalar_expr(&mut joins, expr)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let statement = Statement::Update(Update {
                    table: TableRef::new(self.root.table(), alias.as_str()),
                    assignments,
                    filter,
                });
                Ok(self.bulk(statement, slots))
            }
            ParsedQuery::Delete(delete) => {
                let alias = delete.alias;
                let mut joins = self.joins(alias.clone());
                let filter = delete
                    .predicate
                    .as_ref()
                    .map(|p| joins.condition(p))
                    .transpose()
                    .map_err(|r| self.fail(r))?;
                let statement = Statement::Delete(Delete {
                    table: TableRef::new(self.root.table(), alias.as_str()),
                    filter,
                });
                Ok(self.bulk(statement, slots))
            }
        }
    }

    fn build_parsed_select(self, parsed: ParsedSelect, slots: Vec<ParamSlot>) -> Result<QueryPlan> {
        if parsed.entity != self.root.name() && parsed.projection == ParsedProjection::Root {
            return Err(self.fail(format!(
                "query selects `{}` but the repository manages `{}`",
                parsed.entity,
                self.root.name()
            )));
        }
        let root = self
            .catalog
            .descriptor(&parsed.entity)
            .map_err(|e| self.fail(e.to_string()))?
            .clone();
        let mut joins = JoinSet::new(self.catalog.clone(), root.clone(), parsed.alias.clone());
        for join in &parsed.joins {
            joins
                .ensure(join.path.segments(), join.kind, join.fetch, false)
                .map_err(|r| self.fail(r))?;
        }
        let mut select = Select::from(TableRef::new(root.table(), parsed.alias.as_str()));
        select.distinct = parsed.distinct;
        if let Some(predicate) = &parsed.predicate {
            select.filter = Some(joins.condition(predicate).map_err(|r| self.fail(r))?);
        }
        for order in &parsed.order {
            let column = joins
                .column(&PropertyPath::parse(&order.property), JoinKind::LeftOuter, false)
                .map_err(|r| self.fail(r))?;
            select.order_by.push(OrderItem {
                column,
                descending: order.direction == Direction::Desc,
            });
        }

        let (cardinality, projection) = match &parsed.projection {
            ParsedProjection::Root => (Cardinality::Collection, PlanProjection::Entity),
            ParsedProjection::Count => (Cardinality::Count, PlanProjection::Count),
            ParsedProjection::Paths(paths) => {
                select.items = self.columns(&mut joins, paths, JoinKind::Inner)?;
                (
                    Cardinality::Collection,
                    PlanProjection::Scalars(paths.iter().map(ToString::to_string).collect()),
                )
            }
            ParsedProjection::Constructor { name, args } => {
                select.items = self.columns(&mut joins, args)?;
                (
                    Cardinality::Collection,
                    PlanProjection::Constructor {
                        name: name.clone(),
                        args: args.iter().map(ToString::to_string).collect(),
                    },
                )
            }
        };
        // The builder was created for the repository root; a projection
        // query may select from another entity.
        let builder = Self { root, ..self };
        builder.finish(cardinality, projection, select, joins, slots)
    }

    /// Select items for `paths`. Relationships are joined with `kind`
    /// unless a filter already joined them.
    fn columns(
        &self,
        joins: &mut JoinSet,
        paths: &[PropertyPath],
        kind: JoinKind,
    ) -> Result<Vec<SelectItem>> {
        paths
            .iter()
            .map(|p| {
                joins
                    .column(p, kind, kind == JoinKind::Inner)
                    .map(SelectItem::Column)
                    .map_err(|r| self.fail(r))
            })
            .collect()
    }

    fn scalar_expr(&self, joins: &mut JoinSet, expr: &ParsedExpr) -> Result<ScalarExpr> {
        Ok(match expr {
            ParsedExpr::Path(path) => ScalarExpr::Column(
                joins
                    .column(path, JoinKind::Inner, true)
                    .map_err(|r| self.fail(r))?,
            ),
            ParsedExpr::Operand(operand) => ScalarExpr::Operand(operand.clone()),
            ParsedExpr::Add(l, r) => ScalarExpr::Add(
                Box::new(self.scalar_expr(joins, l)?),
                Box::new(self.scalar_expr(joins, r)?),
            ),
            ParsedExpr::Sub(l, r) => ScalarExpr::Sub(
                Box::new(self.scalar_expr(joins, l)?),
                Box::new(self.scalar_expr(joins, r)?),
            ),
        })
    }

    fn joins(&self, alias: String) -> JoinSet {
        JoinSet::new(self.catalog.clone(), self.root.clone(), alias)
    }

    fn bulk(self, statement: Statement, params: Vec<ParamSlot>) -> QueryPlan {
        QueryPlan {
            method: self.method,
            root: self.root,
            cardinality: Cardinality::Collection,
            projection: PlanProjection::Count,
            body: PlanBody::Bulk(statement),
            layouts: Vec::new(),
            fetches: Vec::new(),
            params,
            count: None,
        }
    }

    fn finish(
        self,
        cardinality: Cardinality,
        mut projection: PlanProjection,
        mut select: Select,
        mut joins: JoinSet,
        params: Vec<ParamSlot>,
    ) -> Result<QueryPlan> {
        for path in &self.fetch {
            joins
                .ensure(path.segments(), JoinKind::LeftOuter, true, false)
                .map_err(|r| self.fail(format!("cannot fetch `{path}`: {r}")))?;
        }

        if let Some((name, paths)) = &self.dto {
            // A nested DTO reads `None` for a missing reference.
            select.items = self.columns(&mut joins, paths, JoinKind::LeftOuter)?;
            projection = PlanProjection::Constructor {
                name: name.clone(),
                args: paths.iter().map(ToString::to_string).collect(),
            };
        }

        let mut layouts = Vec::new();
        let mut fetches = Vec::new();
        match projection {
            PlanProjection::Entity => {
                let mut items = Vec::new();
                push_layout(&mut layouts, &mut items, self.root.clone(), &joins.root_alias);
                let mut fetched: Vec<(&PropertyPath, usize)> = Vec::new();
                for entry in joins.entries.iter().filter(|e| e.fetch) {
                    let Some((relationship, parents)) = entry.path.segments().split_last() else {
                        continue;
                    };
                    let parent = if parents.is_empty() {
                        Some(0)
                    } else {
                        fetched
                            .iter()
                            .find(|(p, _)| p.segments() == parents)
                            .map(|(_, i)| *i)
                    };
                    let Some(parent) = parent else { continue };
                    let Some(rel) = layouts[parent].descriptor.relationship(relationship) else {
                        continue;
                    };
                    let layout = push_layout(
                        &mut layouts,
                        &mut items,
                        entry.descriptor.clone(),
                        &entry.alias,
                    );
                    fetched.push((&entry.path, layout));
                    fetches.push(FetchedRelation {
                        parent,
                        relationship: rel.name,
                        layout,
                    });
                }
                select.items = items;
            }
            PlanProjection::Count => select.items = vec![SelectItem::CountStar],
            PlanProjection::Exists => {
                select.items = vec![SelectItem::Column(ColumnRef::new(
                    joins.root_alias.as_str(),
                    self.root.primary_key().column_name,
                ))];
            }
            PlanProjection::Scalars(_) | PlanProjection::Constructor { .. } => {}
        }

        if let Some(lock) = self.lock {
            select.lock = Some(lock);
        }
        select.joins = joins.joins();

        let count = match &self.count {
            Some(parsed) => {
                if parsed.projection != ParsedProjection::Count {
                    return Err(self.fail("count query must select `count(...)`"));
                }
                let plan = Self::new(self.catalog.clone(), self.root.clone(), &self.method)
                    .params(&self.params)
                    .build_parsed_select(parsed.clone(), Vec::new())?;
                match plan.body {
                    PlanBody::Select { select, .. } => Some(select),
                    PlanBody::Bulk(_) => None,
                }
            }
            None => None,
        };

        tracing::debug!(
            method = %self.method,
            entity = self.root.name(),
            sql = %Statement::Select(select.clone()).to_sql(),
            "Compiled query plan"
        );

        Ok(QueryPlan {
            method: self.method,
            root: self.root,
            cardinality,
            projection,
            body: PlanBody::Select { select, joins },
            layouts,
            fetches,
            params,
            count,
        })
    }
}
