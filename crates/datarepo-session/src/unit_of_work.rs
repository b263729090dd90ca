//! The unit of work: identity map, change tracking and plan execution.

use std::any::{Any, TypeId};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use datarepo_core::{
    ClosedState, CompareOp, Connection, Entity, EntityDescriptor, Error, LifecyclePhase, Managed,
    Operand, Result, Row, SchemaCatalog, Statement, Value,
};
use datarepo_query::{
    Cardinality, DeleteBuilder, InsertBuilder, Page, PageRequest, ParamDecl, PlanProjection,
    Predicate, PropertyPath, QueryPlan, QueryPlanBuilder, Slice, Sort, UpdateBuilder, Window,
};

use crate::SessionConfig;
use crate::identity::{ObjectKey, ObjectState, TrackedObject};
use crate::n1_detection::{N1QueryTracker, N1Stats};
use crate::projection::Projection;

// ============================================================================
// State and hints
// ============================================================================

/// Lifecycle of a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    Active,
    /// Writing pending changes.
    Flushing,
    Committed,
    RolledBack,
}

/// Per-query execution hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryHints {
    /// Identity-map results without taking a snapshot, so later mutations
    /// are never flushed.
    pub read_only: bool,
}

impl QueryHints {
    pub fn read_only() -> Self {
        Self { read_only: true }
    }
}

/// Snapshot of unit-of-work bookkeeping, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWorkDebugInfo {
    pub state: UnitOfWorkState,
    /// Instances in the identity map.
    pub tracked: usize,
    pub pending_new: usize,
    pub pending_delete: usize,
    pub in_transaction: bool,
}

// ============================================================================
// Unit of work
// ============================================================================

/// A request-scoped unit of work over one connection.
///
/// Every instance loaded or saved through a unit of work is held in its
/// identity map, so one row is always one [`Managed`] handle. Changes made
/// through those handles are detected against a snapshot and written at
/// [`flush`](UnitOfWork::flush) or [`commit`](UnitOfWork::commit).
///
/// ```ignore
/// let mut uow = UnitOfWork::begin(pool.acquire()?, catalog.clone(), SessionConfig::default())?;
/// let team = uow.save(Team::new("teamA"))?;
/// let member = uow.save(Member::new("member1", 10, Some(&team)))?;
/// member.borrow_mut().age = 11;
/// uow.commit()?; // INSERT team, INSERT member (age 11)
/// ```
///
/// Dropping an uncommitted unit of work rolls its transaction back.
pub struct UnitOfWork<C: Connection> {
    connection: C,
    catalog: Arc<SchemaCatalog>,
    config: SessionConfig,
    state: UnitOfWorkState,
    identity_map: HashMap<ObjectKey, TrackedObject>,
    /// Keys awaiting INSERT, in save order.
    pending_new: Vec<ObjectKey>,
    /// Keys awaiting DELETE.
    pending_delete: Vec<ObjectKey>,
    /// Primary-key lookup plans, per entity.
    key_plans: HashMap<&'static str, Rc<QueryPlan>>,
    n1: N1QueryTracker,
}

impl<C: Connection> UnitOfWork<C> {
    /// A unit of work without a transaction: reads only. Saves, deletes,
    /// bulk statements and row locks fail with [`Error::NoTransaction`].
    pub fn new(connection: C, catalog: Arc<SchemaCatalog>, config: SessionConfig) -> Self {
        let n1 = N1QueryTracker::new().with_threshold(config.n1_threshold);
        Self {
            connection,
            catalog,
            config,
            state: UnitOfWorkState::Active,
            identity_map: HashMap::new(),
            pending_new: Vec::new(),
            pending_delete: Vec::new(),
            key_plans: HashMap::new(),
            n1,
        }
    }

    /// A unit of work inside a write transaction.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn begin(connection: C, catalog: Arc<SchemaCatalog>, config: SessionConfig) -> Result<Self> {
        let mut uow = Self::new(connection, catalog, config);
        if !uow.connection.in_transaction() {
            tracing::info!("Beginning transaction");
            uow.connection.begin()?;
        }
        Ok(uow)
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> UnitOfWorkState {
        self.state
    }

    /// Whether a write transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.connection.in_transaction()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            UnitOfWorkState::Committed => Err(Error::UnitOfWorkClosed {
                state: ClosedState::Committed,
            }),
            UnitOfWorkState::RolledBack => Err(Error::UnitOfWorkClosed {
                state: ClosedState::RolledBack,
            }),
            UnitOfWorkState::Active | UnitOfWorkState::Flushing => Ok(()),
        }
    }

    fn require_transaction(&self, operation: &'static str) -> Result<()> {
        if self.connection.in_transaction() {
            Ok(())
        } else {
            Err(Error::NoTransaction { operation })
        }
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Persist a new entity or merge the state of an existing one.
    ///
    /// An entity that reports [`Entity::is_new`] is scheduled for INSERT,
    /// receiving a key from the store sequence when its key is generated,
    /// and its `PreInsert` callbacks run. Otherwise its state is copied
    /// into the resident (or freshly loaded) instance, which is returned.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = E::ENTITY_NAME))]
    pub fn save<E: Entity>(&mut self, entity: E) -> Result<Managed<E>> {
        self.ensure_open()?;
        self.require_transaction("save")?;
        let descriptor = self.catalog.descriptor_of::<E>()?.clone();
        if !entity.is_new() {
            if let Some(existing) = self.find_by_id::<E>(entity.id())? {
                tracing::debug!(entity = E::ENTITY_NAME, key = %entity.id(), "Merging into managed instance");
                *existing.borrow_mut() = entity;
                return Ok(existing);
            }
        }
        self.persist(&descriptor, entity)
    }

    fn persist<E: Entity>(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        mut entity: E,
    ) -> Result<Managed<E>> {
        if entity.id().is_null() {
            let pk = descriptor.primary_key();
            if !pk.generated {
                return Err(Error::invocation(
                    "save",
                    format!(
                        "`{}.{}` is not generated and must be assigned before saving",
                        descriptor.name(),
                        pk.name
                    ),
                ));
            }
            let id = self.connection.next_id(descriptor.table())?;
            entity.set_id(Value::BigInt(id));
        }
        descriptor.run_callbacks(LifecyclePhase::PreInsert, &mut entity);

        let id = entity.id();
        let key = ObjectKey::new(descriptor.name(), &id);
        if self.identity_map.contains_key(&key) {
            return Err(Error::invocation(
                "save",
                format!(
                    "`{}` with key {id} is already managed by this unit of work",
                    descriptor.name()
                ),
            ));
        }

        tracing::debug!(entity = descriptor.name(), key = %id, "Scheduling insert");
        let managed = Managed::new(entity);
        self.identity_map.insert(
            key,
            TrackedObject {
                descriptor: descriptor.clone(),
                object: managed.to_any(),
                key: id,
                snapshot: None,
                state: ObjectState::New,
            },
        );
        self.pending_new.push(key);
        Ok(managed)
    }

    /// Schedule an entity for DELETE at the next flush.
    ///
    /// Deleting an instance saved in this unit of work and not yet flushed
    /// simply forgets it.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = E::ENTITY_NAME))]
    pub fn delete<E: Entity>(&mut self, entity: &Managed<E>) -> Result<()> {
        self.ensure_open()?;
        self.require_transaction("delete")?;
        let descriptor = self.catalog.descriptor_of::<E>()?.clone();
        let id = entity
            .try_borrow()
            .map_err(|_| Error::invocation("delete", "entity is mutably borrowed"))?
            .id();
        let key = ObjectKey::new(descriptor.name(), &id);

        match self.identity_map.get(&key).map(|t| t.state) {
            Some(ObjectState::New) => {
                self.identity_map.remove(&key);
                self.pending_new.retain(|k| *k != key);
            }
            Some(ObjectState::Persistent) => {
                if let Some(tracked) = self.identity_map.get_mut(&key) {
                    tracked.state = ObjectState::Deleted;
                }
                self.pending_delete.push(key);
            }
            Some(ObjectState::Deleted) => {}
            None if id.is_null() => {}
            None => {
                self.identity_map.insert(
                    key,
                    TrackedObject {
                        descriptor,
                        object: entity.to_any(),
                        key: id,
                        snapshot: None,
                        state: ObjectState::Deleted,
                    },
                );
                self.pending_delete.push(key);
            }
        }
        Ok(())
    }

    /// Load by primary key, consulting the identity map first.
    #[tracing::instrument(level = "debug", skip(self, id), fields(entity = E::ENTITY_NAME))]
    pub fn find_by_id<E: Entity>(&mut self, id: impl Into<Value>) -> Result<Option<Managed<E>>> {
        self.ensure_open()?;
        let id = id.into();
        if id.is_null() {
            return Ok(None);
        }
        let descriptor = self.catalog.descriptor_of::<E>()?.clone();
        if let Some(tracked) = self.identity_map.get(&ObjectKey::new(descriptor.name(), &id)) {
            return Ok(match tracked.state {
                ObjectState::Deleted => None,
                ObjectState::New | ObjectState::Persistent => {
                    Managed::from_any(tracked.object.clone())
                }
            });
        }
        let plan = self.key_plan(&descriptor)?;
        self.one(&plan, &[id], QueryHints::default())
    }

    fn key_plan(&mut self, descriptor: &Arc<EntityDescriptor>) -> Result<Rc<QueryPlan>> {
        if let Some(plan) = self.key_plans.get(descriptor.name()) {
            return Ok(plan.clone());
        }
        let predicate = Predicate::Comparison {
            path: PropertyPath::parse(descriptor.primary_key().name),
            op: CompareOp::Eq,
            operand: Operand::Param(0),
        };
        let plan = QueryPlanBuilder::new(self.catalog.clone(), descriptor.clone(), "find_by_id")
            .params(&[ParamDecl::scalar("id")])
            .build_criteria(Some(&predicate), &Sort::unsorted(), Cardinality::Single)?;
        let plan = Rc::new(plan);
        self.key_plans.insert(descriptor.name(), plan.clone());
        Ok(plan)
    }

    /// Whether this exact handle is managed by the unit of work.
    pub fn contains<E: Entity>(&self, entity: &Managed<E>) -> bool {
        let Ok(borrowed) = entity.try_borrow() else {
            return false;
        };
        let key = ObjectKey::new(E::ENTITY_NAME, &borrowed.id());
        self.identity_map
            .get(&key)
            .is_some_and(|t| Rc::ptr_eq(&t.object, &entity.to_any()))
    }

    /// Stop tracking one instance. Pending changes to it are discarded.
    pub fn detach<E: Entity>(&mut self, entity: &Managed<E>) -> Result<()> {
        self.ensure_open()?;
        if !self.contains(entity) {
            return Ok(());
        }
        let key = ObjectKey::new(E::ENTITY_NAME, &entity.borrow().id());
        self.identity_map.remove(&key);
        self.pending_new.retain(|k| *k != key);
        self.pending_delete.retain(|k| *k != key);
        Ok(())
    }

    /// Detach every instance. Later reads load fresh instances from the
    /// store.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!(tracked = self.identity_map.len(), "Clearing identity map");
        self.identity_map.clear();
        self.pending_new.clear();
        self.pending_delete.clear();
        Ok(())
    }

    // ========================================================================
    // Lazy references
    // ========================================================================

    /// Resolve the to-one relationship `relationship` of `owner`.
    ///
    /// The first resolution looks the target up by foreign key (through the
    /// identity map) and caches it on the owner; later calls return the
    /// cached handle. Each first resolution is reported to the N+1 tracker.
    #[track_caller]
    pub fn resolve<E: Entity, T: Entity>(
        &mut self,
        owner: &Managed<E>,
        relationship: &'static str,
    ) -> Result<Option<Managed<T>>> {
        self.ensure_open()?;
        let method = format!("{}.{relationship}", E::ENTITY_NAME);
        let descriptor = self.catalog.descriptor_of::<E>()?;
        match descriptor.relationship(relationship) {
            Some(rel) if rel.is_owning() && rel.target == T::ENTITY_NAME => {}
            Some(_) => {
                return Err(Error::invocation(
                    method,
                    format!("not a to-one reference to `{}`", T::ENTITY_NAME),
                ));
            }
            None => return Err(Error::invocation(method, "no such relationship")),
        }

        let key = {
            let entity = owner
                .try_borrow()
                .map_err(|_| Error::invocation(method.as_str(), "owner is mutably borrowed"))?;
            let slot = entity
                .relation(relationship)
                .ok_or_else(|| Error::invocation(method.as_str(), "entity exposes no slot"))?;
            if let Some(loaded) = slot.loaded() {
                return Ok(loaded.and_then(Managed::from_any));
            }
            slot.key()
        };

        self.n1.record_load(E::ENTITY_NAME, relationship);
        let target = self.find_by_id::<T>(key)?;
        if let Some(slot) = owner.borrow_mut().relation_mut(relationship) {
            slot.fill(target.as_ref().map(Managed::to_any));
        }
        Ok(target)
    }

    pub fn n1_tracker(&self) -> &N1QueryTracker {
        &self.n1
    }

    pub fn n1_tracker_mut(&mut self) -> &mut N1QueryTracker {
        &mut self.n1
    }

    pub fn n1_stats(&self) -> N1Stats {
        self.n1.stats()
    }

    // ========================================================================
    // Plan execution
    // ========================================================================

    /// Entities matched by an entity-projection plan.
    #[tracing::instrument(level = "debug", skip(self, plan, args, window), fields(method = plan.method()))]
    pub fn list<E: Entity>(
        &mut self,
        plan: &QueryPlan,
        args: &[Value],
        window: Window<'_>,
        hints: QueryHints,
    ) -> Result<Vec<Managed<E>>> {
        check_entity_plan::<E>(plan)?;
        let statement = plan.select_statement(window)?;
        let rows = self.select(plan, &statement, args)?;
        if plan.cardinality() == Cardinality::Single && rows.len() > 1 {
            return Err(Error::NonUniqueResult { found: rows.len() });
        }
        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(root) = self.materialize_row(plan, row, hints.read_only)? else {
                continue;
            };
            let entity = Managed::from_any(root).ok_or_else(|| Error::Mapping {
                column: plan.root().name().to_string(),
                reason: format!("row does not map to `{}`", E::ENTITY_NAME),
            })?;
            entities.push(entity);
        }
        Ok(entities)
    }

    /// At most one entity; more than one match is [`Error::NonUniqueResult`].
    pub fn one<E: Entity>(
        &mut self,
        plan: &QueryPlan,
        args: &[Value],
        hints: QueryHints,
    ) -> Result<Option<Managed<E>>> {
        let mut found = self.list(plan, args, Window::default(), hints)?;
        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(Error::NonUniqueResult { found: n }),
        }
    }

    /// The first matching entity, if any.
    ///
    /// A single-result plan still fails with [`Error::NonUniqueResult`]
    /// when more than one row matches.
    pub fn first<E: Entity>(
        &mut self,
        plan: &QueryPlan,
        args: &[Value],
        sort: Option<&Sort>,
        hints: QueryHints,
    ) -> Result<Option<Managed<E>>> {
        if plan.cardinality() == Cardinality::Single {
            return self.one(plan, args, hints);
        }
        let window = Window {
            sort,
            limit: Some(1),
            offset: None,
        };
        Ok(self.list(plan, args, window, hints)?.into_iter().next())
    }

    /// One page of entities plus the total count.
    ///
    /// The count query is skipped when the page itself proves the total: a
    /// short first page, or a short non-empty later page.
    #[tracing::instrument(level = "debug", skip(self, plan, args), fields(method = plan.method()))]
    pub fn page<E: Entity>(
        &mut self,
        plan: &QueryPlan,
        args: &[Value],
        request: &PageRequest,
        hints: QueryHints,
    ) -> Result<Page<Managed<E>>> {
        let window = Window {
            sort: Some(request.sort()),
            limit: Some(request.size()),
            offset: Some(request.offset()),
        };
        let content = self.list(plan, args, window, hints)?;
        let returned = content.len() as u64;
        let total = if returned < request.size() && (request.offset() == 0 || returned > 0) {
            request.offset() + returned
        } else {
            self.count(plan, args)?
        };
        Ok(Page::new(content, request, total))
    }

    /// One slice of entities: `size + 1` rows are read to learn whether
    /// more exist, and no count query runs.
    #[tracing::instrument(level = "debug", skip(self, plan, args), fields(method = plan.method()))]
    pub fn slice<E: Entity>(
        &mut self,
        plan: &QueryPlan,
        args: &[Value],
        request: &PageRequest,
        hints: QueryHints,
    ) -> Result<Slice<Managed<E>>> {
        let window = Window {
            sort: Some(request.sort()),
            limit: Some(request.size().saturating_add(1)),
            offset: Some(request.offset()),
        };
        let content = self.list(plan, args, window, hints)?;
        Ok(Slice::from_overfetch(content, request))
    }

    /// Number of rows matched by the plan (its count override, if declared).
    pub fn count(&mut self, plan: &QueryPlan, args: &[Value]) -> Result<u64> {
        let statement = plan.count_statement()?;
        let rows = self.select(plan, &statement, args)?;
        rows.first()
            .and_then(|row| row.value_at(0))
            .and_then(Value::as_i64)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| Error::Mapping {
                column: "count".to_string(),
                reason: "count query returned no count".to_string(),
            })
    }

    /// Whether any row matches.
    pub fn exists(&mut self, plan: &QueryPlan, args: &[Value]) -> Result<bool> {
        if matches!(plan.projection(), PlanProjection::Count) || plan.is_bulk() {
            return Err(Error::invocation(plan.method(), "does not select rows"));
        }
        let statement = plan.select_statement(Window {
            limit: Some(1),
            ..Window::default()
        })?;
        Ok(!self.select(plan, &statement, args)?.is_empty())
    }

    /// Raw rows of a scalar or constructor projection.
    pub fn rows(&mut self, plan: &QueryPlan, args: &[Value], window: Window<'_>) -> Result<Vec<Row>> {
        let statement = plan.select_statement(window)?;
        self.select(plan, &statement, args)
    }

    /// Rows of a projection mapped through [`Projection`].
    pub fn project<D: Projection>(
        &mut self,
        plan: &QueryPlan,
        args: &[Value],
        window: Window<'_>,
    ) -> Result<Vec<D>> {
        if matches!(plan.projection(), PlanProjection::Count | PlanProjection::Exists) {
            return Err(Error::invocation(plan.method(), "does not select projectable columns"));
        }
        self.rows(plan, args, window)?
            .iter()
            .map(D::from_row)
            .collect()
    }

    /// Run a bulk UPDATE or DELETE directly against the store.
    ///
    /// Resident instances are not refreshed; with `clear_automatically` the
    /// identity map is cleared afterwards so later reads see the store.
    #[tracing::instrument(level = "debug", skip(self, plan, args), fields(method = plan.method()))]
    pub fn execute_bulk(
        &mut self,
        plan: &QueryPlan,
        args: &[Value],
        clear_automatically: bool,
    ) -> Result<u64> {
        self.ensure_open()?;
        self.require_transaction("bulk statement")?;
        let params = plan.bind(args)?;
        let statement = plan.bulk_statement()?;
        self.auto_flush()?;
        let affected = execute(&mut self.connection, statement, &params)?;
        tracing::debug!(method = plan.method(), affected, "Bulk statement executed");
        if clear_automatically {
            self.clear()?;
        }
        Ok(affected)
    }

    fn select(&mut self, plan: &QueryPlan, statement: &Statement, args: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        if plan.lock().is_some() {
            self.require_transaction("row lock")?;
        }
        let params = plan.bind(args)?;
        self.auto_flush()?;
        tracing::debug!(method = plan.method(), sql = %statement, params = params.len(), "Executing query");
        self.connection.query(statement, &params)
    }

    // ========================================================================
    // Materialization
    // ========================================================================

    /// Map one entity-projection row; returns the root instance, or `None`
    /// when the root was deleted in this unit of work but not yet flushed.
    ///
    /// Rows for resident instances return the resident handle untouched.
    /// Fetch-joined targets pre-fill the slots of freshly loaded owners.
    fn materialize_row(
        &mut self,
        plan: &QueryPlan,
        row: &Row,
        read_only: bool,
    ) -> Result<Option<Rc<dyn Any>>> {
        let layouts = plan.layouts();
        if let Some(root) = layouts.first() {
            let id = row
                .value_at(root.start + root.descriptor.primary_key_index())
                .cloned()
                .unwrap_or(Value::Null);
            let key = ObjectKey::new(root.descriptor.name(), &id);
            if matches!(
                self.identity_map.get(&key).map(|t| t.state),
                Some(ObjectState::Deleted)
            ) {
                return Ok(None);
            }
        }
        let mut loaded: Vec<Option<(Rc<dyn Any>, bool)>> = Vec::with_capacity(layouts.len());
        for layout in layouts {
            let values = row
                .values()
                .get(layout.start..layout.start + layout.width())
                .ok_or_else(|| Error::Mapping {
                    column: layout.alias.clone(),
                    reason: format!("row has only {} columns", row.len()),
                })?;
            if values[layout.descriptor.primary_key_index()].is_null() {
                // Unmatched outer join.
                loaded.push(None);
                continue;
            }
            loaded.push(Some(self.load_instance(&layout.descriptor, values, read_only)?));
        }

        for fetch in plan.fetches() {
            let Some(Some((parent, true))) = loaded.get(fetch.parent) else {
                continue;
            };
            let target = loaded
                .get(fetch.layout)
                .and_then(|t| t.as_ref().map(|(handle, _)| handle.clone()));
            layouts[fetch.parent]
                .descriptor
                .fill_relation(&**parent, fetch.relationship, target);
        }

        loaded
            .into_iter()
            .next()
            .flatten()
            .map(|(root, _)| Some(root))
            .ok_or_else(|| Error::Mapping {
                column: plan.root().primary_key().column_name.to_string(),
                reason: "root key is null".to_string(),
            })
    }

    /// Resident instance for the row's key, or a new tracked one. The flag
    /// is `true` for a new instance.
    fn load_instance(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        values: &[Value],
        read_only: bool,
    ) -> Result<(Rc<dyn Any>, bool)> {
        let id = values[descriptor.primary_key_index()].clone();
        let key = ObjectKey::new(descriptor.name(), &id);
        if let Some(tracked) = self.identity_map.get(&key) {
            return Ok((tracked.object.clone(), false));
        }
        let object = descriptor.hydrate(values)?;
        let snapshot = if read_only {
            None
        } else {
            Some(descriptor.instance_values(&*object)?)
        };
        self.identity_map.insert(
            key,
            TrackedObject {
                descriptor: descriptor.clone(),
                object: object.clone(),
                key: id,
                snapshot,
                state: ObjectState::Persistent,
            },
        );
        Ok((object, true))
    }

    // ========================================================================
    // Flush and Transaction Management
    // ========================================================================

    /// Whether a flush would write anything.
    pub fn has_pending_changes(&self) -> Result<bool> {
        Ok(!self.pending_new.is_empty()
            || !self.pending_delete.is_empty()
            || !self.dirty_keys()?.is_empty())
    }

    fn dirty_keys(&self) -> Result<Vec<ObjectKey>> {
        let mut dirty = Vec::new();
        for (key, tracked) in &self.identity_map {
            if tracked.state != ObjectState::Persistent {
                continue;
            }
            let Some(snapshot) = &tracked.snapshot else {
                continue;
            };
            if tracked.values()? != *snapshot {
                dirty.push(*key);
            }
        }
        dirty.sort_by_key(|k| self.catalog.dependency_rank(k.entity()));
        Ok(dirty)
    }

    fn auto_flush(&mut self) -> Result<()> {
        if self.config.auto_flush && self.connection.in_transaction() {
            self.flush()?;
        }
        Ok(())
    }

    /// Write pending changes: inserts in dependency order, then dirty
    /// updates, then deletes in reverse dependency order. Does not commit.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let dirty = self.dirty_keys()?;
        if self.pending_new.is_empty() && self.pending_delete.is_empty() && dirty.is_empty() {
            return Ok(());
        }
        self.require_transaction("flush")?;

        let start = Instant::now();
        tracing::info!(
            inserts = self.pending_new.len(),
            updates = dirty.len(),
            deletes = self.pending_delete.len(),
            "Starting flush"
        );
        self.state = UnitOfWorkState::Flushing;
        let result = self.write_pending(&dirty);
        self.state = UnitOfWorkState::Active;
        result?;
        tracing::info!(elapsed_ms = start.elapsed().as_millis(), "Flush completed");
        Ok(())
    }

    fn write_pending(&mut self, dirty: &[ObjectKey]) -> Result<()> {
        let mut inserts = std::mem::take(&mut self.pending_new);
        inserts.sort_by_key(|k| self.catalog.dependency_rank(k.entity()));
        for (n, key) in inserts.iter().enumerate() {
            if let Err(e) = self.write_insert(key) {
                self.pending_new = inserts[n..].to_vec();
                return Err(e);
            }
        }

        for key in dirty {
            self.write_update(key)?;
        }

        let mut deletes = std::mem::take(&mut self.pending_delete);
        deletes.sort_by_key(|k| Reverse(self.catalog.dependency_rank(k.entity())));
        for (n, key) in deletes.iter().enumerate() {
            if let Err(e) = self.write_delete(key) {
                self.pending_delete = deletes[n..].to_vec();
                return Err(e);
            }
        }
        Ok(())
    }

    fn write_insert(&mut self, key: &ObjectKey) -> Result<()> {
        let Some(tracked) = self.identity_map.get_mut(key) else {
            return Ok(());
        };
        let values = tracked.values()?;
        let (statement, params) = InsertBuilder::new(&tracked.descriptor, &values).build();
        execute(&mut self.connection, &statement, &params)?;
        tracked.state = ObjectState::Persistent;
        tracked.snapshot = Some(values);
        Ok(())
    }

    fn write_update(&mut self, key: &ObjectKey) -> Result<()> {
        let Some(tracked) = self.identity_map.get_mut(key) else {
            return Ok(());
        };
        let Some(before) = tracked.snapshot.clone() else {
            return Ok(());
        };
        tracked
            .descriptor
            .fire(LifecyclePhase::PreUpdate, &*tracked.object);
        let after = tracked.values()?;
        let update =
            UpdateBuilder::new(&tracked.descriptor, tracked.key.clone()).changed(&before, &after);
        if !update.is_empty() {
            let (statement, params) = update.build();
            execute(&mut self.connection, &statement, &params)?;
        }
        tracked.snapshot = Some(after);
        Ok(())
    }

    fn write_delete(&mut self, key: &ObjectKey) -> Result<()> {
        let Some(tracked) = self.identity_map.get(key) else {
            return Ok(());
        };
        let (statement, params) = DeleteBuilder::new(&tracked.descriptor, tracked.key.clone()).build();
        execute(&mut self.connection, &statement, &params)?;
        self.identity_map.remove(key);
        Ok(())
    }

    /// Flush and commit. The unit of work is closed afterwards.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush()?;
        tracing::info!(tracked = self.identity_map.len(), "Committing transaction");
        if self.connection.in_transaction() {
            self.connection.commit()?;
        }
        self.state = UnitOfWorkState::Committed;
        Ok(())
    }

    /// Discard pending changes and roll back. The unit of work is closed
    /// afterwards.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        tracing::info!(
            pending_new = self.pending_new.len(),
            pending_delete = self.pending_delete.len(),
            "Rolling back transaction"
        );
        self.state = UnitOfWorkState::RolledBack;
        self.identity_map.clear();
        self.pending_new.clear();
        self.pending_delete.clear();
        if self.connection.in_transaction() {
            self.connection.rollback()?;
        }
        Ok(())
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    pub fn tracked_count(&self) -> usize {
        self.identity_map.len()
    }

    pub fn debug_state(&self) -> UnitOfWorkDebugInfo {
        UnitOfWorkDebugInfo {
            state: self.state,
            tracked: self.identity_map.len(),
            pending_new: self.pending_new.len(),
            pending_delete: self.pending_delete.len(),
            in_transaction: self.connection.in_transaction(),
        }
    }
}

impl<C: Connection> Drop for UnitOfWork<C> {
    fn drop(&mut self) {
        let open = matches!(
            self.state,
            UnitOfWorkState::Active | UnitOfWorkState::Flushing
        );
        if open && self.connection.in_transaction() {
            tracing::info!("Rolling back transaction of dropped unit of work");
            if let Err(e) = self.connection.rollback() {
                tracing::warn!(error = %e, "Rollback on drop failed");
            }
        }
    }
}

impl<C: Connection> std::fmt::Debug for UnitOfWork<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state)
            .field("tracked", &self.identity_map.len())
            .field("pending_new", &self.pending_new.len())
            .field("pending_delete", &self.pending_delete.len())
            .field("in_transaction", &self.connection.in_transaction())
            .finish_non_exhaustive()
    }
}

fn check_entity_plan<E: Entity>(plan: &QueryPlan) -> Result<()> {
    if *plan.projection() != PlanProjection::Entity {
        return Err(Error::invocation(plan.method(), "does not select entities"));
    }
    if plan.root().entity_type() != TypeId::of::<E>() {
        return Err(Error::invocation(
            plan.method(),
            format!("selects `{}`, not `{}`", plan.root().name(), E::ENTITY_NAME),
        ));
    }
    Ok(())
}

fn execute<C: Connection>(connection: &mut C, statement: &Statement, params: &[Value]) -> Result<u64> {
    tracing::debug!(sql = %statement, params = params.len(), "Executing statement");
    connection.execute(statement, params)
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use datarepo_core::{RowLock, StoreError};
    use datarepo_memory::{MemoryConnection, MemoryStore};
    use datarepo_query::{Derivator, QueryParser};

    use super::*;
    use crate::testing::{Member, Team, catalog};

    struct Fixture {
        store: MemoryStore,
        catalog: Arc<SchemaCatalog>,
    }

    impl Fixture {
        fn new() -> Self {
            let catalog = Arc::new(catalog());
            let store = MemoryStore::default();
            store.install(&catalog).unwrap();
            Self { store, catalog }
        }

        fn uow(&self) -> UnitOfWork<MemoryConnection> {
            UnitOfWork::begin(self.store.connect(), self.catalog.clone(), SessionConfig::default())
                .unwrap()
        }

        fn derived(&self, method: &str, params: &[ParamDecl]) -> QueryPlan {
            let member = self.catalog.descriptor("Member").unwrap().clone();
            let derived = Derivator::new(&self.catalog, &member).derive(method, params).unwrap();
            QueryPlanBuilder::new(self.catalog.clone(), member, method)
                .params(params)
                .build_derived(&derived)
                .unwrap()
        }

        fn parsed(&self, query: &str, params: &[ParamDecl]) -> QueryPlan {
            let member = self.catalog.descriptor("Member").unwrap().clone();
            let parsed = QueryParser::new(&self.catalog, params).parse(query).unwrap();
            QueryPlanBuilder::new(self.catalog.clone(), member, "query")
                .params(params)
                .build_parsed(parsed)
                .unwrap()
        }

        /// teamA with member1 (10) and member2 (20); committed.
        fn seed(&self) -> (i64, i64, i64) {
            let mut uow = self.uow();
            let team = uow.save(Team::new("teamA")).unwrap();
            let m1 = uow.save(Member::new("member1", 10, Some(&team))).unwrap();
            let m2 = uow.save(Member::new("member2", 20, Some(&team))).unwrap();
            uow.commit().unwrap();
            let ids = (team.borrow().id, m1.borrow().id, m2.borrow().id);
            (ids.0.unwrap(), ids.1.unwrap(), ids.2.unwrap())
        }
    }

    #[test]
    fn test_save_then_find_returns_same_handle() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        let team = uow.save(Team::new("teamA")).unwrap();
        let id = team.borrow().id.unwrap();
        let found = uow.find_by_id::<Team>(id).unwrap().unwrap();
        assert!(found.ptr_eq(&team));
        assert!(uow.contains(&team));
        assert_eq!(fx.store.stats().selects, 0);
    }

    #[test]
    fn test_pre_insert_callback_runs_at_save() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        let team = uow.save(Team::new("")).unwrap();
        assert_eq!(team.borrow().name, "unnamed");
    }

    #[test]
    fn test_flush_inserts_referenced_entities_first() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        let team = uow.save(Team::new("teamA")).unwrap();
        let member = uow.save(Member::new("member1", 10, Some(&team))).unwrap();
        // Queue the member ahead of its team.
        uow.pending_new.reverse();
        uow.commit().unwrap();
        assert_eq!(fx.store.row_count("team").unwrap(), 1);
        assert_eq!(fx.store.row_count("member").unwrap(), 1);
        assert!(member.borrow().id.is_some());
    }

    #[test]
    fn test_dirty_instance_is_updated_at_flush() {
        let fx = Fixture::new();
        let (_, m1, _) = fx.seed();
        let mut uow = fx.uow();
        let member = uow.find_by_id::<Member>(m1).unwrap().unwrap();
        member.borrow_mut().age = 11;
        uow.flush().unwrap();
        assert_eq!(fx.store.stats().updates, 1);
        uow.flush().unwrap();
        assert_eq!(fx.store.stats().updates, 1);
        uow.commit().unwrap();

        let mut check = fx.uow();
        assert_eq!(check.find_by_id::<Member>(m1).unwrap().unwrap().borrow().age, 11);
    }

    #[test]
    fn test_read_only_instance_is_never_flushed() {
        let fx = Fixture::new();
        fx.seed();
        let plan = fx.derived("findByUsername", &[ParamDecl::scalar("username")]);
        let mut uow = fx.uow();
        let member = uow
            .one::<Member>(&plan, &["member1".into()], QueryHints::read_only())
            .unwrap()
            .unwrap();
        member.borrow_mut().age = 99;
        uow.commit().unwrap();
        assert_eq!(fx.store.stats().updates, 0);
    }

    #[test]
    fn test_resident_instance_is_not_overwritten_by_query() {
        let fx = Fixture::new();
        let (_, m1, _) = fx.seed();
        let mut config = SessionConfig::default();
        config.auto_flush = false;
        let mut uow = UnitOfWork::begin(fx.store.connect(), fx.catalog.clone(), config).unwrap();
        let member = uow.find_by_id::<Member>(m1).unwrap().unwrap();
        member.borrow_mut().username = "edited".into();

        let plan = fx.derived("findByAgeGreaterThan", &[ParamDecl::scalar("age")]);
        let found = uow.list::<Member>(&plan, &[5.into()], Window::default(), QueryHints::default()).unwrap();
        let again = found.iter().find(|m| m.borrow().id == Some(m1)).unwrap();
        assert!(again.ptr_eq(&member));
        assert_eq!(again.borrow().username, "edited");
    }

    #[test]
    fn test_auto_flush_makes_pending_insert_visible() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        let team = uow.save(Team::new("teamA")).unwrap();
        uow.save(Member::new("fresh", 30, Some(&team))).unwrap();
        let plan = fx.derived("findByUsername", &[ParamDecl::scalar("username")]);
        let found = uow.one::<Member>(&plan, &["fresh".into()], QueryHints::default()).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_delete_runs_after_updates_and_removes_row() {
        let fx = Fixture::new();
        let (_, m1, _) = fx.seed();
        let mut uow = fx.uow();
        let member = uow.find_by_id::<Member>(m1).unwrap().unwrap();
        uow.delete(&member).unwrap();
        assert!(uow.find_by_id::<Member>(m1).unwrap().is_none());
        uow.commit().unwrap();
        assert_eq!(fx.store.row_count("member").unwrap(), 1);
    }

    #[test]
    fn test_delete_of_unflushed_instance_forgets_it() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        let team = uow.save(Team::new("teamA")).unwrap();
        uow.delete(&team).unwrap();
        assert_eq!(uow.debug_state().pending_new, 0);
        uow.commit().unwrap();
        assert_eq!(fx.store.stats().inserts, 0);
    }

    #[test]
    fn test_merge_copies_state_into_resident_instance() {
        let fx = Fixture::new();
        let (team_id, _, _) = fx.seed();
        let mut uow = fx.uow();
        let resident = uow.find_by_id::<Team>(team_id).unwrap().unwrap();
        let detached = Team {
            id: Some(team_id),
            name: "renamed".into(),
        };
        let merged = uow.save(detached).unwrap();
        assert!(merged.ptr_eq(&resident));
        assert_eq!(resident.borrow().name, "renamed");
        uow.commit().unwrap();
        assert_eq!(fx.store.stats().updates, 1);
    }

    #[test]
    fn test_lazy_reference_resolves_through_identity_map() {
        let fx = Fixture::new();
        let (team_id, m1, m2) = fx.seed();
        let mut uow = fx.uow();
        let first = uow.find_by_id::<Member>(m1).unwrap().unwrap();
        let second = uow.find_by_id::<Member>(m2).unwrap().unwrap();
        assert!(!first.borrow().team.is_loaded());

        let team = uow.resolve::<Member, Team>(&first, "team").unwrap().unwrap();
        assert_eq!(team.borrow().id, Some(team_id));
        let selects = fx.store.stats().selects;
        let same = uow.resolve::<Member, Team>(&second, "team").unwrap().unwrap();
        assert!(same.ptr_eq(&team));
        assert_eq!(fx.store.stats().selects, selects);

        // Cached on the owner.
        uow.resolve::<Member, Team>(&first, "team").unwrap();
        assert_eq!(uow.n1_tracker().count_for("Member", "team"), 2);
    }

    #[test]
    fn test_resolve_rejects_wrong_target() {
        let fx = Fixture::new();
        let (_, m1, _) = fx.seed();
        let mut uow = fx.uow();
        let member = uow.find_by_id::<Member>(m1).unwrap().unwrap();
        let err = uow.resolve::<Member, Member>(&member, "team").unwrap_err();
        assert!(matches!(err, Error::InvalidInvocation { .. }));
    }

    #[test]
    fn test_fetch_join_prefills_reference() {
        let fx = Fixture::new();
        fx.seed();
        let plan = fx.parsed("select m from Member m join fetch m.team", &[]);
        let mut uow = fx.uow();
        let members = uow
            .list::<Member>(&plan, &[], Window::default(), QueryHints::default())
            .unwrap();
        assert_eq!(members.len(), 2);
        let teams: Vec<_> = members
            .iter()
            .map(|m| m.borrow().team.get().flatten().cloned().unwrap())
            .collect();
        assert!(teams[0].ptr_eq(&teams[1]));
        assert_eq!(fx.store.stats().selects, 1);
        assert_eq!(uow.n1_stats().total_loads, 0);
    }

    #[test]
    fn test_single_result_with_two_rows_is_non_unique() {
        let fx = Fixture::new();
        fx.seed();
        let plan = fx.derived("findByAgeGreaterThan", &[ParamDecl::scalar("age")]);
        let mut uow = fx.uow();
        let err = uow
            .one::<Member>(&plan, &[0.into()], QueryHints::default())
            .unwrap_err();
        assert!(matches!(err, Error::NonUniqueResult { found: 2 }));
    }

    #[test]
    fn test_find_one_subject_is_unique_on_every_terminal() {
        let fx = Fixture::new();
        let (team_id, _, _) = fx.seed();
        let mut uow = fx.uow();
        let team = uow.find_by_id::<Team>(team_id).unwrap().unwrap();
        uow.save(Member::new("member1", 30, Some(&team))).unwrap();
        uow.commit().unwrap();

        let plan = fx.derived("findOneByUsername", &[ParamDecl::scalar("username")]);
        let args = ["member1".into()];
        let mut uow = fx.uow();
        let listed = uow
            .list::<Member>(&plan, &args, Window::default(), QueryHints::default())
            .unwrap_err();
        assert!(matches!(listed, Error::NonUniqueResult { found: 2 }));
        let first = uow
            .first::<Member>(&plan, &args, None, QueryHints::default())
            .unwrap_err();
        assert!(matches!(first, Error::NonUniqueResult { found: 2 }));

        let single = uow
            .first::<Member>(&plan, &["member2".into()], None, QueryHints::default())
            .unwrap()
            .unwrap();
        assert_eq!(single.borrow().age, 20);
    }

    #[test]
    fn test_entity_plan_runs_end_to_end() {
        let fx = Fixture::new();
        fx.seed();
        let plan = fx.derived("findByUsername", &[ParamDecl::scalar("username")]);
        let mut uow = fx.uow();
        let found = uow
            .list::<Member>(&plan, &["member2".into()], Window::default(), QueryHints::default())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].borrow().age, 20);

        let err = uow
            .list::<Team>(&plan, &["member2".into()], Window::default(), QueryHints::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInvocation { .. }));
    }

    #[test]
    fn test_exists_rejects_count_and_bulk_plans() {
        let fx = Fixture::new();
        fx.seed();
        let mut uow = fx.uow();

        let count = fx.derived("countByAge", &[ParamDecl::scalar("age")]);
        // No member is 99, yet the count row itself would read as a match.
        let err = uow.exists(&count, &[99.into()]).unwrap_err();
        assert!(matches!(err, Error::InvalidInvocation { .. }));

        let bulk = fx.parsed(
            "update Member m set m.age = m.age + 1 where m.age >= :age",
            &[ParamDecl::scalar("age")],
        );
        let err = uow.exists(&bulk, &[99.into()]).unwrap_err();
        assert!(matches!(err, Error::InvalidInvocation { .. }));

        let exists = fx.derived("existsByAge", &[ParamDecl::scalar("age")]);
        assert!(!uow.exists(&exists, &[99.into()]).unwrap());
        assert!(uow.exists(&exists, &[10.into()]).unwrap());
    }

    #[test]
    fn test_deleted_instance_is_hidden_before_flush() {
        let fx = Fixture::new();
        let (_, m1, _) = fx.seed();
        let mut config = SessionConfig::default();
        config.auto_flush = false;
        let mut uow = UnitOfWork::begin(fx.store.connect(), fx.catalog.clone(), config).unwrap();
        let member = uow.find_by_id::<Member>(m1).unwrap().unwrap();
        uow.delete(&member).unwrap();

        let plan = fx.derived("findByAgeGreaterThan", &[ParamDecl::scalar("age")]);
        let found = uow
            .list::<Member>(&plan, &[0.into()], Window::default(), QueryHints::default())
            .unwrap();
        assert_eq!(fx.store.row_count("member").unwrap(), 2);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].borrow().username, "member2");
        assert!(uow.find_by_id::<Member>(m1).unwrap().is_none());
    }

    #[test]
    fn test_debug_output_names_state() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        uow.save(Team::new("teamA")).unwrap();
        let rendered = format!("{uow:?}");
        assert!(rendered.starts_with("UnitOfWork"), "{rendered}");
        assert!(rendered.contains("pending_new: 1"), "{rendered}");
        assert!(rendered.contains("in_transaction: true"), "{rendered}");
    }

    #[test]
    fn test_page_and_slice() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        for n in 0..7 {
            uow.save(Member::new(&format!("member{n}"), 10, None)).unwrap();
        }
        uow.commit().unwrap();
        fx.store.reset_stats();

        let plan = fx.derived("findByAge", &[ParamDecl::scalar("age"), ParamDecl::pageable()]);
        let mut uow = fx.uow();
        let request = PageRequest::of_sorted(0, 3, Sort::desc("username")).unwrap();
        let page = uow.page::<Member>(&plan, &[10.into()], &request, QueryHints::default()).unwrap();
        assert_eq!(page.number_of_elements(), 3);
        assert_eq!(page.total_elements(), 7);
        assert_eq!(page.total_pages(), 3);
        assert_eq!(page.content()[0].borrow().username, "member6");
        assert_eq!(fx.store.stats().count_queries, 1);

        let last = PageRequest::of(2, 3).unwrap();
        let slice = uow.slice::<Member>(&plan, &[10.into()], &last, QueryHints::default()).unwrap();
        assert_eq!(slice.number_of_elements(), 1);
        assert!(!slice.has_next());
        assert_eq!(fx.store.stats().count_queries, 1);
    }

    #[test]
    fn test_short_first_page_skips_count() {
        let fx = Fixture::new();
        fx.seed();
        fx.store.reset_stats();
        let plan = fx.derived("findByAgeGreaterThan", &[ParamDecl::scalar("age"), ParamDecl::pageable()]);
        let mut uow = fx.uow();
        let request = PageRequest::of(0, 10).unwrap();
        let page = uow.page::<Member>(&plan, &[0.into()], &request, QueryHints::default()).unwrap();
        assert_eq!(page.total_elements(), 2);
        assert_eq!(fx.store.stats().count_queries, 0);

        uow.save(Member::new("member3", 30, None)).unwrap();
        // short non-empty later page: offset 2 plus one row
        let request = PageRequest::of(1, 2).unwrap();
        let page = uow.page::<Member>(&plan, &[0.into()], &request, QueryHints::default()).unwrap();
        assert_eq!(page.content().len(), 1);
        assert_eq!(page.total_elements(), 3);
        assert_eq!(fx.store.stats().count_queries, 0);

        // an empty later page proves nothing
        let page = uow.page::<Member>(&plan, &[25.into()], &request, QueryHints::default()).unwrap();
        assert!(page.content().is_empty());
        assert_eq!(page.total_elements(), 1);
        assert_eq!(fx.store.stats().count_queries, 1);
    }

    #[test]
    fn test_bulk_update_leaves_resident_stale_until_clear() {
        let fx = Fixture::new();
        let (_, m1, _) = fx.seed();
        let params = [ParamDecl::scalar("age")];
        let bulk = fx.parsed(
            "update Member m set m.age = m.age + 1 where m.age >= :age",
            &params,
        );
        let mut uow = fx.uow();
        let member = uow.find_by_id::<Member>(m1).unwrap().unwrap();
        let affected = uow.execute_bulk(&bulk, &[0.into()], false).unwrap();
        assert_eq!(affected, 2);
        assert_eq!(member.borrow().age, 10);

        uow.clear().unwrap();
        let fresh = uow.find_by_id::<Member>(m1).unwrap().unwrap();
        assert!(!fresh.ptr_eq(&member));
        assert_eq!(fresh.borrow().age, 11);
    }

    #[test]
    fn test_bulk_with_clear_automatically() {
        let fx = Fixture::new();
        let (_, m1, _) = fx.seed();
        let bulk = fx.parsed(
            "update Member m set m.age = m.age + 1 where m.age >= :age",
            &[ParamDecl::scalar("age")],
        );
        let mut uow = fx.uow();
        uow.find_by_id::<Member>(m1).unwrap();
        uow.execute_bulk(&bulk, &[0.into()], true).unwrap();
        assert_eq!(uow.tracked_count(), 0);
    }

    #[test]
    fn test_lock_requires_transaction() {
        let fx = Fixture::new();
        fx.seed();
        let member = fx.catalog.descriptor("Member").unwrap().clone();
        let plan = QueryPlanBuilder::new(fx.catalog.clone(), member, "findLocked")
            .lock(RowLock::Update)
            .build_criteria(None, &Sort::unsorted(), Cardinality::Collection)
            .unwrap();
        let mut reader = UnitOfWork::new(fx.store.connect(), fx.catalog.clone(), SessionConfig::default());
        let err = reader
            .list::<Member>(&plan, &[], Window::default(), QueryHints::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoTransaction { operation: "row lock" }));

        let mut writer = fx.uow();
        assert_eq!(
            writer
                .list::<Member>(&plan, &[], Window::default(), QueryHints::default())
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_writes_without_transaction_fail() {
        let fx = Fixture::new();
        let mut reader = UnitOfWork::new(fx.store.connect(), fx.catalog.clone(), SessionConfig::default());
        let err = reader.save(Team::new("teamA")).unwrap_err();
        assert!(matches!(err, Error::NoTransaction { operation: "save" }));
    }

    #[test]
    fn test_operations_after_commit_fail() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        uow.commit().unwrap();
        assert_eq!(uow.state(), UnitOfWorkState::Committed);
        let err = uow.find_by_id::<Team>(1_i64).unwrap_err();
        assert!(matches!(
            err,
            Error::UnitOfWorkClosed {
                state: ClosedState::Committed
            }
        ));
        assert!(uow.rollback().is_err());
    }

    #[test]
    fn test_rollback_discards_flushed_rows() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        uow.save(Team::new("teamA")).unwrap();
        uow.flush().unwrap();
        assert_eq!(fx.store.row_count("team").unwrap(), 1);
        uow.rollback().unwrap();
        assert_eq!(fx.store.row_count("team").unwrap(), 0);
        assert!(matches!(
            uow.save(Team::new("teamB")).unwrap_err(),
            Error::UnitOfWorkClosed {
                state: ClosedState::RolledBack
            }
        ));
    }

    #[test]
    fn test_drop_rolls_back() {
        let fx = Fixture::new();
        {
            let mut uow = fx.uow();
            uow.save(Team::new("teamA")).unwrap();
            uow.flush().unwrap();
        }
        assert_eq!(fx.store.row_count("team").unwrap(), 0);
    }

    #[test]
    fn test_store_failure_surfaces_as_store_execution() {
        let fx = Fixture::new();
        let mut uow = fx.uow();
        let ghost = Team {
            id: Some(404),
            name: "ghost".into(),
        };
        let ghost = Managed::new(ghost);
        uow.save(Member::new("orphan", 1, Some(&ghost))).unwrap();
        let err = uow.flush().unwrap_err();
        match err {
            Error::StoreExecution { statement, source } => {
                assert!(statement.starts_with("INSERT INTO member"), "{statement}");
                assert!(matches!(source, StoreError::ForeignKeyViolation { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
