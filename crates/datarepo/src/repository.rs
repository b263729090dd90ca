//! Repositories: built-in operations plus declared methods.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use datarepo_core::{
    CompareOp, Connection, Entity, EntityDescriptor, Error, FromValue, Managed, Operand, Result,
    Row, SchemaCatalog, Value,
};
use datarepo_query::{
    Cardinality, Page, PageRequest, ParamDecl, ParamKind, PlanProjection, Predicate,
    PropertyPath, QueryPlan, QueryPlanBuilder, Slice, Sort, Specification, Window,
};
use datarepo_session::{Projection, QueryHints, UnitOfWork};

use crate::method::{CompiledMethod, MethodDecl, MethodId};

// ============================================================================
// Builder
// ============================================================================

/// Compiles the methods of a [`Repository`].
///
/// Every declaration is compiled when it is declared; derivation and parse
/// errors surface here, never at call time.
pub struct RepositoryBuilder<E: Entity> {
    catalog: Arc<SchemaCatalog>,
    descriptor: Arc<EntityDescriptor>,
    find_all_fetch: Vec<String>,
    methods: Vec<CompiledMethod>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> RepositoryBuilder<E> {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Result<Self> {
        let descriptor = catalog.descriptor_of::<E>()?.clone();
        Ok(Self {
            catalog,
            descriptor,
            find_all_fetch: Vec::new(),
            methods: Vec::new(),
            _entity: PhantomData,
        })
    }

    /// Fetch these paths in `find_all` and its sorted and paged variants.
    pub fn find_all_fetch(mut self, paths: &[&str]) -> Self {
        self.find_all_fetch
            .extend(paths.iter().map(|p| (*p).to_string()));
        self
    }

    /// Compile a declared method.
    #[tracing::instrument(level = "debug", skip(self, decl), fields(entity = E::ENTITY_NAME, method = decl.name()))]
    pub fn declare(&mut self, decl: MethodDecl) -> Result<MethodId> {
        if self.methods.iter().any(|m| m.name() == decl.name()) {
            return Err(Error::derivation(decl.name(), "method is declared twice"));
        }
        let method = CompiledMethod::compile(&self.catalog, &self.descriptor, decl)?;
        self.methods.push(method);
        Ok(MethodId(self.methods.len() - 1))
    }

    fn criteria(&self, method: &str) -> QueryPlanBuilder {
        QueryPlanBuilder::new(self.catalog.clone(), self.descriptor.clone(), method)
    }

    fn key_predicate(&self, path: PropertyPath) -> Predicate {
        Predicate::Comparison {
            path,
            op: CompareOp::Eq,
            operand: Operand::Param(0),
        }
    }

    /// Plans of the built-in operations.
    fn builtins(&self) -> Result<Builtins> {
        let id = [ParamDecl::scalar("id")];
        let by_key = self.key_predicate(PropertyPath::parse(self.descriptor.primary_key().name));
        let find_all = self
            .criteria("findAll")
            .fetch_paths(&self.find_all_fetch)
            .build_criteria(None, &Sort::unsorted(), Cardinality::Collection)?;
        let count = self
            .criteria("count")
            .build_criteria(None, &Sort::unsorted(), Cardinality::Count)?;
        let exists_by_id = self.criteria("existsById").params(&id).build_criteria(
            Some(&by_key),
            &Sort::unsorted(),
            Cardinality::Exists,
        )?;

        let mut back_references = HashMap::new();
        for rel in self.descriptor.relationships().iter().filter(|r| !r.is_owning()) {
            let Some(mapped_by) = rel.mapped_by else {
                continue;
            };
            let target = self.catalog.descriptor(rel.target)?.clone();
            let owner_key = PropertyPath::parse(mapped_by).child(self.descriptor.primary_key().name);
            let plan = QueryPlanBuilder::new(self.catalog.clone(), target, rel.name)
                .params(&id)
                .build_criteria(
                    Some(&self.key_predicate(owner_key)),
                    &Sort::unsorted(),
                    Cardinality::Collection,
                )?;
            back_references.insert(rel.name, plan);
        }

        Ok(Builtins {
            find_all,
            count,
            exists_by_id,
            back_references,
        })
    }

    pub fn build(self) -> Result<Repository<E>> {
        let builtins = self.builtins()?;
        tracing::debug!(
            entity = E::ENTITY_NAME,
            methods = self.methods.len(),
            "Repository built"
        );
        Ok(Repository {
            catalog: self.catalog,
            descriptor: self.descriptor,
            builtins,
            methods: self.methods,
            _entity: PhantomData,
        })
    }
}

struct Builtins {
    find_all: QueryPlan,
    count: QueryPlan,
    exists_by_id: QueryPlan,
    /// Owning-side queries per inverse relationship.
    back_references: HashMap<&'static str, QueryPlan>,
}

// ============================================================================
// Repository
// ============================================================================

/// Data access for one entity type.
///
/// A repository holds compiled plans only; every call runs inside the
/// [`UnitOfWork`] it is given.
///
/// ```ignore
/// let members = repo.invoke(&mut uow, find_by_username).arg("member1").list()?;
/// let page = repo.find_all_paged(&mut uow, &PageRequest::of(0, 3)?)?;
/// ```
pub struct Repository<E: Entity> {
    catalog: Arc<SchemaCatalog>,
    descriptor: Arc<EntityDescriptor>,
    builtins: Builtins,
    methods: Vec<CompiledMethod>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Repository<E> {
    pub fn builder(catalog: Arc<SchemaCatalog>) -> Result<RepositoryBuilder<E>> {
        RepositoryBuilder::new(catalog)
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn method(&self, id: MethodId) -> Option<&CompiledMethod> {
        self.methods.get(id.0)
    }

    /// Look a declared method up by name.
    pub fn method_id(&self, name: &str) -> Option<MethodId> {
        self.methods.iter().position(|m| m.name() == name).map(MethodId)
    }

    pub fn save<C: Connection>(&self, uow: &mut UnitOfWork<C>, entity: E) -> Result<Managed<E>> {
        uow.save(entity)
    }

    pub fn find_by_id<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
        id: impl Into<Value>,
    ) -> Result<Option<Managed<E>>> {
        uow.find_by_id(id)
    }

    pub fn exists_by_id<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
        id: impl Into<Value>,
    ) -> Result<bool> {
        uow.exists(&self.builtins.exists_by_id, &[id.into()])
    }

    pub fn find_all<C: Connection>(&self, uow: &mut UnitOfWork<C>) -> Result<Vec<Managed<E>>> {
        uow.list(&self.builtins.find_all, &[], Window::default(), QueryHints::default())
    }

    pub fn find_all_sorted<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
        sort: &Sort,
    ) -> Result<Vec<Managed<E>>> {
        let window = Window {
            sort: Some(sort),
            ..Window::default()
        };
        uow.list(&self.builtins.find_all, &[], window, QueryHints::default())
    }

    pub fn find_all_paged<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
        request: &PageRequest,
    ) -> Result<Page<Managed<E>>> {
        uow.page(&self.builtins.find_all, &[], request, QueryHints::default())
    }

    /// Entities matching a specification. An empty specification matches
    /// everything.
    pub fn find_all_matching<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
        spec: &Specification<E>,
    ) -> Result<Vec<Managed<E>>> {
        let plan = self.matching("findAllMatching", spec, Cardinality::Collection)?;
        uow.list(&plan, &[], Window::default(), QueryHints::default())
    }

    pub fn find_all_matching_paged<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
        spec: &Specification<E>,
        request: &PageRequest,
    ) -> Result<Page<Managed<E>>> {
        let plan = self.matching("findAllMatching", spec, Cardinality::Collection)?;
        uow.page(&plan, &[], request, QueryHints::default())
    }

    pub fn count<C: Connection>(&self, uow: &mut UnitOfWork<C>) -> Result<u64> {
        uow.count(&self.builtins.count, &[])
    }

    pub fn count_matching<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
        spec: &Specification<E>,
    ) -> Result<u64> {
        let plan = self.matching("countMatching", spec, Cardinality::Count)?;
        uow.count(&plan, &[])
    }

    fn matching(
        &self,
        method: &str,
        spec: &Specification<E>,
        cardinality: Cardinality,
    ) -> Result<QueryPlan> {
        QueryPlanBuilder::new(self.catalog.clone(), self.descriptor.clone(), method)
            .build_criteria(spec.predicate(), &Sort::unsorted(), cardinality)
    }

    pub fn delete<C: Connection>(&self, uow: &mut UnitOfWork<C>, entity: &Managed<E>) -> Result<()> {
        uow.delete(entity)
    }

    /// Delete by key; `false` when no such entity exists.
    pub fn delete_by_id<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
        id: impl Into<Value>,
    ) -> Result<bool> {
        match uow.find_by_id::<E>(id)? {
            Some(entity) => {
                uow.delete(&entity)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read the inverse side of a relationship, such as `Team.members`, by
    /// querying the owning side.
    pub fn back_reference<T: Entity, C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
        owner: &Managed<E>,
        relationship: &str,
    ) -> Result<Vec<Managed<T>>> {
        let method = format!("{}.{relationship}", E::ENTITY_NAME);
        let plan = self
            .builtins
            .back_references
            .get(relationship)
            .ok_or_else(|| Error::invocation(method.as_str(), "not an inverse relationship"))?;
        if plan.root().name() != T::ENTITY_NAME {
            return Err(Error::invocation(
                method,
                format!("relates to `{}`, not `{}`", plan.root().name(), T::ENTITY_NAME),
            ));
        }
        let key = owner
            .try_borrow()
            .map_err(|_| Error::invocation(method.as_str(), "owner is mutably borrowed"))?
            .id();
        if key.is_null() {
            return Ok(Vec::new());
        }
        uow.list(plan, &[key], Window::default(), QueryHints::default())
    }

    /// Start a call of a declared method.
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued by another repository's builder.
    pub fn invoke<'a, C: Connection>(
        &'a self,
        uow: &'a mut UnitOfWork<C>,
        id: MethodId,
    ) -> Invocation<'a, E, C> {
        Invocation {
            method: &self.methods[id.0],
            uow,
            args: Vec::new(),
            page: None,
            sort: None,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> std::fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &E::ENTITY_NAME)
            .field("methods", &self.methods.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Invocation
// ============================================================================

/// One call of a declared method: arguments, then a terminal.
///
/// The terminal decides how results are returned (`list`, `one`, `page`,
/// ...); it must agree with what the method declares.
pub struct Invocation<'a, E: Entity, C: Connection> {
    method: &'a CompiledMethod,
    uow: &'a mut UnitOfWork<C>,
    args: Vec<Value>,
    page: Option<PageRequest>,
    sort: Option<Sort>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity, C: Connection> Invocation<'a, E, C> {
    /// Bind the next positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Bind a collection argument for `IN`.
    pub fn arg_list<V: Into<Value>>(mut self, values: Vec<V>) -> Self {
        self.args.push(Value::from(values));
        self
    }

    pub fn args(mut self, values: &[Value]) -> Self {
        self.args.extend_from_slice(values);
        self
    }

    /// The `Pageable` argument.
    pub fn page_request(mut self, request: PageRequest) -> Self {
        self.page = Some(request);
        self
    }

    /// The `Sort` argument.
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    fn hints(&self) -> QueryHints {
        QueryHints {
            read_only: self.method.read_only,
        }
    }

    fn fail(&self, reason: &str) -> Error {
        Error::invocation(self.method.name(), reason)
    }

    fn check_extras(&self) -> Result<()> {
        if self.page.is_some() && !self.method.accepts(ParamKind::Pageable) {
            return Err(self.fail("declares no pageable parameter"));
        }
        if self.sort.is_some() && !self.method.accepts(ParamKind::Sort) {
            return Err(self.fail("declares no sort parameter"));
        }
        Ok(())
    }

    /// The paging request, which a paged terminal requires.
    fn require_page(&self) -> Result<()> {
        if !self.method.accepts(ParamKind::Pageable) {
            return Err(self.fail("declares no pageable parameter"));
        }
        if self.page.is_none() {
            return Err(self.fail("missing page request"));
        }
        Ok(())
    }

    /// All matching entities.
    #[tracing::instrument(level = "debug", skip(self), fields(method = self.method.name()))]
    pub fn list(self) -> Result<Vec<Managed<E>>> {
        self.check_extras()?;
        let hints = self.hints();
        let window = window(self.page.as_ref(), self.sort.as_ref());
        self.uow.list(&self.method.plan, &self.args, window, hints)
    }

    /// At most one entity; two or more rows are an error.
    #[tracing::instrument(level = "debug", skip(self), fields(method = self.method.name()))]
    pub fn one(self) -> Result<Option<Managed<E>>> {
        self.check_extras()?;
        let hints = self.hints();
        self.uow.one(&self.method.plan, &self.args, hints)
    }

    /// The first matching entity.
    pub fn first(self) -> Result<Option<Managed<E>>> {
        self.check_extras()?;
        let hints = self.hints();
        self.uow
            .first(&self.method.plan, &self.args, self.sort.as_ref(), hints)
    }

    /// One page plus the total count.
    #[tracing::instrument(level = "debug", skip(self), fields(method = self.method.name()))]
    pub fn page(self) -> Result<Page<Managed<E>>> {
        self.require_page()?;
        let hints = self.hints();
        let Some(request) = &self.page else {
            return Err(self.fail("missing page request"));
        };
        self.uow.page(&self.method.plan, &self.args, request, hints)
    }

    /// One slice; no count query runs.
    #[tracing::instrument(level = "debug", skip(self), fields(method = self.method.name()))]
    pub fn slice(self) -> Result<Slice<Managed<E>>> {
        self.require_page()?;
        let hints = self.hints();
        let Some(request) = &self.page else {
            return Err(self.fail("missing page request"));
        };
        self.uow.slice(&self.method.plan, &self.args, request, hints)
    }

    pub fn count(self) -> Result<u64> {
        self.check_extras()?;
        self.uow.count(&self.method.plan, &self.args)
    }

    pub fn exists(self) -> Result<bool> {
        self.check_extras()?;
        self.uow.exists(&self.method.plan, &self.args)
    }

    /// First column of every row of a scalar projection.
    pub fn scalars<T: FromValue>(self) -> Result<Vec<T>> {
        if !matches!(self.method.plan.projection(), PlanProjection::Scalars(_)) {
            return Err(self.fail("does not select scalar columns"));
        }
        self.rows()?.iter().map(|row| row.get_at(0)).collect()
    }

    /// Raw rows of a scalar or constructor projection.
    pub fn rows(self) -> Result<Vec<Row>> {
        self.check_extras()?;
        let window = window(self.page.as_ref(), self.sort.as_ref());
        self.uow.rows(&self.method.plan, &self.args, window)
    }

    /// Rows of a constructor projection mapped to `D`.
    pub fn dtos<D: Projection>(self) -> Result<Vec<D>> {
        if !matches!(
            self.method.plan.projection(),
            PlanProjection::Constructor { .. }
        ) {
            return Err(self.fail("does not declare a constructor projection"));
        }
        self.check_extras()?;
        let window = window(self.page.as_ref(), self.sort.as_ref());
        self.uow.project(&self.method.plan, &self.args, window)
    }

    /// Open projection: each matching entity is loaded without a snapshot
    /// and mapped through `From<&E>`.
    pub fn open_projection<D>(self) -> Result<Vec<D>>
    where
        D: for<'e> From<&'e E>,
    {
        self.check_extras()?;
        let window = window(self.page.as_ref(), self.sort.as_ref());
        let entities = self
            .uow
            .list::<E>(&self.method.plan, &self.args, window, QueryHints::read_only())?;
        Ok(entities.iter().map(|e| D::from(&*e.borrow())).collect())
    }

    /// Run a modifying method; returns the affected row count.
    #[tracing::instrument(level = "debug", skip(self), fields(method = self.method.name()))]
    pub fn execute(self) -> Result<u64> {
        let Some(modifying) = self.method.modifying else {
            return Err(self.fail("is not a modifying method"));
        };
        self.uow
            .execute_bulk(&self.method.plan, &self.args, modifying.clear_automatically)
    }
}

/// Window of a call: the page request, or else the sort argument.
fn window<'w>(page: Option<&'w PageRequest>, sort: Option<&'w Sort>) -> Window<'w> {
    match page {
        Some(request) => Window {
            sort: Some(request.sort()),
            limit: Some(request.size()),
            offset: Some(request.offset()),
        },
        None => Window {
            sort,
            ..Window::default()
        },
    }
}
