//! Repository method declarations and their compiled form.

use std::sync::Arc;

use datarepo_core::{EntityDescriptor, Error, Result, RowLock, SchemaCatalog};
use datarepo_query::{
    Derivator, ParamDecl, ParamKind, ParsedQuery, QueryParser, QueryPlan, QueryPlanBuilder,
};

/// Index of a compiled method in its repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub(crate) usize);

#[derive(Debug, Clone, PartialEq, Eq)]
enum MethodSource {
    /// Derived from the method name.
    Derived,
    /// A hand-written query string.
    Query(String),
}

/// Bulk-statement settings of a modifying method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modifying {
    /// Clear the identity map after the statement runs.
    pub clear_automatically: bool,
}

/// A repository method as declared by the application.
///
/// ```ignore
/// MethodDecl::derived("findByUsernameAndAgeGreaterThan")
///     .param(ParamDecl::scalar("username"))
///     .param(ParamDecl::scalar("age"));
///
/// MethodDecl::query("bulkAgePlus", "update Member m set m.age = m.age + 1 where m.age >= :age")
///     .param(ParamDecl::scalar("age"))
///     .modifying(true);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDecl {
    name: String,
    source: MethodSource,
    params: Vec<ParamDecl>,
    fetch: Vec<String>,
    entity_graph: Option<String>,
    lock: Option<RowLock>,
    read_only: bool,
    count_query: Option<String>,
    modifying: Option<Modifying>,
    dto: Option<(String, Vec<String>)>,
}

impl MethodDecl {
    fn new(name: &str, source: MethodSource) -> Self {
        Self {
            name: name.to_string(),
            source,
            params: Vec::new(),
            fetch: Vec::new(),
            entity_graph: None,
            lock: None,
            read_only: false,
            count_query: None,
            modifying: None,
            dto: None,
        }
    }

    /// A method whose query is derived from its name.
    pub fn derived(name: &str) -> Self {
        Self::new(name, MethodSource::Derived)
    }

    /// A method backed by a query string.
    pub fn query(name: &str, query: &str) -> Self {
        Self::new(name, MethodSource::Query(query.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a parameter to the signature.
    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    /// Fetch these relationship paths with the results.
    pub fn fetch(mut self, paths: &[&str]) -> Self {
        self.fetch.extend(paths.iter().map(|p| (*p).to_string()));
        self
    }

    /// Fetch the paths of a named entity graph.
    pub fn entity_graph(mut self, name: &str) -> Self {
        self.entity_graph = Some(name.to_string());
        self
    }

    pub fn lock(mut self, lock: RowLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Results are identity-mapped but never dirty-checked.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Count query used for paging instead of the synthesized one.
    pub fn count_query(mut self, query: &str) -> Self {
        self.count_query = Some(query.to_string());
        self
    }

    /// Mark the method as a bulk UPDATE or DELETE.
    pub fn modifying(mut self, clear_automatically: bool) -> Self {
        self.modifying = Some(Modifying {
            clear_automatically,
        });
        self
    }

    /// Project derived results into the DTO `name` built from `paths`.
    pub fn dto(mut self, name: &str, paths: &[&str]) -> Self {
        self.dto = Some((
            name.to_string(),
            paths.iter().map(|p| (*p).to_string()).collect(),
        ));
        self
    }
}

/// A declared method compiled into a reusable plan.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub(crate) name: String,
    pub(crate) plan: QueryPlan,
    pub(crate) params: Vec<ParamDecl>,
    pub(crate) read_only: bool,
    pub(crate) modifying: Option<Modifying>,
}

impl CompiledMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn params(&self) -> &[ParamDecl] {
        &self.params
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn modifying(&self) -> Option<Modifying> {
        self.modifying
    }

    pub(crate) fn accepts(&self, kind: ParamKind) -> bool {
        self.params.iter().any(|p| p.kind == kind)
    }

    /// Compile `decl` against the repository root.
    pub(crate) fn compile(
        catalog: &Arc<SchemaCatalog>,
        root: &Arc<EntityDescriptor>,
        decl: MethodDecl,
    ) -> Result<Self> {
        let mut builder = QueryPlanBuilder::new(catalog.clone(), root.clone(), &decl.name)
            .params(&decl.params)
            .fetch_paths(&decl.fetch);
        if let Some(graph) = &decl.entity_graph {
            builder = builder.named_graph(graph)?;
        }
        if let Some(lock) = decl.lock {
            builder = builder.lock(lock);
        }
        if let Some((name, paths)) = &decl.dto {
            builder = builder.dto(name, paths);
        }
        if let Some(count) = &decl.count_query {
            match QueryParser::new(catalog, &decl.params).parse(count)? {
                ParsedQuery::Select(select) => builder = builder.count_query(select),
                ParsedQuery::Update(_) | ParsedQuery::Delete(_) => {
                    return Err(Error::derivation(&decl.name, "count query must be a select"));
                }
            }
        }

        let plan = match &decl.source {
            MethodSource::Derived => {
                if decl.modifying.is_some() {
                    return Err(Error::derivation(
                        &decl.name,
                        "derived methods cannot be modifying",
                    ));
                }
                let derived = Derivator::new(catalog, root).derive(&decl.name, &decl.params)?;
                builder.build_derived(&derived)?
            }
            MethodSource::Query(query) => {
                let parsed = QueryParser::new(catalog, &decl.params).parse(query)?;
                let bulk = matches!(parsed, ParsedQuery::Update(_) | ParsedQuery::Delete(_));
                match (bulk, decl.modifying.is_some()) {
                    (true, false) => {
                        return Err(Error::derivation(
                            &decl.name,
                            "update and delete queries must be declared modifying",
                        ));
                    }
                    (false, true) => {
                        return Err(Error::derivation(
                            &decl.name,
                            "a modifying method needs an update or delete query",
                        ));
                    }
                    _ => {}
                }
                builder.build_parsed(parsed)?
            }
        };

        tracing::debug!(method = %decl.name, projection = ?plan.projection(), "Compiled repository method");
        Ok(Self {
            name: decl.name,
            plan,
            params: decl.params,
            read_only: decl.read_only,
            modifying: decl.modifying,
        })
    }
}

#[cfg(test)]
mod tests {
    use datarepo_query::{Cardinality, PlanProjection};

    use super::*;
    use crate::example;

    fn compile(decl: MethodDecl) -> Result<CompiledMethod> {
        let catalog = Arc::new(example::catalog().unwrap());
        let member = catalog.descriptor("Member").unwrap().clone();
        CompiledMethod::compile(&catalog, &member, decl)
    }

    #[test]
    fn test_derived_method_compiles() {
        let method = compile(
            MethodDecl::derived("findByUsernameAndAgeGreaterThan")
                .param(ParamDecl::scalar("username"))
                .param(ParamDecl::scalar("age")),
        )
        .unwrap();
        assert_eq!(method.name(), "findByUsernameAndAgeGreaterThan");
        assert_eq!(method.plan().params().len(), 2);
        assert_eq!(method.plan().cardinality(), Cardinality::Collection);
    }

    #[test]
    fn test_bulk_query_requires_modifying() {
        let decl = MethodDecl::query(
            "bulkAgePlus",
            "update Member m set m.age = m.age + 1 where m.age >= :age",
        )
        .param(ParamDecl::scalar("age"));
        let err = compile(decl.clone()).unwrap_err();
        assert!(err.is_registration_error());

        let method = compile(decl.modifying(true)).unwrap();
        assert!(method.plan().is_bulk());
        assert_eq!(
            method.modifying(),
            Some(Modifying {
                clear_automatically: true
            })
        );
    }

    #[test]
    fn test_modifying_select_is_rejected() {
        let err = compile(MethodDecl::query("findAllMembers", "select m from Member m").modifying(false))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDerivation { .. }));
    }

    #[test]
    fn test_unknown_property_fails_at_compile() {
        let err = compile(MethodDecl::derived("findByNickname").param(ParamDecl::scalar("n")))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDerivation { .. }));
    }

    #[test]
    fn test_unknown_entity_graph_fails_at_compile() {
        let err = compile(
            MethodDecl::derived("findEntityGraphByUsername")
                .param(ParamDecl::scalar("username"))
                .entity_graph("Member.Nothing"),
        )
        .unwrap_err();
        assert!(err.is_registration_error());
    }

    #[test]
    fn test_count_query_must_select() {
        let err = compile(
            MethodDecl::derived("findSliceByAge")
                .param(ParamDecl::scalar("age"))
                .param(ParamDecl::pageable())
                .count_query("delete from Member m"),
        )
        .unwrap_err();
        assert!(err.is_registration_error());
    }

    #[test]
    fn test_dto_projection_on_derived_method() {
        let method = compile(
            MethodDecl::derived("findProjectionsByUsername")
                .param(ParamDecl::scalar("username"))
                .dto("UsernameOnlyDto", &["username"]),
        )
        .unwrap();
        assert_eq!(
            *method.plan().projection(),
            PlanProjection::Constructor {
                name: "UsernameOnlyDto".to_string(),
                args: vec!["username".to_string()],
            }
        );
    }
}
