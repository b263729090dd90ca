//! Schema catalog: entity descriptors assembled once at startup.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crate::entity::{Entity, FieldValues, Managed};
use crate::error::{Error, Result};
use crate::field::FieldInfo;
use crate::relationship::{RelationshipInfo, RelationshipKind};
use crate::value::Value;

/// When a lifecycle callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// When an entity is persisted by `save`.
    PreInsert,
    /// At flush, when a dirty entity is about to be updated.
    PreUpdate,
}

/// Type-erased lifecycle callback.
pub type LifecycleCallback = Arc<dyn Fn(&mut dyn Any) + Send + Sync>;

/// A named entity graph: relationship paths fetched together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedGraph {
    pub name: String,
    pub paths: Vec<String>,
}

/// Immutable description of one entity.
pub struct EntityDescriptor {
    name: &'static str,
    table: &'static str,
    type_id: TypeId,
    fields: &'static [FieldInfo],
    primary_key: usize,
    relationships: &'static [RelationshipInfo],
    named_graphs: Vec<NamedGraph>,
    callbacks: Vec<(LifecyclePhase, LifecycleCallback)>,
    instances: InstanceOps,
}

/// Operations on type-erased instances, monomorphized at registration.
///
/// An erased instance is the `Rc<dyn Any>` behind [`Managed::to_any`], so
/// the concrete type is always `RefCell<E>`.
#[derive(Clone, Copy)]
struct InstanceOps {
    hydrate: fn(&EntityDescriptor, &[Value]) -> Result<Rc<dyn Any>>,
    values: fn(&EntityDescriptor, &dyn Any) -> Result<Vec<Value>>,
    fire: fn(&EntityDescriptor, LifecyclePhase, &dyn Any),
    fill: fn(&dyn Any, &str, Option<Rc<dyn Any>>) -> bool,
}

impl InstanceOps {
    fn of<E: Entity>() -> Self {
        Self {
            hydrate: hydrate::<E>,
            values: instance_values::<E>,
            fire: fire::<E>,
            fill: fill::<E>,
        }
    }
}

fn entity_values<E: Entity>(descriptor: &EntityDescriptor, entity: &E) -> Vec<Value> {
    let mut row = entity.to_values();
    row.extend(descriptor.owning_relationships().map(|rel| {
        entity
            .relation(rel.name)
            .map_or(Value::Null, |slot| slot.key())
    }));
    row
}

fn downcast<'a, E: Entity>(
    descriptor: &EntityDescriptor,
    instance: &'a dyn Any,
) -> Result<&'a RefCell<E>> {
    instance
        .downcast_ref::<RefCell<E>>()
        .ok_or_else(|| Error::Mapping {
            column: descriptor.name.to_string(),
            reason: "instance belongs to another entity type".to_string(),
        })
}

fn hydrate<E: Entity>(descriptor: &EntityDescriptor, row: &[Value]) -> Result<Rc<dyn Any>> {
    let width = descriptor.fields.len();
    if row.len() != descriptor.columns().len() {
        return Err(Error::Mapping {
            column: descriptor.name.to_string(),
            reason: format!(
                "expected {} columns, got {}",
                descriptor.columns().len(),
                row.len()
            ),
        });
    }
    let (fields, keys) = row.split_at(width);
    let mut entity = E::from_values(&FieldValues::new(descriptor.name, descriptor.fields, fields))?;
    for (rel, key) in descriptor.owning_relationships().zip(keys) {
        if let Some(slot) = entity.relation_mut(rel.name) {
            slot.set_key(key.clone());
        }
    }
    Ok(Managed::new(entity).to_any())
}

fn instance_values<E: Entity>(descriptor: &EntityDescriptor, instance: &dyn Any) -> Result<Vec<Value>> {
    let entity = downcast::<E>(descriptor, instance)?
        .try_borrow()
        .map_err(|_| Error::invocation(descriptor.name, "instance is mutably borrowed"))?;
    Ok(entity_values(descriptor, &*entity))
}

fn fire<E: Entity>(descriptor: &EntityDescriptor, phase: LifecyclePhase, instance: &dyn Any) {
    if let Some(cell) = instance.downcast_ref::<RefCell<E>>() {
        let mut entity = cell.borrow_mut();
        descriptor.run_callbacks(phase, &mut *entity);
    }
}

fn fill<E: Entity>(instance: &dyn Any, relationship: &str, target: Option<Rc<dyn Any>>) -> bool {
    instance
        .downcast_ref::<RefCell<E>>()
        .and_then(|cell| {
            let mut entity = cell.borrow_mut();
            entity.relation_mut(relationship).map(|slot| slot.fill(target))
        })
        .unwrap_or(false)
}

impl EntityDescriptor {
    /// Entity name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Table name.
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Rust type of the entity.
    pub fn entity_type(&self) -> TypeId {
        self.type_id
    }

    /// Scalar fields in column order.
    pub fn fields(&self) -> &'static [FieldInfo] {
        self.fields
    }

    /// Index of the primary key within [`EntityDescriptor::fields`].
    pub fn primary_key_index(&self) -> usize {
        self.primary_key
    }

    /// The primary key field.
    pub fn primary_key(&self) -> &'static FieldInfo {
        &self.fields[self.primary_key]
    }

    /// Look up a scalar field.
    pub fn field(&self, name: &str) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All relationships.
    pub fn relationships(&self) -> &'static [RelationshipInfo] {
        self.relationships
    }

    /// Look up a relationship.
    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Relationships that own a foreign-key column, in declaration order.
    pub fn owning_relationships(&self) -> impl Iterator<Item = &'static RelationshipInfo> {
        self.relationships.iter().filter(|r| r.is_owning())
    }

    /// Every stored column: scalar fields, then owned foreign keys.
    pub fn columns(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .map(|f| f.column_name)
            .chain(self.owning_relationships().filter_map(|r| r.foreign_key))
            .collect()
    }

    /// Paths of a named entity graph.
    pub fn named_graph(&self, name: &str) -> Option<&[String]> {
        self.named_graphs
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.paths.as_slice())
    }

    /// Run every callback registered for `phase`, in registration order.
    pub fn run_callbacks(&self, phase: LifecyclePhase, entity: &mut dyn Any) {
        for (registered, callback) in &self.callbacks {
            if *registered == phase {
                callback(entity);
            }
        }
    }

    /// Whether any callback is registered for `phase`.
    pub fn has_callbacks(&self, phase: LifecyclePhase) -> bool {
        self.callbacks.iter().any(|(p, _)| *p == phase)
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Stored row of `entity`, in [`EntityDescriptor::columns`] order.
    pub fn values_of<E: Entity>(&self, entity: &E) -> Vec<Value> {
        entity_values(self, entity)
    }

    /// Build a managed instance from a row in [`EntityDescriptor::columns`]
    /// order. Foreign keys become unresolved [`Lazy`](crate::Lazy)
    /// references.
    pub fn hydrate(&self, row: &[Value]) -> Result<Rc<dyn Any>> {
        (self.instances.hydrate)(self, row)
    }

    /// Stored row of an erased instance.
    pub fn instance_values(&self, instance: &dyn Any) -> Result<Vec<Value>> {
        (self.instances.values)(self, instance)
    }

    /// Run the `phase` callbacks against an erased instance.
    pub fn fire(&self, phase: LifecyclePhase, instance: &dyn Any) {
        (self.instances.fire)(self, phase, instance);
    }

    /// Pre-fill a to-one slot of an erased instance. Returns `false` when
    /// the slot does not exist or `target` has the wrong type.
    pub fn fill_relation(
        &self,
        instance: &dyn Any,
        relationship: &str,
        target: Option<Rc<dyn Any>>,
    ) -> bool {
        (self.instances.fill)(instance, relationship, target)
    }
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.fields)
            .field("relationships", &self.relationships)
            .field("named_graphs", &self.named_graphs)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Collects the per-entity extras declared by [`Entity::describe`].
pub struct DescriptorBuilder<E> {
    named_graphs: Vec<NamedGraph>,
    callbacks: Vec<(LifecyclePhase, LifecycleCallback)>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> DescriptorBuilder<E> {
    fn new() -> Self {
        Self {
            named_graphs: Vec::new(),
            callbacks: Vec::new(),
            _entity: PhantomData,
        }
    }

    /// Declare a named entity graph such as `Member.All`.
    #[must_use]
    pub fn named_graph(mut self, name: &str, paths: &[&str]) -> Self {
        self.named_graphs.push(NamedGraph {
            name: name.to_string(),
            paths: paths.iter().map(|p| (*p).to_string()).collect(),
        });
        self
    }

    /// Register a lifecycle callback.
    #[must_use]
    pub fn on<F>(mut self, phase: LifecyclePhase, callback: F) -> Self
    where
        F: Fn(&mut E) + Send + Sync + 'static,
    {
        let erased: LifecycleCallback = Arc::new(move |any: &mut dyn Any| {
            if let Some(entity) = any.downcast_mut::<E>() {
                callback(entity);
            }
        });
        self.callbacks.push((phase, erased));
        self
    }

    fn build(self) -> EntityDescriptor {
        let fields = E::fields();
        EntityDescriptor {
            name: E::ENTITY_NAME,
            table: E::TABLE_NAME,
            type_id: TypeId::of::<E>(),
            fields,
            primary_key: fields.iter().position(|f| f.primary_key).unwrap_or(0),
            relationships: E::relationships(),
            named_graphs: self.named_graphs,
            callbacks: self.callbacks,
            instances: InstanceOps::of::<E>(),
        }
    }
}

/// Registry of every entity known to the engine.
#[derive(Debug)]
pub struct SchemaCatalog {
    entities: Vec<Arc<EntityDescriptor>>,
    by_name: HashMap<&'static str, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl SchemaCatalog {
    /// Start assembling a catalog.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Descriptor by entity name.
    pub fn descriptor(&self, name: &str) -> Result<&Arc<EntityDescriptor>> {
        self.by_name
            .get(name)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Descriptor by Rust type.
    pub fn descriptor_of<E: Entity>(&self) -> Result<&Arc<EntityDescriptor>> {
        self.by_type
            .get(&TypeId::of::<E>())
            .map(|&i| &self.entities[i])
            .ok_or_else(|| Error::UnknownEntity(E::ENTITY_NAME.to_string()))
    }

    /// Descriptors in dependency order: referenced entities come first.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.iter()
    }

    /// Position of the entity in dependency order.
    pub fn dependency_rank(&self, name: &str) -> usize {
        self.by_name.get(name).copied().unwrap_or(usize::MAX)
    }
}

/// Builder for [`SchemaCatalog`].
#[derive(Default)]
pub struct CatalogBuilder {
    entities: Vec<EntityDescriptor>,
    pk_counts: Vec<usize>,
}

impl CatalogBuilder {
    /// Register an entity type.
    #[must_use]
    pub fn register<E: Entity>(mut self) -> Self {
        self.pk_counts
            .push(E::fields().iter().filter(|f| f.primary_key).count());
        self.entities
            .push(E::describe(DescriptorBuilder::<E>::new()).build());
        self
    }

    /// Validate and assemble the catalog.
    pub fn build(self) -> Result<SchemaCatalog> {
        let mut index: HashMap<&'static str, usize> = HashMap::new();
        for (i, (entity, pk_count)) in self.entities.iter().zip(&self.pk_counts).enumerate() {
            if *pk_count != 1 {
                return Err(Error::Catalog(format!(
                    "`{}` must declare exactly one primary key, found {pk_count}",
                    entity.name
                )));
            }
            if index.insert(entity.name, i).is_some() {
                return Err(Error::Catalog(format!(
                    "entity `{}` registered twice",
                    entity.name
                )));
            }
        }

        for entity in &self.entities {
            validate_relationships(entity, &self.entities, &index)?;
            validate_named_graphs(entity, &self.entities, &index)?;
        }

        let order = dependency_order(&self.entities, &index)?;
        let mut slots: Vec<Option<EntityDescriptor>> =
            self.entities.into_iter().map(Some).collect();
        let mut entities = Vec::with_capacity(order.len());
        for i in order {
            if let Some(descriptor) = slots[i].take() {
                entities.push(Arc::new(descriptor));
            }
        }

        let by_name = entities
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name, i))
            .collect();
        let by_type = entities
            .iter()
            .enumerate()
            .map(|(i, d)| (d.type_id, i))
            .collect();

        tracing::debug!(
            entities = entities.len(),
            order = ?entities.iter().map(|d| d.name).collect::<Vec<_>>(),
            "Schema catalog assembled"
        );

        Ok(SchemaCatalog {
            entities,
            by_name,
            by_type,
        })
    }
}

fn validate_relationships(
    entity: &EntityDescriptor,
    all: &[EntityDescriptor],
    index: &HashMap<&'static str, usize>,
) -> Result<()> {
    for rel in entity.relationships {
        let target = index.get(rel.target).map(|&i| &all[i]).ok_or_else(|| {
            Error::Catalog(format!(
                "`{}.{}` targets unregistered entity `{}`",
                entity.name, rel.name, rel.target
            ))
        })?;
        if entity.field(rel.name).is_some() {
            return Err(Error::Catalog(format!(
                "`{}.{}` is both a field and a relationship",
                entity.name, rel.name
            )));
        }
        match rel.kind {
            RelationshipKind::ManyToOne => {
                let fk = rel.foreign_key.ok_or_else(|| {
                    Error::Catalog(format!(
                        "`{}.{}` owns no foreign key column",
                        entity.name, rel.name
                    ))
                })?;
                if rel.mapped_by.is_some() {
                    return Err(Error::Catalog(format!(
                        "`{}.{}` cannot both own the key and be mapped by another side",
                        entity.name, rel.name
                    )));
                }
                if entity.fields.iter().any(|f| f.column_name == fk) {
                    return Err(Error::Catalog(format!(
                        "foreign key column `{}.{fk}` collides with a field column",
                        entity.table
                    )));
                }
            }
            RelationshipKind::OneToMany => {
                if rel.foreign_key.is_some() {
                    return Err(Error::Catalog(format!(
                        "inverse side `{}.{}` must not declare a foreign key",
                        entity.name, rel.name
                    )));
                }
                let mapped_by = rel.mapped_by.unwrap_or_default();
                let owner = target.relationship(mapped_by).ok_or_else(|| {
                    Error::Catalog(format!(
                        "`{}.{}` is mapped by unknown `{}.{mapped_by}`",
                        entity.name, rel.name, target.name
                    ))
                })?;
                if !owner.is_owning() || owner.target != entity.name {
                    return Err(Error::Catalog(format!(
                        "`{}.{mapped_by}` is not a many-to-one back to `{}`",
                        target.name, entity.name
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_named_graphs(
    entity: &EntityDescriptor,
    all: &[EntityDescriptor],
    index: &HashMap<&'static str, usize>,
) -> Result<()> {
    for graph in &entity.named_graphs {
        for path in &graph.paths {
            let mut current = entity;
            for segment in path.split('.') {
                let rel = current.relationship(segment).ok_or_else(|| {
                    Error::Catalog(format!(
                        "graph `{}` path `{path}`: `{}` has no relationship `{segment}`",
                        graph.name, current.name
                    ))
                })?;
                if !rel.is_owning() {
                    return Err(Error::Catalog(format!(
                        "graph `{}` path `{path}`: to-many `{segment}` cannot be fetch-joined",
                        graph.name
                    )));
                }
                current = index
                    .get(rel.target)
                    .map(|&i| &all[i])
                    .ok_or_else(|| Error::UnknownEntity(rel.target.to_string()))?;
            }
        }
    }
    Ok(())
}

/// Topological order over many-to-one edges; self references are ignored.
fn dependency_order(
    all: &[EntityDescriptor],
    index: &HashMap<&'static str, usize>,
) -> Result<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    fn visit(
        i: usize,
        all: &[EntityDescriptor],
        index: &HashMap<&'static str, usize>,
        marks: &mut [Mark],
        order: &mut Vec<usize>,
    ) -> Result<()> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                return Err(Error::Catalog(format!(
                    "foreign key cycle through `{}`",
                    all[i].name
                )));
            }
            Mark::Unvisited => {}
        }
        marks[i] = Mark::Visiting;
        for rel in all[i].owning_relationships() {
            let target = index[rel.target];
            if target != i {
                visit(target, all, index, marks, order)?;
            }
        }
        marks[i] = Mark::Done;
        order.push(i);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; all.len()];
    let mut order = Vec::with_capacity(all.len());
    for i in 0..all.len() {
        visit(i, all, index, &mut marks, &mut order)?;
    }
    Ok(order)
}
