pub mod context;
pub mod criteria;
pub mod listener;
pub mod registry;
pub mod simple;

pub use context::{DeferredLink, DeferredRelation, OperationContext, OperationKind, ProvidedKey};
pub use criteria::EntityCriteria;
pub use listener::{ListenerCheckpoint, ListenerPipeline, Priority, Stage};
pub use registry::PersisterRegistry;
pub use simple::{DerivedColumn, DerivedSource, Segment, SimpleEntityPersister, SimpleInflater};

use crate::config::{ConnectionConfiguration, IdentifierPolicy, PolymorphismKind};
use crate::core::{ClassName, DataType, MappingError, Result, Value};
use crate::model::{EntityRef, PropertyAccessor};
use crate::select::{JoinTree, NodeId, RelationFixer};
use crate::sql::{ColumnRef, JoinKind, ValueBinder};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{Level, event, info_span};

/// A modified entity and the stored state it replaces.
#[derive(Debug, Clone)]
pub struct Duo {
    pub modified: EntityRef,
    pub unmodified: EntityRef,
}

impl Duo {
    pub fn new(modified: EntityRef, unmodified: EntityRef) -> Self {
        Self {
            modified,
            unmodified,
        }
    }
}

/// How a persister reads and converts the identifier of its entities.
#[derive(Debug, Clone)]
pub struct IdAccess {
    pub accessor: PropertyAccessor,
    pub data_type: DataType,
    pub policy: IdentifierPolicy,
    pub binder: ValueBinder,
}

impl IdAccess {
    pub fn read(&self, entity: &EntityRef) -> Value {
        self.accessor.read(entity)
    }

    /// Assigned identifiers say nothing about the row: the persisted marker decides.
    pub fn is_new(&self, entity: &EntityRef) -> bool {
        match self.policy {
            IdentifierPolicy::Assigned => !entity.is_persisted(),
            _ => self.read(entity).is_null(),
        }
    }

    pub fn to_storage(&self, id: &Value) -> Result<Value> {
        self.binder.to_storage(id)
    }
}

/// Where the rows of a persister hang in the select tree of another one.
pub struct JoinLink {
    pub parent: NodeId,
    pub kind: JoinKind,
    /// (column of an earlier node, column of the main table of the joined persister)
    pub on: Vec<(ColumnRef, String)>,
    pub fixer: Option<Rc<dyn RelationFixer>>,
    pub guard: Option<Vec<ClassName>>,
}

/// Aliases of an entity inside a select tree.
#[derive(Debug, Clone)]
pub struct GraftedEntity {
    pub node: NodeId,
    pub main_alias: String,
    /// Alias of the table holding the foreign keys of the relations of the entity.
    pub relation_alias: String,
}

/// Part of a select tree contributed by a relation of the grafted entity.
pub trait JoinContribution {
    fn contribute(&self, tree: &mut JoinTree, source: &GraftedEntity, guard: Option<Vec<ClassName>>) -> Result<()>;
}

/// Wiring of a persister when a build starts.
///
/// Builds add listeners, joins and derived columns to persisters committed by earlier builds;
/// a failed build puts them back as they were.
pub struct WiringCheckpoint {
    pub(crate) listeners: ListenerCheckpoint,
    pub(crate) joins: usize,
    /// Derived columns of each segment, in segment order.
    pub(crate) derived: Vec<Vec<DerivedColumn>>,
}

/// Reference to a persister held by a relation; relations closing a cycle hold it weakly.
#[derive(Clone)]
pub enum PersisterHandle {
    Strong(Rc<dyn EntityPersister>),
    Weak(Weak<dyn EntityPersister>),
}

impl PersisterHandle {
    pub fn get(&self) -> Result<Rc<dyn EntityPersister>> {
        match self {
            Self::Strong(persister) => Ok(Rc::clone(persister)),
            Self::Weak(persister) => persister
                .upgrade()
                .ok_or_else(|| MappingError::ExecutionError("persister of a cycling relation was dropped".into())),
        }
    }
}

/// CRUD on one entity type, relations included through listeners.
///
/// The `*_with` operations take part in an ongoing call and share its context; the others
/// start a new call.
pub trait EntityPersister {
    fn class_name(&self) -> &ClassName;

    /// Identity map key of loaded entities.
    fn cache_key(&self) -> &ClassName;

    fn id_access(&self) -> &IdAccess;

    /// Table holding the primary key every other table of the entity joins on.
    fn main_table(&self) -> &str;

    fn main_primary_key(&self) -> &str;

    /// Table receiving the source-side foreign keys of relations declared on this entity.
    fn relation_table(&self) -> &str;

    fn polymorphism(&self) -> Option<PolymorphismKind> {
        None
    }

    fn listeners(&self) -> &ListenerPipeline;

    fn connection(&self) -> &ConnectionConfiguration;

    /// Every table written by the persister.
    fn tables(&self) -> Vec<String>;

    fn add_derived_column(&self, table: &str, column: DerivedColumn) -> Result<()>;

    fn add_join(&self, join: Rc<dyn JoinContribution>);

    fn checkpoint(&self) -> WiringCheckpoint;

    /// Drops the wiring added since `checkpoint` was taken.
    fn rollback(&self, checkpoint: WiringCheckpoint);

    /// Adds the nodes reading this entity to `tree`, below `link.parent` when given.
    fn graft(&self, tree: &mut JoinTree, link: Option<JoinLink>) -> Result<GraftedEntity>;

    fn insert_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()>;

    fn update_with(&self, pairs: &[Duo], all_columns: bool, ctx: &mut OperationContext) -> Result<()>;

    fn update_by_id_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()>;

    fn delete_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()>;

    fn delete_by_id_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()>;

    fn select_with(&self, ids: &[Value], ctx: &mut OperationContext) -> Result<Vec<EntityRef>>;

    fn select_ids_where(&self, criteria: &EntityCriteria) -> Result<Vec<Value>>;

    fn id_of(&self, entity: &EntityRef) -> Value {
        self.id_access().read(entity)
    }

    fn is_new(&self, entity: &EntityRef) -> bool {
        self.id_access().is_new(entity)
    }

    /// Runs the checks of the before-update stage on `pairs`, writing nothing.
    fn check_update(&self, pairs: &[Duo], ctx: &mut OperationContext) -> Result<()> {
        self.listeners()
            .fire_update_checks(Stage::BeforeUpdate, pairs, false, ctx)
    }

    /// Inserts new entities and updates the others.
    fn persist(&self, entities: &[EntityRef]) -> Result<()> {
        let span = info_span!("persister.persist", class = %self.class_name(), count = entities.len());
        let _enter = span.enter();

        let (new, existing): (Vec<EntityRef>, Vec<EntityRef>) =
            entities.iter().cloned().partition(|e| self.is_new(e));
        if !new.is_empty() {
            self.insert(&new)?;
        }
        if !existing.is_empty() {
            self.update(&existing)?;
        }
        Ok(())
    }

    fn insert(&self, entities: &[EntityRef]) -> Result<()> {
        let span = info_span!("persister.insert", class = %self.class_name(), count = entities.len());
        let _enter = span.enter();
        let mut ctx = OperationContext::new();
        self.insert_with(entities, &mut ctx).inspect_err(|err| {
            event!(Level::ERROR, error = %err, "insert failed");
        })
    }

    /// Compares each entity with its stored state and writes the differences.
    fn update(&self, entities: &[EntityRef]) -> Result<()> {
        let span = info_span!("persister.update", class = %self.class_name(), count = entities.len());
        let _enter = span.enter();

        // checks run before the stored state is read
        let unchecked: Vec<Duo> = entities.iter().map(|e| Duo::new(e.clone(), e.clone())).collect();
        self.check_update(&unchecked, &mut OperationContext::new())?;

        let ids: Vec<Value> = entities.iter().map(|e| self.id_of(e)).collect();
        let stored = self.select(&ids)?;
        let by_id: HashMap<Value, EntityRef> = stored.into_iter().map(|e| (self.id_of(&e), e)).collect();
        let mut pairs = Vec::with_capacity(entities.len());
        for (entity, id) in entities.iter().zip(ids) {
            let unmodified = by_id.get(&id).cloned().ok_or_else(|| {
                MappingError::StaleEntity(format!("{} {} has no stored row", self.class_name(), id))
            })?;
            pairs.push(Duo::new(entity.clone(), unmodified));
        }
        let mut ctx = OperationContext::new();
        self.update_with(&pairs, false, &mut ctx)
    }

    fn update_pairs(&self, pairs: &[Duo], all_columns: bool) -> Result<()> {
        let span = info_span!("persister.update", class = %self.class_name(), count = pairs.len());
        let _enter = span.enter();
        let mut ctx = OperationContext::new();
        self.update_with(pairs, all_columns, &mut ctx)
    }

    /// Writes every column without comparing with the stored state.
    fn update_by_id(&self, entities: &[EntityRef]) -> Result<()> {
        let span = info_span!("persister.update_by_id", class = %self.class_name(), count = entities.len());
        let _enter = span.enter();
        let mut ctx = OperationContext::new();
        self.update_by_id_with(entities, &mut ctx)
    }

    fn delete(&self, entities: &[EntityRef]) -> Result<()> {
        let span = info_span!("persister.delete", class = %self.class_name(), count = entities.len());
        let _enter = span.enter();
        let mut ctx = OperationContext::new();
        self.delete_with(entities, &mut ctx)
    }

    fn delete_by_id(&self, entities: &[EntityRef]) -> Result<()> {
        let span = info_span!("persister.delete_by_id", class = %self.class_name(), count = entities.len());
        let _enter = span.enter();
        let mut ctx = OperationContext::new();
        self.delete_by_id_with(entities, &mut ctx)
    }

    /// Loads the entities of `ids` with their relations; unknown identifiers are skipped.
    fn select(&self, ids: &[Value]) -> Result<Vec<EntityRef>> {
        let span = info_span!("persister.select", class = %self.class_name(), count = ids.len());
        let _enter = span.enter();
        let mut ctx = OperationContext::new();
        let entities = self.select_with(ids, &mut ctx)?;
        ctx.resolve_deferred()?;
        event!(Level::DEBUG, loaded = entities.len(), "select done");
        Ok(entities)
    }

    fn select_one(&self, id: Value) -> Result<Option<EntityRef>> {
        Ok(self.select(&[id])?.into_iter().next())
    }

    fn select_where(&self, criteria: &EntityCriteria) -> Result<Vec<EntityRef>> {
        let ids = self.select_ids_where(criteria)?;
        self.select(&ids)
    }

    fn select_all(&self) -> Result<Vec<EntityRef>> {
        self.select_where(&EntityCriteria::All)
    }
}

impl fmt::Debug for dyn EntityPersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityPersister").field(self.class_name()).finish()
    }
}
