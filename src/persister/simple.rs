use super::context::{OperationContext, OperationKind};
use super::criteria::EntityCriteria;
use super::listener::{ListenerPipeline, Stage};
use super::{Duo, EntityPersister, GraftedEntity, IdAccess, JoinContribution, JoinLink, WiringCheckpoint};
use crate::config::{ConnectionConfiguration, IdentifierPolicy};
use crate::core::{ClassName, MappingError, RelationId, Result, Value};
use crate::mapping::{ColumnBinding, Mapping};
use crate::model::{EntityRef, Instance, PropertyAccessor};
use crate::select::{JoinTree, NodeId, NodeRole, RowInflater, RowView};
use crate::sql::{
    ColumnRef, Criteria, DeleteStatement, InsertStatement, JoinKind, UpdateStatement, ValueBinder,
    WriteStatement,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tracing::{Level, event};

pub type EntityValue = Rc<dyn Fn(&EntityRef) -> Result<Value>>;

#[derive(Clone)]
pub enum DerivedSource {
    Constant(Value),
    /// Computed from the entity; updates write it when it differs from the stored state.
    Computed(EntityValue),
    /// Supplied by the cascade writing the entity, or read through `fallback` outside of one.
    Provided {
        relations: Vec<RelationId>,
        fallback: Option<EntityValue>,
    },
}

/// A column written by the persister that no property of the entity maps.
#[derive(Clone)]
pub struct DerivedColumn {
    pub binding: ColumnBinding,
    pub source: DerivedSource,
}

impl DerivedColumn {
    pub fn constant(binding: ColumnBinding, value: Value) -> Self {
        Self {
            binding,
            source: DerivedSource::Constant(value),
        }
    }

    pub fn computed(binding: ColumnBinding, compute: impl Fn(&EntityRef) -> Result<Value> + 'static) -> Self {
        Self {
            binding,
            source: DerivedSource::Computed(Rc::new(compute)),
        }
    }

    pub fn provided(binding: ColumnBinding, relation: RelationId, fallback: Option<EntityValue>) -> Self {
        Self {
            binding,
            source: DerivedSource::Provided {
                relations: vec![relation],
                fallback,
            },
        }
    }

    fn lookup(&self, relations: &[RelationId], entity: &EntityRef, ctx: &OperationContext) -> Option<Value> {
        relations
            .iter()
            .find_map(|relation| ctx.provided(*relation, entity, &self.binding.column))
    }

    fn insert_value(&self, entity: &EntityRef, ctx: &OperationContext) -> Result<Value> {
        match &self.source {
            DerivedSource::Constant(value) => Ok(value.clone()),
            DerivedSource::Computed(compute) => compute(entity),
            DerivedSource::Provided { relations, fallback } => match self.lookup(relations, entity, ctx) {
                Some(value) => Ok(value),
                None => match fallback {
                    Some(fallback) => fallback(entity),
                    None => Ok(Value::Null),
                },
            },
        }
    }

    /// `None` leaves the column untouched.
    fn update_value(
        &self,
        modified: &EntityRef,
        unmodified: Option<&EntityRef>,
        all_columns: bool,
        ctx: &OperationContext,
    ) -> Result<Option<Value>> {
        let changed = |compute: &EntityValue| -> Result<Option<Value>> {
            let value = compute(modified)?;
            match unmodified {
                Some(stored) if !all_columns && compute(stored)? == value => Ok(None),
                _ => Ok(Some(value)),
            }
        };
        match &self.source {
            DerivedSource::Constant(value) => Ok(all_columns.then(|| value.clone())),
            DerivedSource::Computed(compute) => changed(compute),
            DerivedSource::Provided { relations, fallback } => match self.lookup(relations, modified, ctx) {
                Some(value) => Ok(Some(value)),
                None => match fallback {
                    Some(fallback) => changed(fallback),
                    None => Ok(None),
                },
            },
        }
    }
}

impl fmt::Debug for DerivedColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            DerivedSource::Constant(value) => format!("constant {}", value),
            DerivedSource::Computed(_) => "computed".to_string(),
            DerivedSource::Provided { relations, .. } => format!("provided by {:?}", relations),
        };
        write!(f, "{}.{} ({})", self.binding.table, self.binding.column, source)
    }
}

/// One table of an entity: its key, the properties it maps and its derived columns.
#[derive(Debug)]
pub struct Segment {
    pub table: String,
    pub primary_key: ColumnBinding,
    pub mapping: Mapping,
    pub derived: RefCell<Vec<DerivedColumn>>,
}

impl Segment {
    pub fn new(table: &str, primary_key: ColumnBinding, mapping: Mapping) -> Self {
        Self {
            table: table.to_string(),
            primary_key,
            mapping,
            derived: RefCell::new(Vec::new()),
        }
    }

    fn add_derived(&self, column: DerivedColumn) -> Result<()> {
        let name = column.binding.column.clone();
        let clash = || MappingError::DuplicateColumn {
            table: self.table.clone(),
            column: name.clone(),
        };
        if name == self.primary_key.column || self.mapping.accessor_for(&name).is_some() {
            return Err(clash());
        }
        let mut derived = self.derived.borrow_mut();
        let Some(existing) = derived.iter_mut().find(|d| d.binding.column == name) else {
            derived.push(column);
            return Ok(());
        };
        // one foreign key column shared by several relations: replicated on subtypes, or
        // maintained from both sides of a bidirectional relation
        let merged = match (existing.source.clone(), column.source) {
            (
                DerivedSource::Provided { mut relations, fallback },
                DerivedSource::Provided {
                    relations: added,
                    fallback: other,
                },
            ) => {
                relations.extend(added);
                DerivedSource::Provided {
                    relations,
                    fallback: fallback.or(other),
                }
            }
            (DerivedSource::Provided { relations, fallback: None }, DerivedSource::Computed(compute))
            | (DerivedSource::Computed(compute), DerivedSource::Provided { relations, fallback: None }) => {
                DerivedSource::Provided {
                    relations,
                    fallback: Some(compute),
                }
            }
            _ => return Err(clash()),
        };
        existing.source = merged;
        Ok(())
    }
}

/// Reads one entity from the aliases its tables received in a select tree.
pub struct SimpleInflater {
    class: ClassName,
    cache_key: ClassName,
    id: IdAccess,
    id_column: ColumnRef,
    columns: Vec<(PropertyAccessor, ColumnRef, ValueBinder)>,
}

impl SimpleInflater {
    pub fn class(&self) -> &ClassName {
        &self.class
    }
}

impl RowInflater for SimpleInflater {
    fn cache_key(&self) -> &ClassName {
        &self.cache_key
    }

    fn identifier(&self, row: &RowView<'_>) -> Result<Option<Value>> {
        let stored = row.get(&self.id_column.alias, &self.id_column.column)?;
        if stored.is_null() {
            return Ok(None);
        }
        self.id.binder.from_storage(&stored).map(Some)
    }

    fn inflate(&self, row: &RowView<'_>, id: &Value) -> Result<EntityRef> {
        let mut instance = Instance::new(self.class.clone());
        self.id.accessor.set(&mut instance, id.clone());
        for (accessor, column, binder) in &self.columns {
            let value = binder.from_storage(&row.get(&column.alias, &column.column)?)?;
            accessor.set(&mut instance, value);
        }
        Ok(instance.into_ref())
    }
}

/// Persister of a non polymorphic entity, or of one concrete class of a polymorphic one.
///
/// Segments are ordered from the root table of the hierarchy down to the entity's own table.
pub struct SimpleEntityPersister {
    class: ClassName,
    cache_key: ClassName,
    id: IdAccess,
    segments: Vec<Segment>,
    listeners: ListenerPipeline,
    joins: RefCell<Vec<Rc<dyn JoinContribution>>>,
    tree: RefCell<Option<Rc<JoinTree>>>,
    connection: ConnectionConfiguration,
}

impl SimpleEntityPersister {
    pub fn new(
        class: ClassName,
        cache_key: ClassName,
        id: IdAccess,
        segments: Vec<Segment>,
        connection: ConnectionConfiguration,
    ) -> Result<Self> {
        if segments.is_empty() {
            return Err(MappingError::InvalidConfiguration(format!("{} maps no table", class)));
        }
        Ok(Self {
            class,
            cache_key,
            id,
            segments,
            listeners: ListenerPipeline::new(),
            joins: RefCell::new(Vec::new()),
            tree: RefCell::new(None),
            connection,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn joins(&self) -> Vec<Rc<dyn JoinContribution>> {
        self.joins.borrow().clone()
    }

    fn segment(&self, table: &str) -> Result<&Segment> {
        self.segments
            .iter()
            .find(|s| s.table == table)
            .ok_or_else(|| MappingError::TableNotFound(format!("{} (entity {})", table, self.class)))
    }

    /// Inflater of this class reading tables through `aliases` (table name to alias).
    pub fn inflater(&self, aliases: &HashMap<String, String>) -> Result<SimpleInflater> {
        let alias_of = |table: &str| -> Result<String> {
            aliases
                .get(table)
                .cloned()
                .ok_or_else(|| MappingError::TableNotFound(format!("{} is not joined", table)))
        };
        let main = &self.segments[0];
        let mut columns = Vec::new();
        for segment in &self.segments {
            let alias = alias_of(&segment.table)?;
            for entry in segment.mapping.iter() {
                columns.push((
                    entry.accessor.clone(),
                    ColumnRef::new(&alias, &entry.binding.column),
                    entry.binding.binder.clone(),
                ));
            }
        }
        Ok(SimpleInflater {
            class: self.class.clone(),
            cache_key: self.cache_key.clone(),
            id: self.id.clone(),
            id_column: ColumnRef::new(&alias_of(&main.table)?, &main.primary_key.column),
            columns,
        })
    }

    /// Selects the key and mapped columns of every segment.
    pub fn select_columns(&self, tree: &mut JoinTree, aliases: &HashMap<String, String>) {
        for segment in &self.segments {
            let Some(alias) = aliases.get(&segment.table) else {
                continue;
            };
            tree.select_column(alias, &segment.primary_key.column);
            for entry in segment.mapping.iter() {
                tree.select_column(alias, &entry.binding.column);
            }
        }
    }

    /// Joins the segments below the main table node, returning table aliases.
    pub fn join_segments(&self, tree: &mut JoinTree, node: NodeId, kind: JoinKind) -> HashMap<String, String> {
        let main = &self.segments[0];
        let main_alias = tree.alias(node).to_string();
        let mut aliases = HashMap::new();
        aliases.insert(main.table.clone(), main_alias.clone());
        for segment in &self.segments[1..] {
            let child = tree.add_join(
                node,
                &segment.table,
                kind,
                vec![(
                    ColumnRef::new(&main_alias, &main.primary_key.column),
                    segment.primary_key.column.clone(),
                )],
                NodeRole::Segment,
                None,
            );
            aliases.insert(segment.table.clone(), tree.alias(child).to_string());
        }
        aliases
    }

    /// Adds the joins of the relations of this class below `grafted`.
    pub fn contribute_joins(&self, tree: &mut JoinTree, grafted: &GraftedEntity, guard: Option<Vec<ClassName>>) -> Result<()> {
        for join in self.joins() {
            join.contribute(tree, grafted, guard.clone())?;
        }
        Ok(())
    }

    fn tree(&self) -> Result<Rc<JoinTree>> {
        if let Some(tree) = self.tree.borrow().as_ref() {
            return Ok(Rc::clone(tree));
        }
        let mut tree = JoinTree::new();
        self.graft(&mut tree, None)?;
        let tree = Rc::new(tree);
        *self.tree.borrow_mut() = Some(Rc::clone(&tree));
        Ok(tree)
    }

    /// Column and binder of a property path, the identifier included.
    pub fn resolve_path(&self, path: &str, aliases: &HashMap<String, String>) -> Result<(ColumnRef, ValueBinder)> {
        let alias_of = |table: &str| aliases.get(table).cloned().unwrap_or_default();
        if path == self.id.accessor.definition() {
            let main = &self.segments[0];
            return Ok((
                ColumnRef::new(&alias_of(&main.table), &main.primary_key.column),
                self.id.binder.clone(),
            ));
        }
        for segment in &self.segments {
            if let Some(binding) = segment.mapping.column_for_path(path) {
                return Ok((
                    ColumnRef::new(&alias_of(&segment.table), &binding.column),
                    binding.binder.clone(),
                ));
            }
        }
        Err(MappingError::UnmappedProperty(format!("{}.{}", self.class, path)))
    }

    fn check_class(&self, entities: &[EntityRef]) -> Result<()> {
        for entity in entities {
            let class = entity.class();
            if class != self.class {
                return Err(MappingError::TypeMismatch(format!(
                    "{} persister cannot write an instance of {}",
                    self.class, class
                )));
            }
        }
        Ok(())
    }

    fn storage_ids(&self, entities: &[EntityRef]) -> Result<Vec<Value>> {
        entities
            .iter()
            .map(|e| self.id.to_storage(&self.id.read(e)))
            .collect()
    }

    fn insert_rows(&self, entities: &[EntityRef], ctx: &OperationContext) -> Result<()> {
        if let IdentifierPolicy::BeforeInsert(generator) = &self.id.policy {
            for entity in entities {
                if self.id.read(entity).is_null() {
                    self.id.accessor.write(entity, generator.generate());
                }
            }
        }

        let batch_size = self.connection.settings.batch_size;
        for (position, segment) in self.segments.iter().enumerate() {
            let generated = position == 0 && self.id.policy.is_database_generated();
            let derived = segment.derived.borrow();

            let mut columns = Vec::new();
            if !generated {
                columns.push(segment.primary_key.column.clone());
            }
            columns.extend(segment.mapping.writable().map(|m| m.binding.column.clone()));
            columns.extend(derived.iter().map(|d| d.binding.column.clone()));

            for chunk in entities.chunks(batch_size) {
                let mut rows = Vec::with_capacity(chunk.len());
                for entity in chunk {
                    let mut row = Vec::with_capacity(columns.len());
                    if !generated {
                        row.push(self.id.to_storage(&self.id.read(entity))?);
                    }
                    for entry in segment.mapping.writable() {
                        row.push(entry.binding.binder.to_storage(&entry.accessor.read(entity))?);
                    }
                    for column in derived.iter() {
                        row.push(column.binding.binder.to_storage(&column.insert_value(entity, ctx)?)?);
                    }
                    rows.push(row);
                }
                let outcome = self.connection.execute(&WriteStatement::Insert(InsertStatement {
                    table: segment.table.clone(),
                    columns: columns.clone(),
                    rows,
                }))?;
                if generated {
                    if outcome.generated_keys.len() != chunk.len() {
                        return Err(MappingError::ExecutionError(format!(
                            "{} generated keys returned for {} rows of {}",
                            outcome.generated_keys.len(),
                            chunk.len(),
                            segment.table
                        )));
                    }
                    for (entity, key) in chunk.iter().zip(&outcome.generated_keys) {
                        self.id.accessor.write(entity, self.id.binder.from_storage(key)?);
                    }
                }
            }
        }
        Ok(())
    }

    fn update_rows(
        &self,
        modified: &EntityRef,
        unmodified: Option<&EntityRef>,
        all_columns: bool,
        ctx: &OperationContext,
    ) -> Result<()> {
        let id = self.id.to_storage(&self.id.read(modified))?;
        for segment in &self.segments {
            let mut assignments = Vec::new();
            for entry in segment.mapping.writable() {
                let value = entry.accessor.read(modified);
                let changed = match unmodified {
                    Some(stored) => entry.accessor.read(stored) != value,
                    None => true,
                };
                if all_columns || changed {
                    assignments.push((entry.binding.column.clone(), entry.binding.binder.to_storage(&value)?));
                }
            }
            for column in segment.derived.borrow().iter() {
                if let Some(value) = column.update_value(modified, unmodified, all_columns, ctx)? {
                    assignments.push((column.binding.column.clone(), column.binding.binder.to_storage(&value)?));
                }
            }
            if assignments.is_empty() {
                continue;
            }
            let outcome = self.connection.execute(&WriteStatement::Update(UpdateStatement {
                table: segment.table.clone(),
                assignments,
                criteria: Criteria::Eq(ColumnRef::bare(&segment.primary_key.column), id.clone()),
            }))?;
            if outcome.row_count == 0 {
                return Err(MappingError::StaleEntity(format!(
                    "{} {} has no row in {}",
                    self.class,
                    self.id.read(modified),
                    segment.table
                )));
            }
        }
        Ok(())
    }

    /// Deletes child tables first. With `check_rows`, fewer deleted rows than entities is stale.
    fn delete_rows(&self, entities: &[EntityRef], check_rows: bool) -> Result<()> {
        let ids = self.storage_ids(entities)?;
        let chunk_size = self.connection.settings.in_operator_max_size;
        for (position, segment) in self.segments.iter().enumerate().rev() {
            for chunk in ids.chunks(chunk_size) {
                let outcome = self.connection.execute(&WriteStatement::Delete(DeleteStatement {
                    table: segment.table.clone(),
                    criteria: Criteria::In(ColumnRef::bare(&segment.primary_key.column), chunk.to_vec()),
                }))?;
                if check_rows && position == 0 && outcome.row_count < chunk.len() {
                    return Err(MappingError::StaleEntity(format!(
                        "{} of {} {} rows were deleted",
                        outcome.row_count,
                        chunk.len(),
                        self.class
                    )));
                }
            }
        }
        Ok(())
    }
}

impl EntityPersister for SimpleEntityPersister {
    fn class_name(&self) -> &ClassName {
        &self.class
    }

    fn cache_key(&self) -> &ClassName {
        &self.cache_key
    }

    fn id_access(&self) -> &IdAccess {
        &self.id
    }

    fn main_table(&self) -> &str {
        &self.segments[0].table
    }

    fn main_primary_key(&self) -> &str {
        &self.segments[0].primary_key.column
    }

    fn relation_table(&self) -> &str {
        &self.segments[self.segments.len() - 1].table
    }

    fn listeners(&self) -> &ListenerPipeline {
        &self.listeners
    }

    fn connection(&self) -> &ConnectionConfiguration {
        &self.connection
    }

    fn tables(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.table.clone()).collect()
    }

    fn add_derived_column(&self, table: &str, column: DerivedColumn) -> Result<()> {
        self.segment(table)?.add_derived(column)
    }

    fn add_join(&self, join: Rc<dyn JoinContribution>) {
        self.joins.borrow_mut().push(join);
        self.tree.borrow_mut().take();
    }

    fn checkpoint(&self) -> WiringCheckpoint {
        WiringCheckpoint {
            listeners: self.listeners.checkpoint(),
            joins: self.joins.borrow().len(),
            derived: self.segments.iter().map(|s| s.derived.borrow().clone()).collect(),
        }
    }

    fn rollback(&self, checkpoint: WiringCheckpoint) {
        self.listeners.rollback(checkpoint.listeners);
        self.joins.borrow_mut().truncate(checkpoint.joins);
        for (segment, derived) in self.segments.iter().zip(checkpoint.derived) {
            *segment.derived.borrow_mut() = derived;
        }
        self.tree.borrow_mut().take();
    }

    fn graft(&self, tree: &mut JoinTree, link: Option<JoinLink>) -> Result<GraftedEntity> {
        let main = &self.segments[0];
        let (node, fixer) = match link {
            None => (tree.add_root(&main.table, NodeRole::Segment), None),
            Some(link) => (
                tree.add_join(link.parent, &main.table, link.kind, link.on, NodeRole::Segment, link.guard),
                link.fixer,
            ),
        };
        let aliases = self.join_segments(tree, node, JoinKind::Inner);
        self.select_columns(tree, &aliases);
        let inflater = self.inflater(&aliases)?;
        tree.set_role(
            node,
            NodeRole::Entity {
                inflater: Rc::new(inflater),
                fixer,
            },
        );
        let grafted = GraftedEntity {
            node,
            main_alias: tree.alias(node).to_string(),
            relation_alias: aliases
                .get(self.relation_table())
                .cloned()
                .unwrap_or_else(|| tree.alias(node).to_string()),
        };
        self.contribute_joins(tree, &grafted, None)?;
        Ok(grafted)
    }

    fn insert_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        ctx.guarded(OperationKind::Insert, &self.class, entities, |ctx, entities| {
            self.check_class(entities)?;
            self.listeners.fire_entities(Stage::BeforeInsert, entities, ctx)?;
            self.insert_rows(entities, ctx)?;
            for entity in entities {
                entity.mark_persisted(true);
            }
            self.listeners.fire_entities(Stage::AfterInsert, entities, ctx)?;
            event!(Level::DEBUG, class = %self.class, count = entities.len(), "inserted");
            Ok(())
        })
    }

    fn update_with(&self, pairs: &[Duo], all_columns: bool, ctx: &mut OperationContext) -> Result<()> {
        let modified: Vec<EntityRef> = pairs.iter().map(|p| p.modified.clone()).collect();
        ctx.guarded(OperationKind::Update, &self.class, &modified, |ctx, entered| {
            let pairs: Vec<Duo> = pairs
                .iter()
                .filter(|p| entered.iter().any(|e| e.ptr_eq(&p.modified)))
                .cloned()
                .collect();
            self.check_class(entered)?;
            self.listeners.fire_update(Stage::BeforeUpdate, &pairs, all_columns, ctx)?;
            for pair in &pairs {
                self.update_rows(&pair.modified, Some(&pair.unmodified), all_columns, ctx)?;
            }
            self.listeners.fire_update(Stage::AfterUpdate, &pairs, all_columns, ctx)?;
            event!(Level::DEBUG, class = %self.class, count = pairs.len(), "updated");
            Ok(())
        })
    }

    fn update_by_id_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        ctx.guarded(OperationKind::UpdateById, &self.class, entities, |ctx, entities| {
            self.check_class(entities)?;
            self.listeners.fire_entities(Stage::BeforeUpdateById, entities, ctx)?;
            for entity in entities {
                self.update_rows(entity, None, true, ctx)?;
            }
            self.listeners.fire_entities(Stage::AfterUpdateById, entities, ctx)?;
            Ok(())
        })
    }

    fn delete_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        ctx.guarded(OperationKind::Delete, &self.class, entities, |ctx, entities| {
            self.check_class(entities)?;
            self.listeners.fire_entities(Stage::BeforeDelete, entities, ctx)?;
            self.delete_rows(entities, true)?;
            for entity in entities {
                entity.mark_persisted(false);
            }
            self.listeners.fire_entities(Stage::AfterDelete, entities, ctx)?;
            event!(Level::DEBUG, class = %self.class, count = entities.len(), "deleted");
            Ok(())
        })
    }

    fn delete_by_id_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        ctx.guarded(OperationKind::Delete, &self.class, entities, |ctx, entities| {
            self.listeners.fire_entities(Stage::BeforeDelete, entities, ctx)?;
            self.delete_rows(entities, false)?;
            for entity in entities {
                entity.mark_persisted(false);
            }
            self.listeners.fire_entities(Stage::AfterDelete, entities, ctx)?;
            Ok(())
        })
    }

    fn select_with(&self, ids: &[Value], ctx: &mut OperationContext) -> Result<Vec<EntityRef>> {
        self.listeners.fire_ids(Stage::BeforeSelect, ids, ctx)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let tree = self.tree()?;
        let root_alias = tree
            .root_alias()
            .ok_or_else(|| MappingError::ExecutionError("empty join tree".into()))?
            .to_string();
        let mut entities = Vec::new();
        for chunk in ids.chunks(self.connection.settings.in_operator_max_size) {
            let keys = chunk
                .iter()
                .map(|id| self.id.to_storage(id))
                .collect::<Result<Vec<_>>>()?;
            let query = tree.to_query(Some(Criteria::In(
                ColumnRef::new(&root_alias, self.main_primary_key()),
                keys,
            )))?;
            let rows = self.connection.select(&query)?;
            entities.extend(tree.inflate(&query, &rows, ctx)?);
        }
        self.listeners.fire_entities(Stage::AfterSelect, &entities, ctx)?;
        Ok(entities)
    }

    fn select_ids_where(&self, criteria: &EntityCriteria) -> Result<Vec<Value>> {
        let mut tree = JoinTree::new();
        let root = tree.add_root(self.main_table(), NodeRole::Segment);
        let aliases = self.join_segments(&mut tree, root, JoinKind::Inner);
        let alias = tree.alias(root).to_string();
        tree.select_column(&alias, self.main_primary_key());
        let resolve = |path: &str| self.resolve_path(path, &aliases);
        let mut query = tree.to_query(criteria.to_sql(&resolve)?)?;
        query.distinct = true;
        query.order_by.push(ColumnRef::new(&alias, self.main_primary_key()));
        self.connection
            .select(&query)?
            .iter()
            .map(|row| self.id.binder.from_storage(&row[0]))
            .collect()
    }
}

impl fmt::Debug for SimpleEntityPersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleEntityPersister")
            .field("class", &self.class)
            .field("tables", &self.tables())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::sql::BinderRegistry;
    use crate::storage::MemoryDatabase;

    fn binding(table: &str, column: &str, data_type: DataType) -> ColumnBinding {
        ColumnBinding {
            table: table.into(),
            column: column.into(),
            binder: ValueBinder::passthrough(data_type.clone()),
            data_type,
        }
    }

    #[test]
    fn test_provided_columns_merge_and_others_clash() {
        let segment = Segment::new("wheel", binding("wheel", "id", DataType::Integer), Mapping::default());
        let fk = binding("wheel", "vehicle_id", DataType::Integer);
        segment
            .add_derived(DerivedColumn::provided(fk.clone(), RelationId(1), None))
            .unwrap();
        segment
            .add_derived(DerivedColumn::provided(fk.clone(), RelationId(2), None))
            .unwrap();
        assert_eq!(segment.derived.borrow().len(), 1);
        let clash = segment.add_derived(DerivedColumn::constant(fk, Value::from(1)));
        assert!(matches!(clash, Err(MappingError::DuplicateColumn { .. })));
    }

    #[test]
    fn test_computed_column_becomes_fallback_of_provided_one() {
        let segment = Segment::new("orders", binding("orders", "id", DataType::Integer), Mapping::default());
        let fk = binding("orders", "customer_id", DataType::Integer);
        segment
            .add_derived(DerivedColumn::computed(fk.clone(), |_| Ok(Value::from(5))))
            .unwrap();
        segment
            .add_derived(DerivedColumn::provided(fk, RelationId(4), None))
            .unwrap();
        let derived = segment.derived.borrow();
        assert_eq!(derived.len(), 1);
        let order = Instance::new("Order").into_ref();
        let ctx = OperationContext::new();
        assert_eq!(derived[0].insert_value(&order, &ctx).unwrap(), Value::from(5));
    }

    #[test]
    fn test_provided_value_comes_from_context_then_fallback() {
        let fk = binding("wheel", "vehicle_id", DataType::Integer);
        let column = DerivedColumn::provided(fk, RelationId(3), Some(Rc::new(|_: &EntityRef| Ok(Value::from(9)))));
        let wheel = Instance::new("Wheel").into_ref();
        let mut ctx = OperationContext::new();
        assert_eq!(column.insert_value(&wheel, &ctx).unwrap(), Value::from(9));
        let key = crate::persister::ProvidedKey::new(RelationId(3), &wheel, "vehicle_id");
        ctx.with_foreign_keys(vec![(key, Value::from(4))], |ctx| {
            assert_eq!(column.insert_value(&wheel, ctx).unwrap(), Value::from(4));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_insert_and_select_single_table() {
        let database = Rc::new(MemoryDatabase::new());
        let binders = BinderRegistry::with_defaults();
        let mut table = crate::schema::TableDefinition::new("person");
        let mut builder = crate::mapping::MappingBuilder::new(
            ClassName::new("Person"),
            &mut table,
            &binders,
            &crate::config::DefaultNamingStrategy,
        );
        builder
            .add_properties(&[crate::config::PropertyLinkage::new("name", DataType::Text)])
            .unwrap();
        let mapping = builder.build();
        let key = crate::mapping::add_technical_column(
            &mut table,
            &binders,
            crate::schema::ColumnDefinition::new("id", DataType::Integer, DataType::Integer).primary_key(),
        )
        .unwrap();
        database.create_table(table).unwrap();

        let id = IdAccess {
            accessor: PropertyAccessor::new("Person", "id"),
            data_type: DataType::Integer,
            policy: IdentifierPolicy::Assigned,
            binder: key.binder.clone(),
        };
        let persister = SimpleEntityPersister::new(
            ClassName::new("Person"),
            ClassName::new("Person"),
            id,
            vec![Segment::new("person", key, mapping)],
            ConnectionConfiguration::new(database.clone()),
        )
        .unwrap();

        let ada = Instance::new("Person").with("id", 1).with("name", "Ada").into_ref();
        persister.insert(&[ada.clone()]).unwrap();
        assert!(ada.is_persisted());
        assert!(!persister.is_new(&ada));

        let loaded = persister.select(&[Value::from(1)]).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].get("name"), Value::from("Ada"));
        assert!(!loaded[0].ptr_eq(&ada));

        ada.set("name", "Ada Lovelace");
        persister.update(&[ada.clone()]).unwrap();
        assert_eq!(
            database.column_values("person", "name").unwrap(),
            vec![Value::from("Ada Lovelace")]
        );

        let ids = persister
            .select_ids_where(&EntityCriteria::like("name", "Ada%"))
            .unwrap();
        assert_eq!(ids, vec![Value::from(1)]);

        persister.delete(&[ada.clone()]).unwrap();
        assert_eq!(database.row_count("person").unwrap(), 0);
        assert!(matches!(persister.delete(&[ada]), Err(MappingError::StaleEntity(_))));
    }
}
