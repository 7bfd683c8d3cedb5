use super::inflater::{BoundSelector, PolymorphicInflater, Selector};
use crate::builder::SegmentDraft;
use crate::config::{ConnectionConfiguration, PolymorphismKind};
use crate::core::{ClassName, MappingError, Result, Value};
use crate::model::EntityRef;
use crate::persister::{
    DerivedColumn, DerivedSource, Duo, EntityCriteria, EntityPersister, GraftedEntity, IdAccess, JoinContribution, JoinLink,
    ListenerPipeline, OperationContext, OperationKind, SimpleEntityPersister, Stage, WiringCheckpoint,
};
use crate::select::{JoinTree, NodeId, NodeRole};
use crate::sql::{ColumnRef, Criteria, JoinKind, ValueBinder};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use tracing::{Level, event};

/// Persister of one concrete class and the condition identifying its rows.
pub struct ConcreteSubtype {
    persister: Rc<SimpleEntityPersister>,
    selectors: Vec<Selector>,
}

impl ConcreteSubtype {
    pub fn new(persister: Rc<SimpleEntityPersister>, selectors: Vec<Selector>) -> Self {
        Self { persister, selectors }
    }

    pub fn persister(&self) -> &Rc<SimpleEntityPersister> {
        &self.persister
    }

    pub fn selectors(&self) -> &[Selector] {
        &self.selectors
    }

    /// Binder of the constant column a discriminator selector reads.
    fn discriminator_binder(&self, selector: &Selector) -> Option<ValueBinder> {
        let segment = self
            .persister
            .segments()
            .iter()
            .find(|s| s.table == selector.table())?;
        segment
            .derived
            .borrow()
            .iter()
            .find(|d| d.binding.column == selector.column() && matches!(d.source, DerivedSource::Constant(_)))
            .map(|d| d.binding.binder.clone())
    }

    fn class(&self) -> &ClassName {
        self.persister.class_name()
    }
}

/// Writes and reads a polymorphic entity by dispatching to the persisters of its concrete
/// subtypes.
///
/// Listeners of the polymorphic persister run around the dispatch. The mandatory checks of
/// every subtype run before any statement.
pub struct PolymorphicPersister {
    class: ClassName,
    kind: PolymorphismKind,
    id: IdAccess,
    main_table: String,
    main_primary_key: String,
    relation_table: String,
    /// Tables shared by every subtype, root first. Empty for table-per-class.
    base_tables: Vec<String>,
    subtypes: Vec<ConcreteSubtype>,
    listeners: ListenerPipeline,
    joins: RefCell<Vec<Rc<dyn JoinContribution>>>,
    tree: RefCell<Option<Rc<JoinTree>>>,
    connection: ConnectionConfiguration,
}

impl PolymorphicPersister {
    /// Single-table or joined-tables hierarchy over the base tables `drafts`.
    pub fn shared(
        class: ClassName,
        kind: PolymorphismKind,
        id: IdAccess,
        drafts: &[SegmentDraft],
        subtypes: Vec<ConcreteSubtype>,
        connection: ConnectionConfiguration,
    ) -> Result<Self> {
        let (Some(root), Some(last)) = (drafts.first(), drafts.last()) else {
            return Err(MappingError::InvalidConfiguration(format!("{} maps no table", class)));
        };
        if subtypes.is_empty() {
            return Err(MappingError::InvalidConfiguration(format!("{} has no concrete subtype", class)));
        }
        Ok(Self {
            main_table: root.table.clone(),
            main_primary_key: root.primary_key.column.clone(),
            relation_table: last.table.clone(),
            base_tables: drafts.iter().map(|d| d.table.clone()).collect(),
            class,
            kind,
            id,
            subtypes,
            listeners: ListenerPipeline::new(),
            joins: RefCell::new(Vec::new()),
            tree: RefCell::new(None),
            connection,
        })
    }

    pub fn table_per_class(
        class: ClassName,
        id: IdAccess,
        subtypes: Vec<ConcreteSubtype>,
        connection: ConnectionConfiguration,
    ) -> Result<Self> {
        let Some(first) = subtypes.first() else {
            return Err(MappingError::InvalidConfiguration(format!("{} has no concrete subtype", class)));
        };
        let main_table = first.persister.main_table().to_string();
        Ok(Self {
            main_primary_key: first.persister.main_primary_key().to_string(),
            relation_table: main_table.clone(),
            main_table,
            base_tables: Vec::new(),
            class,
            kind: PolymorphismKind::TablePerClass,
            id,
            subtypes,
            listeners: ListenerPipeline::new(),
            joins: RefCell::new(Vec::new()),
            tree: RefCell::new(None),
            connection,
        })
    }

    pub fn subtypes(&self) -> &[ConcreteSubtype] {
        &self.subtypes
    }

    /// Persisters of the concrete subtypes, to register under their class.
    pub fn subtype_persisters(self: &Rc<Self>) -> Vec<Rc<dyn EntityPersister>> {
        (0..self.subtypes.len())
            .map(|position| {
                Rc::new(SubtypePersister {
                    hierarchy: Rc::clone(self),
                    position,
                }) as Rc<dyn EntityPersister>
            })
            .collect()
    }

    fn subtype_of(&self, entity: &EntityRef) -> Result<usize> {
        let class = entity.class();
        self.subtypes
            .iter()
            .position(|s| *s.class() == class)
            .ok_or_else(|| {
                MappingError::UnknownSubtype(format!("{} is not a concrete subtype of {}", class, self.class))
            })
    }

    /// Groups `entities` by concrete subtype, in subtype order.
    fn partition(&self, entities: &[EntityRef]) -> Result<Vec<(usize, Vec<EntityRef>)>> {
        let mut groups: Vec<Vec<EntityRef>> = vec![Vec::new(); self.subtypes.len()];
        for entity in entities {
            groups[self.subtype_of(entity)?].push(entity.clone());
        }
        Ok(groups.into_iter().enumerate().filter(|(_, g)| !g.is_empty()).collect())
    }

    fn partition_pairs(&self, pairs: &[Duo]) -> Result<Vec<(usize, Vec<Duo>)>> {
        let mut groups: Vec<Vec<Duo>> = vec![Vec::new(); self.subtypes.len()];
        for pair in pairs {
            let position = self.subtype_of(&pair.modified)?;
            let stored = pair.unmodified.class();
            if stored != pair.modified.class() {
                return Err(MappingError::InvalidConfiguration(format!(
                    "{} {} cannot change its class from {} to {}",
                    self.class,
                    self.id_of(&pair.modified),
                    stored,
                    pair.modified.class()
                )));
            }
            groups[position].push(pair.clone());
        }
        Ok(groups.into_iter().enumerate().filter(|(_, g)| !g.is_empty()).collect())
    }

    /// Joins every table of the hierarchy below the main table node, returning table aliases.
    ///
    /// Subtype tables are outer joined: they hold rows of their subtype only.
    fn join_tables(&self, tree: &mut JoinTree, node: NodeId) -> HashMap<String, String> {
        let main_alias = tree.alias(node).to_string();
        let mut aliases = HashMap::from([(self.main_table.clone(), main_alias.clone())]);
        let join = |tree: &mut JoinTree, aliases: &mut HashMap<String, String>, table: &str, key: &str, kind: JoinKind| {
            if aliases.contains_key(table) {
                return;
            }
            let child = tree.add_join(
                node,
                table,
                kind,
                vec![(ColumnRef::new(&main_alias, &self.main_primary_key), key.to_string())],
                NodeRole::Segment,
                None,
            );
            aliases.insert(table.to_string(), tree.alias(child).to_string());
        };
        for subtype in &self.subtypes {
            for segment in subtype.persister.segments() {
                let kind = if self.base_tables.contains(&segment.table) {
                    JoinKind::Inner
                } else {
                    JoinKind::LeftOuter
                };
                join(tree, &mut aliases, &segment.table, &segment.primary_key.column, kind);
            }
        }
        aliases
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

    fn resolve_path(&self, path: &str, aliases: &HashMap<String, String>) -> Result<(ColumnRef, ValueBinder)> {
        if path == self.id.accessor.definition() {
            let alias = aliases.get(&self.main_table).cloned().unwrap_or_default();
            return Ok((ColumnRef::new(&alias, &self.main_primary_key), self.id.binder.clone()));
        }
        for subtype in &self.subtypes {
            match subtype.persister.resolve_path(path, aliases) {
                Err(MappingError::UnmappedProperty(_)) => continue,
                resolved => return resolved,
            }
        }
        Err(MappingError::UnmappedProperty(format!("{}.{}", self.class, path)))
    }

    fn select_shared(&self, ids: &[Value], ctx: &mut OperationContext) -> Result<Vec<EntityRef>> {
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
                ColumnRef::new(&root_alias, &self.main_primary_key),
                keys,
            )))?;
            let rows = self.connection.select(&query)?;
            entities.extend(tree.inflate(&query, &rows, ctx)?);
        }
        for (position, group) in self.partition(&entities)? {
            self.subtypes[position]
                .persister
                .listeners()
                .fire_entities(Stage::AfterSelect, &group, ctx)?;
        }
        Ok(entities)
    }

    /// Every subtype table is asked for the identifiers; results keep the order of `ids`.
    fn select_per_class(&self, ids: &[Value], ctx: &mut OperationContext) -> Result<Vec<EntityRef>> {
        let order: HashMap<&Value, usize> = ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
        let mut entities = Vec::new();
        for subtype in &self.subtypes {
            entities.extend(subtype.persister.select_with(ids, ctx)?);
        }
        entities.sort_by_key(|e| order.get(&self.id_of(e)).copied().unwrap_or(usize::MAX));
        Ok(entities)
    }

    /// Identifiers of the rows matching `criteria`; of the subtype at `position` only when given.
    fn select_ids_matching(&self, criteria: &EntityCriteria, position: Option<usize>) -> Result<Vec<Value>> {
        if self.kind == PolymorphismKind::TablePerClass {
            return match position {
                Some(position) => self.subtypes[position].persister.select_ids_where(criteria),
                None => self.select_ids_per_class(criteria),
            };
        }
        let mut tree = JoinTree::new();
        let root = tree.add_root(&self.main_table, NodeRole::Segment);
        let aliases = self.join_tables(&mut tree, root);
        let alias = tree.alias(root).to_string();
        tree.select_column(&alias, &self.main_primary_key);
        let resolve = |path: &str| self.resolve_path(path, &aliases);
        let mut filters: Vec<Criteria> = criteria.to_sql(&resolve)?.into_iter().collect();
        if let Some(subtype) = position.map(|p| &self.subtypes[p]) {
            for selector in &subtype.selectors {
                let binder = subtype.discriminator_binder(selector);
                filters.push(BoundSelector::bind(selector, &aliases, binder.as_ref())?.criteria());
            }
        }
        let filter = match filters.len() {
            0 | 1 => filters.pop(),
            _ => Some(Criteria::And(filters)),
        };
        let mut query = tree.to_query(filter)?;
        query.distinct = true;
        query.order_by.push(ColumnRef::new(&alias, &self.main_primary_key));
        self.connection
            .select(&query)?
            .iter()
            .map(|row| self.id.binder.from_storage(&row[0]))
            .collect()
    }

    fn select_ids_per_class(&self, criteria: &EntityCriteria) -> Result<Vec<Value>> {
        let mut ids = Vec::new();
        let mut mapped = false;
        for subtype in &self.subtypes {
            match subtype.persister.select_ids_where(criteria) {
                Ok(found) => {
                    mapped = true;
                    ids.extend(found);
                }
                Err(MappingError::UnmappedProperty(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        if !mapped {
            return Err(MappingError::UnmappedProperty(format!(
                "{} has no subtype mapping every property of the criteria",
                self.class
            )));
        }
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        ids.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
        Ok(ids)
    }
}

impl EntityPersister for PolymorphicPersister {
    fn class_name(&self) -> &ClassName {
        &self.class
    }

    fn cache_key(&self) -> &ClassName {
        &self.class
    }

    fn id_access(&self) -> &IdAccess {
        &self.id
    }

    fn main_table(&self) -> &str {
        &self.main_table
    }

    fn main_primary_key(&self) -> &str {
        &self.main_primary_key
    }

    fn relation_table(&self) -> &str {
        &self.relation_table
    }

    fn polymorphism(&self) -> Option<PolymorphismKind> {
        Some(self.kind)
    }

    fn listeners(&self) -> &ListenerPipeline {
        &self.listeners
    }

    fn connection(&self) -> &ConnectionConfiguration {
        &self.connection
    }

    fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for table in self.subtypes.iter().flat_map(|s| s.persister.tables()) {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        tables
    }

    /// The column goes to every subtype writing `table`.
    fn add_derived_column(&self, table: &str, column: DerivedColumn) -> Result<()> {
        let mut added = false;
        for subtype in &self.subtypes {
            if subtype.persister.tables().iter().any(|t| t == table) {
                subtype.persister.add_derived_column(table, column.clone())?;
                added = true;
            }
        }
        if !added {
            return Err(MappingError::TableNotFound(format!("{} (entity {})", table, self.class)));
        }
        Ok(())
    }

    fn add_join(&self, join: Rc<dyn JoinContribution>) {
        self.joins.borrow_mut().push(join);
        self.tree.borrow_mut().take();
    }

    /// Derived columns live on the subtypes, which are registered and restored on their own.
    fn checkpoint(&self) -> WiringCheckpoint {
        WiringCheckpoint {
            listeners: self.listeners.checkpoint(),
            joins: self.joins.borrow().len(),
            derived: Vec::new(),
        }
    }

    fn rollback(&self, checkpoint: WiringCheckpoint) {
        self.listeners.rollback(checkpoint.listeners);
        self.joins.borrow_mut().truncate(checkpoint.joins);
        self.tree.borrow_mut().take();
    }

    fn check_update(&self, pairs: &[Duo], ctx: &mut OperationContext) -> Result<()> {
        for (position, group) in self.partition_pairs(pairs)? {
            self.subtypes[position]
                .persister
                .listeners()
                .fire_update_checks(Stage::BeforeUpdate, &group, false, ctx)?;
        }
        self.listeners.fire_update_checks(Stage::BeforeUpdate, pairs, false, ctx)
    }

    fn graft(&self, tree: &mut JoinTree, link: Option<JoinLink>) -> Result<GraftedEntity> {
        if self.kind == PolymorphismKind::TablePerClass {
            return Err(MappingError::UnsupportedRelation(format!(
                "{} is mapped table-per-class and cannot be read in a single statement",
                self.class
            )));
        }
        let (node, fixer) = match link {
            None => (tree.add_root(&self.main_table, NodeRole::Segment), None),
            Some(link) => (
                tree.add_join(link.parent, &self.main_table, link.kind, link.on, NodeRole::Segment, link.guard),
                link.fixer,
            ),
        };
        let aliases = self.join_tables(tree, node);
        let main_alias = tree.alias(node).to_string();

        let mut readers = Vec::with_capacity(self.subtypes.len());
        for subtype in &self.subtypes {
            subtype.persister.select_columns(tree, &aliases);
            let mut selectors = Vec::with_capacity(subtype.selectors.len());
            for selector in &subtype.selectors {
                let bound = BoundSelector::bind(selector, &aliases, subtype.discriminator_binder(selector).as_ref())?;
                tree.select_column(&bound.column().alias, &bound.column().column);
                selectors.push(bound);
            }
            readers.push((selectors, subtype.persister.inflater(&aliases)?));
        }
        let inflater = PolymorphicInflater::new(
            self.class.clone(),
            ColumnRef::new(&main_alias, &self.main_primary_key),
            self.id.binder.clone(),
            readers,
        );
        tree.set_role(
            node,
            NodeRole::Entity {
                inflater: Rc::new(inflater),
                fixer,
            },
        );

        let relation_alias = |table: &str| aliases.get(table).cloned().unwrap_or_else(|| main_alias.clone());
        let grafted = GraftedEntity {
            node,
            main_alias: main_alias.clone(),
            relation_alias: relation_alias(&self.relation_table),
        };
        let joins = self.joins.borrow().clone();
        for join in joins {
            join.contribute(tree, &grafted, None)?;
        }
        // relations of a subtype only apply to rows of that subtype
        for subtype in &self.subtypes {
            let own = GraftedEntity {
                node,
                main_alias: main_alias.clone(),
                relation_alias: relation_alias(subtype.persister.relation_table()),
            };
            subtype
                .persister
                .contribute_joins(tree, &own, Some(vec![subtype.class().clone()]))?;
        }
        Ok(grafted)
    }

    fn insert_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        ctx.guarded(OperationKind::Insert, &self.class, entities, |ctx, entities| {
            let groups = self.partition(entities)?;
            for (position, group) in &groups {
                self.subtypes[*position]
                    .persister
                    .listeners()
                    .fire_checks(Stage::BeforeInsert, group, ctx)?;
            }
            self.listeners.fire_entities(Stage::BeforeInsert, entities, ctx)?;
            for (position, group) in &groups {
                self.subtypes[*position].persister.insert_with(group, ctx)?;
            }
            self.listeners.fire_entities(Stage::AfterInsert, entities, ctx)?;
            event!(Level::DEBUG, class = %self.class, subtypes = groups.len(), count = entities.len(), "inserted");
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
            let groups = self.partition_pairs(&pairs)?;
            for (position, group) in &groups {
                self.subtypes[*position]
                    .persister
                    .listeners()
                    .fire_update_checks(Stage::BeforeUpdate, group, all_columns, ctx)?;
            }
            self.listeners.fire_update(Stage::BeforeUpdate, &pairs, all_columns, ctx)?;
            for (position, group) in &groups {
                self.subtypes[*position].persister.update_with(group, all_columns, ctx)?;
            }
            self.listeners.fire_update(Stage::AfterUpdate, &pairs, all_columns, ctx)?;
            event!(Level::DEBUG, class = %self.class, count = pairs.len(), "updated");
            Ok(())
        })
    }

    fn update_by_id_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        ctx.guarded(OperationKind::UpdateById, &self.class, entities, |ctx, entities| {
            let groups = self.partition(entities)?;
            for (position, group) in &groups {
                self.subtypes[*position]
                    .persister
                    .listeners()
                    .fire_checks(Stage::BeforeUpdateById, group, ctx)?;
            }
            self.listeners.fire_entities(Stage::BeforeUpdateById, entities, ctx)?;
            for (position, group) in &groups {
                self.subtypes[*position].persister.update_by_id_with(group, ctx)?;
            }
            self.listeners.fire_entities(Stage::AfterUpdateById, entities, ctx)
        })
    }

    fn delete_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        ctx.guarded(OperationKind::Delete, &self.class, entities, |ctx, entities| {
            let groups = self.partition(entities)?;
            self.listeners.fire_entities(Stage::BeforeDelete, entities, ctx)?;
            for (position, group) in &groups {
                self.subtypes[*position].persister.delete_with(group, ctx)?;
            }
            self.listeners.fire_entities(Stage::AfterDelete, entities, ctx)?;
            event!(Level::DEBUG, class = %self.class, count = entities.len(), "deleted");
            Ok(())
        })
    }

    fn delete_by_id_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        ctx.guarded(OperationKind::Delete, &self.class, entities, |ctx, entities| {
            let groups = self.partition(entities)?;
            self.listeners.fire_entities(Stage::BeforeDelete, entities, ctx)?;
            for (position, group) in &groups {
                self.subtypes[*position].persister.delete_by_id_with(group, ctx)?;
            }
            self.listeners.fire_entities(Stage::AfterDelete, entities, ctx)
        })
    }

    fn select_with(&self, ids: &[Value], ctx: &mut OperationContext) -> Result<Vec<EntityRef>> {
        self.listeners.fire_ids(Stage::BeforeSelect, ids, ctx)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let entities = match self.kind {
            PolymorphismKind::TablePerClass => self.select_per_class(ids, ctx)?,
            _ => self.select_shared(ids, ctx)?,
        };
        self.listeners.fire_entities(Stage::AfterSelect, &entities, ctx)?;
        Ok(entities)
    }

    fn select_ids_where(&self, criteria: &EntityCriteria) -> Result<Vec<Value>> {
        self.select_ids_matching(criteria, None)
    }
}

/// One concrete subtype, as registered under its own class.
///
/// Writes go through the persister of the hierarchy: relations declared on the base apply to
/// them as well. Reads keep the instances of the subtype only.
pub struct SubtypePersister {
    hierarchy: Rc<PolymorphicPersister>,
    position: usize,
}

impl SubtypePersister {
    fn concrete(&self) -> &Rc<SimpleEntityPersister> {
        &self.hierarchy.subtypes[self.position].persister
    }

    fn check_class<'e>(&self, entities: impl IntoIterator<Item = &'e EntityRef>) -> Result<()> {
        for entity in entities {
            let class = entity.class();
            if class != *self.class_name() {
                return Err(MappingError::TypeMismatch(format!(
                    "{} persister cannot write an instance of {}",
                    self.class_name(),
                    class
                )));
            }
        }
        Ok(())
    }
}

impl EntityPersister for SubtypePersister {
    fn class_name(&self) -> &ClassName {
        self.concrete().class_name()
    }

    fn cache_key(&self) -> &ClassName {
        self.concrete().cache_key()
    }

    fn id_access(&self) -> &IdAccess {
        self.concrete().id_access()
    }

    fn main_table(&self) -> &str {
        self.concrete().main_table()
    }

    fn main_primary_key(&self) -> &str {
        self.concrete().main_primary_key()
    }

    fn relation_table(&self) -> &str {
        self.concrete().relation_table()
    }

    fn listeners(&self) -> &ListenerPipeline {
        self.concrete().listeners()
    }

    fn connection(&self) -> &ConnectionConfiguration {
        self.concrete().connection()
    }

    fn tables(&self) -> Vec<String> {
        self.concrete().tables()
    }

    fn add_derived_column(&self, table: &str, column: DerivedColumn) -> Result<()> {
        self.concrete().add_derived_column(table, column)
    }

    fn add_join(&self, join: Rc<dyn JoinContribution>) {
        self.concrete().add_join(join);
    }

    fn checkpoint(&self) -> WiringCheckpoint {
        self.concrete().checkpoint()
    }

    fn rollback(&self, checkpoint: WiringCheckpoint) {
        self.concrete().rollback(checkpoint);
    }

    fn check_update(&self, pairs: &[Duo], ctx: &mut OperationContext) -> Result<()> {
        self.check_class(pairs.iter().map(|p| &p.modified))?;
        self.hierarchy.check_update(pairs, ctx)
    }

    fn graft(&self, tree: &mut JoinTree, link: Option<JoinLink>) -> Result<GraftedEntity> {
        self.concrete().graft(tree, link)
    }

    fn insert_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        self.check_class(entities)?;
        self.hierarchy.insert_with(entities, ctx)
    }

    fn update_with(&self, pairs: &[Duo], all_columns: bool, ctx: &mut OperationContext) -> Result<()> {
        self.check_class(pairs.iter().map(|p| &p.modified))?;
        self.hierarchy.update_with(pairs, all_columns, ctx)
    }

    fn update_by_id_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        self.check_class(entities)?;
        self.hierarchy.update_by_id_with(entities, ctx)
    }

    fn delete_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        self.check_class(entities)?;
        self.hierarchy.delete_with(entities, ctx)
    }

    fn delete_by_id_with(&self, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        self.check_class(entities)?;
        self.hierarchy.delete_by_id_with(entities, ctx)
    }

    /// Table-per-class subtypes carry the relations of the base themselves and are read
    /// alone; the others are read through the shared tables.
    fn select_with(&self, ids: &[Value], ctx: &mut OperationContext) -> Result<Vec<EntityRef>> {
        if self.hierarchy.kind == PolymorphismKind::TablePerClass {
            return self.concrete().select_with(ids, ctx);
        }
        let class = self.class_name().clone();
        let loaded = self.hierarchy.select_with(ids, ctx)?;
        Ok(loaded.into_iter().filter(|e| e.class() == class).collect())
    }

    fn select_ids_where(&self, criteria: &EntityCriteria) -> Result<Vec<Value>> {
        self.hierarchy.select_ids_matching(criteria, Some(self.position))
    }
}

impl fmt::Debug for SubtypePersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubtypePersister")
            .field("class", self.class_name())
            .field("hierarchy", &self.hierarchy.class)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for PolymorphicPersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolymorphicPersister")
            .field("class", &self.class)
            .field("kind", &self.kind)
            .field(
                "subtypes",
                &self.subtypes.iter().map(|s| s.class().to_string()).collect::<Vec<_>>(),
            )
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}
