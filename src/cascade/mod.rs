//! Relation wiring: foreign key columns, listeners maintaining targets on writes, and the
//! select tree parts loading them.
//!
//! Writes follow the foreign keys: a target referenced by the source is inserted before it,
//! rows referencing the source are deleted (or detached) before it.

pub mod association;
pub mod element_collection;
pub mod one_to_many;
pub mod one_to_one;

use crate::builder::{BuildSession, TableClaim};
use crate::config::{
    ElementCollectionRelation, EntityMappingConfiguration, NamingStrategy, OneToManyRelation, OneToOneRelation,
    PolymorphismKind, SubEntityConfiguration,
};
use crate::core::{ClassName, DataType, MappingError, Result, Value};
use crate::mapping::{ColumnBinding, add_technical_column};
use crate::model::{EntityRef, PropertyAccessor};
use crate::persister::{EntityPersister, IdAccess, ListenerPipeline, PersisterHandle, Priority, Stage};
use crate::schema::{ColumnDefinition, ForeignKeyDefinition};
use crate::select::{InflationState, RelationFixer, RowView};
use crate::sql::{ColumnRef, Criteria, UpdateStatement, WriteStatement};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use tracing::{Level, event, info_span};

/// A persister and the relations to wire on it.
///
/// Relations of a polymorphic hierarchy are split over several sites: the ones of the base
/// on the dispatching persister, the ones of each subtype on its concrete persisters.
#[derive(Clone)]
pub struct RelationSite {
    pub persister: Rc<dyn EntityPersister>,
    /// Class declaring the relations, owner of their accessors.
    pub owner: ClassName,
    pub naming: Rc<dyn NamingStrategy>,
    pub one_to_ones: Vec<OneToOneRelation>,
    pub one_to_manys: Vec<OneToManyRelation>,
    pub element_collections: Vec<ElementCollectionRelation>,
}

impl RelationSite {
    /// Relations of `config` and of the levels it inherits, root level first.
    pub fn for_entity(persister: Rc<dyn EntityPersister>, config: &Rc<EntityMappingConfiguration>) -> Self {
        let mut site = Self {
            persister,
            owner: config.class.clone(),
            naming: Rc::clone(&config.naming),
            one_to_ones: Vec::new(),
            one_to_manys: Vec::new(),
            element_collections: Vec::new(),
        };
        for level in config.inheritance_chain().into_iter().rev() {
            site.one_to_ones.extend(level.effective_one_to_ones());
            site.one_to_manys.extend(level.effective_one_to_manys());
            site.element_collections
                .extend(level.effective_element_collections());
        }
        site
    }

    pub fn for_subtype(
        persister: Rc<dyn EntityPersister>,
        sub: &SubEntityConfiguration,
        naming: Rc<dyn NamingStrategy>,
    ) -> Self {
        Self {
            persister,
            owner: sub.class.clone(),
            naming,
            one_to_ones: sub.one_to_ones.clone(),
            one_to_manys: sub.one_to_manys.clone(),
            element_collections: sub.element_collections.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.one_to_ones.is_empty() && self.one_to_manys.is_empty() && self.element_collections.is_empty()
    }

    pub(crate) fn accessor(&self, property: &str) -> PropertyAccessor {
        PropertyAccessor::new(self.owner.clone(), property)
    }
}

impl fmt::Debug for RelationSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationSite")
            .field("persister", self.persister.class_name())
            .field("owner", &self.owner)
            .field("one_to_ones", &self.one_to_ones.len())
            .field("one_to_manys", &self.one_to_manys.len())
            .field("element_collections", &self.element_collections.len())
            .finish()
    }
}

/// What listeners need to know of the source persister.
///
/// Listeners are owned by the source persister: they keep a copy of this instead of a
/// reference to it.
#[derive(Debug, Clone)]
pub(crate) struct SourceInfo {
    pub class: ClassName,
    pub id: IdAccess,
    pub main_table: String,
    pub primary_key: String,
    pub relation_table: String,
}

impl SourceInfo {
    pub fn of(persister: &dyn EntityPersister) -> Self {
        Self {
            class: persister.class_name().clone(),
            id: persister.id_access().clone(),
            main_table: persister.main_table().to_string(),
            primary_key: persister.main_primary_key().to_string(),
            relation_table: persister.relation_table().to_string(),
        }
    }

    pub fn storage_ids(&self, entities: &[EntityRef]) -> Result<Vec<Value>> {
        entities
            .iter()
            .map(|e| self.id.to_storage(&self.id.read(e)))
            .collect()
    }

    /// Owner of a relation table: the declaration and the table its owner column references.
    pub fn claim(&self, accessor: &PropertyAccessor) -> TableClaim {
        TableClaim {
            relation: format!("{}.{}", accessor.owner(), accessor.definition()),
            source_table: self.main_table.clone(),
        }
    }

    pub fn listener_name(&self, accessor: &PropertyAccessor, action: &str) -> String {
        format!("{}.{} {}", self.class, accessor.definition(), action)
    }
}

/// Wires every relation of `site`.
pub fn configure_site<'a>(session: &mut BuildSession<'a>, site: &RelationSite) -> Result<()> {
    if site.is_empty() {
        return Ok(());
    }
    let span = info_span!("cascade.configure", class = %site.persister.class_name(), owner = %site.owner);
    let _enter = span.enter();

    for relation in &site.one_to_ones {
        one_to_one::configure(session, site, relation)?;
    }
    for relation in &site.one_to_manys {
        if relation.uses_association_table() {
            association::configure(session, site, relation)?;
        } else {
            one_to_many::configure(session, site, relation)?;
        }
    }
    for relation in &site.element_collections {
        element_collection::configure(session, site, relation)?;
    }
    Ok(())
}

/// Runs `wire` with the persister of `target`.
///
/// A target whose build is under way closes a cycle: its persister is not usable yet, so the
/// wiring waits for the end of the build and is told the relation is cycling.
pub(crate) fn with_target<'a, F>(session: &mut BuildSession<'a>, target: &ClassName, wire: F) -> Result<()>
where
    F: FnOnce(&mut BuildSession<'a>, Rc<dyn EntityPersister>, bool) -> Result<()> + 'a,
{
    if session.is_building(target) {
        event!(Level::DEBUG, target = %target, "relation closes a cycle, wiring deferred");
        let target = target.clone();
        session.defer(Box::new(move |session| {
            let persister = session.existing(&target).ok_or_else(|| {
                MappingError::UnknownEntity(format!("{} was not built by the end of the build", target))
            })?;
            check_target(&persister)?;
            wire(session, persister, true)
        }));
        return Ok(());
    }
    let persister = session.persister(target)?;
    check_target(&persister)?;
    wire(session, persister, false)
}

/// Table-per-class hierarchies have no table a foreign key could point to.
fn check_target(target: &Rc<dyn EntityPersister>) -> Result<()> {
    if target.polymorphism() == Some(PolymorphismKind::TablePerClass) {
        return Err(MappingError::UnsupportedRelation(format!(
            "{} is mapped table-per-class and cannot be the target of a relation",
            target.class_name()
        )));
    }
    Ok(())
}

pub(crate) fn handle(target: &Rc<dyn EntityPersister>, cycling: bool) -> PersisterHandle {
    if cycling {
        PersisterHandle::Weak(Rc::downgrade(target))
    } else {
        PersisterHandle::Strong(Rc::clone(target))
    }
}

/// Foreign key column `table.column` referencing `target_table.target_column`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn add_foreign_key_column(
    session: &mut BuildSession<'_>,
    table: &str,
    column: &str,
    data_type: &DataType,
    target_table: &str,
    target_column: &str,
    naming: &dyn NamingStrategy,
    nullable: bool,
) -> Result<ColumnBinding> {
    let binders = session.binders();
    let definition = session.schema_mut().table_mut(table)?;
    let mut key = ColumnDefinition::new(column, data_type.clone(), data_type.clone());
    if !nullable {
        key = key.not_null();
    }
    let binding = add_technical_column(definition, binders, key)?;
    definition.add_foreign_key(ForeignKeyDefinition {
        name: naming.foreign_key_name(table, column, target_table, target_column),
        columns: vec![column.to_string()],
        target_table: target_table.to_string(),
        target_columns: vec![target_column.to_string()],
    });
    Ok(binding)
}

/// Column of the positions of a list, on `table`.
pub(crate) fn add_index_column(session: &mut BuildSession<'_>, table: &str, column: &str) -> Result<ColumnBinding> {
    let binders = session.binders();
    let definition = session.schema_mut().table_mut(table)?;
    add_technical_column(
        definition,
        binders,
        ColumnDefinition::new(column, DataType::Integer, DataType::Integer),
    )
}

/// Detaches the rows of `table` referencing the sources in `columns[0]`, without loading them.
pub(crate) fn nullify_references(
    target: &dyn EntityPersister,
    table: &str,
    columns: &[String],
    source_ids: &[Value],
) -> Result<()> {
    let Some(key) = columns.first() else {
        return Ok(());
    };
    let connection = target.connection();
    for chunk in source_ids.chunks(connection.settings.in_operator_max_size) {
        connection.execute(&WriteStatement::Update(UpdateStatement {
            table: table.to_string(),
            assignments: columns.iter().map(|c| (c.clone(), Value::Null)).collect(),
            criteria: Criteria::In(ColumnRef::bare(key), chunk.to_vec()),
        }))?;
    }
    Ok(())
}

/// Rejects writes of sources whose relation is unset, before any statement is sent.
pub(crate) fn add_mandatory_check(
    listeners: &ListenerPipeline,
    source: &SourceInfo,
    accessor: &PropertyAccessor,
    present: fn(&PropertyAccessor, &EntityRef) -> bool,
) {
    let check = {
        let class = source.class.clone();
        let accessor = accessor.clone();
        move |entity: &EntityRef| -> Result<()> {
            if present(&accessor, entity) {
                return Ok(());
            }
            Err(MappingError::RelationMandatoryViolation {
                class: class.to_string(),
                property: accessor.definition(),
            })
        }
    };
    let name = source.listener_name(accessor, "mandatory");

    let on_insert = check.clone();
    listeners.on_entities(Stage::BeforeInsert, &name, Priority::Check, move |entities, _| {
        entities.iter().try_for_each(&on_insert)
    });
    let on_update = check.clone();
    listeners.on_update(Stage::BeforeUpdate, &name, Priority::Check, move |pairs, _, _| {
        pairs.iter().try_for_each(|pair| on_update(&pair.modified))
    });
    listeners.on_entities(Stage::BeforeUpdateById, &name, Priority::Check, move |entities, _| {
        entities.iter().try_for_each(&check)
    });
}

pub(crate) fn has_reference(accessor: &PropertyAccessor, entity: &EntityRef) -> bool {
    accessor.get_reference(entity).is_some()
}

pub(crate) fn has_collection(accessor: &PropertyAccessor, entity: &EntityRef) -> bool {
    accessor.get_collection(entity).is_some()
}

/// Entities of `entities` once each, in first-seen order.
pub(crate) fn distinct(entities: impl IntoIterator<Item = EntityRef>) -> Vec<EntityRef> {
    let mut seen = HashSet::new();
    entities.into_iter().filter(|e| seen.insert(e.key())).collect()
}

/// Sets the reference of the source, and the back reference of the target when mapped.
pub(crate) struct ReferenceFixer {
    pub accessor: PropertyAccessor,
    pub reverse: Option<PropertyAccessor>,
}

impl RelationFixer for ReferenceFixer {
    fn fix(&self, source: &EntityRef, target: &EntityRef, _row: &RowView<'_>, _state: &mut InflationState) -> Result<()> {
        self.accessor.set_reference(source, Some(target.clone()));
        if let Some(reverse) = &self.reverse {
            reverse.set_reference(target, Some(source.clone()));
        }
        Ok(())
    }
}

/// Collects the targets of a collection, at the position read from `index` when mapped.
pub(crate) struct MembersFixer {
    pub accessor: PropertyAccessor,
    pub reverse: Option<PropertyAccessor>,
    pub index: Option<ColumnRef>,
}

impl RelationFixer for MembersFixer {
    fn on_source(&self, source: &EntityRef, state: &mut InflationState) {
        state.init_members(source, &self.accessor);
    }

    fn fix(&self, source: &EntityRef, target: &EntityRef, row: &RowView<'_>, state: &mut InflationState) -> Result<()> {
        let index = match &self.index {
            Some(column) => row.index(&column.alias, &column.column)?,
            None => None,
        };
        state.add_member(source, &self.accessor, target, index);
        if let Some(reverse) = &self.reverse {
            reverse.set_reference(target, Some(source.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instance;
    use crate::persister::OperationContext;
    use std::collections::HashMap;

    #[test]
    fn test_distinct_keeps_first_occurrence() {
        let a = Instance::new("Item").into_ref();
        let b = Instance::new("Item").into_ref();
        let kept = distinct(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(kept.len(), 2);
        assert!(kept[0].ptr_eq(&a));
        assert!(kept[1].ptr_eq(&b));
    }

    #[test]
    fn test_members_fixer_orders_by_index_and_links_back() {
        let fixer = MembersFixer {
            accessor: PropertyAccessor::new("Playlist", "tracks"),
            reverse: Some(PropertyAccessor::new("Track", "playlist")),
            index: Some(ColumnRef::new("t1", "idx")),
        };
        let positions: HashMap<ColumnRef, usize> = [(ColumnRef::new("t1", "idx"), 0)].into_iter().collect();
        let playlist = Instance::new("Playlist").into_ref();
        let first = Instance::new("Track").with("title", "a").into_ref();
        let second = Instance::new("Track").with("title", "b").into_ref();

        let mut state = InflationState::new();
        fixer.on_source(&playlist, &mut state);
        let row = vec![Value::from(1)];
        fixer
            .fix(&playlist, &second, &RowView::new(&row, &positions), &mut state)
            .unwrap();
        let row = vec![Value::from(0)];
        fixer
            .fix(&playlist, &first, &RowView::new(&row, &positions), &mut state)
            .unwrap();
        state.finish();

        let tracks = playlist.collection("tracks");
        assert_eq!(tracks.len(), 2);
        assert!(tracks[0].ptr_eq(&first));
        assert!(second.reference("playlist").is_some_and(|p| p.ptr_eq(&playlist)));
    }

    #[test]
    fn test_mandatory_check_names_the_relation() {
        let listeners = ListenerPipeline::new();
        let source = SourceInfo {
            class: ClassName::new("Order"),
            id: IdAccess {
                accessor: PropertyAccessor::new("Order", "id"),
                data_type: DataType::Integer,
                policy: crate::config::IdentifierPolicy::Assigned,
                binder: crate::sql::ValueBinder::passthrough(DataType::Integer),
            },
            main_table: "orders".into(),
            primary_key: "id".into(),
            relation_table: "orders".into(),
        };
        add_mandatory_check(&listeners, &source, &PropertyAccessor::new("Order", "customer"), has_reference);

        let order = Instance::new("Order").with("id", 1).into_ref();
        let mut ctx = OperationContext::new();
        let err = listeners
            .fire_entities(Stage::BeforeInsert, &[order], &mut ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            MappingError::RelationMandatoryViolation { ref property, .. } if property == "customer"
        ));
    }
}
