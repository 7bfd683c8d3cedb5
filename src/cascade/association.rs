//! One-to-many relations stored in an association table of (owner, member[, index]) rows.
//!
//! The same table shape stores element collections, whose members are plain values.

use super::{
    MembersFixer, RelationSite, SourceInfo, add_mandatory_check, distinct, handle, has_collection, with_target,
};
use crate::builder::{BuildSession, TableClaim};
use crate::config::{CollectionKind, ConnectionConfiguration, NamingStrategy, OneToManyRelation};
use crate::core::{ClassName, DataType, MappingError, RelationId, Result, Value};
use crate::cycle::{CaptureJoin, CaptureShape, DeferredTarget, TwoPhaseLoader, register_second_phase};
use crate::mapping::{ColumnBinding, add_technical_column};
use crate::model::{EntityRef, PropertyAccessor};
use crate::persister::{
    Duo, EntityPersister, GraftedEntity, JoinContribution, JoinLink, PersisterHandle, Priority, Stage,
};
use crate::schema::{ColumnDefinition, ForeignKeyDefinition};
use crate::select::{JoinTree, NodeRole};
use crate::sql::{ColumnRef, Criteria, DeleteStatement, InsertStatement, JoinKind, WriteStatement};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::{Level, event};

/// One row of an association table, in mapped values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationRecord {
    pub owner: Value,
    pub member: Value,
    pub index: Option<i64>,
}

/// Foreign key of a column of an association table: (target table, target column).
pub type Reference<'r> = Option<(&'r str, &'r str)>;

/// An association table and the statements maintaining it.
#[derive(Debug, Clone)]
pub struct AssociationTable {
    pub table: String,
    pub owner: ColumnBinding,
    pub member: ColumnBinding,
    pub index: Option<ColumnBinding>,
    connection: ConnectionConfiguration,
}

impl AssociationTable {
    /// Creates the table of the relation of `claim`. Its key is (owner, member) for sets and
    /// (owner, index) for lists.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        session: &mut BuildSession<'_>,
        naming: &dyn NamingStrategy,
        claim: TableClaim,
        table: &str,
        owner: (&str, &DataType, Reference<'_>),
        member: (&str, &DataType, Reference<'_>),
        index: Option<&str>,
    ) -> Result<Self> {
        session.claim_table(table, claim)?;
        let binders = session.binders();
        let connection = session.connection().clone();
        let definition = session.schema_mut().table_or_create(table);

        let mut add = |(column, data_type, reference): (&str, &DataType, Reference<'_>), in_key: bool| {
            let mut key = ColumnDefinition::new(column, data_type.clone(), data_type.clone()).not_null();
            if in_key {
                key = key.primary_key();
            }
            let binding = add_technical_column(definition, binders, key)?;
            if let Some((target_table, target_column)) = reference {
                definition.add_foreign_key(ForeignKeyDefinition {
                    name: naming.foreign_key_name(table, column, target_table, target_column),
                    columns: vec![column.to_string()],
                    target_table: target_table.to_string(),
                    target_columns: vec![target_column.to_string()],
                });
            }
            Ok::<_, MappingError>(binding)
        };
        let owner = add(owner, true)?;
        let member = add(member, index.is_none())?;
        let index = match index {
            Some(column) => Some(add((column, &DataType::Integer, None), true)?),
            None => None,
        };
        Ok(Self {
            table: table.to_string(),
            owner,
            member,
            index,
            connection,
        })
    }

    fn storage_row(&self, record: &AssociationRecord) -> Result<Vec<Value>> {
        let mut row = vec![
            self.owner.binder.to_storage(&record.owner)?,
            self.member.binder.to_storage(&record.member)?,
        ];
        if self.index.is_some() {
            row.push(record.index.map(Value::Integer).unwrap_or(Value::Null));
        }
        Ok(row)
    }

    pub fn insert(&self, records: &[AssociationRecord]) -> Result<()> {
        let mut columns = vec![self.owner.column.clone(), self.member.column.clone()];
        if let Some(index) = &self.index {
            columns.push(index.column.clone());
        }
        for chunk in records.chunks(self.connection.settings.batch_size) {
            let rows = chunk
                .iter()
                .map(|r| self.storage_row(r))
                .collect::<Result<Vec<_>>>()?;
            self.connection.execute(&WriteStatement::Insert(InsertStatement {
                table: self.table.clone(),
                columns: columns.clone(),
                rows,
            }))?;
        }
        Ok(())
    }

    pub fn delete(&self, records: &[AssociationRecord]) -> Result<()> {
        for chunk in records.chunks(self.connection.settings.in_operator_max_size) {
            let mut terms = Vec::with_capacity(chunk.len());
            for record in chunk {
                let mut term = vec![
                    Criteria::Eq(ColumnRef::bare(&self.owner.column), self.owner.binder.to_storage(&record.owner)?),
                    Criteria::Eq(ColumnRef::bare(&self.member.column), self.member.binder.to_storage(&record.member)?),
                ];
                if let (Some(index), Some(position)) = (&self.index, record.index) {
                    term.push(Criteria::Eq(ColumnRef::bare(&index.column), Value::Integer(position)));
                }
                terms.push(Criteria::And(term));
            }
            self.connection.execute(&WriteStatement::Delete(DeleteStatement {
                table: self.table.clone(),
                criteria: Criteria::Or(terms),
            }))?;
        }
        Ok(())
    }

    /// Removes every row of the owners of `owners`, given as mapped identifiers.
    pub fn delete_by_owners(&self, owners: &[Value]) -> Result<()> {
        let keys = owners
            .iter()
            .map(|o| self.owner.binder.to_storage(o))
            .collect::<Result<Vec<_>>>()?;
        for chunk in keys.chunks(self.connection.settings.in_operator_max_size) {
            self.connection.execute(&WriteStatement::Delete(DeleteStatement {
                table: self.table.clone(),
                criteria: Criteria::In(ColumnRef::bare(&self.owner.column), chunk.to_vec()),
            }))?;
        }
        Ok(())
    }

    /// Rows to insert and rows to delete to go from `before` to `after`.
    ///
    /// A list member moved to another position is one deletion and one insertion.
    pub fn diff(
        before: &[AssociationRecord],
        after: &[AssociationRecord],
    ) -> (Vec<AssociationRecord>, Vec<AssociationRecord>) {
        let stored: HashSet<&AssociationRecord> = before.iter().collect();
        let wanted: HashSet<&AssociationRecord> = after.iter().collect();
        let added = after.iter().filter(|r| !stored.contains(r)).cloned().collect();
        let removed = before.iter().filter(|r| !wanted.contains(r)).cloned().collect();
        (added, removed)
    }

    /// Apply the delta between `before` and `after`: deletions first.
    pub fn apply(&self, before: &[AssociationRecord], after: &[AssociationRecord]) -> Result<()> {
        let (added, removed) = Self::diff(before, after);
        if !removed.is_empty() {
            self.delete(&removed)?;
        }
        if !added.is_empty() {
            self.insert(&added)?;
        }
        Ok(())
    }
}

/// Records of `members` owned by `owner`, once each; positions are kept for lists.
pub(crate) fn records_of(owner: &Value, members: Vec<Value>, kind: CollectionKind) -> Vec<AssociationRecord> {
    let mut seen = HashSet::new();
    members
        .into_iter()
        .enumerate()
        .map(|(position, member)| AssociationRecord {
            owner: owner.clone(),
            member,
            index: (kind == CollectionKind::List).then_some(position as i64),
        })
        .filter(|record| kind == CollectionKind::List || seen.insert(record.member.clone()))
        .collect()
}

pub(crate) fn configure<'a>(session: &mut BuildSession<'a>, site: &RelationSite, relation: &OneToManyRelation) -> Result<()> {
    let site = site.clone();
    let relation = relation.clone();
    let target = relation.target.clone();
    with_target(session, &target, move |session, target, cycling| {
        wire(session, &site, &relation, target, cycling)
    })
}

struct AssociationJoin {
    target: PersisterHandle,
    association: Rc<AssociationTable>,
    source_key: String,
    accessor: PropertyAccessor,
}

impl JoinContribution for AssociationJoin {
    fn contribute(&self, tree: &mut JoinTree, source: &GraftedEntity, guard: Option<Vec<ClassName>>) -> Result<()> {
        let target = self.target.get()?;
        let link = tree.add_join(
            source.node,
            &self.association.table,
            JoinKind::LeftOuter,
            vec![(
                ColumnRef::new(&source.main_alias, &self.source_key),
                self.association.owner.column.clone(),
            )],
            NodeRole::Link,
            guard.clone(),
        );
        let link_alias = tree.alias(link).to_string();
        let index = self
            .association
            .index
            .as_ref()
            .map(|column| tree.select_column(&link_alias, &column.column));
        target.graft(
            tree,
            Some(JoinLink {
                parent: link,
                kind: JoinKind::LeftOuter,
                on: vec![(
                    ColumnRef::new(&link_alias, &self.association.member.column),
                    target.main_primary_key().to_string(),
                )],
                fixer: Some(Rc::new(MembersFixer {
                    accessor: self.accessor.clone(),
                    reverse: None,
                    index,
                })),
                guard,
            }),
        )?;
        Ok(())
    }
}

/// Identifiers of the members of `source` and the records linking them.
fn current_records(
    target: &dyn EntityPersister,
    members: &PropertyAccessor,
    source: &SourceInfo,
    entity: &EntityRef,
    kind: CollectionKind,
) -> Vec<AssociationRecord> {
    let ids = members
        .get_collection(entity)
        .unwrap_or_default()
        .iter()
        .map(|m| target.id_of(m))
        .collect();
    records_of(&source.id.read(entity), ids, kind)
}

fn wire(
    session: &mut BuildSession<'_>,
    site: &RelationSite,
    relation: &OneToManyRelation,
    target: Rc<dyn EntityPersister>,
    cycling: bool,
) -> Result<()> {
    let source = SourceInfo::of(site.persister.as_ref());
    let accessor = site.accessor(&relation.property);
    let naming = site.naming.as_ref();
    let table = relation
        .association_table
        .clone()
        .unwrap_or_else(|| naming.association_table_name(&source.main_table, &accessor));
    let owner_column = naming.reverse_column_name(&source.main_table, &source.primary_key);
    let mut member_column = naming.association_member_column(target.main_table(), target.main_primary_key());
    if member_column == owner_column {
        member_column = naming.join_column_name(&accessor);
    }
    let index_column = (relation.kind == CollectionKind::List).then(|| {
        relation
            .index_column
            .clone()
            .unwrap_or_else(|| naming.index_column_name(&accessor))
    });
    let association = Rc::new(AssociationTable::create(
        session,
        naming,
        source.claim(&accessor),
        &table,
        (
            &owner_column,
            &source.id.data_type,
            Some((&source.main_table, &source.primary_key)),
        ),
        (
            &member_column,
            &target.id_access().data_type,
            Some((target.main_table(), target.main_primary_key())),
        ),
        index_column.as_deref(),
    )?);
    let relation_id: RelationId = session.allocate_relation();
    let listeners = site.persister.listeners();
    if relation.mandatory {
        add_mandatory_check(listeners, &source, &accessor, has_collection);
    }

    let targets = handle(&target, cycling);
    let kind = relation.kind;
    if !relation.mode.is_read_only() {
        let writes_targets = relation.mode.writes_targets();
        let orphans = relation.mode.removes_orphans();

        let (persister, members, info, links) = (targets.clone(), accessor.clone(), source.clone(), Rc::clone(&association));
        listeners.on_entities(
            Stage::AfterInsert,
            &source.listener_name(&accessor, "insert associations"),
            Priority::Cascade,
            move |entities, ctx| {
                let target = persister.get()?;
                if writes_targets {
                    let new: Vec<EntityRef> =
                        distinct(entities.iter().flat_map(|e| members.get_collection(e).unwrap_or_default()))
                            .into_iter()
                            .filter(|m| target.is_new(m))
                            .collect();
                    target.insert_with(&new, ctx)?;
                }
                let records: Vec<AssociationRecord> = entities
                    .iter()
                    .flat_map(|e| current_records(target.as_ref(), &members, &info, e, kind))
                    .collect();
                links.insert(&records)
            },
        );

        let (persister, members, info, links) = (targets.clone(), accessor.clone(), source.clone(), Rc::clone(&association));
        listeners.on_update(
            Stage::AfterUpdate,
            &source.listener_name(&accessor, "update associations"),
            Priority::Cascade,
            move |pairs, all_columns, ctx| {
                let target = persister.get()?;
                let mut before = Vec::new();
                let mut after = Vec::new();
                let mut new = Vec::new();
                let mut held = Vec::new();
                let mut left = Vec::new();
                let mut kept = HashSet::new();
                for pair in pairs {
                    let current = members.get_collection(&pair.modified).unwrap_or_default();
                    let previous = members.get_collection(&pair.unmodified).unwrap_or_default();
                    let previous_by_id: HashMap<Value, EntityRef> =
                        previous.iter().map(|m| (target.id_of(m), m.clone())).collect();
                    for member in &current {
                        if target.is_new(member) {
                            new.push(member.clone());
                        } else if let Some(stored) = previous_by_id.get(&target.id_of(member)) {
                            held.push(Duo::new(member.clone(), stored.clone()));
                        }
                    }
                    kept.extend(current.iter().filter(|m| !target.is_new(m)).map(|m| target.id_of(m)));
                    left.extend(previous);
                    before.extend(current_records(target.as_ref(), &members, &info, &pair.unmodified, kind));
                    after.push(pair.modified.clone());
                }

                // a member moved to another owner of the batch is no orphan
                let removed: Vec<EntityRef> = left
                    .into_iter()
                    .filter(|m| !kept.contains(&target.id_of(m)))
                    .collect();
                if writes_targets {
                    target.insert_with(&distinct(new), ctx)?;
                    target.update_with(&held, all_columns, ctx)?;
                }
                // member identifiers are known once new members are inserted
                let after: Vec<AssociationRecord> = after
                    .iter()
                    .flat_map(|e| current_records(target.as_ref(), &members, &info, e, kind))
                    .collect();
                links.apply(&before, &after)?;
                if orphans && !removed.is_empty() {
                    event!(Level::DEBUG, count = removed.len(), "deleting members removed from their collection");
                    target.delete_with(&distinct(removed), ctx)?;
                }
                Ok(())
            },
        );

        let (persister, members, info, links) = (targets.clone(), accessor.clone(), source.clone(), Rc::clone(&association));
        listeners.on_entities(
            Stage::BeforeDelete,
            &source.listener_name(&accessor, "delete associations"),
            Priority::Cascade,
            move |entities, ctx| {
                let owners: Vec<Value> = entities.iter().map(|e| info.id.read(e)).collect();
                links.delete_by_owners(&owners)?;
                if orphans {
                    let target = persister.get()?;
                    let owned: Vec<EntityRef> =
                        distinct(entities.iter().flat_map(|e| members.get_collection(e).unwrap_or_default()))
                            .into_iter()
                            .filter(|m| !target.is_new(m))
                            .collect();
                    target.delete_with(&owned, ctx)?;
                }
                Ok(())
            },
        );
    }

    if cycling {
        let link = DeferredTarget::Members {
            accessor: accessor.clone(),
            reverse: None,
        };
        let loader = Rc::new(TwoPhaseLoader::new(targets, link.clone()));
        site.persister.add_join(Rc::new(CaptureJoin::new(
            relation_id,
            loader,
            CaptureShape::Joined {
                table: association.table.clone(),
                source_key: source.primary_key.clone(),
                join_column: association.owner.column.clone(),
                key_column: association.member.column.clone(),
                index_column: association.index.as_ref().map(|i| i.column.clone()),
            },
            association.member.binder.clone(),
        )));
        register_second_phase(listeners, &link);
    } else {
        site.persister.add_join(Rc::new(AssociationJoin {
            target: targets,
            association,
            source_key: source.primary_key,
            accessor,
        }));
    }
    Ok(())
}
