//! One-to-many relations whose target table holds the foreign key back to the source.

use super::{
    MembersFixer, RelationSite, SourceInfo, add_foreign_key_column, add_index_column, add_mandatory_check, distinct,
    handle, has_collection, nullify_references, with_target,
};
use crate::builder::BuildSession;
use crate::config::{CollectionKind, OneToManyRelation, RelationMode};
use crate::core::{ClassName, MappingError, RelationId, Result, Value};
use crate::cycle::{CaptureJoin, CaptureShape, DeferredTarget, TwoPhaseLoader, register_second_phase};
use crate::model::{EntityRef, PropertyAccessor};
use crate::persister::simple::EntityValue;
use crate::persister::{
    DerivedColumn, Duo, EntityPersister, GraftedEntity, JoinContribution, JoinLink, PersisterHandle, Priority,
    ProvidedKey, Stage,
};
use crate::select::JoinTree;
use crate::sql::{ColumnRef, JoinKind};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::{Level, event};

pub(crate) fn configure<'a>(session: &mut BuildSession<'a>, site: &RelationSite, relation: &OneToManyRelation) -> Result<()> {
    if relation.mode == RelationMode::AssociationOnly {
        return Err(MappingError::InvalidConfiguration(format!(
            "{}.{}: association-only mode needs an association table",
            site.owner, relation.property
        )));
    }
    let site = site.clone();
    let relation = relation.clone();
    let target = relation.target.clone();
    with_target(session, &target, move |session, target, cycling| {
        wire(session, &site, &relation, target, cycling)
    })
}

/// Shadow columns of the target: the source key, and the position for lists.
#[derive(Clone)]
struct ReverseColumns {
    relation: RelationId,
    foreign_key: String,
    index: Option<String>,
}

impl ReverseColumns {
    /// Entries placing every member of `members` under `owner`.
    fn entries(&self, owner: &Value, members: &[EntityRef]) -> Vec<(ProvidedKey, Value)> {
        let mut entries = Vec::with_capacity(members.len() * 2);
        for (position, member) in members.iter().enumerate() {
            entries.push((ProvidedKey::new(self.relation, member, &self.foreign_key), owner.clone()));
            if let Some(index) = &self.index {
                entries.push((ProvidedKey::new(self.relation, member, index), Value::Integer(position as i64)));
            }
        }
        entries
    }

    fn cleared(&self, members: &[EntityRef]) -> Vec<(ProvidedKey, Value)> {
        let mut entries = Vec::with_capacity(members.len() * 2);
        for member in members {
            entries.push((ProvidedKey::new(self.relation, member, &self.foreign_key), Value::Null));
            if let Some(index) = &self.index {
                entries.push((ProvidedKey::new(self.relation, member, index), Value::Null));
            }
        }
        entries
    }

    fn columns(&self) -> Vec<String> {
        let mut columns = vec![self.foreign_key.clone()];
        columns.extend(self.index.clone());
        columns
    }
}

struct MembersJoin {
    target: PersisterHandle,
    source_key: String,
    foreign_key: String,
    index: Option<String>,
    accessor: PropertyAccessor,
    reverse: Option<PropertyAccessor>,
}

impl JoinContribution for MembersJoin {
    fn contribute(&self, tree: &mut JoinTree, source: &GraftedEntity, guard: Option<Vec<ClassName>>) -> Result<()> {
        let target = self.target.get()?;
        let grafted = target.graft(
            tree,
            Some(JoinLink {
                parent: source.node,
                kind: JoinKind::LeftOuter,
                on: vec![(ColumnRef::new(&source.main_alias, &self.source_key), self.foreign_key.clone())],
                fixer: None,
                guard,
            }),
        )?;
        let index = self
            .index
            .as_ref()
            .map(|column| tree.select_column(&grafted.main_alias, column));
        tree.set_fixer(
            grafted.node,
            Rc::new(MembersFixer {
                accessor: self.accessor.clone(),
                reverse: self.reverse.clone(),
                index,
            }),
        );
        Ok(())
    }
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
    let reverse = relation
        .reverse
        .as_ref()
        .map(|property| PropertyAccessor::new(target.class_name().clone(), property));
    let foreign_key = match (&relation.reverse_column, &reverse) {
        (Some(column), _) => column.clone(),
        (None, Some(reverse)) => site.naming.join_column_name(reverse),
        (None, None) => site
            .naming
            .reverse_column_name(&source.main_table, &source.primary_key),
    };
    let target_table = target.main_table().to_string();
    let binding = add_foreign_key_column(
        session,
        &target_table,
        &foreign_key,
        &source.id.data_type,
        &source.main_table,
        &source.primary_key,
        site.naming.as_ref(),
        true,
    )?;
    let index = match relation.kind {
        CollectionKind::List => {
            let column = relation
                .index_column
                .clone()
                .unwrap_or_else(|| site.naming.index_column_name(&accessor));
            Some(add_index_column(session, &target_table, &column)?)
        }
        CollectionKind::Set => None,
    };
    let columns = ReverseColumns {
        relation: session.allocate_relation(),
        foreign_key: foreign_key.clone(),
        index: index.as_ref().map(|b| b.column.clone()),
    };
    let listeners = site.persister.listeners();
    if relation.mandatory {
        add_mandatory_check(listeners, &source, &accessor, has_collection);
    }

    if !relation.mode.is_read_only() {
        let fallback = reverse.clone().map(|back| {
            let source_id = source.id.clone();
            Rc::new(move |entity: &EntityRef| -> Result<Value> {
                Ok(back
                    .get_reference(entity)
                    .map(|owner| source_id.read(&owner))
                    .unwrap_or(Value::Null))
            }) as EntityValue
        });
        target.add_derived_column(
            &target_table,
            DerivedColumn::provided(binding.clone(), columns.relation, fallback),
        )?;
        if let Some(index) = index {
            target.add_derived_column(&target_table, DerivedColumn::provided(index, columns.relation, None))?;
        }
    }

    let targets = handle(&target, cycling);
    if relation.mode.writes_targets() {
        let (persister, members, info, shadow) = (targets.clone(), accessor.clone(), source.clone(), columns.clone());
        listeners.on_entities(
            Stage::AfterInsert,
            &source.listener_name(&accessor, "insert members"),
            Priority::Cascade,
            move |entities, ctx| {
                let target = persister.get()?;
                let mut entries = Vec::new();
                let mut all = Vec::new();
                for entity in entities {
                    let collection = members.get_collection(entity).unwrap_or_default();
                    entries.extend(shadow.entries(&info.id.read(entity), &collection));
                    all.extend(collection);
                }
                let (new, existing): (Vec<EntityRef>, Vec<EntityRef>) =
                    distinct(all).into_iter().partition(|m| target.is_new(m));
                ctx.with_foreign_keys(entries, |ctx| {
                    target.insert_with(&new, ctx)?;
                    target.update_by_id_with(&existing, ctx)
                })
            },
        );

        let (persister, members, info, shadow) = (targets.clone(), accessor.clone(), source.clone(), columns.clone());
        let orphans = relation.mode.removes_orphans();
        listeners.on_update(
            Stage::AfterUpdate,
            &source.listener_name(&accessor, "update members"),
            Priority::Cascade,
            move |pairs, all_columns, ctx| {
                let target = persister.get()?;
                let mut entries = Vec::new();
                let mut left = Vec::new();
                let mut held = Vec::new();
                let mut new = Vec::new();
                let mut moved_in = Vec::new();
                // members of any collection of the batch: one moved between two owners stays
                let mut kept = HashSet::new();
                for pair in pairs {
                    let current = members.get_collection(&pair.modified).unwrap_or_default();
                    let previous = members.get_collection(&pair.unmodified).unwrap_or_default();
                    let previous_by_id: HashMap<Value, EntityRef> =
                        previous.iter().map(|m| (target.id_of(m), m.clone())).collect();
                    for member in &current {
                        if target.is_new(member) {
                            new.push(member.clone());
                            continue;
                        }
                        let id = target.id_of(member);
                        match previous_by_id.get(&id) {
                            Some(stored) => held.push(Duo::new(member.clone(), stored.clone())),
                            None => moved_in.push(member.clone()),
                        }
                        kept.insert(id);
                    }
                    left.extend(previous);
                    entries.extend(shadow.entries(&info.id.read(&pair.modified), &current));
                }
                let removed: Vec<EntityRef> = left
                    .into_iter()
                    .filter(|m| !kept.contains(&target.id_of(m)))
                    .collect();

                if !removed.is_empty() {
                    let removed = distinct(removed);
                    event!(Level::DEBUG, count = removed.len(), orphans, "members left their collection");
                    if orphans {
                        target.delete_with(&removed, ctx)?;
                    } else {
                        ctx.with_foreign_keys(shadow.cleared(&removed), |ctx| {
                            target.update_by_id_with(&removed, ctx)
                        })?;
                    }
                }
                ctx.with_foreign_keys(entries, |ctx| {
                    target.update_with(&held, all_columns, ctx)?;
                    target.insert_with(&distinct(new), ctx)?;
                    target.update_by_id_with(&distinct(moved_in), ctx)
                })
            },
        );
    }
    if !relation.mode.is_read_only() {
        let (persister, members, info, shadow) = (targets.clone(), accessor.clone(), source.clone(), columns.clone());
        let orphans = relation.mode.removes_orphans();
        let table = target_table.clone();
        listeners.on_entities(
            Stage::BeforeDelete,
            &source.listener_name(&accessor, "detach members"),
            Priority::Cascade,
            move |entities, ctx| {
                let target = persister.get()?;
                if orphans {
                    let owned: Vec<EntityRef> =
                        distinct(entities.iter().flat_map(|e| members.get_collection(e).unwrap_or_default()))
                            .into_iter()
                            .filter(|m| !target.is_new(m))
                            .collect();
                    target.delete_with(&owned, ctx)
                } else {
                    nullify_references(target.as_ref(), &table, &shadow.columns(), &info.storage_ids(entities)?)
                }
            },
        );
    }

    if cycling {
        let link = DeferredTarget::Members {
            accessor: accessor.clone(),
            reverse: reverse.clone(),
        };
        let loader = Rc::new(TwoPhaseLoader::new(targets, link.clone()));
        site.persister.add_join(Rc::new(CaptureJoin::new(
            columns.relation,
            loader,
            CaptureShape::Joined {
                table: target_table,
                source_key: source.primary_key.clone(),
                join_column: foreign_key,
                key_column: target.main_primary_key().to_string(),
                index_column: columns.index.clone(),
            },
            target.id_access().binder.clone(),
        )));
        register_second_phase(listeners, &link);
    } else {
        site.persister.add_join(Rc::new(MembersJoin {
            target: targets,
            source_key: source.primary_key.clone(),
            foreign_key,
            index: columns.index.clone(),
            accessor,
            reverse,
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instance;

    #[test]
    fn test_entries_carry_positions_of_lists() {
        let columns = ReverseColumns {
            relation: RelationId(2),
            foreign_key: "playlist_id".into(),
            index: Some("idx".into()),
        };
        let tracks = vec![Instance::new("Track").into_ref(), Instance::new("Track").into_ref()];
        let entries = columns.entries(&Value::from(7), &tracks);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].0, ProvidedKey::new(RelationId(2), &tracks[0], "idx"));
        assert_eq!(entries[3].1, Value::Integer(1));
        assert!(columns.cleared(&tracks).iter().all(|(_, v)| v.is_null()));
        assert_eq!(columns.columns(), vec!["playlist_id".to_string(), "idx".to_string()]);
    }
}
