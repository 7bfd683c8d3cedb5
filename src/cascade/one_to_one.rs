use super::{
    ReferenceFixer, RelationSite, SourceInfo, add_foreign_key_column, add_mandatory_check, distinct, handle,
    has_reference, nullify_references, with_target,
};
use crate::builder::BuildSession;
use crate::config::{OneToOneRelation, RelationMode};
use crate::core::{ClassName, MappingError, RelationId, Result, Value};
use crate::cycle::{CaptureJoin, CaptureShape, DeferredTarget, TwoPhaseLoader, register_second_phase};
use crate::model::{EntityRef, PropertyAccessor};
use crate::persister::simple::EntityValue;
use crate::persister::{
    DerivedColumn, Duo, EntityPersister, GraftedEntity, JoinContribution, JoinLink, OperationContext,
    PersisterHandle, Priority, ProvidedKey, Stage,
};
use crate::select::{JoinTree, RelationFixer};
use crate::sql::{ColumnRef, JoinKind};
use std::rc::Rc;
use tracing::{Level, event};

pub(crate) fn configure<'a>(session: &mut BuildSession<'a>, site: &RelationSite, relation: &OneToOneRelation) -> Result<()> {
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
        if relation.owned_by_target() {
            wire_target_owned(session, &site, &relation, target, cycling)
        } else {
            wire_source_owned(session, &site, &relation, target, cycling)
        }
    })
}

/// Reads the target of a reference through its foreign key in the relation table of the source.
struct ReferenceJoin {
    target: PersisterHandle,
    /// Column of the source, on its relation table when `on_relation_table`, else on its main table.
    source_column: String,
    on_relation_table: bool,
    /// Column of the main table of the target; its primary key when `None`.
    target_column: Option<String>,
    fixer: Rc<ReferenceFixer>,
}

impl JoinContribution for ReferenceJoin {
    fn contribute(&self, tree: &mut JoinTree, source: &GraftedEntity, guard: Option<Vec<ClassName>>) -> Result<()> {
        let target = self.target.get()?;
        let alias = if self.on_relation_table {
            &source.relation_alias
        } else {
            &source.main_alias
        };
        let target_column = self
            .target_column
            .clone()
            .unwrap_or_else(|| target.main_primary_key().to_string());
        target.graft(
            tree,
            Some(JoinLink {
                parent: source.node,
                kind: JoinKind::LeftOuter,
                on: vec![(ColumnRef::new(alias, &self.source_column), target_column)],
                fixer: Some(Rc::clone(&self.fixer) as Rc<dyn RelationFixer>),
                guard,
            }),
        )?;
        Ok(())
    }
}

/// The source table holds the foreign key: targets are written before their sources.
fn wire_source_owned(
    session: &mut BuildSession<'_>,
    site: &RelationSite,
    relation: &OneToOneRelation,
    target: Rc<dyn EntityPersister>,
    cycling: bool,
) -> Result<()> {
    let source = SourceInfo::of(site.persister.as_ref());
    let accessor = site.accessor(&relation.property);
    let column = relation
        .column
        .clone()
        .unwrap_or_else(|| site.naming.join_column_name(&accessor));
    let binding = add_foreign_key_column(
        session,
        &source.relation_table,
        &column,
        &target.id_access().data_type,
        target.main_table(),
        target.main_primary_key(),
        site.naming.as_ref(),
        relation.nullable,
    )?;
    let relation_id = session.allocate_relation();
    let listeners = site.persister.listeners();
    if !relation.nullable {
        add_mandatory_check(listeners, &source, &accessor, has_reference);
    }

    if !relation.mode.is_read_only() {
        let target_id = target.id_access().clone();
        let reference = accessor.clone();
        site.persister.add_derived_column(
            &source.relation_table,
            DerivedColumn::computed(binding.clone(), move |entity| {
                Ok(reference
                    .get_reference(entity)
                    .map(|t| target_id.read(&t))
                    .unwrap_or(Value::Null))
            }),
        )?;
    }

    let targets = handle(&target, cycling);
    if relation.mode.writes_targets() {
        let (persister, reference) = (targets.clone(), accessor.clone());
        listeners.on_entities(
            Stage::BeforeInsert,
            &source.listener_name(&accessor, "insert target"),
            Priority::Cascade,
            move |entities, ctx| insert_new_targets(&persister, &reference, entities, ctx),
        );
        let (persister, reference) = (targets.clone(), accessor.clone());
        listeners.on_update(
            Stage::BeforeUpdate,
            &source.listener_name(&accessor, "insert target"),
            Priority::Cascade,
            move |pairs, _, ctx| {
                let modified: Vec<EntityRef> = pairs.iter().map(|p| p.modified.clone()).collect();
                insert_new_targets(&persister, &reference, &modified, ctx)
            },
        );
        let (persister, reference) = (targets.clone(), accessor.clone());
        let orphans = relation.mode.removes_orphans();
        listeners.on_update(
            Stage::AfterUpdate,
            &source.listener_name(&accessor, "update target"),
            Priority::Cascade,
            move |pairs, all_columns, ctx| {
                let target = persister.get()?;
                let mut held = Vec::new();
                let mut detached = Vec::new();
                for pair in pairs {
                    let current = reference.get_reference(&pair.modified);
                    let previous = reference.get_reference(&pair.unmodified);
                    match (current, previous) {
                        (Some(current), Some(previous))
                            if !target.is_new(&current) && target.id_of(&current) == target.id_of(&previous) =>
                        {
                            held.push(Duo::new(current, previous));
                        }
                        (_, Some(previous)) => detached.push(previous),
                        _ => {}
                    }
                }
                target.update_with(&held, all_columns, ctx)?;
                if orphans && !detached.is_empty() {
                    event!(Level::DEBUG, count = detached.len(), "deleting detached targets");
                    target.delete_with(&distinct(detached), ctx)?;
                }
                Ok(())
            },
        );
        if orphans {
            let (persister, reference) = (targets.clone(), accessor.clone());
            listeners.on_entities(
                Stage::AfterDelete,
                &source.listener_name(&accessor, "delete orphan"),
                Priority::Cascade,
                move |entities, ctx| {
                    let target = persister.get()?;
                    let orphans = distinct(entities.iter().filter_map(|e| reference.get_reference(e)))
                        .into_iter()
                        .filter(|t| !target.is_new(t))
                        .collect::<Vec<_>>();
                    target.delete_with(&orphans, ctx)
                },
            );
        }
    }

    if cycling {
        let link = DeferredTarget::Reference {
            accessor: accessor.clone(),
            reverse: None,
        };
        let loader = Rc::new(TwoPhaseLoader::new(targets, link.clone()));
        site.persister.add_join(Rc::new(CaptureJoin::new(
            relation_id,
            loader,
            CaptureShape::SourceColumn { column },
            binding.binder,
        )));
        register_second_phase(listeners, &link);
    } else {
        site.persister.add_join(Rc::new(ReferenceJoin {
            target: targets,
            source_column: column,
            on_relation_table: true,
            target_column: None,
            fixer: Rc::new(ReferenceFixer {
                accessor,
                reverse: None,
            }),
        }));
    }
    Ok(())
}

fn insert_new_targets(
    persister: &PersisterHandle,
    reference: &PropertyAccessor,
    sources: &[EntityRef],
    ctx: &mut OperationContext,
) -> Result<()> {
    let target = persister.get()?;
    let new: Vec<EntityRef> = distinct(sources.iter().filter_map(|e| reference.get_reference(e)))
        .into_iter()
        .filter(|t| target.is_new(t))
        .collect();
    if new.is_empty() {
        return Ok(());
    }
    target.insert_with(&new, ctx)
}

/// Foreign key entries giving each target the identifier of its source.
fn provided_keys(
    relation: RelationId,
    column: &str,
    source: &SourceInfo,
    links: &[(EntityRef, EntityRef)],
) -> Vec<(ProvidedKey, Value)> {
    links
        .iter()
        .map(|(owner, target)| (ProvidedKey::new(relation, target, column), source.id.read(owner)))
        .collect()
}

/// The target table holds the foreign key: targets are written after their sources, with the
/// source identifier supplied through the operation context.
fn wire_target_owned(
    session: &mut BuildSession<'_>,
    site: &RelationSite,
    relation: &OneToOneRelation,
    target: Rc<dyn EntityPersister>,
    cycling: bool,
) -> Result<()> {
    let source = SourceInfo::of(site.persister.as_ref());
    let accessor = site.accessor(&relation.property);
    let reverse = relation
        .reverse
        .as_ref()
        .map(|property| PropertyAccessor::new(target.class_name().clone(), property));
    let column = match (&relation.reverse_column, &reverse) {
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
        &column,
        &source.id.data_type,
        &source.main_table,
        &source.primary_key,
        site.naming.as_ref(),
        true,
    )?;
    let relation_id = session.allocate_relation();
    let listeners = site.persister.listeners();
    if !relation.nullable {
        add_mandatory_check(listeners, &source, &accessor, has_reference);
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
        target.add_derived_column(&target_table, DerivedColumn::provided(binding.clone(), relation_id, fallback))?;
    }

    let targets = handle(&target, cycling);
    if relation.mode.writes_targets() {
        let (persister, reference, info, fk) = (targets.clone(), accessor.clone(), source.clone(), column.clone());
        listeners.on_entities(
            Stage::AfterInsert,
            &source.listener_name(&accessor, "insert target"),
            Priority::Cascade,
            move |entities, ctx| {
                let target = persister.get()?;
                let links: Vec<(EntityRef, EntityRef)> = entities
                    .iter()
                    .filter_map(|e| reference.get_reference(e).map(|t| (e.clone(), t)))
                    .collect();
                if links.is_empty() {
                    return Ok(());
                }
                let (new, existing): (Vec<EntityRef>, Vec<EntityRef>) =
                    distinct(links.iter().map(|(_, t)| t.clone()))
                        .into_iter()
                        .partition(|t| target.is_new(t));
                ctx.with_foreign_keys(provided_keys(relation_id, &fk, &info, &links), |ctx| {
                    target.insert_with(&new, ctx)?;
                    target.update_by_id_with(&existing, ctx)
                })
            },
        );

        let (persister, reference, info, fk) = (targets.clone(), accessor.clone(), source.clone(), column.clone());
        let orphans = relation.mode.removes_orphans();
        listeners.on_update(
            Stage::AfterUpdate,
            &source.listener_name(&accessor, "update target"),
            Priority::Cascade,
            move |pairs, all_columns, ctx| {
                let target = persister.get()?;
                let mut links = Vec::new();
                let mut detached = Vec::new();
                let mut held = Vec::new();
                let mut new = Vec::new();
                let mut reassigned = Vec::new();
                for pair in pairs {
                    let current = reference.get_reference(&pair.modified);
                    let previous = reference.get_reference(&pair.unmodified);
                    let same = match (&current, &previous) {
                        (Some(c), Some(p)) => !target.is_new(c) && target.id_of(c) == target.id_of(p),
                        _ => false,
                    };
                    if let (Some(previous), false) = (&previous, same) {
                        detached.push(previous.clone());
                    }
                    let Some(current) = current else {
                        continue;
                    };
                    links.push((pair.modified.clone(), current.clone()));
                    match previous {
                        Some(previous) if same => held.push(Duo::new(current, previous)),
                        _ if target.is_new(&current) => new.push(current),
                        _ => reassigned.push(current),
                    }
                }

                // detach first: the new target may take over a unique key of the old one
                if !detached.is_empty() {
                    let detached = distinct(detached);
                    if orphans {
                        target.delete_with(&detached, ctx)?;
                    } else {
                        let cleared = detached
                            .iter()
                            .map(|t| (ProvidedKey::new(relation_id, t, &fk), Value::Null))
                            .collect();
                        ctx.with_foreign_keys(cleared, |ctx| target.update_by_id_with(&detached, ctx))?;
                    }
                }
                ctx.with_foreign_keys(provided_keys(relation_id, &fk, &info, &links), |ctx| {
                    target.insert_with(&distinct(new), ctx)?;
                    target.update_with(&held, all_columns, ctx)?;
                    target.update_by_id_with(&distinct(reassigned), ctx)
                })
            },
        );
    }
    if !relation.mode.is_read_only() {
        let (persister, reference, info, fk) = (targets.clone(), accessor.clone(), source.clone(), column.clone());
        let orphans = relation.mode.removes_orphans();
        let table = target_table.clone();
        listeners.on_entities(
            Stage::BeforeDelete,
            &source.listener_name(&accessor, "detach target"),
            Priority::Cascade,
            move |entities, ctx| {
                let target = persister.get()?;
                if orphans {
                    let owned: Vec<EntityRef> = distinct(entities.iter().filter_map(|e| reference.get_reference(e)))
                        .into_iter()
                        .filter(|t| !target.is_new(t))
                        .collect();
                    target.delete_with(&owned, ctx)
                } else {
                    nullify_references(target.as_ref(), &table, &[fk.clone()], &info.storage_ids(entities)?)
                }
            },
        );
    }

    if cycling {
        let link = DeferredTarget::Reference {
            accessor: accessor.clone(),
            reverse: reverse.clone(),
        };
        let loader = Rc::new(TwoPhaseLoader::new(targets, link.clone()));
        site.persister.add_join(Rc::new(CaptureJoin::new(
            relation_id,
            loader,
            CaptureShape::Joined {
                table: target_table,
                source_key: source.primary_key.clone(),
                join_column: column,
                key_column: target.main_primary_key().to_string(),
                index_column: None,
            },
            target.id_access().binder.clone(),
        )));
        register_second_phase(listeners, &link);
    } else {
        site.persister.add_join(Rc::new(ReferenceJoin {
            target: targets,
            source_column: source.primary_key.clone(),
            on_relation_table: false,
            target_column: Some(column),
            fixer: Rc::new(ReferenceFixer { accessor, reverse }),
        }));
    }
    Ok(())
}
