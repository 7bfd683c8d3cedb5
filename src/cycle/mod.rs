//! Relations closing a cycle in the persister graph.
//!
//! Joining them would grow the select tree forever. Their rows are read in two phases: the
//! first select only captures target identifiers, a second select per target class loads
//! them once the first one is over (see [`OperationContext::resolve_deferred`]). Each round
//! reaches one more level of the cycle, so a graph `n` levels deep costs `n` rounds.

use crate::core::{ClassName, RelationId, Result};
use crate::model::{EntityRef, InstanceKey, PropertyAccessor};
use crate::persister::{
    DeferredLink, DeferredRelation, EntityPersister, GraftedEntity, JoinContribution, ListenerPipeline,
    OperationContext, PersisterHandle, Priority, Stage,
};
use crate::select::{InflationState, JoinTree, NodeRole, RowCapture, RowView};
use crate::sql::{ColumnRef, JoinKind, ValueBinder};
use std::collections::HashMap;
use std::rc::Rc;

/// What the second phase sets on the sources.
#[derive(Debug, Clone)]
pub enum DeferredTarget {
    Reference {
        accessor: PropertyAccessor,
        /// Property of the target referencing the source back.
        reverse: Option<PropertyAccessor>,
    },
    Members {
        accessor: PropertyAccessor,
        reverse: Option<PropertyAccessor>,
    },
}

impl DeferredTarget {
    fn accessor(&self) -> &PropertyAccessor {
        match self {
            Self::Reference { accessor, .. } | Self::Members { accessor, .. } => accessor,
        }
    }
}

/// Second phase of one cycling relation.
pub struct TwoPhaseLoader {
    target: PersisterHandle,
    link: DeferredTarget,
}

impl TwoPhaseLoader {
    pub fn new(target: PersisterHandle, link: DeferredTarget) -> Self {
        Self { target, link }
    }
}

impl DeferredRelation for TwoPhaseLoader {
    fn target(&self) -> Result<Rc<dyn EntityPersister>> {
        self.target.get()
    }

    fn link(&self, links: Vec<DeferredLink>, ctx: &OperationContext) -> Result<()> {
        let target = self.target.get()?;
        match &self.link {
            DeferredTarget::Reference { accessor, reverse } => {
                for link in links {
                    let loaded = ctx.cached(target.cache_key(), &link.target_id);
                    if let (Some(reverse), Some(loaded)) = (reverse, &loaded) {
                        reverse.set_reference(loaded, Some(link.source.clone()));
                    }
                    accessor.set_reference(&link.source, loaded);
                }
            }
            DeferredTarget::Members { accessor, reverse } => {
                let mut order: Vec<EntityRef> = Vec::new();
                let mut members: HashMap<InstanceKey, Vec<(Option<i64>, EntityRef)>> = HashMap::new();
                for link in links {
                    let bucket = members.entry(link.source.key()).or_insert_with(|| {
                        order.push(link.source.clone());
                        Vec::new()
                    });
                    let Some(loaded) = ctx.cached(target.cache_key(), &link.target_id) else {
                        continue;
                    };
                    let duplicate = bucket
                        .iter()
                        .any(|(index, member)| member.ptr_eq(&loaded) && *index == link.index);
                    if !duplicate {
                        if let Some(reverse) = reverse {
                            reverse.set_reference(&loaded, Some(link.source.clone()));
                        }
                        bucket.push((link.index, loaded));
                    }
                }
                for source in order {
                    let mut bucket = members.remove(&source.key()).unwrap_or_default();
                    bucket.sort_by_key(|(index, _)| *index);
                    accessor.set_collection(&source, bucket.into_iter().map(|(_, m)| m).collect());
                }
            }
        }
        Ok(())
    }
}

/// Reads the identifier of a target, and its position, from rows of the first phase.
struct KeyCapture {
    relation: RelationId,
    loader: Rc<TwoPhaseLoader>,
    key: ColumnRef,
    binder: ValueBinder,
    index: Option<ColumnRef>,
}

impl RowCapture for KeyCapture {
    fn on_source(&self, source: &EntityRef, state: &mut InflationState) {
        if let DeferredTarget::Members { accessor, .. } = &self.loader.link {
            state.init_members(source, accessor);
        }
    }

    fn capture(
        &self,
        source: &EntityRef,
        row: &RowView<'_>,
        _state: &mut InflationState,
        ctx: &mut OperationContext,
    ) -> Result<()> {
        let stored = row.get(&self.key.alias, &self.key.column)?;
        if stored.is_null() {
            return Ok(());
        }
        let index = match &self.index {
            Some(column) => row.index(&column.alias, &column.column)?,
            None => None,
        };
        let loader: Rc<dyn DeferredRelation> = Rc::clone(&self.loader) as Rc<dyn DeferredRelation>;
        ctx.defer(
            self.relation,
            loader,
            DeferredLink {
                source: source.clone(),
                target_id: self.binder.from_storage(&stored)?,
                index,
            },
        );
        Ok(())
    }
}

/// Where the first phase finds target identifiers.
#[derive(Debug, Clone)]
pub enum CaptureShape {
    /// A foreign key column of the relation table of the source.
    SourceColumn { column: String },
    /// A table joined on the source key: the target table, or an association table.
    Joined {
        table: String,
        source_key: String,
        join_column: String,
        key_column: String,
        index_column: Option<String>,
    },
}

/// Select tree part of a cycling relation: key columns only, no target table.
pub struct CaptureJoin {
    relation: RelationId,
    loader: Rc<TwoPhaseLoader>,
    shape: CaptureShape,
    binder: ValueBinder,
}

impl CaptureJoin {
    pub fn new(relation: RelationId, loader: Rc<TwoPhaseLoader>, shape: CaptureShape, binder: ValueBinder) -> Self {
        Self {
            relation,
            loader,
            shape,
            binder,
        }
    }

    fn capture(&self, key: ColumnRef, index: Option<ColumnRef>) -> NodeRole {
        NodeRole::Capture(Rc::new(KeyCapture {
            relation: self.relation,
            loader: Rc::clone(&self.loader),
            key,
            binder: self.binder.clone(),
            index,
        }))
    }
}

impl JoinContribution for CaptureJoin {
    fn contribute(&self, tree: &mut JoinTree, source: &GraftedEntity, guard: Option<Vec<ClassName>>) -> Result<()> {
        match &self.shape {
            CaptureShape::SourceColumn { column } => {
                let key = tree.select_column(&source.relation_alias, column);
                let role = self.capture(key, None);
                tree.add_virtual(source.node, role, guard);
            }
            CaptureShape::Joined {
                table,
                source_key,
                join_column,
                key_column,
                index_column,
            } => {
                let node = tree.add_join(
                    source.node,
                    table,
                    JoinKind::LeftOuter,
                    vec![(ColumnRef::new(&source.main_alias, source_key), join_column.clone())],
                    NodeRole::Link,
                    guard,
                );
                let alias = tree.alias(node).to_string();
                let key = tree.select_column(&alias, key_column);
                let index = index_column.as_ref().map(|c| tree.select_column(&alias, c));
                let role = self.capture(key, index);
                tree.set_role(node, role);
            }
        }
        Ok(())
    }
}

/// Runs the second phase at the end of every select of the source.
pub fn register_second_phase(listeners: &ListenerPipeline, relation: &DeferredTarget) {
    listeners.on_entities(
        Stage::AfterSelect,
        &format!("{} second phase load", relation.accessor().definition()),
        Priority::Cascade,
        |_, ctx| ctx.resolve_deferred(),
    );
}
