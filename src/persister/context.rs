use super::EntityPersister;
use crate::core::{ClassName, RelationId, Result, Value};
use crate::model::{EntityRef, InstanceKey};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    UpdateById,
    Delete,
}

/// Key of a value supplied to a shadow column of one target object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProvidedKey {
    pub relation: RelationId,
    pub target: InstanceKey,
    pub column: String,
}

impl ProvidedKey {
    pub fn new(relation: RelationId, target: &EntityRef, column: &str) -> Self {
        Self {
            relation,
            target: target.key(),
            column: column.to_string(),
        }
    }
}

/// A target identifier captured during the first phase of a two-phase load.
#[derive(Debug, Clone)]
pub struct DeferredLink {
    pub source: EntityRef,
    pub target_id: Value,
    pub index: Option<i64>,
}

/// Second phase of a cycling relation: the persister loading the captured targets, and the
/// linking of the loaded targets to their sources.
pub trait DeferredRelation {
    fn target(&self) -> Result<Rc<dyn EntityPersister>>;

    /// Links every captured target; targets are in the identity map of `ctx` by now.
    fn link(&self, links: Vec<DeferredLink>, ctx: &OperationContext) -> Result<()>;
}

struct PendingRelation {
    loader: Rc<dyn DeferredRelation>,
    links: Vec<DeferredLink>,
}

/// State of one top-level persister call, threaded through every cascade it triggers.
#[derive(Default)]
pub struct OperationContext {
    provided: HashMap<ProvidedKey, Value>,
    in_progress: HashSet<(OperationKind, ClassName, InstanceKey)>,
    identity: HashMap<(ClassName, Value), EntityRef>,
    pending: BTreeMap<RelationId, PendingRelation>,
    resolving: bool,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `body` with `entries` available to shadow columns, removing them afterwards
    /// whatever `body` returns.
    pub fn with_foreign_keys<T>(
        &mut self,
        entries: Vec<(ProvidedKey, Value)>,
        body: impl FnOnce(&mut OperationContext) -> Result<T>,
    ) -> Result<T> {
        let keys: Vec<ProvidedKey> = entries.iter().map(|(k, _)| k.clone()).collect();
        let mut shadowed = Vec::new();
        for (key, value) in entries {
            if let Some(previous) = self.provided.insert(key.clone(), value) {
                shadowed.push((key, previous));
            }
        }
        let result = body(self);
        for key in &keys {
            self.provided.remove(key);
        }
        self.provided.extend(shadowed);
        result
    }

    pub fn provided(&self, relation: RelationId, target: &EntityRef, column: &str) -> Option<Value> {
        self.provided
            .get(&ProvidedKey::new(relation, target, column))
            .cloned()
    }

    pub fn provided_count(&self) -> usize {
        self.provided.len()
    }

    /// Runs `body` on the entities not already going through `kind` of the persister `scope`
    /// in this call.
    ///
    /// Object graphs may be cyclic: an entity reached again by its own cascade is skipped.
    pub fn guarded<T: Default>(
        &mut self,
        kind: OperationKind,
        scope: &ClassName,
        entities: &[EntityRef],
        body: impl FnOnce(&mut OperationContext, &[EntityRef]) -> Result<T>,
    ) -> Result<T> {
        let mut entered = Vec::new();
        for entity in entities {
            if self.in_progress.insert((kind, scope.clone(), entity.key())) {
                entered.push(entity.clone());
            }
        }
        if entered.is_empty() {
            return Ok(T::default());
        }
        let result = body(self, &entered);
        for entity in &entered {
            self.in_progress.remove(&(kind, scope.clone(), entity.key()));
        }
        result
    }

    pub fn is_in_progress(&self, kind: OperationKind, scope: &ClassName, entity: &EntityRef) -> bool {
        self.in_progress.contains(&(kind, scope.clone(), entity.key()))
    }

    pub fn cached(&self, cache_key: &ClassName, id: &Value) -> Option<EntityRef> {
        self.identity.get(&(cache_key.clone(), id.clone())).cloned()
    }

    pub fn cache(&mut self, cache_key: &ClassName, id: Value, entity: EntityRef) {
        self.identity.insert((cache_key.clone(), id), entity);
    }

    pub fn defer(&mut self, relation: RelationId, loader: Rc<dyn DeferredRelation>, link: DeferredLink) {
        self.pending
            .entry(relation)
            .or_insert_with(|| PendingRelation {
                loader,
                links: Vec::new(),
            })
            .links
            .push(link);
    }

    pub fn has_deferred(&self) -> bool {
        !self.pending.is_empty()
    }

    fn take_deferred(&mut self) -> Vec<(RelationId, Rc<dyn DeferredRelation>, Vec<DeferredLink>)> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(relation, pending)| (relation, pending.loader, pending.links))
            .collect()
    }

    /// Second phase of every pending cycling relation, repeated until nothing is pending.
    ///
    /// Each round issues one select per target class, whatever the number of relations and
    /// sources pointing to it. Targets loaded by a round capture the next level, so the
    /// number of rounds is the depth of the loaded graph. A call made while a resolution is
    /// running returns at once: the running one picks up what was captured meanwhile.
    pub fn resolve_deferred(&mut self) -> Result<()> {
        if self.resolving {
            return Ok(());
        }
        self.resolving = true;
        let result = self.resolve_rounds();
        self.resolving = false;
        result
    }

    fn resolve_rounds(&mut self) -> Result<()> {
        while self.has_deferred() {
            let round = self.take_deferred();
            let mut targets: BTreeMap<ClassName, (Rc<dyn EntityPersister>, Vec<Value>, HashSet<Value>)> =
                BTreeMap::new();
            for (_, loader, links) in &round {
                let target = loader.target()?;
                let key = target.cache_key().clone();
                let (_, missing, seen) = targets
                    .entry(key.clone())
                    .or_insert_with(|| (Rc::clone(&target), Vec::new(), HashSet::new()));
                for link in links {
                    if self.cached(&key, &link.target_id).is_none() && seen.insert(link.target_id.clone()) {
                        missing.push(link.target_id.clone());
                    }
                }
            }
            for (class, (target, missing, _)) in targets {
                if missing.is_empty() {
                    continue;
                }
                event!(Level::DEBUG, class = %class, ids = missing.len(), "second phase select");
                target.select_with(&missing, self)?;
            }
            for (relation, loader, links) in round {
                event!(Level::DEBUG, relation = %relation, links = links.len(), "linking deferred targets");
                loader.link(links, self)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MappingError;
    use crate::model::Instance;

    #[test]
    fn test_foreign_keys_released_on_error() {
        let mut ctx = OperationContext::new();
        let target = Instance::new("Address").into_ref();
        let key = ProvidedKey::new(RelationId(1), &target, "person_id");
        let result: Result<()> = ctx.with_foreign_keys(vec![(key, Value::from(7))], |ctx| {
            assert_eq!(ctx.provided(RelationId(1), &target, "person_id"), Some(Value::from(7)));
            Err(MappingError::ExecutionError("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(ctx.provided_count(), 0);
    }

    #[test]
    fn test_nested_scopes_restore_outer_value() {
        let mut ctx = OperationContext::new();
        let target = Instance::new("Address").into_ref();
        let key = ProvidedKey::new(RelationId(1), &target, "person_id");
        ctx.with_foreign_keys(vec![(key.clone(), Value::from(1))], |ctx| {
            ctx.with_foreign_keys(vec![(key.clone(), Value::from(2))], |ctx| {
                assert_eq!(ctx.provided(RelationId(1), &target, "person_id"), Some(Value::from(2)));
                Ok(())
            })?;
            assert_eq!(ctx.provided(RelationId(1), &target, "person_id"), Some(Value::from(1)));
            Ok(())
        })
        .unwrap();
        assert_eq!(ctx.provided_count(), 0);
    }

    #[test]
    fn test_guard_skips_reentrant_entities() {
        let mut ctx = OperationContext::new();
        let node = Instance::new("Node").into_ref();
        let scope = ClassName::new("Node");
        let visits = ctx
            .guarded(OperationKind::Insert, &scope, &[node.clone()], |ctx, entered| {
                let nested = ctx.guarded(OperationKind::Insert, &scope, &[node.clone()], |_, again| {
                    Ok(again.len())
                })?;
                Ok(entered.len() + nested)
            })
            .unwrap();
        assert_eq!(visits, 1);
        assert!(!ctx.is_in_progress(OperationKind::Insert, &scope, &node));
    }
}
