use super::{EntityPersister, WiringCheckpoint};
use crate::core::{ClassName, MappingError, Result};
use crate::schema::Schema;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Persisters built so far and the tables they need.
///
/// A build adds its persisters and tables only when it succeeds.
#[derive(Default)]
pub struct PersisterRegistry {
    persisters: BTreeMap<ClassName, Rc<dyn EntityPersister>>,
    schema: Schema,
    next_relation: u32,
}

impl PersisterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class: &ClassName) -> Option<Rc<dyn EntityPersister>> {
        self.persisters.get(class).cloned()
    }

    pub fn persister(&self, class: impl Into<ClassName>) -> Result<Rc<dyn EntityPersister>> {
        let class = class.into();
        self.get(&class)
            .ok_or_else(|| MappingError::UnknownEntity(format!("no persister was built for {}", class)))
    }

    pub fn contains(&self, class: &ClassName) -> bool {
        self.persisters.contains_key(class)
    }

    pub fn len(&self) -> usize {
        self.persisters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persisters.is_empty()
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassName> {
        self.persisters.keys()
    }

    pub fn persisters(&self) -> impl Iterator<Item = (&ClassName, &Rc<dyn EntityPersister>)> {
        self.persisters.iter()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// First relation id free for the next build.
    pub(crate) fn next_relation(&self) -> u32 {
        self.next_relation
    }

    /// Wiring of every registered persister, for a build to restore when it fails.
    pub(crate) fn checkpoint(&self) -> Vec<(Rc<dyn EntityPersister>, WiringCheckpoint)> {
        self.persisters
            .values()
            .map(|persister| (Rc::clone(persister), persister.checkpoint()))
            .collect()
    }

    pub(crate) fn commit(
        &mut self,
        persisters: BTreeMap<ClassName, Rc<dyn EntityPersister>>,
        schema: Schema,
        next_relation: u32,
    ) {
        self.persisters.extend(persisters);
        self.schema = schema;
        self.next_relation = next_relation;
    }
}
