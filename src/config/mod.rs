pub mod connection;
pub mod entity;
pub mod naming;
pub mod polymorphism;
pub mod relation;
pub mod settings;

pub use connection::{ConnectionConfiguration, Dialect};
pub use entity::{
    EmbeddableMappingConfiguration, EntityMappingConfiguration, IdentifierDeclaration,
    IdentifierGenerator, IdentifierPolicy, InheritanceConfiguration, InsetConfiguration,
    PropertyLinkage,
};
pub use naming::{DefaultNamingStrategy, NamingStrategy};
pub use polymorphism::{PolymorphismKind, PolymorphismPolicy, SubEntityConfiguration};
pub use relation::{
    CollectionKind, ElementCollectionRelation, OneToManyRelation, OneToOneRelation, RelationMode,
};
pub use settings::PersistenceSettings;

use crate::core::{ClassName, MappingError, Result};
use std::collections::BTreeMap;
use std::rc::Rc;

/// All entity configurations of a model, by class.
///
/// Relations name their target class and are resolved here, which lets configurations
/// reference each other (or themselves) without owning each other.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationCatalog {
    entities: BTreeMap<ClassName, Rc<EntityMappingConfiguration>>,
}

impl ConfigurationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: EntityMappingConfiguration) -> Rc<EntityMappingConfiguration> {
        let config = Rc::new(config);
        self.register_shared(Rc::clone(&config));
        config
    }

    /// Registers an already shared configuration, typically one used as an inheritance parent.
    pub fn register_shared(&mut self, config: Rc<EntityMappingConfiguration>) {
        self.entities.insert(config.class.clone(), config);
    }

    pub fn with(mut self, config: EntityMappingConfiguration) -> Self {
        self.register(config);
        self
    }

    pub fn get(&self, class: &ClassName) -> Result<Rc<EntityMappingConfiguration>> {
        self.entities
            .get(class)
            .cloned()
            .ok_or_else(|| MappingError::UnknownEntity(class.to_string()))
    }

    pub fn contains(&self, class: &ClassName) -> bool {
        self.entities.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassName> {
        self.entities.keys()
    }

    /// Entity whose polymorphism declares `subtype`, at any nesting depth.
    pub fn hierarchy_of(&self, subtype: &ClassName) -> Option<&ClassName> {
        self.entities
            .values()
            .find(|config| config.polymorphism.as_ref().is_some_and(|policy| policy.declares(subtype)))
            .map(|config| &config.class)
    }
}
