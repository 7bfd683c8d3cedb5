#![allow(dead_code)]

use relmap::config::IdentifierDeclaration;
use relmap::prelude::*;
use std::rc::Rc;

/// A database, the connection persisters write to, and the registry builds commit into.
pub struct Fixture {
    pub database: Rc<MemoryDatabase>,
    pub dialect: Dialect,
    pub connection: ConnectionConfiguration,
    pub registry: PersisterRegistry,
}

impl Fixture {
    pub fn new() -> Self {
        Self::on(MemoryDatabase::new().with_foreign_keys(), PersistenceSettings::default())
    }

    /// Foreign keys are not enforced: rows of a cyclic graph may reference rows inserted later.
    pub fn lenient() -> Self {
        Self::on(MemoryDatabase::new(), PersistenceSettings::default())
    }

    pub fn with_settings(settings: PersistenceSettings) -> Self {
        Self::on(MemoryDatabase::new().with_foreign_keys(), settings)
    }

    fn on(database: MemoryDatabase, settings: PersistenceSettings) -> Self {
        let database = Rc::new(database);
        let connection = ConnectionConfiguration::new(database.clone()).settings(settings);
        Self {
            database,
            dialect: Dialect::default(),
            connection,
            registry: PersisterRegistry::new(),
        }
    }

    /// Builds the persister of `class`, creates the tables and forgets the statements sent so far.
    pub fn build(&mut self, catalog: &ConfigurationCatalog, class: &str) -> Result<Rc<dyn EntityPersister>> {
        let persister = EntityPersisterBuilder::new(catalog, class).build(&self.dialect, &self.connection, &mut self.registry)?;
        self.database.deploy(self.registry.schema())?;
        self.database.clear_log();
        Ok(persister)
    }

    pub fn persister(&self, class: &str) -> Result<Rc<dyn EntityPersister>> {
        self.registry.persister(class)
    }

    /// Statements sent to `table`, of `kind`.
    pub fn count_on(&self, table: &str, kind: StatementKind) -> usize {
        self.database
            .statements()
            .iter()
            .filter(|s| s.table == table && s.kind == kind)
            .count()
    }

    pub fn tables_written(&self) -> Vec<String> {
        self.database
            .statements()
            .into_iter()
            .filter(|s| s.kind != StatementKind::Select)
            .map(|s| s.table)
            .collect()
    }
}

pub fn assigned_id() -> IdentifierDeclaration {
    IdentifierDeclaration::new("id", DataType::Integer, IdentifierPolicy::Assigned)
}

/// An entity with an assigned integer `id`.
pub fn entity(class: &str) -> EntityMappingConfiguration {
    EntityMappingConfiguration::new(class).identifier(assigned_id())
}

pub fn text(name: &str) -> PropertyLinkage {
    PropertyLinkage::new(name, DataType::Text)
}

pub fn integer(name: &str) -> PropertyLinkage {
    PropertyLinkage::new(name, DataType::Integer)
}

pub fn sorted(mut values: Vec<Value>) -> Vec<Value> {
    values.sort_by(|a, b| a.compare(b).unwrap_or(std::cmp::Ordering::Equal));
    values
}
