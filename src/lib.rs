// ============================================================================
// relmap Library
// ============================================================================

pub mod builder;
pub mod cascade;
pub mod config;
pub mod core;
pub mod cycle;
pub mod mapping;
pub mod model;
pub mod persister;
pub mod polymorphism;
pub mod prelude;
pub mod schema;
pub mod select;
pub mod sql;
pub mod storage;

// Re-export main types for convenience
pub use builder::EntityPersisterBuilder;
pub use config::{
    CollectionKind, ConfigurationCatalog, ConnectionConfiguration, Dialect, EntityMappingConfiguration,
    PersistenceSettings, PolymorphismPolicy, RelationMode, SubEntityConfiguration,
};
pub use core::{ClassName, DataType, MappingError, Result, Value};
pub use model::{EntityRef, Instance};
pub use persister::{EntityCriteria, EntityPersister, PersisterRegistry};
pub use storage::MemoryDatabase;
