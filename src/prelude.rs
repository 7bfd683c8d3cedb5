//! Recommended imports grouped by abstraction level.
//!
//! The top level is what an application needs to configure entities and persist them.
//! `advanced` reaches the building blocks used to extend persisters.

pub use crate::builder::EntityPersisterBuilder;
pub use crate::config::{
    CollectionKind, ConfigurationCatalog, ConnectionConfiguration, DefaultNamingStrategy, Dialect,
    ElementCollectionRelation, EntityMappingConfiguration, IdentifierPolicy, InheritanceConfiguration,
    NamingStrategy, OneToManyRelation, OneToOneRelation, PersistenceSettings, PolymorphismPolicy,
    PropertyLinkage, RelationMode, SubEntityConfiguration,
};
pub use crate::core::{ClassName, DataType, MappingError, Result, Value};
pub use crate::model::{EntityRef, Instance};
pub use crate::persister::{EntityCriteria, EntityPersister, PersisterRegistry};
pub use crate::storage::{MemoryDatabase, StatementKind};

pub mod advanced {
    //! Escape hatch for persister internals.
    //!
    //! Listeners, derived columns and select trees are stable enough to hook into, but
    //! application code should normally stay on the top-level prelude.
    pub use crate::persister::{
        DerivedColumn, Duo, ListenerPipeline, OperationContext, Priority, SimpleEntityPersister, Stage,
    };
    pub use crate::polymorphism::{PolymorphicPersister, SubtypePersister};
    pub use crate::select::{JoinTree, RowInflater};
    pub use crate::sql::{BinderRegistry, SqlExecutor, ValueBinder};
}
