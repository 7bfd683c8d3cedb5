//! Entry point turning entity configurations into persisters.

pub mod session;

pub use session::{BuildSession, BuiltEntity, PostInitializer, SegmentDraft, TableClaim};

use crate::config::{ConfigurationCatalog, ConnectionConfiguration, Dialect};
use crate::core::{ClassName, MappingError, Result};
use crate::persister::{EntityPersister, PersisterRegistry};
use std::rc::Rc;
use tracing::{Level, event, info_span};

/// Builds the persister of one entity class, and of every class its relations reach.
///
/// ```ignore
/// let persister = EntityPersisterBuilder::new(&catalog, "Order")
///     .with_table("orders")
///     .build(&dialect, &connection, &mut registry)?;
/// ```
pub struct EntityPersisterBuilder<'c> {
    catalog: &'c ConfigurationCatalog,
    class: ClassName,
    table: Option<String>,
}

impl<'c> EntityPersisterBuilder<'c> {
    pub fn new(catalog: &'c ConfigurationCatalog, class: impl Into<ClassName>) -> Self {
        Self {
            catalog,
            class: class.into(),
            table: None,
        }
    }

    /// Maps the entity on `table` instead of the name given by its naming strategy.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Builds and registers the persisters. On error `registry` and the persisters it holds
    /// are left as they were.
    pub fn build(
        self,
        dialect: &Dialect,
        connection: &ConnectionConfiguration,
        registry: &mut PersisterRegistry,
    ) -> Result<Rc<dyn EntityPersister>> {
        let span = info_span!("persister.build", class = %self.class);
        let _enter = span.enter();

        if let (Some(existing), Some(table)) = (registry.get(&self.class), &self.table) {
            if existing.main_table() != table {
                return Err(MappingError::AmbiguousTable(format!(
                    "{} is already mapped on {}, {} was given",
                    self.class,
                    existing.main_table(),
                    table
                )));
            }
        }

        connection.settings.validate().map_err(|err| {
            MappingError::InvalidConfiguration(format!("connection of {}: {}", self.class, err))
        })?;

        let checkpoints = registry.checkpoint();
        let mut session = BuildSession::new(self.catalog, dialect, connection, registry);
        let built = session
            .build_entity(&self.class, self.table.as_deref())
            .and_then(|persister| session.run_post_initializers().map(|()| persister));
        let persister = match built {
            Ok(persister) => persister,
            Err(err) => {
                event!(Level::ERROR, error = %err, class = %self.class, "build failed");
                drop(session);
                for (persister, checkpoint) in checkpoints {
                    persister.rollback(checkpoint);
                }
                return Err(err);
            }
        };
        let (persisters, schema, next_relation) = session.finish();

        event!(
            Level::DEBUG,
            persisters = persisters.len(),
            tables = schema.table_names().len(),
            "build committed"
        );
        registry.commit(persisters, schema, next_relation);
        Ok(persister)
    }
}
