use crate::core::{MappingError, Result};
use crate::schema::{ForeignKeyDefinition, TableDefinition};
use std::collections::HashMap;
use std::sync::Arc;

/// Table metadata of a [`MemoryDatabase`](super::MemoryDatabase).
///
/// Immutable once built: adding a table returns a new catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: Arc<HashMap<String, TableDefinition>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, definition: TableDefinition) -> Result<Self> {
        let name = definition.name().to_string();
        if self.tables.contains_key(&name) {
            return Err(MappingError::TableExists(name));
        }

        let mut new_tables = (*self.tables).clone();
        new_tables.insert(name, definition);

        Ok(Self {
            tables: Arc::new(new_tables),
        })
    }

    pub fn get_table(&self, name: &str) -> Result<&TableDefinition> {
        self.tables
            .get(name)
            .ok_or_else(|| MappingError::TableNotFound(name.to_string()))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn list_tables(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }

    /// Foreign keys of other tables pointing at `table`, with their owning table.
    pub fn referencing(&self, table: &str) -> Vec<(String, ForeignKeyDefinition)> {
        self.tables
            .values()
            .flat_map(|definition| {
                definition
                    .foreign_keys()
                    .iter()
                    .filter(|fk| fk.target_table == table)
                    .map(|fk| (definition.name().to_string(), fk.clone()))
            })
            .collect()
    }
}
