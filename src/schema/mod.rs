use crate::core::{DataType, MappingError, Result, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    /// Mapped type of the values held by the column.
    pub data_type: DataType,
    /// Type of the stored values, as produced by the column's binder.
    pub storage_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: DataType, storage_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            storage_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable && !self.auto_increment {
                return Err(MappingError::ConstraintViolation(format!(
                    "Column '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.storage_type.is_compatible(value) {
            return Err(MappingError::TypeMismatch(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                self.storage_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub target_table: String,
    pub target_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    name: String,
    columns: Vec<ColumnDefinition>,
    foreign_keys: Vec<ForeignKeyDefinition>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyDefinition] {
        &self.foreign_keys
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.find_column_index(name).map(|idx| &self.columns[idx])
    }

    /// Adds a column, or reuses an existing one with the same mapped type.
    ///
    /// Reuse happens when several mappings project onto the same table (subtypes of a single
    /// table hierarchy, shared inheritance tables). A type conflict is a mapping error.
    pub fn add_column(&mut self, column: ColumnDefinition) -> Result<()> {
        if let Some(existing) = self.columns.iter_mut().find(|c| c.name == column.name) {
            if existing.data_type != column.data_type {
                return Err(MappingError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.name,
                });
            }
            existing.primary_key |= column.primary_key;
            existing.auto_increment |= column.auto_increment;
            existing.nullable = existing.nullable && column.nullable && !existing.primary_key;
            return Ok(());
        }
        self.columns.push(column);
        Ok(())
    }

    /// Columns of the primary key, in declaration order.
    pub fn primary_key(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn auto_increment_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.auto_increment)
    }

    pub fn add_foreign_key(&mut self, foreign_key: ForeignKeyDefinition) {
        if !self.foreign_keys.iter().any(|fk| fk.name == foreign_key.name) {
            self.foreign_keys.push(foreign_key);
        }
    }
}

/// Tables produced by persister builds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    tables: BTreeMap<String, TableDefinition>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut TableDefinition> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| MappingError::TableNotFound(name.to_string()))
    }

    pub fn table_or_create(&mut self, name: &str) -> &mut TableDefinition {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| TableDefinition::new(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDefinition> {
        self.tables.values()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }

    /// Tables ordered so that every table comes after the tables its foreign keys point to.
    /// Cyclic references keep their alphabetical order.
    pub fn creation_order(&self) -> Vec<&TableDefinition> {
        let mut ordered: Vec<&TableDefinition> = Vec::new();
        let mut pending: Vec<&TableDefinition> = self.tables.values().collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut index = 0;
            while index < pending.len() {
                let table = pending[index];
                let ready = table.foreign_keys.iter().all(|fk| {
                    fk.target_table == table.name
                        || !self.tables.contains_key(&fk.target_table)
                        || ordered.iter().any(|t| t.name == fk.target_table)
                });
                if ready {
                    ordered.push(pending.remove(index));
                } else {
                    index += 1;
                }
            }
            if pending.len() == before {
                ordered.append(&mut pending);
            }
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_column_reuses_same_type() {
        let mut table = TableDefinition::new("shape");
        table
            .add_column(ColumnDefinition::new("radius", DataType::Integer, DataType::Integer))
            .unwrap();
        table
            .add_column(ColumnDefinition::new("radius", DataType::Integer, DataType::Integer))
            .unwrap();
        assert_eq!(table.columns().len(), 1);

        let err = table
            .add_column(ColumnDefinition::new("radius", DataType::Text, DataType::Text))
            .unwrap_err();
        assert!(matches!(err, MappingError::DuplicateColumn { .. }));
    }

    #[test]
    fn test_creation_order_follows_foreign_keys() {
        let mut schema = Schema::new();
        schema.table_or_create("a_order").add_foreign_key(ForeignKeyDefinition {
            name: "FK_a_order_customer_id_z_customer_id".into(),
            columns: vec!["customer_id".into()],
            target_table: "z_customer".into(),
            target_columns: vec!["id".into()],
        });
        schema.table_or_create("z_customer");
        let names: Vec<&str> = schema.creation_order().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["z_customer", "a_order"]);
    }
}
