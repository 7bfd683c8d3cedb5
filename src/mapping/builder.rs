use crate::config::{InsetConfiguration, NamingStrategy, PropertyLinkage};
use crate::core::{ClassName, DataType, MappingError, Result};
use crate::model::PropertyAccessor;
use crate::schema::{ColumnDefinition, TableDefinition};
use crate::sql::{BinderRegistry, ValueBinder};
use convert_case::{Case, Casing};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

/// A column of a table together with the binder converting its values.
#[derive(Debug, Clone)]
pub struct ColumnBinding {
    pub table: String,
    pub column: String,
    pub data_type: DataType,
    pub binder: ValueBinder,
}

#[derive(Debug, Clone)]
pub struct PropertyMapping {
    pub accessor: PropertyAccessor,
    pub binding: ColumnBinding,
    pub read_only: bool,
}

/// Property accessors of one entity level and the columns of one table they map to.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: Vec<PropertyMapping>,
}

impl Mapping {
    pub fn iter(&self) -> impl Iterator<Item = &PropertyMapping> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries written by inserts and updates.
    pub fn writable(&self) -> impl Iterator<Item = &PropertyMapping> {
        self.entries.iter().filter(|e| !e.read_only)
    }

    pub fn column_for(&self, accessor: &PropertyAccessor) -> Option<&ColumnBinding> {
        self.entries
            .iter()
            .find(|e| e.accessor.definition() == accessor.definition())
            .map(|e| &e.binding)
    }

    /// Lookup by dotted property path, e.g. `address.city`.
    pub fn column_for_path(&self, path: &str) -> Option<&ColumnBinding> {
        self.entries
            .iter()
            .find(|e| e.accessor.definition() == path)
            .map(|e| &e.binding)
    }

    pub fn accessor_for(&self, column: &str) -> Option<&PropertyAccessor> {
        self.entries
            .iter()
            .find(|e| e.binding.column == column)
            .map(|e| &e.accessor)
    }

    pub fn extend(&mut self, other: Mapping) {
        self.entries.extend(other.entries);
    }
}

struct PendingInset {
    accessor: PropertyAccessor,
    inset: InsetConfiguration,
    /// Snake cased accessor path, used by prefixed insets.
    prefix: String,
    prefixed: bool,
}

/// Builds the [`Mapping`] of one configuration level onto one table, creating the columns.
pub struct MappingBuilder<'a> {
    owner: ClassName,
    table: &'a mut TableDefinition,
    binders: &'a BinderRegistry,
    naming: &'a dyn NamingStrategy,
    force_nullable: bool,
    mapping: Mapping,
    columns: HashSet<String>,
    embedded_classes: HashSet<ClassName>,
}

impl<'a> MappingBuilder<'a> {
    pub fn new(
        owner: ClassName,
        table: &'a mut TableDefinition,
        binders: &'a BinderRegistry,
        naming: &'a dyn NamingStrategy,
    ) -> Self {
        Self {
            owner,
            table,
            binders,
            naming,
            force_nullable: false,
            mapping: Mapping::default(),
            columns: HashSet::new(),
            embedded_classes: HashSet::new(),
        }
    }

    /// Columns of subtypes sharing a table with their siblings cannot be mandatory.
    pub fn force_nullable(mut self) -> Self {
        self.force_nullable = true;
        self
    }

    /// Columns already used by another level sharing this table, they cannot be mapped again.
    pub fn reserve_columns<I: IntoIterator<Item = String>>(mut self, columns: I) -> Self {
        self.columns.extend(columns);
        self
    }

    pub fn add_properties(&mut self, properties: &[PropertyLinkage]) -> Result<()> {
        for linkage in properties {
            let accessor = PropertyAccessor::new(self.owner.clone(), &linkage.property);
            let column = linkage
                .column
                .clone()
                .unwrap_or_else(|| self.naming.column_name(&accessor));
            self.add(accessor, column, &linkage.data_type, linkage.nullable, linkage.read_only)?;
        }
        Ok(())
    }

    /// Flattens embedded objects breadth first, nested embeddables included.
    pub fn add_insets(&mut self, insets: &[InsetConfiguration]) -> Result<()> {
        let mut queue: VecDeque<PendingInset> = insets
            .iter()
            .map(|inset| PendingInset {
                accessor: PropertyAccessor::new(self.owner.clone(), &inset.property),
                prefix: inset.property.to_case(Case::Snake),
                prefixed: inset.prefixed,
                inset: inset.clone(),
            })
            .collect();

        while let Some(pending) = queue.pop_front() {
            let embeddable = Rc::clone(&pending.inset.embeddable);

            let mut properties = Vec::new();
            let mut nested = Vec::new();
            let mut level = Some(Rc::clone(&embeddable));
            let mut levels = Vec::new();
            while let Some(current) = level {
                level = current.mapped_super_class.clone();
                levels.push(current);
            }
            for current in levels.iter().rev() {
                properties.extend(current.properties.iter().cloned());
                nested.extend(current.insets.iter().cloned());
            }
            properties.retain(|p| !pending.inset.excluded.contains(&p.property));

            let fully_overridden = properties
                .iter()
                .all(|p| pending.inset.overrides.contains_key(&p.property));
            if !self.embedded_classes.insert(embeddable.class.clone())
                && !pending.prefixed
                && !fully_overridden
            {
                return Err(MappingError::DuplicateMapping(format!(
                    "{} is embedded more than once in {}: {} needs prefixed columns or an override for every property",
                    embeddable.class,
                    self.owner,
                    pending.accessor.definition()
                )));
            }

            for linkage in &properties {
                let accessor = pending.accessor.chain(&embeddable.class, &linkage.property);
                let base = linkage
                    .column
                    .clone()
                    .unwrap_or_else(|| self.naming.column_name(&accessor));
                let column = match pending.inset.overrides.get(&linkage.property) {
                    Some(column) => column.clone(),
                    None if pending.prefixed => format!("{}_{}", pending.prefix, base),
                    None => base,
                };
                // embedded objects may be absent as a whole
                self.add(accessor, column, &linkage.data_type, true, linkage.read_only)?;
            }

            for inset in nested {
                queue.push_back(PendingInset {
                    accessor: pending.accessor.chain(&embeddable.class, &inset.property),
                    prefix: format!("{}_{}", pending.prefix, inset.property.to_case(Case::Snake)),
                    prefixed: pending.prefixed || inset.prefixed,
                    inset,
                });
            }
        }
        Ok(())
    }

    /// Maps one accessor on `column`, creating the column when missing.
    pub fn add(
        &mut self,
        accessor: PropertyAccessor,
        column: String,
        data_type: &DataType,
        nullable: bool,
        read_only: bool,
    ) -> Result<()> {
        let definition = accessor.definition();
        if self.mapping.iter().any(|e| e.accessor.definition() == definition) {
            return Err(MappingError::DuplicateMapping(format!(
                "property {} of {} is mapped more than once",
                definition, self.owner
            )));
        }
        if !self.columns.insert(column.clone()) {
            return Err(MappingError::DuplicateColumn {
                table: self.table.name().to_string(),
                column,
            });
        }

        let binder = self.binders.resolve(self.table.name(), &column, data_type)?;
        let mut definition = ColumnDefinition::new(column.clone(), data_type.clone(), binder.storage_type().clone());
        if !nullable && !self.force_nullable {
            definition = definition.not_null();
        }
        self.table.add_column(definition)?;

        self.mapping.entries.push(PropertyMapping {
            accessor,
            binding: ColumnBinding {
                table: self.table.name().to_string(),
                column,
                data_type: data_type.clone(),
                binder,
            },
            read_only,
        });
        Ok(())
    }

    pub fn build(self) -> Mapping {
        self.mapping
    }
}

/// Adds a column that no property maps (keys, discriminators, foreign keys) and binds it.
pub fn add_technical_column(
    table: &mut TableDefinition,
    binders: &BinderRegistry,
    column: ColumnDefinition,
) -> Result<ColumnBinding> {
    let binder = binders.resolve(table.name(), &column.name, &column.data_type)?;
    let binding = ColumnBinding {
        table: table.name().to_string(),
        column: column.name.clone(),
        data_type: column.data_type.clone(),
        binder: binder.clone(),
    };
    let column = ColumnDefinition {
        storage_type: binder.storage_type().clone(),
        ..column
    };
    table.add_column(column)?;
    Ok(binding)
}

/// Rejects two distinct accessors of `mappings` resolving to one column.
pub fn check_unique_columns<'m>(table: &str, mappings: impl Iterator<Item = &'m PropertyMapping>) -> Result<()> {
    let mut seen: HashMap<&str, &PropertyAccessor> = HashMap::new();
    for entry in mappings {
        if let Some(previous) = seen.insert(entry.binding.column.as_str(), &entry.accessor) {
            if previous.definition() != entry.accessor.definition() {
                return Err(MappingError::DuplicateColumn {
                    table: table.to_string(),
                    column: entry.binding.column.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefaultNamingStrategy, EmbeddableMappingConfiguration};

    fn address() -> Rc<EmbeddableMappingConfiguration> {
        Rc::new(
            EmbeddableMappingConfiguration::new("Address")
                .property(PropertyLinkage::new("street", DataType::Text))
                .property(PropertyLinkage::new("city", DataType::Text)),
        )
    }

    #[test]
    fn test_column_name_precedence() {
        let mut table = TableDefinition::new("person");
        let binders = BinderRegistry::with_defaults();
        let mut builder = MappingBuilder::new(ClassName::new("Person"), &mut table, &binders, &DefaultNamingStrategy);
        builder
            .add_properties(&[
                PropertyLinkage::new("firstName", DataType::Text),
                PropertyLinkage::new("age", DataType::Integer).column("person_age"),
            ])
            .unwrap();
        builder
            .add_insets(&[InsetConfiguration::new("home", address()).override_column("city", "town")])
            .unwrap();
        let mapping = builder.build();

        let columns: Vec<&str> = mapping.iter().map(|e| e.binding.column.as_str()).collect();
        assert_eq!(columns, vec!["first_name", "person_age", "street", "town"]);
        assert_eq!(table.columns().len(), 4);
        assert_eq!(mapping.column_for_path("home.city").map(|b| b.column.as_str()), Some("town"));
    }

    #[test]
    fn test_two_properties_on_one_column_fail() {
        let mut table = TableDefinition::new("person");
        let binders = BinderRegistry::with_defaults();
        let mut builder = MappingBuilder::new(ClassName::new("Person"), &mut table, &binders, &DefaultNamingStrategy);
        let err = builder
            .add_properties(&[
                PropertyLinkage::new("name", DataType::Text),
                PropertyLinkage::new("nickname", DataType::Text).column("name"),
            ])
            .unwrap_err();
        assert!(matches!(err, MappingError::DuplicateColumn { .. }));
    }

    #[test]
    fn test_reembedding_requires_prefix() {
        let mut table = TableDefinition::new("person");
        let binders = BinderRegistry::with_defaults();
        let mut builder = MappingBuilder::new(ClassName::new("Person"), &mut table, &binders, &DefaultNamingStrategy);
        let err = builder
            .add_insets(&[
                InsetConfiguration::new("home", address()),
                InsetConfiguration::new("work", address()),
            ])
            .unwrap_err();
        assert!(matches!(err, MappingError::DuplicateMapping(_)));

        let mut table = TableDefinition::new("person");
        let mut builder = MappingBuilder::new(ClassName::new("Person"), &mut table, &binders, &DefaultNamingStrategy);
        builder
            .add_insets(&[
                InsetConfiguration::new("home", address()),
                InsetConfiguration::new("work", address()).prefixed(),
            ])
            .unwrap();
        let mapping = builder.build();
        assert_eq!(mapping.column_for_path("work.city").map(|b| b.column.as_str()), Some("work_city"));
    }

    #[test]
    fn test_missing_binder_is_fatal() {
        let mut table = TableDefinition::new("invoice");
        let binders = BinderRegistry::with_defaults();
        let mut builder = MappingBuilder::new(ClassName::new("Invoice"), &mut table, &binders, &DefaultNamingStrategy);
        let err = builder
            .add_properties(&[PropertyLinkage::new("amount", DataType::Custom("Money".into()))])
            .unwrap_err();
        assert!(matches!(err, MappingError::MissingBinder(_)));
        assert!(table.columns().is_empty());
    }
}
