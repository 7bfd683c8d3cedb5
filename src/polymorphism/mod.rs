//! Class hierarchies behind one logical entity.
//!
//! A hierarchy is stored in one table tagged by a discriminator (single table), in one table
//! per level joined on the primary key (joined tables), or in one independent table per
//! concrete class (table per class). Only leaves of the hierarchy are concrete: each gets a
//! [`SimpleEntityPersister`], and a [`PolymorphicPersister`] dispatches to them.

pub mod inflater;
pub mod persister;

pub use inflater::{PolymorphicInflater, Selector};
pub use persister::{ConcreteSubtype, PolymorphicPersister, SubtypePersister};

use crate::builder::{BuildSession, BuiltEntity, SegmentDraft};
use crate::cascade::RelationSite;
use crate::config::{EntityMappingConfiguration, NamingStrategy, PolymorphismPolicy, SubEntityConfiguration};
use crate::core::{ClassName, MappingError, Result, Value};
use crate::mapping::{ColumnBinding, Mapping, MappingBuilder, add_technical_column, determine_identification};
use crate::persister::{DerivedColumn, EntityPersister, IdAccess, SimpleEntityPersister};
use crate::schema::{ColumnDefinition, ForeignKeyDefinition};
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{Level, event, info_span};

/// Builds the persisters of the hierarchy rooted at `config`.
pub fn build(
    session: &mut BuildSession<'_>,
    config: &Rc<EntityMappingConfiguration>,
    policy: &PolymorphismPolicy,
    table: Option<&str>,
) -> Result<BuiltEntity> {
    let span = info_span!("polymorphism.build", class = %config.class, kind = ?policy.kind());
    let _enter = span.enter();

    validate(&config.class, policy)?;
    match policy {
        PolymorphismPolicy::TablePerClass { .. } => build_table_per_class(session, config, policy, table),
        _ => build_shared(session, config, policy, table),
    }
}

/// Checks nesting and subtype names before any table is created.
pub fn validate(base: &ClassName, policy: &PolymorphismPolicy) -> Result<()> {
    let mut seen = HashSet::from([base.clone()]);
    validate_level(base, policy, &mut seen)
}

fn validate_level(owner: &ClassName, policy: &PolymorphismPolicy, seen: &mut HashSet<ClassName>) -> Result<()> {
    let subtypes = policy.subtypes();
    if subtypes.is_empty() {
        return Err(MappingError::InvalidConfiguration(format!(
            "polymorphism of {} declares no subtype",
            owner
        )));
    }
    if let PolymorphismPolicy::SingleTable { subtypes, .. } = policy {
        let mut values = HashSet::new();
        for (value, sub) in subtypes {
            if !values.insert(value.clone()) {
                return Err(MappingError::DuplicateMapping(format!(
                    "discriminator value {} of {} is used twice",
                    value, sub.class
                )));
            }
        }
    }
    for sub in subtypes {
        if !seen.insert(sub.class.clone()) {
            return Err(MappingError::DuplicateMapping(format!(
                "subtype {} appears twice in the hierarchy of {}",
                sub.class, owner
            )));
        }
        if let Some(nested) = &sub.polymorphism {
            if !policy.kind().accepts_nested(nested.kind()) {
                return Err(MappingError::IncompatiblePolymorphism(format!(
                    "{:?} subtype {} cannot be mapped with a nested {:?} policy",
                    policy.kind(),
                    sub.class,
                    nested.kind()
                )));
            }
            validate_level(&sub.class, nested, seen)?;
        }
    }
    Ok(())
}

/// A concrete class and what it adds to the tables of the base.
struct Leaf {
    path: Vec<Rc<SubEntityConfiguration>>,
    drafts: Vec<SegmentDraft>,
    discriminators: Vec<(ColumnBinding, Value)>,
    selectors: Vec<Selector>,
}

impl Leaf {
    fn class(&self) -> Result<&ClassName> {
        self.path
            .last()
            .map(|sub| &sub.class)
            .ok_or_else(|| MappingError::InvalidConfiguration("subtype path is empty".into()))
    }
}

/// State of one walk down the hierarchy.
#[derive(Clone)]
struct Descent {
    path: Vec<Rc<SubEntityConfiguration>>,
    drafts: Vec<SegmentDraft>,
    discriminators: Vec<(ColumnBinding, Value)>,
    selectors: Vec<Selector>,
}

impl Descent {
    /// The innermost discriminator of a column wins: nested single-table levels may reuse it.
    fn discriminate(&mut self, column: &ColumnBinding, value: &Value) {
        self.discriminators.retain(|(c, _)| c.column != column.column || c.table != column.table);
        self.selectors.retain(|s| !s.reads(&column.table, &column.column));
        self.discriminators.push((column.clone(), value.clone()));
        self.selectors.push(Selector::Equals {
            table: column.table.clone(),
            column: column.column.clone(),
            value: value.clone(),
        });
    }
}

/// Single-table and joined-tables hierarchies: the base tables are shared by every subtype.
fn build_shared(
    session: &mut BuildSession<'_>,
    config: &Rc<EntityMappingConfiguration>,
    policy: &PolymorphismPolicy,
    table: Option<&str>,
) -> Result<BuiltEntity> {
    let (id, drafts) = session.build_hierarchy(config, table)?;
    let naming = Rc::clone(&config.naming);
    let start = Descent {
        path: Vec::new(),
        drafts: drafts.clone(),
        discriminators: Vec::new(),
        selectors: Vec::new(),
    };
    let mut leaves = Vec::new();
    expand(session, naming.as_ref(), policy, start, &mut leaves)?;

    let mut concrete = Vec::with_capacity(leaves.len());
    let mut sites = Vec::new();
    for leaf in leaves {
        let class = leaf.class()?.clone();
        let persister = Rc::new(SimpleEntityPersister::new(
            class.clone(),
            config.class.clone(),
            id.clone(),
            leaf.drafts.into_iter().map(SegmentDraft::into_segment).collect(),
            session.connection().clone(),
        )?);
        for (binding, value) in leaf.discriminators {
            let table = binding.table.clone();
            persister.add_derived_column(&table, DerivedColumn::constant(binding, value))?;
        }
        let as_dyn: Rc<dyn EntityPersister> = Rc::clone(&persister) as Rc<dyn EntityPersister>;
        for sub in &leaf.path {
            sites.push(RelationSite::for_subtype(Rc::clone(&as_dyn), sub, Rc::clone(&naming)));
        }
        event!(Level::DEBUG, subtype = %class, tables = ?persister.tables(), "concrete subtype built");
        concrete.push(ConcreteSubtype::new(persister, leaf.selectors));
    }

    let poly = Rc::new(PolymorphicPersister::shared(
        config.class.clone(),
        policy.kind(),
        id,
        &drafts,
        concrete,
        session.connection().clone(),
    )?);
    let persister: Rc<dyn EntityPersister> = Rc::clone(&poly) as Rc<dyn EntityPersister>;
    sites.insert(0, RelationSite::for_entity(Rc::clone(&persister), config));
    Ok(BuiltEntity {
        concrete: poly.subtype_persisters(),
        persister,
        sites,
    })
}

fn expand(
    session: &mut BuildSession<'_>,
    naming: &dyn NamingStrategy,
    policy: &PolymorphismPolicy,
    descent: Descent,
    leaves: &mut Vec<Leaf>,
) -> Result<()> {
    let binders = session.binders();
    match policy {
        PolymorphismPolicy::SingleTable {
            discriminator_column,
            discriminator_type,
            subtypes,
        } => {
            let Some(shared) = descent.drafts.last() else {
                return Err(MappingError::InvalidConfiguration("hierarchy maps no table".into()));
            };
            let table_name = shared.table.clone();
            let mut reserved: Vec<String> = shared.mapping.iter().map(|m| m.binding.column.clone()).collect();
            reserved.push(shared.primary_key.column.clone());
            reserved.push(discriminator_column.clone());

            let definition = session.schema_mut().table_mut(&table_name)?;
            let discriminator = add_technical_column(
                definition,
                binders,
                ColumnDefinition::new(
                    discriminator_column.clone(),
                    discriminator_type.clone(),
                    discriminator_type.clone(),
                )
                .not_null(),
            )?;
            for (value, sub) in subtypes {
                let mut next = descent.clone();
                let definition = session.schema_mut().table_mut(&table_name)?;
                let mapping = map_level(
                    MappingBuilder::new(sub.class.clone(), definition, binders, naming)
                        .force_nullable()
                        .reserve_columns(reserved.clone()),
                    sub,
                )?;
                if let Some(last) = next.drafts.last_mut() {
                    last.mapping.extend(mapping);
                }
                next.discriminate(&discriminator, value);
                descend(session, naming, sub, next, leaves)?;
            }
        }
        PolymorphismPolicy::JoinedTables { subtypes } => {
            let Some(root) = descent.drafts.first() else {
                return Err(MappingError::InvalidConfiguration("hierarchy maps no table".into()));
            };
            let (root_table, key) = (root.table.clone(), root.primary_key.clone());
            for sub in subtypes {
                let table_name = sub.table_name.clone().unwrap_or_else(|| naming.table_name(&sub.class));
                if session.schema().contains(&table_name) {
                    return Err(MappingError::TableExists(format!("{} (subtype {})", table_name, sub.class)));
                }
                let definition = session.schema_mut().table_or_create(&table_name);
                let primary_key = add_technical_column(
                    definition,
                    binders,
                    ColumnDefinition::new(key.column.clone(), key.data_type.clone(), key.data_type.clone())
                        .primary_key(),
                )?;
                definition.add_foreign_key(ForeignKeyDefinition {
                    name: naming.foreign_key_name(&table_name, &key.column, &root_table, &key.column),
                    columns: vec![key.column.clone()],
                    target_table: root_table.clone(),
                    target_columns: vec![key.column.clone()],
                });
                let mapping = map_level(
                    MappingBuilder::new(sub.class.clone(), definition, binders, naming)
                        .reserve_columns([key.column.clone()]),
                    sub,
                )?;
                let mut next = descent.clone();
                next.selectors.push(Selector::Present {
                    table: table_name.clone(),
                    column: primary_key.column.clone(),
                });
                next.drafts.push(SegmentDraft {
                    table: table_name,
                    primary_key,
                    mapping,
                });
                descend(session, naming, sub, next, leaves)?;
            }
        }
        PolymorphismPolicy::TablePerClass { .. } => {
            return Err(MappingError::IncompatiblePolymorphism(
                "table-per-class cannot be nested in a shared-table hierarchy".into(),
            ));
        }
    }
    Ok(())
}

fn descend(
    session: &mut BuildSession<'_>,
    naming: &dyn NamingStrategy,
    sub: &Rc<SubEntityConfiguration>,
    mut descent: Descent,
    leaves: &mut Vec<Leaf>,
) -> Result<()> {
    descent.path.push(Rc::clone(sub));
    match &sub.polymorphism {
        Some(nested) => expand(session, naming, nested, descent, leaves),
        None => {
            leaves.push(Leaf {
                path: descent.path,
                drafts: descent.drafts,
                discriminators: descent.discriminators,
                selectors: descent.selectors,
            });
            Ok(())
        }
    }
}

fn map_level(mut builder: MappingBuilder<'_>, sub: &SubEntityConfiguration) -> Result<Mapping> {
    builder.add_properties(&sub.properties)?;
    builder.add_insets(&sub.insets)?;
    Ok(builder.build())
}

/// Concrete classes of a table-per-class hierarchy, with the levels above each.
fn table_per_class_paths(
    policy: &PolymorphismPolicy,
    above: &[Rc<SubEntityConfiguration>],
    paths: &mut Vec<Vec<Rc<SubEntityConfiguration>>>,
) {
    for sub in policy.subtypes() {
        let mut path = above.to_vec();
        path.push(Rc::clone(&sub));
        match &sub.polymorphism {
            Some(nested) => table_per_class_paths(nested, &path, paths),
            None => paths.push(path),
        }
    }
}

/// Table-per-class hierarchies: every concrete class repeats the base columns in its own table.
fn build_table_per_class(
    session: &mut BuildSession<'_>,
    config: &Rc<EntityMappingConfiguration>,
    policy: &PolymorphismPolicy,
    table: Option<&str>,
) -> Result<BuiltEntity> {
    if let Some(given) = table {
        return Err(MappingError::AmbiguousTable(format!(
            "{} is mapped table-per-class and has no table of its own, {} was given",
            config.class, given
        )));
    }
    let identification = determine_identification(config)?;
    if identification.policy.is_database_generated() {
        return Err(MappingError::IncompatiblePolymorphism(format!(
            "{} is mapped table-per-class: database generated identifiers would collide across tables",
            config.class
        )));
    }
    let naming = Rc::clone(&config.naming);
    let pk_column = identification
        .column
        .clone()
        .unwrap_or_else(|| naming.column_name(&identification.accessor));
    let binders = session.binders();

    let mut paths = Vec::new();
    table_per_class_paths(policy, &[], &mut paths);
    let mut leaves = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(leaf) = path.last() else {
            continue;
        };
        let table_name = leaf.table_name.clone().unwrap_or_else(|| naming.table_name(&leaf.class));
        if session.schema().contains(&table_name) {
            return Err(MappingError::TableExists(format!("{} (subtype {})", table_name, leaf.class)));
        }
        let definition = session.schema_mut().table_or_create(&table_name);
        let primary_key = add_technical_column(
            definition,
            binders,
            ColumnDefinition::new(
                pk_column.clone(),
                identification.data_type.clone(),
                identification.data_type.clone(),
            )
            .primary_key(),
        )?;
        let mut mapping = Mapping::default();
        let mut reserved = vec![pk_column.clone()];
        for level in config.inheritance_chain().into_iter().rev() {
            let mut builder = MappingBuilder::new(level.class.clone(), definition, binders, naming.as_ref())
                .reserve_columns(reserved.clone());
            builder.add_properties(&level.effective_properties())?;
            builder.add_insets(&level.effective_insets())?;
            let level_mapping = builder.build();
            reserved.extend(level_mapping.iter().map(|m| m.binding.column.clone()));
            mapping.extend(level_mapping);
        }
        for sub in &path {
            let level_mapping = map_level(
                MappingBuilder::new(sub.class.clone(), definition, binders, naming.as_ref())
                    .reserve_columns(reserved.clone()),
                sub,
            )?;
            reserved.extend(level_mapping.iter().map(|m| m.binding.column.clone()));
            mapping.extend(level_mapping);
        }
        leaves.push((
            path,
            SegmentDraft {
                table: table_name,
                primary_key,
                mapping,
            },
        ));
    }

    let binder = leaves
        .first()
        .map(|(_, draft)| draft.primary_key.binder.clone())
        .ok_or_else(|| MappingError::InvalidConfiguration(format!("{} has no concrete subtype", config.class)))?;
    let id = IdAccess {
        accessor: identification.accessor,
        data_type: identification.data_type,
        policy: identification.policy,
        binder,
    };

    let mut concrete = Vec::with_capacity(leaves.len());
    let mut sites = Vec::new();
    for (path, draft) in leaves {
        let Some(leaf) = path.last() else {
            continue;
        };
        let persister = Rc::new(SimpleEntityPersister::new(
            leaf.class.clone(),
            config.class.clone(),
            id.clone(),
            vec![draft.into_segment()],
            session.connection().clone(),
        )?);
        let as_dyn: Rc<dyn EntityPersister> = Rc::clone(&persister) as Rc<dyn EntityPersister>;
        // no table is shared: relations of the base and of every level above are replicated
        sites.push(RelationSite::for_entity(Rc::clone(&as_dyn), config));
        for sub in &path {
            sites.push(RelationSite::for_subtype(Rc::clone(&as_dyn), sub, Rc::clone(&naming)));
        }
        concrete.push(ConcreteSubtype::new(persister, Vec::new()));
    }

    let poly = Rc::new(PolymorphicPersister::table_per_class(
        config.class.clone(),
        id,
        concrete,
        session.connection().clone(),
    )?);
    Ok(BuiltEntity {
        concrete: poly.subtype_persisters(),
        persister: poly as Rc<dyn EntityPersister>,
        sites,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;

    fn sub(class: &str) -> SubEntityConfiguration {
        SubEntityConfiguration::new(class)
    }

    #[test]
    fn test_joined_tables_accept_nested_single_table() {
        let policy = PolymorphismPolicy::joined_tables()
            .add_subtype(sub("Car").polymorphism(
                PolymorphismPolicy::single_table()
                    .discriminator_column("kind", DataType::Text)
                    .add_subtype(sub("SportsCar")),
            ))
            .add_subtype(sub("Truck"));
        assert!(validate(&ClassName::new("Vehicle"), &policy).is_ok());
    }

    #[test]
    fn test_table_per_class_inside_joined_tables_is_rejected() {
        let policy = PolymorphismPolicy::joined_tables()
            .add_subtype(sub("Car").polymorphism(PolymorphismPolicy::table_per_class().add_subtype(sub("SportsCar"))));
        let err = validate(&ClassName::new("Vehicle"), &policy).unwrap_err();
        assert!(matches!(err, MappingError::IncompatiblePolymorphism(_)));
    }

    #[test]
    fn test_duplicate_subtypes_and_discriminators_are_rejected() {
        let policy = PolymorphismPolicy::single_table()
            .add_discriminated_subtype("C", sub("Circle"))
            .add_discriminated_subtype("C", sub("Square"));
        assert!(matches!(
            validate(&ClassName::new("Shape"), &policy),
            Err(MappingError::DuplicateMapping(_))
        ));

        let policy = PolymorphismPolicy::joined_tables()
            .add_subtype(sub("Circle"))
            .add_subtype(sub("Circle"));
        assert!(matches!(
            validate(&ClassName::new("Shape"), &policy),
            Err(MappingError::DuplicateMapping(_))
        ));
    }

    #[test]
    fn test_policy_without_subtypes_is_rejected() {
        let err = validate(&ClassName::new("Shape"), &PolymorphismPolicy::table_per_class()).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_innermost_discriminator_wins() {
        let binding = ColumnBinding {
            table: "vehicle".into(),
            column: "kind".into(),
            data_type: DataType::Text,
            binder: crate::sql::ValueBinder::passthrough(DataType::Text),
        };
        let mut descent = Descent {
            path: Vec::new(),
            drafts: Vec::new(),
            discriminators: Vec::new(),
            selectors: Vec::new(),
        };
        descent.discriminate(&binding, &Value::from("Car"));
        descent.discriminate(&binding, &Value::from("SportsCar"));
        assert_eq!(descent.discriminators.len(), 1);
        assert_eq!(descent.discriminators[0].1, Value::from("SportsCar"));
        assert_eq!(descent.selectors.len(), 1);
    }
}
