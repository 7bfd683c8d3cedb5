use crate::cascade::{self, RelationSite};
use crate::config::{ConfigurationCatalog, ConnectionConfiguration, Dialect, EntityMappingConfiguration};
use crate::core::{ClassName, MappingError, RelationId, Result};
use crate::mapping::{ColumnBinding, Mapping, MappingBuilder, add_technical_column, determine_identification};
use crate::persister::{EntityPersister, IdAccess, PersisterRegistry, Segment, SimpleEntityPersister};
use crate::polymorphism;
use crate::schema::{ColumnDefinition, ForeignKeyDefinition, Schema};
use crate::sql::BinderRegistry;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{Level, event, info_span};

/// Wiring run once every persister of the build exists.
pub type PostInitializer<'a> = Box<dyn FnOnce(&mut BuildSession<'a>) -> Result<()> + 'a>;

/// A table of an entity whose persister is not built yet.
#[derive(Debug, Clone)]
pub struct SegmentDraft {
    pub table: String,
    pub primary_key: ColumnBinding,
    pub mapping: Mapping,
}

impl SegmentDraft {
    pub fn into_segment(self) -> Segment {
        Segment::new(&self.table, self.primary_key, self.mapping)
    }
}

/// A persister just built and the relations still to wire on it.
pub struct BuiltEntity {
    pub persister: Rc<dyn EntityPersister>,
    /// Persisters of the concrete subtypes of a polymorphic entity.
    pub concrete: Vec<Rc<dyn EntityPersister>>,
    pub sites: Vec<RelationSite>,
}

/// A relation creating a relation table, and the main table of the entity declaring it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableClaim {
    pub relation: String,
    pub source_table: String,
}

/// State of one `build` call.
///
/// Persisters and tables created here reach the registry only when the whole build succeeds.
/// `building` holds the classes whose construction is under way: a relation targeting one
/// of them closes a cycle.
pub struct BuildSession<'a> {
    catalog: &'a ConfigurationCatalog,
    dialect: &'a Dialect,
    connection: &'a ConnectionConfiguration,
    registry: &'a PersisterRegistry,
    schema: Schema,
    built: BTreeMap<ClassName, Rc<dyn EntityPersister>>,
    building: Vec<ClassName>,
    post_initializers: Vec<PostInitializer<'a>>,
    next_relation: u32,
    /// Relation tables created by this build and the relation owning each.
    claims: HashMap<String, TableClaim>,
}

impl<'a> BuildSession<'a> {
    pub fn new(
        catalog: &'a ConfigurationCatalog,
        dialect: &'a Dialect,
        connection: &'a ConnectionConfiguration,
        registry: &'a PersisterRegistry,
    ) -> Self {
        Self {
            catalog,
            dialect,
            connection,
            registry,
            schema: registry.schema().clone(),
            built: BTreeMap::new(),
            building: Vec::new(),
            post_initializers: Vec::new(),
            next_relation: registry.next_relation(),
            claims: HashMap::new(),
        }
    }

    pub fn catalog(&self) -> &'a ConfigurationCatalog {
        self.catalog
    }

    pub fn binders(&self) -> &'a BinderRegistry {
        &self.dialect.binders
    }

    pub fn connection(&self) -> &'a ConnectionConfiguration {
        self.connection
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut Schema {
        &mut self.schema
    }

    pub fn is_building(&self, class: &ClassName) -> bool {
        self.building.contains(class)
    }

    pub fn allocate_relation(&mut self) -> RelationId {
        let id = RelationId(self.next_relation);
        self.next_relation += 1;
        id
    }

    /// Reserves `table` for the relation of `claim`.
    ///
    /// A relation replicated on several persisters sharing their main table claims its table
    /// once per persister. Replicas on distinct tables need a table each; any other existing
    /// table is an error.
    pub fn claim_table(&mut self, table: &str, claim: TableClaim) -> Result<()> {
        match self.claims.get(table) {
            Some(claimed) if *claimed == claim => Ok(()),
            Some(claimed) if claimed.relation == claim.relation => Err(MappingError::InvalidConfiguration(format!(
                "{} is replicated on {} and {}, which cannot share the table {}: leave its name to the naming strategy",
                claim.relation, claimed.source_table, claim.source_table, table
            ))),
            None if !self.schema.contains(table) => {
                self.claims.insert(table.to_string(), claim);
                Ok(())
            }
            _ => Err(MappingError::TableExists(format!("{} (relation {})", table, claim.relation))),
        }
    }

    /// Persister of `class` if this build or an earlier one created it.
    pub fn existing(&self, class: &ClassName) -> Option<Rc<dyn EntityPersister>> {
        self.built
            .get(class)
            .cloned()
            .or_else(|| self.registry.get(class))
    }

    /// Persister of `class`, built on first request.
    pub fn persister(&mut self, class: &ClassName) -> Result<Rc<dyn EntityPersister>> {
        match self.existing(class) {
            Some(persister) => Ok(persister),
            None => self.build_entity(class, None),
        }
    }

    pub fn defer(&mut self, initializer: PostInitializer<'a>) {
        self.post_initializers.push(initializer);
    }

    /// Runs deferred wiring, including wiring deferred by deferred wiring.
    pub fn run_post_initializers(&mut self) -> Result<()> {
        while !self.post_initializers.is_empty() {
            let pending = std::mem::take(&mut self.post_initializers);
            event!(Level::DEBUG, count = pending.len(), "running post initializers");
            for initializer in pending {
                initializer(self)?;
            }
        }
        Ok(())
    }

    pub fn build_entity(&mut self, class: &ClassName, table: Option<&str>) -> Result<Rc<dyn EntityPersister>> {
        if let Some(persister) = self.existing(class) {
            return Ok(persister);
        }
        let config = match self.catalog.get(class) {
            Ok(config) => config,
            Err(err) => return self.build_subtype(class, table, err),
        };
        let span = info_span!("build.entity", class = %class);
        let _enter = span.enter();

        self.building.push(class.clone());
        let result = self.build_configured(&config, table);
        self.building.pop();
        result
    }

    /// Persister of a subtype declared by the polymorphism of another entity, built with its
    /// whole hierarchy. `unknown` is returned when no hierarchy declares `class`.
    fn build_subtype(
        &mut self,
        class: &ClassName,
        table: Option<&str>,
        unknown: MappingError,
    ) -> Result<Rc<dyn EntityPersister>> {
        let Some(base) = self.catalog.hierarchy_of(class).cloned() else {
            return Err(unknown);
        };
        if let Some(given) = table {
            return Err(MappingError::AmbiguousTable(format!(
                "{} is mapped by the hierarchy of {}, {} was given",
                class, base, given
            )));
        }
        if self.is_building(&base) {
            return Err(MappingError::InvalidConfiguration(format!(
                "{} is reached while its hierarchy {} is being mapped",
                class, base
            )));
        }
        event!(Level::DEBUG, subtype = %class, base = %base, "building the hierarchy of a subtype");
        self.build_entity(&base, None)?;
        self.existing(class).ok_or_else(|| {
            MappingError::UnknownEntity(format!("{} is not a concrete subtype of {}", class, base))
        })
    }

    fn build_configured(
        &mut self,
        config: &Rc<EntityMappingConfiguration>,
        table: Option<&str>,
    ) -> Result<Rc<dyn EntityPersister>> {
        let built = match &config.polymorphism {
            Some(policy) => polymorphism::build(self, config, policy, table)?,
            None => {
                let persister: Rc<dyn EntityPersister> = self.build_simple(config, table)?;
                BuiltEntity {
                    sites: vec![RelationSite::for_entity(Rc::clone(&persister), config)],
                    concrete: Vec::new(),
                    persister,
                }
            }
        };
        self.built.insert(config.class.clone(), Rc::clone(&built.persister));
        for concrete in &built.concrete {
            let class = concrete.class_name();
            if self.existing(class).is_some() || self.catalog.contains(class) {
                return Err(MappingError::DuplicateMapping(format!(
                    "subtype {} of {} is mapped elsewhere",
                    class, config.class
                )));
            }
            self.built.insert(class.clone(), Rc::clone(concrete));
        }
        for site in &built.sites {
            cascade::configure_site(self, site)?;
        }
        Ok(built.persister)
    }

    fn build_simple(
        &mut self,
        config: &Rc<EntityMappingConfiguration>,
        table: Option<&str>,
    ) -> Result<Rc<SimpleEntityPersister>> {
        let (id, drafts) = self.build_hierarchy(config, table)?;
        let persister = SimpleEntityPersister::new(
            config.class.clone(),
            config.class.clone(),
            id,
            drafts.into_iter().map(SegmentDraft::into_segment).collect(),
            self.connection.clone(),
        )?;
        Ok(Rc::new(persister))
    }

    /// Creates the tables of `config` and its table inheritance chain, root table first.
    ///
    /// Levels share the table of their most derived level, except below an
    /// `inherits_joined` link where the child starts a table of its own.
    pub fn build_hierarchy(
        &mut self,
        config: &Rc<EntityMappingConfiguration>,
        table: Option<&str>,
    ) -> Result<(IdAccess, Vec<SegmentDraft>)> {
        let identification = determine_identification(config)?;
        if let (Some(declared), Some(given)) = (&config.table_name, table) {
            if declared != given {
                return Err(MappingError::AmbiguousTable(format!(
                    "{} is mapped on {} by its configuration and on {} by its builder",
                    config.class, declared, given
                )));
            }
        }

        let mut groups: Vec<Vec<Rc<EntityMappingConfiguration>>> = Vec::new();
        for level in config.inheritance_chain().into_iter().rev() {
            let joined = level.inheritance.as_ref().is_some_and(|i| i.joined_table);
            if groups.is_empty() || joined {
                groups.push(Vec::new());
            }
            if let Some(group) = groups.last_mut() {
                group.push(level);
            }
        }

        let naming = Rc::clone(&config.naming);
        let pk_column = identification
            .column
            .clone()
            .unwrap_or_else(|| naming.column_name(&identification.accessor));
        let binders = self.binders();
        let last = groups.len() - 1;
        let mut drafts: Vec<SegmentDraft> = Vec::with_capacity(groups.len());

        for (position, group) in groups.iter().enumerate() {
            let Some(most_derived) = group.last() else {
                continue;
            };
            let table_name = match (position == last, table) {
                (true, Some(given)) => given.to_string(),
                _ => most_derived
                    .table_name
                    .clone()
                    .unwrap_or_else(|| naming.table_name(&most_derived.class)),
            };
            if self.schema.contains(&table_name) {
                return Err(MappingError::TableExists(format!(
                    "{} (mapping {})",
                    table_name, most_derived.class
                )));
            }

            let mut key = ColumnDefinition::new(
                pk_column.clone(),
                identification.data_type.clone(),
                identification.data_type.clone(),
            )
            .primary_key();
            if position == 0 && identification.policy.is_database_generated() {
                key = key.auto_increment();
            }
            let table = self.schema.table_or_create(&table_name);
            let primary_key = add_technical_column(table, binders, key)?;
            if let Some(root) = drafts.first() {
                table.add_foreign_key(ForeignKeyDefinition {
                    name: naming.foreign_key_name(&table_name, &pk_column, &root.table, &pk_column),
                    columns: vec![pk_column.clone()],
                    target_table: root.table.clone(),
                    target_columns: vec![pk_column.clone()],
                });
            }

            let mut mapping = Mapping::default();
            let mut reserved = vec![pk_column.clone()];
            for level in group {
                let mut builder = MappingBuilder::new(level.class.clone(), table, binders, naming.as_ref())
                    .reserve_columns(reserved.clone());
                builder.add_properties(&level.effective_properties())?;
                builder.add_insets(&level.effective_insets())?;
                let level_mapping = builder.build();
                reserved.extend(level_mapping.iter().map(|m| m.binding.column.clone()));
                mapping.extend(level_mapping);
            }
            drafts.push(SegmentDraft {
                table: table_name,
                primary_key,
                mapping,
            });
        }

        let binder = drafts
            .first()
            .map(|root| root.primary_key.binder.clone())
            .ok_or_else(|| MappingError::InvalidConfiguration(format!("{} maps no table", config.class)))?;
        let id = IdAccess {
            accessor: identification.accessor,
            data_type: identification.data_type,
            policy: identification.policy,
            binder,
        };
        Ok((id, drafts))
    }

    /// Ends the build, handing over what it created.
    pub fn finish(self) -> (BTreeMap<ClassName, Rc<dyn EntityPersister>>, Schema, u32) {
        (self.built, self.schema, self.next_relation)
    }
}
