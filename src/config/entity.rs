use super::naming::{DefaultNamingStrategy, NamingStrategy};
use super::polymorphism::PolymorphismPolicy;
use super::relation::{ElementCollectionRelation, OneToManyRelation, OneToOneRelation};
use crate::core::{ClassName, DataType, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

/// Produces identifier values before insert.
#[derive(Clone)]
pub struct IdentifierGenerator(Rc<dyn Fn() -> Value>);

impl IdentifierGenerator {
    pub fn new(generate: impl Fn() -> Value + 'static) -> Self {
        Self(Rc::new(generate))
    }

    /// Random (v4) UUIDs.
    pub fn uuid() -> Self {
        Self::new(|| Value::Uuid(Uuid::new_v4()))
    }

    pub fn generate(&self) -> Value {
        (self.0)()
    }
}

impl fmt::Debug for IdentifierGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentifierGenerator")
    }
}

#[derive(Debug, Clone)]
pub enum IdentifierPolicy {
    /// The caller sets the identifier. Newness is tracked by the persisted marker of the object.
    Assigned,
    /// The key is returned by the executor after insert.
    DatabaseGenerated,
    /// The identifier is generated by the mapper right before insert.
    BeforeInsert(IdentifierGenerator),
}

impl IdentifierPolicy {
    pub fn is_database_generated(&self) -> bool {
        matches!(self, Self::DatabaseGenerated)
    }
}

#[derive(Debug, Clone)]
pub struct IdentifierDeclaration {
    pub property: String,
    pub data_type: DataType,
    pub policy: IdentifierPolicy,
    pub column: Option<String>,
}

impl IdentifierDeclaration {
    pub fn new(property: &str, data_type: DataType, policy: IdentifierPolicy) -> Self {
        Self {
            property: property.to_string(),
            data_type,
            policy,
            column: None,
        }
    }

    pub fn column(mut self, name: &str) -> Self {
        self.column = Some(name.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct PropertyLinkage {
    pub property: String,
    pub data_type: DataType,
    pub column: Option<String>,
    pub nullable: bool,
    pub read_only: bool,
}

impl PropertyLinkage {
    pub fn new(property: &str, data_type: DataType) -> Self {
        Self {
            property: property.to_string(),
            data_type,
            column: None,
            nullable: true,
            read_only: false,
        }
    }

    pub fn column(mut self, name: &str) -> Self {
        self.column = Some(name.to_string());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Read from the table but never written.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Mapping of a value object embedded into an entity table.
#[derive(Debug, Clone)]
pub struct EmbeddableMappingConfiguration {
    pub class: ClassName,
    pub properties: Vec<PropertyLinkage>,
    pub insets: Vec<InsetConfiguration>,
    pub mapped_super_class: Option<Rc<EmbeddableMappingConfiguration>>,
}

impl EmbeddableMappingConfiguration {
    pub fn new(class: impl Into<ClassName>) -> Self {
        Self {
            class: class.into(),
            properties: Vec::new(),
            insets: Vec::new(),
            mapped_super_class: None,
        }
    }

    pub fn property(mut self, linkage: PropertyLinkage) -> Self {
        self.properties.push(linkage);
        self
    }

    pub fn embed(mut self, inset: InsetConfiguration) -> Self {
        self.insets.push(inset);
        self
    }

    pub fn mapped_super_class(mut self, parent: Rc<EmbeddableMappingConfiguration>) -> Self {
        self.mapped_super_class = Some(parent);
        self
    }
}

/// An embedded property: the columns of `embeddable` are flattened into the owner table.
#[derive(Debug, Clone)]
pub struct InsetConfiguration {
    pub property: String,
    pub embeddable: Rc<EmbeddableMappingConfiguration>,
    /// Embedded property name to column name.
    pub overrides: BTreeMap<String, String>,
    pub excluded: BTreeSet<String>,
    /// Derive column names from the whole accessor path (`address_city`).
    pub prefixed: bool,
}

impl InsetConfiguration {
    pub fn new(property: &str, embeddable: Rc<EmbeddableMappingConfiguration>) -> Self {
        Self {
            property: property.to_string(),
            embeddable,
            overrides: BTreeMap::new(),
            excluded: BTreeSet::new(),
            prefixed: false,
        }
    }

    pub fn override_column(mut self, property: &str, column: &str) -> Self {
        self.overrides
            .insert(property.to_string(), column.to_string());
        self
    }

    pub fn exclude(mut self, property: &str) -> Self {
        self.excluded.insert(property.to_string());
        self
    }

    pub fn prefixed(mut self) -> Self {
        self.prefixed = true;
        self
    }
}

/// Table inheritance: the entity extends `parent`, whose mapping is inherited.
///
/// With `joined_table` the parent level keeps its own table, joined on the primary key.
/// Otherwise both levels share the child's table.
#[derive(Debug, Clone)]
pub struct InheritanceConfiguration {
    pub parent: Rc<EntityMappingConfiguration>,
    pub joined_table: bool,
}

/// Declarative description of one entity type.
#[derive(Clone)]
pub struct EntityMappingConfiguration {
    pub class: ClassName,
    pub table_name: Option<String>,
    pub identifiers: Vec<IdentifierDeclaration>,
    pub properties: Vec<PropertyLinkage>,
    pub insets: Vec<InsetConfiguration>,
    pub mapped_super_class: Option<Rc<EntityMappingConfiguration>>,
    pub inheritance: Option<InheritanceConfiguration>,
    pub one_to_ones: Vec<OneToOneRelation>,
    pub one_to_manys: Vec<OneToManyRelation>,
    pub element_collections: Vec<ElementCollectionRelation>,
    pub polymorphism: Option<PolymorphismPolicy>,
    pub naming: Rc<dyn NamingStrategy>,
}

impl EntityMappingConfiguration {
    pub fn new(class: impl Into<ClassName>) -> Self {
        Self {
            class: class.into(),
            table_name: None,
            identifiers: Vec::new(),
            properties: Vec::new(),
            insets: Vec::new(),
            mapped_super_class: None,
            inheritance: None,
            one_to_ones: Vec::new(),
            one_to_manys: Vec::new(),
            element_collections: Vec::new(),
            polymorphism: None,
            naming: Rc::new(DefaultNamingStrategy),
        }
    }

    pub fn table(mut self, name: &str) -> Self {
        self.table_name = Some(name.to_string());
        self
    }

    pub fn identifier(mut self, declaration: IdentifierDeclaration) -> Self {
        self.identifiers.push(declaration);
        self
    }

    pub fn property(mut self, linkage: PropertyLinkage) -> Self {
        self.properties.push(linkage);
        self
    }

    pub fn embed(mut self, inset: InsetConfiguration) -> Self {
        self.insets.push(inset);
        self
    }

    /// Properties of `parent` are mapped into this entity's table, no parent table exists.
    pub fn map_super_class(mut self, parent: Rc<EntityMappingConfiguration>) -> Self {
        self.mapped_super_class = Some(parent);
        self
    }

    pub fn inherits(mut self, parent: Rc<EntityMappingConfiguration>) -> Self {
        self.inheritance = Some(InheritanceConfiguration {
            parent,
            joined_table: false,
        });
        self
    }

    pub fn inherits_joined(mut self, parent: Rc<EntityMappingConfiguration>) -> Self {
        self.inheritance = Some(InheritanceConfiguration {
            parent,
            joined_table: true,
        });
        self
    }

    pub fn one_to_one(mut self, relation: OneToOneRelation) -> Self {
        self.one_to_ones.push(relation);
        self
    }

    pub fn one_to_many(mut self, relation: OneToManyRelation) -> Self {
        self.one_to_manys.push(relation);
        self
    }

    pub fn element_collection(mut self, relation: ElementCollectionRelation) -> Self {
        self.element_collections.push(relation);
        self
    }

    pub fn polymorphism(mut self, policy: PolymorphismPolicy) -> Self {
        self.polymorphism = Some(policy);
        self
    }

    pub fn naming(mut self, strategy: Rc<dyn NamingStrategy>) -> Self {
        self.naming = strategy;
        self
    }

    fn collect<T: Clone>(&self, pick: fn(&EntityMappingConfiguration) -> &Vec<T>) -> Vec<T> {
        let mut items = self
            .mapped_super_class
            .as_ref()
            .map(|parent| parent.collect(pick))
            .unwrap_or_default();
        items.extend(pick(self).iter().cloned());
        items
    }

    /// Properties of this level, mapped superclasses first.
    pub fn effective_properties(&self) -> Vec<PropertyLinkage> {
        self.collect(|c| &c.properties)
    }

    pub fn effective_insets(&self) -> Vec<InsetConfiguration> {
        self.collect(|c| &c.insets)
    }

    pub fn effective_identifiers(&self) -> Vec<IdentifierDeclaration> {
        self.collect(|c| &c.identifiers)
    }

    pub fn effective_one_to_ones(&self) -> Vec<OneToOneRelation> {
        self.collect(|c| &c.one_to_ones)
    }

    pub fn effective_one_to_manys(&self) -> Vec<OneToManyRelation> {
        self.collect(|c| &c.one_to_manys)
    }

    pub fn effective_element_collections(&self) -> Vec<ElementCollectionRelation> {
        self.collect(|c| &c.element_collections)
    }

    /// Inheritance chain from this configuration up to the root, this one first.
    pub fn inheritance_chain(self: &Rc<Self>) -> Vec<Rc<EntityMappingConfiguration>> {
        let mut chain = vec![Rc::clone(self)];
        let mut current = Rc::clone(self);
        while let Some(inheritance) = &current.inheritance {
            let parent = Rc::clone(&inheritance.parent);
            chain.push(Rc::clone(&parent));
            current = parent;
        }
        chain
    }
}

impl fmt::Debug for EntityMappingConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMappingConfiguration")
            .field("class", &self.class)
            .field("table_name", &self.table_name)
            .field("identifiers", &self.identifiers)
            .field("properties", &self.properties)
            .field("one_to_ones", &self.one_to_ones.len())
            .field("one_to_manys", &self.one_to_manys.len())
            .field("element_collections", &self.element_collections.len())
            .finish_non_exhaustive()
    }
}
