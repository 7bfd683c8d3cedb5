use super::entity::{InsetConfiguration, PropertyLinkage};
use super::relation::{ElementCollectionRelation, OneToManyRelation, OneToOneRelation};
use crate::core::{ClassName, DataType, Value};
use std::rc::Rc;

/// Mapping of one subtype of a polymorphic entity.
#[derive(Debug, Clone)]
pub struct SubEntityConfiguration {
    pub class: ClassName,
    pub table_name: Option<String>,
    pub properties: Vec<PropertyLinkage>,
    pub insets: Vec<InsetConfiguration>,
    pub one_to_ones: Vec<OneToOneRelation>,
    pub one_to_manys: Vec<OneToManyRelation>,
    pub element_collections: Vec<ElementCollectionRelation>,
    pub polymorphism: Option<PolymorphismPolicy>,
}

impl SubEntityConfiguration {
    pub fn new(class: impl Into<ClassName>) -> Self {
        Self {
            class: class.into(),
            table_name: None,
            properties: Vec::new(),
            insets: Vec::new(),
            one_to_ones: Vec::new(),
            one_to_manys: Vec::new(),
            element_collections: Vec::new(),
            polymorphism: None,
        }
    }

    pub fn table(mut self, name: &str) -> Self {
        self.table_name = Some(name.to_string());
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

    /// Nested policy: this subtype is itself polymorphic.
    pub fn polymorphism(mut self, policy: PolymorphismPolicy) -> Self {
        self.polymorphism = Some(policy);
        self
    }
}

#[derive(Debug, Clone)]
pub enum PolymorphismPolicy {
    /// One table for the whole hierarchy, rows tagged by a discriminator column.
    SingleTable {
        discriminator_column: String,
        discriminator_type: DataType,
        subtypes: Vec<(Value, Rc<SubEntityConfiguration>)>,
    },
    /// One table per level, joined on the primary key.
    JoinedTables {
        subtypes: Vec<Rc<SubEntityConfiguration>>,
    },
    /// One independent table per concrete subtype repeating the base columns.
    TablePerClass {
        subtypes: Vec<Rc<SubEntityConfiguration>>,
    },
}

impl PolymorphismPolicy {
    pub fn single_table() -> Self {
        Self::SingleTable {
            discriminator_column: "DTYPE".to_string(),
            discriminator_type: DataType::Text,
            subtypes: Vec::new(),
        }
    }

    pub fn joined_tables() -> Self {
        Self::JoinedTables {
            subtypes: Vec::new(),
        }
    }

    pub fn table_per_class() -> Self {
        Self::TablePerClass {
            subtypes: Vec::new(),
        }
    }

    /// Only meaningful for single-table policies, ignored otherwise.
    pub fn discriminator_column(mut self, column: &str, data_type: DataType) -> Self {
        if let Self::SingleTable {
            discriminator_column,
            discriminator_type,
            ..
        } = &mut self
        {
            *discriminator_column = column.to_string();
            *discriminator_type = data_type;
        }
        self
    }

    /// Single-table subtypes added this way are discriminated by their class name.
    pub fn add_subtype(self, sub: SubEntityConfiguration) -> Self {
        let discriminator = Value::Text(sub.class.to_string());
        self.add_discriminated_subtype(discriminator, sub)
    }

    pub fn add_discriminated_subtype(mut self, discriminator: impl Into<Value>, sub: SubEntityConfiguration) -> Self {
        let sub = Rc::new(sub);
        match &mut self {
            Self::SingleTable { subtypes, .. } => subtypes.push((discriminator.into(), sub)),
            Self::JoinedTables { subtypes } | Self::TablePerClass { subtypes } => subtypes.push(sub),
        }
        self
    }

    pub fn kind(&self) -> PolymorphismKind {
        match self {
            Self::SingleTable { .. } => PolymorphismKind::SingleTable,
            Self::JoinedTables { .. } => PolymorphismKind::JoinedTables,
            Self::TablePerClass { .. } => PolymorphismKind::TablePerClass,
        }
    }

    pub fn subtypes(&self) -> Vec<Rc<SubEntityConfiguration>> {
        match self {
            Self::SingleTable { subtypes, .. } => subtypes.iter().map(|(_, sub)| Rc::clone(sub)).collect(),
            Self::JoinedTables { subtypes } | Self::TablePerClass { subtypes } => subtypes.clone(),
        }
    }

    /// Whether `class` is a subtype of this policy or of a nested one.
    pub fn declares(&self, class: &ClassName) -> bool {
        self.subtypes().iter().any(|sub| {
            sub.class == *class || sub.polymorphism.as_ref().is_some_and(|nested| nested.declares(class))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolymorphismKind {
    SingleTable,
    JoinedTables,
    TablePerClass,
}

impl PolymorphismKind {
    /// Whether a subtype of a `self` hierarchy may declare a nested `nested` policy.
    pub fn accepts_nested(&self, nested: PolymorphismKind) -> bool {
        use PolymorphismKind::*;
        matches!(
            (self, nested),
            (JoinedTables, JoinedTables)
                | (JoinedTables, SingleTable)
                | (SingleTable, SingleTable)
                | (TablePerClass, TablePerClass)
        )
    }
}
