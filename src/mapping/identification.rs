use crate::config::{EntityMappingConfiguration, IdentifierPolicy};
use crate::core::{ClassName, DataType, MappingError, Result};
use crate::model::PropertyAccessor;
use std::rc::Rc;

/// Identifier of an entity hierarchy and the configuration that declares it.
#[derive(Debug, Clone)]
pub struct Identification {
    pub accessor: PropertyAccessor,
    pub data_type: DataType,
    pub policy: IdentifierPolicy,
    pub column: Option<String>,
    pub definer: ClassName,
}

/// Mapped superclass and table inheritance are exclusive on every level of the chain,
/// mapped superclasses included.
pub fn check_inheritance(config: &Rc<EntityMappingConfiguration>) -> Result<()> {
    for level in config.inheritance_chain() {
        let mut current = Some(Rc::clone(&level));
        while let Some(candidate) = current {
            if candidate.mapped_super_class.is_some() && candidate.inheritance.is_some() {
                return Err(MappingError::ConflictingInheritance(format!(
                    "{} declares both a mapped superclass and table inheritance",
                    candidate.class
                )));
            }
            current = candidate.mapped_super_class.clone();
        }
    }
    Ok(())
}

/// Walks the inheritance chain from `config` to its root and returns the single identifier
/// declaration found on the way.
pub fn determine_identification(config: &Rc<EntityMappingConfiguration>) -> Result<Identification> {
    check_inheritance(config)?;

    let mut found: Option<Identification> = None;
    for level in config.inheritance_chain() {
        for declaration in level.effective_identifiers() {
            if let Some(previous) = &found {
                return Err(MappingError::DuplicateMapping(format!(
                    "identifier of {} is declared by both {} ({}) and {} ({})",
                    config.class, previous.definer, previous.accessor, level.class, declaration.property
                )));
            }
            found = Some(Identification {
                accessor: PropertyAccessor::new(level.class.clone(), &declaration.property),
                data_type: declaration.data_type.clone(),
                policy: declaration.policy.clone(),
                column: declaration.column.clone(),
                definer: level.class.clone(),
            });
        }
    }

    found.ok_or_else(|| {
        MappingError::MissingIdentification(format!(
            "no configuration in the inheritance chain of {} declares an identifier",
            config.class
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IdentifierDeclaration, PropertyLinkage};

    fn vehicle() -> Rc<EntityMappingConfiguration> {
        Rc::new(
            EntityMappingConfiguration::new("Vehicle")
                .identifier(IdentifierDeclaration::new("id", DataType::Integer, IdentifierPolicy::Assigned))
                .property(PropertyLinkage::new("color", DataType::Text)),
        )
    }

    #[test]
    fn test_identifier_found_on_root() {
        let car = Rc::new(EntityMappingConfiguration::new("Car").inherits(vehicle()));
        let identification = determine_identification(&car).unwrap();
        assert_eq!(identification.definer, ClassName::new("Vehicle"));
        assert_eq!(identification.accessor.name(), "id");
        assert!(matches!(identification.policy, IdentifierPolicy::Assigned));
    }

    #[test]
    fn test_missing_identifier() {
        let orphan = Rc::new(EntityMappingConfiguration::new("Orphan"));
        assert!(matches!(
            determine_identification(&orphan),
            Err(MappingError::MissingIdentification(_))
        ));
    }

    #[test]
    fn test_identifier_declared_twice() {
        let car = Rc::new(
            EntityMappingConfiguration::new("Car")
                .identifier(IdentifierDeclaration::new("code", DataType::Text, IdentifierPolicy::Assigned))
                .inherits(vehicle()),
        );
        assert!(matches!(
            determine_identification(&car),
            Err(MappingError::DuplicateMapping(_))
        ));
    }

    #[test]
    fn test_mapped_super_class_identifier() {
        let base = Rc::new(
            EntityMappingConfiguration::new("AbstractEntity")
                .identifier(IdentifierDeclaration::new("id", DataType::Integer, IdentifierPolicy::DatabaseGenerated)),
        );
        let person = Rc::new(EntityMappingConfiguration::new("Person").map_super_class(base));
        let identification = determine_identification(&person).unwrap();
        assert!(identification.policy.is_database_generated());
    }

    #[test]
    fn test_conflicting_inheritance() {
        let base = Rc::new(EntityMappingConfiguration::new("Base"));
        let car = Rc::new(
            EntityMappingConfiguration::new("Car")
                .map_super_class(base)
                .inherits(vehicle()),
        );
        assert!(matches!(
            determine_identification(&car),
            Err(MappingError::ConflictingInheritance(_))
        ));
    }
}
