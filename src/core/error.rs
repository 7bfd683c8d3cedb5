use thiserror::Error;

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("Missing identification: {0}")]
    MissingIdentification(String),

    #[error("Conflicting inheritance: {0}")]
    ConflictingInheritance(String),

    #[error("Duplicate mapping: {0}")]
    DuplicateMapping(String),

    #[error("Column '{column}' is mapped more than once in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    #[error("No value binder registered for {0}")]
    MissingBinder(String),

    #[error("Incompatible polymorphism: {0}")]
    IncompatiblePolymorphism(String),

    #[error("Ambiguous table: {0}")]
    AmbiguousTable(String),

    #[error("Unsupported relation: {0}")]
    UnsupportedRelation(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Relation '{property}' of '{class}' is mandatory but has no target")]
    RelationMandatoryViolation { class: String, property: String },

    #[error("Unknown subtype: {0}")]
    UnknownSubtype(String),

    #[error("Property '{0}' is not mapped")]
    UnmappedProperty(String),

    #[error("Stale entity: {0}")]
    StaleEntity(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Settings error: {0}")]
    SettingsError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl MappingError {
    /// Errors raised while building persisters, never while running them.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::MissingIdentification(_)
                | Self::ConflictingInheritance(_)
                | Self::DuplicateMapping(_)
                | Self::DuplicateColumn { .. }
                | Self::MissingBinder(_)
                | Self::IncompatiblePolymorphism(_)
                | Self::AmbiguousTable(_)
                | Self::UnsupportedRelation(_)
                | Self::UnknownEntity(_)
                | Self::InvalidConfiguration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MappingError>;

impl From<std::io::Error> for MappingError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for MappingError {
    fn from(err: serde_json::Error) -> Self {
        Self::SettingsError(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for MappingError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::ExecutionError(format!("lock poisoned: {}", err))
    }
}
