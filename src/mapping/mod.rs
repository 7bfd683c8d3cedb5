pub mod builder;
pub mod identification;

pub use builder::{
    ColumnBinding, Mapping, MappingBuilder, PropertyMapping, add_technical_column,
    check_unique_columns,
};
pub use identification::{Identification, check_inheritance, determine_identification};
