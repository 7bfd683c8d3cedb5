use crate::core::ClassName;
use crate::model::PropertyAccessor;
use convert_case::{Case, Casing};

/// Names of generated schema objects.
///
/// Every method has a snake case default; implementors override what they need.
pub trait NamingStrategy {
    fn table_name(&self, class: &ClassName) -> String {
        class.as_str().to_case(Case::Snake)
    }

    fn column_name(&self, accessor: &PropertyAccessor) -> String {
        accessor.name().to_case(Case::Snake)
    }

    /// Foreign key column held by the source table of a relation.
    fn join_column_name(&self, accessor: &PropertyAccessor) -> String {
        format!("{}_id", accessor.name().to_case(Case::Snake))
    }

    /// Foreign key column pointing back to the source when no reverse property names it.
    fn reverse_column_name(&self, source_table: &str, source_key: &str) -> String {
        format!("{}_{}", source_table, source_key)
    }

    fn foreign_key_name(&self, table: &str, column: &str, target_table: &str, target_column: &str) -> String {
        format!("FK_{}_{}_{}_{}", table, column, target_table, target_column)
    }

    fn association_table_name(&self, source_table: &str, accessor: &PropertyAccessor) -> String {
        format!("{}_{}", source_table, accessor.name().to_case(Case::Snake))
    }

    fn association_member_column(&self, target_table: &str, target_key: &str) -> String {
        format!("{}_{}", target_table, target_key)
    }

    fn index_column_name(&self, _accessor: &PropertyAccessor) -> String {
        "idx".to_string()
    }

    fn element_table_name(&self, source_table: &str, accessor: &PropertyAccessor) -> String {
        format!("{}_{}", source_table, accessor.name().to_case(Case::Snake))
    }

    fn element_column_name(&self, _accessor: &PropertyAccessor) -> String {
        "element".to_string()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNamingStrategy;

impl NamingStrategy for DefaultNamingStrategy {}
