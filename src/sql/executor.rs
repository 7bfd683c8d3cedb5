use super::statement::{SelectQuery, WriteOutcome, WriteStatement};
use crate::core::{Result, Row};

/// Blocking execution of abstract statements.
///
/// Rows returned by `select` hold the values of `query.columns`, in order.
pub trait SqlExecutor {
    fn execute(&self, statement: &WriteStatement) -> Result<WriteOutcome>;

    fn select(&self, query: &SelectQuery) -> Result<Vec<Row>>;
}
