pub mod binder;
pub mod executor;
pub mod statement;

pub use binder::{BinderRegistry, ValueBinder};
pub use executor::SqlExecutor;
pub use statement::{
    ColumnRef, Criteria, DeleteStatement, InsertStatement, JoinClause, JoinKind, SelectQuery,
    UpdateStatement, WriteOutcome, WriteStatement,
};
