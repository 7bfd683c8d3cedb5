pub mod catalog;
pub mod memory;
pub mod pattern;
pub mod table;

pub use catalog::Catalog;
pub use memory::{MemoryDatabase, StatementKind, StatementRecord};
pub use table::Table;
