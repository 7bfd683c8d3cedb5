pub mod error;
pub mod types;
pub mod value;

pub use error::{MappingError, Result};
pub use types::{ClassName, RelationId, Row};
pub use value::{DataType, Value};
