pub mod accessor;
pub mod instance;

pub use accessor::{PathLink, PropertyAccessor};
pub use instance::{EntityRef, Instance, InstanceKey, Property};
