pub mod entity;

pub use entity::{ContextEntityType, DeleteMode, EntityRecord, UnknownEntityType};
