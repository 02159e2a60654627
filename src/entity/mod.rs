//! Entity mapping layer.
//!
//! This module provides the programmatic mapping from logical entities to tables:
//! - Column values
//! - Entity definitions and their builder
//! - The shared entity registry with lazy relationship resolution
//! - Entity instances

pub mod definition;
pub mod instance;
pub mod registry;
pub mod value;

pub use definition::{
    ColumnDef, ColumnType, EntityDefinition, EntityDefinitionBuilder, RelationKind, Relationship,
};
pub use instance::EntityInstance;
pub use registry::{EntityRegistry, ResolvedRelationship};
pub use value::Value;
