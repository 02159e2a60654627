//! Entity definitions.
//!
//! A definition is a plain data structure describing how a logical entity maps
//! onto a table. Definitions are built with [`EntityDefinition::builder`] and
//! become immutable once handed to the [`EntityRegistry`](super::EntityRegistry).

use crate::error::{OrmError, OrmResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Semantic type of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Signed 64-bit integer
    Integer,
    /// 64-bit float
    Real,
    Text,
    Boolean,
    Blob,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Real => write!(f, "real"),
            Self::Text => write!(f, "text"),
            Self::Boolean => write!(f, "boolean"),
            Self::Blob => write!(f, "blob"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// Direction of a relationship, seen from the entity that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// The target table holds `foreign_key` pointing at this entity's primary key.
    OneToMany,
    /// This table holds `foreign_key` pointing at the target's primary key.
    ManyToOne,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Name used to address the relationship in queries.
    pub name: String,
    pub kind: RelationKind,
    /// Logical name of the related entity. May be registered later.
    pub target: String,
    pub foreign_key: String,
    /// Delete related rows before the owner. Only honored on one-to-many.
    pub cascade_delete: bool,
}

/// Mapping of a logical entity onto a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDefinition {
    name: String,
    table: String,
    columns: Vec<ColumnDef>,
    primary_key: String,
    generated_identity: bool,
    relationships: Vec<Relationship>,
}

impl EntityDefinition {
    /// Start building a definition for entity `name` stored in `table`.
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> EntityDefinitionBuilder {
        EntityDefinitionBuilder {
            definition: EntityDefinition {
                name: name.into(),
                table: table.into(),
                columns: Vec::new(),
                primary_key: String::new(),
                generated_identity: true,
                relationships: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Whether the store assigns the primary key on insert.
    pub fn generated_identity(&self) -> bool {
        self.generated_identity
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn primary_key_column(&self) -> Option<&ColumnDef> {
        self.column(&self.primary_key)
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Check the definition is self-consistent. Relationship targets are not
    /// checked here; they may be registered later.
    pub fn validate(&self) -> OrmResult<()> {
        let invalid = |message: String| OrmError::invalid_entity(&self.name, message);

        if self.name.trim().is_empty() {
            return Err(invalid("entity name must not be empty".to_string()));
        }
        if self.table.trim().is_empty() {
            return Err(invalid("table name must not be empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(invalid("at least one column is required".to_string()));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(invalid(format!("duplicate column '{}'", column.name)));
            }
        }

        if self.primary_key.is_empty() {
            return Err(invalid("no primary key declared".to_string()));
        }
        if !self.has_column(&self.primary_key) {
            return Err(invalid(format!(
                "primary key '{}' is not in the column list",
                self.primary_key
            )));
        }

        let mut relation_names = HashSet::new();
        for relation in &self.relationships {
            if !relation_names.insert(relation.name.as_str()) {
                return Err(invalid(format!("duplicate relationship '{}'", relation.name)));
            }
            if relation.kind == RelationKind::ManyToOne && !self.has_column(&relation.foreign_key) {
                return Err(invalid(format!(
                    "foreign key '{}' of relationship '{}' is not in the column list",
                    relation.foreign_key, relation.name
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`EntityDefinition`].
#[derive(Debug, Clone)]
pub struct EntityDefinitionBuilder {
    definition: EntityDefinition,
}

impl EntityDefinitionBuilder {
    /// Add a column. Columns keep their declaration order.
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        self.definition.columns.push(ColumnDef {
            name: name.into(),
            column_type,
            nullable,
        });
        self
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.definition.primary_key = column.into();
        self
    }

    /// Set whether the store generates the primary key (default: true).
    pub fn generated_identity(mut self, generated: bool) -> Self {
        self.definition.generated_identity = generated;
        self
    }

    pub fn one_to_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationship(name, RelationKind::OneToMany, target, foreign_key, false)
    }

    pub fn many_to_one(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationship(name, RelationKind::ManyToOne, target, foreign_key, false)
    }

    /// Add a relationship with explicit cascade behavior.
    pub fn relationship(
        mut self,
        name: impl Into<String>,
        kind: RelationKind,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
        cascade_delete: bool,
    ) -> Self {
        self.definition.relationships.push(Relationship {
            name: name.into(),
            kind,
            target: target.into(),
            foreign_key: foreign_key.into(),
            cascade_delete,
        });
        self
    }

    pub fn build(self) -> EntityDefinition {
        self.definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> EntityDefinitionBuilder {
        EntityDefinition::builder("User", "user")
            .column("id", ColumnType::Integer, false)
            .column("name", ColumnType::Text, true)
            .column("age", ColumnType::Integer, true)
            .column("occupation", ColumnType::Text, false)
            .primary_key("id")
    }

    #[test]
    fn test_valid_definition() {
        let def = user().one_to_many("addresses", "Address", "user_id").build();
        assert!(def.validate().is_ok());
        assert_eq!(def.columns().len(), 4);
        assert_eq!(def.primary_key_column().unwrap().column_type, ColumnType::Integer);
        assert!(def.generated_identity());
        assert_eq!(
            def.relationship("addresses").unwrap().kind,
            RelationKind::OneToMany
        );
    }

    #[test]
    fn test_primary_key_must_exist() {
        let def = user().primary_key("uuid").build();
        let err = def.validate().unwrap_err();
        assert!(matches!(err, OrmError::InvalidEntity { .. }));
        assert!(err.to_string().contains("uuid"));
    }

    #[test]
    fn test_missing_primary_key() {
        let def = EntityDefinition::builder("Tag", "tag")
            .column("label", ColumnType::Text, false)
            .build();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_duplicate_column() {
        let def = user().column("name", ColumnType::Text, true).build();
        assert!(def.validate().unwrap_err().to_string().contains("duplicate column"));
    }

    #[test]
    fn test_many_to_one_foreign_key_must_be_local() {
        let def = EntityDefinition::builder("Address", "address")
            .column("id", ColumnType::Integer, false)
            .primary_key("id")
            .many_to_one("user", "User", "user_id")
            .build();
        assert!(def.validate().unwrap_err().to_string().contains("user_id"));
    }

    #[test]
    fn test_duplicate_relationship() {
        let def = user()
            .one_to_many("addresses", "Address", "user_id")
            .one_to_many("addresses", "Address", "owner_id")
            .build();
        assert!(def.validate().is_err());
    }
}
