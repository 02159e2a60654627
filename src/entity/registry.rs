//! Registry of entity definitions.
//!
//! Definitions are registered at startup, but the registry stays open: an entity
//! may declare a relationship to a target that is registered later. Such forward
//! references are checked lazily, the first time the relationship is used.

use crate::entity::definition::{EntityDefinition, RelationKind, Relationship};
use crate::error::{OrmError, OrmResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// A relationship whose target is registered and consistent.
#[derive(Debug, Clone)]
pub struct ResolvedRelationship {
    pub source: Arc<EntityDefinition>,
    pub relationship: Relationship,
    pub target: Arc<EntityDefinition>,
}

impl ResolvedRelationship {
    /// The column on the target table to filter by when following this relationship
    /// from a source row.
    pub fn target_filter_column(&self) -> &str {
        match self.relationship.kind {
            RelationKind::OneToMany => &self.relationship.foreign_key,
            RelationKind::ManyToOne => self.target.primary_key(),
        }
    }
}

/// Thread-safe map from logical entity name to definition.
///
/// Uses std::sync::RwLock: no lock is ever held across an await point.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: RwLock<HashMap<String, Arc<EntityDefinition>>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition.
    ///
    /// Fails with `InvalidEntity` if the definition is inconsistent and with
    /// `DuplicateEntity` if the name is already taken.
    pub fn register(&self, definition: EntityDefinition) -> OrmResult<Arc<EntityDefinition>> {
        definition.validate()?;

        let mut entities = self.write()?;
        if entities.contains_key(definition.name()) {
            return Err(OrmError::duplicate_entity(definition.name()));
        }

        let name = definition.name().to_string();
        let definition = Arc::new(definition);
        entities.insert(name.clone(), Arc::clone(&definition));

        info!(
            entity = %name,
            table = %definition.table(),
            columns = definition.columns().len(),
            relationships = definition.relationships().len(),
            "Registered entity"
        );
        Ok(definition)
    }

    /// Look up a definition by logical name.
    pub fn resolve(&self, name: &str) -> OrmResult<Arc<EntityDefinition>> {
        self.read()?
            .get(name)
            .cloned()
            .ok_or_else(|| OrmError::unknown_entity(name))
    }

    /// Resolve a relationship declared on `entity`, validating its target.
    ///
    /// Fails with `UnresolvedRelationship` while the target is not registered.
    pub fn resolve_relationship(
        &self,
        entity: &str,
        relationship: &str,
    ) -> OrmResult<ResolvedRelationship> {
        let source = self.resolve(entity)?;
        let relation = source.relationship(relationship).cloned().ok_or_else(|| {
            OrmError::invalid_input(format!(
                "Entity '{}' has no relationship named '{}'",
                entity, relationship
            ))
        })?;

        let target = match self.resolve(&relation.target) {
            Ok(target) => target,
            Err(OrmError::UnknownEntity { .. }) => {
                return Err(OrmError::unresolved_relationship(
                    entity,
                    relationship,
                    &relation.target,
                ));
            }
            Err(e) => return Err(e),
        };

        if relation.kind == RelationKind::OneToMany && !target.has_column(&relation.foreign_key) {
            return Err(OrmError::invalid_entity(
                entity,
                format!(
                    "foreign key '{}' of relationship '{}' is not a column of '{}'",
                    relation.foreign_key,
                    relationship,
                    target.name()
                ),
            ));
        }

        debug!(entity = %entity, relationship = %relationship, target = %target.name(), "Resolved relationship");
        Ok(ResolvedRelationship {
            source,
            relationship: relation,
            target,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().map(|e| e.contains_key(name)).unwrap_or(false)
    }

    /// Names of all registered entities, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(
        &self,
    ) -> OrmResult<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<EntityDefinition>>>> {
        self.entities
            .read()
            .map_err(|_| OrmError::internal("entity registry lock poisoned"))
    }

    fn write(
        &self,
    ) -> OrmResult<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<EntityDefinition>>>> {
        self.entities
            .write()
            .map_err(|_| OrmError::internal("entity registry lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::definition::ColumnType;

    fn user() -> EntityDefinition {
        EntityDefinition::builder("User", "user")
            .column("id", ColumnType::Integer, false)
            .column("name", ColumnType::Text, true)
            .primary_key("id")
            .one_to_many("addresses", "Address", "user_id")
            .build()
    }

    fn address() -> EntityDefinition {
        EntityDefinition::builder("Address", "address")
            .column("id", ColumnType::Integer, false)
            .column("street", ColumnType::Text, false)
            .column("user_id", ColumnType::Integer, false)
            .primary_key("id")
            .many_to_one("user", "User", "user_id")
            .build()
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = EntityRegistry::new();
        assert!(registry.is_empty());
        registry.register(user()).unwrap();
        let def = registry.resolve("User").unwrap();
        assert_eq!(def.table(), "user");
        assert!(registry.contains("User"));
        assert_eq!(registry.names(), vec!["User".to_string()]);
    }

    #[test]
    fn test_duplicate_entity() {
        let registry = EntityRegistry::new();
        registry.register(user()).unwrap();
        let err = registry.register(user()).unwrap_err();
        assert!(matches!(err, OrmError::DuplicateEntity { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_entity() {
        let registry = EntityRegistry::new();
        let err = registry.resolve("Ghost").unwrap_err();
        assert!(matches!(err, OrmError::UnknownEntity { .. }));
    }

    #[test]
    fn test_invalid_definition_is_not_registered() {
        let registry = EntityRegistry::new();
        let bad = EntityDefinition::builder("Bad", "bad")
            .column("id", ColumnType::Integer, false)
            .primary_key("missing")
            .build();
        assert!(matches!(
            registry.register(bad),
            Err(OrmError::InvalidEntity { .. })
        ));
        assert!(!registry.contains("Bad"));
    }

    #[test]
    fn test_forward_reference_resolves_after_registration() {
        let registry = EntityRegistry::new();
        registry.register(address()).unwrap();

        let err = registry.resolve_relationship("Address", "user").unwrap_err();
        assert!(matches!(err, OrmError::UnresolvedRelationship { .. }));

        registry.register(user()).unwrap();
        let resolved = registry.resolve_relationship("Address", "user").unwrap();
        assert_eq!(resolved.target.name(), "User");
        assert_eq!(resolved.target_filter_column(), "id");

        let back = registry.resolve_relationship("User", "addresses").unwrap();
        assert_eq!(back.target_filter_column(), "user_id");
    }

    #[test]
    fn test_one_to_many_foreign_key_checked_lazily() {
        let registry = EntityRegistry::new();
        let owner = EntityDefinition::builder("Owner", "owner")
            .column("id", ColumnType::Integer, false)
            .primary_key("id")
            .one_to_many("pets", "Pet", "owner_ref")
            .build();
        let pet = EntityDefinition::builder("Pet", "pet")
            .column("id", ColumnType::Integer, false)
            .column("owner_id", ColumnType::Integer, false)
            .primary_key("id")
            .build();
        registry.register(owner).unwrap();
        registry.register(pet).unwrap();

        let err = registry.resolve_relationship("Owner", "pets").unwrap_err();
        assert!(matches!(err, OrmError::InvalidEntity { .. }));
    }

    #[test]
    fn test_unknown_relationship_name() {
        let registry = EntityRegistry::new();
        registry.register(user()).unwrap();
        let err = registry.resolve_relationship("User", "friends").unwrap_err();
        assert!(matches!(err, OrmError::InvalidInput { .. }));
    }
}
