//! Entity instances.

use crate::entity::value::Value;
use crate::error::{OrmError, OrmResult};
use serde::Serialize;
use std::collections::BTreeMap;

/// A record of a registered entity: column values plus an optional identity.
///
/// The identity is absent for transient instances and set exactly once, when the
/// store persists the instance. Persisted instances also carry the identity in
/// their primary-key column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityInstance {
    entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    values: BTreeMap<String, Value>,
}

impl EntityInstance {
    /// Create a transient instance of `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: None,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Build a persisted instance from a decoded row.
    pub(crate) fn from_row(
        entity: impl Into<String>,
        id: Value,
        values: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            entity: entity.into(),
            id: Some(id),
            values,
        }
    }

    /// Record the identity assigned by the store.
    ///
    /// Fails if an identity was already assigned; identities never change.
    pub(crate) fn assign_identity(&mut self, primary_key: &str, id: Value) -> OrmResult<()> {
        if let Some(existing) = &self.id {
            return Err(OrmError::invalid_input(format!(
                "{} already has identity {}",
                self.entity, existing
            )));
        }
        self.values.insert(primary_key.to_string(), id.clone());
        self.id = Some(id);
        Ok(())
    }

    /// Compare the column values of `other` present in `self`.
    ///
    /// Useful for checking that a reloaded row matches what was written.
    pub fn matches_fields_of(&self, other: &EntityInstance) -> bool {
        self.values
            .iter()
            .all(|(column, value)| other.values.get(column) == Some(value))
    }
}
