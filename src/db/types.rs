//! Row decoding.
//!
//! Rows are decoded by the semantic [`ColumnType`] declared in the entity
//! definition rather than by the driver's type name: the mapping says what a
//! column holds, and each driver decoder tries the widths that driver may return
//! for it.
//!
//! Statements always select the definition's columns in declaration order, so
//! column `idx` of a row corresponds to `definition.columns()[idx]`.

use crate::entity::{ColumnType, EntityDefinition, EntityInstance, Value};
use crate::error::{OrmError, OrmResult};
use sqlx::Row;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use std::collections::BTreeMap;

/// Trait for converting driver rows into entity instances.
pub trait RowToInstance {
    /// Decode a single column as a [`Value`].
    fn decode_value(&self, idx: usize, column_type: ColumnType) -> OrmResult<Value>;

    fn to_instance(&self, definition: &EntityDefinition) -> OrmResult<EntityInstance> {
        let mut values = BTreeMap::new();
        for (idx, column) in definition.columns().iter().enumerate() {
            let value = self.decode_value(idx, column.column_type)?;
            values.insert(column.name.clone(), value);
        }
        let id = values
            .get(definition.primary_key())
            .cloned()
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                OrmError::internal(format!(
                    "Row of '{}' has no primary key value",
                    definition.name()
                ))
            })?;
        Ok(EntityInstance::from_row(definition.name(), id, values))
    }
}

fn decode_failed(idx: usize, column_type: ColumnType) -> OrmError {
    OrmError::internal(format!(
        "Failed to decode column {} as {}",
        idx, column_type
    ))
}

impl RowToInstance for MySqlRow {
    fn decode_value(&self, idx: usize, column_type: ColumnType) -> OrmResult<Value> {
        mysql::decode_column(self, idx, column_type)
    }
}

impl RowToInstance for PgRow {
    fn decode_value(&self, idx: usize, column_type: ColumnType) -> OrmResult<Value> {
        postgres::decode_column(self, idx, column_type)
    }
}

impl RowToInstance for SqliteRow {
    fn decode_value(&self, idx: usize, column_type: ColumnType) -> OrmResult<Value> {
        sqlite::decode_column(self, idx, column_type)
    }
}

// =============================================================================
// Driver-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, column_type: ColumnType) -> OrmResult<Value> {
        match column_type {
            ColumnType::Integer => decode_integer(row, idx),
            ColumnType::Real => decode_float(row, idx),
            ColumnType::Boolean => decode_boolean(row, idx),
            ColumnType::Blob => decode_blob(row, idx),
            ColumnType::Text => decode_text(row, idx),
        }
        .ok_or_else(|| decode_failed(idx, column_type))
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Option<Value> {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return Some(Value::Null);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return Some(Value::Int(v));
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        // Auto-increment keys are often unsigned
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return i64::try_from(v).ok().map(Value::Int);
        }
        if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        None
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Option<Value> {
        match row.try_get::<Option<f64>, _>(idx) {
            Ok(v) => Some(v.map(Value::Float).unwrap_or(Value::Null)),
            Err(_) => row
                .try_get::<Option<f32>, _>(idx)
                .ok()
                .map(|v| v.map(|f| Value::Float(f.into())).unwrap_or(Value::Null)),
        }
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Bool).unwrap_or(Value::Null))
    }

    fn decode_blob(row: &MySqlRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Bytes).unwrap_or(Value::Null))
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Text).unwrap_or(Value::Null))
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, column_type: ColumnType) -> OrmResult<Value> {
        match column_type {
            ColumnType::Integer => decode_integer(row, idx),
            ColumnType::Real => decode_float(row, idx),
            ColumnType::Boolean => decode_boolean(row, idx),
            ColumnType::Blob => decode_blob(row, idx),
            ColumnType::Text => decode_text(row, idx),
        }
        .ok_or_else(|| decode_failed(idx, column_type))
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<Value> {
        // INT8, INT4 and INT2 are distinct types in PostgreSQL
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return Some(v.map(Value::Int).unwrap_or(Value::Null));
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return Some(v.map(|i| Value::Int(i.into())).unwrap_or(Value::Null));
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return Some(v.map(|i| Value::Int(i.into())).unwrap_or(Value::Null));
        }
        None
    }

    fn decode_float(row: &PgRow, idx: usize) -> Option<Value> {
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return Some(v.map(Value::Float).unwrap_or(Value::Null));
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return Some(v.map(|f| Value::Float(f.into())).unwrap_or(Value::Null));
        }
        None
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Bool).unwrap_or(Value::Null))
    }

    fn decode_blob(row: &PgRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Bytes).unwrap_or(Value::Null))
    }

    fn decode_text(row: &PgRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Text).unwrap_or(Value::Null))
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        column_type: ColumnType,
    ) -> OrmResult<Value> {
        match column_type {
            ColumnType::Integer => decode_integer(row, idx),
            ColumnType::Real => decode_float(row, idx),
            ColumnType::Boolean => decode_boolean(row, idx),
            ColumnType::Blob => decode_blob(row, idx),
            ColumnType::Text => decode_text(row, idx),
        }
        .ok_or_else(|| decode_failed(idx, column_type))
    }

    fn decode_integer(row: &SqliteRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Int).unwrap_or(Value::Null))
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<f64>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Float).unwrap_or(Value::Null))
    }

    fn decode_boolean(row: &SqliteRow, idx: usize) -> Option<Value> {
        // SQLite stores booleans as integers
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return Some(v.map(Value::Bool).unwrap_or(Value::Null));
        }
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .map(|v| v.map(|i| Value::Bool(i != 0)).unwrap_or(Value::Null))
    }

    fn decode_blob(row: &SqliteRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Bytes).unwrap_or(Value::Null))
    }

    fn decode_text(row: &SqliteRow, idx: usize) -> Option<Value> {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .map(|v| v.map(Value::Text).unwrap_or(Value::Null))
    }
}
