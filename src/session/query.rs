//! Statement rendering for entity operations.
//!
//! Every statement is built from the entity definition with `?` placeholders,
//! quoted identifiers, and a deterministic row order (by primary key), then
//! rewritten for the target database by [`substitute_placeholders`].

use crate::db::DatabaseType;
use crate::db::dialect::{count_placeholders, quote_ident, substitute_placeholders};
use crate::entity::{EntityDefinition, Value};
use crate::error::{OrmError, OrmResult};
use std::sync::Arc;

/// Row filter for a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Every row of the table
    All,
    /// `column = ?`, bound to the first parameter
    ColumnEquals(String),
    /// A SQL condition with `?` placeholders, e.g. `"age > ? AND occupation = ?"`
    Sql(String),
}

impl Predicate {
    pub fn all() -> Self {
        Self::All
    }

    pub fn eq(column: impl Into<String>) -> Self {
        Self::ColumnEquals(column.into())
    }

    pub fn sql(condition: impl Into<String>) -> Self {
        Self::Sql(condition.into())
    }

    fn render(&self, db_type: DatabaseType, definition: &EntityDefinition) -> OrmResult<Option<String>> {
        match self {
            Self::All => Ok(None),
            Self::ColumnEquals(column) => {
                if !definition.has_column(column) {
                    return Err(unknown_column(definition, column));
                }
                Ok(Some(format!("{} = ?", quote_ident(db_type, column))))
            }
            Self::Sql(condition) if condition.trim().is_empty() => {
                Err(OrmError::invalid_input("Empty query condition"))
            }
            Self::Sql(condition) => Ok(Some(condition.clone())),
        }
    }
}

/// A rendered, parameterized select over one entity.
///
/// Owns its SQL and parameters so that a cursor can borrow them for as long as
/// it is open.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    entity: Arc<EntityDefinition>,
    sql: String,
    params: Vec<Value>,
}

impl PreparedQuery {
    /// Render a select of `definition` filtered by `predicate`.
    ///
    /// Fails with `InvalidInput` if the number of parameters does not match the
    /// placeholders in the predicate.
    pub fn new(
        db_type: DatabaseType,
        entity: Arc<EntityDefinition>,
        predicate: &Predicate,
        params: Vec<Value>,
    ) -> OrmResult<Self> {
        let condition = predicate.render(db_type, &entity)?;
        let expected = condition.as_deref().map(count_placeholders).unwrap_or(0);
        if expected != params.len() {
            return Err(OrmError::invalid_input(format!(
                "Query on '{}' expects {} parameter(s), got {}",
                entity.name(),
                expected,
                params.len()
            )));
        }

        let sql = select_sql(db_type, &entity, condition.as_deref());
        Ok(Self { entity, sql, params })
    }

    pub fn entity(&self) -> &Arc<EntityDefinition> {
        &self.entity
    }

    /// SQL as sent to the database.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

fn unknown_column(definition: &EntityDefinition, column: &str) -> OrmError {
    OrmError::invalid_input(format!(
        "'{}' is not a column of '{}'",
        column,
        definition.name()
    ))
}

fn column_list(db_type: DatabaseType, definition: &EntityDefinition) -> String {
    definition
        .columns()
        .iter()
        .map(|c| quote_ident(db_type, &c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn select_sql(
    db_type: DatabaseType,
    definition: &EntityDefinition,
    condition: Option<&str>,
) -> String {
    let mut sql = format!(
        "SELECT {} FROM {}",
        column_list(db_type, definition),
        quote_ident(db_type, definition.table())
    );
    if let Some(condition) = condition {
        sql.push_str(" WHERE ");
        sql.push_str(condition);
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&quote_ident(db_type, definition.primary_key()));
    substitute_placeholders(db_type, &sql)
}

/// Select a single row by primary key.
pub(crate) fn select_by_id_sql(db_type: DatabaseType, definition: &EntityDefinition) -> String {
    let condition = format!("{} = ?", quote_ident(db_type, definition.primary_key()));
    select_sql(db_type, definition, Some(&condition))
}

/// Insert `columns`; on PostgreSQL a generated primary key is returned by the statement.
pub(crate) fn insert_sql(db_type: DatabaseType, definition: &EntityDefinition, columns: &[&str]) -> String {
    let table = quote_ident(db_type, definition.table());
    let mut sql = if columns.is_empty() {
        match db_type {
            DatabaseType::MySQL => format!("INSERT INTO {} () VALUES ()", table),
            DatabaseType::PostgreSQL | DatabaseType::SQLite => {
                format!("INSERT INTO {} DEFAULT VALUES", table)
            }
        }
    } else {
        let names = columns
            .iter()
            .map(|c| quote_ident(db_type, c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        format!("INSERT INTO {} ({}) VALUES ({})", table, names, placeholders)
    };

    if db_type == DatabaseType::PostgreSQL && definition.generated_identity() {
        sql.push_str(" RETURNING ");
        sql.push_str(&quote_ident(db_type, definition.primary_key()));
    }
    substitute_placeholders(db_type, &sql)
}

/// Update `columns` of the row with the bound primary key (last parameter).
pub(crate) fn update_sql(db_type: DatabaseType, definition: &EntityDefinition, columns: &[&str]) -> String {
    let assignments = columns
        .iter()
        .map(|c| format!("{} = ?", quote_ident(db_type, c)))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote_ident(db_type, definition.table()),
        assignments,
        quote_ident(db_type, definition.primary_key())
    );
    substitute_placeholders(db_type, &sql)
}

/// Delete the rows whose `column` equals the bound parameter.
pub(crate) fn delete_sql(db_type: DatabaseType, definition: &EntityDefinition, column: &str) -> String {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_ident(db_type, definition.table()),
        quote_ident(db_type, column)
    );
    substitute_placeholders(db_type, &sql)
}

/// Prepare a raw statement: validate the parameter count and rewrite placeholders.
pub(crate) fn raw_sql(db_type: DatabaseType, sql: &str, params: &[Value]) -> OrmResult<String> {
    let expected = count_placeholders(sql);
    if expected != params.len() {
        return Err(OrmError::invalid_input(format!(
            "Statement expects {} parameter(s), got {}",
            expected,
            params.len()
        )));
    }
    Ok(substitute_placeholders(db_type, sql))
}
