//! Parameter binding utilities for database queries.
//!
//! This module provides functions to bind [`Value`]s to driver-specific query
//! objects. Every statement the session issues goes through one of these.

use crate::entity::Value;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q Value,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q Value,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Build a MySQL query with all parameters bound.
pub(crate) fn mysql_query<'q>(
    sql: &'q str,
    params: &'q [Value],
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_mysql_param(query, param))
}

/// Build a PostgreSQL query with all parameters bound.
pub(crate) fn postgres_query<'q>(
    sql: &'q str,
    params: &'q [Value],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_postgres_param(query, param))
}

/// Build a SQLite query with all parameters bound.
pub(crate) fn sqlite_query<'q>(
    sql: &'q str,
    params: &'q [Value],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_sqlite_param(query, param))
}
