//! Physical database connections.
//!
//! This module wraps the driver-specific `sqlx` connection types behind a single
//! enum so the pool and sessions can hold any of them. Statement execution is
//! dispatched per variant with [`impl_conn_dispatch!`](crate::impl_conn_dispatch).

use crate::config::PoolConfig;
use crate::error::{OrmError, OrmResult};
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Parse database type from a configured driver identity.
    pub fn from_driver_id(driver_id: &str) -> Option<Self> {
        match driver_id.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" | "org.postgresql.driver" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" | "com.mysql.cj.jdbc.driver" | "org.mariadb.jdbc.driver" => {
                Some(Self::MySQL)
            }
            "sqlite" | "sqlite3" | "org.sqlite.jdbc" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A live, driver-specific database connection.
#[derive(Debug)]
pub enum DbConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl DbConnection {
    /// Open a new physical connection using the pool configuration.
    pub async fn open(config: &PoolConfig) -> OrmResult<Self> {
        let db_type = config.database_type()?;
        match db_type {
            DatabaseType::MySQL => {
                let mut options = MySqlConnectOptions::from_str(&config.url)
                    .map_err(|e| invalid_url(config, e))?
                    .charset("utf8mb4")
                    .statement_cache_capacity(config.max_statements);
                if let Some(user) = &config.user {
                    options = options.username(user);
                }
                if let Some(pass) = &config.pass {
                    options = options.password(pass);
                }
                let conn = options.connect().await.map_err(connect_failed)?;
                Ok(DbConnection::MySql(conn))
            }
            DatabaseType::PostgreSQL => {
                let mut options = PgConnectOptions::from_str(&config.url)
                    .map_err(|e| invalid_url(config, e))?
                    .statement_cache_capacity(config.max_statements);
                if let Some(user) = &config.user {
                    options = options.username(user);
                }
                if let Some(pass) = &config.pass {
                    options = options.password(pass);
                }
                let conn = options.connect().await.map_err(connect_failed)?;
                Ok(DbConnection::Postgres(conn))
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(&config.url)
                    .map_err(|e| invalid_url(config, e))?
                    .create_if_missing(true)
                    .statement_cache_capacity(config.max_statements);
                let conn = options.connect().await.map_err(connect_failed)?;
                Ok(DbConnection::SQLite(conn))
            }
        }
    }

    /// Get the database type for this connection.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbConnection::MySql(_) => DatabaseType::MySQL,
            DbConnection::Postgres(_) => DatabaseType::PostgreSQL,
            DbConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Check that the connection is still alive.
    pub async fn ping(&mut self) -> OrmResult<()> {
        crate::impl_conn_dispatch!(self, {
            MySql(c) => c.ping().await,
            Postgres(c) => c.ping().await,
            SQLite(c) => c.ping().await,
        })
        .map_err(OrmError::from)
    }

    /// Gracefully close the connection.
    pub async fn close(self) -> OrmResult<()> {
        match self {
            DbConnection::MySql(c) => c.close().await,
            DbConnection::Postgres(c) => c.close().await,
            DbConnection::SQLite(c) => c.close().await,
        }
        .map_err(OrmError::from)
    }

    /// Run a statement through the simple query protocol, without parameters.
    ///
    /// Used for transaction control, which some servers refuse to prepare.
    pub async fn execute_unprepared(&mut self, sql: &str) -> OrmResult<()> {
        crate::impl_conn_dispatch!(self, {
            MySql(c) => sqlx::Executor::execute(c, sqlx::raw_sql(sql)).await.map(|_| ()),
            Postgres(c) => sqlx::Executor::execute(c, sqlx::raw_sql(sql)).await.map(|_| ()),
            SQLite(c) => sqlx::Executor::execute(c, sqlx::raw_sql(sql)).await.map(|_| ()),
        })
        .map_err(OrmError::from)
    }
}

fn invalid_url(config: &PoolConfig, err: sqlx::Error) -> OrmError {
    OrmError::config(format!(
        "Invalid connection URL {}: {}",
        config.masked_url(),
        err
    ))
}

fn connect_failed(err: sqlx::Error) -> OrmError {
    match OrmError::from(err) {
        OrmError::Database { message, .. } => {
            OrmError::connection_broken(format!("Failed to connect: {}", message))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_connection_string() {
        assert_eq!(
            DatabaseType::from_connection_string("postgresql://localhost/app"),
            Some(DatabaseType::PostgreSQL)
        );
        assert_eq!(
            DatabaseType::from_connection_string("MariaDB://localhost/app"),
            Some(DatabaseType::MySQL)
        );
        assert_eq!(
            DatabaseType::from_connection_string("sqlite:demo.db"),
            Some(DatabaseType::SQLite)
        );
        assert_eq!(DatabaseType::from_connection_string("redis://x"), None);
    }

    #[test]
    fn test_from_driver_id() {
        assert_eq!(
            DatabaseType::from_driver_id("org.postgresql.Driver"),
            Some(DatabaseType::PostgreSQL)
        );
        assert_eq!(
            DatabaseType::from_driver_id("  MySQL "),
            Some(DatabaseType::MySQL)
        );
        assert_eq!(
            DatabaseType::from_driver_id("sqlite"),
            Some(DatabaseType::SQLite)
        );
        assert_eq!(DatabaseType::from_driver_id("oracle"), None);
    }

    #[tokio::test]
    async fn test_open_sqlite_and_ping() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("conn.db").display());
        let mut conn = DbConnection::open(&PoolConfig::new(url)).await.unwrap();
        assert_eq!(conn.db_type(), DatabaseType::SQLite);
        conn.ping().await.unwrap();
        conn.execute_unprepared("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_rejects_bad_url() {
        let config = PoolConfig::new("sqlite:").with_driver_id("postgres");
        let err = DbConnection::open(&config).await.unwrap_err();
        assert!(matches!(err, OrmError::Config { .. }));
    }
}
