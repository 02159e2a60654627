//! Entity Session Library
//!
//! This library provides a small persistence core: a bounded connection pool,
//! a programmatic entity-to-table mapping, sessions with explicit transaction
//! scoping, and a coordinated shutdown path. Backed by `sqlx` connections to
//! SQLite, PostgreSQL and MySQL.

pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod session;
pub mod shutdown;

pub use config::{Config, PoolConfig};
pub use db::{ConnectionPool, DatabaseType, PoolStatus, PooledConnection};
pub use entity::{
    ColumnType, EntityDefinition, EntityInstance, EntityRegistry, RelationKind, Value,
};
pub use error::{OrmError, OrmResult, TransactionStage};
pub use session::{
    Predicate, PreparedQuery, QueryCursor, Session, SessionManager, TransactionRunner,
    TransactionState,
};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
