//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Driver-specific physical connections
//! - Connection pool management
//! - Parameter binding and row decoding
//! - Dialect helpers for placeholders and identifier quoting
//! - Connection dispatch macros for reducing code duplication

pub mod connection;
pub mod dialect;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod types;

pub use connection::{DatabaseType, DbConnection};
pub use pool::{ConnectionPool, MaintenanceReport, PoolCloseReport, PoolStatus, PooledConnection};
pub use types::RowToInstance;
