//! Connection dispatch macros for reducing code duplication.
//!
//! This module provides declarative macros that generate driver-specific
//! match arms over [`DbConnection`](crate::db::DbConnection) while keeping each
//! call site readable. The macros expand at compile time with zero runtime overhead.

/// Macro for generating connection dispatch match arms.
///
/// Each arm binds the driver-specific connection and evaluates its body. All
/// arms must produce the same type.
///
/// # Example
///
/// ```ignore
/// impl_conn_dispatch!(conn, {
///     MySql(c) => c.ping().await,
///     Postgres(c) => c.ping().await,
///     SQLite(c) => c.ping().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_conn_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::connection::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_conn_dispatch;

#[cfg(test)]
mod tests {
    use crate::db::DatabaseType;

    #[test]
    fn test_database_type_debug() {
        assert_eq!(format!("{:?}", DatabaseType::MySQL), "MySQL");
        assert_eq!(format!("{:?}", DatabaseType::PostgreSQL), "PostgreSQL");
        assert_eq!(format!("{:?}", DatabaseType::SQLite), "SQLite");
    }

    #[test]
    fn test_database_type_display() {
        assert_eq!(DatabaseType::PostgreSQL.to_string(), "PostgreSQL");
        assert_ne!(DatabaseType::MySQL, DatabaseType::PostgreSQL);
    }
}
