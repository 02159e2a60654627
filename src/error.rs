//! Error types for entity-session.
//!
//! This module defines all error types using `thiserror`. Registration errors
//! are fatal at startup, operation errors (`NotFound`, `NonUniqueResult`) are
//! expected and recoverable, and transaction errors are always surfaced to the
//! caller of [`TransactionRunner::run`](crate::session::TransactionRunner::run).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrmError {
    #[error("Pool exhausted: no connection available after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection broken: {message}")]
    ConnectionBroken { message: String },

    #[error("Invalid release of connection {connection_id}: {reason}")]
    InvalidRelease { connection_id: u64, reason: String },

    #[error("Entity '{name}' is already registered")]
    DuplicateEntity { name: String },

    #[error("Unknown entity: {name}")]
    UnknownEntity { name: String },

    #[error("Invalid entity '{entity}': {message}")]
    InvalidEntity { entity: String, message: String },

    #[error(
        "Unresolved relationship '{relationship}' on '{entity}': target entity '{target}' is not registered"
    )]
    UnresolvedRelationship {
        entity: String,
        relationship: String,
        target: String,
    },

    #[error("{entity} with id {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Query on '{entity}' returned {count} rows where at most one was expected")]
    NonUniqueResult { entity: String, count: usize },

    #[error("Transaction failed during {stage}: {cause}{}", rollback_suffix(.rollback))]
    TransactionFailed {
        stage: TransactionStage,
        cause: Box<OrmError>,
        /// Present when the rollback issued after the failure also failed.
        rollback: Option<Box<OrmError>>,
    },

    #[error("Invalid transaction state: {message}")]
    TransactionState { message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Where in the transaction lifecycle a [`OrmError::TransactionFailed`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    Begin,
    Work,
    Commit,
}

impl std::fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin => write!(f, "begin"),
            Self::Work => write!(f, "work"),
            Self::Commit => write!(f, "commit"),
        }
    }
}

fn rollback_suffix(rollback: &Option<Box<OrmError>>) -> String {
    match rollback {
        Some(err) => format!(" (rollback also failed: {})", err),
        None => String::new(),
    }
}

impl OrmError {
    /// Create a pool exhausted error.
    pub fn pool_exhausted(waited_ms: u64) -> Self {
        Self::PoolExhausted { waited_ms }
    }

    /// Create a broken connection error.
    pub fn connection_broken(message: impl Into<String>) -> Self {
        Self::ConnectionBroken {
            message: message.into(),
        }
    }

    /// Create an invalid release error.
    pub fn invalid_release(connection_id: u64, reason: impl Into<String>) -> Self {
        Self::InvalidRelease {
            connection_id,
            reason: reason.into(),
        }
    }

    pub fn duplicate_entity(name: impl Into<String>) -> Self {
        Self::DuplicateEntity { name: name.into() }
    }

    pub fn unknown_entity(name: impl Into<String>) -> Self {
        Self::UnknownEntity { name: name.into() }
    }

    /// Create an invalid entity definition error.
    pub fn invalid_entity(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn unresolved_relationship(
        entity: impl Into<String>,
        relationship: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::UnresolvedRelationship {
            entity: entity.into(),
            relationship: relationship.into(),
            target: target.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(entity: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Create a transaction failure wrapping the original cause.
    pub fn transaction_failed(
        stage: TransactionStage,
        cause: OrmError,
        rollback: Option<OrmError>,
    ) -> Self {
        Self::TransactionFailed {
            stage,
            cause: Box::new(cause),
            rollback: rollback.map(Box::new),
        }
    }

    /// Create a transaction state error.
    pub fn transaction_state(message: impl Into<String>) -> Self {
        Self::TransactionState {
            message: message.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// A transaction that failed to begin ran no statements, so it is retryable
    /// whenever its cause is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } | Self::ConnectionBroken { .. } => true,
            Self::TransactionFailed {
                stage: TransactionStage::Begin,
                cause,
                ..
            } => cause.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error means the underlying connection can no longer be used.
    pub fn is_connection_broken(&self) -> bool {
        matches!(self, Self::ConnectionBroken { .. })
    }

    /// The error that originally failed the transaction, unwrapping `TransactionFailed`.
    pub fn root_cause(&self) -> &OrmError {
        match self {
            Self::TransactionFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Convert sqlx errors to OrmError.
impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => OrmError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                OrmError::database(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => OrmError::database("No rows returned", None),
            sqlx::Error::PoolTimedOut => OrmError::pool_exhausted(0),
            sqlx::Error::PoolClosed => OrmError::PoolClosed,
            sqlx::Error::Io(io_err) => OrmError::connection_broken(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => {
                OrmError::connection_broken(format!("TLS error: {}", tls_err))
            }
            sqlx::Error::Protocol(msg) => {
                OrmError::connection_broken(format!("Protocol error: {}", msg))
            }
            sqlx::Error::WorkerCrashed => OrmError::connection_broken("Database worker crashed"),
            sqlx::Error::ColumnNotFound(col) => {
                OrmError::database(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                OrmError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => OrmError::internal(format!("Decode error: {}", source)),
            _ => OrmError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for persistence operations.
pub type OrmResult<T> = Result<T, OrmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrmError::not_found("User", 42);
        assert_eq!(err.to_string(), "User with id 42 not found");
    }

    #[test]
    fn test_error_retryable() {
        assert!(OrmError::pool_exhausted(500).is_retryable());
        assert!(OrmError::connection_broken("reset").is_retryable());
        assert!(!OrmError::not_found("User", 1).is_retryable());
        assert!(!OrmError::duplicate_entity("User").is_retryable());
    }

    #[test]
    fn test_begin_failure_keeps_cause_retryability() {
        let begin = OrmError::transaction_failed(
            TransactionStage::Begin,
            OrmError::connection_broken("reset"),
            None,
        );
        assert!(begin.is_retryable());

        let commit = OrmError::transaction_failed(
            TransactionStage::Commit,
            OrmError::connection_broken("reset"),
            None,
        );
        assert!(!commit.is_retryable());

        let begin_rejected = OrmError::transaction_failed(
            TransactionStage::Begin,
            OrmError::database("read-only transaction", None),
            None,
        );
        assert!(!begin_rejected.is_retryable());
    }

    #[test]
    fn test_transaction_failed_surfaces_both_errors() {
        let err = OrmError::transaction_failed(
            TransactionStage::Work,
            OrmError::invalid_input("bad row"),
            Some(OrmError::connection_broken("socket closed")),
        );
        let message = err.to_string();
        assert!(message.contains("during work"));
        assert!(message.contains("bad row"));
        assert!(message.contains("rollback also failed"));
        assert!(message.contains("socket closed"));
    }

    #[test]
    fn test_transaction_failed_without_rollback_error() {
        let err = OrmError::transaction_failed(
            TransactionStage::Commit,
            OrmError::database("disk I/O error", None),
            None,
        );
        assert!(!err.to_string().contains("rollback"));
        assert!(matches!(err.root_cause(), OrmError::Database { .. }));
    }

    #[test]
    fn test_io_error_maps_to_connection_broken() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: OrmError = sqlx::Error::Io(io).into();
        assert!(err.is_connection_broken());
    }

    #[test]
    fn test_pool_closed_maps() {
        let err: OrmError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, OrmError::PoolClosed));
    }
}
