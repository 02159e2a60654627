//! Sessions and transactions.
//!
//! This module provides the unit-of-work layer on top of the connection pool:
//! - `SessionManager` opens sessions bound to one pooled connection
//! - `Session` runs entity operations and owns the transaction state
//! - `TransactionRunner` scopes caller work in begin/commit/rollback
//! - `QueryCursor` streams query results lazily

pub mod cursor;
pub mod manager;
pub mod query;
pub mod runner;
#[allow(clippy::module_inception)]
pub mod session;

pub use cursor::QueryCursor;
pub use manager::SessionManager;
pub use query::{Predicate, PreparedQuery};
pub use runner::TransactionRunner;
pub use session::{Session, TransactionState};
