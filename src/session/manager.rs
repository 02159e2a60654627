//! Session factory.

use crate::db::ConnectionPool;
use crate::entity::EntityRegistry;
use crate::error::OrmResult;
use crate::session::runner::TransactionRunner;
use crate::session::session::Session;
use std::sync::Arc;
use tracing::debug;

/// Opens sessions on pooled connections.
///
/// Cheap to clone; every clone shares the same pool and registry.
#[derive(Debug, Clone)]
pub struct SessionManager {
    pool: ConnectionPool,
    registry: Arc<EntityRegistry>,
}

impl SessionManager {
    pub fn new(pool: ConnectionPool, registry: Arc<EntityRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Acquire a connection and bind a new session to it.
    ///
    /// Waits for a free connection up to the pool's acquire timeout.
    pub async fn open(&self) -> OrmResult<Session> {
        let conn = self.pool.acquire().await?;
        debug!(connection_id = conn.id(), "Session opened");
        Ok(Session::new(conn, Arc::clone(&self.registry)))
    }

    /// Close a session, returning its connection to the pool.
    ///
    /// Idempotent: closing a closed session does not touch the pool.
    pub async fn close(&self, session: &mut Session) -> OrmResult<()> {
        session.close().await
    }

    /// A transaction runner sharing this manager's pool and registry.
    pub fn runner(&self) -> TransactionRunner {
        TransactionRunner::new(self.clone())
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }
}
