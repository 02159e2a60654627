//! Transaction scoping.
//!
//! [`TransactionRunner::run`] brackets caller work with begin and exactly one of
//! commit or rollback, then releases the session on every path. There are no
//! retries: the first failure ends the transaction and is returned.

use crate::error::{OrmError, OrmResult, TransactionStage};
use crate::session::manager::SessionManager;
use crate::session::session::{Session, TransactionState};
use futures_util::future::BoxFuture;
use std::time::Instant;
use tracing::{debug, warn};

/// Runs units of work inside a transaction.
#[derive(Debug, Clone)]
pub struct TransactionRunner {
    manager: SessionManager,
}

impl TransactionRunner {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Run `work` inside a new transaction.
    ///
    /// Opens a session, begins, and invokes `work` with the session. On success
    /// the transaction is committed and the work's value returned. If `work`
    /// fails, the transaction is rolled back and the work's error returned
    /// unchanged; if the rollback fails too, both errors are returned in
    /// `TransactionFailed`. A failed commit is rolled back and returned as
    /// `TransactionFailed`.
    ///
    /// `work` must not commit or roll back the transaction itself.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use futures_util::FutureExt;
    ///
    /// let user = runner
    ///     .run(|session| {
    ///         async move {
    ///             session
    ///                 .insert(EntityInstance::new("User").with("name", "John Doe"))
    ///                 .await
    ///         }
    ///         .boxed()
    ///     })
    ///     .await?;
    /// ```
    pub async fn run<F, T>(&self, work: F) -> OrmResult<T>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, OrmResult<T>>,
    {
        let mut session = self.manager.open().await?;
        let started = Instant::now();

        if let Err(e) = session.begin().await {
            Self::close_quietly(&mut session).await;
            return Err(OrmError::transaction_failed(TransactionStage::Begin, e, None));
        }

        let outcome = match work(&mut session).await {
            Ok(value) => match session.commit().await {
                Ok(()) => Ok(value),
                Err(commit_error) => {
                    warn!(
                        connection_id = session.connection_id(),
                        error = %commit_error,
                        "Commit failed, rolling back"
                    );
                    let rollback_error = Self::rollback(&mut session).await;
                    Err(OrmError::transaction_failed(
                        TransactionStage::Commit,
                        commit_error,
                        rollback_error,
                    ))
                }
            },
            Err(work_error) => {
                warn!(
                    connection_id = session.connection_id(),
                    error = %work_error,
                    "Transaction work failed, rolling back"
                );
                match Self::rollback(&mut session).await {
                    None => Err(work_error),
                    Some(rollback_error) => Err(OrmError::transaction_failed(
                        TransactionStage::Work,
                        work_error,
                        Some(rollback_error),
                    )),
                }
            }
        };

        Self::close_quietly(&mut session).await;
        debug!(
            committed = outcome.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transaction finished"
        );
        outcome
    }

    /// Roll back if the transaction is still active, returning the rollback error.
    async fn rollback(session: &mut Session) -> Option<OrmError> {
        if session.transaction_state() != TransactionState::Active {
            return None;
        }
        match session.rollback().await {
            Ok(()) => None,
            Err(e) => {
                warn!(connection_id = session.connection_id(), error = %e, "Rollback failed");
                Some(e)
            }
        }
    }

    /// Close the session; the transaction outcome takes precedence over close errors.
    async fn close_quietly(session: &mut Session) {
        if let Err(e) = session.close().await {
            warn!(connection_id = session.connection_id(), error = %e, "Failed to close session");
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }
}
