//! Process shutdown.
//!
//! [`ShutdownCoordinator::shutdown`] is the single entry point that closes the
//! connection pool. It runs at most once; later calls return the first report.

use crate::db::ConnectionPool;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What shutdown did to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub idle_closed: usize,
    /// Checked-out connections that came back within the grace period
    pub returned: usize,
    /// Checked-out connections still out when the grace period ended
    pub outstanding: usize,
    pub elapsed_ms: u64,
}

/// Closes the pool exactly once.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    pool: ConnectionPool,
    grace: Duration,
    report: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub fn new(pool: ConnectionPool, grace: Duration) -> Self {
        Self {
            pool,
            grace,
            report: OnceCell::new(),
        }
    }

    /// Close the pool, waiting up to the grace period for checked-out connections.
    ///
    /// Concurrent and repeated calls all observe the first shutdown's report.
    pub async fn shutdown(&self) -> ShutdownReport {
        if let Some(report) = self.report.get() {
            debug!("Shutdown already completed");
            return *report;
        }

        *self
            .report
            .get_or_init(|| async {
                info!(grace_ms = self.grace.as_millis() as u64, "Shutting down");
                let started = Instant::now();
                let closed = self.pool.close(self.grace).await;
                let report = ShutdownReport {
                    idle_closed: closed.idle_closed,
                    returned: closed.returned,
                    outstanding: closed.outstanding,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                if report.outstanding > 0 {
                    warn!(outstanding = report.outstanding, "Shutdown finished with connections still in use");
                }
                info!(
                    idle_closed = report.idle_closed,
                    returned = report.returned,
                    elapsed_ms = report.elapsed_ms,
                    "Shutdown complete"
                );
                report
            })
            .await
    }

    pub fn is_shut_down(&self) -> bool {
        self.report.initialized()
    }

    /// Spawn a task that runs [`shutdown`](Self::shutdown) on SIGINT or SIGTERM.
    pub fn install_signal_handler(self: &Arc<Self>) -> JoinHandle<ShutdownReport> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            coordinator.shutdown().await
        })
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    async fn pool(dir: &tempfile::TempDir) -> ConnectionPool {
        let url = format!("sqlite:{}", dir.path().join("shutdown.db").display());
        ConnectionPool::connect(PoolConfig::new(url).with_pool_size(2, 4))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = ShutdownCoordinator::new(pool(&dir).await, Duration::from_millis(100));
        assert!(!coordinator.is_shut_down());

        let first = coordinator.shutdown().await;
        assert_eq!(first.idle_closed, 2);
        assert!(coordinator.is_shut_down());

        let second = coordinator.shutdown().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_shutdown_reports_outstanding_connection() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir).await;
        let held = pool.acquire().await.unwrap();

        let coordinator = ShutdownCoordinator::new(pool.clone(), Duration::from_millis(50));
        let report = coordinator.shutdown().await;
        assert_eq!(report.outstanding, 1);

        // Returned after the grace period: closed, not pooled
        drop(held);
        assert_eq!(pool.status().size, 0);
    }
}
