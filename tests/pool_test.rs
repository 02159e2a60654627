//! Integration tests for the connection pool.
//!
//! Tests verify that:
//! - No more than `pool_max` connections are ever held at once
//! - `acquire` waits for a release instead of failing while within the timeout
//! - Closing the pool wakes pending acquires with `PoolClosed`

use entity_session::config::PoolConfig;
use entity_session::db::ConnectionPool;
use entity_session::error::OrmError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

async fn setup_pool(min: u32, max: u32, timeout_ms: u64) -> (TempDir, ConnectionPool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("pool.db").display());
    let config = PoolConfig::new(url)
        .with_pool_size(min, max)
        .with_timeout_ms(timeout_ms);
    let pool = ConnectionPool::connect(config).await.unwrap();
    (dir, pool)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_held_connections_never_exceed_max() {
    let (_dir, pool) = setup_pool(1, 3, 10_000).await;
    let held = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let holds: Vec<u64> = (0..40).map(|_| rng.gen_range(0..15)).collect();

    let mut tasks = Vec::new();
    for hold_ms in holds {
        let pool = pool.clone();
        let held = Arc::clone(&held);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            let now = held.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            assert!(pool.status().checked_out <= 3);

            tokio::time::sleep(Duration::from_millis(hold_ms)).await;

            held.fetch_sub(1, Ordering::SeqCst);
            if hold_ms % 2 == 0 {
                conn.release().unwrap();
            } else {
                drop(conn);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let status = pool.status();
    assert_eq!(status.checked_out, 0);
    assert!(status.size <= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_acquire_waits_for_release() {
    let (_dir, pool) = setup_pool(1, 1, 5_000).await;
    let conn = pool.acquire().await.unwrap();
    let held_id = conn.id();

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(conn);
    });

    let started = Instant::now();
    let conn = pool.acquire().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(conn.id(), held_id);
    releaser.await.unwrap();
}

#[tokio::test]
async fn test_acquire_fails_after_timeout() {
    let (_dir, pool) = setup_pool(1, 1, 100).await;
    let _held = pool.acquire().await.unwrap();

    let started = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, OrmError::PoolExhausted { .. }));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_fails_pending_acquire() {
    let (_dir, pool) = setup_pool(1, 1, 10_000).await;
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.close(Duration::from_millis(500)).await })
    };

    let pending = waiter.await.unwrap();
    assert!(matches!(pending, Err(OrmError::PoolClosed)));

    drop(held);
    let report = closer.await.unwrap();
    assert_eq!(report.outstanding, 0);
    assert_eq!(report.returned, 1);
    assert!(pool.status().closed);
}

#[tokio::test]
async fn test_connect_rejects_invalid_config() {
    let err = ConnectionPool::connect(PoolConfig::new("sqlite::memory:").with_pool_size(2, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::Config { .. }));
}
