//! Integration tests for transaction scoping.
//!
//! Tests verify that:
//! - Concurrent transactions wait for the only pooled connection (max=1)
//! - A failure inside the work rolls back everything it wrote
//! - An abandoned cursor releases its statement and leaves the session usable
//! - The session is released on every path
//! - Abandoning a run mid-await releases its connection and discards its writes

use entity_session::config::PoolConfig;
use entity_session::db::ConnectionPool;
use entity_session::entity::{ColumnType, EntityDefinition, EntityInstance, EntityRegistry, Value};
use entity_session::error::{OrmError, OrmResult, TransactionStage};
use entity_session::session::{Predicate, SessionManager, TransactionRunner};
use futures_util::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const CREATE_USER: &str = r#"CREATE TABLE "user" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "name" TEXT,
    "age" INTEGER,
    "occupation" TEXT NOT NULL
)"#;

fn user_definition() -> EntityDefinition {
    EntityDefinition::builder("User", "user")
        .column("id", ColumnType::Integer, false)
        .column("name", ColumnType::Text, true)
        .column("age", ColumnType::Integer, true)
        .column("occupation", ColumnType::Text, false)
        .primary_key("id")
        .build()
}

fn user(name: &str, age: i64) -> EntityInstance {
    EntityInstance::new("User")
        .with("name", name)
        .with("age", age)
        .with("occupation", "programmer")
}

async fn setup(pool_max: u32, timeout_ms: u64) -> (TempDir, TransactionRunner) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("runner.db").display());
    let config = PoolConfig::new(url)
        .with_pool_size(1, pool_max)
        .with_timeout_ms(timeout_ms);
    let pool = ConnectionPool::connect(config).await.unwrap();

    let registry = Arc::new(EntityRegistry::new());
    registry.register(user_definition()).unwrap();
    let runner = SessionManager::new(pool, registry).runner();

    runner
        .run(|session| {
            async move {
                session.execute(CREATE_USER, &[]).await?;
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap();

    (dir, runner)
}

async fn count_users(runner: &TransactionRunner) -> usize {
    runner
        .run(|session| {
            async move {
                let users = session.query_all("User", Predicate::all(), vec![]).await?;
                Ok(users.len())
            }
            .boxed()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_run_commits_and_returns_value() {
    let (_dir, runner) = setup(2, 2_000).await;

    let john = runner
        .run(|session| async move { session.insert(user("John Doe", 30)).await }.boxed())
        .await
        .unwrap();
    assert!(john.is_persisted());

    let id = john.id().cloned().unwrap();
    let reloaded = runner
        .run(move |session| async move { session.find_by_id("User", id).await }.boxed())
        .await
        .unwrap();
    assert!(john.matches_fields_of(&reloaded));

    let status = runner.manager().pool().status();
    assert_eq!(status.checked_out, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_runs_wait_for_single_connection() {
    let (_dir, runner) = setup(1, 5_000).await;
    let events = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let runner = runner.clone();
        let events = Arc::clone(&events);
        tokio::spawn(async move {
            runner
                .run(move |session| {
                    async move {
                        events.lock().unwrap().push("first:start");
                        session.insert(user("First", 1)).await?;
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        events.lock().unwrap().push("first:end");
                        Ok(())
                    }
                    .boxed()
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = {
        let runner = runner.clone();
        let events = Arc::clone(&events);
        tokio::spawn(async move {
            runner
                .run(move |session| {
                    async move {
                        events.lock().unwrap().push("second:start");
                        let users = session.query_all("User", Predicate::all(), vec![]).await?;
                        Ok(users.len())
                    }
                    .boxed()
                })
                .await
        })
    };

    first.await.unwrap().unwrap();
    let seen_by_second = second.await.unwrap().unwrap();

    assert_eq!(seen_by_second, 1);
    assert_eq!(
        *events.lock().unwrap(),
        vec!["first:start", "first:end", "second:start"]
    );
}

#[tokio::test]
async fn test_failed_work_rolls_back() {
    let (_dir, runner) = setup(2, 2_000).await;
    let inserted = Arc::new(Mutex::new(None::<Value>));

    let result: OrmResult<()> = {
        let inserted = Arc::clone(&inserted);
        runner
            .run(move |session| {
                async move {
                    let john = session.insert(user("John Doe", 30)).await?;
                    *inserted.lock().unwrap() = john.id().cloned();
                    Err(OrmError::invalid_input("rejected by business rule"))
                }
                .boxed()
            })
            .await
    };

    // Rollback succeeded, so the original error comes back unchanged
    let err = result.unwrap_err();
    assert!(matches!(err, OrmError::InvalidInput { .. }));

    let id = inserted.lock().unwrap().clone().unwrap();
    let lookup = runner
        .run(move |session| async move { session.find_by_id("User", id).await }.boxed())
        .await;
    assert!(matches!(lookup, Err(OrmError::NotFound { .. })));
    assert_eq!(count_users(&runner).await, 0);
    assert_eq!(runner.manager().pool().status().checked_out, 0);
}

#[tokio::test]
async fn test_abandoned_cursor_is_released() {
    let (_dir, runner) = setup(1, 2_000).await;
    for (name, age) in [("Ann", 41), ("Bob", 17), ("Cid", 25)] {
        runner
            .run(move |session| async move { session.insert(user(name, age)).await }.boxed())
            .await
            .unwrap();
    }

    let (first_name, open_after, still_usable) = runner
        .run(|session| {
            async move {
                let prepared = session.prepare("User", Predicate::all(), vec![])?;
                let first = {
                    let mut cursor = session.query(&prepared)?;
                    cursor.next_instance().await?
                    // cursor dropped here with two rows unread
                };
                let open_after = session.open_cursors();
                let still_usable = session.query_all("User", Predicate::all(), vec![]).await?;
                Ok((first, open_after, still_usable.len()))
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(
        first_name.and_then(|u| u.get("name").cloned()),
        Some(Value::from("Ann"))
    );
    assert_eq!(open_after, 0);
    assert_eq!(still_usable, 3);

    let status = runner.manager().pool().status();
    assert_eq!(status.checked_out, 0);
    assert_eq!(status.idle, 1);
}

#[tokio::test]
async fn test_work_that_ends_transaction_fails_commit() {
    let (_dir, runner) = setup(1, 2_000).await;

    let result: OrmResult<()> = runner
        .run(|session| {
            async move {
                session.insert(user("John Doe", 30)).await?;
                session.rollback().await
            }
            .boxed()
        })
        .await;

    let err = result.unwrap_err();
    match &err {
        OrmError::TransactionFailed { stage, cause, rollback } => {
            assert_eq!(*stage, TransactionStage::Commit);
            assert!(matches!(**cause, OrmError::TransactionState { .. }));
            assert!(rollback.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(count_users(&runner).await, 0);
}

#[tokio::test]
async fn test_run_after_pool_closed_fails() {
    let (_dir, runner) = setup(1, 2_000).await;
    runner
        .manager()
        .pool()
        .close(Duration::from_millis(50))
        .await;

    let result = runner
        .run(|session| async move { session.insert(user("Late", 1)).await }.boxed())
        .await;
    assert!(matches!(result, Err(OrmError::PoolClosed)));
}

#[tokio::test]
async fn test_run_abandoned_during_work_releases_connection() {
    let (_dir, runner) = setup(2, 500).await;
    let pool = runner.manager().pool().clone();

    let slow = runner.run(|session| {
        async move {
            session.insert(user("Abandoned", 41)).await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
        .boxed()
    });
    let outcome = tokio::time::timeout(Duration::from_millis(100), slow).await;
    assert!(outcome.is_err());

    let status = pool.status();
    assert_eq!(status.checked_out, 0);
    assert!(status.size <= status.max as usize);
    assert_eq!(count_users(&runner).await, 0);
}

#[tokio::test]
async fn test_run_abandoned_on_first_poll_releases_connection() {
    let (_dir, runner) = setup(2, 500).await;
    let pool = runner.manager().pool().clone();

    for _ in 0..3 {
        let run = runner.run(|session| {
            async move {
                session.insert(user("Never", 1)).await?;
                Ok(())
            }
            .boxed()
        });
        drop(run.now_or_never());

        let status = pool.status();
        assert_eq!(status.checked_out, 0, "{status:?}");
        assert_eq!(status.size, status.idle, "{status:?}");
    }

    let report = pool.close(Duration::from_millis(300)).await;
    assert_eq!(report.outstanding, 0);
}
