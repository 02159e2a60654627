//! Entity Session - demo runner.
//!
//! Loads the pool configuration from a `database.properties` file, registers
//! the `User` entity, runs one transaction that looks up the existing user and
//! inserts a new one, then closes the pool. SIGINT/SIGTERM during the run takes
//! the same shutdown path.

use clap::Parser;
use entity_session::db::DatabaseType;
use entity_session::session::TransactionRunner;
use entity_session::{
    ColumnType, Config, ConnectionPool, EntityDefinition, EntityInstance, EntityRegistry,
    OrmError, OrmResult, Predicate, SessionManager, ShutdownCoordinator,
};
use futures_util::FutureExt;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

fn user_definition() -> EntityDefinition {
    EntityDefinition::builder("User", "user")
        .column("id", ColumnType::Integer, false)
        .column("name", ColumnType::Text, true)
        .column("age", ColumnType::Integer, true)
        .column("occupation", ColumnType::Text, false)
        .primary_key("id")
        .build()
}

fn create_user_table(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::SQLite => {
            r#"CREATE TABLE IF NOT EXISTS "user" (
                "id" INTEGER PRIMARY KEY AUTOINCREMENT,
                "name" TEXT,
                "age" INTEGER,
                "occupation" TEXT NOT NULL
            )"#
        }
        DatabaseType::PostgreSQL => {
            r#"CREATE TABLE IF NOT EXISTS "user" (
                "id" BIGSERIAL PRIMARY KEY,
                "name" TEXT,
                "age" BIGINT,
                "occupation" TEXT NOT NULL
            )"#
        }
        DatabaseType::MySQL => {
            "CREATE TABLE IF NOT EXISTS `user` (
                `id` BIGINT AUTO_INCREMENT PRIMARY KEY,
                `name` VARCHAR(255),
                `age` BIGINT,
                `occupation` VARCHAR(255) NOT NULL
            )"
        }
    }
}

async fn run_demo(runner: &TransactionRunner, db_type: DatabaseType) -> OrmResult<EntityInstance> {
    runner
        .run(move |session| {
            async move {
                session.execute(create_user_table(db_type), &[]).await?;
                Ok(())
            }
            .boxed()
        })
        .await?;

    runner
        .run(|session| {
            async move {
                match session.query_unique("User", Predicate::all(), vec![]).await {
                    Ok(Some(existing)) => info!(user = ?existing.values(), "Found existing user"),
                    Ok(None) => info!("No users yet"),
                    Err(OrmError::NonUniqueResult { count, .. }) => {
                        info!(count = count, "Several users already stored")
                    }
                    Err(e) => return Err(e),
                }

                let user = EntityInstance::new("User")
                    .with("name", "John Doe")
                    .with("age", 30)
                    .with("occupation", "programmer");
                session.insert(user).await
            }
            .boxed()
        })
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!("Starting entity-session demo v{}", env!("CARGO_PKG_VERSION"));

    let pool_config = config.pool_config()?;
    let pool = ConnectionPool::connect(pool_config).await?;
    let db_type = pool.db_type();

    let registry = Arc::new(EntityRegistry::new());
    registry.register(user_definition())?;

    let manager = SessionManager::new(pool.clone(), registry);
    let runner = manager.runner();

    let coordinator = Arc::new(ShutdownCoordinator::new(pool, config.shutdown_grace()));
    let mut signal_task = coordinator.install_signal_handler();

    // A signal shuts the pool down while the demo may still hold a connection;
    // the demo future is dropped afterwards, which discards its transaction.
    let result = tokio::select! {
        result = run_demo(&runner, db_type) => Some(result),
        _ = &mut signal_task => None,
    };

    signal_task.abort();
    let report = coordinator.shutdown().await;
    info!(
        idle_closed = report.idle_closed,
        outstanding = report.outstanding,
        "Connection pool closed"
    );

    match result {
        Some(Ok(user)) => {
            println!("{}", serde_json::to_string_pretty(&user)?);
            info!("Demo complete");
            Ok(())
        }
        Some(Err(e)) => {
            error!(error = %e, "Demo failed");
            Err(e.into())
        }
        None => {
            info!("Interrupted before the demo finished");
            Ok(())
        }
    }
}
