use crate::config::DatabaseConfig;
use crate::error::QaLogError;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// Connect to PostgreSQL, retrying with exponential backoff up to
/// `connect_retries` times before giving up.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let strategy = ExponentialBackoff::from_millis(200)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(config.connect_retries);

    Retry::spawn(strategy, || async {
        pool_options(config).connect(&config.url).await.map_err(|e| {
            tracing::warn!(error = %e, "Database connect attempt failed");
            e
        })
    })
    .await
}

/// Build a pool that connects on first use. Used by tests and tooling that
/// never touch the database on some code paths.
pub fn create_lazy_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    pool_options(config).connect_lazy(&config.url)
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), QaLogError> {
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}
