//! Postgres pool shared by the event and credential stores.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::AppResult;

pub type DbPool = PgPool;

/// Connect and verify the database answers before any store uses it.
///
/// Connections are tested on checkout: a dead connection surfacing as an
/// append error would suspend the coordinator needlessly.
pub async fn create_pool(config: &DatabaseConfig) -> AppResult<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size())
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .test_before_acquire(true)
        .connect_with(config.connect_options()?)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    tracing::info!(
        target_db = %config.target(),
        application_name = %config.application_name,
        max_connections = config.pool_size(),
        "Database pool ready"
    );

    Ok(pool)
}
