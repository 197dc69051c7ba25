//! Postgres event store.
//!
//! Each event is kept whole in `body` (JSONB) next to the columns used for
//! lookups, so a replayed event is exactly the one appended.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::events::store::EventStore;
use crate::events::types::Event;

/// Advisory lock key shared by all coordinators of one database.
const LEADERSHIP_LOCK_KEY: i64 = 0x6e6f_6574_6c00;

pub struct PgEventStore {
    pool: DbPool,
    /// Connection holding the advisory lock; the lock lives as long as it.
    leader_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            leader_conn: Mutex::new(None),
        }
    }

    pub async fn init_schema(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS noetl_event (
                execution_id UUID NOT NULL,
                event_id BIGINT NOT NULL,
                step_instance_id BIGINT,
                kind TEXT NOT NULL,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (execution_id, event_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn to_i64(value: u64, field: &str) -> AppResult<i64> {
    i64::try_from(value).map_err(|_| AppError::Internal(format!("{} out of range: {}", field, value)))
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: Event) -> AppResult<u64> {
        let body = serde_json::to_value(&event)?;
        let event_id = to_i64(event.event_id, "event_id")?;
        let step_instance_id = event
            .step_instance_id
            .map(|id| to_i64(id, "step_instance_id"))
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO noetl_event (execution_id, event_id, step_instance_id, kind, body, created_at)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE COALESCE(
                (SELECT MAX(event_id) FROM noetl_event WHERE execution_id = $1), 0
            ) + 1 = $2
            "#,
        )
        .bind(event.execution_id)
        .bind(event_id)
        .bind(step_instance_id)
        .bind(event.kind_name())
        .bind(&body)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(event.event_id),
            Ok(_) => Err(AppError::Conflict(format!(
                "execution {} event {} is not next in sequence",
                event.execution_id, event.event_id
            ))),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(AppError::Conflict(format!(
                    "execution {} event {} already exists",
                    event.execution_id, event.event_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, execution_id: Uuid, since: Option<u64>) -> AppResult<Vec<Event>> {
        let since = to_i64(since.unwrap_or(0), "since")?;
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT body
            FROM noetl_event
            WHERE execution_id = $1 AND event_id > $2
            ORDER BY event_id
            "#,
        )
        .bind(execution_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(body,)| serde_json::from_value(body).map_err(AppError::from))
            .collect()
    }

    async fn list_executions(&self) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT execution_id, created_at
            FROM noetl_event
            WHERE event_id = 1
            ORDER BY created_at, execution_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }

    async fn try_acquire_leadership(&self, holder: &str) -> AppResult<bool> {
        let mut guard = self.leader_conn.lock().await;

        if let Some(conn) = guard.as_mut() {
            match sqlx::query("SELECT 1").execute(&mut **conn).await {
                Ok(_) => return Ok(true),
                Err(e) => {
                    warn!(holder, error = %e, "Lost leadership connection");
                    *guard = None;
                }
            }
        }

        let mut conn = self.pool.acquire().await?;
        let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(LEADERSHIP_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;

        if acquired {
            info!(holder, "Acquired coordinator leadership");
            *guard = Some(conn);
        }
        Ok(acquired)
    }
}
