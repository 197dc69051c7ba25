//! Credential stores.
//!
//! The resolver only needs a lookup by key; scope filtering happens in the
//! resolver so every store reports mismatches the same way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::credentials::types::CredentialRecord;
use crate::crypto::SecretCipher;
use crate::db::DbPool;
use crate::error::AppResult;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the record stored under `key`, if any.
    ///
    /// `scope` is the scope the caller will use the credential for. Stores
    /// may use it to pick among scoped variants; a store with a single
    /// record per key returns it and leaves the scope check to the resolver.
    async fn lookup(&self, key: &str, scope: Option<&str>) -> AppResult<Option<CredentialRecord>>;

    /// Insert or replace a record.
    async fn store(&self, record: CredentialRecord) -> AppResult<()>;
}

/// Process-local store, used by tests and single-node runs.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    records: RwLock<HashMap<String, CredentialRecord>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = CredentialRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.key.clone(), r)).collect()),
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn lookup(&self, key: &str, _scope: Option<&str>) -> AppResult<Option<CredentialRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn store(&self, record: CredentialRecord) -> AppResult<()> {
        self.records.write().await.insert(record.key.clone(), record);
        Ok(())
    }
}

/// Postgres-backed store; material is sealed with AES-GCM at rest.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: DbPool,
    cipher: SecretCipher,
}

impl PgCredentialStore {
    pub fn new(pool: DbPool, cipher: SecretCipher) -> Self {
        Self { pool, cipher }
    }

    pub async fn init_schema(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS noetl_credential (
                key TEXT PRIMARY KEY,
                data BYTEA NOT NULL,
                scopes TEXT[] NOT NULL DEFAULT '{}',
                expires_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn lookup(&self, key: &str, _scope: Option<&str>) -> AppResult<Option<CredentialRecord>> {
        let row: Option<(Vec<u8>, Vec<String>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT data, scopes, expires_at
            FROM noetl_credential
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((sealed, scopes, expires_at)) => Ok(Some(CredentialRecord {
                key: key.to_string(),
                data: self.cipher.open_json(key, &sealed)?,
                scopes,
                expires_at,
            })),
            None => Ok(None),
        }
    }

    async fn store(&self, record: CredentialRecord) -> AppResult<()> {
        let sealed = self.cipher.seal_json(&record.key, &record.data)?;
        sqlx::query(
            r#"
            INSERT INTO noetl_credential (key, data, scopes, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET data = EXCLUDED.data, scopes = EXCLUDED.scopes,
                expires_at = EXCLUDED.expires_at, updated_at = NOW()
            "#,
        )
        .bind(&record.key)
        .bind(&sealed)
        .bind(&record.scopes)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemoryCredentialStore::new();
        assert!(store.lookup("pg_prod", None).await.unwrap().is_none());

        store
            .store(CredentialRecord::new("pg_prod", json!({"user": "etl"})))
            .await
            .unwrap();
        let record = store.lookup("pg_prod", None).await.unwrap().unwrap();
        assert_eq!(record.data["user"], "etl");
    }
}
