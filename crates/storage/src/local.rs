use std::{collections::HashMap, str::FromStr, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;

use crate::ensure_sqlite_parent_dir_exists;

/// Durable key-value persistence for a controller agent. `put` returns only
/// once the value is committed, so callers may acknowledge after it succeeds.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// SQLite-backed [`StateStore`] kept on the device.
#[derive(Clone)]
pub struct LocalStore {
    pool: Pool<Sqlite>,
}

impl LocalStore {
    pub async fn open(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;
        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open local store at '{database_url}'"))?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_kv (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to ensure agent_kv table exists")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM agent_kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO agent_kv (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to write key '{key}'"))?;
        tx.commit()
            .await
            .with_context(|| format!("failed to commit key '{key}'"))?;
        Ok(())
    }
}

/// Volatile [`StateStore`] for simulation runs and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
