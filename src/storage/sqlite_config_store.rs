//! `SQLite`-backed [`ConfigStore`] for the generic config-entry table backing the registry.

use async_trait::async_trait;
use sqlx::Row;
use std::sync::Arc;

use crate::crypto::MasterKey;
use crate::database::DatabaseConnection;
use crate::storage::{ConfigStore, StoreResult};

/// `SQLite` implementation of [`ConfigStore`].
pub struct SqliteConfigStore {
    connection: DatabaseConnection,
    master_key: Arc<MasterKey>,
}

impl SqliteConfigStore {
    /// Builds a store over the given connection and master key.
    pub fn new(connection: DatabaseConnection, master_key: Arc<MasterKey>) -> Self {
        Self {
            connection,
            master_key,
        }
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn set(&self, key: &str, value: &str, encrypted: bool) -> StoreResult<()> {
        let stored_value = if encrypted {
            let sealed = self.master_key.encrypt_str(value)?;
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, sealed)
        } else {
            value.to_string()
        };
        sqlx::query(
            r"
            INSERT INTO config_entries (key, value, encrypted, updated_ts)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, encrypted = excluded.encrypted,
                updated_ts = excluded.updated_ts
            ",
        )
        .bind(key)
        .bind(stored_value)
        .bind(encrypted)
        .bind(crate::util::unix_now())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value, encrypted FROM config_entries WHERE key = ?1")
            .bind(key)
            .fetch_optional(self.connection.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };
        let raw: String = row.try_get("value")?;
        let encrypted: i64 = row.try_get("encrypted")?;
        if encrypted != 0 {
            let sealed = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, raw)
                .map_err(|e| {
                    crate::storage::StoreError::CorruptRow(format!("config base64: {e}"))
                })?;
            Ok(Some(self.master_key.decrypt_str(&sealed)?))
        } else {
            Ok(Some(raw))
        }
    }

    async fn list(&self) -> StoreResult<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key FROM config_entries")
            .fetch_all(self.connection.pool())
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            if let Some(value) = self.get(&key).await? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM config_entries WHERE key = ?1")
            .bind(key)
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }
}
