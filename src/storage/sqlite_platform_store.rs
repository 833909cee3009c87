//! `SQLite`-backed [`PlatformStore`], config blobs encrypted at rest.

use async_trait::async_trait;
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;

use crate::crypto::MasterKey;
use crate::database::DatabaseConnection;
use crate::domain_types::PlatformId;
use crate::storage::{PlatformRow, PlatformStore, StoreError, StoreResult};

/// `SQLite` implementation of [`PlatformStore`].
pub struct SqlitePlatformStore {
    connection: DatabaseConnection,
    master_key: Arc<MasterKey>,
}

impl SqlitePlatformStore {
    /// Builds a store over the given connection and master key.
    pub fn new(connection: DatabaseConnection, master_key: Arc<MasterKey>) -> Self {
        Self {
            connection,
            master_key,
        }
    }

    fn row_to_platform(&self, row: &sqlx::sqlite::SqliteRow) -> StoreResult<PlatformRow> {
        let platform_id_raw: String = row.try_get("platform_id")?;
        let platform_id = uuid::Uuid::parse_str(&platform_id_raw)
            .map(PlatformId::from)
            .map_err(|e| StoreError::CorruptRow(format!("platform_id: {e}")))?;
        let kind_raw: String = row.try_get("kind")?;
        let config_encrypted: Vec<u8> = row.try_get("config_encrypted")?;
        let config_json = self.master_key.decrypt_str(&config_encrypted)?;
        let config = serde_json::from_str(&config_json)
            .map_err(|e| StoreError::CorruptRow(format!("platform config json: {e}")))?;

        Ok(PlatformRow {
            platform_id,
            name: row.try_get("name")?,
            kind: crate::domain_types::PlatformKind::from_str(&kind_raw)
                .map_err(|e| StoreError::CorruptRow(format!("platform kind: {e}")))?,
            config,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
        })
    }
}

#[async_trait]
impl PlatformStore for SqlitePlatformStore {
    async fn upsert(&self, platform: &PlatformRow) -> StoreResult<()> {
        let config_json = serde_json::to_string(&platform.config)
            .map_err(|e| StoreError::CorruptRow(format!("serializing platform config: {e}")))?;
        let config_encrypted = self.master_key.encrypt_str(&config_json)?;
        let now = crate::util::unix_now();

        sqlx::query(
            r"
            INSERT INTO platforms (platform_id, name, kind, config_encrypted, enabled, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(platform_id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                config_encrypted = excluded.config_encrypted,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            ",
        )
        .bind(platform.platform_id.to_string())
        .bind(&platform.name)
        .bind(platform.kind.to_string())
        .bind(config_encrypted)
        .bind(platform.enabled)
        .bind(now)
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, id: &PlatformId) -> StoreResult<Option<PlatformRow>> {
        let row = sqlx::query("SELECT * FROM platforms WHERE platform_id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(|r| self.row_to_platform(r)).transpose()
    }

    async fn list(&self) -> StoreResult<Vec<PlatformRow>> {
        let rows = sqlx::query("SELECT * FROM platforms ORDER BY name")
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(|r| self.row_to_platform(r)).collect()
    }

    async fn delete(&self, id: &PlatformId) -> StoreResult<()> {
        sqlx::query("DELETE FROM platforms WHERE platform_id = ?1")
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }
}
