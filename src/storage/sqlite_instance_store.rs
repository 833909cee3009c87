//! `SQLite`-backed [`InstanceStore`].

use async_trait::async_trait;
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::InstanceTunables;
use crate::crypto::MasterKey;
use crate::database::DatabaseConnection;
use crate::domain_types::{
    CleanupIntervalSecs, HealthCheckIntervalSecs, InstanceId, InstanceStatus,
    ListenerIdleTimeoutSecs, MaxListeners, MaxRetry, PollIntervalSecs,
};
use crate::storage::{Instance, InstanceStore, StoreError, StoreResult};

/// `SQLite` implementation of [`InstanceStore`], decrypting `api_key` transparently.
pub struct SqliteInstanceStore {
    connection: DatabaseConnection,
    master_key: Arc<MasterKey>,
}

impl SqliteInstanceStore {
    /// Builds a store over the given connection and master key.
    pub fn new(connection: DatabaseConnection, master_key: Arc<MasterKey>) -> Self {
        Self {
            connection,
            master_key,
        }
    }

    fn row_to_instance(&self, row: &sqlx::sqlite::SqliteRow) -> StoreResult<Instance> {
        let instance_id_raw: String = row.try_get("instance_id")?;
        let instance_id = InstanceId::try_from(instance_id_raw.clone())
            .map_err(|_| StoreError::CorruptRow(format!("invalid instance_id {instance_id_raw}")))?;

        let api_key_encrypted: Vec<u8> = row.try_get("api_key_encrypted")?;
        let api_key = self.master_key.decrypt_str(&api_key_encrypted)?;

        let status_raw: String = row.try_get("status")?;
        let status = InstanceStatus::from_str(&status_raw)
            .map_err(|e| StoreError::CorruptRow(format!("instance status: {e}")))?;

        let tunables = InstanceTunables {
            poll_interval_s: PollIntervalSecs::try_new(row.try_get::<i64, _>("poll_interval_s")? as u32)
                .map_err(|e| StoreError::CorruptRow(format!("poll_interval_s: {e}")))?,
            max_listeners: MaxListeners::try_new(row.try_get::<i64, _>("max_listeners")? as u32)
                .map_err(|e| StoreError::CorruptRow(format!("max_listeners: {e}")))?,
            listener_idle_timeout_s: ListenerIdleTimeoutSecs::try_new(
                row.try_get::<i64, _>("listener_idle_timeout_s")? as u32,
            )
            .map_err(|e| StoreError::CorruptRow(format!("listener_idle_timeout_s: {e}")))?,
            cleanup_interval_s: CleanupIntervalSecs::try_new(
                row.try_get::<i64, _>("cleanup_interval_s")? as u32,
            )
            .map_err(|e| StoreError::CorruptRow(format!("cleanup_interval_s: {e}")))?,
            health_check_interval_s: HealthCheckIntervalSecs::try_new(
                row.try_get::<i64, _>("health_check_interval_s")? as u32,
            )
            .map_err(|e| StoreError::CorruptRow(format!("health_check_interval_s: {e}")))?,
            auto_reconnect: row.try_get::<i64, _>("auto_reconnect")? != 0,
            max_retry: MaxRetry::try_new(row.try_get::<i64, _>("max_retry")? as u32)
                .map_err(|e| StoreError::CorruptRow(format!("max_retry: {e}")))?,
        };

        Ok(Instance {
            instance_id,
            name: row.try_get("name")?,
            base_url: row.try_get("base_url")?,
            api_key,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            status,
            last_active_ts: row.try_get("last_active_ts")?,
            tunables,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn upsert(&self, instance: &Instance) -> StoreResult<()> {
        let api_key_encrypted = self.master_key.encrypt_str(&instance.api_key)?;
        let now = crate::util::unix_now();
        sqlx::query(
            r"
            INSERT INTO instances (
                instance_id, name, base_url, api_key_encrypted, enabled, status,
                last_active_ts, poll_interval_s, max_listeners, listener_idle_timeout_s,
                cleanup_interval_s, health_check_interval_s, auto_reconnect, max_retry,
                last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
            ON CONFLICT(instance_id) DO UPDATE SET
                name = excluded.name,
                base_url = excluded.base_url,
                api_key_encrypted = excluded.api_key_encrypted,
                enabled = excluded.enabled,
                status = excluded.status,
                last_active_ts = excluded.last_active_ts,
                poll_interval_s = excluded.poll_interval_s,
                max_listeners = excluded.max_listeners,
                listener_idle_timeout_s = excluded.listener_idle_timeout_s,
                cleanup_interval_s = excluded.cleanup_interval_s,
                health_check_interval_s = excluded.health_check_interval_s,
                auto_reconnect = excluded.auto_reconnect,
                max_retry = excluded.max_retry,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            ",
        )
        .bind(instance.instance_id.as_ref())
        .bind(&instance.name)
        .bind(&instance.base_url)
        .bind(api_key_encrypted)
        .bind(instance.enabled)
        .bind(instance.status.to_string())
        .bind(instance.last_active_ts)
        .bind(i64::from(instance.tunables.poll_interval_s.into_inner()))
        .bind(i64::from(instance.tunables.max_listeners.into_inner()))
        .bind(i64::from(
            instance.tunables.listener_idle_timeout_s.into_inner(),
        ))
        .bind(i64::from(instance.tunables.cleanup_interval_s.into_inner()))
        .bind(i64::from(
            instance.tunables.health_check_interval_s.into_inner(),
        ))
        .bind(instance.tunables.auto_reconnect)
        .bind(i64::from(instance.tunables.max_retry.into_inner()))
        .bind(&instance.last_error)
        .bind(now)
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, id: &InstanceId) -> StoreResult<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE instance_id = ?1")
            .bind(id.as_ref())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(|r| self.row_to_instance(r)).transpose()
    }

    async fn list(&self) -> StoreResult<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY instance_id")
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(|r| self.row_to_instance(r)).collect()
    }

    async fn list_enabled(&self) -> StoreResult<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances WHERE enabled = 1 ORDER BY instance_id")
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(|r| self.row_to_instance(r)).collect()
    }

    async fn set_status(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
        last_error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE instances SET status = ?1, last_error = ?2, updated_at = ?3 WHERE instance_id = ?4",
        )
        .bind(status.to_string())
        .bind(last_error)
        .bind(crate::util::unix_now())
        .bind(id.as_ref())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn touch_last_active(&self, id: &InstanceId, ts: i64) -> StoreResult<()> {
        sqlx::query("UPDATE instances SET last_active_ts = ?1 WHERE instance_id = ?2")
            .bind(ts)
            .bind(id.as_ref())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn set_enabled(&self, id: &InstanceId, enabled: bool) -> StoreResult<()> {
        sqlx::query("UPDATE instances SET enabled = ?1, updated_at = ?2 WHERE instance_id = ?3")
            .bind(enabled)
            .bind(crate::util::unix_now())
            .bind(id.as_ref())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &InstanceId) -> StoreResult<()> {
        sqlx::query("DELETE FROM instances WHERE instance_id = ?1")
            .bind(id.as_ref())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }
}
