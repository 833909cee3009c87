//! `SQLite`-backed [`ListenerStore`].

use async_trait::async_trait;
use sqlx::Row;
use std::convert::TryFrom;

use crate::database::DatabaseConnection;
use crate::domain_types::{ChatName, InstanceId};
use crate::storage::{ListenerRow, ListenerStore, StoreError, StoreResult};

/// `SQLite` implementation of [`ListenerStore`].
pub struct SqliteListenerStore {
    connection: DatabaseConnection,
}

impl SqliteListenerStore {
    /// Builds a store over the given connection.
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn row_to_listener(row: &sqlx::sqlite::SqliteRow) -> StoreResult<ListenerRow> {
        let instance_id_raw: String = row.try_get("instance_id")?;
        let chat_name_raw: String = row.try_get("chat_name")?;
        Ok(ListenerRow {
            instance_id: InstanceId::try_from(instance_id_raw.clone())
                .map_err(|_| StoreError::CorruptRow(format!("invalid instance_id {instance_id_raw}")))?,
            chat_name: ChatName::try_from(chat_name_raw.clone())
                .map_err(|_| StoreError::CorruptRow(format!("invalid chat_name {chat_name_raw}")))?,
            added_ts: row.try_get("added_ts")?,
            last_message_ts: row.try_get("last_message_ts")?,
            marked_for_removal: row.try_get::<i64, _>("marked_for_removal")? != 0,
            manual: row.try_get::<i64, _>("manual")? != 0,
            conversation_started: row.try_get::<i64, _>("conversation_started")? != 0,
            fixed: row.try_get::<i64, _>("fixed")? != 0,
        })
    }
}

#[async_trait]
impl ListenerStore for SqliteListenerStore {
    async fn upsert(&self, listener: &ListenerRow) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO listeners (
                instance_id, chat_name, added_ts, last_message_ts, marked_for_removal,
                manual, conversation_started, fixed
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(instance_id, chat_name) DO UPDATE SET
                last_message_ts = excluded.last_message_ts,
                marked_for_removal = excluded.marked_for_removal,
                manual = excluded.manual,
                conversation_started = excluded.conversation_started,
                fixed = excluded.fixed
            ",
        )
        .bind(listener.instance_id.as_ref())
        .bind(listener.chat_name.as_ref())
        .bind(listener.added_ts)
        .bind(listener.last_message_ts)
        .bind(listener.marked_for_removal)
        .bind(listener.manual)
        .bind(listener.conversation_started)
        .bind(listener.fixed)
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn list_for_instance(&self, instance_id: &InstanceId) -> StoreResult<Vec<ListenerRow>> {
        let rows = sqlx::query("SELECT * FROM listeners WHERE instance_id = ?1")
            .bind(instance_id.as_ref())
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::row_to_listener).collect()
    }

    async fn list_all(&self) -> StoreResult<Vec<ListenerRow>> {
        let rows = sqlx::query("SELECT * FROM listeners")
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::row_to_listener).collect()
    }

    async fn touch_last_message(
        &self,
        instance_id: &InstanceId,
        chat_name: &ChatName,
        ts: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE listeners SET last_message_ts = ?1 WHERE instance_id = ?2 AND chat_name = ?3",
        )
        .bind(ts)
        .bind(instance_id.as_ref())
        .bind(chat_name.as_ref())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn mark_for_removal(
        &self,
        instance_id: &InstanceId,
        chat_name: &ChatName,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE listeners SET marked_for_removal = 1 WHERE instance_id = ?1 AND chat_name = ?2",
        )
        .bind(instance_id.as_ref())
        .bind(chat_name.as_ref())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn delete(&self, instance_id: &InstanceId, chat_name: &ChatName) -> StoreResult<()> {
        sqlx::query("DELETE FROM listeners WHERE instance_id = ?1 AND chat_name = ?2")
            .bind(instance_id.as_ref())
            .bind(chat_name.as_ref())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn count_for_instance(&self, instance_id: &InstanceId) -> StoreResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM listeners WHERE instance_id = ?1 AND marked_for_removal = 0",
        )
        .bind(instance_id.as_ref())
        .fetch_one(self.connection.pool())
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
